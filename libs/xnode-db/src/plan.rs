use std::collections::BTreeMap;

/// An entity whose stored and fetched versions differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub previous: T,
    pub current: T,
}

/// Operations needed to move the stored set to a fetched set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<T> {
    pub creates: Vec<T>,
    pub updates: Vec<Change<T>>,
    pub deletes: Vec<T>,
}

impl<T> Default for Plan<T> {
    fn default() -> Self {
        Self {
            creates: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<T> Plan<T> {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

/// Keyed three-way comparison.
///
/// `stored` yields `(key, entity, is_deleted)`. Soft-deleted entries count as
/// absent: if the key comes back it is a create, and it is never deleted twice.
pub(crate) fn compute<'a, K, T, S, F>(stored: S, fetched: F, key_of: impl Fn(&T) -> K) -> Plan<T>
where
    K: Ord,
    T: Clone + PartialEq + 'a,
    S: IntoIterator<Item = (K, &'a T, bool)>,
    F: IntoIterator<Item = &'a T>,
{
    let mut live: BTreeMap<K, &T> = stored
        .into_iter()
        .filter(|(_, _, deleted)| !deleted)
        .map(|(k, t, _)| (k, t))
        .collect();

    let mut plan = Plan::default();
    for current in fetched {
        match live.remove(&key_of(current)) {
            None => plan.creates.push(current.clone()),
            Some(previous) if previous != current => plan.updates.push(Change {
                previous: previous.clone(),
                current: current.clone(),
            }),
            Some(_) => {}
        }
    }
    plan.deletes = live.into_values().cloned().collect();
    plan
}
