use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;
use xnode_shared::{Node, NodeKey};

use crate::StoreError;
use crate::models::node::NodeRecord;
use crate::plan::{self, Plan};

#[derive(Debug, Clone, Default)]
pub struct NodeRepository {
    rows: BTreeMap<NodeKey, NodeRecord>,
}

impl NodeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &NodeKey) -> Option<&NodeRecord> {
        self.rows.get(key)
    }

    pub fn get_all(&self) -> impl Iterator<Item = &NodeRecord> {
        self.rows.values()
    }

    pub fn get_active(&self) -> impl Iterator<Item = &Node> {
        self.rows
            .values()
            .filter(|r| !r.is_deleted)
            .map(|r| &r.node)
    }

    pub fn is_active(&self, key: &NodeKey) -> bool {
        self.rows.get(key).is_some_and(|r| !r.is_deleted)
    }

    /// Operations that turn the active set into `fetched`.
    pub fn diff(&self, fetched: &[Node]) -> Plan<Node> {
        plan::compute(
            self.rows
                .iter()
                .map(|(k, r)| (k.clone(), &r.node, r.is_deleted)),
            fetched,
            Node::key,
        )
    }

    /// Record a node as applied. Revives a soft-deleted row.
    pub fn upsert(&mut self, node: Node) {
        let now = Utc::now();
        match self.rows.get_mut(&node.key()) {
            Some(row) => {
                if row.is_deleted {
                    debug!(key = %node.key(), "reviving soft-deleted node");
                }
                row.node = node;
                row.is_deleted = false;
                row.deleted_at = None;
                row.updated_at = now;
            }
            None => {
                self.rows.insert(node.key(), NodeRecord::new(node));
            }
        }
    }

    /// Soft delete. Deleting an already deleted row is a no-op.
    pub fn mark_deleted(&mut self, key: &NodeKey) -> Result<(), StoreError> {
        let row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownNode(key.clone()))?;
        if !row.is_deleted {
            let now = Utc::now();
            row.is_deleted = true;
            row.deleted_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }
}
