use std::collections::BTreeMap;

use chrono::Utc;
use tracing::debug;
use xnode_shared::{NodeKey, User, UserKey};

use crate::StoreError;
use crate::models::user::UserRecord;
use crate::plan::{self, Plan};

#[derive(Debug, Clone, Default)]
pub struct UserRepository {
    rows: BTreeMap<UserKey, UserRecord>,
}

impl UserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &UserKey) -> Option<&UserRecord> {
        self.rows.get(key)
    }

    pub fn get_all(&self) -> impl Iterator<Item = &UserRecord> {
        self.rows.values()
    }

    pub fn get_active(&self) -> impl Iterator<Item = &UserRecord> {
        self.rows.values().filter(|r| !r.is_deleted)
    }

    pub fn get_active_by_node<'a>(
        &'a self,
        node: &'a NodeKey,
    ) -> impl Iterator<Item = &'a UserRecord> + 'a {
        self.get_active().filter(move |r| &r.user.node_key() == node)
    }

    pub fn diff(&self, fetched: &[User]) -> Plan<User> {
        plan::compute(
            self.rows
                .iter()
                .map(|(k, r)| (k.clone(), &r.user, r.is_deleted)),
            fetched,
            User::key,
        )
    }

    /// Record a user as applied. Revives a soft-deleted row and keeps its
    /// traffic carry.
    pub fn upsert(&mut self, user: User) {
        let now = Utc::now();
        match self.rows.get_mut(&user.key()) {
            Some(row) => {
                if row.is_deleted {
                    debug!(key = %user.key(), "reviving soft-deleted user");
                }
                row.user = user;
                row.is_deleted = false;
                row.deleted_at = None;
                row.updated_at = now;
            }
            None => {
                self.rows.insert(user.key(), UserRecord::new(user));
            }
        }
    }

    pub fn mark_deleted(&mut self, key: &UserKey) -> Result<(), StoreError> {
        let row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownUser(key.clone()))?;
        if !row.is_deleted {
            let now = Utc::now();
            row.is_deleted = true;
            row.deleted_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }

    /// Soft delete every active user of `node`. Used when the node's inbound
    /// was rebuilt at the engine and lost its users, so the next user diff
    /// adds them back.
    pub fn mark_node_users_deleted(&mut self, node: &NodeKey) -> Vec<UserKey> {
        let now = Utc::now();
        let mut keys = Vec::new();
        for (key, row) in self.rows.iter_mut() {
            if !row.is_deleted && &row.user.node_key() == node {
                row.is_deleted = true;
                row.deleted_at = Some(now);
                row.updated_at = now;
                keys.push(key.clone());
            }
        }
        keys
    }

    /// `(upload, download)` still owed to the panel from earlier cycles.
    pub fn carry(&self, key: &UserKey) -> (u64, u64) {
        self.rows
            .get(key)
            .map(|r| (r.upload_carry, r.download_carry))
            .unwrap_or_default()
    }

    pub fn set_carry(&mut self, key: &UserKey, upload: u64, download: u64) -> Result<(), StoreError> {
        let row = self
            .rows
            .get_mut(key)
            .ok_or_else(|| StoreError::UnknownUser(key.clone()))?;
        row.upload_carry = upload;
        row.download_carry = download;
        Ok(())
    }
}
