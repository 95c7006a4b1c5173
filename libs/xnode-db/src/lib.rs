//! Canonical store: the last applied view of nodes and users.
//!
//! Rows are only ever soft-deleted. The store is owned by the sync task and
//! mutated one entity at a time, after the engine accepted the change.

pub mod models;
pub mod plan;
pub mod repositories;

pub use plan::{Change, Plan};
pub use repositories::{NodeRepository, UserRepository};

use xnode_shared::{NodeKey, UserKey};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node {0} is not in the store")]
    UnknownNode(NodeKey),
    #[error("user {0} is not in the store")]
    UnknownUser(UserKey),
}

#[derive(Debug, Clone, Default)]
pub struct Store {
    pub nodes: NodeRepository,
    pub users: UserRepository,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }
}
