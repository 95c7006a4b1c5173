use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xnode_shared::Node;

/// Last applied state of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node: Node,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    pub fn new(node: Node) -> Self {
        let now = Utc::now();
        Self {
            node,
            is_deleted: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
