use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xnode_shared::User;

/// Last applied state of one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user: User,
    pub is_deleted: bool,
    /// Bytes counted by the engine between the last read and the last reset.
    /// Added to the next read so nothing is lost.
    pub upload_carry: u64,
    pub download_carry: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn new(user: User) -> Self {
        let now = Utc::now();
        Self {
            user,
            is_deleted: false,
            upload_carry: 0,
            download_carry: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}
