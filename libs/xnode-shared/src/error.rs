/// Malformed or unsupported panel data. Always scoped to a single entity:
/// the entity is dropped from the batch and the rest of the batch survives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataError {
    #[error("malformed descriptor {raw:?}: expected at least {expected} segment(s), got {got}")]
    MalformedDescriptor {
        raw: String,
        expected: usize,
        got: usize,
    },

    #[error("invalid {field} value {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("unsupported node type: {0}")]
    UnsupportedNode(String),

    #[error("user record is missing `{field}`: {raw}")]
    MissingField { field: &'static str, raw: String },

    #[error("node {tag} has no usable listen port")]
    MissingPort { tag: String },

    #[error("user {user_id} references node {panel_name}/{node_id} which is not in this batch")]
    OrphanedUser {
        panel_name: String,
        node_id: i64,
        user_id: i64,
    },

    #[error("inbound tag {0} is produced by more than one node")]
    DuplicateTag(String),

    #[error("node {panel_name}/{node_id} appears more than once")]
    DuplicateNode { panel_name: String, node_id: i64 },

    #[error("user {panel_name}/{user_id} appears more than once")]
    DuplicateUser { panel_name: String, user_id: i64 },
}
