pub mod descriptor;
pub mod entities;
pub mod error;
pub mod snapshot;

pub use entities::{
    Credential, Node, NodeKey, NodeSettings, OnlineIpRecord, Protocol, TrafficRecord, TrojanOptions,
    User, UserIdentity, UserKey, V2rayOptions,
};
pub use error::DataError;
pub use snapshot::Snapshot;

/// Listen address used when a panel does not say otherwise.
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
