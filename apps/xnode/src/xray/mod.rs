//! Control plane of the Xray engine.
//!
//! [`ControlPlane`] is the seam the sync loop drives. [`XrayClient`] speaks
//! gRPC to a running engine; tests use an in-memory fake.

use async_trait::async_trait;
use tracing::debug;
use xnode_shared::{Node, User};

pub mod client;
pub mod inbound;
pub mod process;
pub mod proto;

#[cfg(test)]
pub(crate) mod fake;

pub use client::XrayClient;

#[derive(Debug, thiserror::Error)]
pub enum XrayError {
    #[error("address already in use: {detail}")]
    AddressAlreadyInUse { detail: String },

    #[error("inbound {tag} already exists")]
    InboundTagAlreadyExists { tag: String },

    #[error("inbound {tag} not found")]
    InboundTagNotFound { tag: String },

    #[error("user {email} already exists")]
    EmailExists { email: String },

    #[error("user {email} not found")]
    EmailNotFound { email: String },

    #[error("cannot build {what}: {reason}")]
    Unsupported { what: String, reason: String },

    #[error("control plane transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("control plane error ({code:?}): {detail}")]
    Rpc { code: tonic::Code, detail: String },
}

impl XrayError {
    /// The engine already has what was being added.
    pub fn is_present(&self) -> bool {
        matches!(
            self,
            XrayError::InboundTagAlreadyExists { .. } | XrayError::EmailExists { .. }
        )
    }

    /// The engine already lacks what was being removed.
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            XrayError::InboundTagNotFound { .. } | XrayError::EmailNotFound { .. }
        )
    }
}

/// Which call produced an RPC failure. The engine reports failures as free
/// text, and the same words mean different things per call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Call<'a> {
    AddInbound { tag: &'a str },
    RemoveInbound { tag: &'a str },
    AddUser { tag: &'a str, email: &'a str },
    RemoveUser { tag: &'a str, email: &'a str },
    Stats,
}

pub(crate) fn classify(call: Call<'_>, status: &tonic::Status) -> XrayError {
    let detail = status.message();
    let lower = detail.to_ascii_lowercase();

    match call {
        Call::AddInbound { .. } if lower.contains("address already in use") => {
            XrayError::AddressAlreadyInUse {
                detail: detail.to_string(),
            }
        }
        Call::AddInbound { tag }
            if lower.contains("already exists") || lower.contains("existing tag found") =>
        {
            XrayError::InboundTagAlreadyExists {
                tag: tag.to_string(),
            }
        }
        Call::RemoveInbound { tag }
            if lower.contains("not found")
                || lower.contains("not enough information for making a decision") =>
        {
            XrayError::InboundTagNotFound {
                tag: tag.to_string(),
            }
        }
        Call::AddUser { email, .. } if lower.contains("already exists") => {
            XrayError::EmailExists {
                email: email.to_string(),
            }
        }
        Call::AddUser { tag, .. } | Call::RemoveUser { tag, .. }
            if lower.contains("handler not found") =>
        {
            XrayError::InboundTagNotFound {
                tag: tag.to_string(),
            }
        }
        Call::AddUser { tag, .. } if lower.contains("not found") => XrayError::InboundTagNotFound {
            tag: tag.to_string(),
        },
        Call::RemoveUser { email, .. } if lower.contains("not found") => XrayError::EmailNotFound {
            email: email.to_string(),
        },
        _ => XrayError::Rpc {
            code: status.code(),
            detail: detail.to_string(),
        },
    }
}

/// Outcome of an idempotent mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    Applied,
    AlreadyConverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Uplink => "uplink",
            Direction::Downlink => "downlink",
        }
    }
}

pub fn user_traffic_counter(email: &str, direction: Direction) -> String {
    format!("user>>>{email}>>>traffic>>>{}", direction.as_str())
}

pub fn user_online_counter(email: &str) -> String {
    format!("user>>>{email}>>>online")
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn add_inbound(&self, node: &Node) -> Result<(), XrayError>;

    async fn remove_inbound(&self, tag: &str) -> Result<(), XrayError>;

    /// Add `user` to the inbound of `node`. The node decides the account
    /// shape.
    async fn add_user(&self, node: &Node, user: &User) -> Result<(), XrayError>;

    async fn remove_user(&self, tag: &str, email: &str) -> Result<(), XrayError>;

    /// `Ok(None)` when the engine has no such counter yet.
    async fn get_stat(&self, name: &str, reset: bool) -> Result<Option<u64>, XrayError>;

    /// Source addresses currently connected as `email`.
    async fn online_ips(&self, email: &str) -> Result<Vec<String>, XrayError>;
}

fn converge(
    result: Result<(), XrayError>,
    done: impl Fn(&XrayError) -> bool,
) -> Result<Convergence, XrayError> {
    match result {
        Ok(()) => Ok(Convergence::Applied),
        Err(e) if done(&e) => {
            debug!(error = %e, "already converged");
            Ok(Convergence::AlreadyConverged)
        }
        Err(e) => Err(e),
    }
}

pub async fn ensure_inbound(cp: &dyn ControlPlane, node: &Node) -> Result<Convergence, XrayError> {
    converge(cp.add_inbound(node).await, |e| {
        matches!(e, XrayError::InboundTagAlreadyExists { .. })
    })
}

pub async fn ensure_no_inbound(cp: &dyn ControlPlane, tag: &str) -> Result<Convergence, XrayError> {
    converge(cp.remove_inbound(tag).await, |e| {
        matches!(e, XrayError::InboundTagNotFound { .. })
    })
}

/// A missing inbound is a real failure here: users need their node first.
pub async fn ensure_user(
    cp: &dyn ControlPlane,
    node: &Node,
    user: &User,
) -> Result<Convergence, XrayError> {
    converge(cp.add_user(node, user).await, |e| {
        matches!(e, XrayError::EmailExists { .. })
    })
}

/// Removing a user from a missing inbound leaves the engine without that
/// user as well, so both not-found outcomes count as converged.
pub async fn ensure_no_user(
    cp: &dyn ControlPlane,
    tag: &str,
    email: &str,
) -> Result<Convergence, XrayError> {
    converge(cp.remove_user(tag, email).await, XrayError::is_absent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::{Code, Status};

    #[test]
    fn classifies_add_inbound_failures() {
        let tag = "p-vmess-1";
        let e = classify(
            Call::AddInbound { tag },
            &Status::unknown("app/proxyman/inbound: existing tag found: p-vmess-1"),
        );
        assert!(matches!(e, XrayError::InboundTagAlreadyExists { .. }));
        assert!(e.is_present());

        let e = classify(
            Call::AddInbound { tag },
            &Status::unknown("failed to listen TCP on 443 > listen tcp 0.0.0.0:443: bind: address already in use"),
        );
        assert!(matches!(e, XrayError::AddressAlreadyInUse { .. }));
        assert!(!e.is_present() && !e.is_absent());
    }

    #[test]
    fn classifies_user_failures() {
        let call = Call::AddUser {
            tag: "t",
            email: "1@p",
        };
        assert!(matches!(
            classify(call, &Status::unknown("User 1@p already exists.")),
            XrayError::EmailExists { .. }
        ));
        assert!(matches!(
            classify(call, &Status::unknown("handler not found: t")),
            XrayError::InboundTagNotFound { .. }
        ));

        let call = Call::RemoveUser {
            tag: "t",
            email: "1@p",
        };
        assert!(matches!(
            classify(call, &Status::unknown("User 1@p not found.")),
            XrayError::EmailNotFound { .. }
        ));
        assert!(matches!(
            classify(call, &Status::unknown("handler not found: t")),
            XrayError::InboundTagNotFound { .. }
        ));
    }

    #[test]
    fn remove_inbound_not_found_and_unknown_errors() {
        let e = classify(
            Call::RemoveInbound { tag: "t" },
            &Status::unknown("not enough information for making a decision"),
        );
        assert!(e.is_absent());

        let e = classify(Call::Stats, &Status::new(Code::Unavailable, "connection refused"));
        assert!(matches!(
            e,
            XrayError::Rpc {
                code: Code::Unavailable,
                ..
            }
        ));
    }

    #[test]
    fn counter_names() {
        assert_eq!(
            user_traffic_counter("1@p", Direction::Uplink),
            "user>>>1@p>>>traffic>>>uplink"
        );
        assert_eq!(user_online_counter("1@p"), "user>>>1@p>>>online");
    }

    #[tokio::test]
    async fn removing_an_absent_inbound_is_converged() {
        let cp = fake::FakeControlPlane::default();
        assert_eq!(
            ensure_no_inbound(&cp, "missing").await.unwrap(),
            Convergence::AlreadyConverged
        );
    }
}
