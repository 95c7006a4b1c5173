//! Assembly of one fetch batch into a consistent set of nodes and users.

use std::collections::{BTreeMap, BTreeSet};

use crate::entities::{Credential, Node, NodeKey, NodeSettings, User, UserKey};
use crate::error::DataError;

/// A validated fetch batch. Every user references a node of the same batch
/// and no two nodes share a tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub nodes: Vec<Node>,
    pub users: Vec<User>,
    /// Entities dropped while assembling, in the order they were found.
    pub rejected: Vec<DataError>,
}

impl Snapshot {
    /// Build a snapshot from freshly parsed entities.
    ///
    /// Shadowsocks nodes take port and cipher from their carrier user before
    /// anything else looks at them. Nodes left without a port, duplicate
    /// nodes or tags, orphaned and duplicate users are dropped and recorded
    /// in [`Snapshot::rejected`].
    pub fn assemble(nodes: Vec<Node>, users: Vec<User>) -> Self {
        let mut rejected = Vec::new();

        let mut keys = BTreeSet::new();
        let mut tags = BTreeSet::new();
        let mut kept: Vec<Node> = Vec::with_capacity(nodes.len());
        for node in nodes {
            if !keys.insert(node.key()) {
                rejected.push(DataError::DuplicateNode {
                    panel_name: node.panel_name,
                    node_id: node.node_id,
                });
                continue;
            }
            if !tags.insert(node.tag()) {
                rejected.push(DataError::DuplicateTag(node.tag()));
                continue;
            }
            kept.push(node);
        }

        let mut carriers: BTreeMap<NodeKey, &User> = BTreeMap::new();
        for user in users.iter().filter(|u| u.is_carrier()) {
            carriers.entry(user.node_key()).or_insert(user);
        }
        for node in kept.iter_mut() {
            if let Some(carrier) = carriers.get(&node.key()) {
                merge_carrier(node, carrier);
            }
        }

        let mut nodes = Vec::with_capacity(kept.len());
        for node in kept {
            if node.listen_port == 0 {
                rejected.push(DataError::MissingPort { tag: node.tag() });
            } else {
                nodes.push(node);
            }
        }

        let active: BTreeSet<NodeKey> = nodes.iter().map(Node::key).collect();
        let mut seen: BTreeSet<UserKey> = BTreeSet::new();
        let mut kept_users = Vec::with_capacity(users.len());
        for user in users {
            if !active.contains(&user.node_key()) {
                rejected.push(DataError::OrphanedUser {
                    panel_name: user.identity.panel_name.clone(),
                    node_id: user.identity.node_id,
                    user_id: user.user_id(),
                });
                continue;
            }
            if !seen.insert(user.key()) {
                rejected.push(DataError::DuplicateUser {
                    panel_name: user.identity.panel_name.clone(),
                    user_id: user.user_id(),
                });
                continue;
            }
            kept_users.push(user);
        }

        Snapshot {
            nodes,
            users: kept_users,
            rejected,
        }
    }

    pub fn node(&self, key: &NodeKey) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.key() == key)
    }
}

fn merge_carrier(node: &mut Node, carrier: &User) {
    let Credential::Shadowsocks {
        method,
        listen_port,
        ..
    } = &carrier.credential
    else {
        return;
    };
    match &mut node.settings {
        NodeSettings::Shadowsocks { cipher_method } | NodeSettings::ShadowsocksR { cipher_method } => {
            if *listen_port != 0 {
                node.listen_port = *listen_port;
            }
            if !method.is_empty() {
                *cipher_method = method.clone();
            }
        }
        _ => {}
    }
}
