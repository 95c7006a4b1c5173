//! Nodes and users declared in the configuration file.

use tracing::warn;
use xnode_shared::entities::default_email;
use xnode_shared::{
    Credential, DataError, Node, NodeSettings, Protocol, TrojanOptions, User, UserIdentity,
    V2rayOptions,
};

use crate::config::{LocalConfig, LocalNode, LocalUser};

/// Panel name stamped on locally declared entities.
pub const LOCAL_PANEL: &str = "local";

/// A static catalog converted once at startup. Every cycle replays it through
/// the same diff and apply steps as a remote fetch.
#[derive(Debug, Clone, Default)]
pub struct LocalCatalog {
    pub nodes: Vec<Node>,
    pub users: Vec<User>,
    pub rejected: Vec<DataError>,
}

impl LocalCatalog {
    pub fn from_config(config: &LocalConfig) -> Self {
        let mut catalog = LocalCatalog::default();

        for entry in &config.nodes {
            match local_node(entry) {
                Ok(node) => catalog.nodes.push(node),
                Err(e) => catalog.rejected.push(e),
            }
        }

        for entry in &config.users {
            let protocol = catalog
                .nodes
                .iter()
                .find(|n| n.node_id == entry.node_id)
                .map(Node::protocol);
            let result = match protocol {
                Some(protocol) => local_user(entry, protocol),
                None => Err(DataError::OrphanedUser {
                    panel_name: LOCAL_PANEL.to_string(),
                    node_id: entry.node_id,
                    user_id: entry.user_id,
                }),
            };
            match result {
                Ok(user) => catalog.users.push(user),
                Err(e) => catalog.rejected.push(e),
            }
        }

        for e in &catalog.rejected {
            warn!(error = %e, "⚠️ Ignoring local entry");
        }
        catalog
    }
}

fn local_node(entry: &LocalNode) -> Result<Node, DataError> {
    let protocol: Protocol = entry.protocol.parse()?;
    let v2ray = || V2rayOptions {
        alter_id: entry.alter_id,
        transport: if entry.transport.is_empty() {
            "tcp".to_string()
        } else {
            entry.transport.clone()
        },
        enable_tls: entry.enable_tls,
        tls_type: entry.tls_type.clone(),
        path: entry.path.clone(),
        host: entry.host.clone(),
    };

    let settings = match protocol {
        Protocol::Shadowsocks => NodeSettings::Shadowsocks {
            cipher_method: entry.cipher_method.clone(),
        },
        Protocol::ShadowsocksR => NodeSettings::ShadowsocksR {
            cipher_method: entry.cipher_method.clone(),
        },
        Protocol::VMess if entry.enable_vless => NodeSettings::VLess(v2ray()),
        Protocol::VMess => NodeSettings::VMess(v2ray()),
        Protocol::VLess => NodeSettings::VLess(v2ray()),
        Protocol::Trojan => NodeSettings::Trojan(TrojanOptions {
            host: entry.host.clone(),
            enable_xtls: entry.enable_xtls,
            enable_vless: entry.enable_vless,
        }),
    };

    Ok(Node {
        panel_name: LOCAL_PANEL.to_string(),
        node_id: entry.node_id,
        listen_host: entry.listen_host.clone(),
        listen_port: entry.listen_port,
        settings,
    })
}

fn local_user(entry: &LocalUser, protocol: Protocol) -> Result<User, DataError> {
    let missing = |field| DataError::MissingField {
        field,
        raw: format!("local user {}", entry.user_id),
    };
    let uuid = || entry.uuid.clone().ok_or_else(|| missing("uuid"));

    let credential = match protocol {
        Protocol::Shadowsocks | Protocol::ShadowsocksR => Credential::Shadowsocks {
            password: entry.password.clone().ok_or_else(|| missing("password"))?,
            method: entry.method.clone().unwrap_or_default(),
            is_multi_user: false,
            listen_port: 0,
        },
        Protocol::VMess => Credential::VMess { uuid: uuid()? },
        Protocol::VLess => Credential::VLess { uuid: uuid()? },
        Protocol::Trojan => Credential::Trojan {
            uuid: entry
                .uuid
                .clone()
                .or_else(|| entry.password.clone())
                .ok_or_else(|| missing("uuid"))?,
        },
    };

    Ok(User {
        identity: UserIdentity {
            panel_name: LOCAL_PANEL.to_string(),
            node_id: entry.node_id,
            user_id: entry.user_id,
            email: entry
                .email
                .clone()
                .unwrap_or_else(|| default_email(entry.user_id, LOCAL_PANEL)),
            speed_limit: entry.speed_limit,
        },
        credential,
    })
}
