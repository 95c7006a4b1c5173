use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Shadowsocks,
    #[serde(rename = "shadowsocksr")]
    ShadowsocksR,
    #[serde(rename = "vmess")]
    VMess,
    #[serde(rename = "vless")]
    VLess,
    Trojan,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::ShadowsocksR => "shadowsocksr",
            Protocol::VMess => "vmess",
            Protocol::VLess => "vless",
            Protocol::Trojan => "trojan",
        }
    }

    pub fn is_shadowsocks(&self) -> bool {
        matches!(self, Protocol::Shadowsocks | Protocol::ShadowsocksR)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks),
            "shadowsocksr" | "ssr" => Ok(Protocol::ShadowsocksR),
            "vmess" | "v2ray" => Ok(Protocol::VMess),
            "vless" => Ok(Protocol::VLess),
            "trojan" => Ok(Protocol::Trojan),
            other => Err(DataError::UnsupportedNode(other.to_string())),
        }
    }
}

/// Identity of a node across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub panel_name: String,
    pub node_id: i64,
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.panel_name, self.node_id)
    }
}

/// Identity of a user across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey {
    pub panel_name: String,
    pub user_id: i64,
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.panel_name, self.user_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct V2rayOptions {
    pub alter_id: u32,
    pub transport: String,
    pub enable_tls: bool,
    pub tls_type: String,
    pub path: String,
    pub host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanOptions {
    pub host: String,
    pub enable_xtls: bool,
    pub enable_vless: bool,
}

/// Protocol specific part of a node. Only the fields that matter for the
/// protocol are carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum NodeSettings {
    Shadowsocks {
        cipher_method: String,
    },
    #[serde(rename = "shadowsocksr")]
    ShadowsocksR {
        cipher_method: String,
    },
    #[serde(rename = "vmess")]
    VMess(V2rayOptions),
    #[serde(rename = "vless")]
    VLess(V2rayOptions),
    Trojan(TrojanOptions),
}

impl NodeSettings {
    pub fn protocol(&self) -> Protocol {
        match self {
            NodeSettings::Shadowsocks { .. } => Protocol::Shadowsocks,
            NodeSettings::ShadowsocksR { .. } => Protocol::ShadowsocksR,
            NodeSettings::VMess(_) => Protocol::VMess,
            NodeSettings::VLess(_) => Protocol::VLess,
            NodeSettings::Trojan(_) => Protocol::Trojan,
        }
    }
}

/// One proxy listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub panel_name: String,
    pub node_id: i64,
    pub listen_host: String,
    pub listen_port: u16,
    pub settings: NodeSettings,
}

impl Node {
    pub fn protocol(&self) -> Protocol {
        self.settings.protocol()
    }

    pub fn key(&self) -> NodeKey {
        NodeKey {
            panel_name: self.panel_name.clone(),
            node_id: self.node_id,
        }
    }

    /// Stable control-plane identifier. Derived only from the origin panel,
    /// protocol and panel-local id so it never drifts between cycles.
    pub fn tag(&self) -> String {
        inbound_tag(&self.panel_name, self.protocol(), self.node_id)
    }

    pub fn cipher_method(&self) -> Option<&str> {
        match &self.settings {
            NodeSettings::Shadowsocks { cipher_method }
            | NodeSettings::ShadowsocksR { cipher_method } => Some(cipher_method),
            _ => None,
        }
    }
}

pub fn inbound_tag(panel_name: &str, protocol: Protocol, node_id: i64) -> String {
    format!("{panel_name}-{protocol}-{node_id}")
}

/// Email used to identify a user at the engine when the panel has none.
pub fn default_email(user_id: i64, panel_name: &str) -> String {
    format!("{user_id}@{panel_name}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub panel_name: String,
    pub node_id: i64,
    pub user_id: i64,
    pub email: String,
    pub speed_limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Credential {
    Shadowsocks {
        password: String,
        method: String,
        is_multi_user: bool,
        listen_port: u16,
    },
    #[serde(rename = "vmess")]
    VMess { uuid: String },
    #[serde(rename = "vless")]
    VLess { uuid: String },
    Trojan { uuid: String },
}

/// One credentialed principal bound to exactly one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub identity: UserIdentity,
    pub credential: Credential,
}

impl User {
    pub fn key(&self) -> UserKey {
        UserKey {
            panel_name: self.identity.panel_name.clone(),
            user_id: self.identity.user_id,
        }
    }

    pub fn node_key(&self) -> NodeKey {
        NodeKey {
            panel_name: self.identity.panel_name.clone(),
            node_id: self.identity.node_id,
        }
    }

    pub fn user_id(&self) -> i64 {
        self.identity.user_id
    }

    pub fn email(&self) -> &str {
        &self.identity.email
    }

    /// Whether this user carries the listener settings of a single-port
    /// Shadowsocks node.
    pub fn is_carrier(&self) -> bool {
        matches!(
            self.credential,
            Credential::Shadowsocks {
                is_multi_user: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub user_id: i64,
    pub upload: u64,
    pub download: u64,
}

impl TrafficRecord {
    pub fn is_empty(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineIpRecord {
    pub user_id: i64,
    pub ips: Vec<String>,
}
