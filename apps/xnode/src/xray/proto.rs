//! Protobuf messages of the Xray control plane.
//!
//! Only the subset this daemon sends or reads is declared. Field numbers
//! follow `app/proxyman/command`, `app/stats/command`, `common/*`,
//! `proxy/*` and `transport/internet/*` of Xray-core.

use std::collections::HashMap;

/// `xray.common.serial.TypedMessage`
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypedMessage {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

impl TypedMessage {
    pub fn pack<M: ::prost::Message>(type_name: &str, message: &M) -> Self {
        Self {
            r#type: type_name.to_string(),
            value: message.encode_to_vec(),
        }
    }
}

// ---- xray.common.net ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortRange {
    #[prost(uint32, tag = "1")]
    pub from: u32,
    #[prost(uint32, tag = "2")]
    pub to: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortList {
    #[prost(message, repeated, tag = "1")]
    pub range: Vec<PortRange>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IpOrDomain {
    #[prost(oneof = "ip_or_domain::Address", tags = "1, 2")]
    pub address: Option<ip_or_domain::Address>,
}

pub mod ip_or_domain {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Address {
        #[prost(bytes, tag = "1")]
        Ip(Vec<u8>),
        #[prost(string, tag = "2")]
        Domain(String),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Network {
    Unknown = 0,
    RawTcp = 1,
    Tcp = 2,
    Udp = 3,
    Unix = 4,
}

// ---- xray.common.protocol ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(uint32, tag = "1")]
    pub level: u32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(message, optional, tag = "3")]
    pub account: Option<TypedMessage>,
}

// ---- xray.app.proxyman ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReceiverConfig {
    #[prost(message, optional, tag = "1")]
    pub port_list: Option<PortList>,
    #[prost(message, optional, tag = "2")]
    pub listen: Option<IpOrDomain>,
    #[prost(message, optional, tag = "4")]
    pub stream_settings: Option<StreamConfig>,
    #[prost(bool, tag = "5")]
    pub receive_original_destination: bool,
}

// ---- xray.core ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InboundHandlerConfig {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub receiver_settings: Option<TypedMessage>,
    #[prost(message, optional, tag = "3")]
    pub proxy_settings: Option<TypedMessage>,
}

// ---- xray.app.proxyman.command ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddInboundRequest {
    #[prost(message, optional, tag = "1")]
    pub inbound: Option<InboundHandlerConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddInboundResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveInboundResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlterInboundRequest {
    #[prost(string, tag = "1")]
    pub tag: String,
    #[prost(message, optional, tag = "2")]
    pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlterInboundResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddUserOperation {
    #[prost(message, optional, tag = "1")]
    pub user: Option<User>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveUserOperation {
    #[prost(string, tag = "1")]
    pub email: String,
}

// ---- xray.app.stats.command ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatsRequest {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bool, tag = "2")]
    pub reset: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stat {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub value: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatsResponse {
    #[prost(message, optional, tag = "1")]
    pub stat: Option<Stat>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetStatsOnlineIpListResponse {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, int64", tag = "2")]
    pub ips: HashMap<String, i64>,
}

// ---- proxy accounts and server configs ----

pub mod vmess {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Account {
        #[prost(string, tag = "1")]
        pub id: String,
    }

    /// `xray.proxy.vmess.inbound.Config`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InboundConfig {
        #[prost(message, repeated, tag = "1")]
        pub user: Vec<super::User>,
    }
}

pub mod vless {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Account {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub flow: String,
        #[prost(string, tag = "3")]
        pub encryption: String,
    }

    /// `xray.proxy.vless.inbound.Config`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct InboundConfig {
        #[prost(message, repeated, tag = "1")]
        pub clients: Vec<super::User>,
        #[prost(string, tag = "3")]
        pub decryption: String,
    }
}

pub mod trojan {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Account {
        #[prost(string, tag = "1")]
        pub password: String,
    }

    /// `xray.proxy.trojan.ServerConfig`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerConfig {
        #[prost(message, repeated, tag = "1")]
        pub users: Vec<super::User>,
    }
}

pub mod shadowsocks {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum CipherType {
        Unknown = 0,
        Aes128Gcm = 5,
        Aes256Gcm = 6,
        Chacha20Poly1305 = 7,
        Xchacha20Poly1305 = 8,
        None = 9,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Account {
        #[prost(string, tag = "1")]
        pub password: String,
        #[prost(enumeration = "CipherType", tag = "2")]
        pub cipher_type: i32,
        #[prost(bool, tag = "3")]
        pub iv_check: bool,
    }

    /// `xray.proxy.shadowsocks.ServerConfig`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ServerConfig {
        #[prost(message, repeated, tag = "1")]
        pub users: Vec<super::User>,
        #[prost(enumeration = "super::Network", repeated, tag = "2")]
        pub network: Vec<i32>,
    }
}

// ---- xray.transport.internet ----

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TransportConfig {
    #[prost(message, optional, tag = "2")]
    pub settings: Option<TypedMessage>,
    #[prost(string, tag = "3")]
    pub protocol_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamConfig {
    #[prost(message, repeated, tag = "2")]
    pub transport_settings: Vec<TransportConfig>,
    #[prost(string, tag = "3")]
    pub security_type: String,
    #[prost(message, repeated, tag = "4")]
    pub security_settings: Vec<TypedMessage>,
    #[prost(string, tag = "5")]
    pub protocol_name: String,
}

pub mod websocket {
    use std::collections::HashMap;

    /// `xray.transport.internet.websocket.Config`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Config {
        #[prost(string, tag = "1")]
        pub host: String,
        #[prost(string, tag = "2")]
        pub path: String,
        #[prost(map = "string, string", tag = "3")]
        pub header: HashMap<String, String>,
    }
}

pub mod tls {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Certificate {
        #[prost(string, tag = "5")]
        pub certificate_path: String,
        #[prost(string, tag = "6")]
        pub key_path: String,
    }

    /// `xray.transport.internet.tls.Config`
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Config {
        #[prost(message, repeated, tag = "2")]
        pub certificate: Vec<Certificate>,
        #[prost(string, tag = "3")]
        pub server_name: String,
    }
}

/// Fully qualified protobuf type names used inside [`TypedMessage`].
pub mod type_name {
    pub const RECEIVER_CONFIG: &str = "xray.app.proxyman.ReceiverConfig";
    pub const ADD_USER_OPERATION: &str = "xray.app.proxyman.command.AddUserOperation";
    pub const REMOVE_USER_OPERATION: &str = "xray.app.proxyman.command.RemoveUserOperation";
    pub const VMESS_ACCOUNT: &str = "xray.proxy.vmess.Account";
    pub const VMESS_INBOUND: &str = "xray.proxy.vmess.inbound.Config";
    pub const VLESS_ACCOUNT: &str = "xray.proxy.vless.Account";
    pub const VLESS_INBOUND: &str = "xray.proxy.vless.inbound.Config";
    pub const TROJAN_ACCOUNT: &str = "xray.proxy.trojan.Account";
    pub const TROJAN_SERVER: &str = "xray.proxy.trojan.ServerConfig";
    pub const SHADOWSOCKS_ACCOUNT: &str = "xray.proxy.shadowsocks.Account";
    pub const SHADOWSOCKS_SERVER: &str = "xray.proxy.shadowsocks.ServerConfig";
    pub const WEBSOCKET_CONFIG: &str = "xray.transport.internet.websocket.Config";
    pub const TLS_CONFIG: &str = "xray.transport.internet.tls.Config";
}
