//! Canonical nodes and users to Xray protobuf configs.

use std::net::IpAddr;
use std::path::PathBuf;

use xnode_shared::{Credential, Node, NodeSettings, TrojanOptions, User, V2rayOptions};

use super::XrayError;
use super::proto::{
    self, InboundHandlerConfig, IpOrDomain, Network, PortList, PortRange, ReceiverConfig,
    StreamConfig, TransportConfig, TypedMessage, ip_or_domain, type_name,
};

const XTLS_FLOW: &str = "xtls-rprx-vision";

/// Certificate used by TLS inbounds.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

fn unsupported(what: impl Into<String>, reason: impl Into<String>) -> XrayError {
    XrayError::Unsupported {
        what: what.into(),
        reason: reason.into(),
    }
}

/// Xray's cipher enum for a panel cipher name. Only AEAD ciphers are served.
pub fn cipher_type(method: &str) -> Option<proto::shadowsocks::CipherType> {
    use proto::shadowsocks::CipherType;

    match method.trim().to_ascii_lowercase().as_str() {
        "aes-128-gcm" => Some(CipherType::Aes128Gcm),
        "aes-256-gcm" => Some(CipherType::Aes256Gcm),
        "chacha20-poly1305" | "chacha20-ietf-poly1305" => Some(CipherType::Chacha20Poly1305),
        "xchacha20-poly1305" | "xchacha20-ietf-poly1305" => Some(CipherType::Xchacha20Poly1305),
        "none" | "plain" => Some(CipherType::None),
        _ => None,
    }
}

fn listen_address(host: &str) -> IpOrDomain {
    let address = match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip_or_domain::Address::Ip(ip.octets().to_vec()),
        Ok(IpAddr::V6(ip)) => ip_or_domain::Address::Ip(ip.octets().to_vec()),
        Err(_) => ip_or_domain::Address::Domain(host.to_string()),
    };
    IpOrDomain {
        address: Some(address),
    }
}

fn tls_settings(tag: &str, server_name: &str, tls: Option<&TlsFiles>) -> Result<TypedMessage, XrayError> {
    let files = tls.ok_or_else(|| unsupported(tag, "TLS requested but no certificate is configured"))?;
    Ok(TypedMessage::pack(
        type_name::TLS_CONFIG,
        &proto::tls::Config {
            certificate: vec![proto::tls::Certificate {
                certificate_path: files.cert_path.display().to_string(),
                key_path: files.key_path.display().to_string(),
            }],
            server_name: server_name.to_string(),
        },
    ))
}

fn v2ray_stream(tag: &str, opts: &V2rayOptions, tls: Option<&TlsFiles>) -> Result<Option<StreamConfig>, XrayError> {
    let protocol_name = match opts.transport.as_str() {
        "" | "tcp" => "tcp",
        "ws" | "websocket" => "websocket",
        "kcp" | "mkcp" => "mkcp",
        "grpc" => "grpc",
        other => return Err(unsupported(tag, format!("transport {other:?}"))),
    };

    let mut stream = StreamConfig {
        protocol_name: protocol_name.to_string(),
        ..Default::default()
    };

    if protocol_name == "websocket" {
        stream.transport_settings.push(TransportConfig {
            protocol_name: protocol_name.to_string(),
            settings: Some(TypedMessage::pack(
                type_name::WEBSOCKET_CONFIG,
                &proto::websocket::Config {
                    host: opts.host.clone(),
                    path: opts.path.clone(),
                    header: Default::default(),
                },
            )),
        });
    }

    if opts.enable_tls {
        stream.security_type = type_name::TLS_CONFIG.to_string();
        stream.security_settings.push(tls_settings(tag, &opts.host, tls)?);
    }

    if protocol_name == "tcp" && stream.security_type.is_empty() {
        return Ok(None);
    }
    Ok(Some(stream))
}

fn trojan_stream(tag: &str, opts: &TrojanOptions, tls: Option<&TlsFiles>) -> Result<Option<StreamConfig>, XrayError> {
    if tls.is_none() && !opts.enable_xtls {
        return Ok(None);
    }
    Ok(Some(StreamConfig {
        protocol_name: "tcp".to_string(),
        security_type: type_name::TLS_CONFIG.to_string(),
        security_settings: vec![tls_settings(tag, &opts.host, tls)?],
        ..Default::default()
    }))
}

/// Listener for `node` with no users. Users are added one at a time.
pub fn build_inbound(node: &Node, tls: Option<&TlsFiles>) -> Result<InboundHandlerConfig, XrayError> {
    let tag = node.tag();

    let (proxy, stream) = match &node.settings {
        NodeSettings::Shadowsocks { cipher_method } => {
            if !cipher_method.is_empty() && cipher_type(cipher_method).is_none() {
                return Err(unsupported(&tag, format!("cipher {cipher_method:?}")));
            }
            let config = proto::shadowsocks::ServerConfig {
                users: Vec::new(),
                network: vec![Network::Tcp as i32, Network::Udp as i32],
            };
            (TypedMessage::pack(type_name::SHADOWSOCKS_SERVER, &config), None)
        }
        NodeSettings::ShadowsocksR { .. } => {
            return Err(unsupported(&tag, "shadowsocksr is not served by xray"));
        }
        NodeSettings::VMess(opts) => (
            TypedMessage::pack(type_name::VMESS_INBOUND, &proto::vmess::InboundConfig::default()),
            v2ray_stream(&tag, opts, tls)?,
        ),
        NodeSettings::VLess(opts) => (
            TypedMessage::pack(type_name::VLESS_INBOUND, &vless_inbound()),
            v2ray_stream(&tag, opts, tls)?,
        ),
        NodeSettings::Trojan(opts) => {
            let proxy = if opts.enable_vless {
                TypedMessage::pack(type_name::VLESS_INBOUND, &vless_inbound())
            } else {
                TypedMessage::pack(type_name::TROJAN_SERVER, &proto::trojan::ServerConfig::default())
            };
            (proxy, trojan_stream(&tag, opts, tls)?)
        }
    };

    let port = u32::from(node.listen_port);
    let receiver = ReceiverConfig {
        port_list: Some(PortList {
            range: vec![PortRange { from: port, to: port }],
        }),
        listen: Some(listen_address(&node.listen_host)),
        stream_settings: stream,
        receive_original_destination: false,
    };

    Ok(InboundHandlerConfig {
        tag,
        receiver_settings: Some(TypedMessage::pack(type_name::RECEIVER_CONFIG, &receiver)),
        proxy_settings: Some(proxy),
    })
}

fn vless_inbound() -> proto::vless::InboundConfig {
    proto::vless::InboundConfig {
        clients: Vec::new(),
        decryption: "none".to_string(),
    }
}

fn vless_account(id: &str, flow: &str) -> TypedMessage {
    TypedMessage::pack(
        type_name::VLESS_ACCOUNT,
        &proto::vless::Account {
            id: id.to_string(),
            flow: flow.to_string(),
            encryption: "none".to_string(),
        },
    )
}

/// Engine-side user for `user` on `node`. The account shape follows the
/// node: a Trojan node in VLESS mode takes VLESS accounts.
pub fn build_user(node: &Node, user: &User) -> Result<proto::User, XrayError> {
    let account = match (&node.settings, &user.credential) {
        (
            NodeSettings::Shadowsocks { cipher_method },
            Credential::Shadowsocks {
                password, method, ..
            },
        ) => {
            let name = if cipher_method.is_empty() {
                method
            } else {
                cipher_method
            };
            let cipher = cipher_type(name)
                .ok_or_else(|| unsupported(user.email(), format!("cipher {name:?}")))?;
            TypedMessage::pack(
                type_name::SHADOWSOCKS_ACCOUNT,
                &proto::shadowsocks::Account {
                    password: password.clone(),
                    cipher_type: cipher as i32,
                    iv_check: false,
                },
            )
        }
        (NodeSettings::VMess(_), Credential::VMess { uuid }) => TypedMessage::pack(
            type_name::VMESS_ACCOUNT,
            &proto::vmess::Account { id: uuid.clone() },
        ),
        (NodeSettings::VLess(_), Credential::VLess { uuid } | Credential::VMess { uuid }) => {
            vless_account(uuid, "")
        }
        (NodeSettings::Trojan(opts), Credential::Trojan { uuid }) if opts.enable_vless => {
            vless_account(uuid, if opts.enable_xtls { XTLS_FLOW } else { "" })
        }
        (NodeSettings::Trojan(_), Credential::Trojan { uuid }) => TypedMessage::pack(
            type_name::TROJAN_ACCOUNT,
            &proto::trojan::Account {
                password: uuid.clone(),
            },
        ),
        (settings, _) => {
            return Err(unsupported(
                user.email(),
                format!("credential does not fit a {} node", settings.protocol()),
            ));
        }
    };

    Ok(proto::User {
        level: 0,
        email: user.email().to_string(),
        account: Some(account),
    })
}
