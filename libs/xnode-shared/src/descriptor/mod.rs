//! Panel descriptor parsers.
//!
//! Pure functions turning the loosely typed node/user encodings that panels
//! hand out into canonical [`Node`] / [`User`] values. Nothing in here does
//! I/O.
//!
//! Segment-encoded node strings are semicolon-major and pipe-minor:
//!
//! ```text
//! shadowsocks / trojan:  host;port=<connPort>#<listenPort>|host=...
//! vmess / vless:         host;port;alterId;transport;tls;key=value|key=value
//! ```

mod structured;
mod users;

pub use structured::{
    parse_structured_shadowsocks, parse_structured_trojan, parse_structured_vmess, read_bool,
    read_str, read_u64,
};
pub use users::{parse_sspanel_user, parse_v2board_user};

use crate::entities::{Node, NodeSettings, Protocol, TrojanOptions, V2rayOptions, inbound_tag};
use crate::error::DataError;
use crate::DEFAULT_LISTEN_HOST;

/// Where a descriptor came from. Every parsed entity is stamped with it.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    pub panel_name: &'a str,
    pub node_id: i64,
}

/// Recognised `key=value` extras of a segment descriptor.
#[derive(Debug, Default, PartialEq, Eq)]
struct Extras {
    path: Option<String>,
    host: Option<String>,
    enable_vless: bool,
    enable_xtls: bool,
    inside_port: Option<u16>,
    /// Listen half of `port=<conn>#<listen>`.
    port: Option<u16>,
}

impl Extras {
    fn parse(raw: &str) -> Result<Self, DataError> {
        let mut extras = Extras::default();
        for item in raw.split('|') {
            let (key, value) = item.split_once('=').unwrap_or((item, ""));
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();
            match key {
                "path" => extras.path = Some(value.to_string()),
                "host" => extras.host = Some(value.to_string()),
                "enable_vless" => extras.enable_vless = value == "true",
                "enable_xtls" => extras.enable_xtls = value == "true",
                "inside_port" => extras.inside_port = Some(parse_port("inside_port", value)?),
                "port" => {
                    // Connection port is what clients dial; only the listen half matters here.
                    let listen = value.split_once('#').map(|(_, l)| l).unwrap_or(value);
                    extras.port = Some(parse_port("port", listen)?);
                }
                _ => {}
            }
        }
        Ok(extras)
    }

    fn listen_port(&self) -> Option<u16> {
        self.inside_port.or(self.port)
    }
}

fn parse_port(field: &'static str, value: &str) -> Result<u16, DataError> {
    value.trim().parse::<u16>().map_err(|_| DataError::InvalidField {
        field,
        value: value.to_string(),
    })
}

fn segments(raw: &str, expected: usize) -> Result<Vec<&str>, DataError> {
    let parts: Vec<&str> = raw.trim().split(';').collect();
    let got = if parts.first().is_some_and(|host| !host.trim().is_empty()) {
        parts.len()
    } else {
        0
    };
    if got < expected {
        return Err(DataError::MalformedDescriptor {
            raw: raw.to_string(),
            expected,
            got,
        });
    }
    Ok(parts)
}

/// `host[;port=<conn>#<listen>]`.
///
/// The port segment is optional: single-port multi-user nodes get their
/// listener from the carrier user, so a bare host is accepted and leaves
/// the port at zero until the batch is assembled.
pub fn parse_ss(origin: Origin<'_>, raw: &str) -> Result<Node, DataError> {
    let parts = segments(raw, 1)?;
    let extras = match parts.get(1) {
        Some(seg) => Extras::parse(seg)?,
        None => Extras::default(),
    };

    Ok(Node {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        listen_host: DEFAULT_LISTEN_HOST.to_string(),
        listen_port: extras.listen_port().unwrap_or(0),
        settings: NodeSettings::Shadowsocks {
            cipher_method: String::new(),
        },
    })
}

/// `host;port;alterId;transport;tls[;extras]`. `enable_vless=true` turns the
/// result into a VLess node with the same shape.
pub fn parse_vmess(origin: Origin<'_>, raw: &str) -> Result<Node, DataError> {
    let parts = segments(raw, 5)?;
    let extras = match parts.get(5) {
        Some(seg) => Extras::parse(seg)?,
        None => Extras::default(),
    };

    let listen_port = match extras.listen_port() {
        Some(port) => port,
        None => parse_port("port", parts[1])?,
    };

    let alter_id = match parts[2].trim() {
        "" => 0,
        v => v.parse::<u32>().map_err(|_| DataError::InvalidField {
            field: "alter_id",
            value: v.to_string(),
        })?,
    };

    let transport = match parts[3].trim() {
        "" => "tcp".to_string(),
        t => t.to_string(),
    };
    let tls_type = parts[4].trim().to_string();

    let options = V2rayOptions {
        alter_id,
        transport,
        enable_tls: !tls_type.is_empty(),
        tls_type,
        path: extras.path.clone().unwrap_or_default(),
        host: extras.host.clone().unwrap_or_default(),
    };

    Ok(Node {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        listen_host: DEFAULT_LISTEN_HOST.to_string(),
        listen_port,
        settings: if extras.enable_vless {
            NodeSettings::VLess(options)
        } else {
            NodeSettings::VMess(options)
        },
    })
}

/// `host;port=<conn>#<listen>|host=<sni>[|enable_xtls=true][|enable_vless=true]`.
pub fn parse_trojan(origin: Origin<'_>, raw: &str) -> Result<Node, DataError> {
    let parts = segments(raw, 2)?;
    let extras = Extras::parse(parts[1])?;

    let listen_port = extras.listen_port().ok_or_else(|| DataError::MissingPort {
        tag: inbound_tag(origin.panel_name, Protocol::Trojan, origin.node_id),
    })?;

    Ok(Node {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        listen_host: DEFAULT_LISTEN_HOST.to_string(),
        listen_port,
        settings: NodeSettings::Trojan(TrojanOptions {
            host: extras.host.unwrap_or_default(),
            enable_xtls: extras.enable_xtls,
            enable_vless: extras.enable_vless,
        }),
    })
}

/// SSPanel `sort` codes.
pub fn protocol_for_sort(sort: i64) -> Result<Protocol, DataError> {
    match sort {
        0 | 10 => Ok(Protocol::Shadowsocks),
        11 | 12 => Ok(Protocol::VMess),
        14 => Ok(Protocol::Trojan),
        other => Err(DataError::UnsupportedNode(format!("sort {other}"))),
    }
}

/// Dispatch an SSPanel `{sort, server}` pair to the matching grammar.
pub fn parse_sspanel_node(origin: Origin<'_>, sort: i64, server: &str) -> Result<Node, DataError> {
    match protocol_for_sort(sort)? {
        Protocol::Shadowsocks => parse_ss(origin, server),
        Protocol::VMess => parse_vmess(origin, server),
        Protocol::Trojan => parse_trojan(origin, server),
        other => Err(DataError::UnsupportedNode(other.to_string())),
    }
}
