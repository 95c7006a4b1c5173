//! Defensive readers for structured (JSON) panel payloads.
//!
//! Panels return nested config objects where any level may be missing,
//! `null`, or carry the wrong JSON type. Every reader falls back to an
//! empty / zero value instead of failing.

use serde_json::Value;

use super::Origin;
use crate::DEFAULT_LISTEN_HOST;
use crate::entities::{Node, NodeSettings, TrojanOptions, V2rayOptions};
use crate::error::DataError;

fn walk<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, key| cur.get(key))
}

/// String at `path`, or `""`. Numbers are rendered so `"443"` and `443`
/// read the same.
pub fn read_str(value: &Value, path: &[&str]) -> String {
    match walk(value, path) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Unsigned integer at `path`, or `0`. Numeric strings are accepted.
pub fn read_u64(value: &Value, path: &[&str]) -> u64 {
    match walk(value, path) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Boolean at `path`. Panels also send `1`/`0` and `"true"`/`"1"`.
pub fn read_bool(value: &Value, path: &[&str]) -> bool {
    match walk(value, path) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1"),
        _ => false,
    }
}

fn read_port(value: &Value, path: &[&str]) -> Result<u16, DataError> {
    let raw = read_u64(value, path);
    u16::try_from(raw).map_err(|_| DataError::InvalidField {
        field: "port",
        value: raw.to_string(),
    })
}

/// `{inbound: {port, streamSettings: {network, security, wsSettings: {path, headers: {Host}}}}}`.
pub fn parse_structured_vmess(
    origin: Origin<'_>,
    raw: &Value,
    enable_vless: bool,
) -> Result<Node, DataError> {
    let listen_port = read_port(raw, &["inbound", "port"])?;

    let stream = walk(raw, &["inbound", "streamSettings"]).unwrap_or(&Value::Null);
    let transport = match read_str(stream, &["network"]) {
        t if t.is_empty() => "tcp".to_string(),
        t => t,
    };
    let enable_tls = read_str(stream, &["security"]) == "tls";

    let (path, host) = if transport == "ws" {
        (
            read_str(stream, &["wsSettings", "path"]),
            read_str(stream, &["wsSettings", "headers", "Host"]),
        )
    } else {
        (String::new(), String::new())
    };

    let options = V2rayOptions {
        alter_id: 0,
        transport,
        enable_tls,
        tls_type: if enable_tls { "tls".to_string() } else { String::new() },
        path,
        host,
    };

    Ok(Node {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        listen_host: DEFAULT_LISTEN_HOST.to_string(),
        listen_port,
        settings: if enable_vless {
            NodeSettings::VLess(options)
        } else {
            NodeSettings::VMess(options)
        },
    })
}

/// `{local_port, ssl: {sni}}`.
pub fn parse_structured_trojan(origin: Origin<'_>, raw: &Value) -> Result<Node, DataError> {
    Ok(Node {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        listen_host: DEFAULT_LISTEN_HOST.to_string(),
        listen_port: read_port(raw, &["local_port"])?,
        settings: NodeSettings::Trojan(TrojanOptions {
            host: read_str(raw, &["ssl", "sni"]),
            enable_xtls: false,
            enable_vless: false,
        }),
    })
}

/// Shadowsocks nodes have no config payload; port and cipher arrive with the
/// carrier user.
pub fn parse_structured_shadowsocks(origin: Origin<'_>) -> Node {
    Node {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        listen_host: DEFAULT_LISTEN_HOST.to_string(),
        listen_port: 0,
        settings: NodeSettings::Shadowsocks {
            cipher_method: String::new(),
        },
    }
}
