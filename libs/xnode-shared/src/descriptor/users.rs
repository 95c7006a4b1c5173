use serde_json::Value;

use super::Origin;
use super::structured::{read_bool, read_str, read_u64};
use crate::entities::{Credential, Protocol, User, UserIdentity, default_email};
use crate::error::DataError;

fn required_id(raw: &Value) -> Result<i64, DataError> {
    raw.get("id")
        .and_then(|id| match id {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .ok_or_else(|| DataError::MissingField {
            field: "id",
            raw: raw.to_string(),
        })
}

fn required_str(raw: &Value, path: &[&str], field: &'static str) -> Result<String, DataError> {
    let value = read_str(raw, path);
    if value.is_empty() {
        return Err(DataError::MissingField {
            field,
            raw: raw.to_string(),
        });
    }
    Ok(value)
}

fn checked_uuid(value: String) -> Result<String, DataError> {
    uuid::Uuid::parse_str(&value)
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| DataError::InvalidField {
            field: "uuid",
            value,
        })
}

fn listen_port(raw: &Value) -> Result<u16, DataError> {
    let port = read_u64(raw, &["port"]);
    u16::try_from(port).map_err(|_| DataError::InvalidField {
        field: "port",
        value: port.to_string(),
    })
}

fn identity(origin: Origin<'_>, raw: &Value, user_id: i64, speed_limit: u64) -> UserIdentity {
    let email = match read_str(raw, &["email"]) {
        e if e.is_empty() => default_email(user_id, origin.panel_name),
        e => e,
    };
    UserIdentity {
        panel_name: origin.panel_name.to_string(),
        node_id: origin.node_id,
        user_id,
        email,
        speed_limit,
    }
}

/// One entry of SSPanel's `/mod_mu/users`. The credential shape follows the
/// protocol of the node the list was fetched for.
pub fn parse_sspanel_user(
    origin: Origin<'_>,
    protocol: Protocol,
    raw: &Value,
) -> Result<User, DataError> {
    let user_id = required_id(raw)?;
    let speed_limit = read_u64(raw, &["node_speedlimit"]);

    let credential = match protocol {
        Protocol::Shadowsocks | Protocol::ShadowsocksR => Credential::Shadowsocks {
            password: required_str(raw, &["passwd"], "passwd")?,
            method: read_str(raw, &["method"]),
            is_multi_user: read_bool(raw, &["is_multi_user"]),
            listen_port: listen_port(raw)?,
        },
        Protocol::VMess => Credential::VMess {
            uuid: checked_uuid(required_str(raw, &["uuid"], "uuid")?)?,
        },
        Protocol::VLess => Credential::VLess {
            uuid: checked_uuid(required_str(raw, &["uuid"], "uuid")?)?,
        },
        Protocol::Trojan => Credential::Trojan {
            uuid: required_str(raw, &["uuid"], "uuid")?,
        },
    };

    Ok(User {
        identity: identity(origin, raw, user_id, speed_limit),
        credential,
    })
}

/// One entry of a V2Board `.../user` list. `index` is the position in the
/// list: the first Shadowsocks user carries the node's port and cipher.
pub fn parse_v2board_user(
    origin: Origin<'_>,
    protocol: Protocol,
    raw: &Value,
    index: usize,
) -> Result<User, DataError> {
    let user_id = required_id(raw)?;

    let credential = match protocol {
        Protocol::Shadowsocks | Protocol::ShadowsocksR => Credential::Shadowsocks {
            password: required_str(raw, &["secret"], "secret")?,
            method: read_str(raw, &["cipher"]),
            is_multi_user: index == 0,
            listen_port: listen_port(raw)?,
        },
        Protocol::VMess | Protocol::VLess => {
            let mut uuid = read_str(raw, &["v2ray_user", "uuid"]);
            if uuid.is_empty() {
                uuid = required_str(raw, &["uuid"], "v2ray_user.uuid")?;
            }
            let uuid = checked_uuid(uuid)?;
            if protocol == Protocol::VLess {
                Credential::VLess { uuid }
            } else {
                Credential::VMess { uuid }
            }
        }
        Protocol::Trojan => {
            let mut password = read_str(raw, &["trojan_user", "password"]);
            if password.is_empty() {
                password = required_str(raw, &["uuid"], "trojan_user.password")?;
            }
            Credential::Trojan { uuid: password }
        }
    };

    Ok(User {
        identity: identity(origin, raw, user_id, 0),
        credential,
    })
}
