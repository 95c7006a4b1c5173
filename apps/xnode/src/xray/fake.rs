//! In-memory control plane with the engine's already-exists / not-found
//! behaviour.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use xnode_shared::{Node, User};

use super::inbound::{build_inbound, build_user};
use super::{ControlPlane, Direction, XrayError, user_traffic_counter};

#[derive(Debug, Default)]
struct State {
    /// tag -> (listen port, emails)
    inbounds: BTreeMap<String, (u16, BTreeSet<String>)>,
    counters: HashMap<String, u64>,
    /// Traffic that lands between a read and the following reset.
    late_traffic: HashMap<String, u64>,
    online: HashMap<String, Vec<String>>,
    foreign_ports: BTreeSet<u16>,
    rejected_emails: BTreeSet<String>,
    calls: Vec<String>,
}

#[derive(Debug, Default)]
pub struct FakeControlPlane {
    state: Mutex<State>,
}

impl FakeControlPlane {
    pub fn inbound_tags(&self) -> Vec<String> {
        self.state.lock().unwrap().inbounds.keys().cloned().collect()
    }

    pub fn emails(&self, tag: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .inbounds
            .get(tag)
            .map(|(_, emails)| emails.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn port(&self, tag: &str) -> Option<u16> {
        self.state.lock().unwrap().inbounds.get(tag).map(|(p, _)| *p)
    }

    /// Every mutation seen so far, e.g. `add_inbound p-vmess-1`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Occupy `port` outside of our bookkeeping.
    pub fn occupy_port(&self, port: u16) {
        self.state.lock().unwrap().foreign_ports.insert(port);
    }

    /// Refuse every `add_user` for `email` until [`Self::allow_user`].
    pub fn reject_user(&self, email: &str) {
        self.state.lock().unwrap().rejected_emails.insert(email.to_string());
    }

    pub fn allow_user(&self, email: &str) {
        self.state.lock().unwrap().rejected_emails.remove(email);
    }

    pub fn add_traffic(&self, email: &str, upload: u64, download: u64) {
        let mut state = self.state.lock().unwrap();
        *state
            .counters
            .entry(user_traffic_counter(email, Direction::Uplink))
            .or_default() += upload;
        *state
            .counters
            .entry(user_traffic_counter(email, Direction::Downlink))
            .or_default() += download;
    }

    pub fn add_late_traffic(&self, email: &str, upload: u64, download: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .late_traffic
            .insert(user_traffic_counter(email, Direction::Uplink), upload);
        state
            .late_traffic
            .insert(user_traffic_counter(email, Direction::Downlink), download);
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        self.state.lock().unwrap().counters.get(name).copied()
    }

    pub fn set_online(&self, email: &str, ips: &[&str]) {
        self.state.lock().unwrap().online.insert(
            email.to_string(),
            ips.iter().map(|ip| ip.to_string()).collect(),
        );
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn add_inbound(&self, node: &Node) -> Result<(), XrayError> {
        build_inbound(node, None)?;
        let tag = node.tag();
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("add_inbound {tag}"));
        if state.inbounds.contains_key(&tag) {
            return Err(XrayError::InboundTagAlreadyExists { tag });
        }
        let port_taken = state.foreign_ports.contains(&node.listen_port)
            || state.inbounds.values().any(|(p, _)| *p == node.listen_port);
        if port_taken {
            let port = node.listen_port;
            return Err(XrayError::AddressAlreadyInUse {
                detail: format!("listen tcp 0.0.0.0:{port}: bind: address already in use"),
            });
        }
        state.inbounds.insert(tag, (node.listen_port, BTreeSet::new()));
        Ok(())
    }

    async fn remove_inbound(&self, tag: &str) -> Result<(), XrayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_inbound {tag}"));
        state
            .inbounds
            .remove(tag)
            .map(|_| ())
            .ok_or_else(|| XrayError::InboundTagNotFound { tag: tag.to_string() })
    }

    async fn add_user(&self, node: &Node, user: &User) -> Result<(), XrayError> {
        build_user(node, user)?;
        let tag = node.tag();
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("add_user {tag} {}", user.email()));
        if state.rejected_emails.contains(user.email()) {
            return Err(XrayError::Rpc {
                code: tonic::Code::Unknown,
                detail: format!("rejected {}", user.email()),
            });
        }
        let (_, emails) = state
            .inbounds
            .get_mut(&tag)
            .ok_or_else(|| XrayError::InboundTagNotFound { tag: tag.clone() })?;
        if !emails.insert(user.email().to_string()) {
            return Err(XrayError::EmailExists {
                email: user.email().to_string(),
            });
        }
        Ok(())
    }

    async fn remove_user(&self, tag: &str, email: &str) -> Result<(), XrayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("remove_user {tag} {email}"));
        let (_, emails) = state
            .inbounds
            .get_mut(tag)
            .ok_or_else(|| XrayError::InboundTagNotFound { tag: tag.to_string() })?;
        if !emails.remove(email) {
            return Err(XrayError::EmailNotFound {
                email: email.to_string(),
            });
        }
        Ok(())
    }

    async fn get_stat(&self, name: &str, reset: bool) -> Result<Option<u64>, XrayError> {
        let mut state = self.state.lock().unwrap();
        if reset {
            if let Some(extra) = state.late_traffic.remove(name) {
                *state.counters.entry(name.to_string()).or_default() += extra;
            }
            return Ok(state.counters.get_mut(name).map(std::mem::take));
        }
        Ok(state.counters.get(name).copied())
    }

    async fn online_ips(&self, email: &str) -> Result<Vec<String>, XrayError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .online
            .get(email)
            .cloned()
            .unwrap_or_default())
    }
}
