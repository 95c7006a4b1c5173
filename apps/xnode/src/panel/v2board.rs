//! V2Board server API (`/api/v1/server/<family>/...`).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::warn;
use url::Url;
use xnode_shared::descriptor::{self, Origin};
use xnode_shared::{Node, OnlineIpRecord, Protocol, TrafficRecord, User};

use super::{Envelope, PanelAdapter, PanelError, data_array, panel_name, send};

pub struct V2BoardAdapter {
    client: Client,
    endpoint: Url,
    panel_name: String,
    token: String,
    node_id: i64,
    protocol: Protocol,
}

impl V2BoardAdapter {
    pub fn new(
        client: Client,
        endpoint: Url,
        token: String,
        node_id: i64,
        node_type: &str,
    ) -> Result<Self, PanelError> {
        let protocol: Protocol = node_type.parse()?;
        if protocol == Protocol::ShadowsocksR {
            return Err(PanelError::Unsupported(format!("v2board node type {node_type}")));
        }
        Ok(Self {
            panel_name: panel_name(&endpoint)?,
            client,
            endpoint,
            token,
            node_id,
            protocol,
        })
    }

    fn family(&self) -> &'static str {
        match self.protocol {
            Protocol::Shadowsocks | Protocol::ShadowsocksR => "ShadowsocksTidalab",
            Protocol::Trojan => "TrojanTidalab",
            Protocol::VMess | Protocol::VLess => "Deepbwork",
        }
    }

    fn origin(&self) -> Origin<'_> {
        Origin {
            panel_name: &self.panel_name,
            node_id: self.node_id,
        }
    }

    fn url(&self, action: &str) -> Result<Url, PanelError> {
        let mut url = self
            .endpoint
            .join(&format!("/api/v1/server/{}/{action}", self.family()))?;
        url.query_pairs_mut()
            .append_pair("token", &self.token)
            .append_pair("node_id", &self.node_id.to_string())
            .append_pair("local_port", "1");
        Ok(url)
    }
}

#[async_trait]
impl PanelAdapter for V2BoardAdapter {
    fn panel_name(&self) -> &str {
        &self.panel_name
    }

    async fn fetch_node_info(&self) -> Result<Node, PanelError> {
        if self.protocol.is_shadowsocks() {
            return Ok(descriptor::parse_structured_shadowsocks(self.origin()));
        }

        let payload = send(self.client.get(self.url("config")?), Envelope::Optional).await?;
        let node = match self.protocol {
            Protocol::Trojan => descriptor::parse_structured_trojan(self.origin(), &payload)?,
            _ => descriptor::parse_structured_vmess(
                self.origin(),
                &payload,
                self.protocol == Protocol::VLess,
            )?,
        };
        Ok(node)
    }

    async fn fetch_user_list(&self, _node: &Node) -> Result<Vec<User>, PanelError> {
        let payload = send(self.client.get(self.url("user")?), Envelope::Optional).await?;

        let mut users = Vec::new();
        for (index, raw) in data_array(&payload)?.iter().enumerate() {
            match descriptor::parse_v2board_user(self.origin(), self.protocol, raw, index) {
                Ok(user) => users.push(user),
                Err(e) => warn!(panel = %self.panel_name, error = %e, "⚠️ Skipping user"),
            }
        }
        Ok(users)
    }

    async fn report_node_stats(&self) -> Result<bool, PanelError> {
        Ok(false)
    }

    async fn report_user_online_ip(&self, _records: &[OnlineIpRecord]) -> Result<bool, PanelError> {
        Ok(false)
    }

    async fn report_user_traffic(&self, records: &[TrafficRecord]) -> Result<bool, PanelError> {
        if records.is_empty() {
            return Ok(true);
        }
        let body: Vec<Value> = records
            .iter()
            .map(|r| json!({"user_id": r.user_id, "u": r.upload, "d": r.download}))
            .collect();
        // Counters are reset on success, so only an explicit `ret: 1` counts.
        send(
            self.client.post(self.url("submit")?).json(&body),
            Envelope::Required,
        )
        .await?;
        Ok(true)
    }
}
