//! SSPanel `mod_mu` web API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use sysinfo::System;
use tracing::{debug, warn};
use url::Url;
use xnode_shared::descriptor::{self, Origin};
use xnode_shared::{DataError, Node, OnlineIpRecord, TrafficRecord, User};

use super::{Envelope, PanelAdapter, PanelError, data_array, panel_name, send};

pub struct SsPanelAdapter {
    client: Client,
    endpoint: Url,
    panel_name: String,
    mu_key: String,
    node_id: i64,
}

impl SsPanelAdapter {
    pub fn new(
        client: Client,
        endpoint: Url,
        mu_key: String,
        node_id: i64,
    ) -> Result<Self, PanelError> {
        Ok(Self {
            panel_name: panel_name(&endpoint)?,
            client,
            endpoint,
            mu_key,
            node_id,
        })
    }

    fn origin(&self) -> Origin<'_> {
        Origin {
            panel_name: &self.panel_name,
            node_id: self.node_id,
        }
    }

    fn url(&self, path: &str, with_node_id: bool) -> Result<Url, PanelError> {
        let mut url = self.endpoint.join(path)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("key", &self.mu_key);
            if with_node_id {
                query.append_pair("node_id", &self.node_id.to_string());
            }
        }
        Ok(url)
    }

    fn node_info_path(&self) -> String {
        format!("/mod_mu/nodes/{}/info", self.node_id)
    }
}

/// `sort` picks the protocol, so a missing or non-numeric one rejects the node.
fn read_sort(data: &Value) -> Result<i64, DataError> {
    match data.get("sort") {
        None | Some(Value::Null) => Err(DataError::UnsupportedNode(format!("no sort in {data}"))),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| DataError::InvalidField {
            field: "sort",
            value: n.to_string(),
        }),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| DataError::InvalidField {
            field: "sort",
            value: s.clone(),
        }),
        Some(other) => Err(DataError::InvalidField {
            field: "sort",
            value: other.to_string(),
        }),
    }
}

#[async_trait]
impl PanelAdapter for SsPanelAdapter {
    fn panel_name(&self) -> &str {
        &self.panel_name
    }

    async fn fetch_node_info(&self) -> Result<Node, PanelError> {
        let url = self.url(&self.node_info_path(), false)?;
        let payload = send(self.client.get(url), Envelope::Required).await?;

        let data = payload.get("data").unwrap_or(&Value::Null);
        let sort = read_sort(data)?;
        let server = descriptor::read_str(data, &["server"]);
        debug!(sort, server = %server, "fetched sspanel node");

        Ok(descriptor::parse_sspanel_node(self.origin(), sort, &server)?)
    }

    async fn fetch_user_list(&self, node: &Node) -> Result<Vec<User>, PanelError> {
        let url = self.url("/mod_mu/users", true)?;
        let payload = send(self.client.get(url), Envelope::Required).await?;

        let protocol = node.protocol();
        let users = data_array(&payload)?
            .iter()
            .filter_map(
                |raw| match descriptor::parse_sspanel_user(self.origin(), protocol, raw) {
                    Ok(user) => Some(user),
                    Err(e) => {
                        warn!(panel = %self.panel_name, error = %e, "⚠️ Skipping user");
                        None
                    }
                },
            )
            .collect();
        Ok(users)
    }

    async fn report_node_stats(&self) -> Result<bool, PanelError> {
        let load = System::load_average();
        let body = json!({
            "uptime": System::uptime(),
            "load": format!("{:.2} {:.2} {:.2}", load.one, load.five, load.fifteen),
        });
        let url = self.url(&self.node_info_path(), false)?;
        send(self.client.post(url).json(&body), Envelope::Required).await?;
        Ok(true)
    }

    async fn report_user_online_ip(&self, records: &[OnlineIpRecord]) -> Result<bool, PanelError> {
        let data: Vec<Value> = records
            .iter()
            .flat_map(|r| {
                r.ips
                    .iter()
                    .map(move |ip| json!({"user_id": r.user_id, "ip": ip}))
            })
            .collect();
        if data.is_empty() {
            return Ok(true);
        }
        let url = self.url("/mod_mu/users/aliveip", true)?;
        send(self.client.post(url).json(&json!({ "data": data })), Envelope::Required).await?;
        Ok(true)
    }

    async fn report_user_traffic(&self, records: &[TrafficRecord]) -> Result<bool, PanelError> {
        if records.is_empty() {
            return Ok(true);
        }
        let data: Vec<Value> = records
            .iter()
            .map(|r| json!({"user_id": r.user_id, "u": r.upload, "d": r.download}))
            .collect();
        let url = self.url("/mod_mu/users/traffic", true)?;
        send(self.client.post(url).json(&json!({ "data": data })), Envelope::Required).await?;
        Ok(true)
    }
}
