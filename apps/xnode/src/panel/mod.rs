//! Panel adapters: fetch nodes and users from a management panel and report
//! traffic back to it.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use url::Url;
use xnode_shared::{DataError, Node, OnlineIpRecord, TrafficRecord, User};

use crate::config::{PanelConfig, PanelKind};

pub mod local;
pub mod sspanel;
pub mod v2board;

pub use local::LocalCatalog;
pub use sspanel::SsPanelAdapter;
pub use v2board::V2BoardAdapter;

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("panel returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("panel returned invalid JSON ({source}): {body}")]
    Decode {
        body: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("panel rejected the request: {payload}")]
    Rejected { payload: String },

    #[error("http: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("data: {0}")]
    Data(#[from] DataError),

    #[error("bad panel url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait PanelAdapter: Send + Sync {
    /// Origin identity stamped on every entity this panel produces.
    fn panel_name(&self) -> &str;

    async fn fetch_node_info(&self) -> Result<Node, PanelError>;

    /// Users bound to `node`. An empty list is a valid answer.
    async fn fetch_user_list(&self, node: &Node) -> Result<Vec<User>, PanelError>;

    /// `Ok(false)` when the panel has no such endpoint.
    async fn report_node_stats(&self) -> Result<bool, PanelError>;

    async fn report_user_online_ip(&self, records: &[OnlineIpRecord]) -> Result<bool, PanelError>;

    async fn report_user_traffic(&self, records: &[TrafficRecord]) -> Result<bool, PanelError>;
}

/// Build the adapter selected by `[panel].kind`.
pub fn build_adapter(config: &PanelConfig) -> Result<Box<dyn PanelAdapter>, PanelError> {
    let client = Client::builder().timeout(config.timeout()).build()?;
    let endpoint = Url::parse(&config.endpoint)?;

    Ok(match config.kind {
        PanelKind::SsPanel => Box::new(SsPanelAdapter::new(
            client,
            endpoint,
            config.api_key.clone(),
            config.node_id,
        )?),
        PanelKind::V2Board => {
            let node_type = config
                .node_type
                .as_deref()
                .ok_or_else(|| PanelError::Unsupported("v2board without node_type".to_string()))?;
            Box::new(V2BoardAdapter::new(
                client,
                endpoint,
                config.api_key.clone(),
                config.node_id,
                node_type,
            )?)
        }
    })
}

/// `host[:port]` of the panel endpoint.
pub(crate) fn panel_name(endpoint: &Url) -> Result<String, PanelError> {
    let host = endpoint
        .host_str()
        .ok_or_else(|| PanelError::Unsupported(format!("endpoint {endpoint} has no host")))?;
    Ok(match endpoint.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// How strictly the `{ret}` business flag is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Envelope {
    /// `ret` must be present and equal to 1.
    Required,
    /// A missing `ret` is accepted; a present one must be 1.
    Optional,
}

pub(crate) fn check_envelope(body: &str, envelope: Envelope) -> Result<Value, PanelError> {
    let payload: Value = serde_json::from_str(body).map_err(|source| PanelError::Decode {
        body: body.to_string(),
        source,
    })?;

    match (payload.get("ret"), envelope) {
        (Some(ret), _) if ret.as_i64() == Some(1) => Ok(payload),
        (None, Envelope::Optional) => Ok(payload),
        _ => Err(PanelError::Rejected {
            payload: payload.to_string(),
        }),
    }
}

/// Send a request, check HTTP status and the business flag.
pub(crate) async fn send(request: RequestBuilder, envelope: Envelope) -> Result<Value, PanelError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        return Err(PanelError::Status {
            status: status.as_u16(),
            body,
        });
    }
    check_envelope(&body, envelope)
}

/// The `data` array of a list response. A missing or `null` array is an
/// empty list.
pub(crate) fn data_array(payload: &Value) -> Result<&[Value], PanelError> {
    match payload.get("data") {
        Some(Value::Array(items)) => Ok(items.as_slice()),
        None | Some(Value::Null) => Ok(Default::default()),
        Some(_) => Err(PanelError::Rejected {
            payload: payload.to_string(),
        }),
    }
}
