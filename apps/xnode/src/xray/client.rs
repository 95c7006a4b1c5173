//! gRPC client for Xray's `HandlerService` and `StatsService`.

use std::time::Duration;

use async_trait::async_trait;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tracing::debug;
use xnode_shared::{Node, User};

use super::inbound::{TlsFiles, build_inbound, build_user};
use super::proto::{
    AddInboundRequest, AddInboundResponse, AddUserOperation, AlterInboundRequest,
    AlterInboundResponse, GetStatsOnlineIpListResponse, GetStatsRequest, GetStatsResponse,
    RemoveInboundRequest, RemoveInboundResponse, RemoveUserOperation, TypedMessage, type_name,
};
use super::{Call, ControlPlane, XrayError, classify, user_online_counter};

const ADD_INBOUND: &str = "/xray.app.proxyman.command.HandlerService/AddInbound";
const REMOVE_INBOUND: &str = "/xray.app.proxyman.command.HandlerService/RemoveInbound";
const ALTER_INBOUND: &str = "/xray.app.proxyman.command.HandlerService/AlterInbound";
const GET_STATS: &str = "/xray.app.stats.command.StatsService/GetStats";
const GET_ONLINE_IPS: &str = "/xray.app.stats.command.StatsService/GetStatsOnlineIpList";

/// One lazily connected channel shared by every call.
#[derive(Clone)]
pub struct XrayClient {
    grpc: Grpc<Channel>,
    tls: Option<TlsFiles>,
}

impl XrayClient {
    /// No I/O happens until the first call.
    pub fn connect_lazy(
        host: &str,
        port: u16,
        call_timeout: Duration,
        tls: Option<TlsFiles>,
    ) -> Result<Self, XrayError> {
        let channel = Endpoint::from_shared(format!("http://{host}:{port}"))?
            .connect_timeout(call_timeout)
            .timeout(call_timeout)
            .connect_lazy();
        Ok(Self {
            grpc: Grpc::new(channel),
            tls,
        })
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp, tonic::Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc.clone();
        grpc.ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("control plane not ready: {e}")))?;
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                ProstCodec::default(),
            )
            .await?;
        Ok(response.into_inner())
    }

    async fn alter(&self, tag: &str, operation: TypedMessage) -> Result<(), tonic::Status> {
        let request = AlterInboundRequest {
            tag: tag.to_string(),
            operation: Some(operation),
        };
        self.unary::<_, AlterInboundResponse>(ALTER_INBOUND, request)
            .await
            .map(|_| ())
    }
}

fn counter_missing(status: &tonic::Status) -> bool {
    status.message().to_ascii_lowercase().contains("not found")
}

#[async_trait]
impl ControlPlane for XrayClient {
    async fn add_inbound(&self, node: &Node) -> Result<(), XrayError> {
        let config = build_inbound(node, self.tls.as_ref())?;
        let tag = config.tag.clone();
        let request = AddInboundRequest {
            inbound: Some(config),
        };
        self.unary::<_, AddInboundResponse>(ADD_INBOUND, request)
            .await
            .map(|_| ())
            .map_err(|s| classify(Call::AddInbound { tag: &tag }, &s))
    }

    async fn remove_inbound(&self, tag: &str) -> Result<(), XrayError> {
        let request = RemoveInboundRequest {
            tag: tag.to_string(),
        };
        self.unary::<_, RemoveInboundResponse>(REMOVE_INBOUND, request)
            .await
            .map(|_| ())
            .map_err(|s| classify(Call::RemoveInbound { tag }, &s))
    }

    async fn add_user(&self, node: &Node, user: &User) -> Result<(), XrayError> {
        let tag = node.tag();
        let operation = AddUserOperation {
            user: Some(build_user(node, user)?),
        };
        self.alter(
            &tag,
            TypedMessage::pack(type_name::ADD_USER_OPERATION, &operation),
        )
        .await
        .map_err(|s| {
            classify(
                Call::AddUser {
                    tag: &tag,
                    email: user.email(),
                },
                &s,
            )
        })
    }

    async fn remove_user(&self, tag: &str, email: &str) -> Result<(), XrayError> {
        let operation = RemoveUserOperation {
            email: email.to_string(),
        };
        self.alter(
            tag,
            TypedMessage::pack(type_name::REMOVE_USER_OPERATION, &operation),
        )
        .await
        .map_err(|s| classify(Call::RemoveUser { tag, email }, &s))
    }

    async fn get_stat(&self, name: &str, reset: bool) -> Result<Option<u64>, XrayError> {
        let request = GetStatsRequest {
            name: name.to_string(),
            reset,
        };
        match self.unary::<_, GetStatsResponse>(GET_STATS, request).await {
            Ok(response) => Ok(response
                .stat
                .map(|s| u64::try_from(s.value).unwrap_or_default())),
            Err(status) if counter_missing(&status) => {
                debug!(counter = name, "counter not registered yet");
                Ok(None)
            }
            Err(status) => Err(classify(Call::Stats, &status)),
        }
    }

    async fn online_ips(&self, email: &str) -> Result<Vec<String>, XrayError> {
        let request = GetStatsRequest {
            name: user_online_counter(email),
            reset: false,
        };
        match self
            .unary::<_, GetStatsOnlineIpListResponse>(GET_ONLINE_IPS, request)
            .await
        {
            Ok(response) => {
                let mut ips: Vec<String> = response.ips.into_keys().collect();
                ips.sort();
                Ok(ips)
            }
            Err(status) if counter_missing(&status) => Ok(Vec::new()),
            Err(status) if status.code() == tonic::Code::Unimplemented => {
                debug!(email, "engine does not track online ips");
                Ok(Vec::new())
            }
            Err(status) => Err(classify(Call::Stats, &status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_engine_is_an_rpc_error() {
        let client =
            XrayClient::connect_lazy("127.0.0.1", 9, Duration::from_millis(300), None).unwrap();
        let err = client.remove_inbound("p-vmess-1").await.unwrap_err();
        assert!(matches!(err, XrayError::Rpc { .. }), "{err:?}");
        assert!(!err.is_absent());
    }

    #[test]
    fn invalid_host_is_a_transport_error() {
        assert!(matches!(
            XrayClient::connect_lazy("bad host", 1, Duration::from_secs(1), None),
            Err(XrayError::Transport(_))
        ));
    }
}
