use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{RaftResult, TransportResult};
use crate::raft::inbound::{HeartbeatHandler, InboundRpc};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::raft::TransportOptions;
use crate::rpc::convert;
use crate::rpc::pipeline::AppendPipeline;
use crate::rpc::raft::raft_service_server::RaftServiceServer;
use crate::rpc::rpc_client::RaftGrpcClientStub;
use crate::rpc::rpc_peer_network::PeerNetwork;
use crate::rpc::rpc_server::RaftGrpcServerStub;

/// Receiving end of the shared inbound channel.
///
/// Clones share one receiver; every request is handed to exactly one of them.
#[derive(Clone)]
pub struct RpcConsumer {
    rx: Arc<Mutex<mpsc::Receiver<InboundRpc>>>,
}

impl RpcConsumer {
    /// Next request from any peer, `None` once the transport is gone.
    pub async fn recv(&self) -> Option<InboundRpc> {
        self.rx.lock().await.recv().await
    }
}

/// gRPC transport for a Raft consensus engine.
///
/// Outbound calls go through the peer registry; inbound calls are served by
/// [`RaftGrpcTransport::server`] and surface on [`RaftGrpcTransport::consumer`].
/// Everything the transport spawns stops when `cancel` fires.
pub struct RaftGrpcTransport {
    local_id: String,
    cancel: CancellationToken,
    network: PeerNetwork,
    server_to_node_tx: mpsc::Sender<InboundRpc>,
    consumer: RpcConsumer,
    heartbeat_handler: Arc<RwLock<Option<HeartbeatHandler>>>,
    options: TransportOptions,
}

impl RaftGrpcTransport {
    pub fn new(cancel: CancellationToken, local_id: impl Into<String>) -> Self {
        Self::with_options(cancel, local_id, TransportOptions::default())
    }

    pub fn with_options(cancel: CancellationToken, local_id: impl Into<String>, options: TransportOptions) -> Self {
        let local_id = local_id.into();
        let (server_to_node_tx, server_to_node_rx) = mpsc::channel(options.inbound_queue_capacity.max(1));
        Self {
            network: PeerNetwork::new(local_id.clone(), cancel.clone(), options),
            local_id,
            cancel,
            server_to_node_tx,
            consumer: RpcConsumer {
                rx: Arc::new(Mutex::new(server_to_node_rx)),
            },
            heartbeat_handler: Arc::new(RwLock::new(None)),
            options,
        }
    }

    pub fn consumer(&self) -> RpcConsumer {
        self.consumer.clone()
    }

    pub fn local_addr(&self) -> &str {
        &self.local_id
    }

    pub fn options(&self) -> TransportOptions {
        self.options
    }

    pub fn network(&self) -> &PeerNetwork {
        &self.network
    }

    pub async fn append_entries(&self, target: &str, request: &AppendEntriesRequest) -> TransportResult<AppendEntriesResponse> {
        self.network.append_entries(target, request).await
    }

    pub async fn request_vote(&self, target: &str, request: &RequestVoteRequest) -> TransportResult<RequestVoteResponse> {
        self.network.request_vote(target, request).await
    }

    pub async fn timeout_now(&self, target: &str, request: &TimeoutNowRequest) -> TransportResult<TimeoutNowResponse> {
        self.network.timeout_now(target, request).await
    }

    pub async fn install_snapshot<R>(&self, target: &str, request: &InstallSnapshotRequest, data: R) -> TransportResult<InstallSnapshotResponse>
    where
        R: AsyncRead + Unpin,
    {
        self.network.install_snapshot(target, request, data).await
    }

    pub async fn open_append_pipeline(&self, target: &str) -> TransportResult<AppendPipeline> {
        self.network.open_append_pipeline(target).await
    }

    pub fn encode_peer(&self, id: &str) -> Vec<u8> {
        convert::encode_peer(id)
    }

    pub fn decode_peer(&self, data: &[u8]) -> String {
        convert::decode_peer(data)
    }

    /// Installs the heartbeat fast path, replacing any previous handler.
    ///
    /// The handler runs on the dispatching task and must answer the request
    /// without blocking.
    pub fn set_heartbeat_handler<F>(&self, handler: F)
    where
        F: Fn(InboundRpc) + Send + Sync + 'static,
    {
        let mut slot = self.heartbeat_handler.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(handler));
    }

    pub fn clear_heartbeat_handler(&self) {
        let mut slot = self.heartbeat_handler.write().unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    pub fn add_peer(&self, id: impl Into<String>, client: RaftGrpcClientStub) {
        self.network.add_peer(id, client)
    }

    pub fn remove_peer(&self, id: &str) {
        self.network.remove_peer(id)
    }

    /// Server-side stub feeding this transport's inbound channel.
    pub fn server_stub(&self) -> RaftGrpcServerStub {
        RaftGrpcServerStub::new(
            self.server_to_node_tx.clone(),
            self.heartbeat_handler.clone(),
            self.cancel.clone(),
            self.options.max_pipeline,
        )
    }

    /// Service to mount on a tonic server alongside other services.
    pub fn server(&self) -> RaftServiceServer<RaftGrpcServerStub> {
        RaftServiceServer::new(self.server_stub())
    }

    pub async fn serve(&self, address: SocketAddr) -> RaftResult<()> {
        info!("Node {} serving raft transport", self.local_id);
        self.server_stub().run(address).await
    }

    pub async fn serve_with_incoming(&self, listener: TcpListener) -> RaftResult<()> {
        info!("Node {} serving raft transport on {:?}", self.local_id, listener.local_addr().ok());
        self.server_stub().run_with_listener(listener).await
    }
}
