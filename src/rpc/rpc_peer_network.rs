use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::{TransportError, TransportResult};
use crate::raft::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest, TimeoutNowResponse,
};
use crate::raft::TransportOptions;
use crate::rpc::pipeline::AppendPipeline;
use crate::rpc::rpc_client::RaftGrpcClientStub;
use crate::rpc::snapshot;

/// Registry of outbound peer connections and the issuer of calls through them.
///
/// Lookups take the read lock only long enough to clone the handle, so calls
/// issued before a removal keep running while later lookups miss.
#[derive(Clone)]
pub struct PeerNetwork {
    node_id: String,
    peers: Arc<RwLock<HashMap<String, RaftGrpcClientStub>>>,
    cancel: CancellationToken,
    options: TransportOptions,
}

impl PeerNetwork {
    pub fn new(node_id: String, cancel: CancellationToken, options: TransportOptions) -> Self {
        Self {
            node_id,
            peers: Arc::new(Default::default()),
            cancel,
            options,
        }
    }

    /// Registers `client` for `id`, replacing any previous handle.
    pub fn add_peer(&self, id: impl Into<String>, client: RaftGrpcClientStub) {
        let id = id.into();
        info!("Adding node {id} as peer of {}", self.node_id);
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        peers.insert(id, client);
    }

    pub fn remove_peer(&self, id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.remove(id).is_some() {
            info!("Removed node {id} from peers of {}", self.node_id);
        }
    }

    pub fn peer(&self, id: &str) -> TransportResult<RaftGrpcClientStub> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        peers
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::PeerUnavailable(id.to_string()))
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let peers = self.peers.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids = peers.keys().cloned().collect::<Vec<String>>();
        ids.sort();
        ids
    }

    pub async fn append_entries(&self, target: &str, request: &AppendEntriesRequest) -> TransportResult<AppendEntriesResponse> {
        let client = self.peer(target)?;
        let response = self.cancellable(client.append_entries(request.into())).await;
        self.log_outcome("AppendEntries", target, &response);
        Ok(response?.into())
    }

    pub async fn request_vote(&self, target: &str, request: &RequestVoteRequest) -> TransportResult<RequestVoteResponse> {
        let client = self.peer(target)?;
        let response = self.cancellable(client.request_vote(request.into())).await;
        self.log_outcome("RequestVote", target, &response);
        Ok(response?.into())
    }

    pub async fn timeout_now(&self, target: &str, request: &TimeoutNowRequest) -> TransportResult<TimeoutNowResponse> {
        let client = self.peer(target)?;
        let response = self.cancellable(client.timeout_now(request.into())).await;
        self.log_outcome("TimeoutNow", target, &response);
        Ok(response?.into())
    }

    pub async fn install_snapshot<R>(
        &self,
        target: &str,
        request: &InstallSnapshotRequest,
        data: R,
    ) -> TransportResult<InstallSnapshotResponse>
    where
        R: AsyncRead + Unpin,
    {
        let client = self.peer(target)?;
        info!("Installing snapshot of {} bytes on {target} from {}", request.size, self.node_id);
        let transfer = snapshot::send_snapshot(&client, request, data, self.options.snapshot_chunk_size);
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            response = transfer => response,
        };
        self.log_outcome("InstallSnapshot", target, &response);
        response
    }

    /// Opens a pipeline session; it lives in a child scope of the transport.
    pub async fn open_append_pipeline(&self, target: &str) -> TransportResult<AppendPipeline> {
        let client = self.peer(target)?;
        let cancel = self.cancel.child_token();
        let (request_tx, request_rx) = mpsc::channel(self.options.max_pipeline.max(1));
        let responses = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            responses = client.append_entries_pipeline(ReceiverStream::new(request_rx)) => responses.map_err(TransportError::from),
        }?;
        debug!("Opened append pipeline from {} to {target}", self.node_id);
        Ok(AppendPipeline::start(target.to_string(), cancel, request_tx, responses, self.options.max_pipeline))
    }

    async fn cancellable<T, F>(&self, call: F) -> TransportResult<T>
    where
        F: Future<Output = Result<T, tonic::Status>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = call => result.map_err(TransportError::from),
        }
    }

    fn log_outcome<T>(&self, kind: &str, target: &str, outcome: &TransportResult<T>) {
        match outcome {
            Ok(_) => debug!("Received {kind} response on node_id: {} from {target}", self.node_id),
            Err(TransportError::Cancelled) => debug!("{kind} from {} to {target} cancelled", self.node_id),
            Err(e) => error!("Error received at {} while sending {kind} to {target}: {e}", self.node_id),
        }
    }
}
