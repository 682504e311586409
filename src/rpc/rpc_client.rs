use tonic::transport::{Channel, Endpoint};
use tonic::{Status, Streaming};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::errors::{RaftError, RaftResult};
use crate::rpc::raft::raft_service_client::RaftServiceClient;
use crate::rpc::raft::{
    AppendEntriesPipelineResponse, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotResponse,
    InstallSnapshotStream, RequestVoteRequest, RequestVoteResponse, TimeoutNowRequest, TimeoutNowResponse,
};

/// Outbound connection handle for one peer.
///
/// The tonic channel multiplexes concurrent calls, so the stub is cloned per
/// call instead of being shared behind a lock.
#[derive(Debug, Clone)]
pub struct RaftGrpcClientStub {
    client: RaftServiceClient<Channel>,
}

impl RaftGrpcClientStub {
    /// Connects eagerly, failing if the peer is not reachable yet.
    pub async fn connect(addr: &str) -> RaftResult<Self> {
        debug!("Constructing new stub for address {addr}");
        let client = RaftServiceClient::connect(addr.to_string())
            .await
            .map_err(|e| RaftError::InternalServerErrorWithContext(format!("Error establishing connectivity with node : {addr}. Error is {e:?}")))?;
        debug!("Stub constructed for address {addr}");
        Ok(Self { client })
    }

    /// Builds a stub whose connection is established on first use.
    pub fn lazy(addr: &str) -> RaftResult<Self> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| RaftError::BadRequest(format!("Invalid peer address {addr}: {e}")))?;
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            client: RaftServiceClient::new(channel),
        }
    }

    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse, Status> {
        let response = self.client.clone().append_entries(request).await?;
        Ok(response.into_inner())
    }

    pub async fn request_vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse, Status> {
        let response = self.client.clone().request_vote(request).await?;
        Ok(response.into_inner())
    }

    pub async fn timeout_now(&self, request: TimeoutNowRequest) -> Result<TimeoutNowResponse, Status> {
        let response = self.client.clone().timeout_now(request).await?;
        Ok(response.into_inner())
    }

    /// Opens the snapshot stream; it completes once `frames` is exhausted and
    /// the peer has answered.
    pub async fn install_snapshot(&self, frames: ReceiverStream<InstallSnapshotStream>) -> Result<InstallSnapshotResponse, Status> {
        let response = self.client.clone().install_snapshot(frames).await?;
        Ok(response.into_inner())
    }

    pub async fn append_entries_pipeline(
        &self,
        requests: ReceiverStream<AppendEntriesRequest>,
    ) -> Result<Streaming<AppendEntriesPipelineResponse>, Status> {
        let response = self.client.clone().append_entries_pipeline(requests).await?;
        Ok(response.into_inner())
    }
}
