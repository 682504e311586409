use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info};

use crate::errors::{RaftError, RaftResult, TransportError, TransportResult};
use crate::raft::inbound::{HeartbeatHandler, InboundRpc, RpcResult, SnapshotData};
use crate::raft::message::{RaftRequest, RaftResponse};
use crate::rpc::raft as wire;
use crate::rpc::raft::install_snapshot_stream::Payload;
use crate::rpc::raft::raft_service_server::{RaftService, RaftServiceServer};
use crate::rpc::snapshot::SnapshotReader;

/// Server half of the transport: turns calls from peers into `InboundRpc`s
/// on the shared inbound channel and writes the engine's answers back.
#[derive(Clone)]
pub struct RaftGrpcServerStub {
    /// Every accepted call is forwarded to the consensus engine together with
    /// a single-use response slot.
    server_to_node_tx: mpsc::Sender<InboundRpc>,
    heartbeat_handler: Arc<RwLock<Option<HeartbeatHandler>>>,
    cancel: CancellationToken,
    max_pipeline: usize,
}

impl RaftGrpcServerStub {
    pub(crate) fn new(
        server_to_node_tx: mpsc::Sender<InboundRpc>,
        heartbeat_handler: Arc<RwLock<Option<HeartbeatHandler>>>,
        cancel: CancellationToken,
        max_pipeline: usize,
    ) -> Self {
        Self {
            server_to_node_tx,
            heartbeat_handler,
            cancel,
            max_pipeline: max_pipeline.max(1),
        }
    }

    /// Serves on `address` until the transport is cancelled.
    pub async fn run(self, address: SocketAddr) -> RaftResult<()> {
        info!("Serving raft transport at {address:?}");
        let cancel = self.cancel.clone();
        Server::builder()
            .add_service(RaftServiceServer::new(self))
            .serve_with_shutdown(address, async move { cancel.cancelled().await })
            .await
            .map_err(|e| RaftError::ApplicationStartup(format!("Unable to start tonic grpc server at {:?}. Error reported was {:?}", address, e)))
    }

    /// Serves connections accepted on an already bound listener.
    pub async fn run_with_listener(self, listener: TcpListener) -> RaftResult<()> {
        let cancel = self.cancel.clone();
        Server::builder()
            .add_service(RaftServiceServer::new(self))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move { cancel.cancelled().await })
            .await
            .map_err(|e| RaftError::ApplicationStartup(format!("Unable to serve raft transport. Error reported was {:?}", e)))
    }

    fn heartbeat_handler(&self) -> Option<HeartbeatHandler> {
        self.heartbeat_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Hands `rpc` to the heartbeat handler when it qualifies, otherwise
    /// publishes it on the shared inbound channel.
    async fn route(&self, rpc: InboundRpc) -> TransportResult<()> {
        if rpc.is_heartbeat() {
            if let Some(handler) = self.heartbeat_handler() {
                handler(rpc);
                return Ok(());
            }
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            sent = self.server_to_node_tx.send(rpc) => sent.map_err(|_| {
                error!("Inbound request channel is closed, the consensus engine is gone");
                TransportError::Cancelled
            }),
        }
    }

    async fn process_rpc(&self, command: RaftRequest, reader: Option<SnapshotData>) -> TransportResult<RaftResponse> {
        let (rpc, response_rx) = InboundRpc::new(command, reader);
        self.route(rpc).await?;
        await_response(&self.cancel, response_rx).await
    }

    /// Pulls requests off a pipeline stream while a forwarder writes the
    /// answers back in request order.
    async fn serve_pipeline<S>(self, mut requests: S, out_tx: mpsc::Sender<Result<wire::AppendEntriesPipelineResponse, Status>>)
    where
        S: Stream<Item = Result<wire::AppendEntriesRequest, Status>> + Unpin,
    {
        let (pending_tx, pending_rx) = mpsc::channel(self.max_pipeline);
        let (received, ()) = tokio::join!(
            self.receive_pipeline(&mut requests, pending_tx),
            self.forward_pipeline_responses(pending_rx, &out_tx),
        );
        match received {
            Ok(()) => debug!("Append pipeline stream finished"),
            Err(e) => {
                debug!("Append pipeline stream aborted: {e}");
                // Ends the stream with a status unless the peer already hung up.
                tokio::select! {
                    _ = out_tx.closed() => {}
                    _ = out_tx.send(Err(e.into())) => {}
                }
            }
        }
    }

    async fn receive_pipeline<S>(&self, requests: &mut S, pending_tx: mpsc::Sender<oneshot::Receiver<RpcResult>>) -> TransportResult<()>
    where
        S: Stream<Item = Result<wire::AppendEntriesRequest, Status>> + Unpin,
    {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                message = requests.next() => message,
            };
            let request = match message {
                Some(Ok(request)) => request,
                Some(Err(status)) => {
                    debug!("Append pipeline receive failed: {status}");
                    return Ok(());
                }
                None => return Ok(()),
            };

            let (rpc, response_rx) = InboundRpc::new(RaftRequest::AppendEntries(request.into()), None);
            self.route(rpc).await?;
            // The forwarder only stops once the peer stopped reading.
            if pending_tx.send(response_rx).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn forward_pipeline_responses(
        &self,
        mut pending_rx: mpsc::Receiver<oneshot::Receiver<RpcResult>>,
        out_tx: &mpsc::Sender<Result<wire::AppendEntriesPipelineResponse, Status>>,
    ) {
        while let Some(response_rx) = pending_rx.recv().await {
            let outcome = tokio::select! {
                _ = out_tx.closed() => return,
                outcome = await_response(&self.cancel, response_rx) => outcome,
            };
            let frame = match outcome {
                Ok(RaftResponse::AppendEntries(response)) => wire::AppendEntriesPipelineResponse {
                    response: Some(response.into()),
                    error: String::new(),
                },
                Ok(other) => wire::AppendEntriesPipelineResponse {
                    response: None,
                    error: unexpected_response("AppendEntries", &other).to_string(),
                },
                Err(TransportError::Cancelled) if self.cancel.is_cancelled() => return,
                // A request the engine dropped unanswered still gets a frame.
                Err(e) => wire::AppendEntriesPipelineResponse {
                    response: None,
                    error: e.to_string(),
                },
            };
            if out_tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    }
}

async fn await_response(cancel: &CancellationToken, response_rx: oneshot::Receiver<RpcResult>) -> TransportResult<RaftResponse> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransportError::Cancelled),
        result = response_rx => match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(TransportError::Remote(message)),
            Err(_) => Err(TransportError::Cancelled),
        },
    }
}

fn unexpected_response(expected: &str, response: &RaftResponse) -> TransportError {
    error!("Consensus engine answered a {expected} request with a {} response", response.kind());
    TransportError::ProtocolViolation(format!("expected a {expected} response, got {}", response.kind()))
}

#[tonic::async_trait]
impl RaftService for RaftGrpcServerStub {
    type AppendEntriesPipelineStream = ReceiverStream<Result<wire::AppendEntriesPipelineResponse, Status>>;

    async fn append_entries(&self, request: Request<wire::AppendEntriesRequest>) -> Result<Response<wire::AppendEntriesResponse>, Status> {
        let request = RaftRequest::AppendEntries(request.into_inner().into());
        match self.process_rpc(request, None).await? {
            RaftResponse::AppendEntries(response) => Ok(Response::new(response.into())),
            other => Err(unexpected_response("AppendEntries", &other).into()),
        }
    }

    async fn append_entries_pipeline(
        &self,
        request: Request<Streaming<wire::AppendEntriesRequest>>,
    ) -> Result<Response<Self::AppendEntriesPipelineStream>, Status> {
        debug!("Append pipeline opened by {:?}", request.remote_addr());
        let (out_tx, out_rx) = mpsc::channel(self.max_pipeline);
        tokio::spawn(self.clone().serve_pipeline(request.into_inner(), out_tx));
        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    async fn request_vote(&self, request: Request<wire::RequestVoteRequest>) -> Result<Response<wire::RequestVoteResponse>, Status> {
        let request = RaftRequest::RequestVote(request.into_inner().into());
        match self.process_rpc(request, None).await? {
            RaftResponse::RequestVote(response) => Ok(Response::new(response.into())),
            other => Err(unexpected_response("RequestVote", &other).into()),
        }
    }

    async fn timeout_now(&self, request: Request<wire::TimeoutNowRequest>) -> Result<Response<wire::TimeoutNowResponse>, Status> {
        let request = RaftRequest::TimeoutNow(request.into_inner().into());
        match self.process_rpc(request, None).await? {
            RaftResponse::TimeoutNow(response) => Ok(Response::new(response.into())),
            other => Err(unexpected_response("TimeoutNow", &other).into()),
        }
    }

    async fn install_snapshot(
        &self,
        request: Request<Streaming<wire::InstallSnapshotStream>>,
    ) -> Result<Response<wire::InstallSnapshotResponse>, Status> {
        let mut frames = request.into_inner();
        let first = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            first = frames.message() => first?,
        };
        let Some(wire::InstallSnapshotStream {
            payload: Some(Payload::Request(header)),
        }) = first
        else {
            return Err(TransportError::ProtocolViolation("snapshot stream must start with a request header".to_string()).into());
        };

        let request = RaftRequest::InstallSnapshot(header.into());
        let reader: SnapshotData = Box::new(SnapshotReader::new(frames));
        match self.process_rpc(request, Some(reader)).await? {
            RaftResponse::InstallSnapshot(response) => Ok(Response::new(response.into())),
            other => Err(unexpected_response("InstallSnapshot", &other).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use test_log::test;
    use tokio::time::timeout;

    use super::*;
    use crate::raft::message::{AppendEntriesResponse, RequestVoteResponse};

    const WAIT: Duration = Duration::from_secs(2);

    fn stub(handler: Option<HeartbeatHandler>) -> (RaftGrpcServerStub, mpsc::Receiver<InboundRpc>, CancellationToken) {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stub = RaftGrpcServerStub::new(tx, Arc::new(RwLock::new(handler)), cancel.clone(), 4);
        (stub, rx, cancel)
    }

    fn heartbeat() -> wire::AppendEntriesRequest {
        wire::AppendEntriesRequest {
            term: 5,
            leader: "L1".to_string(),
            ..Default::default()
        }
    }

    fn ack(term: u64) -> RaftResponse {
        RaftResponse::AppendEntries(AppendEntriesResponse {
            term,
            success: true,
            ..Default::default()
        })
    }

    #[test(tokio::test)]
    async fn test_unary_request_goes_through_the_inbound_channel() {
        let (stub, mut rx, _cancel) = stub(None);
        let engine = tokio::spawn(async move {
            let rpc = rx.recv().await.unwrap();
            assert!(rpc.is_heartbeat());
            rpc.respond(ack(5));
        });
        let response = stub.append_entries(Request::new(heartbeat())).await.unwrap().into_inner();
        assert_eq!(response.term, 5);
        assert!(response.success);
        engine.await.unwrap();
    }

    #[test(tokio::test)]
    async fn test_heartbeat_handler_bypasses_the_inbound_channel() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let handler: HeartbeatHandler = Arc::new(move |rpc: InboundRpc| {
            seen.fetch_add(1, Ordering::SeqCst);
            rpc.respond(ack(5));
        });
        let (stub, mut rx, _cancel) = stub(Some(handler));

        let response = timeout(WAIT, stub.append_entries(Request::new(heartbeat()))).await.unwrap().unwrap();
        assert!(response.into_inner().success);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        // Requests carrying entries still take the normal path.
        let mut request = heartbeat();
        request.entries.push(wire::LogEntry::default());
        let engine = tokio::spawn(async move {
            let rpc = rx.recv().await.unwrap();
            assert!(!rpc.is_heartbeat());
            rpc.respond(ack(5));
        });
        stub.append_entries(Request::new(request)).await.unwrap();
        engine.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn test_engine_failure_becomes_aborted_status() {
        let (stub, mut rx, _cancel) = stub(None);
        tokio::spawn(async move {
            rx.recv().await.unwrap().fail("not the leader");
        });
        let status = stub
            .request_vote(Request::new(wire::RequestVoteRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert_eq!(status.message(), "not the leader");
    }

    #[test(tokio::test)]
    async fn test_mismatched_response_kind_is_rejected() {
        let (stub, mut rx, _cancel) = stub(None);
        tokio::spawn(async move {
            rx.recv().await.unwrap().respond(ack(1));
        });
        let status = stub
            .request_vote(Request::new(wire::RequestVoteRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[test(tokio::test)]
    async fn test_cancellation_while_waiting_for_the_engine() {
        let (stub, mut rx, cancel) = stub(None);
        let held = tokio::spawn(async move { rx.recv().await });
        let call = tokio::spawn(async move { stub.timeout_now(Request::new(wire::TimeoutNowRequest::default())).await });
        let _rpc = held.await.unwrap().unwrap();
        cancel.cancel();
        let status = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[test(tokio::test)]
    async fn test_dropped_request_is_answered_with_cancellation() {
        let (stub, mut rx, _cancel) = stub(None);
        tokio::spawn(async move {
            drop(rx.recv().await);
        });
        let status = stub
            .request_vote(Request::new(wire::RequestVoteRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[test(tokio::test)]
    async fn test_pipeline_answers_in_request_order() {
        let (stub, mut rx, _cancel) = stub(None);
        let (request_tx, request_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let serving = tokio::spawn(stub.serve_pipeline(ReceiverStream::new(request_rx).map(Ok), out_tx));

        for index in 1..=3u64 {
            let request = wire::AppendEntriesRequest {
                prev_log_entry: index,
                ..heartbeat()
            };
            request_tx.send(request).await.unwrap();
        }
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(rx.recv().await.unwrap());
        }
        // Answer out of order; the wire still sees request order.
        let third = held.pop().unwrap();
        let second = held.pop().unwrap();
        let first = held.pop().unwrap();
        third.respond(ack(3));
        second.fail("conflict at 2");
        first.respond(ack(1));

        let frame = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.response.unwrap().term, 1);
        let frame = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.error, "conflict at 2");
        let frame = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(frame.response.unwrap().term, 3);

        drop(request_tx);
        timeout(WAIT, serving).await.unwrap().unwrap();
        assert!(out_rx.recv().await.is_none());
    }

    #[test(tokio::test)]
    async fn test_pipeline_answers_requests_the_engine_dropped() {
        let (stub, mut rx, _cancel) = stub(None);
        let (request_tx, request_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        tokio::spawn(stub.serve_pipeline(ReceiverStream::new(request_rx).map(Ok), out_tx));

        for index in 1..=2u64 {
            let request = wire::AppendEntriesRequest {
                prev_log_entry: index,
                ..heartbeat()
            };
            request_tx.send(request).await.unwrap();
        }
        drop(rx.recv().await.unwrap());
        let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        second.respond(ack(2));

        let frame = timeout(WAIT, out_rx.recv()).await.unwrap().unwrap().unwrap();
        assert!(frame.response.is_none());
        assert_eq!(frame.error, TransportError::Cancelled.to_string());
        let frame = timeout(WAIT, out_rx.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(frame.response.unwrap().term, 2);
    }

    #[test(tokio::test)]
    async fn test_pipeline_heartbeat_uses_fast_path_and_still_replies() {
        let handler: HeartbeatHandler = Arc::new(|rpc: InboundRpc| rpc.respond(ack(9)));
        let (stub, mut rx, _cancel) = stub(Some(handler));
        let (request_tx, request_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        tokio::spawn(stub.serve_pipeline(ReceiverStream::new(request_rx).map(Ok), out_tx));

        request_tx.send(heartbeat()).await.unwrap();
        let frame = timeout(WAIT, out_rx.recv()).await.unwrap().unwrap().unwrap();
        assert_eq!(frame.response.unwrap().term, 9);
        assert!(rx.try_recv().is_err());
    }

    #[test(tokio::test)]
    async fn test_pipeline_stops_on_cancellation() {
        let (stub, _rx, cancel) = stub(None);
        let (_request_tx, request_rx) = mpsc::channel::<wire::AppendEntriesRequest>(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let serving = tokio::spawn(stub.serve_pipeline(ReceiverStream::new(request_rx).map(Ok), out_tx));
        cancel.cancel();
        timeout(WAIT, serving).await.unwrap().unwrap();
        let status = out_rx.recv().await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[test]
    fn test_vote_response_is_not_an_append_response() {
        let err = unexpected_response(
            "AppendEntries",
            &RaftResponse::RequestVote(RequestVoteResponse::default()),
        );
        assert!(matches!(err, TransportError::ProtocolViolation(_)));
    }
}
