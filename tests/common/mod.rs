#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rafting_transport::errors::RaftResult;
use rafting_transport::raft::inbound::InboundRpc;
use rafting_transport::raft::message::{
    AppendEntriesResponse, InstallSnapshotResponse, RaftRequest, RaftResponse, RequestVoteResponse, TimeoutNowResponse,
};
use rafting_transport::raft::TransportOptions;
use rafting_transport::rpc::rpc_client::RaftGrpcClientStub;
use rafting_transport::transport::RaftGrpcTransport;

/// Leader name that makes the scripted engine reject an AppendEntries call.
pub const REJECTING_LEADER: &str = "reject-me";
pub const REJECTION: &str = "rejected by engine";

pub struct TestNode {
    pub transport: Arc<RaftGrpcTransport>,
    pub address: SocketAddr,
    pub server: JoinHandle<RaftResult<()>>,
}

impl TestNode {
    pub async fn start(cancel: &CancellationToken, id: &str, options: TransportOptions) -> TestNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("loopback bind must succeed");
        let address = listener.local_addr().expect("bound listener has an address");
        let transport = Arc::new(RaftGrpcTransport::with_options(cancel.clone(), id, options));
        let server = tokio::spawn(transport.server_stub().run_with_listener(listener));
        TestNode {
            transport,
            address,
            server,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Registers `other` as a peer of this node under its local id.
    pub fn connect_to(&self, other: &TestNode) {
        let stub = RaftGrpcClientStub::lazy(&other.endpoint()).expect("loopback endpoint must parse");
        self.transport.add_peer(other.transport.local_addr(), stub);
    }
}

/// Answers every inbound request the way a cooperative consensus engine
/// would. Snapshot payloads are read fully and published on the returned
/// receiver.
pub fn spawn_scripted_engine(transport: &RaftGrpcTransport) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let consumer = transport.consumer();
    let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(rpc) = consumer.recv().await {
            answer(rpc, &snapshot_tx).await;
        }
    });
    snapshot_rx
}

async fn answer(mut rpc: InboundRpc, snapshot_tx: &mpsc::UnboundedSender<Vec<u8>>) {
    match rpc.command.clone() {
        RaftRequest::AppendEntries(request) if request.leader == REJECTING_LEADER => rpc.fail(REJECTION),
        RaftRequest::AppendEntries(request) => rpc.respond(RaftResponse::AppendEntries(AppendEntriesResponse {
            term: request.term,
            last_log: request.prev_log_entry + request.entries.len() as u64,
            success: true,
            no_retry_backoff: false,
        })),
        RaftRequest::RequestVote(request) => rpc.respond(RaftResponse::RequestVote(RequestVoteResponse {
            term: request.term,
            granted: request.last_log_index >= 10,
        })),
        RaftRequest::TimeoutNow(request) => rpc.respond(RaftResponse::TimeoutNow(TimeoutNowResponse { term: request.term + 1 })),
        RaftRequest::InstallSnapshot(request) => {
            let mut data = Vec::new();
            let read = match rpc.take_reader() {
                Some(mut reader) => reader.read_to_end(&mut data).await,
                None => Ok(0),
            };
            match read {
                Ok(_) => {
                    let complete = data.len() as i64 == request.size;
                    let _ = snapshot_tx.send(data);
                    rpc.respond(RaftResponse::InstallSnapshot(InstallSnapshotResponse {
                        term: request.term,
                        success: complete,
                    }))
                }
                Err(e) => rpc.fail(e),
            }
        }
    }
}

/// Hands every inbound request to the test without answering it.
pub fn spawn_stalled_engine(transport: &RaftGrpcTransport) -> mpsc::UnboundedReceiver<InboundRpc> {
    let consumer = transport.consumer();
    let (held_tx, held_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(rpc) = consumer.recv().await {
            if held_tx.send(rpc).is_err() {
                break;
            }
        }
    });
    held_rx
}
