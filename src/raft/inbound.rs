use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use crate::raft::message::{RaftRequest, RaftResponse};

/// Outcome the consensus engine reports for one inbound request. The error
/// side travels back to the calling peer verbatim.
pub type RpcResult = Result<RaftResponse, String>;

/// Sequential byte source feeding an InstallSnapshot payload.
pub type SnapshotData = Box<dyn AsyncRead + Send + Unpin>;

/// Fast-path callback for heartbeat-shaped AppendEntries requests.
pub type HeartbeatHandler = Arc<dyn Fn(InboundRpc) + Send + Sync>;

/// A request received from a peer, waiting for the consensus engine.
///
/// The response slot is single-use: `respond`, `fail` and `reply` consume the
/// request. Dropping it unanswered resolves the caller with a cancellation.
pub struct InboundRpc {
    pub command: RaftRequest,
    reader: Option<SnapshotData>,
    responder: oneshot::Sender<RpcResult>,
}

impl InboundRpc {
    pub(crate) fn new(command: RaftRequest, reader: Option<SnapshotData>) -> (Self, oneshot::Receiver<RpcResult>) {
        let (responder, response_rx) = oneshot::channel();
        let rpc = Self {
            command,
            reader,
            responder,
        };
        (rpc, response_rx)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command.is_heartbeat()
    }

    /// Snapshot payload, present only for InstallSnapshot.
    pub fn take_reader(&mut self) -> Option<SnapshotData> {
        self.reader.take()
    }

    pub fn respond(self, response: RaftResponse) {
        self.reply(Ok(response))
    }

    pub fn fail(self, error: impl Display) {
        self.reply(Err(error.to_string()))
    }

    pub fn reply(self, result: RpcResult) {
        // The dispatcher may have given up on the call already.
        let _ = self.responder.send(result);
    }
}

impl fmt::Debug for InboundRpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRpc")
            .field("command", &self.command)
            .field("has_reader", &self.reader.is_some())
            .finish()
    }
}
