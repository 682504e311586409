//! Pipelined AppendEntries over one ordered bidirectional stream.
//!
//! A session runs a send loop and a receive loop. The send loop moves each
//! submitted call into the in-flight queue before writing it to the stream;
//! the receive loop pairs every response frame with the oldest in-flight call.
//! The stream never reorders, so pairing is strictly FIFO.
//!
//! Any failure in either loop ends the session. Every call still queued or in
//! flight is then resolved with the failure that ended it, or `Cancelled` when
//! the session was closed.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, warn};

use crate::errors::{TransportError, TransportResult};
use crate::raft::message::{AppendEntriesRequest, AppendEntriesResponse};
use crate::rpc::future::{self, Outcome, Promise};
use crate::rpc::raft as wire;

/// Handle to one pipelined AppendEntries call.
///
/// Clones share the same outcome: the handle returned by
/// `AppendPipeline::append_entries` and the one drained from
/// `AppendPipeline::consumer` resolve together.
#[derive(Clone)]
pub struct AppendFuture {
    start: Instant,
    request: Arc<AppendEntriesRequest>,
    outcome: Outcome<TransportResult<AppendEntriesResponse>>,
}

impl AppendFuture {
    /// Blocks until the call is resolved.
    ///
    /// Session teardown resolves every outstanding call, so closing the
    /// pipeline or cancelling the transport also ends this wait, with the
    /// error that terminated the session.
    pub async fn wait(&self) -> TransportResult<()> {
        match self.outcome.wait().await {
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(e),
            None => Err(TransportError::Cancelled),
        }
    }

    /// Like `wait`, but also gives up with `Cancelled` once the caller's
    /// own `scope` fires. The call itself stays in flight.
    pub async fn wait_with(&self, scope: &CancellationToken) -> TransportResult<()> {
        tokio::select! {
            biased;
            result = self.wait() => result,
            _ = scope.cancelled() => Err(TransportError::Cancelled),
        }
    }

    /// When the call was submitted.
    pub fn start(&self) -> Instant {
        self.start
    }

    pub fn request(&self) -> &AppendEntriesRequest {
        &self.request
    }

    /// The peer's response, available once `wait` returned `Ok`.
    pub fn response(&self) -> Option<AppendEntriesResponse> {
        match self.outcome.peek() {
            Some(Ok(response)) => Some(response),
            _ => None,
        }
    }
}

impl fmt::Debug for AppendFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppendFuture")
            .field("start", &self.start)
            .field("request", &self.request)
            .field("resolved", &self.outcome.peek().is_some())
            .finish()
    }
}

/// A submitted call owned by the session until it is resolved.
struct InFlightAppend {
    future: AppendFuture,
    promise: Promise<TransportResult<AppendEntriesResponse>>,
    // Admission slot, released when the call is resolved.
    _permit: OwnedSemaphorePermit,
}

impl InFlightAppend {
    fn resolve(self, result: TransportResult<AppendEntriesResponse>) -> AppendFuture {
        self.promise.resolve(result);
        self.future
    }
}

/// A long-lived AppendEntries session to one peer.
///
/// At most `depth` calls await a response at any time; `append_entries`
/// blocks once that bound is reached, which is how a slow peer throttles the
/// replication rate. Successful calls are also published, in order, on
/// `consumer`, which must be drained for the session to make progress.
pub struct AppendPipeline {
    peer: String,
    cancel: CancellationToken,
    closed: CancellationToken,
    permits: Arc<Semaphore>,
    submit_tx: mpsc::Sender<InFlightAppend>,
    done_rx: mpsc::Receiver<AppendFuture>,
}

impl AppendPipeline {
    /// Spawns the session loops over an already opened stream.
    pub(crate) fn start<S>(
        peer: String,
        cancel: CancellationToken,
        request_tx: mpsc::Sender<wire::AppendEntriesRequest>,
        responses: S,
        depth: usize,
    ) -> Self
    where
        S: Stream<Item = Result<wire::AppendEntriesPipelineResponse, Status>> + Send + Unpin + 'static,
    {
        let depth = depth.max(1);
        let permits = Arc::new(Semaphore::new(depth));
        let closed = CancellationToken::new();
        let (submit_tx, submit_rx) = mpsc::channel(depth);
        let (done_tx, done_rx) = mpsc::channel(depth);

        let session = Session {
            peer: peer.clone(),
            cancel: cancel.clone(),
            closed: closed.clone(),
            permits: permits.clone(),
            depth,
        };
        tokio::spawn(session.run(submit_rx, request_tx, responses, done_tx));

        Self {
            peer,
            cancel,
            closed,
            permits,
            submit_tx,
            done_rx,
        }
    }

    /// Submits a call without waiting for earlier calls to be answered.
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> TransportResult<AppendFuture> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            permit = self.permits.clone().acquire_owned() => permit.map_err(|_| TransportError::Cancelled)?,
        };

        let (promise, outcome) = future::promise();
        let future = AppendFuture {
            start: Instant::now(),
            request: Arc::new(request),
            outcome,
        };
        let call = InFlightAppend {
            future: future.clone(),
            promise,
            _permit: permit,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            sent = self.submit_tx.send(call) => sent.map_err(|_| TransportError::Cancelled)?,
        }
        Ok(future)
    }

    /// Calls that completed successfully, in submission order.
    pub fn consumer(&mut self) -> &mut mpsc::Receiver<AppendFuture> {
        &mut self.done_rx
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Cancels the session. Outstanding calls are resolved asynchronously.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once both loops exited and every outstanding call was resolved.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl Drop for AppendPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Session {
    peer: String,
    cancel: CancellationToken,
    closed: CancellationToken,
    permits: Arc<Semaphore>,
    depth: usize,
}

impl Session {
    async fn run<S>(
        self,
        mut submit_rx: mpsc::Receiver<InFlightAppend>,
        request_tx: mpsc::Sender<wire::AppendEntriesRequest>,
        mut responses: S,
        done_tx: mpsc::Sender<AppendFuture>,
    ) where
        S: Stream<Item = Result<wire::AppendEntriesPipelineResponse, Status>> + Unpin,
    {
        let (inflight_tx, mut inflight_rx) = mpsc::channel(self.depth);
        // Whichever loop exits first stops the other one.
        let (sent, received) = tokio::join!(
            async {
                let err = send_loop(&self.cancel, &mut submit_rx, &inflight_tx, &request_tx).await;
                self.cancel.cancel();
                err
            },
            async {
                let err = receive_loop(&self.cancel, &mut inflight_rx, &mut responses, &done_tx).await;
                self.cancel.cancel();
                err
            },
        );
        let err = terminal_error(sent, received);
        if err.is_cancelled() {
            debug!("Append pipeline to {} closed", self.peer);
        } else {
            warn!("Append pipeline to {} failed: {err}", self.peer);
        }

        // Stop admission, then resolve in-flight calls before queued ones.
        self.permits.close();
        submit_rx.close();
        inflight_rx.close();
        drop(request_tx);
        let mut drained = 0usize;
        while let Ok(call) = inflight_rx.try_recv() {
            call.resolve(Err(err.clone()));
            drained += 1;
        }
        while let Ok(call) = submit_rx.try_recv() {
            call.resolve(Err(err.clone()));
            drained += 1;
        }
        if drained > 0 {
            debug!("Resolved {drained} outstanding calls on append pipeline to {}", self.peer);
        }
        self.closed.cancel();
    }
}

/// The failure that triggered teardown wins over the cancellation it caused.
fn terminal_error(sent: TransportError, received: TransportError) -> TransportError {
    match (sent, received) {
        (TransportError::Cancelled, received) => received,
        (sent, _) => sent,
    }
}

async fn send_loop(
    cancel: &CancellationToken,
    submit_rx: &mut mpsc::Receiver<InFlightAppend>,
    inflight_tx: &mpsc::Sender<InFlightAppend>,
    request_tx: &mpsc::Sender<wire::AppendEntriesRequest>,
) -> TransportError {
    loop {
        let call = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TransportError::Cancelled,
            call = submit_rx.recv() => match call {
                Some(call) => call,
                None => return TransportError::Cancelled,
            },
        };
        let request = wire::AppendEntriesRequest::from(call.future.request());

        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            slot = inflight_tx.reserve() => slot.map_err(|_| TransportError::Cancelled),
        };
        match slot {
            Ok(slot) => slot.send(call),
            Err(err) => {
                call.resolve(Err(err.clone()));
                return err;
            }
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TransportError::Cancelled,
            sent = request_tx.send(request) => sent,
        };
        if sent.is_err() {
            return TransportError::Transport(Status::unavailable("append pipeline request stream closed"));
        }
    }
}

async fn receive_loop<S>(
    cancel: &CancellationToken,
    inflight_rx: &mut mpsc::Receiver<InFlightAppend>,
    responses: &mut S,
    done_tx: &mpsc::Sender<AppendFuture>,
) -> TransportError
where
    S: Stream<Item = Result<wire::AppendEntriesPipelineResponse, Status>> + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TransportError::Cancelled,
            message = responses.next() => message,
        };
        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(status)) => return TransportError::from(status),
            None => return TransportError::Transport(Status::unavailable("append pipeline closed by peer")),
        };

        // The send loop queues a call before writing it, so its entry is
        // already here when the matching response arrives.
        let Ok(call) = inflight_rx.try_recv() else {
            return TransportError::ProtocolViolation("append pipeline response without an in-flight request".to_string());
        };
        if !message.error.is_empty() {
            let err = TransportError::Remote(message.error);
            call.resolve(Err(err.clone()));
            return err;
        }
        let Some(response) = message.response else {
            let err = TransportError::ProtocolViolation("append pipeline frame carries neither response nor error".to_string());
            call.resolve(Err(err.clone()));
            return err;
        };

        let future = call.resolve(Ok(response.into()));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return TransportError::Cancelled,
            sent = done_tx.send(future) => {
                if sent.is_err() {
                    return TransportError::Cancelled;
                }
            }
        }
    }
}
