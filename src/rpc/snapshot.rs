//! Chunked InstallSnapshot transfer.
//!
//! The client sends one header frame followed by the payload in fixed-size
//! data frames and then waits for a single response. The server side turns
//! the remaining frames back into one sequential byte source. A failed
//! transfer is never resumed.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::debug;

use crate::errors::{TransportError, TransportResult};
use crate::raft::message::{InstallSnapshotRequest, InstallSnapshotResponse};
use crate::rpc::raft::install_snapshot_stream::Payload;
use crate::rpc::raft::InstallSnapshotStream;
use crate::rpc::rpc_client::RaftGrpcClientStub;

/// Frames buffered between the payload reader and the gRPC body.
const SNAPSHOT_FRAME_BUFFER: usize = 4;

/// Streams `request` and the whole of `data` to a peer.
pub(crate) async fn send_snapshot<R>(
    client: &RaftGrpcClientStub,
    request: &InstallSnapshotRequest,
    mut data: R,
    chunk_size: usize,
) -> TransportResult<InstallSnapshotResponse>
where
    R: AsyncRead + Unpin,
{
    let (frame_tx, frame_rx) = mpsc::channel(SNAPSHOT_FRAME_BUFFER);
    let header = InstallSnapshotStream {
        payload: Some(Payload::Request(request.into())),
    };

    let feed = async move {
        if frame_tx.send(header).await.is_err() {
            return Ok(());
        }
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut sent = 0usize;
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let frame = InstallSnapshotStream {
                payload: Some(Payload::Data(buf[..n].to_vec())),
            };
            // A closed body means the call already failed; its status wins.
            if frame_tx.send(frame).await.is_err() {
                return Ok(());
            }
            sent += n;
        }
        debug!(bytes = sent, "Snapshot payload fully queued");
        // Dropping the sender closes the send side of the call.
        Ok::<(), TransportError>(())
    };
    let call = async {
        client
            .install_snapshot(ReceiverStream::new(frame_rx))
            .await
            .map_err(TransportError::from)
    };

    let ((), response) = tokio::try_join!(feed, call)?;
    Ok(response.into())
}

/// Sequential byte source over the data frames of an InstallSnapshot stream.
///
/// Leftover bytes of a partially consumed frame are returned first. The end
/// of the frame stream is reported as end-of-file.
pub struct SnapshotReader<S> {
    frames: S,
    leftover: Vec<u8>,
    offset: usize,
}

impl<S> SnapshotReader<S> {
    pub fn new(frames: S) -> Self {
        Self {
            frames,
            leftover: Vec::new(),
            offset: 0,
        }
    }
}

impl<S> AsyncRead for SnapshotReader<S>
where
    S: Stream<Item = Result<InstallSnapshotStream, Status>> + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.offset < this.leftover.len() {
                let n = buf.remaining().min(this.leftover.len() - this.offset);
                buf.put_slice(&this.leftover[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.frames).poll_next(cx)) {
                Some(Ok(InstallSnapshotStream {
                    payload: Some(Payload::Data(chunk)),
                })) => {
                    // Empty chunks would read as EOF, skip them.
                    this.leftover = chunk;
                    this.offset = 0;
                }
                Some(Ok(InstallSnapshotStream {
                    payload: Some(Payload::Request(_)),
                })) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unexpected snapshot header after the first frame",
                    )));
                }
                Some(Ok(InstallSnapshotStream { payload: None })) => {}
                Some(Err(status)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, status))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}
