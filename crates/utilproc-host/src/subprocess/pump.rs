//! Chunked output pump for one piped stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};
use utilproc_core::multiplexer::StreamKind;
use utilproc_core::{Chunk, HostEvent, StreamData};

fn event(kind: StreamKind, data: StreamData) -> HostEvent {
    match kind {
        StreamKind::Stdout => HostEvent::Stdout(data),
        StreamKind::Stderr => HostEvent::Stderr(data),
    }
}

/// Read `reader` until end of stream, one chunk at a time.
///
/// After each chunk the pump waits for its resume callback before reading
/// again. Once `reaped` turns `true` it stops waiting and drains the pipe so
/// the exit notification cannot be held back by a reader that stopped
/// consuming. A dropped resume callback means nobody listens anymore; the
/// pump then stops without sending `End`.
pub async fn pump<R>(
    mut reader: R,
    kind: StreamKind,
    chunk_size: usize,
    events: mpsc::UnboundedSender<HostEvent>,
    mut reaped: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let stream = kind.as_str();
    let mut draining = false;
    loop {
        let mut buf = BytesMut::with_capacity(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => trace!(stream, bytes = n, "Read chunk"),
            Err(e) => {
                warn!(stream, error = %e, "Worker output read failed");
                break;
            }
        }

        let (resume_tx, mut resume_rx) = oneshot::channel();
        let data = StreamData::with_resume(Chunk::Data(buf.freeze()), move || {
            let _ = resume_tx.send(());
        });
        if events.send(event(kind, data)).is_err() {
            return;
        }
        if draining {
            continue;
        }

        tokio::select! {
            resumed = &mut resume_rx => if resumed.is_err() {
                debug!(stream, "Resume callback dropped, stopping pump");
                return;
            },
            () = wait_reaped(&mut reaped) => {
                debug!(stream, "Worker reaped, draining remaining output");
                draining = true;
            }
        }
    }
    let _ = events.send(event(kind, StreamData::new(Chunk::End)));
}

async fn wait_reaped(reaped: &mut watch::Receiver<bool>) {
    let _ = reaped.wait_for(|reaped| *reaped).await;
}
