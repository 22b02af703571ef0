//! Shared relay handles: the producer-side [`Relay`] and the consumer-side
//! [`OutputStream`].
//!
//! Both wrap the same [`RelayCore`] behind a mutex. Resume callbacks are
//! always run after the lock is released, so an upstream that delivers the
//! next chunk synchronously from inside its callback does not deadlock.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use tokio_stream::{Stream, StreamExt};

use super::state::{Downstream, RelayCore, Resumes};
use crate::events::{Chunk, StreamData};

/// Consumer-side buffer with a byte high-water mark.
#[derive(Debug)]
pub(crate) struct ReadBuffer {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    high_water_mark: usize,
    ended: bool,
    /// One entry per reader handle waiting on this stream.
    wakers: Vec<Waker>,
}

impl ReadBuffer {
    const fn new(high_water_mark: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            high_water_mark,
            ended: false,
            wakers: Vec::new(),
        }
    }

    fn pop(&mut self) -> Option<Bytes> {
        let bytes = self.chunks.pop_front()?;
        self.buffered -= bytes.len();
        Some(bytes)
    }

    const fn wants_more(&self) -> bool {
        !self.ended && self.buffered < self.high_water_mark
    }

    fn register(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|w| w.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    fn wake(&mut self) {
        for waker in self.wakers.drain(..) {
            waker.wake();
        }
    }
}

impl Downstream for ReadBuffer {
    fn push(&mut self, chunk: Chunk) -> bool {
        match chunk {
            Chunk::Data(bytes) => {
                if !bytes.is_empty() {
                    self.buffered += bytes.len();
                    self.chunks.push_back(bytes);
                }
                self.wake();
                self.buffered < self.high_water_mark
            }
            Chunk::End => {
                self.ended = true;
                self.wake();
                false
            }
        }
    }
}

type Shared = Arc<Mutex<RelayCore<ReadBuffer>>>;

fn lock(shared: &Shared) -> MutexGuard<'_, RelayCore<ReadBuffer>> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Producer side of one piped output stream.
///
/// Owned by the event router; consumers only ever see an [`OutputStream`].
#[derive(Clone)]
pub struct Relay {
    shared: Shared,
}

impl Relay {
    pub fn new(high_water_mark: usize) -> Self {
        Self {
            shared: Arc::new(Mutex::new(RelayCore::new(ReadBuffer::new(
                high_water_mark.max(1),
            )))),
        }
    }

    /// Append a chunk from the worker and drain as far as the reader allows.
    pub fn deliver(&self, data: StreamData) {
        let resumes = lock(&self.shared).deliver(data.chunk, data.resume);
        resumes.run();
    }

    /// Mark the reader ready and drain.
    pub fn request_more(&self) {
        let resumes = lock(&self.shared).request_more();
        resumes.run();
    }

    /// Detach from the worker. Idempotent.
    pub fn close(&self) {
        lock(&self.shared).close();
    }

    /// Chunks waiting for the reader to become ready.
    pub fn queued(&self) -> usize {
        lock(&self.shared).queued()
    }

    /// Pull-based read handle for consumers.
    pub fn reader(&self) -> OutputStream {
        OutputStream {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = lock(&self.shared);
        f.debug_struct("Relay")
            .field("queued", &core.queued())
            .field("ready", &core.is_ready())
            .field("ended", &core.is_ended())
            .field("closed", &core.is_closed())
            .finish()
    }
}

/// Outcome of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Bytes),
    /// Nothing buffered yet; more was requested from the worker.
    Pending,
    /// End of stream reached and everything was read.
    End,
}

/// Pull-based byte stream of a worker's stdout or stderr.
///
/// Reading is what asks the worker for more: nothing flows until the first
/// read, and the worker is paused whenever more than the high-water mark is
/// buffered here. Finite once end of stream is reached, not restartable.
#[derive(Clone)]
pub struct OutputStream {
    shared: Shared,
}

impl OutputStream {
    /// Take the next buffered chunk without waiting.
    pub fn try_read(&self) -> ReadOutcome {
        self.read_inner(None)
    }

    fn read_inner(&self, waker: Option<&Waker>) -> ReadOutcome {
        let mut resumes = Resumes::default();
        let outcome = {
            let mut core = lock(&self.shared);
            let mut item = core.downstream_mut().pop();
            if core.downstream().wants_more() {
                resumes = core.request_more();
                if item.is_none() {
                    item = core.downstream_mut().pop();
                }
            }
            match item {
                Some(bytes) => ReadOutcome::Data(bytes),
                None if core.downstream().ended => ReadOutcome::End,
                None => {
                    if let Some(waker) = waker {
                        core.downstream_mut().register(waker);
                    }
                    ReadOutcome::Pending
                }
            }
        };
        resumes.run();
        outcome
    }

    /// Bytes buffered on the reader side.
    pub fn buffered(&self) -> usize {
        lock(&self.shared).downstream().buffered
    }

    /// Whether the worker signalled end of stream.
    pub fn is_ended(&self) -> bool {
        lock(&self.shared).downstream().ended
    }

    /// Collect the remaining stream into one buffer.
    pub async fn read_to_end(mut self) -> Bytes {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

impl Stream for OutputStream {
    type Item = Bytes;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.read_inner(Some(cx.waker())) {
            ReadOutcome::Data(bytes) => Poll::Ready(Some(bytes)),
            ReadOutcome::End => Poll::Ready(None),
            ReadOutcome::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = lock(&self.shared);
        f.debug_struct("OutputStream")
            .field("buffered", &core.downstream().buffered)
            .field("ended", &core.downstream().ended)
            .finish()
    }
}
