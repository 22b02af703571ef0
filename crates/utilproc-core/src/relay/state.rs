//! Lock-free relay state machine.
//!
//! Reconciles a push-based upstream (chunks plus a "you may send more"
//! callback) with a pull-based downstream that answers every push with
//! whether it still wants data. The two sides only meet in [`RelayCore::drain`].
//!
//! Nothing here invokes foreign code except [`Downstream::push`]; resume
//! callbacks are handed back as [`Resumes`] so the caller can run them after
//! releasing whatever lock guards the core.

use std::collections::VecDeque;

use tracing::{trace, warn};

use crate::events::{Chunk, ResumeCallback};

/// Consumer side of a relay.
pub trait Downstream {
    /// Hand one item to the consumer. Returns whether it still wants more.
    fn push(&mut self, chunk: Chunk) -> bool;
}

/// Resume callbacks released by a drain, to be run outside any lock.
#[must_use = "resume callbacks must be run or the upstream stalls"]
#[derive(Default)]
pub struct Resumes(Vec<ResumeCallback>);

impl Resumes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Invoke every released callback in delivery order.
    pub fn run(self) {
        for resume in self.0 {
            resume();
        }
    }
}

/// Relay state: FIFO of pending chunks, readiness flag, pending resumes.
pub struct RelayCore<D> {
    queue: VecDeque<Chunk>,
    ready: bool,
    resumes: Vec<ResumeCallback>,
    ended: bool,
    closed: bool,
    downstream: D,
}

impl<D: Downstream> RelayCore<D> {
    pub const fn new(downstream: D) -> Self {
        Self {
            queue: VecDeque::new(),
            ready: false,
            resumes: Vec::new(),
            ended: false,
            closed: false,
            downstream,
        }
    }

    /// Queue a chunk from the upstream and try to hand it on.
    ///
    /// The queue is unbounded; the upstream is throttled only through
    /// `resume`, which is held until everything queued so far reached the
    /// consumer while it is still ready.
    pub fn deliver(&mut self, chunk: Chunk, resume: Option<ResumeCallback>) -> Resumes {
        if self.closed || self.ended {
            // Dropping `resume` unblocks nothing: the stream is finished.
            if matches!(chunk, Chunk::Data(_)) {
                warn!(bytes = chunk.len(), "Chunk delivered after end of stream dropped");
            }
            return Resumes::default();
        }
        self.queue.push_back(chunk);
        if let Some(resume) = resume {
            self.resumes.push(resume);
        }
        self.drain()
    }

    /// The consumer is ready for data.
    pub fn request_more(&mut self) -> Resumes {
        if self.closed || self.ended {
            return Resumes::default();
        }
        self.ready = true;
        self.drain()
    }

    fn drain(&mut self) -> Resumes {
        while self.ready {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            let is_end = matches!(chunk, Chunk::End);
            self.ready = self.downstream.push(chunk);
            if is_end {
                self.finish();
                return Resumes::default();
            }
        }
        trace!(
            queued = self.queue.len(),
            ready = self.ready,
            pending_resumes = self.resumes.len(),
            "Relay drained"
        );
        if self.ready && !self.resumes.is_empty() {
            return Resumes(std::mem::take(&mut self.resumes));
        }
        Resumes::default()
    }

    fn finish(&mut self) {
        self.ended = true;
        self.ready = false;
        self.resumes.clear();
        if !self.queue.is_empty() {
            warn!(queued = self.queue.len(), "Chunks queued behind end of stream dropped");
            self.queue.clear();
        }
    }

    /// Detach from the upstream. Idempotent.
    ///
    /// Pending resume callbacks are dropped. Chunks still queued are handed
    /// to the consumer regardless of readiness, followed by end of stream,
    /// so nothing the worker wrote is lost.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.resumes.clear();
        while let Some(chunk) = self.queue.pop_front() {
            let is_end = matches!(chunk, Chunk::End);
            self.downstream.push(chunk);
            if is_end {
                self.ended = true;
                break;
            }
        }
        self.queue.clear();
        if !self.ended {
            self.downstream.push(Chunk::End);
            self.ended = true;
        }
        self.ready = false;
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub const fn is_ready(&self) -> bool {
        self.ready
    }

    pub const fn is_ended(&self) -> bool {
        self.ended
    }

    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_resumes(&self) -> usize {
        self.resumes.len()
    }

    pub const fn downstream(&self) -> &D {
        &self.downstream
    }

    pub const fn downstream_mut(&mut self) -> &mut D {
        &mut self.downstream
    }
}
