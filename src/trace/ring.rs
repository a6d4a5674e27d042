//! Bounded lock-free handoff buffer for finished spans.
//!
//! Many threads finish spans concurrently while a single reporter drains, so
//! the buffer is a bounded MPMC array queue used MPSC-style. A full buffer
//! drops the offered span: under reporter back-pressure the finish path stays
//! wait-free and its tail latency deterministic, and the loss is observable
//! through the tracer's dropped-span counter.

use crossbeam_queue::ArrayQueue;

use crate::trace::FinishedSpan;

pub(crate) struct SpanRing {
    queue: ArrayQueue<FinishedSpan>,
}

impl SpanRing {
    pub(crate) fn new(capacity: usize) -> SpanRing {
        SpanRing {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Offers a finished span. Returns `false` when the ring is full and the
    /// span was dropped.
    pub(crate) fn offer(&self, span: FinishedSpan) -> bool {
        self.queue.push(span).is_ok()
    }

    /// Pops every span currently buffered. Safe against concurrent offers;
    /// spans offered while draining may be picked up by the next drain.
    pub(crate) fn drain(&self) -> Vec<FinishedSpan> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(span) = self.queue.pop() {
            drained.push(span);
        }
        drained
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}
