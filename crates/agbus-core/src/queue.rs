//! Bounded frame FIFOs between the hardware pump thread and the core
//!
//! The two queues (inbound and outbound) are the only state shared across threads. The inbound
//! producer rejects the newest frame when full and counts the drop; the outbound consumers use
//! [free_space](FrameQueue::free_space) for back-pressure and never need eviction, but
//! [push_evicting](FrameQueue::push_evicting) exists for producers that prefer freshness.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::frame::CanFrame;

/// A bounded MPSC frame queue
#[derive(Debug)]
pub struct FrameQueue {
    capacity: usize,
    inner: Mutex<VecDeque<CanFrame>>,
    dropped: AtomicU64,
}

impl FrameQueue {
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a frame, rejecting it if the queue is full
    ///
    /// Rejected frames are counted in [dropped](FrameQueue::dropped).
    pub fn try_push(&self, frame: CanFrame) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= self.capacity {
            drop(inner);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Frame queue full ({} frames); dropping frame {:?}",
                self.capacity,
                frame.id
            );
            false
        } else {
            inner.push_back(frame);
            true
        }
    }

    /// Append a frame, evicting the oldest queued frame if the queue is full
    pub fn push_evicting(&self, frame: CanFrame) {
        let mut inner = self.inner.lock().unwrap();
        if inner.len() >= self.capacity {
            let evicted = inner.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Frame queue full ({} frames); evicting oldest frame {:?}",
                self.capacity,
                evicted.map(|f| f.id)
            );
        }
        inner.push_back(frame);
    }

    pub fn pop(&self) -> Option<CanFrame> {
        self.inner.lock().unwrap().pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many more frames fit before the queue is full
    #[must_use]
    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    /// Total frames dropped (rejected or evicted) since construction
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
