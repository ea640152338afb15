//! Bounded per-session event buffer with drop-oldest overflow.
//!
//! The transport read loop pushes here and never blocks; if the
//! normalizer falls behind, the oldest buffered events are discarded and
//! counted rather than stalling the transport (a stalled read loop times
//! out the upstream heartbeat and forces a reconnect, which loses more).

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::adapter::StreamEvent;
use crate::metrics::ArenaMetrics;

pub(crate) struct SessionBuffer {
    inner: Mutex<VecDeque<StreamEvent>>,
    capacity: usize,
    metrics: Arc<ArenaMetrics>,
}

impl SessionBuffer {
    pub(crate) fn new(capacity: usize, metrics: Arc<ArenaMetrics>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<StreamEvent>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues an event, evicting the oldest one when full.
    pub(crate) fn push(&self, event: StreamEvent) {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
    }

    pub(crate) fn pop(&self) -> Option<StreamEvent> {
        self.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
