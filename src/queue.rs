//! # Worker Work Queue Module
//!
//! Every worker thread owns exactly one [`WorkQueue`]: a multi-producer /
//! single-consumer FIFO with two push channels of differentiated priority.
//!
//! - The **control channel** carries typed control commands (create/delete
//!   MSU, attach routes, stop). It never drops: control flow is bounded by
//!   the controller's own rate, so the channel grows unboundedly.
//! - The **data channel** carries message envelopes and is bounded. A push
//!   against a full queue fails with `QueueFull`; the default sender policy
//!   is to drop the envelope and count it, which together with
//!   shortest-queue routing is the core's only backpressure mechanism.
//!
//! Control is drained before any data on the same tick. Ordering is FIFO
//! per channel for any single producer; there is no ordering guarantee
//! across producers.
//!
//! ## Implementation Notes
//!
//! Both channels are lock-free (`crossbeam` `ArrayQueue` / `SegQueue`);
//! pushes may come from any thread, pops only from the owning worker. The
//! queue also owns the parking primitive for its worker: producers call
//! [`WorkQueue::notify`] after a push, and the idle worker parks on the
//! internal condvar with a timeout. `len()` is intentionally approximate:
//! it backs the shortest-queue routing strategy, which tolerates staleness.

use crate::error::{CoreError, CoreResult};
use crate::message::Envelope;
use crate::worker::ControlCommand;
use crossbeam::queue::{ArrayQueue, SegQueue};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One unit of work popped from the queue.
#[derive(Debug)]
pub enum Work {
    Control(ControlCommand),
    Data(Envelope),
}

/// Bounded MPSC queue with a prioritized, unbounded control side.
pub struct WorkQueue {
    capacity: usize,
    data: ArrayQueue<Envelope>,
    ctrl: SegQueue<ControlCommand>,
    dropped: AtomicU64,
    park_lock: Mutex<()>,
    park_cv: Condvar,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: ArrayQueue::new(capacity),
            ctrl: SegQueue::new(),
            dropped: AtomicU64::new(0),
            park_lock: Mutex::new(()),
            park_cv: Condvar::new(),
        }
    }

    /// Enqueue a data envelope.
    ///
    /// Fails with [`CoreError::QueueFull`] when the data channel is at
    /// capacity. The envelope is dropped and counted; callers that want a
    /// different policy must clone before pushing.
    pub fn push_data(&self, env: Envelope) -> CoreResult<()> {
        match self.data.push(env) {
            Ok(()) => {
                self.notify();
                Ok(())
            }
            Err(_rejected) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::QueueFull {
                    capacity: self.capacity,
                })
            }
        }
    }

    /// Enqueue a control command. Never fails.
    pub fn push_ctrl(&self, cmd: ControlCommand) {
        self.ctrl.push(cmd);
        self.notify();
    }

    /// Non-blocking pop from the control channel.
    pub fn pop_ctrl(&self) -> Option<ControlCommand> {
        self.ctrl.pop()
    }

    /// Non-blocking pop from the data channel.
    pub fn pop_data(&self) -> Option<Envelope> {
        self.data.pop()
    }

    /// Non-blocking pop honoring channel priority: control before data.
    pub fn next_work(&self) -> Option<Work> {
        if let Some(cmd) = self.ctrl.pop() {
            return Some(Work::Control(cmd));
        }
        self.data.pop().map(Work::Data)
    }

    /// Approximate data-channel length.
    ///
    /// May be stale by the time the caller acts on it; that is acceptable
    /// for its consumers (shortest-queue routing, diagnostics, stats).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.ctrl.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of data envelopes dropped against a full queue.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Park the calling (owning) worker until new work arrives or the
    /// timeout elapses. Returns immediately if work is already queued.
    pub fn park(&self, timeout: Duration) {
        let mut guard = self.park_lock.lock();
        // Re-check under the lock so a push between the caller's empty
        // check and this park cannot be missed.
        if !self.is_empty() {
            return;
        }
        self.park_cv.wait_for(&mut guard, timeout);
    }

    /// Wake the owning worker. Called by every producer after a push.
    pub fn notify(&self) {
        let _guard = self.park_lock.lock();
        self.park_cv.notify_all();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("capacity", &self.capacity)
            .field("data_len", &self.data.len())
            .field("ctrl_len", &self.ctrl.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
