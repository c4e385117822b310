//! Handoff and flow control between tracking and the local-mapping back-end.
//!
//! The back-end runs on its own thread; coordination happens through a small
//! set of atomic bits plus a bounded keyframe queue. `LocalMapperLink` is the
//! concrete wiring used in-process; tests drive the same type directly.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, warn};

use crate::map::KeyFrameId;

/// Capacity of the tracking → local-mapping keyframe queue.
const KEYFRAME_QUEUE_CAPACITY: usize = 5;

/// Tracking-side contract of the local-mapping back-end.
pub trait LocalMapping: Send + Sync {
    /// Enqueue a freshly created keyframe for back-end processing.
    fn insert_keyframe(&self, kf_id: KeyFrameId);

    /// Ask a running bundle adjustment to yield for the new keyframe.
    fn interrupt_ba(&self);

    /// Whether the back-end is idle enough to take keyframes.
    fn accept_keyframes(&self) -> bool;

    fn is_stopped(&self) -> bool;

    fn stop_requested(&self) -> bool;

    /// Guard keyframe creation against a concurrent stop. Setting `true`
    /// fails when the back-end has already committed to stopping.
    fn set_not_stop(&self, value: bool) -> bool;

    fn keyframes_in_queue(&self) -> usize;

    fn request_reset(&self);
}

/// Channel/atomics implementation of [`LocalMapping`].
///
/// The tracking side only uses the trait; the back-end side drains
/// [`LocalMapperLink::receiver`] and flips the state bits.
pub struct LocalMapperLink {
    queue_tx: Sender<KeyFrameId>,
    queue_rx: Receiver<KeyFrameId>,

    accept_keyframes: AtomicBool,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    not_stop: AtomicBool,
    abort_ba: AtomicBool,
    reset_requested: AtomicBool,
}

impl LocalMapperLink {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = bounded(KEYFRAME_QUEUE_CAPACITY);
        Self {
            queue_tx,
            queue_rx,
            accept_keyframes: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            not_stop: AtomicBool::new(false),
            abort_ba: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Back-end side
    // ─────────────────────────────────────────────────────────────────────

    /// Queue endpoint for the back-end thread.
    pub fn receiver(&self) -> &Receiver<KeyFrameId> {
        &self.queue_rx
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accept_keyframes.store(value, Ordering::SeqCst);
    }

    /// Request the back-end to stop (e.g. before a loop-closure correction).
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Commit the stop unless keyframe creation holds the not-stop guard.
    /// Returns whether the back-end is now stopped.
    pub fn try_stop(&self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) && !self.not_stop.load(Ordering::SeqCst) {
            self.stopped.store(true, Ordering::SeqCst);
            debug!("local mapping stopped");
            return true;
        }
        false
    }

    /// Resume after a stop.
    pub fn release(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    /// Consume the BA interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.abort_ba.swap(false, Ordering::SeqCst)
    }

    /// Consume a pending reset request.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }
}

impl Default for LocalMapperLink {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMapping for LocalMapperLink {
    fn insert_keyframe(&self, kf_id: KeyFrameId) {
        // A new keyframe preempts the running local BA.
        self.abort_ba.store(true, Ordering::SeqCst);
        if self.queue_tx.try_send(kf_id).is_err() {
            // Queue full: the keyframe stays in the map, only the back-end
            // processing of it is skipped.
            warn!(keyframe = %kf_id, "keyframe queue full, dropping handoff");
        }
    }

    fn interrupt_ba(&self) {
        self.abort_ba.store(true, Ordering::SeqCst);
    }

    fn accept_keyframes(&self) -> bool {
        self.accept_keyframes.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn set_not_stop(&self, value: bool) -> bool {
        if value && self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.not_stop.store(value, Ordering::SeqCst);
        true
    }

    fn keyframes_in_queue(&self) -> usize {
        self.queue_rx.len()
    }

    fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }
}
