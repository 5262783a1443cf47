//! How readers sleep, how writers wake them, and what happens to bad
//! frames.
//!
//! The channel itself only does the two-step wait opt-in bookkeeping; the
//! actual blocking and the invalid-frame reaction are policy. Production
//! channels park on a named semaphore and drop corrupt frames; the
//! in-process test channel spins and treats a corrupt frame as a bug.

use std::sync::Arc;

use mlos_primitives::NamedSemaphore;
use mlos_primitives::sync::spin_loop;

/// Sleep/wake and invalid-frame behavior for one channel.
pub trait WakePolicy: Send + Sync {
    /// Wake a reader blocked in [`WakePolicy::wait_for_frame`].
    fn notify_reader(&self);

    /// Block until a writer signals; spurious wakeups are fine, the
    /// channel re-checks its state after every return.
    fn wait_for_frame(&self);

    /// A claimed frame failed type or variable-length verification.
    fn invalid_frame(&self);
}

/// Policy for channels whose readers live in the same process.
///
/// There is no external process to signal, so waiting is a spin and an
/// invalid frame is a programming error worth stopping the test for.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessWake;

impl WakePolicy for InProcessWake {
    fn notify_reader(&self) {}

    fn wait_for_frame(&self) {
        spin_loop();
    }

    fn invalid_frame(&self) {
        panic!("received an invalid frame on an in-process channel");
    }
}

/// Policy for inter-process channels: a named semaphore wakes the peer.
///
/// Signal or wait failure means the synchronization object is gone while
/// shared state may be half-updated; continuing would hang or corrupt the
/// peer, so the process terminates. An invalid frame, by contrast, says
/// nothing about the next frame: log it and move on.
pub struct SemaphoreWake {
    event: Arc<NamedSemaphore>,
}

impl SemaphoreWake {
    pub fn new(event: Arc<NamedSemaphore>) -> Self {
        Self { event }
    }

    pub fn event(&self) -> &Arc<NamedSemaphore> {
        &self.event
    }
}

impl WakePolicy for SemaphoreWake {
    fn notify_reader(&self) {
        if let Err(err) = self.event.signal() {
            tracing::error!(event = self.event.name(), %err, "channel event signal failed");
            std::process::abort();
        }
    }

    fn wait_for_frame(&self) {
        if let Err(err) = self.event.wait() {
            tracing::error!(event = self.event.name(), %err, "channel event wait failed");
            std::process::abort();
        }
    }

    fn invalid_frame(&self) {
        tracing::warn!("dropping invalid frame on inter-process channel");
    }
}

/// The policy used by `MlosContext`-owned channels; which variant a
/// context builds depends on how its regions were sourced.
pub enum ChannelWake {
    InProcess(InProcessWake),
    Semaphore(SemaphoreWake),
}

impl ChannelWake {
    pub fn in_process() -> Self {
        ChannelWake::InProcess(InProcessWake)
    }

    pub fn semaphore(event: Arc<NamedSemaphore>) -> Self {
        ChannelWake::Semaphore(SemaphoreWake::new(event))
    }
}

impl WakePolicy for ChannelWake {
    fn notify_reader(&self) {
        match self {
            ChannelWake::InProcess(p) => p.notify_reader(),
            ChannelWake::Semaphore(p) => p.notify_reader(),
        }
    }

    fn wait_for_frame(&self) {
        match self {
            ChannelWake::InProcess(p) => p.wait_for_frame(),
            ChannelWake::Semaphore(p) => p.wait_for_frame(),
        }
    }

    fn invalid_frame(&self) {
        match self {
            ChannelWake::InProcess(p) => p.invalid_frame(),
            ChannelWake::Semaphore(p) => p.invalid_frame(),
        }
    }
}
