//! Caller-supplied hooks.

use crate::stream::{Direction, StreamId, StreamState};

/// Why a discipline's exception hook is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Event {
    /// A mode request found the stream frozen.
    Locked,
    /// The process-exit flusher is about to touch the stream.
    AtExit,
}

/// Per-stream exception hook.
///
/// For [`Event::Locked`] the return value steers the request: negative aborts
/// it with that code; otherwise the request proceeds if the stream is no
/// longer frozen, fails if the hook returned zero, and asks again if it
/// returned a positive value.
pub trait Discipline: Send + Sync {
    fn exception(&self, stream: &mut StreamState, event: Event) -> i32;
}

/// Observer told about every failed mode request.
pub trait Notify: Send + Sync {
    fn mode_failed(&self, stream: StreamId, wanted: Direction, fd: Option<i32>);
}
