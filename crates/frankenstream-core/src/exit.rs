//! Process-exit flushing.
//!
//! At exit every writable stream is pushed into write mode and left
//! unbuffered, so whatever the process writes from here on reaches its
//! descriptor. Streams held by another thread or frozen are skipped rather
//! than waited for.

use crate::disc::Event;
use crate::engine::Engine;
use crate::stream::{Direction, StreamState, Wanted};

impl Engine {
    /// Run the exit flusher. Registered with the host by the engine's
    /// [`ExitHook`](crate::backend::ExitHook); safe to call directly.
    pub fn run_exit_flush(&self) {
        self.begin_exit();
        let failures = self.sync_all();
        if failures > 0 {
            log::debug!("exit: {failures} streams failed to flush");
        }

        for pool in self.pools() {
            pool.walk(|stream| {
                let Some(mut state) = stream.try_lock() else {
                    log::debug!("exit: {} busy, skipped", stream.id());
                    return;
                };
                prepare_for_exit(&mut state);
            });
        }
    }
}

fn prepare_for_exit(state: &mut StreamState) {
    if state.is_frozen() {
        return;
    }
    state.bits.lock = true;
    if let Some(discipline) = state.discipline.clone() {
        discipline.exception(state, Event::AtExit);
    }
    if state.caps.string {
        state.bits.lock = false;
        return;
    }

    let awaiting = state.key.take_awaiting_head();
    if state.caps.writable
        && state.direction != Direction::Write
        && let Err(e) = state.request_mode_local(Wanted::WRITE)
    {
        log::debug!("exit: {} could not enter write mode: {e}", state.id());
    }
    let window = &state.window;
    let drop_buffer = !window.is_unbuffered()
        && (window.is_mapped() || (state.direction == Direction::Write && window.next() == 0));
    if drop_buffer && let Err(e) = state.set_unbuffered_local() {
        log::debug!("exit: {} could not drop its buffer: {e}", state.id());
    }
    state.key.set_awaiting_head(awaiting);
    state.bits.lock = false;
}
