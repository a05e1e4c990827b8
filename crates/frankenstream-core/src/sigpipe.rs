//! Reference-counted SIGPIPE suppression.
//!
//! Writing to a coprocess that exited would otherwise kill the whole process.
//! While at least one coprocess stream needs it, the gate keeps the engine's
//! ignore handler installed. The disposition found at the 0 -> 1 transition is
//! saved and put back when the count returns to zero, unless someone else
//! replaced our handler in the meantime.
//!
//! A user handler found at the first acquire is left in place: the user
//! already decided what SIGPIPE does.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Opaque identity of a user-installed handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId {
    pub addr: usize,
    pub flags: i32,
}

/// A SIGPIPE disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `SIG_DFL`: terminate the process.
    Default,
    /// The engine's ignore handler.
    Engine,
    /// Anything else the process installed.
    Custom(HandlerId),
}

/// Reads and replaces the process-wide SIGPIPE disposition.
pub trait SigpipePolicy: Send + Sync {
    fn current(&self) -> Disposition;

    /// Install `disposition`, returning the one it replaced.
    fn install(&self, disposition: Disposition) -> Disposition;
}

/// Disposition held in memory; nothing reaches the kernel.
#[derive(Debug)]
pub struct VirtualSigpipe {
    slot: Mutex<Disposition>,
}

impl VirtualSigpipe {
    #[must_use]
    pub fn new(initial: Disposition) -> Self {
        Self {
            slot: Mutex::new(initial),
        }
    }
}

impl Default for VirtualSigpipe {
    fn default() -> Self {
        Self::new(Disposition::Default)
    }
}

impl SigpipePolicy for VirtualSigpipe {
    fn current(&self) -> Disposition {
        *self.slot.lock()
    }

    fn install(&self, disposition: Disposition) -> Disposition {
        std::mem::replace(&mut *self.slot.lock(), disposition)
    }
}

#[derive(Debug)]
struct GateState {
    holders: usize,
    saved: Disposition,
    restorations: u64,
}

/// Counts coprocess streams that need SIGPIPE ignored.
pub struct SigpipeGate {
    policy: Box<dyn SigpipePolicy>,
    state: Mutex<GateState>,
}

impl fmt::Debug for SigpipeGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigpipeGate")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SigpipeGate {
    #[must_use]
    pub fn new(policy: Box<dyn SigpipePolicy>) -> Self {
        Self {
            policy,
            state: Mutex::new(GateState {
                holders: 0,
                saved: Disposition::Default,
                restorations: 0,
            }),
        }
    }

    pub fn policy(&self) -> &dyn SigpipePolicy {
        self.policy.as_ref()
    }

    /// Take one suppression hold; released when the guard drops.
    pub fn acquire(self: &Arc<Self>) -> SigpipeGuard {
        let mut state = self.state.lock();
        if state.holders == 0 {
            let previous = self.policy.install(Disposition::Engine);
            match previous {
                Disposition::Custom(_) => {
                    self.policy.install(previous);
                    log::debug!("SIGPIPE: keeping user handler {previous:?}");
                }
                Disposition::Engine => {
                    log::warn!("SIGPIPE: engine handler already installed at first hold");
                }
                Disposition::Default => {}
            }
            state.saved = if previous == Disposition::Engine {
                Disposition::Default
            } else {
                previous
            };
        }
        state.holders += 1;
        SigpipeGuard {
            gate: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.holders = state.holders.saturating_sub(1);
        if state.holders > 0 {
            return;
        }
        match self.policy.current() {
            Disposition::Engine => {
                self.policy.install(state.saved);
                state.restorations += 1;
            }
            other => log::debug!("SIGPIPE: handler replaced by {other:?}; leaving it"),
        }
    }

    /// Outstanding holds.
    pub fn holders(&self) -> usize {
        self.state.lock().holders
    }

    /// Times the saved disposition was put back.
    pub fn restorations(&self) -> u64 {
        self.state.lock().restorations
    }
}

/// One suppression hold.
#[derive(Debug)]
pub struct SigpipeGuard {
    gate: Arc<SigpipeGate>,
}

impl Drop for SigpipeGuard {
    fn drop(&mut self) {
        self.gate.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(initial: Disposition) -> Arc<SigpipeGate> {
        Arc::new(SigpipeGate::new(Box::new(VirtualSigpipe::new(initial))))
    }

    #[test]
    fn nested_holds_restore_once() {
        let g = gate(Disposition::Default);
        let guards: Vec<_> = (0..3).map(|_| g.acquire()).collect();
        assert_eq!(g.policy().current(), Disposition::Engine);
        assert_eq!(g.holders(), 3);
        let mut guards = guards.into_iter();
        drop(guards.next());
        drop(guards.next());
        assert_eq!(g.policy().current(), Disposition::Engine);
        assert_eq!(g.restorations(), 0);
        drop(guards.next());
        assert_eq!(g.policy().current(), Disposition::Default);
        assert_eq!(g.restorations(), 1);
    }

    #[test]
    fn user_handler_is_honored() {
        let user = Disposition::Custom(HandlerId { addr: 0x1000, flags: 0 });
        let g = gate(user);
        let guard = g.acquire();
        assert_eq!(g.policy().current(), user);
        drop(guard);
        assert_eq!(g.policy().current(), user);
        assert_eq!(g.restorations(), 0);
    }

    #[test]
    fn replaced_handler_is_left_alone() {
        let g = gate(Disposition::Default);
        let guard = g.acquire();
        let other = Disposition::Custom(HandlerId { addr: 0x2000, flags: 4 });
        g.policy().install(other);
        drop(guard);
        assert_eq!(g.policy().current(), other);
        assert_eq!(g.restorations(), 0);
    }
}
