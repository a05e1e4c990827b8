//! SIGPIPE disposition and signal delivery through libc.

use std::ffi::c_int;
use std::io;
use std::sync::{Arc, OnceLock};

use frankenstream_core::process::{SIGPIPE, valid_signal};
use frankenstream_core::{Disposition, HandlerId, SigpipeGate, SigpipePolicy};

/// Installed while coprocess writers are live. A handler rather than
/// `SIG_IGN`, so children exec'd meanwhile start with the default action.
extern "C" fn ignore_sigpipe(_sig: c_int) {}

fn engine_handler() -> libc::sighandler_t {
    ignore_sigpipe as extern "C" fn(c_int) as libc::sighandler_t
}

fn classify(act: &libc::sigaction) -> Disposition {
    match act.sa_sigaction {
        libc::SIG_DFL => Disposition::Default,
        h if h == engine_handler() => Disposition::Engine,
        h => Disposition::Custom(HandlerId {
            addr: h,
            flags: act.sa_flags,
        }),
    }
}

fn action_for(disposition: Disposition) -> libc::sigaction {
    // SAFETY: an all-zero sigaction is a valid "default, no flags" value.
    let mut act = unsafe { std::mem::zeroed::<libc::sigaction>() };
    match disposition {
        Disposition::Default => act.sa_sigaction = libc::SIG_DFL,
        Disposition::Engine => act.sa_sigaction = engine_handler(),
        Disposition::Custom(h) => {
            act.sa_sigaction = h.addr;
            act.sa_flags = h.flags;
        }
    }
    // SAFETY: `act.sa_mask` is a valid sigset_t owned by `act`.
    unsafe { libc::sigemptyset(&mut act.sa_mask) };
    act
}

/// The process's real SIGPIPE disposition. Only reachable through
/// [`host_sigpipe_gate`], so every engine counts holds in one place.
#[derive(Debug)]
pub struct LibcSigpipe {
    _private: (),
}

/// The one gate over the host disposition, shared by every host engine.
pub fn host_sigpipe_gate() -> &'static Arc<SigpipeGate> {
    static GATE: OnceLock<Arc<SigpipeGate>> = OnceLock::new();
    GATE.get_or_init(|| Arc::new(SigpipeGate::new(Box::new(LibcSigpipe { _private: () }))))
}

impl SigpipePolicy for LibcSigpipe {
    fn current(&self) -> Disposition {
        // SAFETY: zeroed sigaction is valid; a null `act` only queries.
        let mut old = unsafe { std::mem::zeroed::<libc::sigaction>() };
        if unsafe { libc::sigaction(SIGPIPE, std::ptr::null(), &mut old) } != 0 {
            log::warn!("querying SIGPIPE failed: {}", io::Error::last_os_error());
            return Disposition::Default;
        }
        classify(&old)
    }

    fn install(&self, disposition: Disposition) -> Disposition {
        let act = action_for(disposition);
        // SAFETY: zeroed sigaction is valid; both pointers are live locals.
        let mut old = unsafe { std::mem::zeroed::<libc::sigaction>() };
        if unsafe { libc::sigaction(SIGPIPE, &act, &mut old) } != 0 {
            log::warn!(
                "installing SIGPIPE {disposition:?} failed: {}",
                io::Error::last_os_error()
            );
            return self.current();
        }
        classify(&old)
    }
}

/// Deliver `sig` to `pid`.
pub fn send_signal(pid: i32, sig: i32) -> io::Result<()> {
    if !valid_signal(sig) {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    // SAFETY: kill takes no pointers.
    if unsafe { libc::kill(pid, sig) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_signal_is_rejected() {
        let err = send_signal(1, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn dispositions_round_trip_through_sigaction_structs() {
        assert_eq!(classify(&action_for(Disposition::Default)), Disposition::Default);
        assert_eq!(classify(&action_for(Disposition::Engine)), Disposition::Engine);
        let custom = Disposition::Custom(HandlerId {
            addr: libc::SIG_IGN,
            flags: libc::SA_RESTART,
        });
        assert_eq!(classify(&action_for(custom)), custom);
    }

    #[test]
    fn host_gate_is_a_single_instance() {
        assert!(Arc::ptr_eq(host_sigpipe_gate(), host_sigpipe_gate()));
    }

    #[test]
    fn disposition_stays_ignored_while_any_engine_holds() {
        let a = crate::engine_builder().build();
        let b = crate::engine_builder().build();
        assert!(Arc::ptr_eq(a.sigpipe(), b.sigpipe()));

        // The Rust runtime starts with SIGPIPE ignored; start from the default.
        let before = a.sigpipe().policy().install(Disposition::Default);
        let held_a = a.sigpipe().acquire();
        let held_b = b.sigpipe().acquire();
        drop(held_a);
        assert_eq!(b.sigpipe().policy().current(), Disposition::Engine);
        drop(held_b);
        assert_eq!(b.sigpipe().policy().current(), Disposition::Default);
        a.sigpipe().policy().install(before);
    }
}
