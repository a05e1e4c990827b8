//! Child reaping and the process-exit hook.

use std::ffi::c_int;
use std::io;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use frankenstream_core::{Engine, ExitHook, ProcessReaper};

/// Blocking `waitpid` on a specific child.
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitpidReaper;

impl ProcessReaper for WaitpidReaper {
    fn wait(&self, pid: i32) -> io::Result<i32> {
        let mut status: c_int = 0;
        // SAFETY: `status` is a live local the kernel writes into.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(status)
    }
}

/// Engines whose pools are flushed at process exit.
static EXIT_ENGINES: Mutex<Vec<Weak<Engine>>> = Mutex::new(Vec::new());

extern "C" fn flush_registered_engines() {
    let engines: Vec<Arc<Engine>> = EXIT_ENGINES.lock().iter().filter_map(Weak::upgrade).collect();
    for engine in engines {
        engine.run_exit_flush();
    }
}

fn register_with_atexit() -> bool {
    static REGISTERED: OnceLock<bool> = OnceLock::new();
    *REGISTERED.get_or_init(|| {
        // SAFETY: `flush_registered_engines` is a plain function valid for
        // the life of the process.
        let ok = unsafe { libc::atexit(flush_registered_engines) } == 0;
        if !ok {
            log::warn!("atexit registration failed; streams will not be flushed at exit");
        }
        ok
    })
}

/// Flushes every engine it was installed for when the process exits. One
/// `atexit` registration serves all of them.
#[derive(Debug, Default, Clone, Copy)]
pub struct AtexitHook;

impl ExitHook for AtexitHook {
    fn install(&self, engine: Weak<Engine>) -> bool {
        if !register_with_atexit() {
            return false;
        }
        let mut engines = EXIT_ENGINES.lock();
        engines.retain(|e| e.strong_count() > 0);
        engines.push(engine);
        true
    }
}
