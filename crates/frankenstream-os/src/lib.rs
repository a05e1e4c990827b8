//! # frankenstream-os
//!
//! Host bindings for `frankenstream-core`: descriptor I/O, SIGPIPE control,
//! child reaping, and exit-time flushing, all through `libc`.

pub mod fd;
pub mod process;
pub mod signal;

use std::sync::{Arc, Once};

use frankenstream_core::{Engine, EngineBuilder, EngineConfig};

pub use fd::FdIo;
pub use process::{AtexitHook, WaitpidReaper};
pub use signal::{LibcSigpipe, host_sigpipe_gate, send_signal};

/// An engine builder wired to the host, configured from the environment.
/// Every engine built from it shares the host SIGPIPE gate and is flushed
/// at process exit while it is alive.
#[must_use]
pub fn engine_builder() -> EngineBuilder {
    Engine::builder()
        .config(EngineConfig::from_env())
        .io(Arc::new(FdIo))
        .reaper(Arc::new(WaitpidReaper))
        .exit_hook(Arc::new(AtexitHook))
        .sigpipe_gate(Arc::clone(host_sigpipe_gate()))
}

/// The global engine, host-backed unless another engine was installed
/// first.
pub fn global_engine() -> &'static Arc<Engine> {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if Engine::install_global(engine_builder().build()).is_err() {
            log::debug!("global engine already installed; keeping it");
        }
    });
    Engine::global()
}
