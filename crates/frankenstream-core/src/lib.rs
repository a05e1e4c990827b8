//! # frankenstream-core
//!
//! Safe Rust mode engine for buffered I/O streams.
//!
//! Before every read or write a stream is brought into the right mode: its
//! buffer sized on first use, pending output flushed or read-ahead rolled
//! back when the direction changes, coprocess descriptors swapped, and the
//! stream promoted within its pool. This crate holds the state machine and
//! its resource managers; real descriptor I/O is plugged in through the
//! traits in [`backend`]. No `unsafe` code is permitted at the crate level.

#![deny(unsafe_code)]

pub mod backend;
pub mod buffer;
pub mod config;
pub mod coproc;
pub mod disc;
pub mod engine;
pub mod errno;
pub mod error;
mod exit;
pub mod memio;
mod mode;
pub mod pool;
pub mod process;
pub mod reserve;
pub mod sigpipe;
pub mod stream;

pub use backend::{BufferSizer, ExitHook, LowLevelIo, PoolMover, ProcessReaper, SizeRequest, Whence};
pub use buffer::{BufferGrant, BufferKind, Window};
pub use config::EngineConfig;
pub use coproc::{Coprocess, ExitStatus};
pub use disc::{Discipline, Event, Notify};
pub use engine::{EXITING, Engine, EngineBuilder};
pub use error::{Result, StreamError};
pub use pool::{Pool, PoolId};
pub use sigpipe::{Disposition, HandlerId, SigpipeGate, SigpipeGuard, SigpipePolicy};
pub use stream::{Capabilities, Direction, Freeze, Phase, Stream, StreamId, StreamState, Wanted};
