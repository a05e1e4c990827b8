//! The engine handle.
//!
//! An [`Engine`] owns everything that is process-wide in a classic stdio
//! layer: the pool registry, the default pool, the exiting flag, SIGPIPE
//! bookkeeping, and the collaborators that perform real I/O. Tests build
//! private engines; `frankenstream-os` installs a libc-backed one as the
//! global engine.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use crate::backend::{
    BufferSizer, DefaultSizer, DetachedIo, ExitHook, LowLevelIo, ManualExit, NoReaper, PoolMover,
    ProcessReaper, SwapToHead,
};
use crate::buffer::{BufferGrant, BufferKind, Window};
use crate::config::EngineConfig;
use crate::disc::Notify;
use crate::error::{Result, StreamError};
use crate::pool::{Pool, PoolId};
use crate::sigpipe::{SigpipeGate, SigpipePolicy, VirtualSigpipe};
use crate::stream::{Capabilities, Stream, StreamId, StreamState};

/// Value of the exiting flag once process exit has begun.
pub const EXITING: i32 = 1001;

static GLOBAL: OnceLock<Arc<Engine>> = OnceLock::new();

/// Process-wide stream engine state.
pub struct Engine {
    this: Weak<Engine>,
    config: EngineConfig,
    io: Arc<dyn LowLevelIo>,
    sizer: Arc<dyn BufferSizer>,
    mover: Arc<dyn PoolMover>,
    reaper: Arc<dyn ProcessReaper>,
    exit_hook: Arc<dyn ExitHook>,
    sigpipe: Arc<SigpipeGate>,
    pools: Mutex<Vec<Weak<Pool>>>,
    default_pool: OnceLock<Arc<Pool>>,
    exit_hook_once: Once,
    exiting: AtomicI32,
    notifier: RwLock<Option<Arc<dyn Notify>>>,
    next_stream: AtomicU64,
    next_pool: AtomicUsize,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("pools", &self.pools().len())
            .field("exiting", &self.exiting.load(Ordering::Relaxed))
            .field("sigpipe", &self.sigpipe)
            .finish_non_exhaustive()
    }
}

impl Engine {
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// An engine with default collaborators: string streams only, no
    /// process support, manual exit flushing.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// The process-global engine, built from the environment on first use
    /// unless [`Engine::install_global`] ran first.
    pub fn global() -> &'static Arc<Engine> {
        GLOBAL.get_or_init(|| Self::builder().config(EngineConfig::from_env()).build())
    }

    /// Install `engine` as the global engine. Fails, handing the engine back,
    /// if a global engine already exists.
    pub fn install_global(engine: Arc<Engine>) -> std::result::Result<&'static Arc<Engine>, Arc<Engine>> {
        GLOBAL.set(engine)?;
        Ok(Self::global())
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn io(&self) -> &dyn LowLevelIo {
        self.io.as_ref()
    }

    pub fn sizer(&self) -> &dyn BufferSizer {
        self.sizer.as_ref()
    }

    pub fn mover(&self) -> &dyn PoolMover {
        self.mover.as_ref()
    }

    pub fn reaper(&self) -> &dyn ProcessReaper {
        self.reaper.as_ref()
    }

    pub fn sigpipe(&self) -> &Arc<SigpipeGate> {
        &self.sigpipe
    }

    pub fn notifier(&self) -> Option<Arc<dyn Notify>> {
        self.notifier.read().clone()
    }

    pub fn set_notifier(&self, notifier: Option<Arc<dyn Notify>>) {
        *self.notifier.write() = notifier;
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire) != 0
    }

    pub fn exiting_code(&self) -> i32 {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn begin_exit(&self) {
        self.exiting.store(EXITING, Ordering::Release);
    }

    pub(crate) fn allocate_id(&self) -> StreamId {
        StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed))
    }

    /// The inline fallback buffer.
    pub(crate) fn tiny_grant(&self) -> Result<BufferGrant> {
        let size = self.config.tiny_size.max(1);
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| StreamError::exhausted("tiny buffer", size))?;
        data.resize(size, 0);
        Ok(BufferGrant {
            data,
            kind: BufferKind::Tiny,
        })
    }

    // -----------------------------------------------------------------------
    // Pools
    // -----------------------------------------------------------------------

    /// Create an empty pool and add it to the registry the exit flusher walks.
    /// The registry holds it weakly: a pool lives while its creator or one of
    /// its members does.
    pub fn new_pool(&self) -> Arc<Pool> {
        let pool = Arc::new(Pool::new(PoolId(self.next_pool.fetch_add(1, Ordering::Relaxed))));
        let mut pools = self.pools.lock();
        pools.retain(|p| p.strong_count() > 0);
        pools.push(Arc::downgrade(&pool));
        pool
    }

    /// The pool streams join on their first mode request.
    pub fn default_pool(&self) -> Arc<Pool> {
        Arc::clone(self.default_pool.get_or_init(|| self.new_pool()))
    }

    /// Snapshot of every live registered pool.
    pub fn pools(&self) -> Vec<Arc<Pool>> {
        self.pools.lock().iter().filter_map(Weak::upgrade).collect()
    }

    /// Append the stream to `pool` (or the default pool). The first
    /// registration installs the exit hook.
    pub(crate) fn register(&self, state: &mut StreamState, pool: Option<Arc<Pool>>) -> Result<()> {
        let pool = pool.unwrap_or_else(|| self.default_pool());
        self.exit_hook_once.call_once(|| {
            if !self.exit_hook.install(self.this.clone()) {
                log::debug!("exit hook not installed; exit flushing is manual");
            }
        });
        pool.append(Arc::clone(&state.key), state.this.clone())?;
        state.pool = Some(pool);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stream construction
    // -----------------------------------------------------------------------

    /// A stream over an open descriptor.
    pub fn open_fd(self: &Arc<Self>, fd: i32, caps: Capabilities) -> Arc<Stream> {
        let caps = Capabilities { string: false, ..caps };
        Stream::create(self, caps, Some(fd), Window::unbuffered(), None)
    }

    /// A string stream over `buffer`, whose first `len` bytes are content.
    pub fn open_string(self: &Arc<Self>, buffer: Vec<u8>, len: usize, caps: Capabilities) -> Arc<Stream> {
        let len = len.min(buffer.len());
        let window = Window::from_grant(BufferGrant {
            data: buffer,
            kind: BufferKind::External,
        });
        Stream::create(self, caps.string(), None, window, Some(len as i64))
    }

    /// A stream talking to child `pid` through its read and/or write pipe
    /// ends. With both ends, the stream starts on the read end.
    pub fn open_coprocess(
        self: &Arc<Self>,
        pid: i32,
        read_fd: Option<i32>,
        write_fd: Option<i32>,
    ) -> Result<Arc<Stream>> {
        let caps = Capabilities {
            readable: read_fd.is_some(),
            writable: write_fd.is_some(),
            ..Capabilities::default()
        };
        let (active, alternate) = match (read_fd, write_fd) {
            (Some(r), Some(w)) => (r, Some(w)),
            (Some(fd), None) | (None, Some(fd)) => (fd, None),
            (None, None) => return Err(StreamError::Closed),
        };
        let stream = Stream::create(self, caps, Some(active), Window::unbuffered(), None);
        stream.attach_coprocess(alternate, Some(pid), false)?;
        Ok(stream)
    }

    // -----------------------------------------------------------------------
    // Bulk operations
    // -----------------------------------------------------------------------

    /// Flush every unfrozen stream in every pool. Streams whose lock is held
    /// elsewhere are skipped. Returns the number of flushes that failed.
    pub fn sync_all(&self) -> usize {
        let mut failures = 0;
        for pool in self.pools() {
            pool.walk(|stream| {
                let Some(mut state) = stream.try_lock() else {
                    return;
                };
                if !state.is_frozen()
                    && let Err(e) = state.flush_local()
                {
                    log::debug!("{}: flush failed: {e}", state.id());
                    failures += 1;
                }
            });
        }
        failures
    }
}

/// Configures an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    io: Option<Arc<dyn LowLevelIo>>,
    sizer: Option<Arc<dyn BufferSizer>>,
    mover: Option<Arc<dyn PoolMover>>,
    reaper: Option<Arc<dyn ProcessReaper>>,
    exit_hook: Option<Arc<dyn ExitHook>>,
    sigpipe: Option<Box<dyn SigpipePolicy>>,
    sigpipe_gate: Option<Arc<SigpipeGate>>,
}

impl fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn io(mut self, io: Arc<dyn LowLevelIo>) -> Self {
        self.io = Some(io);
        self
    }

    #[must_use]
    pub fn sizer(mut self, sizer: Arc<dyn BufferSizer>) -> Self {
        self.sizer = Some(sizer);
        self
    }

    #[must_use]
    pub fn mover(mut self, mover: Arc<dyn PoolMover>) -> Self {
        self.mover = Some(mover);
        self
    }

    #[must_use]
    pub fn reaper(mut self, reaper: Arc<dyn ProcessReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    #[must_use]
    pub fn exit_hook(mut self, hook: Arc<dyn ExitHook>) -> Self {
        self.exit_hook = Some(hook);
        self
    }

    /// Give the engine a private SIGPIPE gate over `policy`. Only for
    /// policies that do not touch the real process disposition; engines
    /// sharing the host disposition must share one gate.
    #[must_use]
    pub fn sigpipe(mut self, policy: Box<dyn SigpipePolicy>) -> Self {
        self.sigpipe = Some(policy);
        self
    }

    /// Share `gate` with other engines. Takes precedence over
    /// [`sigpipe`](Self::sigpipe).
    #[must_use]
    pub fn sigpipe_gate(mut self, gate: Arc<SigpipeGate>) -> Self {
        self.sigpipe_gate = Some(gate);
        self
    }

    #[must_use]
    pub fn build(self) -> Arc<Engine> {
        let sigpipe = match self.sigpipe_gate {
            Some(gate) => gate,
            None => Arc::new(SigpipeGate::new(
                self.sigpipe.unwrap_or_else(|| Box::new(VirtualSigpipe::default())),
            )),
        };
        Arc::new_cyclic(|this| Engine {
            this: this.clone(),
            config: self.config.unwrap_or_default(),
            io: self.io.unwrap_or_else(|| Arc::new(DetachedIo)),
            sizer: self.sizer.unwrap_or_else(|| Arc::new(DefaultSizer)),
            mover: self.mover.unwrap_or_else(|| Arc::new(SwapToHead)),
            reaper: self.reaper.unwrap_or_else(|| Arc::new(NoReaper)),
            exit_hook: self.exit_hook.unwrap_or_else(|| Arc::new(ManualExit)),
            sigpipe,
            pools: Mutex::new(Vec::new()),
            default_pool: OnceLock::new(),
            exit_hook_once: Once::new(),
            exiting: AtomicI32::new(0),
            notifier: RwLock::new(None),
            next_stream: AtomicU64::new(1),
            next_pool: AtomicUsize::new(0),
        })
    }
}
