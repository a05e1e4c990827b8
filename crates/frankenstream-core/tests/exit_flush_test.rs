use std::sync::Arc;

use parking_lot::Mutex;

use frankenstream_core::memio::MemIo;
use frankenstream_core::{
    BufferKind, Capabilities, Discipline, EXITING, Engine, EngineConfig, Event, Freeze, LowLevelIo,
    Phase, StreamState, Wanted,
};

fn engine_with(io: &Arc<MemIo>) -> Arc<Engine> {
    Engine::builder()
        .io(Arc::clone(io) as Arc<dyn LowLevelIo>)
        .config(EngineConfig {
            buffer_size: 8,
            ..EngineConfig::default()
        })
        .build()
}

#[test]
fn pending_output_is_flushed_and_buffer_dropped() {
    let io = Arc::new(MemIo::new());
    let fd = io.create_file(b"");
    let engine = engine_with(&io);
    let s = engine.open_fd(fd, Capabilities::write_only());
    s.write(b"abc").unwrap();

    engine.run_exit_flush();
    assert_eq!(engine.exiting_code(), EXITING);
    assert_eq!(io.contents(fd).unwrap(), b"abc");
    assert_eq!(s.buffer_kind(), BufferKind::Unbuffered);

    // Anything written after exit began goes straight out.
    s.write(b"d").unwrap();
    assert_eq!(io.contents(fd).unwrap(), b"abcd");
}

#[test]
fn readable_writable_stream_is_turned_around() {
    let io = Arc::new(MemIo::new());
    let fd = io.create_file(b"hello");
    let engine = engine_with(&io);
    let s = engine.open_fd(fd, Capabilities::read_write());
    let mut buf = [0u8; 2];
    s.read(&mut buf).unwrap();

    engine.run_exit_flush();
    let state = s.lock();
    assert_eq!(state.phase(), Phase::Write);
    assert_eq!(io.position(fd), Some(2));
    assert_eq!(state.window().kind(), BufferKind::Unbuffered);
    assert!(!state.is_frozen());
}

#[test]
fn busy_stream_is_skipped() {
    let io = Arc::new(MemIo::new());
    let fd = io.create_file(b"");
    let engine = engine_with(&io);
    let s = engine.open_fd(fd, Capabilities::write_only());
    s.write(b"abc").unwrap();

    let held = s.lock();
    engine.run_exit_flush();
    assert!(io.contents(fd).unwrap().is_empty());
    drop(held);
    assert_eq!(s.buffer_kind(), BufferKind::Owned);
}

#[test]
fn frozen_stream_is_skipped() {
    let io = Arc::new(MemIo::new());
    let fd = io.create_file(b"");
    let engine = engine_with(&io);
    let s = engine.open_fd(fd, Capabilities::write_only());
    s.write(b"abc").unwrap();
    s.lock().freeze(Freeze::Peek);

    engine.run_exit_flush();
    assert!(io.contents(fd).unwrap().is_empty());
    assert_eq!(s.lock().pending(), 3);
}

#[derive(Default)]
struct Events(Mutex<Vec<Event>>);

impl Discipline for Events {
    fn exception(&self, stream: &mut StreamState, event: Event) -> i32 {
        assert!(stream.is_frozen(), "flusher holds the lock bit during the hook");
        self.0.lock().push(event);
        0
    }
}

#[test]
fn discipline_hears_about_exit() {
    let engine = Engine::new();
    let s = engine.open_string(vec![0; 4], 0, Capabilities::read_write());
    let events = Arc::new(Events::default());
    s.set_discipline(Some(events.clone()));
    s.request_mode(Wanted::WRITE).unwrap();

    engine.run_exit_flush();
    assert_eq!(events.0.lock().as_slice(), &[Event::AtExit]);
    // String streams keep their buffer.
    assert_eq!(s.buffer_kind(), BufferKind::External);
    assert!(!s.lock().is_frozen());
}

#[test]
fn pool_flag_survives_the_exit_pass() {
    let io = Arc::new(MemIo::new());
    let engine = engine_with(&io);
    let pool = engine.new_pool();
    let a = engine.open_fd(io.create_file(b""), Capabilities::read_write());
    let b = engine.open_fd(io.create_file(b""), Capabilities::read_write());
    a.join_pool(&pool).unwrap();
    b.join_pool(&pool).unwrap();
    assert!(b.key().awaiting_head());

    engine.run_exit_flush();
    assert_eq!(pool.head(), Some(a.id()));
    assert!(b.key().awaiting_head());
    assert_eq!(b.lock().phase(), Phase::Write);
}

#[test]
fn streams_initialized_after_exit_are_unbuffered() {
    let io = Arc::new(MemIo::new());
    let fd = io.create_file(b"");
    let engine = engine_with(&io);
    engine.run_exit_flush();

    let s = engine.open_fd(fd, Capabilities::write_only());
    s.write(b"late").unwrap();
    assert_eq!(s.buffer_kind(), BufferKind::Unbuffered);
    assert_eq!(io.contents(fd).unwrap(), b"late");
}

#[test]
fn exit_pass_over_two_pools_skips_only_the_frozen_stream() {
    let io = Arc::new(MemIo::new());
    let engine = engine_with(&io);
    let (held_pool, live_pool) = (engine.new_pool(), engine.new_pool());

    let frozen_fd = io.create_file(b"");
    let frozen = engine.open_fd(frozen_fd, Capabilities::write_only());
    frozen.join_pool(&held_pool).unwrap();
    frozen.write(b"keep").unwrap();
    frozen.lock().freeze(Freeze::Lock);

    let live_fd = io.create_file(b"");
    let live = engine.open_fd(live_fd, Capabilities::read_write());
    live.join_pool(&live_pool).unwrap();
    live.write(b"out").unwrap();

    engine.run_exit_flush();
    assert_eq!(engine.exiting_code(), EXITING);

    assert!(io.contents(frozen_fd).unwrap().is_empty());
    assert_eq!(frozen.lock().pending(), 4);
    assert_eq!(frozen.buffer_kind(), BufferKind::Owned);

    assert_eq!(io.contents(live_fd).unwrap(), b"out");
    assert_eq!(live.buffer_kind(), BufferKind::Unbuffered);
    assert_eq!(live.lock().phase(), Phase::Write);
    assert!(!live.lock().is_frozen());
    frozen.lock().thaw(Freeze::Lock);
}
