use std::sync::Arc;

use frankenstream_core::{Capabilities, Engine, PoolMover, Stream, StreamError, StreamId, Wanted};

fn strings(engine: &Arc<Engine>, n: usize) -> Vec<Arc<Stream>> {
    (0..n)
        .map(|_| engine.open_string(vec![0; 8], 0, Capabilities::read_write()))
        .collect()
}

fn ids(streams: &[Arc<Stream>]) -> Vec<StreamId> {
    streams.iter().map(|s| s.id()).collect()
}

#[test]
fn first_request_joins_the_default_pool_in_order() {
    for (count, capacity) in [(3, 3), (4, 7), (15, 15)] {
        let engine = Engine::new();
        let streams = strings(&engine, count);
        for s in &streams {
            s.request_mode(Wanted::READ).unwrap();
        }
        let pool = engine.default_pool();
        assert_eq!(pool.len(), count, "count={count}");
        assert_eq!(pool.capacity(), capacity, "count={count}");
        assert_eq!(pool.order(), ids(&streams), "count={count}");
    }
}

#[test]
fn second_request_does_not_register_again() {
    let engine = Engine::new();
    let s = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    s.request_mode(Wanted::READ).unwrap();
    s.request_mode(Wanted::WRITE).unwrap();
    s.request_mode(Wanted::READ).unwrap();
    assert_eq!(engine.default_pool().len(), 1);
}

#[test]
fn walk_sees_streams_appended_mid_walk() {
    let engine = Engine::new();
    let streams = strings(&engine, 2);
    for s in &streams {
        s.request_mode(Wanted::READ).unwrap();
    }
    let pool = engine.default_pool();
    let mut visited = Vec::new();
    let mut extra = Vec::new();
    pool.walk(|s| {
        visited.push(s.id());
        if extra.is_empty() {
            let late = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
            late.request_mode(Wanted::READ).unwrap();
            extra.push(late);
        }
    });
    assert_eq!(visited.len(), 3);
    assert_eq!(visited[2], extra[0].id());
}

#[test]
fn dropped_streams_leave_their_pool() {
    let engine = Engine::new();
    let mut streams = strings(&engine, 3);
    for s in &streams {
        s.request_mode(Wanted::READ).unwrap();
    }
    let gone = streams.remove(1).id();
    let pool = engine.default_pool();
    assert_eq!(pool.len(), 2);
    assert!(!pool.contains(gone));
    assert_eq!(pool.order(), ids(&streams));
    let mut visited = 0;
    pool.walk(|_| visited += 1);
    assert_eq!(visited, 2);
}

#[test]
fn unused_pools_drop_out_of_the_registry() {
    let engine = Engine::new();
    let kept = engine.new_pool();
    let member = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    {
        let joined = engine.new_pool();
        member.join_pool(&joined).unwrap();
        let _idle = engine.new_pool();
        assert_eq!(engine.pools().len(), 3);
    }
    // The pool with a member lives on through it.
    assert_eq!(engine.pools().len(), 2);
    drop(member);
    assert_eq!(engine.pools().len(), 1);
    assert!(std::sync::Arc::ptr_eq(&engine.pools()[0], &kept));
}

#[test]
fn flagged_stream_is_promoted_on_its_next_request() {
    let engine = Engine::new();
    let pool = engine.new_pool();
    let a = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    let b = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    a.join_pool(&pool).unwrap();
    b.join_pool(&pool).unwrap();
    assert_eq!(pool.head(), Some(a.id()));
    assert!(!a.key().awaiting_head());
    assert!(b.key().awaiting_head());

    b.request_mode(Wanted::READ).unwrap();
    assert_eq!(pool.head(), Some(b.id()));
    assert!(!b.key().awaiting_head());
    assert!(a.key().awaiting_head());

    a.request_mode(Wanted::WRITE).unwrap();
    assert_eq!(pool.head(), Some(a.id()));
    assert!(b.key().awaiting_head());
}

#[test]
fn joining_another_pool_leaves_the_first() {
    let engine = Engine::new();
    let s = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    s.request_mode(Wanted::READ).unwrap();
    let other = engine.new_pool();
    s.join_pool(&other).unwrap();
    assert!(engine.default_pool().is_empty());
    assert_eq!(other.order(), vec![s.id()]);
    assert!(!s.key().awaiting_head());
    s.join_pool(&other).unwrap();
    assert_eq!(other.len(), 1);
}

struct Refusing;

impl PoolMover for Refusing {
    fn move_to_head(&self, _pool: &frankenstream_core::Pool, _id: StreamId) -> frankenstream_core::Result<()> {
        Err(StreamError::Blocked)
    }
}

#[test]
fn promotion_failure_fails_the_request() {
    let engine = Engine::builder().mover(Arc::new(Refusing)).build();
    let pool = engine.new_pool();
    let a = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    let b = engine.open_string(vec![0; 8], 0, Capabilities::read_write());
    a.join_pool(&pool).unwrap();
    b.join_pool(&pool).unwrap();

    assert!(b.request_mode(Wanted::READ).unwrap_err().is_blocked());
    assert!(b.key().awaiting_head());
    a.request_mode(Wanted::READ).unwrap();
}
