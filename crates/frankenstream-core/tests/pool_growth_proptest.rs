use std::sync::Arc;

use proptest::prelude::*;

use frankenstream_core::pool::{INLINE_SLOTS, grown_capacity};
use frankenstream_core::{Capabilities, Engine, StreamId, Wanted};

#[derive(Debug, Clone)]
enum Op {
    Join,
    Leave(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![3 => Just(Op::Join), 1 => (0usize..64).prop_map(Op::Leave)]
}

proptest! {
    #[test]
    fn pool_order_and_capacity_follow_the_model(ops in proptest::collection::vec(op(), 1..80)) {
        let engine = Engine::new();
        let pool = engine.new_pool();
        let mut live = Vec::new();
        let mut model: Vec<StreamId> = Vec::new();
        let mut capacity = 0usize;

        for op in ops {
            match op {
                Op::Join => {
                    let s = engine.open_string(vec![0; 4], 0, Capabilities::read_write());
                    s.join_pool(&pool).unwrap();
                    if model.len() >= capacity {
                        capacity = grown_capacity(capacity);
                    }
                    model.push(s.id());
                    live.push(s);
                }
                Op::Leave(i) if !live.is_empty() => {
                    let s = live.remove(i % live.len());
                    s.close().unwrap();
                    model.retain(|id| *id != s.id());
                }
                Op::Leave(_) => {}
            }
            prop_assert_eq!(pool.order(), model.clone());
            prop_assert_eq!(pool.capacity(), capacity);
            prop_assert!(pool.capacity() >= pool.len());
        }
    }

    #[test]
    fn growth_is_at_least_four_or_a_quarter(capacity in 1usize..100_000) {
        let next = grown_capacity(capacity);
        prop_assert!(next - capacity >= 4);
        prop_assert!(next - capacity >= capacity / 4);
        prop_assert_eq!(grown_capacity(0), INLINE_SLOTS);
    }
}

#[test]
fn every_stream_sees_its_own_pool() {
    let engine = Engine::new();
    let pool = engine.new_pool();
    let s = engine.open_string(vec![0; 4], 0, Capabilities::read_write());
    s.join_pool(&pool).unwrap();
    s.request_mode(Wanted::READ).unwrap();
    assert!(Arc::ptr_eq(s.lock().pool().unwrap(), &pool));
    assert!(engine.default_pool().is_empty());
}
