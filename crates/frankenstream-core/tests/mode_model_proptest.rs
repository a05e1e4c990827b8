//! Random interleavings of reads, writes, syncs, and explicit mode requests on
//! a seekable read/write stream must behave like a plain file cursor.

use std::sync::Arc;

use proptest::prelude::*;

use frankenstream_core::memio::MemIo;
use frankenstream_core::{Capabilities, Engine, EngineConfig, LowLevelIo, Wanted};

#[derive(Debug, Clone)]
enum Op {
    Read(usize),
    Write(Vec<u8>),
    Sync,
    WantRead,
    WantWrite,
    WantReadSynced,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..12).prop_map(Op::Read),
        proptest::collection::vec(any::<u8>(), 1..12).prop_map(Op::Write),
        Just(Op::Sync),
        Just(Op::WantRead),
        Just(Op::WantWrite),
        Just(Op::WantReadSynced),
    ]
}

proptest! {
    #[test]
    fn stream_matches_file_cursor_model(
        initial in proptest::collection::vec(any::<u8>(), 0..40),
        buffer_size in 1usize..10,
        ops in proptest::collection::vec(op(), 1..40),
    ) {
        let io = Arc::new(MemIo::new());
        let fd = io.create_file(&initial);
        let engine = Engine::builder()
            .io(Arc::clone(&io) as Arc<dyn LowLevelIo>)
            .config(EngineConfig { buffer_size, ..EngineConfig::default() })
            .build();
        let s = engine.open_fd(fd, Capabilities::read_write());

        let mut model = initial.clone();
        let mut pos = 0usize;
        for op in &ops {
            match op {
                Op::Read(n) => {
                    let mut out = vec![0u8; *n];
                    let got = s.read(&mut out).unwrap();
                    let available = model.len().saturating_sub(pos).min(*n);
                    prop_assert!(got <= available);
                    if available > 0 {
                        prop_assert!(got > 0);
                    }
                    prop_assert_eq!(&out[..got], &model[pos..pos + got]);
                    pos += got;
                }
                Op::Write(bytes) => {
                    prop_assert_eq!(s.write(bytes).unwrap(), bytes.len());
                    if model.len() < pos + bytes.len() {
                        model.resize(pos + bytes.len(), 0);
                    }
                    model[pos..pos + bytes.len()].copy_from_slice(bytes);
                    pos += bytes.len();
                }
                Op::Sync => s.sync().unwrap(),
                Op::WantRead => s.request_mode(Wanted::READ).unwrap(),
                Op::WantWrite => s.request_mode(Wanted::WRITE).unwrap(),
                Op::WantReadSynced => s.request_mode(Wanted::READ.synced()).unwrap(),
            }
            let state = s.lock();
            let w = state.window();
            prop_assert!(w.next() <= w.endb());
            prop_assert!(w.endb() <= w.size());
            prop_assert!(w.endr() == 0 || w.endw() == 0);
        }

        s.flush().unwrap();
        prop_assert_eq!(io.contents(fd).unwrap(), model);
    }
}
