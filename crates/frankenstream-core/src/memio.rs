//! In-memory descriptor table.
//!
//! Seekable files and one-way pipes behind integer descriptors, with fault
//! injection for seeks and writes. Used by the test suites and benchmarks to
//! drive the mode engine without touching the kernel.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{LowLevelIo, Whence};
use crate::errno;

#[derive(Debug)]
enum Descriptor {
    File { data: Arc<Mutex<Vec<u8>>>, pos: i64 },
    PipeRead(Arc<Mutex<VecDeque<u8>>>),
    PipeWrite(Arc<Mutex<VecDeque<u8>>>),
}

#[derive(Debug, Default)]
struct Faults {
    seeks: usize,
    writes: usize,
    short_write: Option<usize>,
}

#[derive(Debug, Default)]
struct Table {
    next_fd: i32,
    fds: HashMap<i32, Descriptor>,
    faults: Faults,
    seeks: usize,
    unmaps: Vec<(i32, usize)>,
}

/// A descriptor table living entirely in memory.
#[derive(Debug, Default)]
pub struct MemIo {
    table: Mutex<Table>,
}

fn os_err(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl MemIo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                next_fd: 3,
                ..Table::default()
            }),
        }
    }

    fn insert(table: &mut Table, d: Descriptor) -> i32 {
        let fd = table.next_fd;
        table.next_fd += 1;
        table.fds.insert(fd, d);
        fd
    }

    /// A seekable file holding `contents`, positioned at 0.
    pub fn create_file(&self, contents: &[u8]) -> i32 {
        let mut t = self.table.lock();
        let data = Arc::new(Mutex::new(contents.to_vec()));
        Self::insert(&mut t, Descriptor::File { data, pos: 0 })
    }

    /// A second descriptor on the same file with its own offset.
    pub fn reopen(&self, fd: i32) -> Option<i32> {
        let mut t = self.table.lock();
        let data = match t.fds.get(&fd)? {
            Descriptor::File { data, .. } => Arc::clone(data),
            _ => return None,
        };
        Some(Self::insert(&mut t, Descriptor::File { data, pos: 0 }))
    }

    /// A pipe; returns `(read_end, write_end)`.
    pub fn pipe(&self) -> (i32, i32) {
        let mut t = self.table.lock();
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let r = Self::insert(&mut t, Descriptor::PipeRead(Arc::clone(&queue)));
        let w = Self::insert(&mut t, Descriptor::PipeWrite(queue));
        (r, w)
    }

    pub fn contents(&self, fd: i32) -> Option<Vec<u8>> {
        match self.table.lock().fds.get(&fd)? {
            Descriptor::File { data, .. } => Some(data.lock().clone()),
            Descriptor::PipeRead(q) | Descriptor::PipeWrite(q) => Some(q.lock().iter().copied().collect()),
        }
    }

    pub fn position(&self, fd: i32) -> Option<i64> {
        match self.table.lock().fds.get(&fd)? {
            Descriptor::File { pos, .. } => Some(*pos),
            _ => None,
        }
    }

    /// Move a file offset behind the stream's back.
    pub fn set_position(&self, fd: i32, to: i64) {
        if let Some(Descriptor::File { pos, .. }) = self.table.lock().fds.get_mut(&fd) {
            *pos = to;
        }
    }

    /// Append bytes to whatever pipe `fd` belongs to.
    pub fn push_pipe(&self, fd: i32, bytes: &[u8]) {
        if let Some(Descriptor::PipeRead(q) | Descriptor::PipeWrite(q)) = self.table.lock().fds.get(&fd) {
            q.lock().extend(bytes);
        }
    }

    /// Take everything queued in the pipe `fd` belongs to.
    pub fn drain_pipe(&self, fd: i32) -> Vec<u8> {
        match self.table.lock().fds.get(&fd) {
            Some(Descriptor::PipeRead(q) | Descriptor::PipeWrite(q)) => q.lock().drain(..).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_open(&self, fd: i32) -> bool {
        self.table.lock().fds.contains_key(&fd)
    }

    /// Make the next `n` seeks fail with `EIO`.
    pub fn fail_seeks(&self, n: usize) {
        self.table.lock().faults.seeks = n;
    }

    /// Make the next `n` writes fail with `EIO`.
    pub fn fail_writes(&self, n: usize) {
        self.table.lock().faults.writes = n;
    }

    /// Cap every write at `max` bytes.
    pub fn short_writes(&self, max: Option<usize>) {
        self.table.lock().faults.short_write = max;
    }

    /// Successful seeks so far.
    pub fn seek_count(&self) -> usize {
        self.table.lock().seeks
    }

    /// `(fd, len)` of every unmap request.
    pub fn unmaps(&self) -> Vec<(i32, usize)> {
        self.table.lock().unmaps.clone()
    }
}

impl LowLevelIo for MemIo {
    fn read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize> {
        let mut t = self.table.lock();
        match t.fds.get_mut(&fd).ok_or_else(|| os_err(errno::EBADF))? {
            Descriptor::File { data, pos } => {
                let data = data.lock();
                let start = (*pos).clamp(0, data.len() as i64) as usize;
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                *pos += n as i64;
                Ok(n)
            }
            Descriptor::PipeRead(q) => {
                let mut q = q.lock();
                let n = buf.len().min(q.len());
                for (slot, byte) in buf.iter_mut().zip(q.drain(..n)) {
                    *slot = byte;
                }
                Ok(n)
            }
            Descriptor::PipeWrite(_) => Err(os_err(errno::EBADF)),
        }
    }

    fn write(&self, fd: i32, buf: &[u8]) -> io::Result<usize> {
        let mut t = self.table.lock();
        if t.faults.writes > 0 {
            t.faults.writes -= 1;
            return Err(os_err(errno::EIO));
        }
        let n = t.faults.short_write.map_or(buf.len(), |max| buf.len().min(max));
        match t.fds.get_mut(&fd).ok_or_else(|| os_err(errno::EBADF))? {
            Descriptor::File { data, pos } => {
                let mut data = data.lock();
                let start = (*pos).max(0) as usize;
                if data.len() < start + n {
                    data.resize(start + n, 0);
                }
                data[start..start + n].copy_from_slice(&buf[..n]);
                *pos += n as i64;
                Ok(n)
            }
            Descriptor::PipeWrite(q) => {
                q.lock().extend(&buf[..n]);
                Ok(n)
            }
            Descriptor::PipeRead(_) => Err(os_err(errno::EBADF)),
        }
    }

    fn seek(&self, fd: i32, offset: i64, whence: Whence) -> io::Result<i64> {
        let mut t = self.table.lock();
        if t.faults.seeks > 0 {
            t.faults.seeks -= 1;
            return Err(os_err(errno::EIO));
        }
        let result = match t.fds.get_mut(&fd).ok_or_else(|| os_err(errno::EBADF))? {
            Descriptor::File { data, pos } => {
                let base = match whence {
                    Whence::Set => 0,
                    Whence::Current => *pos,
                    Whence::End => data.lock().len() as i64,
                };
                let target = base + offset;
                if target < 0 {
                    return Err(os_err(errno::EINVAL));
                }
                *pos = target;
                target
            }
            _ => return Err(os_err(errno::ESPIPE)),
        };
        t.seeks += 1;
        Ok(result)
    }

    fn close(&self, fd: i32) -> io::Result<()> {
        match self.table.lock().fds.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(os_err(errno::EBADF)),
        }
    }

    fn unmap(&self, fd: i32, len: usize) -> io::Result<()> {
        self.table.lock().unmaps.push((fd, len));
        Ok(())
    }
}
