//! Streams over DMA files
//!
//! The sink writes aligned blocks at increasing offsets. When a put ends
//! mid-block the tail is kept and written again, padded, at the front of
//! the next put; on close the file is cut back to the bytes actually
//! written. The source reads ahead one buffer at a time with bulk reads.

use super::{DataSink, DataSource, InputStream, OutputStream, Packet, DEFAULT_BUFFER_SIZE};
use crate::file::File;
use crate::io::{align_down, align_up, default_priority_class, DmaBuffer, PriorityClass};
use bytes::{Bytes, BytesMut};
use reactor_core::{Deferred, ReactorError, Semaphore};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
pub struct FileStreamOptions {
    pub buffer_size: usize,
    pub priority_class: PriorityClass,
}

impl Default for FileStreamOptions {
    fn default() -> Self {
        Self { buffer_size: DEFAULT_BUFFER_SIZE, priority_class: default_priority_class() }
    }
}

impl FileStreamOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn priority_class(mut self, pc: PriorityClass) -> Self {
        self.priority_class = pc;
        self
    }
}

/// Output stream appending to `file` from offset 0.
pub fn output_to_file(file: File, opts: FileStreamOptions) -> OutputStream {
    OutputStream::new(FileSink::new(file, opts)).trim_to_size(true)
}

/// Input stream reading `file` from `offset` to its end.
pub fn input_from_file(file: File, offset: u64, opts: FileStreamOptions) -> InputStream {
    InputStream::new(FileSource::new(file, offset, opts))
}

pub struct FileSink {
    st: Rc<SinkState>,
    buffer_size: usize,
}

struct SinkState {
    file: RefCell<Option<File>>,
    /// One put in flight at a time; a put may rewrite the block the last
    /// one ended in.
    lock: Semaphore,
    /// Logical end of the data written so far
    pos: Cell<u64>,
    /// Bytes of the last, partial block
    tail: RefCell<Bytes>,
    align: u64,
    pc: PriorityClass,
}

impl FileSink {
    pub fn new(file: File, opts: FileStreamOptions) -> Self {
        let align = file.disk_write_dma_alignment().max(file.memory_dma_alignment()).max(1);
        let buffer_size = align_up(opts.buffer_size.max(1) as u64, align) as usize;
        Self {
            st: Rc::new(SinkState {
                file: RefCell::new(Some(file)),
                lock: Semaphore::new(1),
                pos: Cell::new(0),
                tail: RefCell::new(Bytes::new()),
                align,
                pc: opts.priority_class,
            }),
            buffer_size,
        }
    }

    /// Bytes accepted so far.
    pub fn position(&self) -> u64 {
        self.st.pos.get()
    }
}

impl SinkState {
    fn file(&self) -> Option<File> {
        self.file.borrow().as_ref().map(File::dup)
    }

    fn write(self: &Rc<Self>, data: Bytes) -> Deferred<()> {
        let Some(file) = self.file() else {
            return Deferred::failed(ReactorError::StreamClosed);
        };
        let pos = self.pos.get();
        let start = align_down(pos, self.align);
        let block = {
            let tail = self.tail.borrow();
            let mut block = BytesMut::with_capacity(tail.len() + data.len());
            block.extend_from_slice(&tail);
            block.extend_from_slice(&data);
            block.freeze()
        };
        let end = pos + data.len() as u64;
        let buf = DmaBuffer::copy_from(&block, self.align as usize);
        let me = self.clone();
        file.write_dma(start, buf, self.pc).then(move |written| {
            if (written as u64) < end - start {
                return Deferred::failed(ReactorError::Os(libc::EIO));
            }
            let keep = (end - align_down(end, me.align)) as usize;
            *me.tail.borrow_mut() = block.slice(block.len() - keep..);
            me.pos.set(end);
            Deferred::ready(())
        })
    }
}

impl DataSink for FileSink {
    fn put(&mut self, buf: Bytes) -> Deferred<()> {
        if buf.is_empty() {
            return Deferred::ready(());
        }
        let st = self.st.clone();
        self.st.lock.wait(1).then(move |()| {
            let unlock = st.clone();
            st.write(buf).finally(move || unlock.lock.signal(1))
        })
    }

    fn put_many(&mut self, packet: Packet) -> Deferred<()> {
        self.put(packet.linearize())
    }

    fn flush(&mut self) -> Deferred<()> {
        match self.st.file() {
            Some(f) => f.flush(),
            None => Deferred::failed(ReactorError::StreamClosed),
        }
    }

    fn close(&mut self) -> Deferred<()> {
        let st = self.st.clone();
        self.st.lock.wait(1).then(move |()| {
            let Some(file) = st.file.borrow_mut().take() else {
                return Deferred::ready(());
            };
            let pos = st.pos.get();
            let trimmed = if pos % st.align != 0 { file.truncate(pos) } else { Deferred::ready(()) };
            let flushing = file.dup();
            trimmed
                .then(move |()| flushing.flush())
                .then_result(move |r| file.close().then_result(move |c| Deferred::from_result(r.and(c))))
        })
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

pub struct FileSource {
    file: Option<File>,
    pos: Rc<Cell<u64>>,
    buffer_size: usize,
    pc: PriorityClass,
}

impl FileSource {
    pub fn new(file: File, offset: u64, opts: FileStreamOptions) -> Self {
        let align = file.disk_read_dma_alignment().max(1);
        let buffer_size = align_up(opts.buffer_size.max(1) as u64, align) as usize;
        Self { file: Some(file), pos: Rc::new(Cell::new(offset)), buffer_size, pc: opts.priority_class }
    }
}

impl DataSource for FileSource {
    fn get(&mut self) -> Deferred<Bytes> {
        let Some(file) = &self.file else {
            return Deferred::failed(ReactorError::StreamClosed);
        };
        let pos = self.pos.clone();
        file.dma_read_bulk(pos.get(), self.buffer_size, self.pc).map(move |buf| {
            pos.set(pos.get() + buf.len() as u64);
            buf.into_bytes()
        })
    }

    fn skip(&mut self, n: u64) -> Deferred<Bytes> {
        self.pos.set(self.pos.get() + n);
        Deferred::ready(Bytes::new())
    }

    fn close(&mut self) -> Deferred<()> {
        match self.file.take() {
            Some(f) => f.close(),
            None => Deferred::ready(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{file_size, open_file_dma, FileOpenOptions, OpenFlags};
    use crate::smp::run_test;
    use std::path::PathBuf;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("rct-stream-{}-{}", std::process::id(), tag))
    }

    #[test]
    fn test_file_stream_round_trip_with_partial_flushes() {
        let path = temp_path("rt");
        let p = path.clone();
        let code = run_test(1, move || {
            let flags = OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE;
            let reopen = p.clone();
            let size_of = p.clone();
            open_file_dma(&p, flags, FileOpenOptions::new().append_challenged(false))
                .then(|f| {
                    let out = Rc::new(output_to_file(f, FileStreamOptions::new().buffer_size(4096)));
                    let (o1, o2, o3) = (out.clone(), out.clone(), out.clone());
                    out.write(&[b'a'; 100])
                        // Ends mid-block; the next write rewrites it.
                        .then(move |()| o1.flush())
                        .then(move |()| o2.write(&[b'b'; 5000]))
                        .then(move |()| o3.close())
                        .map(move |()| drop(out))
                })
                .then(move |()| file_size(size_of))
                .then(move |size| {
                    open_file_dma(&reopen, OpenFlags::RO, FileOpenOptions::new()).map(move |f| (f, size))
                })
                .then(|(f, size)| {
                    let input = Rc::new(input_from_file(f, 0, FileStreamOptions::new()));
                    let closer = input.clone();
                    input
                        .read_exactly(5100)
                        .then(move |data| {
                            let ok = size == 5100
                                && data.len() == 5100
                                && data[..100].iter().all(|&b| b == b'a')
                                && data[100..].iter().all(|&b| b == b'b');
                            closer.read().then(move |rest| {
                                let ok = ok && rest.is_empty() && closer.eof();
                                closer.close().map(move |()| if ok { 0 } else { 1 })
                            })
                        })
                })
        });
        assert_eq!(code, 0);
        std::fs::remove_file(&path).unwrap();
    }
}
