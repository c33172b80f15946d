//! Growable staging buffer for data in flight.
//!
//! A [`Buffer`] decouples the thread producing bytes from the thread consuming them.
//! It is an ordered queue of immutable chunks plus one chunk owned by the writer and
//! one owned by the reader:
//!
//! ```text
//!   write()/write_str()        flush()               readable()/release()
//!  ----------------------> [ writer chunk ] ---> [ queue ... ] ---> [ reader chunk ] --->
//! ```
//!
//! A chunk belongs to exactly one of {writer, queue, reader} at a time and moves
//! between them by value. Written data becomes visible to the reader only after
//! [`Buffer::flush`]. Once the flushed total reaches the size limit, the registered
//! drain callback is invoked with the buffer and a `final` flag; this is how network
//! writes apply backpressure to the producer.
//!
//! One writer thread and one reader thread may use a buffer concurrently. Byte and
//! character writes cannot be mixed without an intervening flush.

mod charset;
mod chunk_sizer;

pub use charset::Charset;
pub use chunk_sizer::ChunkSizer;

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

/// Default smallest chunk allocation.
pub const DEFAULT_MIN_CHUNK: usize = 512;
/// Default largest chunk allocation.
pub const DEFAULT_MAX_CHUNK: usize = 64 * 1024;

/// Consumer invoked when flushed data reaches the size limit, or on close with `final = true`.
pub type DrainCallback = Box<dyn FnMut(&Buffer, bool) -> io::Result<()> + Send>;

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("byte and character writes can't be mixed without a flush")]
    IllegalMode,

    #[error("drain callback failed: {source}")]
    Drain {
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Bytes,
    Chars,
}

struct WriteSide {
    current: BytesMut,
    sealed: Vec<Bytes>,
    text: String,
    mode: Mode,
    sizer: ChunkSizer,
    charset: Charset,
    pending: usize,
}

impl WriteSide {
    fn put(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.current.len() == self.current.capacity() {
                self.seal();
                self.current = BytesMut::with_capacity(self.sizer.next());
            }
            let room = self.current.capacity() - self.current.len();
            let n = room.min(data.len());
            self.current.extend_from_slice(&data[..n]);
            data = &data[n..];
            self.pending += n;
        }
    }

    fn seal(&mut self) {
        let capacity = self.current.capacity();
        let chunk = std::mem::take(&mut self.current);
        if capacity > 0 {
            self.sizer.retire(chunk.len(), capacity);
        }
        if !chunk.is_empty() {
            self.sealed.push(chunk.freeze());
        }
    }

    fn take_flushed(&mut self) -> (Vec<Bytes>, usize) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            let mut encoded = BytesMut::with_capacity(text.len());
            self.charset.encode_into(&text, &mut encoded);
            self.put(&encoded);
        }
        self.seal();
        self.mode = Mode::Idle;
        (std::mem::take(&mut self.sealed), std::mem::take(&mut self.pending))
    }

    fn reset(&mut self) {
        self.current = BytesMut::new();
        self.sealed.clear();
        self.text.clear();
        self.mode = Mode::Idle;
        self.pending = 0;
    }
}

/// See the [module documentation](self).
pub struct Buffer {
    writer: Mutex<WriteSide>,
    queue: Mutex<VecDeque<Bytes>>,
    reader: Mutex<Bytes>,
    available: AtomicUsize,
    size_limit: AtomicUsize,
    drain: Mutex<Option<DrainCallback>>,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("available", &self.available_bytes())
            .field("size_limit", &self.size_limit())
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_chunk_sizes(DEFAULT_MIN_CHUNK, DEFAULT_MAX_CHUNK)
    }

    /// Creates a buffer whose chunk allocations adapt between `min` and `max` bytes.
    pub fn with_chunk_sizes(min: usize, max: usize) -> Self {
        Self {
            writer: Mutex::new(WriteSide {
                current: BytesMut::new(),
                sealed: Vec::new(),
                text: String::new(),
                mode: Mode::Idle,
                sizer: ChunkSizer::new(min, max),
                charset: Charset::default(),
                pending: 0,
            }),
            queue: Mutex::new(VecDeque::new()),
            reader: Mutex::new(Bytes::new()),
            available: AtomicUsize::new(0),
            size_limit: AtomicUsize::new(usize::MAX),
            drain: Mutex::new(None),
        }
    }

    /// Charset used to encode character writes.
    pub fn set_charset(&self, charset: Charset) {
        self.writer.lock().charset = charset;
    }

    pub fn charset(&self) -> Charset {
        self.writer.lock().charset
    }

    /// Appends bytes. Not visible to the reader until [`flush`](Self::flush).
    pub fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        let mut writer = self.writer.lock();
        if writer.mode == Mode::Chars {
            return Err(BufferError::IllegalMode);
        }
        writer.mode = Mode::Bytes;
        writer.put(data);
        Ok(())
    }

    /// Appends characters, encoded with the buffer charset on flush.
    pub fn write_str(&self, text: &str) -> Result<(), BufferError> {
        let mut writer = self.writer.lock();
        if writer.mode == Mode::Bytes {
            return Err(BufferError::IllegalMode);
        }
        writer.mode = Mode::Chars;
        writer.text.push_str(text);
        Ok(())
    }

    /// Makes written data visible to the reader and triggers the drain callback if the
    /// size limit is reached.
    pub fn flush(&self) -> Result<(), BufferError> {
        let (chunks, flushed) = self.writer.lock().take_flushed();
        if flushed == 0 {
            return Ok(());
        }

        self.enqueue(chunks, flushed);
        trace!(flushed, available = self.available_bytes(), "buffer flushed");
        self.drain_if_full()
    }

    /// Flushes and hands the remaining data to the drain callback with `final = true`.
    pub fn close(&self) -> Result<(), BufferError> {
        self.flush()?;
        self.drain(true)
    }

    /// Bytes flushed and not yet read.
    #[inline]
    pub fn available_bytes(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Bytes written but not yet flushed.
    pub fn pending_bytes(&self) -> usize {
        let writer = self.writer.lock();
        writer.pending + writer.text.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.available_bytes() == 0
    }

    /// The chunk at the head of the buffer, without consuming it.
    pub fn readable(&self) -> Option<Bytes> {
        let mut reader = self.reader.lock();
        if reader.is_empty() {
            let mut queue = self.queue.lock();
            while let Some(chunk) = queue.pop_front() {
                if !chunk.is_empty() {
                    *reader = chunk;
                    break;
                }
            }
        }

        if reader.is_empty() { None } else { Some(reader.clone()) }
    }

    /// Consumes up to `n` bytes of the chunk returned by [`readable`](Self::readable).
    pub fn release(&self, n: usize) -> usize {
        let mut reader = self.reader.lock();
        let n = n.min(reader.len());
        reader.advance(n);
        self.available.fetch_sub(n, Ordering::AcqRel);
        n
    }

    /// Copies readable bytes into `dst`, returning how many were consumed.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let mut read = 0;
        while read < dst.len() {
            let Some(chunk) = self.readable() else { break };
            let n = chunk.len().min(dst.len() - read);
            dst[read..read + n].copy_from_slice(&chunk[..n]);
            self.release(n);
            read += n;
        }
        read
    }

    /// Moves every readable byte onto the end of `dst`.
    pub fn read_into(&self, dst: &mut BytesMut) -> usize {
        let mut read = 0;
        while let Some(chunk) = self.readable() {
            dst.extend_from_slice(&chunk);
            read += self.release(chunk.len());
        }
        read
    }

    /// Drops up to `n` readable bytes.
    pub fn discard(&self, n: usize) -> usize {
        let mut discarded = 0;
        while discarded < n {
            let Some(chunk) = self.readable() else { break };
            discarded += self.release(chunk.len().min(n - discarded));
        }
        discarded
    }

    /// Moves up to `n` readable bytes of `src` onto the end of this buffer without copying.
    pub fn transfer(&self, src: &Buffer, n: usize) -> Result<usize, BufferError> {
        if std::ptr::eq(self, src) {
            return Ok(0);
        }

        let mut chunks = Vec::new();
        let mut moved = 0;
        while moved < n {
            let Some(chunk) = src.readable() else { break };
            let take = chunk.len().min(n - moved);
            chunks.push(chunk.slice(..take));
            src.release(take);
            moved += take;
        }

        if moved > 0 {
            self.enqueue(chunks, moved);
            self.drain_if_full()?;
        }
        Ok(moved)
    }

    /// Moves all readable data of `other` in front of this buffer's readable data.
    pub fn prepend(&self, other: &Buffer) {
        if std::ptr::eq(self, other) {
            return;
        }

        let (chunks, total) = other.take_readable();
        if total == 0 {
            return;
        }

        let mut reader = self.reader.lock();
        let mut queue = self.queue.lock();
        let current = std::mem::take(&mut *reader);
        if !current.is_empty() {
            queue.push_front(current);
        }
        for chunk in chunks.into_iter().rev() {
            queue.push_front(chunk);
        }
        self.available.fetch_add(total, Ordering::AcqRel);
    }

    pub fn set_size_limit(&self, limit: usize) {
        self.size_limit.store(limit.max(1), Ordering::Release);
    }

    #[inline]
    pub fn size_limit(&self) -> usize {
        self.size_limit.load(Ordering::Acquire)
    }

    pub fn set_drain_callback(&self, callback: DrainCallback) {
        *self.drain.lock() = Some(callback);
    }

    pub fn clear_drain_callback(&self) {
        self.drain.lock().take();
    }

    /// Drops all written and flushed data. Limit, charset and callback are kept.
    pub fn clear(&self) {
        self.writer.lock().reset();
        let mut reader = self.reader.lock();
        let mut queue = self.queue.lock();
        *reader = Bytes::new();
        queue.clear();
        self.available.store(0, Ordering::Release);
    }

    fn enqueue(&self, chunks: Vec<Bytes>, len: usize) {
        let mut queue = self.queue.lock();
        queue.extend(chunks);
        // counted under the queue lock so a reader can never release more than was added
        self.available.fetch_add(len, Ordering::AcqRel);
    }

    fn take_readable(&self) -> (Vec<Bytes>, usize) {
        let mut reader = self.reader.lock();
        let mut queue = self.queue.lock();

        let mut chunks = Vec::with_capacity(queue.len() + 1);
        let current = std::mem::take(&mut *reader);
        if !current.is_empty() {
            chunks.push(current);
        }
        chunks.extend(queue.drain(..).filter(|c| !c.is_empty()));

        let total = chunks.iter().map(Bytes::len).sum();
        self.available.fetch_sub(total, Ordering::AcqRel);
        (chunks, total)
    }

    fn drain_if_full(&self) -> Result<(), BufferError> {
        if self.available_bytes() >= self.size_limit() { self.drain(false) } else { Ok(()) }
    }

    fn drain(&self, last: bool) -> Result<(), BufferError> {
        // taken out of the slot so the callback may use the buffer freely
        let Some(mut callback) = self.drain.lock().take() else {
            return Ok(());
        };

        let result = callback(self, last);

        let mut slot = self.drain.lock();
        if slot.is_none() {
            *slot = Some(callback);
        }
        result.map_err(|source| BufferError::Drain { source })
    }
}
