//! Offset-addressed byte buffer backed by pooled fixed-size chunks

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

/// Size of every chunk handed out by a [`ChunkPool`]
pub(crate) const CHUNK_SIZE: usize = 4096;

/// Free list of chunks shared by every window of an endpoint
#[derive(Clone)]
pub(crate) struct ChunkPool {
    free: Arc<Mutex<Vec<Box<[u8]>>>>,
    retain: usize,
}

impl ChunkPool {
    /// Create a pool holding on to at most `retain` idle chunks
    pub(crate) fn new(retain: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
            retain,
        }
    }

    fn take(&self) -> Box<[u8]> {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match reused {
            Some(mut chunk) => {
                chunk.fill(0);
                chunk
            }
            None => vec![0; CHUNK_SIZE].into_boxed_slice(),
        }
    }

    fn give(&self, chunk: Box<[u8]>) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.retain {
            free.push(chunk);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for ChunkPool {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A window `[start, end)` over an unbounded stream offset space
///
/// Chunk `i` of the chain covers the absolute offsets
/// `[(start / CHUNK_SIZE + i) * CHUNK_SIZE, (start / CHUNK_SIZE + i + 1) * CHUNK_SIZE)`. Offsets
/// inside the window that were never written read as zero.
pub(crate) struct SparseWindow {
    pool: ChunkPool,
    chunks: VecDeque<Box<[u8]>>,
    start: u64,
    end: u64,
}

impl SparseWindow {
    pub(crate) fn new(pool: ChunkPool) -> Self {
        Self {
            pool,
            chunks: VecDeque::new(),
            start: 0,
            end: 0,
        }
    }

    /// First offset still held
    pub(crate) fn start(&self) -> u64 {
        self.start
    }

    /// One past the highest offset written or committed
    pub(crate) fn end(&self) -> u64 {
        self.end
    }

    /// Copy `data` to the absolute offset `off`
    ///
    /// Bytes below `start` are dropped; writing past `end` extends the window.
    pub(crate) fn write_at(&mut self, mut off: u64, mut data: &[u8]) {
        let data_end = off + data.len() as u64;
        if data_end <= self.start {
            return;
        }
        if off < self.start {
            data = &data[(self.start - off) as usize..];
            off = self.start;
        }
        self.reserve(data_end);
        while !data.is_empty() {
            let (index, within) = self.locate(off);
            let n = data.len().min(CHUNK_SIZE - within);
            self.chunks[index][within..within + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            off += n as u64;
        }
        self.end = self.end.max(data_end);
    }

    /// Fill `buf` with the bytes starting at `off`
    ///
    /// # Panics
    ///
    /// If `[off, off + buf.len())` is not inside the window.
    pub(crate) fn read(&self, mut off: u64, mut buf: &mut [u8]) {
        assert!(
            off >= self.start && off + buf.len() as u64 <= self.end,
            "read of {}..{} outside window {}..{}",
            off,
            off + buf.len() as u64,
            self.start,
            self.end
        );
        while !buf.is_empty() {
            let (index, within) = self.locate(off);
            let n = buf.len().min(CHUNK_SIZE - within);
            buf[..n].copy_from_slice(&self.chunks[index][within..within + n]);
            buf = &mut buf[n..];
            off += n as u64;
        }
    }

    /// Up to `max` bytes from `start`, without copying
    ///
    /// The result may be shorter than requested when the window's first chunk ends early; the
    /// slice stays valid until the next mutation.
    pub(crate) fn peek(&self, max: usize) -> &[u8] {
        if self.start == self.end {
            return &[];
        }
        let (index, within) = self.locate(self.start);
        let n = max
            .min(CHUNK_SIZE - within)
            .min((self.end - self.start) as usize);
        &self.chunks[index][within..within + n]
    }

    /// Writable tail of the chunk holding `end`, allocating a fresh chunk if needed
    ///
    /// Bytes placed here become part of the window only after [`commit`](Self::commit).
    pub(crate) fn available_buffer(&mut self) -> &mut [u8] {
        self.reserve(self.end + 1);
        let (index, within) = self.locate(self.end);
        &mut self.chunks[index][within..]
    }

    /// Extend `end` over `n` bytes written through [`available_buffer`](Self::available_buffer)
    pub(crate) fn commit(&mut self, n: usize) {
        debug_assert!((self.end % CHUNK_SIZE as u64) as usize + n <= CHUNK_SIZE);
        self.end += n as u64;
    }

    /// Drop every byte below `off`, returning whole chunks to the pool
    pub(crate) fn discard_before(&mut self, off: u64) {
        if off <= self.start {
            return;
        }
        let released = (off / CHUNK_SIZE as u64 - self.start / CHUNK_SIZE as u64) as usize;
        for chunk in self.chunks.drain(..released.min(self.chunks.len())) {
            self.pool.give(chunk);
        }
        self.start = off;
        self.end = self.end.max(off);
    }

    /// Ensure chunks exist for every offset below `upto`
    fn reserve(&mut self, upto: u64) {
        let first = self.start / CHUNK_SIZE as u64;
        let needed = (upto.div_ceil(CHUNK_SIZE as u64) - first) as usize;
        while self.chunks.len() < needed {
            self.chunks.push_back(self.pool.take());
        }
    }

    fn locate(&self, off: u64) -> (usize, usize) {
        let index = off / CHUNK_SIZE as u64 - self.start / CHUNK_SIZE as u64;
        (index as usize, (off % CHUNK_SIZE as u64) as usize)
    }
}

impl Drop for SparseWindow {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            self.pool.give(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    fn window() -> SparseWindow {
        SparseWindow::new(ChunkPool::default())
    }

    fn read_vec(window: &SparseWindow, off: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        window.read(off, &mut buf);
        buf
    }

    #[test]
    fn write_across_chunks() {
        let mut w = window();
        let data = (0..10_000u32).map(|x| x as u8).collect::<Vec<_>>();
        w.write_at(100, &data);
        assert_eq!(w.start(), 0);
        assert_eq!(w.end(), 10_100);
        assert_eq!(read_vec(&w, 100, data.len()), data);
        assert_eq!(read_vec(&w, 0, 100), vec![0; 100]);
    }

    #[test]
    fn writes_before_start_are_trimmed() {
        let mut w = window();
        w.write_at(0, b"hello world");
        w.discard_before(6);
        w.write_at(0, b"HELLO");
        w.write_at(4, b"XXXW");
        assert_eq!(w.start(), 6);
        assert_eq!(read_vec(&w, 6, 5), b"Xorld");
    }

    #[test]
    fn peek_never_precedes_discard() {
        let mut w = window();
        let data = vec![7u8; 3 * CHUNK_SIZE];
        w.write_at(0, &data);
        w.discard_before(CHUNK_SIZE as u64 + 10);
        let peeked = w.peek(usize::MAX);
        assert_eq!(peeked.len(), CHUNK_SIZE - 10);
        w.write_at(CHUNK_SIZE as u64 + 10, b"!");
        assert_eq!(w.peek(1), b"!");
        assert_eq!(w.peek(0), b"");
    }

    #[test]
    fn discard_beyond_end_moves_end() {
        let pool = ChunkPool::default();
        let mut w = SparseWindow::new(pool.clone());
        w.write_at(0, &[1; 2 * CHUNK_SIZE]);
        w.discard_before(5 * CHUNK_SIZE as u64 + 3);
        assert_eq!(w.start(), 5 * CHUNK_SIZE as u64 + 3);
        assert_eq!(w.end(), w.start());
        assert_eq!(pool.idle(), 2);
        assert!(w.peek(10).is_empty());

        w.write_at(w.end(), b"abc");
        assert_eq!(read_vec(&w, w.start(), 3), b"abc");
        // The new chunk came from the pool and was cleared
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn available_buffer_and_commit() {
        let mut w = window();
        w.write_at(0, &[1; CHUNK_SIZE - 2]);
        let tail = w.available_buffer();
        assert_eq!(tail.len(), 2);
        tail.copy_from_slice(b"ok");
        w.commit(2);
        assert_eq!(w.end(), CHUNK_SIZE as u64);
        let tail = w.available_buffer();
        assert_eq!(tail.len(), CHUNK_SIZE);
        tail[0] = b'!';
        w.commit(1);
        assert_eq!(read_vec(&w, CHUNK_SIZE as u64 - 2, 3), b"ok!");
    }

    #[test]
    #[should_panic]
    fn read_outside_window_panics() {
        let mut w = window();
        w.write_at(0, b"abc");
        read_vec(&w, 1, 3);
    }

    #[test]
    fn dropped_window_returns_chunks() {
        let pool = ChunkPool::new(1);
        let mut w = SparseWindow::new(pool.clone());
        w.write_at(0, &[0; 3 * CHUNK_SIZE]);
        drop(w);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn random_interleaving_matches_model() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut w = window();
        let mut model = Vec::<u8>::new();
        for _ in 0..500 {
            if rng.random_ratio(1, 5) {
                let off = w.start() + rng.random_range(0..=(w.end() - w.start()) / 2);
                w.discard_before(off);
            } else {
                let off = w.start() + rng.random_range(0..3 * CHUNK_SIZE as u64);
                let len = rng.random_range(0..2 * CHUNK_SIZE);
                let byte = rng.random::<u8>();
                let end = off as usize + len;
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[off as usize..end].fill(byte);
                w.write_at(off, &vec![byte; len]);
            }
            let (start, end) = (w.start() as usize, w.end() as usize);
            if model.len() < end {
                model.resize(end, 0);
            }
            assert_eq!(read_vec(&w, w.start(), end - start), model[start..end]);
            if let Some(&first) = w.peek(1).first() {
                assert_eq!(first, model[start]);
            }
        }
    }
}
