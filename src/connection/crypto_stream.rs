use std::ops::Range;

use bytes::Bytes;

use crate::{
    frame,
    range_set::RangeSet,
    sparse_window::{ChunkPool, SparseWindow},
    TransportError,
};

/// Handshake bytes of one number space, in both directions
///
/// Received CRYPTO data is reassembled in a [`SparseWindow`] and handed to TLS in order. Sent
/// data stays in a second window until the peer acknowledges it, so that lost ranges can be
/// retransmitted.
pub(super) struct CryptoStream {
    recv: SparseWindow,
    /// Offsets received so far, including some that may already have been consumed
    received: RangeSet,
    max_buffer: u64,

    send: SparseWindow,
    /// Offsets that still need to be transmitted
    pending: RangeSet,
    /// Offsets the peer acknowledged above `send.start()`
    acked: RangeSet,

    discarded: bool,
}

impl CryptoStream {
    pub(super) fn new(pool: ChunkPool, max_buffer: usize) -> Self {
        Self {
            recv: SparseWindow::new(pool.clone()),
            received: RangeSet::new(),
            max_buffer: max_buffer as u64,
            send: SparseWindow::new(pool),
            pending: RangeSet::new(),
            acked: RangeSet::new(),
            discarded: false,
        }
    }

    /// Buffer received CRYPTO frame data
    pub(super) fn insert(&mut self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
        if self.discarded {
            return Ok(());
        }
        let end = offset + data.len() as u64;
        if end.saturating_sub(self.recv.start()) > self.max_buffer {
            return Err(TransportError::CRYPTO_BUFFER_EXCEEDED(""));
        }
        if data.is_empty() || end <= self.recv.start() {
            return Ok(());
        }
        self.recv.write_at(offset, data);
        self.received.insert(offset..end);
        Ok(())
    }

    /// Feed every contiguous byte received so far to `consume`, in order
    pub(super) fn read(
        &mut self,
        mut consume: impl FnMut(&[u8]) -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        loop {
            let start = self.recv.start();
            let Some(range) = self.received.peek_min() else {
                break;
            };
            if range.start > start {
                break;
            }
            if range.end <= start {
                self.received.pop_min();
                continue;
            }
            let chunk = self.recv.peek((range.end - start) as usize);
            let n = chunk.len();
            consume(chunk)?;
            self.recv.discard_before(start + n as u64);
        }
        Ok(())
    }

    /// Queue handshake bytes for transmission
    pub(super) fn write(&mut self, mut data: &[u8]) {
        if self.discarded {
            return;
        }
        let start = self.send.end();
        while !data.is_empty() {
            let buf = self.send.available_buffer();
            let n = buf.len().min(data.len());
            buf[..n].copy_from_slice(&data[..n]);
            self.send.commit(n);
            data = &data[n..];
        }
        let end = self.send.end();
        if end > start {
            self.pending.insert(start..end);
        }
    }

    pub(super) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Produce a CRYPTO frame whose encoding fits in `max_len` bytes
    pub(super) fn poll_frame(&mut self, max_len: usize) -> Option<frame::Crypto> {
        let max_data = max_len.checked_sub(frame::Crypto::SIZE_BOUND)?;
        if max_data == 0 {
            return None;
        }
        let range = self.pending.pop_min()?;
        let len = (range.end - range.start).min(max_data as u64);
        let end = range.start + len;
        if end < range.end {
            self.pending.insert(end..range.end);
        }
        let mut data = vec![0; len as usize];
        self.send.read(range.start, &mut data);
        Some(frame::Crypto {
            offset: range.start,
            data: Bytes::from(data),
        })
    }

    /// The peer acknowledged `range`
    pub(super) fn on_ack(&mut self, range: Range<u64>) {
        if self.discarded {
            return;
        }
        self.pending.remove(range.clone());
        self.acked.insert(range);
        while let Some(first) = self.acked.peek_min() {
            if first.start > self.send.start() {
                break;
            }
            self.acked.pop_min();
            self.send.discard_before(first.end.min(self.send.end()));
        }
    }

    /// A packet carrying `range` was lost
    pub(super) fn on_lost(&mut self, range: Range<u64>) {
        if self.discarded {
            return;
        }
        let start = range.start.max(self.send.start());
        if start >= range.end {
            return;
        }
        self.pending.insert(start..range.end);
        for acked in self.acked.iter() {
            self.pending.remove(acked);
        }
    }

    /// Queue all unacknowledged data for retransmission, returning whether there was any
    pub(super) fn requeue_unacked(&mut self) -> bool {
        if self.discarded || self.send.start() == self.send.end() {
            return false;
        }
        self.on_lost(self.send.start()..self.send.end());
        self.has_pending()
    }

    /// Release all buffers; later data in either direction is ignored
    ///
    /// Received bytes that were never consumed are a protocol violation (RFC 9001 §4.1.3), but
    /// the buffers are released either way.
    pub(super) fn discard(&mut self) -> Result<(), TransportError> {
        let unread = !self.discarded
            && self
                .received
                .max()
                .is_some_and(|last| last >= self.recv.start());
        self.recv.discard_before(self.recv.end());
        self.send.discard_before(self.send.end());
        self.received = RangeSet::new();
        self.pending = RangeSet::new();
        self.acked = RangeSet::new();
        self.discarded = true;
        if unread {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "handshake data left unconsumed",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> CryptoStream {
        CryptoStream::new(ChunkPool::default(), 16 * 1024)
    }

    fn drain(stream: &mut CryptoStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream
            .read(|data| {
                out.extend_from_slice(data);
                Ok(())
            })
            .unwrap();
        out
    }

    #[test]
    fn reassembles_out_of_order() {
        let mut s = stream();
        s.insert(5, b"world").unwrap();
        assert!(drain(&mut s).is_empty());
        s.insert(0, b"hello").unwrap();
        assert_eq!(drain(&mut s), b"helloworld");
        // Retransmission of consumed data is ignored
        s.insert(3, b"loworld!").unwrap();
        assert_eq!(drain(&mut s), b"!");
    }

    #[test]
    fn buffer_limit() {
        let mut s = CryptoStream::new(ChunkPool::default(), 100);
        let err = s.insert(90, &[0; 11]).unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::CRYPTO_BUFFER_EXCEEDED);
        s.insert(0, &[1; 100]).unwrap();
        assert_eq!(drain(&mut s).len(), 100);
        // The limit is relative to the consumed prefix
        s.insert(150, &[0; 50]).unwrap();
    }

    #[test]
    fn frames_respect_size_and_retransmit_losses() {
        let mut s = stream();
        let data = (0..100u8).collect::<Vec<_>>();
        s.write(&data);
        let first = s.poll_frame(frame::Crypto::SIZE_BOUND + 40).unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.data[..], data[..40]);
        let second = s.poll_frame(1200).unwrap();
        assert_eq!(second.offset, 40);
        assert_eq!(second.data.len(), 60);
        assert!(!s.has_pending());
        assert!(s.poll_frame(1200).is_none());

        s.on_ack(40..100);
        s.on_lost(0..40);
        let retransmit = s.poll_frame(1200).unwrap();
        assert_eq!(retransmit.offset, 0);
        assert_eq!(retransmit.data[..], data[..40]);

        s.on_ack(0..40);
        assert!(!s.requeue_unacked());
    }

    #[test]
    fn lost_data_already_acked_is_not_resent() {
        let mut s = stream();
        s.write(&[7; 30]);
        s.poll_frame(1200).unwrap();
        s.on_ack(10..20);
        s.on_lost(0..30);
        let a = s.poll_frame(1200).unwrap();
        assert_eq!((a.offset, a.data.len()), (0, 10));
        let b = s.poll_frame(1200).unwrap();
        assert_eq!((b.offset, b.data.len()), (20, 10));
    }

    #[test]
    fn discarded_stream_ignores_everything() {
        let mut s = stream();
        s.write(b"abc");
        s.insert(0, b"hi").unwrap();
        assert_eq!(drain(&mut s), b"hi");
        s.discard().unwrap();
        assert!(!s.has_pending());
        s.write(b"def");
        s.insert(0, b"xyz").unwrap();
        assert!(drain(&mut s).is_empty());
        assert!(!s.requeue_unacked());
    }

    #[test]
    fn discarding_unread_data_is_an_error() {
        let mut s = stream();
        s.insert(5, b"later").unwrap();
        let err = s.discard().unwrap_err();
        assert_eq!(err.code, crate::TransportErrorCode::PROTOCOL_VIOLATION);
        // Buffers are gone regardless, and a second discard has nothing to report
        assert!(drain(&mut s).is_empty());
        s.discard().unwrap();
    }

    #[test]
    fn consumed_retransmission_is_not_unread() {
        let mut s = stream();
        s.insert(0, b"hello").unwrap();
        assert_eq!(drain(&mut s), b"hello");
        s.insert(0, b"hel").unwrap();
        s.discard().unwrap();
    }
}
