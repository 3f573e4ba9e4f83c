use bytes::BufMut;
use tracing::trace;

use crate::{
    crypto::{CryptoError, DirectionalKeys},
    packet::{Header, PartialEncode, SpaceId},
};

/// Writes one packet into a datagram buffer
///
/// The header is written by [`PacketBuilder::new`]; frames are then appended directly to the
/// buffer, within [`frame_space_remaining`](Self::frame_space_remaining), and
/// [`finish`](Self::finish) pads and protects the packet.
pub(super) struct PacketBuilder {
    pub(super) space: SpaceId,
    partial_encode: PartialEncode,
    pub(super) exact_number: u64,
    pub(super) ack_eliciting: bool,
    /// Offset of the datagram in the buffer
    datagram_start: usize,
    /// Smallest absolute position in the buffer that must be occupied by this packet's frames
    min_size: usize,
    /// Largest absolute position frames may extend to
    max_size: usize,
    tag_len: usize,
}

impl PacketBuilder {
    /// Write `header` to `buf`, or return `None` when the datagram has no room for a packet
    ///
    /// `datagram_max` is the absolute position in `buf` the datagram may not extend past.
    pub(super) fn new(
        buf: &mut Vec<u8>,
        header: &Header,
        exact_number: u64,
        keys: &DirectionalKeys,
        datagram_start: usize,
        datagram_max: usize,
    ) -> Option<Self> {
        let start = buf.len();
        let partial_encode = header.encode(buf);
        let tag_len = keys.packet.tag_len();
        let pn_len = header.number().map_or(0, |x| x.len());

        // Header protection samples 16 bytes starting 4 bytes past the packet number, and peers
        // must be able to send stateless resets that look like our packets.
        let min_size = Ord::max(
            buf.len() + (keys.header.sample_size() + 4).saturating_sub(pn_len + tag_len),
            start + header.dst_cid().len() + 6,
        );
        let max_size = datagram_max.saturating_sub(tag_len);
        if max_size <= min_size || max_size <= buf.len() {
            buf.truncate(start);
            return None;
        }

        Some(Self {
            space: header.space(),
            partial_encode,
            exact_number,
            ack_eliciting: false,
            datagram_start,
            min_size,
            max_size,
            tag_len,
        })
    }

    /// Ensure the enclosing datagram occupies at least `min_size` bytes once this packet is
    /// finished
    pub(super) fn pad_to(&mut self, min_size: u16) {
        let target = (self.datagram_start + min_size as usize).saturating_sub(self.tag_len);
        self.min_size = Ord::max(self.min_size, target.min(self.max_size));
    }

    /// Bytes of frames that still fit in the packet
    pub(super) fn frame_space_remaining(&self, buf: &[u8]) -> usize {
        self.max_size.saturating_sub(buf.len())
    }

    /// Pad, encrypt and protect the packet, returning its length on the wire
    ///
    /// On failure the packet is removed from `buf`.
    pub(super) fn finish(
        self,
        buf: &mut Vec<u8>,
        keys: &DirectionalKeys,
    ) -> Result<usize, CryptoError> {
        debug_assert!(buf.len() <= self.max_size, "packet exceeds maximum size");
        if buf.len() < self.min_size {
            let padding = self.min_size - buf.len();
            trace!("PADDING * {}", padding);
            buf.put_bytes(0, padding);
        }
        buf.put_bytes(0, self.tag_len);

        let start = self.partial_encode.start;
        let result = self.partial_encode.finish(
            buf,
            &*keys.header,
            Some((self.exact_number, &*keys.packet)),
        );
        if let Err(e) = result {
            buf.truncate(start);
            return Err(e);
        }
        let len = buf.len() - start;
        trace!(space = ?self.space, pn = self.exact_number, len, "wrote packet");
        Ok(len)
    }
}
