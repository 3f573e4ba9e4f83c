use std::{
    ops::Range,
    time::{Duration, Instant},
};

use tracing::trace;

use super::{cid_state::IssuedCid, crypto_stream::CryptoStream};
use crate::{
    crypto::DirectionalKeys, frame, packet::SpaceId, range_set::RangeSet,
    sparse_window::ChunkPool, TransportError,
};

/// Most ranges kept for acknowledgement; older ones are forgotten
const MAX_ACK_RANGES: usize = 64;

/// Number of ack-eliciting packets after which an ACK is sent without waiting
const ACK_ELICITING_THRESHOLD: u32 = 2;

pub(super) struct PacketSpace {
    pub(super) read_keys: Option<DirectionalKeys>,
    pub(super) write_keys: Option<DirectionalKeys>,
    pub(super) crypto_stream: CryptoStream,
    /// Data to send
    pub(super) pending: Retransmits,
    /// Packet numbers to acknowledge
    pub(super) pending_acks: PendingAcks,
    /// Whether a PING must be sent to elicit an acknowledgement
    pub(super) ping_pending: bool,
    /// Number of tail loss probes to send
    pub(super) loss_probes: u32,

    /// The packet number of the next packet that will be sent, if any
    pub(super) next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(super) largest_acked_packet: Option<u64>,
    /// Keys were released and the space will never be used again
    pub(super) discarded: bool,
}

impl PacketSpace {
    pub(super) fn new(pool: ChunkPool, crypto_buffer_size: usize) -> Self {
        Self {
            read_keys: None,
            write_keys: None,
            crypto_stream: CryptoStream::new(pool, crypto_buffer_size),
            pending: Retransmits::default(),
            pending_acks: PendingAcks::default(),
            ping_pending: false,
            loss_probes: 0,

            next_packet_number: 0,
            largest_acked_packet: None,
            discarded: false,
        }
    }

    /// Whether anything ack-eliciting is waiting to be sent
    pub(super) fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.ping_pending || self.crypto_stream.has_pending()
    }

    /// Queue data for a tail loss probe
    ///
    /// Unacknowledged crypto data is retransmitted when there is nothing new to send, and a PING
    /// is used when there is nothing at all.
    pub(super) fn ensure_probe_queued(&mut self) {
        if self.has_pending() {
            return;
        }
        if self.crypto_stream.requeue_unacked() {
            return;
        }
        self.ping_pending = true;
    }

    /// Release the keys, buffers and bookkeeping of a space that will not be used again
    ///
    /// Everything is released even when the peer left handshake data unconsumed, which is
    /// reported as an error.
    pub(super) fn discard(&mut self) -> Result<(), TransportError> {
        trace!("discarding keys");
        self.read_keys = None;
        self.write_keys = None;
        self.pending = Retransmits::default();
        self.pending_acks = PendingAcks::default();
        self.ping_pending = false;
        self.loss_probes = 0;
        self.discarded = true;
        self.crypto_stream.discard()
    }
}

/// Frames that must be sent again if the packet carrying them is lost
#[derive(Debug, Default, Clone)]
pub(crate) struct Retransmits {
    pub(super) crypto: Vec<Range<u64>>,
    pub(super) handshake_done: bool,
    pub(super) new_cids: Vec<IssuedCid>,
    pub(super) retire_cids: Vec<u64>,
}

impl Retransmits {
    pub(super) fn is_empty(&self) -> bool {
        self.crypto.is_empty()
            && !self.handshake_done
            && self.new_cids.is_empty()
            && self.retire_cids.is_empty()
    }
}

impl ::std::ops::AddAssign for Retransmits {
    fn add_assign(&mut self, rhs: Self) {
        // We reduce in-stream head-of-line blocking by queueing retransmits before other data for
        // STREAM and CRYPTO frames.
        self.crypto.extend(rhs.crypto);
        self.handshake_done |= rhs.handshake_done;
        self.new_cids.extend(rhs.new_cids);
        self.retire_cids.extend(rhs.retire_cids);
    }
}

/// Received packet numbers awaiting acknowledgement
#[derive(Debug, Default)]
pub(super) struct PendingAcks {
    ranges: RangeSet,
    /// Packet numbers below this were forgotten and are treated as duplicates
    floor: u64,
    /// Receipt time of the largest packet number received
    largest_received_time: Option<Instant>,
    /// Something was received since the last ACK was sent
    dirty: bool,
    ack_eliciting_since_last_ack: u32,
    /// An ACK must be sent as soon as possible
    immediate: bool,
    /// Latest time an ACK for ack-eliciting Data packets may be delayed to
    deadline: Option<Instant>,
}

impl PendingAcks {
    /// Whether `number` may already have been processed
    pub(super) fn is_duplicate(&self, number: u64) -> bool {
        number < self.floor || self.ranges.contains(number)
    }

    /// Record receipt of an authenticated packet
    pub(super) fn on_packet(
        &mut self,
        now: Instant,
        space: SpaceId,
        number: u64,
        ack_eliciting: bool,
        max_ack_delay: Duration,
    ) {
        if self.ranges.max().map_or(true, |largest| number > largest) {
            self.largest_received_time = Some(now);
        }
        self.ranges.insert_one(number);
        while self.ranges.len() > MAX_ACK_RANGES {
            if let Some(oldest) = self.ranges.pop_min() {
                self.floor = oldest.end;
            }
        }
        self.dirty = true;
        if !ack_eliciting {
            return;
        }
        self.ack_eliciting_since_last_ack += 1;
        if space != SpaceId::Data || self.ack_eliciting_since_last_ack >= ACK_ELICITING_THRESHOLD
        {
            self.immediate = true;
        } else if self.deadline.is_none() {
            self.deadline = Some(now + max_ack_delay);
        }
    }

    /// Whether an ACK-only packet is warranted
    pub(super) fn ack_required(&self, now: Instant) -> bool {
        self.immediate || self.deadline.is_some_and(|t| t <= now)
    }

    /// Whether an ACK frame would tell the peer something new
    pub(super) fn can_send(&self) -> bool {
        self.dirty && !self.ranges.is_empty()
    }

    /// Time at which a delayed ACK becomes due
    pub(super) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Largest packet number received
    pub(super) fn largest(&self) -> Option<u64> {
        self.ranges.max()
    }

    /// Upper bound on the size of the ACK frame [`write`](Self::write) would produce
    pub(super) fn size_bound(&self) -> usize {
        1 + 8 + 8 + 8 + 8 + self.ranges.len() * 16
    }

    /// Append an ACK frame, resetting the acknowledgement obligation
    pub(super) fn write(&mut self, now: Instant, ack_delay_exponent: u8, buf: &mut Vec<u8>) {
        let delay_micros = self
            .largest_received_time
            .map_or(0, |t| now.saturating_duration_since(t).as_micros() as u64);
        let delay = delay_micros >> ack_delay_exponent;
        trace!(ranges = ?self.ranges, delay, "ACK");
        frame::Ack::encode(delay, &self.ranges, buf);
        self.dirty = false;
        self.immediate = false;
        self.deadline = None;
        self.ack_eliciting_since_last_ack = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_acks_are_delayed() {
        let now = Instant::now();
        let delay = Duration::from_millis(25);
        let mut acks = PendingAcks::default();
        acks.on_packet(now, SpaceId::Data, 0, true, delay);
        assert!(!acks.ack_required(now));
        assert_eq!(acks.deadline(), Some(now + delay));
        assert!(acks.ack_required(now + delay));

        acks.on_packet(now, SpaceId::Data, 1, true, delay);
        assert!(acks.ack_required(now));
        acks.write(now, 3, &mut Vec::new());
        assert!(!acks.ack_required(now + delay));
        assert!(!acks.can_send());
    }

    #[test]
    fn handshake_acks_are_immediate() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        acks.on_packet(now, SpaceId::Handshake, 0, false, Duration::ZERO);
        assert!(!acks.ack_required(now));
        assert!(acks.can_send());
        acks.on_packet(now, SpaceId::Handshake, 1, true, Duration::ZERO);
        assert!(acks.ack_required(now));
    }

    #[test]
    fn old_ranges_are_forgotten() {
        let now = Instant::now();
        let mut acks = PendingAcks::default();
        for i in 0..(MAX_ACK_RANGES as u64 + 10) {
            acks.on_packet(now, SpaceId::Data, i * 2, false, Duration::ZERO);
        }
        assert_eq!(acks.ranges.len(), MAX_ACK_RANGES);
        // Forgotten numbers are reported as duplicates rather than accepted twice
        assert!(acks.is_duplicate(1));
        assert!(acks.is_duplicate(0));
        assert!(!acks.is_duplicate(MAX_ACK_RANGES as u64 * 2 + 21));
    }
}
