//! Loss detection and probe timeouts (RFC 9002), without congestion control

use std::{
    cmp,
    collections::BTreeMap,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    config::TransportConfig, connection::spaces::Retransmits, frame, packet::SpaceId, Side,
    TIMER_GRANULARITY,
};

/// Upper bound on the PTO backoff exponent
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Represents one or more packets subject to retransmission
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    /// The time the packet was sent.
    pub(crate) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP overhead
    pub(crate) size: u16,
    /// Whether an acknowledgement is expected directly in response to this packet.
    pub(crate) ack_eliciting: bool,
    /// Data which needs to be retransmitted in case the packet is lost
    pub(crate) retransmits: Retransmits,
}

/// What became of a packet the tracker stopped following
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Fate {
    Acked,
    Lost,
}

/// Callback receiving every packet whose fate was decided
pub(crate) type OnLossOrAck<'a> = &'a mut dyn FnMut(SpaceId, u64, SentPacket, Fate);

/// Bookkeeping of packets in flight, consumed by a connection
pub(crate) trait LossTracker: Send {
    fn on_packet_sent(&mut self, now: Instant, space: SpaceId, number: u64, packet: SentPacket);

    /// Process an ACK whose ranges were already validated by the connection
    ///
    /// `ack_delay` is the decoded delay field; the tracker decides how much of it to trust.
    fn on_ack_received(
        &mut self,
        now: Instant,
        space: SpaceId,
        ack: &frame::Ack,
        ack_delay: Duration,
        on_loss_or_ack: OnLossOrAck<'_>,
    );

    /// Handle an expired timer
    ///
    /// Returns the space in which probe packets must be sent when a probe timeout fired.
    fn advance(&mut self, now: Instant, on_loss_or_ack: OnLossOrAck<'_>) -> Option<SpaceId>;

    fn confirm_handshake(&mut self);

    /// Forget everything sent in `space`, whose keys are gone
    fn discard_keys(&mut self, now: Instant, space: SpaceId);

    fn set_max_ack_delay(&mut self, max_ack_delay: Duration);

    /// Next time `advance` must be called
    fn timer(&self) -> Option<Instant>;

    /// Current probe timeout, excluding backoff
    fn pto(&self) -> Duration;

    /// Best estimate of the round-trip time
    fn rtt(&self) -> Duration;
}

/// The RTT estimator of RFC 9002 §5
#[derive(Debug, Copy, Clone)]
pub(crate) struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay.
    min: Duration,
}

impl RttEstimator {
    fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation.
    pub(crate) fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Conservative estimate of RTT
    ///
    /// Takes the maximum of smoothed and latest RTT, as recommended
    /// in 6.1.2 of the recovery spec.
    fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

#[derive(Debug, Default)]
struct LossSpace {
    sent_packets: BTreeMap<u64, SentPacket>,
    largest_acked_packet: Option<u64>,
    largest_acked_packet_sent: Option<Instant>,
    time_of_last_ack_eliciting_packet: Option<Instant>,
    /// Earliest time a packet in this space will be declared lost by the time threshold
    loss_time: Option<Instant>,
    ack_eliciting_in_flight: u64,
    discarded: bool,
}

impl LossSpace {
    fn take(&mut self, number: u64) -> Option<SentPacket> {
        let packet = self.sent_packets.remove(&number)?;
        if packet.ack_eliciting {
            self.ack_eliciting_in_flight -= 1;
        }
        Some(packet)
    }
}

/// RFC 9002 loss detection for one connection
pub(crate) struct Recovery {
    side: Side,
    rtt: RttEstimator,
    spaces: [LossSpace; 3],
    pto_count: u32,
    max_ack_delay: Duration,
    packet_threshold: u64,
    time_threshold: f32,
    initial_rtt: Duration,
    handshake_confirmed: bool,
    /// Largest datagram we expect to send; only used to sanity-check sizes
    max_datagram_size: u16,
    timer: Option<Instant>,
}

impl Recovery {
    pub(crate) fn new(side: Side, config: &TransportConfig, max_datagram_size: u16) -> Self {
        Self {
            side,
            rtt: RttEstimator::new(config.initial_rtt),
            spaces: Default::default(),
            pto_count: 0,
            // Until the peer says otherwise, RFC 9000 §18.2 default
            max_ack_delay: Duration::from_millis(25),
            packet_threshold: config.packet_threshold.into(),
            time_threshold: config.time_threshold,
            initial_rtt: config.initial_rtt,
            handshake_confirmed: false,
            max_datagram_size,
            timer: None,
        }
    }

    fn space(&mut self, id: SpaceId) -> &mut LossSpace {
        &mut self.spaces[id as usize]
    }

    fn ack_eliciting_in_flight(&self) -> u64 {
        self.spaces.iter().map(|x| x.ack_eliciting_in_flight).sum()
    }

    fn earliest_time_and_space(
        &self,
        get: impl Fn(&LossSpace) -> Option<Instant>,
    ) -> Option<(Instant, SpaceId)> {
        SpaceId::iter()
            // Application data probes wait for the handshake to be confirmed
            .filter(|&id| id != SpaceId::Data || self.handshake_confirmed)
            .filter(|&id| !self.spaces[id as usize].discarded)
            .filter_map(|id| get(&self.spaces[id as usize]).map(|x| (x, id)))
            .min_by_key(|&(time, _)| time)
    }

    /// Whether the server might still be limited by anti-amplification on our behalf
    fn peer_awaiting_address_validation(&self) -> bool {
        self.side.is_client()
            && !self.handshake_confirmed
            && self.spaces[SpaceId::Handshake as usize]
                .largest_acked_packet
                .is_none()
    }

    fn detect_lost_packets(&mut self, now: Instant, id: SpaceId, on_loss_or_ack: OnLossOrAck<'_>) {
        let loss_delay = cmp::max(
            self.rtt.conservative().mul_f32(self.time_threshold),
            TIMER_GRANULARITY,
        );
        let packet_threshold = self.packet_threshold;
        let space = self.space(id);
        let Some(largest_acked) = space.largest_acked_packet else {
            return;
        };

        // Packets sent before this time are deemed lost.
        let lost_send_time = now.checked_sub(loss_delay);
        let mut lost_packets = Vec::new();
        space.loss_time = None;
        for (&number, info) in space.sent_packets.range(0..largest_acked) {
            if lost_send_time.is_some_and(|t| info.time_sent <= t)
                || largest_acked >= number + packet_threshold
            {
                lost_packets.push(number);
            } else {
                let next_loss_time = info.time_sent + loss_delay;
                space.loss_time = Some(
                    space
                        .loss_time
                        .map_or(next_loss_time, |x| cmp::min(x, next_loss_time)),
                );
            }
        }

        if !lost_packets.is_empty() {
            trace!(space = ?id, "packets lost: {:?}", lost_packets);
        }
        for number in lost_packets {
            if let Some(info) = space.take(number) {
                on_loss_or_ack(id, number, info, Fate::Lost);
            }
        }
    }

    fn set_loss_detection_timer(&mut self) {
        if let Some((loss_time, _)) = self.earliest_time_and_space(|x| x.loss_time) {
            // Time threshold loss detection.
            self.timer = Some(loss_time);
            return;
        }

        // Don't arm timer if there are no ack-eliciting packets in flight and the peer can't be
        // blocked on us.
        if self.ack_eliciting_in_flight() == 0 && !self.peer_awaiting_address_validation() {
            self.timer = None;
            return;
        }

        let backoff = 2u32.pow(cmp::min(self.pto_count, MAX_BACKOFF_EXPONENT));
        self.timer = self
            .earliest_time_and_space(|x| x.time_of_last_ack_eliciting_packet)
            .map(|(sent_time, _)| sent_time + self.pto() * backoff);
    }
}

impl LossTracker for Recovery {
    fn on_packet_sent(&mut self, now: Instant, space: SpaceId, number: u64, packet: SentPacket) {
        debug_assert!(packet.size <= self.max_datagram_size.max(crate::MAX_UDP_PAYLOAD));
        let ack_eliciting = packet.ack_eliciting;
        let loss_space = self.space(space);
        if loss_space.discarded {
            return;
        }
        if ack_eliciting {
            loss_space.ack_eliciting_in_flight += 1;
            loss_space.time_of_last_ack_eliciting_packet = Some(now);
        }
        loss_space.sent_packets.insert(number, packet);
        if ack_eliciting {
            self.set_loss_detection_timer();
        }
    }

    fn on_ack_received(
        &mut self,
        now: Instant,
        id: SpaceId,
        ack: &frame::Ack,
        ack_delay: Duration,
        on_loss_or_ack: OnLossOrAck<'_>,
    ) {
        let max_ack_delay = self.max_ack_delay;
        let space = self.space(id);
        if space.discarded {
            return;
        }
        let new_largest = space.largest_acked_packet.map_or(true, |pn| ack.largest > pn);
        if new_largest {
            space.largest_acked_packet = Some(ack.largest);
            if let Some(info) = space.sent_packets.get(&ack.largest) {
                space.largest_acked_packet_sent = Some(info.time_sent);
            }
        }

        // Only touch packets still tracked, so huge ranges cost nothing.
        let newly_acked = ack
            .iter()
            .flat_map(|range| space.sent_packets.range(range).map(|(&n, _)| n))
            .collect::<Vec<_>>();
        if newly_acked.is_empty() {
            return;
        }

        let mut ack_eliciting_acked = false;
        for number in newly_acked {
            if let Some(info) = space.take(number) {
                ack_eliciting_acked |= info.ack_eliciting;
                on_loss_or_ack(id, number, info, Fate::Acked);
            }
        }

        let largest_sent = space.largest_acked_packet_sent;
        if new_largest && ack_eliciting_acked {
            let ack_delay = if id != SpaceId::Data {
                Duration::ZERO
            } else {
                cmp::min(max_ack_delay, ack_delay)
            };
            if let Some(sent) = largest_sent {
                self.rtt.update(ack_delay, now.saturating_duration_since(sent));
            }
        }

        self.detect_lost_packets(now, id, on_loss_or_ack);
        self.pto_count = 0;
        self.set_loss_detection_timer();
    }

    fn advance(&mut self, now: Instant, on_loss_or_ack: OnLossOrAck<'_>) -> Option<SpaceId> {
        if self.timer.map_or(true, |t| t > now) {
            return None;
        }

        if let Some((_, space)) = self.earliest_time_and_space(|x| x.loss_time) {
            // Time threshold loss detection
            self.detect_lost_packets(now, space, on_loss_or_ack);
            self.set_loss_detection_timer();
            return None;
        }

        let space = self
            .earliest_time_and_space(|x| x.time_of_last_ack_eliciting_packet)
            .map_or(SpaceId::Handshake, |(_, space)| space);
        trace!(count = self.pto_count, ?space, "PTO fired");
        self.pto_count = self.pto_count.saturating_add(1);
        self.set_loss_detection_timer();
        Some(space)
    }

    fn confirm_handshake(&mut self) {
        self.handshake_confirmed = true;
        self.set_loss_detection_timer();
    }

    fn discard_keys(&mut self, _now: Instant, id: SpaceId) {
        debug_assert!(id != SpaceId::Data, "application data keys are never discarded");
        let space = self.space(id);
        if space.discarded {
            return;
        }
        trace!(space = ?id, in_flight = space.sent_packets.len(), "discarding loss state");
        *space = LossSpace {
            discarded: true,
            ..LossSpace::default()
        };
        self.pto_count = 0;
        self.set_loss_detection_timer();
    }

    fn set_max_ack_delay(&mut self, max_ack_delay: Duration) {
        self.max_ack_delay = max_ack_delay;
    }

    fn timer(&self) -> Option<Instant> {
        self.timer
    }

    fn rtt(&self) -> Duration {
        self.rtt.get()
    }

    fn pto(&self) -> Duration {
        match self.rtt.smoothed {
            None => 2 * self.initial_rtt,
            Some(srtt) => {
                let ack_delay = if self.handshake_confirmed {
                    self.max_ack_delay
                } else {
                    Duration::ZERO
                };
                srtt + cmp::max(4 * self.rtt.var, TIMER_GRANULARITY) + ack_delay
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range_set::RangeSet;

    fn packet(now: Instant) -> SentPacket {
        SentPacket {
            time_sent: now,
            size: 100,
            ack_eliciting: true,
            retransmits: Retransmits::default(),
        }
    }

    fn ack(ranges: &[std::ops::Range<u64>]) -> frame::Ack {
        let mut set = RangeSet::new();
        for range in ranges {
            set.insert(range.clone());
        }
        let mut buf = Vec::new();
        frame::Ack::encode(0, &set, &mut buf);
        let frames = frame::Iter::new(buf.into())
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        match frames.into_iter().next() {
            Some(frame::Frame::Ack(ack)) => ack,
            _ => unreachable!(),
        }
    }

    fn recovery() -> Recovery {
        Recovery::new(Side::Server, &TransportConfig::default(), 1200)
    }

    #[test]
    fn ack_reports_fates() {
        let mut r = recovery();
        let now = Instant::now();
        for pn in 0..6 {
            r.on_packet_sent(now, SpaceId::Initial, pn, packet(now));
        }
        assert!(r.timer().is_some());

        let mut fates = Vec::new();
        let later = now + Duration::from_millis(50);
        r.on_ack_received(
            later,
            SpaceId::Initial,
            &ack(&[4..5]),
            Duration::ZERO,
            &mut |_, pn, _, fate| fates.push((pn, fate)),
        );
        fates.sort_by_key(|x| x.0);
        // 0 and 1 are three or more below the largest acknowledged
        assert_eq!(
            fates,
            [(0, Fate::Lost), (1, Fate::Lost), (4, Fate::Acked)]
        );
        assert_eq!(r.rtt(), Duration::from_millis(50));
        // 2 and 3 remain, lost by time threshold later
        let timer = r.timer().unwrap();
        assert!(timer > later);
        let mut lost = Vec::new();
        assert_eq!(r.advance(timer, &mut |_, pn, _, _| lost.push(pn)), None);
        assert_eq!(lost, [2, 3]);
        // 5 is still outstanding, so a probe timeout is armed
        assert!(r.timer().unwrap() > timer);
    }

    #[test]
    fn pto_backs_off() {
        let mut r = recovery();
        let now = Instant::now();
        r.on_packet_sent(now, SpaceId::Handshake, 0, packet(now));
        let first = r.timer().unwrap();
        assert_eq!(first, now + 2 * TransportConfig::default().initial_rtt);
        assert_eq!(r.advance(first, &mut |_, _, _, _| {}), Some(SpaceId::Handshake));
        let second = r.timer().unwrap();
        assert_eq!(second - now, 2 * (first - now));
    }

    #[test]
    fn data_space_waits_for_confirmation() {
        let mut r = recovery();
        let now = Instant::now();
        r.on_packet_sent(now, SpaceId::Data, 0, packet(now));
        assert_eq!(r.timer(), None);
        r.confirm_handshake();
        assert!(r.timer().is_some());
    }

    #[test]
    fn discarded_space_is_forgotten() {
        let mut r = recovery();
        let now = Instant::now();
        r.on_packet_sent(now, SpaceId::Initial, 0, packet(now));
        r.discard_keys(now, SpaceId::Initial);
        assert_eq!(r.timer(), None);
        // Repeated discards and late traffic are harmless
        r.discard_keys(now, SpaceId::Initial);
        r.on_packet_sent(now, SpaceId::Initial, 1, packet(now));
        let mut called = false;
        r.on_ack_received(now, SpaceId::Initial, &ack(&[0..2]), Duration::ZERO, &mut |_, _, _, _| {
            called = true
        });
        assert!(!called);
        assert_eq!(r.timer(), None);
    }

    #[test]
    fn client_probes_until_server_validates() {
        let mut r = Recovery::new(Side::Client, &TransportConfig::default(), 1200);
        let now = Instant::now();
        r.on_packet_sent(now, SpaceId::Initial, 0, packet(now));
        r.on_ack_received(now, SpaceId::Initial, &ack(&[0..1]), Duration::ZERO, &mut |_, _, _, _| {});
        // Nothing in flight, but the server may be blocked by its amplification limit
        assert!(r.timer().is_some());
    }
}
