//! State of the single network path a connection uses

use crate::{frame, TransportError, MIN_INITIAL_SIZE};

/// Encoded size of a PATH_RESPONSE frame
pub(crate) const PATH_RESPONSE_SIZE: usize = 9;

/// The outstanding obligation to answer a PATH_CHALLENGE
///
/// Connections never probe paths themselves, so at most one response is owed at any time and
/// a newer challenge replaces an unanswered one.
#[derive(Debug, Default)]
pub(crate) struct PathValidation {
    pending: Option<PendingResponse>,
}

#[derive(Debug, Copy, Clone)]
struct PendingResponse {
    payload: u64,
    /// The challenge arrived in an expanded datagram, so the response must be one too
    pad: bool,
}

impl PathValidation {
    pub(crate) fn on_challenge(&mut self, payload: u64, datagram_len: usize) {
        self.pending = Some(PendingResponse {
            payload,
            pad: datagram_len >= MIN_INITIAL_SIZE as usize,
        });
    }

    /// We never send PATH_CHALLENGE, so any response is unsolicited
    pub(crate) fn on_response(&self, _payload: u64) -> Result<(), TransportError> {
        Err(
            TransportError::PROTOCOL_VIOLATION("unsolicited PATH_RESPONSE")
                .with_frame(frame::FrameType::PATH_RESPONSE),
        )
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Append the owed PATH_RESPONSE if it fits in `budget` bytes
    ///
    /// Returns whether the datagram carrying it must be padded to `MIN_INITIAL_SIZE`, or `None`
    /// if nothing was written. The obligation is kept until the frame is actually written.
    pub(crate) fn write(&mut self, buf: &mut Vec<u8>, budget: usize) -> Option<bool> {
        let pending = self.pending?;
        if budget < PATH_RESPONSE_SIZE {
            return None;
        }
        frame::encode_path_response(pending.payload, buf);
        self.pending = None;
        Some(pending.pad)
    }
}

/// Anti-amplification accounting for a peer address (RFC 9000 §8.1)
#[derive(Debug)]
pub(crate) struct AmplificationBudget {
    validated: bool,
    received: u64,
    sent: u64,
}

impl AmplificationBudget {
    /// A budget for a peer address that is (or is not yet) known to belong to the peer
    pub(crate) fn new(validated: bool) -> Self {
        Self {
            validated,
            received: 0,
            sent: 0,
        }
    }

    pub(crate) fn on_received(&mut self, bytes: usize) {
        self.received = self.received.saturating_add(bytes as u64);
    }

    pub(crate) fn on_sent(&mut self, bytes: usize) {
        self.sent = self.sent.saturating_add(bytes as u64);
    }

    pub(crate) fn validate(&mut self) {
        self.validated = true;
    }

    #[cfg(test)]
    pub(crate) fn is_validated(&self) -> bool {
        self.validated
    }

    /// Number of bytes that may still be sent
    pub(crate) fn remaining(&self) -> usize {
        if self.validated {
            return usize::MAX;
        }
        let limit = self.received.saturating_mul(3);
        limit.saturating_sub(self.sent).try_into().unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{frame::Frame, TransportErrorCode};

    fn decode(buf: Vec<u8>) -> Vec<Frame> {
        frame::Iter::new(Bytes::from(buf))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn response_echoes_payload() {
        let mut path = PathValidation::default();
        path.on_challenge(0x1122_3344_5566_7788, 80);
        let mut buf = Vec::new();
        assert_eq!(path.write(&mut buf, 1000), Some(false));
        assert!(!path.is_pending());
        assert_eq!(buf[1..], [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
        assert!(matches!(decode(buf)[..], [Frame::PathResponse(0x1122_3344_5566_7788)]));
    }

    #[test]
    fn padding_follows_challenge_datagram() {
        let mut path = PathValidation::default();
        path.on_challenge(1, MIN_INITIAL_SIZE as usize - 1);
        assert_eq!(path.write(&mut Vec::new(), 100), Some(false));
        path.on_challenge(2, MIN_INITIAL_SIZE as usize);
        assert_eq!(path.write(&mut Vec::new(), 100), Some(true));
    }

    #[test]
    fn tiny_budget_defers_response() {
        let mut path = PathValidation::default();
        path.on_challenge(5, 1500);
        let mut buf = Vec::new();
        for _ in 0..3 {
            assert_eq!(path.write(&mut buf, PATH_RESPONSE_SIZE - 1), None);
            assert!(buf.is_empty());
            assert!(path.is_pending());
        }
        assert_eq!(path.write(&mut buf, PATH_RESPONSE_SIZE), Some(true));
        assert_eq!(buf.len(), PATH_RESPONSE_SIZE);
        assert_eq!(path.write(&mut buf, 100), None);
    }

    #[test]
    fn newer_challenge_replaces_older() {
        let mut path = PathValidation::default();
        path.on_challenge(1, 100);
        path.on_challenge(2, 100);
        let mut buf = Vec::new();
        path.write(&mut buf, 100);
        assert!(matches!(decode(buf)[..], [Frame::PathResponse(2)]));
    }

    #[test]
    fn unsolicited_response() {
        let path = PathValidation::default();
        let err = path.on_response(42).unwrap_err();
        assert_eq!(err.code, TransportErrorCode::PROTOCOL_VIOLATION);
        assert_eq!(err.frame, Some(frame::FrameType::PATH_RESPONSE));
    }

    #[test]
    fn amplification_limit() {
        let mut budget = AmplificationBudget::new(false);
        assert_eq!(budget.remaining(), 0);
        budget.on_received(1200);
        assert_eq!(budget.remaining(), 3600);
        budget.on_sent(3000);
        assert_eq!(budget.remaining(), 600);
        budget.on_sent(1200);
        assert_eq!(budget.remaining(), 0);
        budget.validate();
        assert_eq!(budget.remaining(), usize::MAX);
        assert!(budget.is_validated());
    }
}
