//! Bookkeeping for the connection ids issued by each side

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::{
    cid::{ConnectionId, ConnectionIdGenerator, ResetToken},
    crypto::HmacKey,
    frame::NewConnectionId,
    TransportError, LOC_CID_COUNT,
};

/// A connection id we handed to the peer
#[derive(Debug, Copy, Clone)]
pub(crate) struct IssuedCid {
    pub(crate) sequence: u64,
    pub(crate) id: ConnectionId,
    pub(crate) reset_token: ResetToken,
}

/// Connection ids issued by this endpoint that the peer may address packets to
pub(super) struct LocalCids {
    active: BTreeMap<u64, ConnectionId>,
    next_seq: u64,
    /// Number of ids the peer is willing to store
    limit: u64,
}

impl LocalCids {
    /// Track the ids chosen before the handshake: `initial` as sequence 0, and the one advertised
    /// with a preferred address, if any, as sequence 1
    pub(super) fn new(initial: ConnectionId, preferred: Option<ConnectionId>) -> Self {
        let mut active = BTreeMap::new();
        active.insert(0, initial);
        if let Some(id) = preferred {
            active.insert(1, id);
        }
        Self {
            next_seq: active.len() as u64,
            active,
            limit: 1,
        }
    }

    /// Record the peer's `active_connection_id_limit`
    pub(super) fn set_limit(&mut self, limit: u64) {
        self.limit = limit.min(LOC_CID_COUNT);
    }

    /// Issue fresh ids until the peer holds as many as it will store
    pub(super) fn issue(
        &mut self,
        generator: &dyn ConnectionIdGenerator,
        reset_key: &dyn HmacKey,
    ) -> Vec<IssuedCid> {
        let mut issued = Vec::new();
        while (self.active.len() as u64) < self.limit {
            let id = generator.generate_cid();
            let sequence = self.next_seq;
            self.next_seq += 1;
            self.active.insert(sequence, id);
            trace!(sequence, %id, "issuing connection id");
            issued.push(IssuedCid {
                sequence,
                id,
                reset_token: ResetToken::new(reset_key, &id),
            });
        }
        issued
    }

    /// The peer stopped using the id with `sequence`
    ///
    /// `dst_cid` is the destination of the packet carrying the retirement, which may not be the id
    /// being retired.
    pub(super) fn retire(
        &mut self,
        sequence: u64,
        dst_cid: &ConnectionId,
    ) -> Result<Option<ConnectionId>, TransportError> {
        if sequence >= self.next_seq {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for unissued sequence number",
            ));
        }
        if self.active.get(&sequence) == Some(dst_cid) {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "RETIRE_CONNECTION_ID for the id the packet was sent to",
            ));
        }
        Ok(self.active.remove(&sequence))
    }

    pub(super) fn contains(&self, id: &ConnectionId) -> bool {
        self.active.values().any(|x| x == id)
    }

    /// Every id still routed to this connection
    pub(super) fn ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.active.values()
    }
}

/// Connection ids the peer issued for us to address packets to
pub(super) struct RemoteCids {
    active: BTreeMap<u64, (ConnectionId, Option<ResetToken>)>,
    /// Sequence number of the id currently in use
    current: u64,
    retire_prior_to: u64,
    /// Most ids we store, as advertised in our transport parameters
    limit: u64,
}

/// Effects of a NEW_CONNECTION_ID frame
#[derive(Debug, Default)]
pub(super) struct RemoteCidUpdate {
    /// Sequence numbers to send RETIRE_CONNECTION_ID for
    pub(super) retired: Vec<u64>,
    /// The id now in use changed; carries its reset token, if known
    pub(super) switched: Option<Option<ResetToken>>,
}

impl RemoteCids {
    pub(super) fn new(initial: ConnectionId) -> Self {
        let mut active = BTreeMap::new();
        active.insert(0, (initial, None));
        Self {
            active,
            current: 0,
            retire_prior_to: 0,
            limit: LOC_CID_COUNT,
        }
    }

    /// Destination id for outgoing packets
    pub(super) fn current(&self) -> ConnectionId {
        self.active
            .get(&self.current)
            .map_or_else(|| ConnectionId::new(&[]), |x| x.0)
    }

    /// Reset token of the id in use, if the peer supplied one
    #[cfg(test)]
    pub(super) fn current_reset_token(&self) -> Option<ResetToken> {
        self.active.get(&self.current).and_then(|x| x.1)
    }

    /// Replace the id with sequence 0, as a client does once the server picks its own
    pub(super) fn set_initial(&mut self, id: ConnectionId) {
        if let Some(entry) = self.active.get_mut(&0) {
            entry.0 = id;
        }
    }

    /// Attach the reset token sent in the peer's transport parameters to sequence 0
    pub(super) fn set_initial_reset_token(&mut self, token: ResetToken) {
        if let Some(entry) = self.active.get_mut(&0) {
            entry.1 = Some(token);
        }
    }

    /// Register the id carried in a server's preferred address as sequence 1
    pub(super) fn insert_preferred(&mut self, id: ConnectionId, token: ResetToken) {
        self.active.entry(1).or_insert((id, Some(token)));
    }

    pub(super) fn on_new_cid(
        &mut self,
        frame: &NewConnectionId,
    ) -> Result<RemoteCidUpdate, TransportError> {
        if self.current().is_empty() {
            return Err(TransportError::PROTOCOL_VIOLATION(
                "NEW_CONNECTION_ID when the peer uses zero-length ids",
            ));
        }
        if frame.retire_prior_to > frame.sequence {
            return Err(TransportError::FRAME_ENCODING_ERROR(
                "retire_prior_to exceeds sequence number",
            ));
        }

        let mut update = RemoteCidUpdate::default();
        if frame.sequence < self.retire_prior_to {
            // Already retired by an earlier frame
            update.retired.push(frame.sequence);
            return Ok(update);
        }

        match self.active.get(&frame.sequence) {
            Some(&(id, token)) => {
                if id != frame.id || token.is_some_and(|t| t != frame.reset_token) {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "reused connection id sequence number",
                    ));
                }
            }
            None => {
                self.active
                    .insert(frame.sequence, (frame.id, Some(frame.reset_token)));
            }
        }

        if frame.retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = frame.retire_prior_to;
            let kept = self.active.split_off(&frame.retire_prior_to);
            let retired = std::mem::replace(&mut self.active, kept);
            update.retired.extend(retired.into_keys());
            if self.current < self.retire_prior_to {
                if let Some((&seq, &(id, token))) = self.active.iter().next() {
                    debug!(sequence = seq, %id, "switching to new remote connection id");
                    self.current = seq;
                    update.switched = Some(token);
                }
            }
        }

        if self.active.len() as u64 > self.limit {
            return Err(TransportError::CONNECTION_ID_LIMIT_ERROR(""));
        }
        Ok(update)
    }
}
