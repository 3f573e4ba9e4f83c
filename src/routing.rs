//! Endpoint-wide map from connection ids and reset tokens to connections
//!
//! The receive loop owns the lookup maps outright. Connections never touch them; they queue
//! [`RouteUpdate`]s on the shared [`RouteUpdates`], which the receive loop applies in a batch
//! before handling its next datagram.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::cid::{ConnectionId, ResetToken};

/// Internal identifier for a connection within an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

/// A structural change to the routing table
#[derive(Debug)]
pub(crate) enum RouteUpdate<T> {
    InsertId {
        id: ConnectionId,
        owner: ConnectionHandle,
        target: T,
    },
    RemoveId {
        id: ConnectionId,
        owner: ConnectionHandle,
    },
    InsertToken {
        token: ResetToken,
        owner: ConnectionHandle,
        target: T,
    },
    RemoveToken {
        token: ResetToken,
        owner: ConnectionHandle,
    },
}

/// Queue of updates waiting for the receive loop
#[derive(Debug)]
pub(crate) struct RouteUpdates<T> {
    queue: Mutex<Vec<RouteUpdate<T>>>,
    pending: AtomicBool,
}

impl<T> RouteUpdates<T> {
    pub(crate) fn push(&self, update: RouteUpdate<T>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
        self.pending.store(true, Ordering::Release);
    }

    pub(crate) fn extend(&self, updates: impl IntoIterator<Item = RouteUpdate<T>>) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(updates);
        self.pending.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<Vec<RouteUpdate<T>>> {
        if !self.pending.swap(false, Ordering::AcqRel) {
            return None;
        }
        Some(std::mem::take(
            &mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner),
        ))
    }
}

/// The lookup side of the table, owned by the endpoint's receive loop
#[derive(Debug)]
pub(crate) struct RoutingTable<T> {
    ids: FxHashMap<ConnectionId, Route<T>>,
    tokens: FxHashMap<ResetToken, Route<T>>,
    updates: Arc<RouteUpdates<T>>,
}

#[derive(Debug)]
struct Route<T> {
    owner: ConnectionHandle,
    target: T,
}

impl<T> RoutingTable<T> {
    pub(crate) fn new() -> Self {
        Self {
            ids: FxHashMap::default(),
            tokens: FxHashMap::default(),
            updates: Arc::new(RouteUpdates {
                queue: Mutex::new(Vec::new()),
                pending: AtomicBool::new(false),
            }),
        }
    }

    /// Handle through which connections queue their changes
    pub(crate) fn updates(&self) -> Arc<RouteUpdates<T>> {
        self.updates.clone()
    }

    /// Apply everything queued since the last call
    ///
    /// Cheap when nothing is pending: a single atomic swap.
    pub(crate) fn apply_updates(&mut self) {
        let Some(updates) = self.updates.take() else {
            return;
        };
        for update in updates {
            self.apply(update);
        }
    }

    fn apply(&mut self, update: RouteUpdate<T>) {
        match update {
            RouteUpdate::InsertId { id, owner, target } => {
                trace!(%id, ?owner, "route connection id");
                if let Some(old) = self.ids.insert(id, Route { owner, target }) {
                    debug_assert_eq!(old.owner, owner, "connection id collision");
                }
            }
            RouteUpdate::RemoveId { id, owner } => {
                if self.ids.get(&id).is_some_and(|x| x.owner == owner) {
                    trace!(%id, ?owner, "unroute connection id");
                    self.ids.remove(&id);
                }
            }
            RouteUpdate::InsertToken {
                token,
                owner,
                target,
            } => {
                self.tokens.insert(token, Route { owner, target });
            }
            RouteUpdate::RemoveToken { token, owner } => {
                if self.tokens.get(&token).is_some_and(|x| x.owner == owner) {
                    self.tokens.remove(&token);
                }
            }
        }
    }

    pub(crate) fn get(&self, id: &ConnectionId) -> Option<(ConnectionHandle, &T)> {
        self.ids.get(id).map(|x| (x.owner, &x.target))
    }

    pub(crate) fn get_by_token(&self, token: &ResetToken) -> Option<(ConnectionHandle, &T)> {
        self.tokens.get(token).map(|x| (x.owner, &x.target))
    }

    /// Route an id immediately, bypassing the queue
    ///
    /// Only the receive loop itself may do this, when it admits a new connection.
    pub(crate) fn insert_now(&mut self, id: ConnectionId, owner: ConnectionHandle, target: T) {
        self.apply(RouteUpdate::InsertId { id, owner, target });
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &ConnectionId) -> bool {
        self.ids.contains_key(id)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionHandle = ConnectionHandle(1);
    const B: ConnectionHandle = ConnectionHandle(2);

    fn cid(x: u8) -> ConnectionId {
        ConnectionId::new(&[x; 8])
    }

    #[test]
    fn updates_apply_in_batch() {
        let mut table = RoutingTable::<&'static str>::new();
        let updates = table.updates();
        updates.push(RouteUpdate::InsertId {
            id: cid(1),
            owner: A,
            target: "a",
        });
        updates.push(RouteUpdate::InsertToken {
            token: [7; 16].into(),
            owner: A,
            target: "a",
        });
        assert!(table.get(&cid(1)).is_none());

        table.apply_updates();
        assert_eq!(table.get(&cid(1)), Some((A, &"a")));
        assert_eq!(table.get_by_token(&[7; 16].into()), Some((A, &"a")));
        assert!(table.get_by_token(&[8; 16].into()).is_none());
    }

    #[test]
    fn stale_removal_keeps_new_owner() {
        let mut table = RoutingTable::new();
        let updates = table.updates();
        table.insert_now(cid(1), A, 10);
        updates.extend([
            RouteUpdate::RemoveId { id: cid(1), owner: A },
            RouteUpdate::InsertId {
                id: cid(1),
                owner: B,
                target: 20,
            },
        ]);
        table.apply_updates();
        assert_eq!(table.get(&cid(1)), Some((B, &20)));

        // A's late retirement must not unroute B
        updates.push(RouteUpdate::RemoveId { id: cid(1), owner: A });
        table.apply_updates();
        assert_eq!(table.get(&cid(1)), Some((B, &20)));

        updates.push(RouteUpdate::RemoveId { id: cid(1), owner: B });
        table.apply_updates();
        assert!(!table.contains(&cid(1)));
        assert!(table.is_empty());
    }

    #[test]
    fn token_removal_checks_owner() {
        let mut table = RoutingTable::new();
        let updates = table.updates();
        let token = ResetToken::from([3; 16]);
        updates.push(RouteUpdate::InsertToken {
            token,
            owner: A,
            target: (),
        });
        updates.push(RouteUpdate::RemoveToken { token, owner: B });
        table.apply_updates();
        assert!(table.get_by_token(&token).is_some());
        updates.push(RouteUpdate::RemoveToken { token, owner: A });
        table.apply_updates();
        assert!(table.get_by_token(&token).is_none());
    }

    #[test]
    fn concurrent_producers() {
        let mut table = RoutingTable::new();
        let threads = (0..4u8)
            .map(|t| {
                let updates = table.updates();
                std::thread::spawn(move || {
                    for i in 0..50u8 {
                        updates.push(RouteUpdate::InsertId {
                            id: ConnectionId::new(&[t, i]),
                            owner: ConnectionHandle(t as usize),
                            target: (),
                        });
                    }
                })
            })
            .collect::<Vec<_>>();
        for thread in threads {
            thread.join().unwrap();
        }
        table.apply_updates();
        assert_eq!(table.ids.len(), 200);
        assert_eq!(table.get(&ConnectionId::new(&[3, 49])).map(|x| x.0), Some(ConnectionHandle(3)));
    }
}
