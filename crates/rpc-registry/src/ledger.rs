//! Outstanding acknowledgment bookkeeping

use crate::connection::ConnectionId;
use crate::protocol::Envelope;
use crate::sync::lock;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An envelope awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct PendingAck<M> {
    /// What was sent
    pub envelope: Envelope,
    /// Connection it was sent on
    pub connection: ConnectionId,
    /// When it was (last) sent
    pub sent_at: Instant,
    /// Side-specific data used to re-validate before a resend
    pub meta: M,
}

impl<M> PendingAck<M> {
    /// Record a send happening now
    pub fn new(envelope: Envelope, connection: ConnectionId, meta: M) -> Self {
        Self {
            envelope,
            connection,
            sent_at: Instant::now(),
            meta,
        }
    }
}

/// Thread-safe map of pending acknowledgments
#[derive(Debug)]
pub struct PendingAckLedger<K, M> {
    entries: Mutex<Entries<K, M>>,
}

#[derive(Debug)]
struct Entries<K, M> {
    outstanding: HashMap<K, PendingAck<M>>,
    // keys handed to a `for_each_expired` callback and not yet acked
    in_flight: HashSet<K>,
}

impl<K, M> Default for PendingAckLedger<K, M> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                outstanding: HashMap::new(),
                in_flight: HashSet::new(),
            }),
        }
    }
}

impl<K, M> PendingAckLedger<K, M>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending acknowledgment, replacing any entry with the same key
    pub fn put(&self, key: K, pending: PendingAck<M>) {
        lock(&self.entries).outstanding.insert(key, pending);
    }

    /// Settle an entry. Returns true if it was still outstanding, including
    /// while a `for_each_expired` callback holds it.
    pub fn remove_if_present(&self, key: &K) -> bool {
        let mut entries = lock(&self.entries);
        entries.outstanding.remove(key).is_some() || entries.in_flight.remove(key)
    }

    /// Put back an entry taken by `for_each_expired`.
    ///
    /// Returns false, dropping the entry, if it was acknowledged while out
    /// of the ledger.
    pub fn rearm(&self, key: K, pending: PendingAck<M>) -> bool {
        let mut entries = lock(&self.entries);
        if !entries.in_flight.remove(&key) {
            return false;
        }
        entries.outstanding.insert(key, pending);
        true
    }

    /// Take every entry sent at least `timeout` before `now` out of the
    /// ledger and hand each to `f`, outside the ledger lock.
    ///
    /// `f` keeps an entry alive by passing it to [`rearm`](Self::rearm).
    /// An ack racing a resend can still let one duplicate reach the peer,
    /// but the acked entry is never tracked again.
    pub fn for_each_expired<F>(&self, now: Instant, timeout: Duration, mut f: F)
    where
        F: FnMut(K, PendingAck<M>),
    {
        let expired: Vec<(K, PendingAck<M>)> = {
            let mut entries = lock(&self.entries);
            let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut entries.outstanding)
                .into_iter()
                .partition(|(_, pending)| now.saturating_duration_since(pending.sent_at) >= timeout);
            entries.outstanding.extend(live);
            entries
                .in_flight
                .extend(expired.iter().map(|(key, _)| key.clone()));
            expired
        };

        let keys: Vec<K> = expired.iter().map(|(key, _)| key.clone()).collect();
        for (key, pending) in expired {
            f(key, pending);
        }

        let mut entries = lock(&self.entries);
        for key in &keys {
            entries.in_flight.remove(key);
        }
    }

    /// Number of outstanding entries
    pub fn len(&self) -> usize {
        lock(&self.entries).outstanding.len()
    }

    /// Whether nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
