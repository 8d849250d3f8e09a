//! Fairness Registry: reapportions the global rate across active connections.
//!
//! The registry tracks per-connection [`crate::bucket::TokenBucket`]s plus a
//! single global bucket guarding the aggregate ceiling. A connection counts
//! toward the split only while it has been seen within `active_window`; once
//! quieter than that it is quenched to a near-zero rate (not removed — a
//! quick reconnect should not pay the cost of a fresh bucket) and is only
//! dropped from the map once it has been idle past `idle_evict_threshold`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::clock::Instant;

/// Rate assigned to a connection that hasn't been seen within the active
/// window: effectively zero, but strictly positive so `take()` reports a
/// long-but-finite wait instead of dividing by zero.
const QUENCHED_RATE: f64 = 1e-9;

/// A single connection's fair-share allowance plus its last-seen time, used
/// for active/idle classification.
pub struct Connection {
    bucket: Mutex<crate::bucket::TokenBucket>,
    last_seen: Mutex<Instant>,
}

impl Connection {
    pub fn bucket(&self) -> &Mutex<crate::bucket::TokenBucket> {
        &self.bucket
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().expect("connection lock poisoned")
    }
}

/// Tracks active connections and reapportions `global_rate / 60` across them.
pub struct Registry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    global: Mutex<crate::bucket::TokenBucket>,
    global_rate_per_minute: f64,
    burst_window_secs: f64,
    active_window_secs: f64,
    idle_evict_threshold_secs: f64,
}

impl Registry {
    pub fn new(
        global_rate_per_minute: f64,
        global_capacity: f64,
        burst_window_secs: f64,
        active_window_secs: f64,
        idle_evict_threshold_secs: f64,
        now: Instant,
    ) -> Self {
        let per_second = global_rate_per_minute / 60.0;
        Self {
            connections: RwLock::new(HashMap::new()),
            global: Mutex::new(crate::bucket::TokenBucket::new(
                per_second,
                global_capacity.max(1.0),
                now,
            )),
            global_rate_per_minute,
            burst_window_secs,
            active_window_secs,
            idle_evict_threshold_secs,
        }
    }

    pub fn global_bucket(&self) -> &Mutex<crate::bucket::TokenBucket> {
        &self.global
    }

    /// Total tracked connections, active or merely-not-yet-evicted.
    pub fn len(&self) -> usize {
        self.connections.read().expect("fairness registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark `id` as seen at `now`, inserting a freshly constructed dormant
    /// bucket (rate ≈ 0, capacity 1) if this is the first sighting. Per
    /// spec, side effects on rate/capacity are not visible until the next
    /// `rebalance()` — `touch` only ever sets `last_seen`.
    pub fn touch(&self, id: &str, now: Instant) -> Arc<Connection> {
        {
            let read = self.connections.read().expect("fairness registry poisoned");
            if let Some(conn) = read.get(id) {
                *conn.last_seen.lock().expect("connection lock poisoned") = now;
                return Arc::clone(conn);
            }
        }

        let mut write = self.connections.write().expect("fairness registry poisoned");
        let conn = write
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Connection {
                    bucket: Mutex::new(crate::bucket::TokenBucket::new(QUENCHED_RATE, 1.0, now)),
                    last_seen: Mutex::new(now),
                })
            })
            .clone();
        *conn.last_seen.lock().expect("connection lock poisoned") = now;
        conn
    }

    pub fn connection(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .expect("fairness registry poisoned")
            .get(id)
            .cloned()
    }

    fn is_active(&self, conn: &Connection, now: Instant) -> bool {
        now.seconds_since(conn.last_seen()) <= self.active_window_secs
    }

    /// Evict connections idle longer than `idle_evict_threshold`, then split
    /// `global_rate / 60` across whatever is still active, quenching the
    /// rest. Holds the registry's write lock for the duration so the active
    /// set can't shift mid-computation.
    ///
    /// Returns the active connection count and the per-connection rate
    /// assigned to each active connection.
    pub fn rebalance(&self, now: Instant) -> (usize, f64) {
        let mut write = self.connections.write().expect("fairness registry poisoned");

        write.retain(|_, conn| {
            now.seconds_since(conn.last_seen()) <= self.idle_evict_threshold_secs
        });

        let active_count = write
            .values()
            .filter(|conn| self.is_active(conn, now))
            .count()
            .max(1);
        let rate_each = (self.global_rate_per_minute / 60.0) / active_count as f64;
        let capacity_each = (rate_each * self.burst_window_secs).max(1.0);

        for conn in write.values() {
            let mut bucket = conn.bucket.lock().expect("connection lock poisoned");
            if self.is_active(conn, now) {
                bucket.set_rate_capacity(rate_each, Some(capacity_each), now);
            } else {
                bucket.set_rate_capacity(QUENCHED_RATE, Some(1.0), now);
            }
        }

        (active_count, rate_each)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.connections
            .read()
            .expect("fairness registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Snapshot for the `/__status` diagnostic endpoint:
    /// `id -> (rate, tokens)`.
    pub fn status_snapshot(&self) -> Vec<(String, f64, f64)> {
        self.connections
            .read()
            .expect("fairness registry poisoned")
            .iter()
            .map(|(id, conn)| {
                let bucket = conn.bucket.lock().expect("connection lock poisoned");
                (id.clone(), bucket.rate(), bucket.tokens())
            })
            .collect()
    }
}

/// Derive a stable per-connection identity the way the proxy's admission path
/// does: prefer an explicit `X-Connection-Id` header, otherwise fall back to
/// `ip|user-agent`.
pub fn derive_connection_id(connection_id_header: Option<&str>, ip: &str, user_agent: &str) -> String {
    match connection_id_header {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => format!("{ip}|{user_agent}"),
    }
}
