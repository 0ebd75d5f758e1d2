//! Correlation table for in-flight requests.
//!
//! Maps a correlation id to whatever is waiting on it (a oneshot sender on the
//! relay side, a route on the hub side) together with its deadline. `take` is
//! the only way an entry leaves the table on the success path, so every id
//! resolves at most once. Expired entries are drained by the owner.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{BridgeError, BridgeResult};

/// Default deadline for a forwarded request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// An entry waiting for its response.
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub id: String,
    pub created_at: Instant,
    pub deadline: Instant,
    pub waiter: T,
}

impl<T> PendingRequest<T> {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// In-memory map from correlation id to a pending continuation.
#[derive(Debug)]
pub struct CorrelationTable<T> {
    entries: HashMap<String, PendingRequest<T>>,
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a pending request. A live duplicate id is rejected.
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        waiter: T,
        timeout: Duration,
    ) -> BridgeResult<()> {
        let id = id.into();
        if self.entries.contains_key(&id) {
            return Err(BridgeError::serialization(format!(
                "duplicate request id: {id}"
            )));
        }
        let created_at = Instant::now();
        self.entries.insert(
            id.clone(),
            PendingRequest {
                id,
                created_at,
                deadline: created_at + timeout,
                waiter,
            },
        );
        Ok(())
    }

    /// Remove and return the entry for `id`.
    pub fn take(&mut self, id: &str) -> Option<PendingRequest<T>> {
        self.entries.remove(id)
    }

    /// Remove the entry only when `pred` accepts its waiter.
    pub fn take_if(
        &mut self,
        id: &str,
        pred: impl FnOnce(&T) -> bool,
    ) -> Option<PendingRequest<T>> {
        if self.entries.get(id).is_some_and(|entry| pred(&entry.waiter)) {
            self.entries.remove(id)
        } else {
            None
        }
    }

    /// Remove every entry whose deadline has passed.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<PendingRequest<T>> {
        self.drain_where(|entry| entry.is_expired(now))
    }

    /// Remove every entry matching `pred`.
    pub fn drain_where(
        &mut self,
        mut pred: impl FnMut(&PendingRequest<T>) -> bool,
    ) -> Vec<PendingRequest<T>> {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|entry| pred(entry))
            .map(|entry| entry.id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    pub fn drain_all(&mut self) -> Vec<PendingRequest<T>> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
