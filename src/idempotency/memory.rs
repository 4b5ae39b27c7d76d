//! In-process idempotency store (single instance only)

use super::store::{CachedResponse, IdempotencyStore, Reservation};
use crate::error::SweeperResult;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

enum EntryState {
    Pending,
    Done(CachedResponse),
}

struct Entry {
    state: EntryState,
    expires_at: Instant,
}

impl Entry {
    fn pending(ttl: Duration) -> Self {
        Self {
            state: EntryState::Pending,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// DashMap-backed key store; reservation uses the shard-locked entry API
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: DashMap<String, Entry>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn reserve(&self, key: &str, ttl: Duration) -> SweeperResult<Reservation> {
        let now = Instant::now();

        let reservation = match self.entries.entry(key.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::pending(ttl));
                Reservation::Acquired
            }
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(Entry::pending(ttl));
                    Reservation::Acquired
                } else {
                    match &occupied.get().state {
                        EntryState::Pending => Reservation::InFlight,
                        EntryState::Done(response) => Reservation::Completed(response.clone()),
                    }
                }
            }
        };

        Ok(reservation)
    }

    async fn complete(
        &self,
        key: &str,
        response: CachedResponse,
        ttl: Duration,
    ) -> SweeperResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                state: EntryState::Done(response),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &str) -> SweeperResult<()> {
        self.entries
            .remove_if(key, |_, entry| matches!(entry.state, EntryState::Pending));
        Ok(())
    }

    async fn evict_expired(&self) -> SweeperResult<usize> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
