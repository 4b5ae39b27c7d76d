//! Request deduplication for mutating endpoints
//!
//! A client may attach an `Idempotency-Key` header to any mutating request.
//! The first request with a key reserves it atomically, runs the handler and
//! caches a successful response for the configured TTL. Repeats (including
//! ones racing the first) never run the handler again; they replay the cached
//! payload with `409 Conflict`.
//!
//! The in-memory store is only correct for a single instance. Multi-instance
//! deployments must use the Postgres store so every instance shares one key
//! space.

mod guard;
mod memory;
mod middleware;
mod postgres;
mod store;

pub use guard::{GuardOutcome, IdempotencyGuard};
pub use memory::MemoryIdempotencyStore;
pub use middleware::{idempotency_middleware, IDEMPOTENCY_HEADER};
pub use postgres::PgIdempotencyStore;
pub use store::{CachedResponse, IdempotencyStore, Reservation, MAX_CACHED_BODY};
