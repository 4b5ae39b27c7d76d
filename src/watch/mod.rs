//! Watch sessions: request handling and per-session polling

mod scheduler;
mod service;

pub use scheduler::WatchScheduler;
pub use service::{
    LogEntryRequest, StartWatchingRequest, StartedSession, StopOutcome, StopWatchingRequest,
    UnwatchRequest, WatchRequest, WatchService, WatchStarted,
};
