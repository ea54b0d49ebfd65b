pub mod app;
pub mod blocking;
pub mod clock;
pub mod config;
pub mod db;
pub mod http;
pub mod journal;
pub mod metrics;
pub mod poller;
pub mod repository;
pub mod waits;

// Types most callers need, without the module path
pub use poller::{PollState, PollStatus, PollerRegistry, PollingSession};
pub use repository::{HistorySettings, ReplayStats, Repository};
pub use waits::{RingBuffer, Snapshot, TopWaits, WaitMapping};
