//! Shared building blocks for the log search console.
//!
//! - [`clock`]: wall-clock abstraction with a controllable test clock.
//! - [`storage`]: string key-value stores used as a write-on-change mirror of
//!   per-tab console state.

pub mod clock;
pub mod storage;

pub use clock::{Clock, MockClock, SystemClock};
pub use storage::{KeyValueStore, KeyValueStoreExt, StorageError, StorageResult};
