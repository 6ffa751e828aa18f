//! Mirror storage configuration.

use serde::{Deserialize, Serialize};

/// Which store backs the per-tab mirror.
///
/// Defaults to `InMemory`, which keeps the mirror alive only for the lifetime
/// of the process.
#[derive(Default, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum MirrorConfig {
    #[default]
    InMemory,
    File(FileStoreConfig),
}

/// Directory-backed store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileStoreConfig {
    /// Directory holding one JSON document per key. Created if missing.
    pub path: String,
}
