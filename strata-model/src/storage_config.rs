use std::path::PathBuf;

/// Configuration for where to store data.
#[derive(Debug, Clone, Default)]
pub enum StorageConfig {
    /// File-backed storage at the given database path.
    File(PathBuf),
    /// In-memory storage (no filesystem). Useful for tests.
    #[default]
    InMemory,
}
