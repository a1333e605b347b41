use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{
    backends::{FileBackingStore, MemoryBackingStore},
    r#trait::BackingStore,
};

/// Configuration for the recipient store backing storage
///
/// Allows runtime selection of the backing store implementation through
/// the configuration file.
///
/// # Examples
///
/// File-backed store in RON config:
/// ```ron
/// store: File(
///     path: "herald.db",
/// ),
/// ```
///
/// Memory-backed store for testing:
/// ```ron
/// store: Memory,
/// ```
#[derive(Debug, Clone, Deserialize)]
pub enum StoreConfig {
    /// File-based store (production)
    File {
        /// Path of the backing file.
        path: PathBuf,
    },
    /// Memory-based store (testing/development); state is lost on exit
    Memory,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: PathBuf::from("herald.db"),
        }
    }
}

impl StoreConfig {
    /// Convert the configuration into a concrete backing store
    ///
    /// File-backed stores are validated and initialised here (parent
    /// directory creation, orphaned temp file cleanup), so startup fails
    /// fast on permission problems.
    pub fn into_backing_store(self) -> crate::Result<Arc<dyn BackingStore>> {
        match self {
            Self::File { path } => {
                let store = FileBackingStore::new(path)?;
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory => Ok(Arc::new(MemoryBackingStore::new())),
        }
    }
}
