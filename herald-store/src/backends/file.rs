use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use herald_common::internal;
use tokio::{fs, io::AsyncWriteExt};

use crate::{error::SerializationError, record::EmailRecord, r#trait::BackingStore};

/// File-based backing store implementation
///
/// The full record set is bincode-encoded into a single file. Writes go to
/// a temporary sibling first, are flushed to disk, and are then renamed
/// over the real file, so a crash mid-write never leaves a half-written
/// store behind: either the old state or the new state survives, whole.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("herald.db"),
        }
    }
}

impl FileBackingStore {
    /// Create a file-backed store at the given path.
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn new(path: PathBuf) -> crate::Result<Self> {
        Self::validate_path(&path)?;
        Ok(Self { path })
    }

    /// The path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate a store path for security
    ///
    /// Rejects paths containing `..` components and paths into sensitive
    /// system directories.
    fn validate_path(path: &Path) -> crate::Result<()> {
        for component in path.components() {
            if component == std::path::Component::ParentDir {
                return Err(invalid_path(format!(
                    "Store path cannot contain '..' components: {}",
                    path.display()
                )));
            }
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        for prefix in &sensitive_prefixes {
            if path.starts_with(prefix) {
                return Err(invalid_path(format!(
                    "Store path cannot be in system directory {prefix}: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }

    /// Initialise the file-backed store.
    ///
    /// Creates the parent directory if it doesn't exist and cleans up any
    /// orphaned temporary file left behind by a crash mid-write.
    ///
    /// # Errors
    /// If the parent directory cannot be created
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising store at {:?} ...", self.path);

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.try_exists()?
        {
            internal!("{parent:?} does not exist, creating...");
            std::fs::create_dir_all(parent)?;
        }

        let temp = self.temp_path();
        if temp.try_exists()? {
            internal!(level = INFO, "Removing orphaned temporary file {temp:?}");
            std::fs::remove_file(&temp)?;
        }

        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map_or_else(|| "store".to_string(), |f| f.to_string_lossy().into_owned());

        self.path.with_file_name(format!(".tmp_{filename}"))
    }
}

fn invalid_path(reason: String) -> crate::StoreError {
    io::Error::new(io::ErrorKind::InvalidInput, reason).into()
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn load(&self) -> crate::Result<Option<Vec<EmailRecord>>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let (records, _): (Vec<EmailRecord>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(SerializationError::from)?;

        internal!(
            level = DEBUG,
            "Loaded {} records from {:?}",
            records.len(),
            self.path
        );

        Ok(Some(records))
    }

    /// Write the record set to disk.
    ///
    /// 1. Encode the full set
    /// 2. Write to the temporary sibling `.tmp_{filename}`
    /// 3. Flush file contents to disk
    /// 4. Atomically rename over the real file
    async fn persist(&self, records: &[EmailRecord]) -> crate::Result<()> {
        let encoded = bincode::serde::encode_to_vec(records, bincode::config::standard())
            .map_err(SerializationError::from)?;

        let temp = self.temp_path();

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await?;

        internal!(
            level = DEBUG,
            "Persisted {} records to {:?}",
            records.len(),
            self.path
        );

        Ok(())
    }
}
