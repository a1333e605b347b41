use std::sync::{
    Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;

use crate::{StoreError, record::EmailRecord, r#trait::BackingStore};

/// In-memory backing store implementation
///
/// Holds the persisted state in a `Mutex`-guarded `Option`. Primarily
/// intended for testing, but also usable for transient runs where
/// durability across restarts is not wanted.
#[derive(Debug, Default)]
pub struct MemoryBackingStore {
    state: Mutex<Option<Vec<EmailRecord>>>,
    persists: AtomicUsize,
    fail_persist: AtomicBool,
}

impl MemoryBackingStore {
    /// Create a new empty memory-backed store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory-backed store pre-seeded with a persisted record set,
    /// as if a previous run had written it.
    #[must_use]
    pub fn with_state(records: Vec<EmailRecord>) -> Self {
        Self {
            state: Mutex::new(Some(records)),
            persists: AtomicUsize::new(0),
            fail_persist: AtomicBool::new(false),
        }
    }

    /// Number of persist calls made so far.
    pub fn persist_count(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }

    /// Make every subsequent persist fail, to exercise error propagation.
    pub fn set_fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// The last persisted record set, for test assertions.
    ///
    /// # Panics
    /// Panics if the mutex is poisoned
    #[must_use]
    pub fn snapshot(&self) -> Option<Vec<EmailRecord>> {
        self.state
            .lock()
            .expect("MemoryBackingStore state mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn load(&self) -> crate::Result<Option<Vec<EmailRecord>>> {
        Ok(self.state.lock()?.clone())
    }

    async fn persist(&self, records: &[EmailRecord]) -> crate::Result<()> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other(
                "persist failure injected",
            )));
        }

        *self.state.lock()? = Some(records.to_vec());
        self.persists.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}
