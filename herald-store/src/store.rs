use std::sync::Arc;

use ahash::AHashMap;
use herald_common::internal;
use tokio::sync::RwLock;

use crate::{
    StoreError,
    record::{EmailRecord, TriesFilter, normalize},
    r#trait::BackingStore,
};

/// Durable, crash-safe bookkeeping of per-recipient delivery state.
///
/// The store is the single source of truth for delivery state across
/// restarts and the only component permitted to touch records. The working
/// copy lives in a map keyed by normalized address; every mutating
/// operation writes the full set through the backing store before
/// returning, holding the write lock across the flush so check-then-insert
/// stays atomic with respect to other mutators.
///
/// A mutation that fails to persist is rolled back in memory: callers
/// never observe a state the durable storage does not also hold.
#[derive(Debug)]
pub struct RecipientStore {
    backing: Arc<dyn BackingStore>,
    records: RwLock<AHashMap<String, EmailRecord>>,
}

impl RecipientStore {
    /// Create a store over the given backing storage. Call [`Self::open`]
    /// before anything else.
    #[must_use]
    pub fn new(backing: Arc<dyn BackingStore>) -> Self {
        Self {
            backing,
            records: RwLock::new(AHashMap::new()),
        }
    }

    /// Load existing state from the backing storage, or start empty if
    /// none has ever been persisted.
    ///
    /// Idempotent: re-opening reloads the same persisted state.
    ///
    /// # Errors
    /// Propagates backing storage failures; an existing but corrupt state
    /// file is an error, never silently treated as empty.
    pub async fn open(&self) -> crate::Result<()> {
        let loaded = self.backing.load().await?;

        let mut records = self.records.write().await;
        records.clear();

        match loaded {
            Some(persisted) => {
                for record in persisted {
                    records.insert(record.key(), record);
                }
                internal!("Store loaded with {} records", records.len());
            }
            None => internal!("No persisted state found, starting empty"),
        }

        Ok(())
    }

    /// Look up the record for an address, normalized by case-folding.
    pub async fn find(&self, address: &str) -> Option<EmailRecord> {
        self.records.read().await.get(&normalize(address)).cloned()
    }

    /// Add a record for an address that has never been seen.
    ///
    /// Returns `false` without mutating anything when a record for the
    /// normalized address already exists: duplicates are a soft no-op, not
    /// a failure. The first submission's casing is the one kept for
    /// display.
    pub async fn add(&self, address: &str) -> crate::Result<bool> {
        let key = normalize(address);

        let mut records = self.records.write().await;
        if records.contains_key(&key) {
            return Ok(false);
        }

        records.insert(key.clone(), EmailRecord::new(address.trim().to_string()));

        if let Err(e) = self.backing.persist(&snapshot(&records)).await {
            records.remove(&key);
            return Err(e);
        }

        Ok(true)
    }

    /// Delete the record for an address if present; no-op otherwise.
    pub async fn remove(&self, address: &str) -> crate::Result<()> {
        let key = normalize(address);

        let mut records = self.records.write().await;
        let Some(removed) = records.remove(&key) else {
            return Ok(());
        };

        if let Err(e) = self.backing.persist(&snapshot(&records)).await {
            records.insert(key, removed);
            return Err(e);
        }

        Ok(())
    }

    /// Record the outcome of one delivery attempt.
    ///
    /// Success sets `sent`; failure increments `tries` by exactly one.
    /// The change is durably persisted before this returns. The updated
    /// record is handed back so callers can act on the new counters.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] when no record exists for the address,
    /// which callers should treat as a broken invariant rather than a
    /// routine condition.
    pub async fn mark_outcome(&self, address: &str, success: bool) -> crate::Result<EmailRecord> {
        let key = normalize(address);

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&key) else {
            return Err(StoreError::NotFound(address.to_string()));
        };

        let previous = record.clone();
        if success {
            record.sent = true;
        } else {
            record.tries += 1;
        }
        let updated = record.clone();

        if let Err(e) = self.backing.persist(&snapshot(&records)).await {
            records.insert(key, previous);
            return Err(e);
        }

        Ok(updated)
    }

    /// All records matching `sent == sent_filter` and the given comparison
    /// on `tries`, sorted by normalized address.
    ///
    /// Reflects every mutation completed before the call.
    pub async fn query(&self, sent_filter: bool, tries: TriesFilter) -> Vec<EmailRecord> {
        let records = self.records.read().await;

        let mut matched: Vec<EmailRecord> = records
            .values()
            .filter(|record| record.sent == sent_filter && tries.matches(record.tries))
            .cloned()
            .collect();
        matched.sort_by_key(EmailRecord::key);

        matched
    }

    /// Remove every record and persist the empty set.
    pub async fn clear(&self) -> crate::Result<()> {
        let mut records = self.records.write().await;
        let previous = std::mem::take(&mut *records);

        if let Err(e) = self.backing.persist(&[]).await {
            *records = previous;
            return Err(e);
        }

        Ok(())
    }

    /// Force a durable flush of the current state.
    ///
    /// Every mutating operation already flushes before returning; this
    /// exists for the shutdown path's final write.
    pub async fn persist(&self) -> crate::Result<()> {
        let records = self.records.read().await;
        self.backing.persist(&snapshot(&records)).await
    }

    /// Total number of records currently held.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Whether the store holds no records at all.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn snapshot(records: &AHashMap<String, EmailRecord>) -> Vec<EmailRecord> {
    let mut all: Vec<EmailRecord> = records.values().cloned().collect();
    all.sort_by_key(EmailRecord::key);
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackingStore;

    fn open_store(backing: Arc<MemoryBackingStore>) -> RecipientStore {
        RecipientStore::new(backing)
    }

    #[tokio::test]
    async fn test_add_deduplicates_case_insensitively() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");

        assert!(store.add("User@Example.com").await.expect("Failed to add"));
        assert!(
            !store
                .add("user@example.com")
                .await
                .expect("Failed to add twice")
        );
        assert_eq!(store.len().await, 1);

        // First occurrence's casing wins
        let record = store.find("USER@EXAMPLE.COM").await.expect("Record exists");
        assert_eq!(record.address, "User@Example.com");
        assert_eq!(record.tries, 0);
        assert!(!record.sent);
    }

    #[tokio::test]
    async fn test_add_persists_before_returning() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");

        store.add("a@example.com").await.expect("Failed to add");

        let persisted = backing.snapshot().expect("State persisted");
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].address, "a@example.com");
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back_add() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");

        backing.set_fail_persist(true);
        assert!(store.add("a@example.com").await.is_err());

        backing.set_fail_persist(false);
        assert!(store.find("a@example.com").await.is_none());
        assert!(store.add("a@example.com").await.expect("Failed to add"));
    }

    #[tokio::test]
    async fn test_mark_outcome_success_and_failure() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");
        store.add("x@test.com").await.expect("Failed to add");

        let after_failure = store
            .mark_outcome("x@test.com", false)
            .await
            .expect("Failed to mark");
        assert_eq!(after_failure.tries, 1);
        assert!(!after_failure.sent);

        let after_success = store
            .mark_outcome("X@TEST.COM", true)
            .await
            .expect("Failed to mark");
        assert_eq!(after_success.tries, 1);
        assert!(after_success.sent);

        // Outcome is durable before mark_outcome returns
        let persisted = backing.snapshot().expect("State persisted");
        assert_eq!(persisted[0].tries, 1);
        assert!(persisted[0].sent);
    }

    #[tokio::test]
    async fn test_mark_outcome_unknown_address_is_not_found() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing);
        store.open().await.expect("Failed to open");

        let result = store.mark_outcome("ghost@test.com", true).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back_mark_outcome() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");
        store.add("x@test.com").await.expect("Failed to add");

        backing.set_fail_persist(true);
        assert!(store.mark_outcome("x@test.com", false).await.is_err());

        let record = store.find("x@test.com").await.expect("Record exists");
        assert_eq!(record.tries, 0);
    }

    #[tokio::test]
    async fn test_query_splits_recoverable_from_exhausted() {
        let backing = Arc::new(MemoryBackingStore::with_state(vec![
            EmailRecord {
                address: "a@test.com".to_string(),
                tries: 0,
                sent: false,
            },
            EmailRecord {
                address: "b@test.com".to_string(),
                tries: 2,
                sent: false,
            },
            EmailRecord {
                address: "c@test.com".to_string(),
                tries: 1,
                sent: true,
            },
        ]));
        let store = open_store(backing);
        store.open().await.expect("Failed to open");

        let recoverable = store.query(false, TriesFilter::Under(2)).await;
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].address, "a@test.com");

        let exhausted = store.query(false, TriesFilter::AtLeast(2)).await;
        assert_eq!(exhausted.len(), 1);
        assert_eq!(exhausted[0].address, "b@test.com");

        let sent = store.query(true, TriesFilter::Under(u32::MAX)).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].address, "c@test.com");
    }

    #[tokio::test]
    async fn test_query_orders_by_normalized_address() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing);
        store.open().await.expect("Failed to open");
        store.add("Zed@test.com").await.expect("Failed to add");
        store.add("alpha@test.com").await.expect("Failed to add");
        store.add("Mid@test.com").await.expect("Failed to add");

        let all = store.query(false, TriesFilter::Under(u32::MAX)).await;
        let addresses: Vec<&str> = all.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, ["alpha@test.com", "Mid@test.com", "Zed@test.com"]);
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");
        store.add("a@test.com").await.expect("Failed to add");
        store.add("b@test.com").await.expect("Failed to add");

        store.clear().await.expect("Failed to clear");
        assert!(store.is_empty().await);
        assert_eq!(backing.snapshot().expect("State persisted").len(), 0);
    }

    #[tokio::test]
    async fn test_remove_is_noop_for_absent_address() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");

        let persists_before = backing.persist_count();
        store.remove("nobody@test.com").await.expect("Failed to remove");
        assert_eq!(backing.persist_count(), persists_before);
    }

    #[tokio::test]
    async fn test_reopen_after_mutations_round_trips() {
        let backing = Arc::new(MemoryBackingStore::new());
        let store = open_store(backing.clone());
        store.open().await.expect("Failed to open");
        store.add("a@test.com").await.expect("Failed to add");
        store.add("b@test.com").await.expect("Failed to add");
        store
            .mark_outcome("a@test.com", true)
            .await
            .expect("Failed to mark");

        // A second store over the same backing sees identical state
        let reopened = open_store(backing);
        reopened.open().await.expect("Failed to open");
        assert_eq!(reopened.len().await, 2);
        let a = reopened.find("a@test.com").await.expect("Record exists");
        assert!(a.sent);
    }
}
