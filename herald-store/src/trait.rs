use async_trait::async_trait;

use crate::record::EmailRecord;

/// Durable storage for the full recipient record set.
///
/// The store holds its working copy in memory and writes the whole set
/// through this trait on every mutation; recipient lists are modest in
/// size, so durability is prioritized over write throughput.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Load the persisted record set.
    ///
    /// Returns `None` when no state has ever been persisted. An existing
    /// but unreadable or undecodable state is an error, never an empty set.
    async fn load(&self) -> crate::Result<Option<Vec<EmailRecord>>>;

    /// Durably persist the full record set, replacing any previous state.
    ///
    /// Must not return until the data would survive a crash.
    async fn persist(&self, records: &[EmailRecord]) -> crate::Result<()>;
}
