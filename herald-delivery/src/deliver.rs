use async_trait::async_trait;

use crate::error::DeliveryError;

/// The send seam between the worker and whoever owns the full pipeline.
///
/// The worker knows nothing about transports or stores; it hands an
/// address to this trait and decides on retries from the returned error's
/// temporary/permanent classification.
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Perform one delivery attempt for `address`.
    ///
    /// Implementations must have durably recorded the attempt's outcome
    /// before returning, so observers of worker signals never see stats
    /// ahead of store state.
    async fn deliver(&self, address: &str) -> Result<(), DeliveryError>;
}
