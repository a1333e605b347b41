use serde::{Deserialize, Serialize};

/// Durable delivery state for one recipient.
///
/// `address` keeps the casing of the first submission for display; all
/// lookups go through [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRecord {
    /// Recipient address as first submitted.
    pub address: String,
    /// Delivery attempts so far that ended in failure.
    pub tries: u32,
    /// Set once a delivery attempt succeeded; no further attempts follow.
    pub sent: bool,
}

impl EmailRecord {
    /// Create a fresh record for an address that has never been attempted.
    #[must_use]
    pub const fn new(address: String) -> Self {
        Self {
            address,
            tries: 0,
            sent: false,
        }
    }

    /// The normalized form of this record's address.
    #[must_use]
    pub fn key(&self) -> String {
        normalize(&self.address)
    }
}

/// Normalize an address for case-insensitive comparison and storage lookup.
#[must_use]
pub fn normalize(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Comparison on a record's `tries` counter, used by queries to split
/// recoverable records from exhausted ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriesFilter {
    /// `tries < n` — still eligible for delivery.
    Under(u32),
    /// `tries >= n` — out of attempts.
    AtLeast(u32),
}

impl TriesFilter {
    /// Apply the comparison to a concrete attempt count.
    #[must_use]
    pub const fn matches(self, tries: u32) -> bool {
        match self {
            Self::Under(n) => tries < n,
            Self::AtLeast(n) => tries >= n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("User@Example.COM"), "user@example.com");
        assert_eq!(normalize("  a@b.c  "), "a@b.c");
    }

    #[test]
    fn test_record_key_uses_normalized_address() {
        let record = EmailRecord::new("Mixed.Case@Example.com".to_string());
        assert_eq!(record.key(), "mixed.case@example.com");
        assert_eq!(record.address, "Mixed.Case@Example.com");
    }

    #[test]
    fn test_tries_filter() {
        assert!(TriesFilter::Under(2).matches(0));
        assert!(TriesFilter::Under(2).matches(1));
        assert!(!TriesFilter::Under(2).matches(2));

        assert!(TriesFilter::AtLeast(2).matches(2));
        assert!(TriesFilter::AtLeast(2).matches(5));
        assert!(!TriesFilter::AtLeast(2).matches(1));
    }
}
