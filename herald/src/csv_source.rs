//! CSV recipient source.
//!
//! Campaign exports put the recipient address in the fourth column; rows
//! with fewer columns are skipped. Address validity is the exporter's
//! concern, dedup happens in the store.

use std::path::Path;

use tracing::warn;

/// Column holding the recipient address.
const ADDRESS_COLUMN: usize = 3;

/// Read recipient addresses from the campaign CSV at `path`.
pub fn read_addresses(path: &Path) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut addresses = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;

        match record.get(ADDRESS_COLUMN) {
            Some(address) if !address.trim().is_empty() => {
                addresses.push(address.trim().to_string());
            }
            _ => warn!("Skipping row {} without an address column", row + 1),
        }
    }

    Ok(addresses)
}
