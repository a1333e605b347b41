pub mod backends;
pub mod config;
pub mod error;
pub mod record;
pub mod store;
pub mod r#trait;

pub use backends::{FileBackingStore, MemoryBackingStore};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use record::{EmailRecord, TriesFilter, normalize};
pub use store::RecipientStore;
pub use r#trait::BackingStore;
