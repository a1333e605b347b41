pub mod file;
pub mod memory;

pub use file::FileBackingStore;
pub use memory::MemoryBackingStore;
