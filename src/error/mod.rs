//! Set of module Error
pub mod disk;

pub use disk::{MmapUnavailable, Result, StorageError};
