//! The storage engine proper.
//!
//! A torrent's [`ChunkManager`] is the entry point: it owns the [`Cache`]
//! laying the torrent's chunks out on disk, single or multi file, and keeps
//! track of which chunks are downloaded, wanted or excluded. The protocol
//! layer reads and writes through [`PieceData`] handles obtained from it.

pub mod cache;
pub mod chunk;
pub mod chunk_manager;
pub mod io;
pub mod piece;
pub mod prealloc;
pub(crate) mod record;

pub use cache::{multi::MultiFileCache, single::SingleFileCache, Cache};
pub use chunk::{Chunk, ChunkStatus};
pub use chunk_manager::ChunkManager;
pub use piece::{PieceData, PiecePtr};
pub use prealloc::{PreallocHandle, PreallocStatus, PreallocationThread};
