#![no_std]

//! chunkcache: the chunk and thread-cache core of a jemalloc-style allocator.
//!
//! Two layers sit between an arena's bin allocator and the operating system:
//! - Chunk management: chunk-aligned extents recycled through size/address
//!   ordered trees (one pair for dss memory, one for mmap memory), eagerly
//!   coalesced on free and registered in a radix tree for `is_chunk` queries.
//! - Thread caches: per-thread LIFO stacks per size class, refilled from and
//!   flushed to the owning arena, tuned by an incremental GC.
//!
//! The arena/bin layer is a collaborator described by the [`arena`] traits.
//!
//! # Usage
//!
//! ```ignore
//! let chunks = chunkcache::ChunkManager::boot(ChunkConfig::default(), System::new())?;
//! let chunk = chunks.alloc(None, chunks.chunk_size(), chunks.chunk_size(), true);
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
mod macros;

pub mod arena;
pub mod base;
pub mod chunk;
pub mod config;
pub mod error;
pub mod extent;
pub mod platform;
pub mod registry;
pub mod size_class;
pub mod stats;
pub mod sync;
pub mod tcache;

pub use chunk::{Chunk, ChunkManager, Space};
pub use config::{ChunkConfig, DssPrec, TcacheConfig};
pub use error::{BootError, RegistryError};
pub use platform::{ChunkSource, HeapGrowth, System};
pub use tcache::Tcache;
