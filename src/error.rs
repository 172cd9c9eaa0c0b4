//! Typed failures for the few paths that report more than "no memory".
//!
//! Exhaustion on the allocation paths is `None`, like a null return from
//! `malloc`; these enums cover boot and metadata failures.

use core::fmt;

/// Failure of [`ChunkManager::boot`](crate::ChunkManager::boot). Terminal for
/// the allocator instance.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BootError {
    /// `lg_chunk` outside the supported range.
    InvalidChunkSize(u32),
    /// Extent slab limit is zero or above the compiled maximum.
    InvalidExtentSlabs(usize),
    /// dss was requested as a source but the platform has none.
    DssUnsupported,
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootError::InvalidChunkSize(lg) => write!(f, "unsupported lg_chunk {lg}"),
            BootError::InvalidExtentSlabs(n) => write!(f, "invalid extent slab limit {n}"),
            BootError::DssUnsupported => f.write_str("dss requested but not supported"),
        }
    }
}

/// Failure to record a chunk in the [`ChunkRegistry`](crate::registry::ChunkRegistry).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegistryError {
    /// Address beyond the radix tree's key space.
    OutOfRange(usize),
    /// No memory for an interior or leaf node.
    NodeExhausted,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::OutOfRange(addr) => write!(f, "address {addr:#x} out of registry range"),
            RegistryError::NodeExhausted => f.write_str("out of registry nodes"),
        }
    }
}
