//! Compile-time constants (generated from `chunkcache.toml`) and the runtime
//! knobs handed to [`ChunkManager::boot`](crate::ChunkManager::boot) and
//! [`Tcache::new`](crate::Tcache::new).

use crate::error::BootError;
use crate::registry::ChunkStats;
use crate::size_class::NUM_SIZE_CLASSES;
use core::fmt;
use core::str::FromStr;

include!(concat!(env!("OUT_DIR"), "/config_gen.rs"));

/// Where dss (`sbrk`) memory ranks relative to anonymous mappings.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DssPrec {
    /// Never use dss.
    Disabled,
    /// Try dss before mmap.
    Primary,
    /// Try dss only after mmap failed.
    #[default]
    Secondary,
}

impl DssPrec {
    pub const fn as_str(self) -> &'static str {
        match self {
            DssPrec::Disabled => "disabled",
            DssPrec::Primary => "primary",
            DssPrec::Secondary => "secondary",
        }
    }
}

impl fmt::Display for DssPrec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized `dss` precedence string.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ParseDssPrecError;

impl fmt::Display for ParseDssPrecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("expected one of \"disabled\", \"primary\", \"secondary\"")
    }
}

impl FromStr for DssPrec {
    type Err = ParseDssPrecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(DssPrec::Disabled),
            "primary" => Ok(DssPrec::Primary),
            "secondary" => Ok(DssPrec::Secondary),
            _ => Err(ParseDssPrecError),
        }
    }
}

/// Chunk layer configuration, fixed at boot.
#[derive(Clone, Copy, Debug)]
pub struct ChunkConfig {
    /// log2 of the chunk size.
    pub lg_chunk: u32,
    /// dss precedence.
    pub dss: DssPrec,
    /// Unmap freed mmap chunks instead of keeping them for reuse.
    pub munmap: bool,
    /// Upper bound on extent node slabs per tree pair.
    pub extent_slabs: usize,
    /// Called (outside every chunk lock) when the live chunk count reaches
    /// a new high. Intended for heap profile dumps.
    pub on_high_water: Option<fn(ChunkStats)>,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            lg_chunk: LG_CHUNK_DEFAULT,
            dss: DssPrec::default(),
            munmap: false,
            extent_slabs: EXTENT_SLABS_MAX,
            on_high_water: None,
        }
    }
}

impl ChunkConfig {
    pub fn validate(&self) -> Result<(), BootError> {
        // The registry covers 36 bits of chunk index, i.e. 48-bit addresses
        // once lg_chunk >= 12.
        if self.lg_chunk < LG_CHUNK_MIN || self.lg_chunk >= 48 {
            return Err(BootError::InvalidChunkSize(self.lg_chunk));
        }
        if self.extent_slabs == 0 || self.extent_slabs > EXTENT_SLABS_MAX {
            return Err(BootError::InvalidExtentSlabs(self.extent_slabs));
        }
        Ok(())
    }

    #[inline]
    pub const fn chunk_size(&self) -> usize {
        1 << self.lg_chunk
    }
}

/// Thread cache tuning.
#[derive(Clone, Copy, Debug)]
pub struct TcacheConfig {
    /// Allocation events between two GC ticks.
    pub gc_incr: u32,
    /// A GC flush keeps `low_water >> retain_shift` of the low-water cushion.
    pub retain_shift: u32,
}

impl Default for TcacheConfig {
    fn default() -> Self {
        // One full sweep over every bin per TCACHE_GC_SWEEP events.
        let nbins = NUM_SIZE_CLASSES - 1;
        Self {
            gc_incr: TCACHE_GC_SWEEP.div_ceil(nbins) as u32,
            retain_shift: 2,
        }
    }
}
