//! The `persistence` module provides the per-publisher message archive.
//!
//! Every published message is appended to its publisher's archive: a series
//! of timestamp-named file generations, each an index file of fixed-size
//! records pointing into a data file of raw payload bytes. Archives are
//! queried by timestamp range.

pub mod archive;
pub mod memory;

pub use archive::{Archive, ArchiveLimits};
pub use memory::{MemoryProbe, SystemMemory};

#[cfg(test)]
mod tests;
