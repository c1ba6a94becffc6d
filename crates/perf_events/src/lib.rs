//! # perf_events
//!
//! Safe access to the memory-mapped ring buffers that `perf_event_open`
//! fills. A [`PerfRing`] exposes one buffer with wraparound-aware copies and
//! the acquire/release cursor protocol; [`RecordDecoder`] turns the record at
//! the consumer cursor into an owned [`Event`]; [`SourceReader`] drains one
//! registered source per poll.
//!

mod decoder;
mod memory_storage;
#[cfg(target_os = "linux")]
mod mmap_storage;
mod records;
mod ring;
mod source;
pub mod synthetic;

pub use decoder::*;
pub use memory_storage::*;
#[cfg(target_os = "linux")]
pub use mmap_storage::*;
pub use records::*;
pub use ring::*;
pub use source::*;

use std::os::unix::io::RawFd;
use thiserror::Error;

/// Errors that can occur when setting up ring storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("OS error: {0}")]
    OsError(std::io::Error),

    #[error("ring needs a power-of-two number of data pages, got {0}")]
    InvalidPageCount(u32),
}

/// Memory backing one perf ring: a metadata page followed by the data pages
pub trait Storage {
    /// Pointer to the first byte of the metadata page
    fn base_ptr(&self) -> *mut u8;

    /// Total length of the mapping in bytes
    fn mapping_len(&self) -> usize;

    /// Return the number of data pages in the ring buffer
    fn num_data_pages(&self) -> u32;

    /// Return the system page size
    fn page_size(&self) -> u64;

    /// Return the file descriptor if this is a perf event storage
    fn file_descriptor(&self) -> Option<RawFd>;

    /// Stop the producer writing into the ring. Records already written stay
    /// readable. Storage without a kernel producer has nothing to stop.
    fn disable(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
