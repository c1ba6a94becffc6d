use std::cell::UnsafeCell;
use std::os::fd::RawFd;

use crate::{Storage, StorageError};

/// Memory-based ring storage
///
/// Backs a ring with heap memory instead of a kernel mapping. Used to feed
/// readers from a [`SyntheticProducer`](crate::synthetic::SyntheticProducer).
/// The memory is word-aligned so the cursor atomics in the metadata page are
/// properly aligned.
pub struct MemoryStorage {
    words: Box<[UnsafeCell<u64>]>,
    n_data_pages: u32,
    page_size: u64,
}

impl MemoryStorage {
    /// Create a new memory-based ring storage with the system page size
    pub fn new(n_pages: u32) -> Result<Self, StorageError> {
        Self::with_page_size(n_pages, page_size::get() as u64)
    }

    /// Create a new memory-based ring storage with an explicit page size
    pub fn with_page_size(n_pages: u32, page_size: u64) -> Result<Self, StorageError> {
        if n_pages == 0 || !n_pages.is_power_of_two() {
            return Err(StorageError::InvalidPageCount(n_pages));
        }

        // 1 metadata page + data pages
        let total_size = page_size * (1 + u64::from(n_pages));
        let n_words = (total_size as usize).div_ceil(8);
        let words = (0..n_words).map(|_| UnsafeCell::new(0u64)).collect();

        Ok(MemoryStorage {
            words,
            n_data_pages: n_pages,
            page_size,
        })
    }
}

impl Storage for MemoryStorage {
    fn base_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.words.as_ptr()) as *mut u8
    }

    fn mapping_len(&self) -> usize {
        self.words.len() * 8
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage() {
        let n_pages = 2;
        let storage = MemoryStorage::new(n_pages).unwrap();

        // Check basic properties
        assert_eq!(storage.num_data_pages(), n_pages);
        assert_eq!(storage.page_size(), page_size::get() as u64);

        let expected_size = storage.page_size() * (1 + u64::from(n_pages));
        assert_eq!(storage.mapping_len() as u64, expected_size);
        assert_eq!(storage.base_ptr() as usize % 8, 0);

        assert_eq!(storage.file_descriptor(), None);
    }

    #[test]
    fn test_memory_storage_rejects_odd_page_counts() {
        assert!(matches!(
            MemoryStorage::new(3),
            Err(StorageError::InvalidPageCount(3))
        ));
        assert!(matches!(
            MemoryStorage::new(0),
            Err(StorageError::InvalidPageCount(0))
        ));
    }
}
