use plain::Plain;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::Storage;

/// Errors that can occur when using the perf ring buffer
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PerfRingError {
    #[error("buffer length must be a power of 2 and at least 8 bytes")]
    InvalidBufferLength,

    #[error("data buffer cannot be nil")]
    NilBuffer,

    #[error("metadata page must be 8-byte aligned")]
    Misaligned,

    #[error("buffer full")]
    NoSpace,

    #[error("buffer empty")]
    BufferEmpty,

    #[error("data too large for buffer")]
    CannotFit,

    #[error("record must be at least 8 bytes, 8-byte aligned and match its header size")]
    InvalidRecord,

    #[error("read of {len} bytes at offset {offset} exceeds the {available} unread bytes")]
    SizeExceeded {
        offset: usize,
        len: usize,
        available: u64,
    },

    #[error("record header declares {size} bytes but only {available} are unread")]
    CorruptHeader { size: u16, available: u64 },
}

/// PerfEventHeader is present at the start of every record
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PerfEventHeader {
    pub type_: u32,
    pub misc: u16,
    pub size: u16,
}
unsafe impl Plain for PerfEventHeader {}

pub const PERF_EVENT_HEADER_SIZE: usize = size_of::<PerfEventHeader>();

/// Shared metadata page for perf ring buffer
#[repr(C)]
pub struct PerfEventMmapPage {
    pub version: u32,
    pub compat_version: u32,
    pad1: [u8; 1024 - 8],
    pub data_head: AtomicU64,
    pub data_tail: AtomicU64,
    pub data_offset: u64,
    pub data_size: u64,
    pub aux_offset: u64,
    pub aux_size: u64,
}

/// PerfRing is a view over one kernel-managed circular buffer of records.
///
/// A ring is used either as a reader (the normal case, draining what the
/// kernel produced) or as a writer (the synthetic producer used in tests).
/// The cursors are monotonically increasing byte counts; they are masked
/// with `buf_mask` on every access, which is why the data area must be a
/// power of two.
///
/// The kernel is the only other party touching the shared memory, and it
/// never takes a lock: the reader observes `data_head` with an acquire load
/// before touching record bytes, and publishes `data_tail` with a release
/// store only after it is done with a record.
pub struct PerfRing {
    // Shared metadata page
    meta: NonNull<PerfEventMmapPage>,
    // Data buffer
    data: *mut u8,
    // Data buffer length
    data_len: usize,
    // Mask for quick modulo operations (buffer size - 1)
    buf_mask: u64,
    // Producer cursor: last observed `data_head` when reading, next write position when writing
    head: u64,
    // Consumer cursor: next read position when reading, last observed `data_tail` when writing
    tail: u64,
}

// Safety: the ring can be moved to the thread that drains it. It is not
// Sync: a single consumer must own each view.
unsafe impl Send for PerfRing {}

impl PerfRing {
    /// Initializes a PerfRing using contiguous memory
    ///
    /// # Safety
    ///
    /// This function is unsafe because it works with raw pointers and assumes the
    /// provided slice will outlive the PerfRing.
    pub unsafe fn init_contiguous(
        data: &mut [u8],
        n_pages: u32,
        page_size: u64,
    ) -> Result<Self, PerfRingError> {
        Self::init_raw(data.as_mut_ptr(), data.len(), n_pages, page_size)
    }

    /// Initializes a PerfRing over the memory owned by `storage`
    ///
    /// # Safety
    ///
    /// The storage must outlive the returned ring, and no other ring may read
    /// from the same storage concurrently.
    pub unsafe fn from_storage(storage: &dyn Storage) -> Result<Self, PerfRingError> {
        Self::init_raw(
            storage.base_ptr(),
            storage.mapping_len(),
            storage.num_data_pages(),
            storage.page_size(),
        )
    }

    unsafe fn init_raw(
        base: *mut u8,
        len: usize,
        n_pages: u32,
        page_size: u64,
    ) -> Result<Self, PerfRingError> {
        if base.is_null() || len == 0 {
            return Err(PerfRingError::NilBuffer);
        }
        if base as usize % align_of::<PerfEventMmapPage>() != 0 {
            return Err(PerfRingError::Misaligned);
        }

        let buf_len = u64::from(n_pages) * page_size;
        if buf_len < 8 || (buf_len & (buf_len - 1)) != 0 {
            return Err(PerfRingError::InvalidBufferLength);
        }
        if len < size_of::<PerfEventMmapPage>() {
            return Err(PerfRingError::InvalidBufferLength);
        }

        // First page is metadata, rest is data
        let meta_ptr = base as *mut PerfEventMmapPage;
        let meta = NonNull::new(meta_ptr).ok_or(PerfRingError::NilBuffer)?;

        // If data_offset is not given (older kernels), we need to skip a full page,
        // otherwise we skip data_offset bytes
        let data_start = if (*meta_ptr).data_offset == 0 {
            page_size
        } else {
            (*meta_ptr).data_offset
        };

        if data_start + buf_len > len as u64 {
            return Err(PerfRingError::InvalidBufferLength);
        }

        let data_ptr = base.add(data_start as usize);
        let data_tail = (*meta_ptr).data_tail.load(Ordering::Acquire);
        let data_head = (*meta_ptr).data_head.load(Ordering::Acquire);

        Ok(PerfRing {
            meta,
            data: data_ptr,
            data_len: buf_len as usize,
            buf_mask: buf_len - 1,
            head: data_head,
            tail: data_tail,
        })
    }

    /// Length of the data area in bytes
    pub fn capacity(&self) -> usize {
        self.data_len
    }

    /// Consumer cursor (monotonic, unmasked)
    pub fn tail(&self) -> u64 {
        self.tail
    }

    fn meta(&self) -> &PerfEventMmapPage {
        // Safety: meta points into memory that outlives the ring (see constructors)
        unsafe { self.meta.as_ref() }
    }

    // ---- reader side ----

    /// Reloads the producer cursor and reports whether unread bytes exist.
    ///
    /// The acquire load pairs with the kernel's release of `data_head`, so
    /// every record byte below the loaded head is visible afterwards.
    pub fn has_new_data(&mut self) -> bool {
        self.head = self.meta().data_head.load(Ordering::Acquire);
        self.head != self.tail
    }

    /// Number of unread bytes between the consumer cursor and the last observed head
    pub fn bytes_remaining(&self) -> u64 {
        self.head.wrapping_sub(self.tail)
    }

    /// Copies a `T` out of the ring, `offset` bytes past the consumer cursor
    pub fn read_value_at_offset<T: Plain + Default>(
        &self,
        offset: usize,
    ) -> Result<T, PerfRingError> {
        let mut value = T::default();
        // Safety: T is Plain, so any byte pattern written into it is valid
        let bytes = unsafe { plain::as_mut_bytes(&mut value) };
        self.read_raw_at_offset(bytes, offset)?;
        Ok(value)
    }

    /// Copies `dest.len()` bytes out of the ring, `offset` bytes past the consumer cursor,
    /// splitting the copy in two when it straddles the end of the data area.
    pub fn read_raw_at_offset(&self, dest: &mut [u8], offset: usize) -> Result<(), PerfRingError> {
        let available = self.bytes_remaining();
        if (offset as u64).saturating_add(dest.len() as u64) > available {
            return Err(PerfRingError::SizeExceeded {
                offset,
                len: dest.len(),
                available,
            });
        }
        if dest.is_empty() {
            return Ok(());
        }

        let start_pos = (self.tail.wrapping_add(offset as u64) & self.buf_mask) as usize;
        unsafe {
            if start_pos + dest.len() <= self.data_len {
                ptr::copy_nonoverlapping(self.data.add(start_pos), dest.as_mut_ptr(), dest.len());
            } else {
                let first_len = self.data_len - start_pos;
                ptr::copy_nonoverlapping(self.data.add(start_pos), dest.as_mut_ptr(), first_len);
                ptr::copy_nonoverlapping(
                    self.data,
                    dest.as_mut_ptr().add(first_len),
                    dest.len() - first_len,
                );
            }
        }

        Ok(())
    }

    /// Reads the header of the record at the consumer cursor.
    ///
    /// A header whose size is smaller than the header itself, or larger than
    /// the unread bytes, cannot be skipped safely and is reported as corrupt.
    pub fn peek_header(&self) -> Result<PerfEventHeader, PerfRingError> {
        let available = self.bytes_remaining();
        if available == 0 {
            return Err(PerfRingError::BufferEmpty);
        }

        let header: PerfEventHeader = self.read_value_at_offset(0)?;
        if usize::from(header.size) < PERF_EVENT_HEADER_SIZE || u64::from(header.size) > available
        {
            return Err(PerfRingError::CorruptHeader {
                size: header.size,
                available,
            });
        }
        Ok(header)
    }

    /// Advances the consumer cursor past `header`'s record and publishes it to the producer.
    ///
    /// Must be the last operation on a record: the producer may overwrite the
    /// region as soon as the release store lands.
    pub fn skip_record(&mut self, header: &PerfEventHeader) {
        self.tail = self.tail.wrapping_add(u64::from(header.size));
        self.meta().data_tail.store(self.tail, Ordering::Release);
    }

    // ---- writer side ----

    /// Starts a write batch operation
    pub fn start_write_batch(&mut self) {
        // Get the current consumer position from shared memory
        self.tail = self.meta().data_tail.load(Ordering::Acquire);
    }

    /// Bytes the producer can still write before catching up with the consumer
    pub fn free_space(&self) -> u64 {
        (self.data_len as u64).saturating_sub(self.head.wrapping_sub(self.tail))
    }

    /// Writes one fully encoded record (header included) to the ring
    pub fn write_record(&mut self, record: &[u8]) -> Result<(), PerfRingError> {
        if record.len() < PERF_EVENT_HEADER_SIZE || record.len() % 8 != 0 {
            return Err(PerfRingError::InvalidRecord);
        }
        let declared = u16::from_le_bytes([record[6], record[7]]);
        if usize::from(declared) != record.len() {
            return Err(PerfRingError::InvalidRecord);
        }
        if record.len() > self.data_len {
            return Err(PerfRingError::CannotFit);
        }
        if record.len() as u64 > self.free_space() {
            return Err(PerfRingError::NoSpace);
        }

        let pos = (self.head & self.buf_mask) as usize;
        unsafe {
            if pos + record.len() <= self.data_len {
                ptr::copy_nonoverlapping(record.as_ptr(), self.data.add(pos), record.len());
            } else {
                // Data wraps around buffer end
                let first_part = self.data_len - pos;
                ptr::copy_nonoverlapping(record.as_ptr(), self.data.add(pos), first_part);
                ptr::copy_nonoverlapping(
                    record.as_ptr().add(first_part),
                    self.data,
                    record.len() - first_part,
                );
            }
        }

        self.head = self.head.wrapping_add(record.len() as u64);
        Ok(())
    }

    /// Finishes a write batch operation
    pub fn finish_write_batch(&mut self) {
        // Record bytes must be visible before the new head
        self.meta().data_head.store(self.head, Ordering::Release);
    }

    /// Moves both cursors to `position` (used to test cursor wraparound)
    #[cfg(test)]
    pub(crate) fn reset_cursors(&mut self, position: u64) {
        self.meta().data_head.store(position, Ordering::Release);
        self.meta().data_tail.store(position, Ordering::Release);
        self.head = position;
        self.tail = position;
    }
}
