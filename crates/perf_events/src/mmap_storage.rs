use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr;

use libc::{c_void, mmap, munmap, MAP_SHARED, PROT_READ, PROT_WRITE};
use perf_event_open_sys as sys;

use crate::{SampleKind, SourceTarget, Storage, StorageError, SAMPLE_REGS_USER_ALL};

/// Bytes of user stack copied into each stack sample
pub const DEFAULT_STACK_DUMP_BYTES: u32 = 16 * 1024;

/// How to open one perf event
#[derive(Debug, Clone)]
pub struct PerfOpenOptions {
    pub target: SourceTarget,
    pub sample_kind: SampleKind,

    /// Samples per second for stack and callchain sampling
    pub frequency: u64,

    /// Tracepoint id from tracefs, used when `sample_kind` is `Tracepoint`
    pub tracepoint_id: Option<u64>,

    /// Number of data pages, a power of two
    pub n_pages: u32,

    /// Bytes to wait before waking up a poller. If 0, wake up on every event.
    pub n_watermark_bytes: u32,

    /// Bytes of user stack to copy for stack samples
    pub stack_dump_bytes: u32,
}

impl PerfOpenOptions {
    pub fn new(target: SourceTarget, sample_kind: SampleKind) -> Self {
        PerfOpenOptions {
            target,
            sample_kind,
            frequency: 99,
            tracepoint_id: None,
            n_pages: 64,
            n_watermark_bytes: 0,
            stack_dump_bytes: DEFAULT_STACK_DUMP_BYTES,
        }
    }

    fn attr(&self) -> sys::bindings::perf_event_attr {
        let mut attr = sys::bindings::perf_event_attr::default();
        attr.size = std::mem::size_of::<sys::bindings::perf_event_attr>() as u32;

        // Every record must carry the fields the decoder expects in SampleId
        let mut sample_type = (sys::bindings::PERF_SAMPLE_TID
            | sys::bindings::PERF_SAMPLE_TIME
            | sys::bindings::PERF_SAMPLE_STREAM_ID
            | sys::bindings::PERF_SAMPLE_CPU) as u64;

        match self.sample_kind {
            SampleKind::Stack => {
                attr.type_ = sys::bindings::PERF_TYPE_SOFTWARE;
                attr.config = sys::bindings::PERF_COUNT_SW_CPU_CLOCK as u64;
                sample_type |=
                    (sys::bindings::PERF_SAMPLE_REGS_USER | sys::bindings::PERF_SAMPLE_STACK_USER)
                        as u64;
                attr.sample_regs_user = SAMPLE_REGS_USER_ALL;
                attr.sample_stack_user = self.stack_dump_bytes & !7;
                attr.set_freq(1);
                attr.__bindgen_anon_1.sample_freq = self.frequency;
            }
            SampleKind::Callchain => {
                attr.type_ = sys::bindings::PERF_TYPE_SOFTWARE;
                attr.config = sys::bindings::PERF_COUNT_SW_CPU_CLOCK as u64;
                sample_type |= sys::bindings::PERF_SAMPLE_CALLCHAIN as u64;
                attr.set_freq(1);
                attr.__bindgen_anon_1.sample_freq = self.frequency;
            }
            SampleKind::Tracepoint => {
                attr.type_ = sys::bindings::PERF_TYPE_TRACEPOINT;
                attr.config = self.tracepoint_id.unwrap_or_default();
                sample_type |= sys::bindings::PERF_SAMPLE_RAW as u64;
                attr.__bindgen_anon_1.sample_period = 1;
            }
        }
        attr.sample_type = sample_type;

        attr.set_disabled(1);
        attr.set_sample_id_all(1);
        attr.set_mmap(1);
        attr.set_comm(1);
        attr.set_task(1);
        attr.set_use_clockid(1);
        attr.clockid = libc::CLOCK_MONOTONIC;

        if self.n_watermark_bytes > 0 {
            attr.set_watermark(1);
            attr.__bindgen_anon_2.wakeup_watermark = self.n_watermark_bytes;
        } else {
            attr.__bindgen_anon_2.wakeup_events = 1;
        }

        attr
    }

    fn pid_and_cpu(&self) -> (i32, i32) {
        match self.target {
            SourceTarget::Cpu(cpu) => (-1, cpu as i32),
            SourceTarget::Thread(tid) => (tid as i32, -1),
        }
    }
}

/// A perf event fd together with its memory-mapped ring
///
/// This implementation is only available on Linux platforms.
pub struct MmapStorage {
    data: *mut u8,
    data_len: usize,
    n_data_pages: u32,
    page_size: u64,
    file: File,
}

// The mapping is owned exclusively by this value and only freed in Drop.
unsafe impl Send for MmapStorage {}

impl MmapStorage {
    /// Opens a disabled perf event per `options` and maps its ring.
    ///
    /// Call [`MmapStorage::enable`] once every source of the session is open.
    pub fn open(options: &PerfOpenOptions) -> Result<Self, StorageError> {
        if options.n_pages == 0 || !options.n_pages.is_power_of_two() {
            return Err(StorageError::InvalidPageCount(options.n_pages));
        }
        let page_size = page_size::get() as u64;

        let mut attr = options.attr();
        let (pid, cpu) = options.pid_and_cpu();
        let fd = unsafe {
            sys::perf_event_open(
                &mut attr,
                pid,
                cpu,
                -1, // group_fd
                sys::bindings::PERF_FLAG_FD_CLOEXEC as u64,
            )
        };

        if fd < 0 {
            return Err(StorageError::OsError(io::Error::last_os_error()));
        }

        // Take ownership of the file descriptor so it is closed on every path
        let file = unsafe { File::from_raw_fd(fd) };

        // 1 metadata page + data pages
        let total_size = (page_size * (1 + u64::from(options.n_pages))) as usize;
        let data_ptr = unsafe {
            mmap(
                ptr::null_mut(),
                total_size,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd,
                0,
            )
        };

        if data_ptr == libc::MAP_FAILED {
            return Err(StorageError::OsError(io::Error::last_os_error()));
        }

        Ok(MmapStorage {
            data: data_ptr as *mut u8,
            data_len: total_size,
            n_data_pages: options.n_pages,
            page_size,
            file,
        })
    }

    /// Starts counting on the event
    pub fn enable(&self) -> Result<(), StorageError> {
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                sys::bindings::ENABLE as libc::c_ulong,
                0,
            )
        };
        if ret < 0 {
            return Err(StorageError::OsError(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Storage for MmapStorage {
    fn base_ptr(&self) -> *mut u8 {
        self.data
    }

    fn mapping_len(&self) -> usize {
        self.data_len
    }

    fn num_data_pages(&self) -> u32 {
        self.n_data_pages
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn file_descriptor(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }

    /// Stops sampling; records already in the ring stay readable
    fn disable(&self) -> Result<(), StorageError> {
        let ret = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                sys::bindings::DISABLE as libc::c_ulong,
                0,
            )
        };
        if ret < 0 {
            return Err(StorageError::OsError(io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl Drop for MmapStorage {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe {
                let _ = munmap(self.data as *mut c_void, self.data_len);
            }
            self.data = ptr::null_mut();
        }

        // The fd will be closed when the File is dropped
    }
}
