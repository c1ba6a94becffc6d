//! Kernel record layouts and the owned events decoded from them.
//!
//! Every source is opened with `sample_id_all` and a sample type of at least
//! `TID | TIME | STREAM_ID | CPU`, so each record carries a [`SampleId`]:
//! as the prefix of a `PERF_RECORD_SAMPLE` body and as the last 32 bytes of
//! every other record.

use plain::Plain;
use std::mem::size_of;

use crate::PerfEventHeader;

/// Type constants for perf records
pub const PERF_RECORD_MMAP: u32 = 1;
pub const PERF_RECORD_LOST: u32 = 2;
pub const PERF_RECORD_COMM: u32 = 3;
pub const PERF_RECORD_EXIT: u32 = 4;
pub const PERF_RECORD_FORK: u32 = 7;
pub const PERF_RECORD_SAMPLE: u32 = 9;

/// `misc` bit set on COMM records caused by exec()
pub const PERF_RECORD_MISC_COMM_EXEC: u16 = 1 << 13;

/// Number of user registers captured by stack samples: every x86_64
/// register except the DS/ES/FS/GS segment registers.
pub const NUM_USER_REGS: usize = 20;

/// `sample_regs_user` mask selecting the registers in [`RegsUser`]
pub const SAMPLE_REGS_USER_ALL: u64 = ((1 << 24) - 1) & !(0xf << 12);

/// Register ABI of a sample with no user context; no registers follow it
pub const PERF_SAMPLE_REGS_ABI_NONE: u64 = 0;
pub const PERF_SAMPLE_REGS_ABI_64: u64 = 2;

/// The `{pid, tid, time, stream_id, cpu}` block shared by all records
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
}
unsafe impl Plain for SampleId {}

pub const SAMPLE_ID_SIZE: usize = size_of::<SampleId>();

/// Registers captured with `PERF_SAMPLE_REGS_USER`.
/// Only present in a record when `abi` is not [`PERF_SAMPLE_REGS_ABI_NONE`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegsUser {
    pub abi: u64,
    pub regs: [u64; NUM_USER_REGS],
}
unsafe impl Plain for RegsUser {}

/// Fixed part shared by every sample layout
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SampleFixed {
    pub header: PerfEventHeader,
    pub sample_id: SampleId,
}
unsafe impl Plain for SampleFixed {}

/// Offset of the register ABI word in a stack sample. The registers (if
/// any), the `size` prefix of the user stack, the blob and `dyn_size` follow.
pub const REGS_ABI_OFFSET: usize = size_of::<SampleFixed>();

/// Callchain sample up to the `nr` prefix; `nr` instruction pointers follow
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CallchainSampleFixed {
    pub header: PerfEventHeader,
    pub sample_id: SampleId,
    pub nr: u64,
}
unsafe impl Plain for CallchainSampleFixed {}

/// Offset of the u32 raw size in a tracepoint sample; raw data follows it
pub const RAW_SIZE_OFFSET: usize = size_of::<SampleFixed>();
pub const RAW_DATA_OFFSET: usize = RAW_SIZE_OFFSET + size_of::<u32>();

/// MMAP record up to the filename
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapFixed {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
}
unsafe impl Plain for MmapFixed {}

/// LOST record without its sample_id suffix
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LostFixed {
    pub header: PerfEventHeader,
    pub id: u64,
    pub lost: u64,
}
unsafe impl Plain for LostFixed {}

/// COMM record up to the command name
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct CommFixed {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub tid: u32,
}
unsafe impl Plain for CommFixed {}

/// FORK and EXIT records without their sample_id suffix
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkExitFixed {
    pub header: PerfEventHeader,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
}
unsafe impl Plain for ForkExitFixed {}

/// A sample carrying a copy of the user stack and registers, for unwinding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSample {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub time: u64,
    pub stream_id: u64,
    /// None when the sample hit a thread with no user context
    pub regs: Option<RegsUser>,
    /// The `dyn_size` meaningful bytes of the captured stack
    pub stack: Vec<u8>,
}

/// A sample carrying the kernel-walked call chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallchainSample {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub time: u64,
    pub stream_id: u64,
    pub ips: Vec<u64>,
}

/// A tracepoint hit with its raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracepointSample {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub time: u64,
    pub stream_id: u64,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmapEvent {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub time: u64,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub filename: String,
}

/// The kernel dropped `lost` records on this stream before they could be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LostEvent {
    pub id: u64,
    pub lost: u64,
    pub cpu: u32,
    pub time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommEvent {
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub time: u64,
    pub comm: String,
    /// The name changed because of exec()
    pub exec: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkExitKind {
    Fork,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkExitEvent {
    pub kind: ForkExitKind,
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub cpu: u32,
    pub time: u64,
}

/// One decoded record. Owns all of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StackSample(StackSample),
    CallchainSample(CallchainSample),
    Tracepoint(TracepointSample),
    Mmap(MmapEvent),
    Lost(LostEvent),
    Comm(CommEvent),
    ForkExit(ForkExitEvent),
}

impl Event {
    /// Kernel timestamp of the event
    pub fn time(&self) -> u64 {
        match self {
            Event::StackSample(e) => e.time,
            Event::CallchainSample(e) => e.time,
            Event::Tracepoint(e) => e.time,
            Event::Mmap(e) => e.time,
            Event::Lost(e) => e.time,
            Event::Comm(e) => e.time,
            Event::ForkExit(e) => e.time,
        }
    }

    /// CPU the event was recorded on
    pub fn cpu(&self) -> u32 {
        match self {
            Event::StackSample(e) => e.cpu,
            Event::CallchainSample(e) => e.cpu,
            Event::Tracepoint(e) => e.cpu,
            Event::Mmap(e) => e.cpu,
            Event::Lost(e) => e.cpu,
            Event::Comm(e) => e.cpu,
            Event::ForkExit(e) => e.cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn test_layout_offsets_match_kernel_abi() {
        assert_eq!(SAMPLE_ID_SIZE, 32);
        assert_eq!(offset_of!(SampleId, time), 8);
        assert_eq!(offset_of!(SampleId, stream_id), 16);
        assert_eq!(offset_of!(SampleId, cpu), 24);

        assert_eq!(size_of::<SampleFixed>(), 40);
        assert_eq!(REGS_ABI_OFFSET, 40);
        assert_eq!(size_of::<RegsUser>(), 8 + 8 * NUM_USER_REGS);
        assert_eq!(offset_of!(CallchainSampleFixed, nr), 40);
        assert_eq!(RAW_DATA_OFFSET, 44);

        assert_eq!(size_of::<MmapFixed>(), 40);
        assert_eq!(size_of::<LostFixed>(), 24);
        assert_eq!(size_of::<CommFixed>(), 16);
        assert_eq!(size_of::<ForkExitFixed>(), 32);
    }

    #[test]
    fn test_regs_mask_selects_every_captured_register() {
        assert_eq!(SAMPLE_REGS_USER_ALL.count_ones() as usize, NUM_USER_REGS);
    }
}
