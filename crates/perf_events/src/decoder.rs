use plain::Plain;
use std::collections::HashMap;
use std::mem::size_of;
use thiserror::Error;

use crate::records::*;
use crate::{PerfEventHeader, PerfRing, PerfRingError};

/// Errors for a single record that was consumed but could not be decoded
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{kind} record of {size} bytes is shorter than its {min}-byte layout")]
    TooShort {
        kind: &'static str,
        size: u16,
        min: usize,
    },

    #[error("{kind} record declares {declared} payload bytes but only {available} fit in its {size} bytes")]
    PayloadOverrun {
        kind: &'static str,
        declared: u64,
        available: u64,
        size: u16,
    },

    #[error("stack sample dyn_size {dyn_size} exceeds captured stack size {stack_size}")]
    DynSizeExceedsStack { dyn_size: u64, stack_size: u64 },

    #[error("ring read failed: {0}")]
    Ring(#[from] PerfRingError),
}

/// What a sample on a given stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// `REGS_USER | STACK_USER`
    Stack,
    /// `CALLCHAIN`
    Callchain,
    /// `RAW`
    Tracepoint,
}

/// Outcome of consuming one record from a ring
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    Event(Event),
    /// A record type this decoder does not act upon
    Unknown { type_: u32 },
    /// The record was skipped but its contents were inconsistent
    Malformed(DecodeError),
}

/// RecordDecoder turns the record at a ring's consumer cursor into an [`Event`]
///
/// Sample records are classified by stream id: streams can be registered
/// explicitly (e.g. when several perf fds are redirected into one ring), the
/// rest use the decoder's default kind.
#[derive(Debug, Clone)]
pub struct RecordDecoder {
    default_kind: SampleKind,
    stream_kinds: HashMap<u64, SampleKind>,
}

impl RecordDecoder {
    /// Creates a decoder that treats unregistered sample streams as `default_kind`
    pub fn new(default_kind: SampleKind) -> Self {
        RecordDecoder {
            default_kind,
            stream_kinds: HashMap::new(),
        }
    }

    /// Associates samples from `stream_id` with `kind`
    pub fn register_stream(&mut self, stream_id: u64, kind: SampleKind) {
        self.stream_kinds.insert(stream_id, kind);
    }

    /// Decodes the record at the consumer cursor and skips past it.
    ///
    /// The record is skipped exactly once, after every read of its bytes,
    /// whether it decoded, was unknown, or was malformed. An error is returned
    /// only when the header itself is unusable; then nothing is skipped.
    pub fn consume_record(&self, ring: &mut PerfRing) -> Result<Decoded, PerfRingError> {
        let header = ring.peek_header()?;

        let decoded = match self.decode(ring, &header) {
            Ok(Some(event)) => Decoded::Event(event),
            Ok(None) => Decoded::Unknown {
                type_: header.type_,
            },
            Err(e) => Decoded::Malformed(e),
        };

        ring.skip_record(&header);
        Ok(decoded)
    }

    fn decode(&self, ring: &PerfRing, header: &PerfEventHeader) -> Result<Option<Event>, DecodeError> {
        let event = match header.type_ {
            PERF_RECORD_SAMPLE => self.decode_sample(ring, header)?,
            PERF_RECORD_MMAP => decode_mmap(ring, header)?,
            PERF_RECORD_LOST => decode_lost(ring, header)?,
            PERF_RECORD_COMM => decode_comm(ring, header)?,
            PERF_RECORD_FORK | PERF_RECORD_EXIT => decode_fork_exit(ring, header)?,
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    fn decode_sample(&self, ring: &PerfRing, header: &PerfEventHeader) -> Result<Event, DecodeError> {
        let fixed: SampleFixed = read_fixed(ring, header, "sample")?;
        let kind = self
            .stream_kinds
            .get(&fixed.sample_id.stream_id)
            .copied()
            .unwrap_or(self.default_kind);

        match kind {
            SampleKind::Stack => decode_stack_sample(ring, header, &fixed.sample_id),
            SampleKind::Callchain => decode_callchain_sample(ring, header),
            SampleKind::Tracepoint => decode_tracepoint_sample(ring, header, &fixed.sample_id),
        }
    }
}

/// Reads a record's fixed layout, checking it fits in the record
fn read_fixed<T: Plain + Default>(
    ring: &PerfRing,
    header: &PerfEventHeader,
    kind: &'static str,
) -> Result<T, DecodeError> {
    read_field(ring, header, kind, 0)
}

/// Reads a `T` at `offset`, checking it ends within the record
fn read_field<T: Plain + Default>(
    ring: &PerfRing,
    header: &PerfEventHeader,
    kind: &'static str,
    offset: usize,
) -> Result<T, DecodeError> {
    let min = offset + size_of::<T>();
    if usize::from(header.size) < min {
        return Err(DecodeError::TooShort {
            kind,
            size: header.size,
            min,
        });
    }
    Ok(ring.read_value_at_offset(offset)?)
}

/// Checks that `len` payload bytes starting at `offset` fit before `end`
fn check_payload(
    header: &PerfEventHeader,
    kind: &'static str,
    offset: usize,
    len: u64,
    end: usize,
) -> Result<(), DecodeError> {
    let available = end.saturating_sub(offset) as u64;
    if len > available {
        return Err(DecodeError::PayloadOverrun {
            kind,
            declared: len,
            available,
            size: header.size,
        });
    }
    Ok(())
}

/// Reads the sample_id suffix of a non-sample record
fn read_suffix(
    ring: &PerfRing,
    header: &PerfEventHeader,
    kind: &'static str,
    fixed_len: usize,
) -> Result<SampleId, DecodeError> {
    let min = fixed_len + SAMPLE_ID_SIZE;
    if usize::from(header.size) < min {
        return Err(DecodeError::TooShort {
            kind,
            size: header.size,
            min,
        });
    }
    Ok(ring.read_value_at_offset(usize::from(header.size) - SAMPLE_ID_SIZE)?)
}

/// Copies a NUL-padded string that occupies `offset..end`
fn read_string(ring: &PerfRing, offset: usize, end: usize) -> Result<String, DecodeError> {
    let mut bytes = vec![0u8; end.saturating_sub(offset)];
    ring.read_raw_at_offset(&mut bytes, offset)?;
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..len]).into_owned())
}

fn decode_stack_sample(
    ring: &PerfRing,
    header: &PerfEventHeader,
    sample_id: &SampleId,
) -> Result<Event, DecodeError> {
    const KIND: &str = "stack sample";
    let size = usize::from(header.size);

    // Registers are only written for samples that interrupted user code
    let abi: u64 = read_field(ring, header, KIND, REGS_ABI_OFFSET)?;
    let (regs, stack_size_offset) = if abi == PERF_SAMPLE_REGS_ABI_NONE {
        (None, REGS_ABI_OFFSET + size_of::<u64>())
    } else {
        let regs: RegsUser = read_field(ring, header, KIND, REGS_ABI_OFFSET)?;
        (Some(regs), REGS_ABI_OFFSET + size_of::<RegsUser>())
    };

    // The blob is followed by dyn_size, which is only present for a non-empty stack
    let stack_size: u64 = read_field(ring, header, KIND, stack_size_offset)?;
    let data_offset = stack_size_offset + size_of::<u64>();
    let stack = if stack_size == 0 {
        Vec::new()
    } else {
        check_payload(header, KIND, data_offset, stack_size, size - size_of::<u64>())?;
        let dyn_size: u64 = ring.read_value_at_offset(data_offset + stack_size as usize)?;
        if dyn_size > stack_size {
            return Err(DecodeError::DynSizeExceedsStack {
                dyn_size,
                stack_size,
            });
        }
        let mut stack = vec![0u8; dyn_size as usize];
        ring.read_raw_at_offset(&mut stack, data_offset)?;
        stack
    };

    Ok(Event::StackSample(StackSample {
        pid: sample_id.pid,
        tid: sample_id.tid,
        cpu: sample_id.cpu,
        time: sample_id.time,
        stream_id: sample_id.stream_id,
        regs,
        stack,
    }))
}

fn decode_callchain_sample(ring: &PerfRing, header: &PerfEventHeader) -> Result<Event, DecodeError> {
    const KIND: &str = "callchain sample";
    let fixed: CallchainSampleFixed = read_fixed(ring, header, KIND)?;

    let ips_offset = size_of::<CallchainSampleFixed>();
    let nr = fixed.nr;
    let ips_bytes = nr.saturating_mul(size_of::<u64>() as u64);
    check_payload(header, KIND, ips_offset, ips_bytes, usize::from(header.size))?;

    let mut raw = vec![0u8; ips_bytes as usize];
    ring.read_raw_at_offset(&mut raw, ips_offset)?;
    let ips = raw
        .chunks_exact(size_of::<u64>())
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect();

    let sample_id = fixed.sample_id;
    Ok(Event::CallchainSample(CallchainSample {
        pid: sample_id.pid,
        tid: sample_id.tid,
        cpu: sample_id.cpu,
        time: sample_id.time,
        stream_id: sample_id.stream_id,
        ips,
    }))
}

fn decode_tracepoint_sample(
    ring: &PerfRing,
    header: &PerfEventHeader,
    sample_id: &SampleId,
) -> Result<Event, DecodeError> {
    const KIND: &str = "tracepoint sample";
    if usize::from(header.size) < RAW_DATA_OFFSET {
        return Err(DecodeError::TooShort {
            kind: KIND,
            size: header.size,
            min: RAW_DATA_OFFSET,
        });
    }

    let raw_size: u32 = ring.read_value_at_offset(RAW_SIZE_OFFSET)?;
    check_payload(
        header,
        KIND,
        RAW_DATA_OFFSET,
        u64::from(raw_size),
        usize::from(header.size),
    )?;
    let mut raw = vec![0u8; raw_size as usize];
    ring.read_raw_at_offset(&mut raw, RAW_DATA_OFFSET)?;

    Ok(Event::Tracepoint(TracepointSample {
        pid: sample_id.pid,
        tid: sample_id.tid,
        cpu: sample_id.cpu,
        time: sample_id.time,
        stream_id: sample_id.stream_id,
        raw,
    }))
}

fn decode_mmap(ring: &PerfRing, header: &PerfEventHeader) -> Result<Event, DecodeError> {
    const KIND: &str = "mmap";
    let fixed: MmapFixed = read_fixed(ring, header, KIND)?;
    let sample_id = read_suffix(ring, header, KIND, size_of::<MmapFixed>())?;
    let filename = read_string(
        ring,
        size_of::<MmapFixed>(),
        usize::from(header.size) - SAMPLE_ID_SIZE,
    )?;

    Ok(Event::Mmap(MmapEvent {
        pid: fixed.pid,
        tid: fixed.tid,
        cpu: sample_id.cpu,
        time: sample_id.time,
        addr: fixed.addr,
        len: fixed.len,
        pgoff: fixed.pgoff,
        filename,
    }))
}

fn decode_lost(ring: &PerfRing, header: &PerfEventHeader) -> Result<Event, DecodeError> {
    const KIND: &str = "lost";
    let fixed: LostFixed = read_fixed(ring, header, KIND)?;
    let sample_id = read_suffix(ring, header, KIND, size_of::<LostFixed>())?;

    Ok(Event::Lost(LostEvent {
        id: fixed.id,
        lost: fixed.lost,
        cpu: sample_id.cpu,
        time: sample_id.time,
    }))
}

fn decode_comm(ring: &PerfRing, header: &PerfEventHeader) -> Result<Event, DecodeError> {
    const KIND: &str = "comm";
    let fixed: CommFixed = read_fixed(ring, header, KIND)?;
    let sample_id = read_suffix(ring, header, KIND, size_of::<CommFixed>())?;
    let comm = read_string(
        ring,
        size_of::<CommFixed>(),
        usize::from(header.size) - SAMPLE_ID_SIZE,
    )?;

    Ok(Event::Comm(CommEvent {
        pid: fixed.pid,
        tid: fixed.tid,
        cpu: sample_id.cpu,
        time: sample_id.time,
        comm,
        exec: header.misc & PERF_RECORD_MISC_COMM_EXEC != 0,
    }))
}

fn decode_fork_exit(ring: &PerfRing, header: &PerfEventHeader) -> Result<Event, DecodeError> {
    let kind = if header.type_ == PERF_RECORD_FORK {
        ForkExitKind::Fork
    } else {
        ForkExitKind::Exit
    };
    let name = match kind {
        ForkExitKind::Fork => "fork",
        ForkExitKind::Exit => "exit",
    };
    let fixed: ForkExitFixed = read_fixed(ring, header, name)?;
    let sample_id = read_suffix(ring, header, name, size_of::<ForkExitFixed>())?;

    Ok(Event::ForkExit(ForkExitEvent {
        kind,
        pid: fixed.pid,
        ppid: fixed.ppid,
        tid: fixed.tid,
        ptid: fixed.ptid,
        cpu: sample_id.cpu,
        time: fixed.time,
    }))
}
