//! In-memory stand-in for the kernel side of a perf ring.
//!
//! [`SyntheticProducer`] writes encoded records into a [`PerfRing`] the way
//! the kernel does: records are published with a release store of the head,
//! and when the consumer has not freed enough room the record is dropped and
//! counted, to be reported by a `PERF_RECORD_LOST` once space is available.
//! The encoding helpers produce records with the layouts in [`crate::records`].

use crate::records::*;
use crate::{PerfRing, PerfRingError, PERF_EVENT_HEADER_SIZE};

/// Builds one record: header, body, padding to 8 bytes
struct RecordBuilder {
    buf: Vec<u8>,
}

impl RecordBuilder {
    fn new(type_: u32, misc: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&type_.to_le_bytes());
        buf.extend_from_slice(&misc.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        RecordBuilder { buf }
    }

    fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u64(mut self, value: u64) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn bytes(mut self, data: &[u8]) -> Self {
        self.buf.extend_from_slice(data);
        self
    }

    fn sample_id(self, id: &SampleId) -> Self {
        self.u32(id.pid)
            .u32(id.tid)
            .u64(id.time)
            .u64(id.stream_id)
            .u32(id.cpu)
            .u32(id.res)
    }

    /// NUL-terminated string padded to an 8-byte boundary
    fn string(mut self, s: &str) -> Self {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self.pad()
    }

    fn pad(mut self) -> Self {
        while self.buf.len() % 8 != 0 {
            self.buf.push(0);
        }
        self
    }

    fn finish(self) -> Vec<u8> {
        let mut buf = self.pad().buf;
        let size = buf.len() as u16;
        buf[6..8].copy_from_slice(&size.to_le_bytes());
        buf
    }
}

/// Sample body with explicit length fields, including inconsistent ones.
/// Stack bodies carry no registers.
#[derive(Debug, Clone)]
pub enum SampleBody {
    Stack {
        stack_size: u64,
        data: Vec<u8>,
        dyn_size: u64,
    },
    Callchain {
        nr: u64,
        ips: Vec<u64>,
    },
    Raw {
        raw_size: u32,
        data: Vec<u8>,
    },
}

/// Encodes a sample whose length fields are taken verbatim from `body`
pub fn sample_record_with_body(id: &SampleId, body: &SampleBody) -> Vec<u8> {
    let builder = RecordBuilder::new(PERF_RECORD_SAMPLE, 0).sample_id(id);
    match body {
        SampleBody::Stack {
            stack_size,
            data,
            dyn_size,
        } => builder
            .u64(PERF_SAMPLE_REGS_ABI_NONE)
            .u64(*stack_size)
            .bytes(data)
            .u64(*dyn_size)
            .finish(),
        SampleBody::Callchain { nr, ips } => {
            let mut builder = builder.u64(*nr);
            for ip in ips {
                builder = builder.u64(*ip);
            }
            builder.finish()
        }
        SampleBody::Raw { raw_size, data } => builder.u32(*raw_size).bytes(data).finish(),
    }
}

/// Encodes a stack sample holding `stack` in a blob of `stack_size` bytes.
/// Without `regs` the sample is laid out like one taken outside user code.
pub fn stack_sample_record(
    id: &SampleId,
    regs: Option<&RegsUser>,
    stack_size: u64,
    stack: &[u8],
) -> Vec<u8> {
    let mut builder = RecordBuilder::new(PERF_RECORD_SAMPLE, 0).sample_id(id);
    match regs {
        Some(regs) => {
            builder = builder.u64(regs.abi);
            for reg in regs.regs {
                builder = builder.u64(reg);
            }
        }
        None => builder = builder.u64(PERF_SAMPLE_REGS_ABI_NONE),
    }
    builder = builder.u64(stack_size);
    if stack_size == 0 {
        return builder.finish();
    }

    let mut blob = stack.to_vec();
    blob.resize(stack_size as usize, 0);
    builder.bytes(&blob).u64(stack.len() as u64).finish()
}

pub fn callchain_sample_record(id: &SampleId, ips: &[u64]) -> Vec<u8> {
    sample_record_with_body(
        id,
        &SampleBody::Callchain {
            nr: ips.len() as u64,
            ips: ips.to_vec(),
        },
    )
}

pub fn tracepoint_sample_record(id: &SampleId, raw: &[u8]) -> Vec<u8> {
    sample_record_with_body(
        id,
        &SampleBody::Raw {
            raw_size: raw.len() as u32,
            data: raw.to_vec(),
        },
    )
}

pub fn mmap_record(
    pid: u32,
    tid: u32,
    addr: u64,
    len: u64,
    pgoff: u64,
    filename: &str,
    id: &SampleId,
) -> Vec<u8> {
    RecordBuilder::new(PERF_RECORD_MMAP, 0)
        .u32(pid)
        .u32(tid)
        .u64(addr)
        .u64(len)
        .u64(pgoff)
        .string(filename)
        .sample_id(id)
        .finish()
}

pub fn lost_record(stream_id: u64, lost: u64, id: &SampleId) -> Vec<u8> {
    RecordBuilder::new(PERF_RECORD_LOST, 0)
        .u64(stream_id)
        .u64(lost)
        .sample_id(id)
        .finish()
}

pub fn comm_record(pid: u32, tid: u32, comm: &str, exec: bool, id: &SampleId) -> Vec<u8> {
    let misc = if exec { PERF_RECORD_MISC_COMM_EXEC } else { 0 };
    RecordBuilder::new(PERF_RECORD_COMM, misc)
        .u32(pid)
        .u32(tid)
        .string(comm)
        .sample_id(id)
        .finish()
}

pub fn fork_exit_record(
    kind: ForkExitKind,
    pid: u32,
    ppid: u32,
    tid: u32,
    ptid: u32,
    id: &SampleId,
) -> Vec<u8> {
    let type_ = match kind {
        ForkExitKind::Fork => PERF_RECORD_FORK,
        ForkExitKind::Exit => PERF_RECORD_EXIT,
    };
    RecordBuilder::new(type_, 0)
        .u32(pid)
        .u32(ppid)
        .u32(tid)
        .u32(ptid)
        .u64(id.time)
        .sample_id(id)
        .finish()
}

/// Any record type with an opaque body
pub fn raw_record(type_: u32, misc: u16, body: &[u8]) -> Vec<u8> {
    RecordBuilder::new(type_, misc).bytes(body).finish()
}

/// Timestamp of an encoded record: the sample_id prefix for samples, the suffix otherwise
fn record_time(record: &[u8]) -> u64 {
    let time_at = |offset: usize| {
        record
            .get(offset..offset + 8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_le_bytes)
            .unwrap_or(0)
    };
    let type_ = record
        .get(0..4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0);
    if type_ == PERF_RECORD_SAMPLE {
        time_at(PERF_EVENT_HEADER_SIZE + 8)
    } else {
        time_at(record.len().saturating_sub(SAMPLE_ID_SIZE - 8))
    }
}

/// Writes records into a ring like the kernel does, including loss reporting
pub struct SyntheticProducer {
    ring: PerfRing,
    sample_id: SampleId,
    pending_lost: u64,
    dropped: u64,
}

impl SyntheticProducer {
    /// Creates a producer over a ring view used only for writing
    pub fn new(ring: PerfRing) -> Self {
        SyntheticProducer {
            ring,
            sample_id: SampleId::default(),
            pending_lost: 0,
            dropped: 0,
        }
    }

    /// Sets the stream id and cpu reported by the LOST records this producer writes
    pub fn with_lost_identity(mut self, stream_id: u64, cpu: u32) -> Self {
        self.sample_id.stream_id = stream_id;
        self.sample_id.cpu = cpu;
        self
    }

    /// Total records dropped because the ring was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Dropped records not yet reported through a LOST record
    pub fn pending_lost(&self) -> u64 {
        self.pending_lost
    }

    /// Writes and publishes one record.
    ///
    /// Returns `Ok(false)` when the ring was full and the record was dropped.
    /// Before the next record that fits, a LOST record reports the drops.
    pub fn emit(&mut self, record: &[u8]) -> Result<bool, PerfRingError> {
        self.ring.start_write_batch();

        if self.pending_lost > 0 && !self.write_lost(record_time(record))? {
            self.drop_record();
            return Ok(false);
        }

        let written = match self.ring.write_record(record) {
            Ok(()) => true,
            Err(PerfRingError::NoSpace) => {
                self.drop_record();
                false
            }
            Err(e) => return Err(e),
        };
        self.ring.finish_write_batch();
        Ok(written)
    }

    /// Reports pending drops now, if there is room for the LOST record
    pub fn flush_lost(&mut self, time: u64) -> Result<bool, PerfRingError> {
        if self.pending_lost == 0 {
            return Ok(true);
        }
        self.ring.start_write_batch();
        let written = self.write_lost(time)?;
        self.ring.finish_write_batch();
        Ok(written)
    }

    fn write_lost(&mut self, time: u64) -> Result<bool, PerfRingError> {
        let id = SampleId {
            time,
            ..self.sample_id
        };
        match self
            .ring
            .write_record(&lost_record(self.sample_id.stream_id, self.pending_lost, &id))
        {
            Ok(()) => {
                self.pending_lost = 0;
                Ok(true)
            }
            Err(PerfRingError::NoSpace) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn drop_record(&mut self) {
        self.pending_lost += 1;
        self.dropped += 1;
    }
}
