use log::{debug, warn};
use std::os::unix::io::RawFd;
use thiserror::Error;

use crate::{
    Decoded, Event, PerfRing, PerfRingError, RecordDecoder, SampleKind, Storage, StorageError,
};

/// Index of a source within a capture session
pub type SourceId = usize;

/// What a source's perf fd was opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTarget {
    Cpu(u32),
    Thread(u32),
}

/// One perf fd's ring plus the metadata it was registered with
pub struct SourceRegistration {
    pub source_id: SourceId,
    pub target: SourceTarget,
    pub sample_kind: SampleKind,
    pub storage: Box<dyn Storage + Send>,
}

/// Errors that take a source out of the capture session
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source {source_id}: cannot map ring: {error}")]
    InvalidRing {
        source_id: SourceId,
        #[source]
        error: PerfRingError,
    },

    #[error("source {source_id}: ring is corrupt: {error}")]
    CorruptRing {
        source_id: SourceId,
        #[source]
        error: PerfRingError,
    },
}

/// Per-source counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceStats {
    /// Records consumed from the ring, whatever their outcome
    pub records_read: u64,

    /// Records turned into events
    pub events_decoded: u64,

    /// Records of types the decoder does not act upon
    pub unknown_skipped: u64,

    /// Records skipped because their contents were inconsistent
    pub decode_errors: u64,

    /// Number of LOST records seen
    pub lost_records: u64,

    /// Sum of the counts carried by LOST records
    pub lost_total: u64,
}

/// Result of one drain
#[derive(Debug, Default)]
pub struct Drain {
    /// Decoded events in buffer order
    pub events: Vec<Event>,

    /// False when the batch cap stopped the drain with data left in the ring
    pub exhausted: bool,
}

/// SourceReader pulls every fully available record out of one source's ring
pub struct SourceReader {
    // Declared before the storage so the view is dropped first
    ring: PerfRing,
    decoder: RecordDecoder,
    source_id: SourceId,
    target: SourceTarget,
    batch_cap: usize,
    stats: SourceStats,
    storage: Box<dyn Storage + Send>,
}

impl SourceReader {
    /// Creates a reader owning the registration's storage.
    ///
    /// `batch_cap` bounds the records consumed per drain so one busy source
    /// cannot starve the others.
    pub fn new(registration: SourceRegistration, batch_cap: usize) -> Result<Self, SourceError> {
        let source_id = registration.source_id;
        // Safety: the storage is owned by the reader and outlives the ring
        let ring = unsafe { PerfRing::from_storage(registration.storage.as_ref()) }
            .map_err(|error| SourceError::InvalidRing { source_id, error })?;

        Ok(SourceReader {
            ring,
            decoder: RecordDecoder::new(registration.sample_kind),
            source_id,
            target: registration.target,
            batch_cap: batch_cap.max(1),
            stats: SourceStats::default(),
            storage: registration.storage,
        })
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn target(&self) -> SourceTarget {
        self.target
    }

    /// File descriptor to wait on, if the storage is backed by a perf fd
    pub fn file_descriptor(&self) -> Option<RawFd> {
        self.storage.file_descriptor()
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    /// Stops the producer so a final drain can empty the ring
    pub fn disable(&self) -> Result<(), StorageError> {
        self.storage.disable()
    }

    /// Decodes records until the ring is empty or the batch cap is reached.
    ///
    /// Malformed and unknown records are skipped and counted; they never end
    /// the drain. Only a header that cannot be skipped is an error, and then
    /// the ring can no longer be trusted.
    pub fn drain_available(&mut self) -> Result<Drain, SourceError> {
        let mut drain = Drain::default();
        let mut consumed = 0;

        loop {
            if !self.ring.has_new_data() {
                drain.exhausted = true;
                break;
            }
            if consumed >= self.batch_cap {
                break;
            }

            let decoded = self
                .decoder
                .consume_record(&mut self.ring)
                .map_err(|error| SourceError::CorruptRing {
                    source_id: self.source_id,
                    error,
                })?;
            consumed += 1;
            self.stats.records_read += 1;

            match decoded {
                Decoded::Event(event) => {
                    if let Event::Lost(lost) = &event {
                        self.stats.lost_records += 1;
                        self.stats.lost_total += lost.lost;
                        debug!(
                            "Source {}: kernel lost {} records (cumulative {})",
                            self.source_id, lost.lost, self.stats.lost_total
                        );
                    }
                    self.stats.events_decoded += 1;
                    drain.events.push(event);
                }
                Decoded::Unknown { type_ } => {
                    self.stats.unknown_skipped += 1;
                    debug!("Source {}: skipped record type {}", self.source_id, type_);
                }
                Decoded::Malformed(e) => {
                    self.stats.decode_errors += 1;
                    warn!("Source {}: skipped malformed record: {}", self.source_id, e);
                }
            }
        }

        Ok(drain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{self, SampleBody, SyntheticProducer};
    use crate::{MemoryStorage, SampleId};

    const PAGE: u64 = 4096;

    fn source(source_id: SourceId, n_pages: u32, batch_cap: usize) -> (SyntheticProducer, SourceReader) {
        let storage = MemoryStorage::with_page_size(n_pages, PAGE).unwrap();
        let producer = SyntheticProducer::new(unsafe { PerfRing::from_storage(&storage).unwrap() })
            .with_lost_identity(source_id as u64, 0);
        let reader = SourceReader::new(
            SourceRegistration {
                source_id,
                target: SourceTarget::Cpu(0),
                sample_kind: SampleKind::Callchain,
                storage: Box::new(storage),
            },
            batch_cap,
        )
        .unwrap();
        (producer, reader)
    }

    fn sample(time: u64) -> Vec<u8> {
        let id = SampleId {
            time,
            ..SampleId::default()
        };
        synthetic::callchain_sample_record(&id, &[time])
    }

    #[test]
    fn test_drain_returns_events_in_buffer_order() {
        let (mut producer, mut reader) = source(0, 4, 1024);
        for time in [10, 20, 30] {
            producer.emit(&sample(time)).unwrap();
        }

        let drain = reader.drain_available().unwrap();
        assert!(drain.exhausted);
        let times: Vec<u64> = drain.events.iter().map(Event::time).collect();
        assert_eq!(times, vec![10, 20, 30]);

        let drain = reader.drain_available().unwrap();
        assert!(drain.exhausted);
        assert!(drain.events.is_empty());
        assert_eq!(reader.stats().records_read, 3);
    }

    #[test]
    fn test_batch_cap_bounds_each_drain() {
        let (mut producer, mut reader) = source(0, 4, 2);
        for time in 1..=5 {
            producer.emit(&sample(time)).unwrap();
        }

        let first = reader.drain_available().unwrap();
        assert_eq!(first.events.len(), 2);
        assert!(!first.exhausted);

        let second = reader.drain_available().unwrap();
        assert_eq!(second.events.len(), 2);
        assert!(!second.exhausted);

        // Exactly at the cap with nothing left is exhausted
        let third = reader.drain_available().unwrap();
        assert_eq!(third.events.len(), 1);
        assert!(third.exhausted);
    }

    #[test]
    fn test_malformed_records_are_logged_and_skipped() {
        testing_logger::setup();
        let (mut producer, mut reader) = source(3, 4, 1024);
        producer.emit(&sample(1)).unwrap();
        producer
            .emit(&synthetic::sample_record_with_body(
                &SampleId::default(),
                &SampleBody::Callchain {
                    nr: 50,
                    ips: vec![],
                },
            ))
            .unwrap();
        producer.emit(&sample(2)).unwrap();

        let drain = reader.drain_available().unwrap();
        assert_eq!(drain.events.len(), 2);
        assert_eq!(reader.stats().decode_errors, 1);
        assert_eq!(reader.stats().records_read, 3);

        testing_logger::validate(|captured_logs| {
            let warnings: Vec<_> = captured_logs
                .iter()
                .filter(|log| log.level == log::Level::Warn)
                .collect();
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0]
                .body
                .starts_with("Source 3: skipped malformed record:"));
        });
    }

    #[test]
    fn test_lost_counts_accumulate() {
        // One data page: 73 callchain records of 56 bytes fit
        let (mut producer, mut reader) = source(1, 1, 1024);

        let mut overwritten = 0;
        let mut lost_seen = 0;
        let mut time = 0;
        for _round in 0..3 {
            for _ in 0..100 {
                time += 1;
                if !producer.emit(&sample(time)).unwrap() {
                    overwritten += 1;
                }
            }
            let drain = reader.drain_available().unwrap();
            lost_seen += drain
                .events
                .iter()
                .filter_map(|event| match event {
                    Event::Lost(lost) => Some(lost.lost),
                    _ => None,
                })
                .sum::<u64>();
        }

        // Report what is still pending and drain it
        assert!(producer.flush_lost(time).unwrap());
        for event in reader.drain_available().unwrap().events {
            if let Event::Lost(lost) = event {
                lost_seen += lost.lost;
            }
        }

        assert!(overwritten > 0);
        assert_eq!(overwritten, producer.dropped());
        assert_eq!(lost_seen, overwritten);
        assert_eq!(reader.stats().lost_total, overwritten);
    }

    #[test]
    fn test_corrupt_header_fails_the_source() {
        let storage = MemoryStorage::with_page_size(1, PAGE).unwrap();
        let mut writer = unsafe { PerfRing::from_storage(&storage).unwrap() };
        let mut reader = SourceReader::new(
            SourceRegistration {
                source_id: 9,
                target: SourceTarget::Thread(1234),
                sample_kind: SampleKind::Stack,
                storage: Box::new(storage),
            },
            16,
        )
        .unwrap();

        // Publish a valid record, then rewrite its size to claim more than was published
        writer.start_write_batch();
        writer.write_record(&sample(1)).unwrap();
        writer.finish_write_batch();
        unsafe {
            let data = reader.storage.base_ptr().add(PAGE as usize);
            std::ptr::copy_nonoverlapping(4000u16.to_le_bytes().as_ptr(), data.add(6), 2);
        }

        match reader.drain_available() {
            Err(SourceError::CorruptRing { source_id, error }) => {
                assert_eq!(source_id, 9);
                assert!(matches!(error, PerfRingError::CorruptHeader { size: 4000, .. }));
            }
            other => panic!("expected a corrupt ring, got {:?}", other.map(|d| d.events.len())),
        }
    }
}
