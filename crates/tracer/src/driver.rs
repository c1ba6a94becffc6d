use log::{debug, error, info, warn};
use perf_events::{Event, SourceError, SourceId, SourceReader, SourceStats};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{dispatch, ConfigError, EventMerger, EventSink, MergerError, MergerStats, TracerConfig};

/// Errors that end a driver run
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("driver has already run")]
    AlreadyStopped,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("merger error: {0}")]
    Merger(#[from] MergerError),

    #[error("waiting for readiness failed: {0}")]
    Poll(io::Error),
}

/// Lifecycle of a [`Driver`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Outcome of waiting on one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceReadiness {
    /// Data may be available
    Ready,

    /// Nothing happened before the timeout
    Idle,

    /// The event's target went away; whatever is in the ring can still be read
    HungUp,

    /// The descriptor can no longer be used
    Failed,
}

/// Blocks until some source may have data, the timeout elapses or `stop` fires
pub trait Poller {
    /// Returns one readiness per entry of `fds`. A `None` entry has no
    /// descriptor to wait on and is reported `Ready`, leaving the cheap
    /// cursor check to decide.
    fn wait(
        &mut self,
        fds: &[Option<RawFd>],
        timeout: Duration,
        stop: &CancellationToken,
    ) -> io::Result<Vec<SourceReadiness>>;
}

/// Nanosecond clock on the same time base as the sampled events
pub trait Clock {
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC`, which every source is opened with through `use_clockid`
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer
        unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    }
}

/// [`Poller`] over the perf fds with `poll(2)`
#[derive(Debug, Default)]
pub struct FdPoller {
    pollfds: Vec<libc::pollfd>,
}

impl FdPoller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Poller for FdPoller {
    fn wait(
        &mut self,
        fds: &[Option<RawFd>],
        timeout: Duration,
        stop: &CancellationToken,
    ) -> io::Result<Vec<SourceReadiness>> {
        if stop.is_cancelled() {
            return Ok(vec![SourceReadiness::Idle; fds.len()]);
        }

        // Negative fds are ignored by poll(2)
        self.pollfds.clear();
        self.pollfds.extend(fds.iter().map(|fd| libc::pollfd {
            fd: fd.unwrap_or(-1),
            events: libc::POLLIN,
            revents: 0,
        }));

        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let ret = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(fds
            .iter()
            .zip(&self.pollfds)
            .map(|(fd, pollfd)| {
                if fd.is_none() {
                    SourceReadiness::Ready
                } else if pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                    SourceReadiness::Failed
                } else if pollfd.revents & libc::POLLHUP != 0 {
                    SourceReadiness::HungUp
                } else if pollfd.revents & libc::POLLIN != 0 {
                    SourceReadiness::Ready
                } else {
                    SourceReadiness::Idle
                }
            })
            .collect())
    }
}

/// Counters of a finished run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriverStats {
    /// Wait-drain-emit rounds while running
    pub rounds: u64,

    /// Events handed to the sink
    pub events_emitted: u64,

    /// Drained events the merger refused
    pub events_discarded: u64,

    pub merger: MergerStats,

    /// Counters of every source, including removed ones
    pub sources: Vec<(SourceId, SourceStats)>,

    /// Sources removed because they failed
    pub failed_sources: Vec<SourceId>,
}

/// Batches taken from one source in the final pass before giving up on emptying it
const MAX_FINAL_BATCHES: usize = 1024;

struct SourceSlot {
    source_id: SourceId,
    reader: Option<SourceReader>,
    stats: SourceStats,
    hung_up: bool,
}

impl SourceSlot {
    /// Descriptor to wait on; hung-up sources are only checked through their cursors
    fn wait_fd(&self) -> Option<RawFd> {
        match &self.reader {
            Some(reader) if !self.hung_up => reader.file_descriptor(),
            _ => None,
        }
    }
}

/// Driver runs the drain loop: wait, drain every source, merge, emit.
pub struct Driver<P: Poller, C: Clock> {
    config: TracerConfig,
    slots: Vec<SourceSlot>,
    poller: P,
    clock: C,
    merger: EventMerger,
    state: DriverState,
    events_emitted: u64,
    events_discarded: u64,
}

impl<P: Poller, C: Clock> Driver<P, C> {
    pub fn new(
        config: TracerConfig,
        sources: Vec<SourceReader>,
        poller: P,
        clock: C,
    ) -> Result<Self, DriverError> {
        config.validate()?;
        let merger = EventMerger::new(config.merger_config());
        let slots = sources
            .into_iter()
            .map(|reader| SourceSlot {
                source_id: reader.source_id(),
                stats: reader.stats(),
                reader: Some(reader),
                hung_up: false,
            })
            .collect();

        Ok(Driver {
            config,
            slots,
            poller,
            clock,
            merger,
            state: DriverState::Idle,
            events_emitted: 0,
            events_discarded: 0,
        })
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Runs until `stop` is cancelled, then drains what is left and ends the session.
    ///
    /// A failing source is removed and the rest keep running. An error from
    /// the readiness wait itself ends the run, but only after the final
    /// drain so the sink still sees every event read so far.
    pub fn run<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
        stop: CancellationToken,
    ) -> Result<DriverStats, DriverError> {
        if self.state != DriverState::Idle {
            return Err(DriverError::AlreadyStopped);
        }

        let now = self.clock.now_ns();
        for slot in &self.slots {
            self.merger.register_source(slot.source_id, now)?;
        }

        self.state = DriverState::Running;
        info!("Driver running with {} sources", self.slots.len());

        let mut rounds = 0;
        let mut failed_sources = Vec::new();
        let mut poll_error = None;

        while !stop.is_cancelled() {
            let fds: Vec<Option<RawFd>> = self.slots.iter().map(SourceSlot::wait_fd).collect();
            let readiness = match self.poller.wait(&fds, self.config.poll_timeout, &stop) {
                Ok(readiness) => readiness,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Waiting for readiness failed, stopping: {}", e);
                    poll_error = Some(e);
                    break;
                }
            };

            // Everything delivered after this instant may be older than it, not before
            let now = self.clock.now_ns();
            for index in 0..self.slots.len() {
                if self.slots[index].reader.is_none() {
                    continue;
                }
                match readiness.get(index).copied().unwrap_or(SourceReadiness::Ready) {
                    SourceReadiness::Failed => {
                        error!(
                            "Removing source {}: descriptor failed",
                            self.slots[index].source_id
                        );
                        self.remove_source(index);
                        failed_sources.push(self.slots[index].source_id);
                        continue;
                    }
                    SourceReadiness::HungUp if !self.slots[index].hung_up => {
                        info!(
                            "Source {} hung up, reading what is left",
                            self.slots[index].source_id
                        );
                        self.slots[index].hung_up = true;
                    }
                    _ => {}
                }

                if let Err(e) = self.drain_source(index, now, false) {
                    error!("Removing {}", e);
                    self.remove_source(index);
                    failed_sources.push(self.slots[index].source_id);
                }
            }

            let ready = self.merger.pop_ready(now);
            self.emit(sink, ready);
            rounds += 1;
        }

        self.state = DriverState::Draining;
        debug!("Driver draining after {} rounds", rounds);

        // Stop the producers first so the final pass can reach the end of each ring
        for slot in &self.slots {
            if let Some(reader) = &slot.reader {
                if let Err(e) = reader.disable() {
                    warn!("Source {}: failed to disable: {}", slot.source_id, e);
                }
            }
        }

        let now = self.clock.now_ns();
        for index in 0..self.slots.len() {
            if self.slots[index].reader.is_none() {
                continue;
            }
            if let Err(e) = self.drain_source(index, now, true) {
                error!("Removing {}", e);
                self.remove_source(index);
                failed_sources.push(self.slots[index].source_id);
            }
        }

        let remaining = self.merger.flush();
        self.emit(sink, remaining);
        sink.on_session_end();

        for index in 0..self.slots.len() {
            self.remove_source(index);
        }
        self.state = DriverState::Stopped;

        let stats = DriverStats {
            rounds,
            events_emitted: self.events_emitted,
            events_discarded: self.events_discarded,
            merger: self.merger.stats(),
            sources: self
                .slots
                .iter()
                .map(|slot| (slot.source_id, slot.stats))
                .collect(),
            failed_sources,
        };
        info!(
            "Driver stopped: {} events emitted, {} lost",
            stats.events_emitted, stats.merger.lost_total
        );

        match poll_error {
            Some(e) => Err(DriverError::Poll(e)),
            None => Ok(stats),
        }
    }

    /// Drains one source into the merger. `to_empty` ignores the batch cap.
    fn drain_source(&mut self, index: usize, now: u64, to_empty: bool) -> Result<(), SourceError> {
        let slot = &mut self.slots[index];
        let Some(reader) = slot.reader.as_mut() else {
            return Ok(());
        };

        for _ in 0..MAX_FINAL_BATCHES {
            let drain = reader.drain_available()?;
            slot.stats = reader.stats();

            let n_events = drain.events.len() as u64;
            if let Err(e) = self.merger.push_batch(slot.source_id, drain.events, now) {
                error!(
                    "Source {}: discarding {} events the merger refused: {}",
                    slot.source_id, n_events, e
                );
                self.events_discarded += n_events;
            }
            if drain.exhausted {
                // A hung-up source makes no more progress and is left to stall out
                if !slot.hung_up {
                    if let Err(e) = self.merger.mark_drained(slot.source_id, now) {
                        debug!("Source {}: idle progress not recorded: {}", slot.source_id, e);
                    }
                }
                return Ok(());
            }
            if !to_empty {
                return Ok(());
            }
        }

        debug!(
            "Source {} still producing after {} batches, leaving the rest",
            slot.source_id, MAX_FINAL_BATCHES
        );
        Ok(())
    }

    /// Takes a source out of the session, keeping its final counters
    fn remove_source(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(reader) = slot.reader.take() {
            slot.stats = reader.stats();
            if let Err(e) = self.merger.remove_source(slot.source_id) {
                debug!("Source {} was not tracked: {}", slot.source_id, e);
            }
        }
    }

    fn emit<S: EventSink + ?Sized>(&mut self, sink: &mut S, events: Vec<Event>) {
        self.events_emitted += events.len() as u64;
        for event in events {
            dispatch(sink, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;
    use perf_events::synthetic::{self, SyntheticProducer};
    use perf_events::{
        CommEvent, ForkExitEvent, LostEvent, MemoryStorage, MmapEvent, PerfRing, SampleId,
        SampleKind, SourceRegistration, SourceTarget, Storage, TracepointSample,
    };
    use perf_events::StorageError;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const PAGE: u64 = 4096;

    /// Poller driven by a closure called once per round
    struct FnPoller<F>(F);

    impl<F> Poller for FnPoller<F>
    where
        F: FnMut(&[Option<RawFd>], &CancellationToken) -> Vec<SourceReadiness>,
    {
        fn wait(
            &mut self,
            fds: &[Option<RawFd>],
            _timeout: Duration,
            stop: &CancellationToken,
        ) -> io::Result<Vec<SourceReadiness>> {
            Ok((self.0)(fds, stop))
        }
    }

    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<u64>>);

    impl Clock for ManualClock {
        fn now_ns(&self) -> u64 {
            self.0.get()
        }
    }

    /// Records event times; shared so the poller can look at progress
    #[derive(Clone, Default)]
    struct RecordingSink {
        times: Rc<RefCell<Vec<u64>>>,
        ended: Rc<Cell<bool>>,
    }

    impl RecordingSink {
        fn record(&mut self, time: u64) {
            self.times.borrow_mut().push(time);
        }

        fn len(&self) -> usize {
            self.times.borrow().len()
        }
    }

    impl EventSink for RecordingSink {
        fn on_sample(&mut self, sample: Sample) {
            self.record(sample.time());
        }
        fn on_tracepoint(&mut self, tracepoint: TracepointSample) {
            self.record(tracepoint.time);
        }
        fn on_mmap(&mut self, mmap: MmapEvent) {
            self.record(mmap.time);
        }
        fn on_lost(&mut self, lost: LostEvent) {
            self.record(lost.time);
        }
        fn on_comm(&mut self, comm: CommEvent) {
            self.record(comm.time);
        }
        fn on_fork_exit(&mut self, event: ForkExitEvent) {
            self.record(event.time);
        }
        fn on_session_end(&mut self) {
            self.ended.set(true);
        }
    }

    fn memory_source(source_id: SourceId) -> (SyntheticProducer, SourceReader, *mut u8) {
        let storage = MemoryStorage::with_page_size(4, PAGE).unwrap();
        let base = storage.base_ptr();
        let producer = SyntheticProducer::new(unsafe { PerfRing::from_storage(&storage).unwrap() });
        let reader = SourceReader::new(
            SourceRegistration {
                source_id,
                target: SourceTarget::Cpu(source_id as u32),
                sample_kind: SampleKind::Callchain,
                storage: Box::new(storage),
            },
            64,
        )
        .unwrap();
        (producer, reader, base)
    }

    /// Memory ring that remembers being disabled
    struct DisableTracking {
        storage: MemoryStorage,
        disabled: Arc<AtomicBool>,
    }

    impl Storage for DisableTracking {
        fn base_ptr(&self) -> *mut u8 {
            self.storage.base_ptr()
        }
        fn mapping_len(&self) -> usize {
            self.storage.mapping_len()
        }
        fn num_data_pages(&self) -> u32 {
            self.storage.num_data_pages()
        }
        fn page_size(&self) -> u64 {
            self.storage.page_size()
        }
        fn file_descriptor(&self) -> Option<RawFd> {
            None
        }
        fn disable(&self) -> Result<(), StorageError> {
            self.disabled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(time: u64) -> Vec<u8> {
        let id = SampleId {
            time,
            ..SampleId::default()
        };
        synthetic::callchain_sample_record(&id, &[time])
    }

    fn config() -> TracerConfig {
        TracerConfig {
            stall_timeout: Duration::from_nanos(1000),
            idle_slack: Duration::ZERO,
            ..TracerConfig::default()
        }
    }

    #[test]
    fn test_run_twice_is_rejected() {
        let (_producer, reader, _) = memory_source(0);
        let poller = FnPoller(|fds: &[Option<RawFd>], stop: &CancellationToken| {
            stop.cancel();
            vec![SourceReadiness::Idle; fds.len()]
        });
        let mut driver =
            Driver::new(config(), vec![reader], poller, ManualClock::default()).unwrap();
        assert_eq!(driver.state(), DriverState::Idle);

        let mut sink = RecordingSink::default();
        let stats = driver.run(&mut sink, CancellationToken::new()).unwrap();
        assert_eq!(driver.state(), DriverState::Stopped);
        assert_eq!(stats.rounds, 1);
        assert!(sink.ended.get());

        assert!(matches!(
            driver.run(&mut sink, CancellationToken::new()),
            Err(DriverError::AlreadyStopped)
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let poller = FnPoller(|fds: &[Option<RawFd>], _: &CancellationToken| {
            vec![SourceReadiness::Idle; fds.len()]
        });
        let config = TracerConfig {
            batch_cap: 0,
            ..TracerConfig::default()
        };
        assert!(matches!(
            Driver::new(config, vec![], poller, ManualClock::default()),
            Err(DriverError::Config(ConfigError::Zero("batch cap")))
        ));
    }

    #[test]
    fn test_stop_before_first_round_still_drains() {
        let (mut producer, reader, _) = memory_source(0);
        for time in [1, 2, 3] {
            producer.emit(&record(time)).unwrap();
        }
        let poller = FnPoller(|_: &[Option<RawFd>], _: &CancellationToken| -> Vec<SourceReadiness> {
            panic!("no waiting after stop")
        });
        let mut driver =
            Driver::new(config(), vec![reader], poller, ManualClock::default()).unwrap();

        let stop = CancellationToken::new();
        stop.cancel();
        let mut sink = RecordingSink::default();
        let stats = driver.run(&mut sink, stop).unwrap();

        assert_eq!(stats.rounds, 0);
        assert_eq!(*sink.times.borrow(), vec![1, 2, 3]);
        assert_eq!(stats.sources.len(), 1);
        assert_eq!(stats.sources[0].1.records_read, 3);
    }

    #[test]
    fn test_failed_source_is_removed_once() {
        testing_logger::setup();
        let (mut producer0, reader0, _) = memory_source(0);
        let (_producer1, reader1, _) = memory_source(1);
        let clock = ManualClock::default();

        let mut round = 0;
        let round_clock = clock.clone();
        let poller = FnPoller(move |fds: &[Option<RawFd>], stop: &CancellationToken| {
            round += 1;
            round_clock.0.set(round * 100);
            if round == 4 {
                stop.cancel();
                return vec![SourceReadiness::Idle; fds.len()];
            }
            producer0.emit(&record(round * 100)).unwrap();
            vec![SourceReadiness::Ready, SourceReadiness::Failed]
        });
        let mut driver = Driver::new(config(), vec![reader0, reader1], poller, clock).unwrap();

        let mut sink = RecordingSink::default();
        let stats = driver.run(&mut sink, CancellationToken::new()).unwrap();

        assert_eq!(*sink.times.borrow(), vec![100, 200, 300]);
        assert_eq!(stats.failed_sources, vec![1]);

        testing_logger::validate(|captured_logs| {
            let errors: Vec<_> = captured_logs
                .iter()
                .filter(|log| log.level == log::Level::Error)
                .collect();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].body, "Removing source 1: descriptor failed");
        });
    }

    #[test]
    fn test_corrupt_source_is_removed_and_others_continue() {
        let (mut producer0, reader0, base0) = memory_source(0);
        let (mut producer1, reader1, _) = memory_source(1);
        let clock = ManualClock::default();

        // Source 0's first record claims more bytes than were published
        producer0.emit(&record(50)).unwrap();
        unsafe {
            let size = 3000u16.to_le_bytes();
            std::ptr::copy_nonoverlapping(size.as_ptr(), base0.add(PAGE as usize + 6), 2);
        }

        let mut round = 0;
        let round_clock = clock.clone();
        let poller = FnPoller(move |fds: &[Option<RawFd>], stop: &CancellationToken| {
            round += 1;
            round_clock.0.set(round * 100);
            if round == 3 {
                stop.cancel();
            } else {
                producer1.emit(&record(round * 100)).unwrap();
            }
            vec![SourceReadiness::Ready; fds.len()]
        });
        let mut driver = Driver::new(config(), vec![reader0, reader1], poller, clock).unwrap();

        let mut sink = RecordingSink::default();
        let stats = driver.run(&mut sink, CancellationToken::new()).unwrap();

        assert_eq!(*sink.times.borrow(), vec![100, 200]);
        assert_eq!(stats.failed_sources, vec![0]);
        assert!(sink.ended.get());
    }

    #[test]
    fn test_hung_up_source_holds_watermark_until_it_stalls() {
        let (mut producer0, reader0, _) = memory_source(0);
        let (mut producer1, reader1, _) = memory_source(1);
        let clock = ManualClock::default();
        let mut sink = RecordingSink::default();

        let seen = sink.clone();
        let emitted = Rc::new(RefCell::new(Vec::new()));
        let emitted_out = emitted.clone();

        let mut round = 0;
        let round_clock = clock.clone();
        let poller = FnPoller(move |fds: &[Option<RawFd>], stop: &CancellationToken| {
            round += 1;
            emitted.borrow_mut().push(seen.len());
            match round {
                1 => {
                    round_clock.0.set(100);
                    producer0.emit(&record(100)).unwrap();
                    producer1.emit(&record(100)).unwrap();
                }
                2 => {
                    round_clock.0.set(500);
                    producer1.emit(&record(500)).unwrap();
                }
                3 => {
                    round_clock.0.set(1200);
                    producer1.emit(&record(1200)).unwrap();
                }
                _ => stop.cancel(),
            }
            vec![SourceReadiness::HungUp, SourceReadiness::Ready]
        });
        let mut driver = Driver::new(config(), vec![reader0, reader1], poller, clock).unwrap();
        driver.run(&mut sink, CancellationToken::new()).unwrap();

        // Round 2's event waits on the hung-up source until it stalls out in round 3
        assert_eq!(*emitted_out.borrow(), vec![0, 2, 2, 4]);
        assert_eq!(*sink.times.borrow(), vec![100, 100, 500, 1200]);
    }

    #[test]
    fn test_sources_are_disabled_before_the_final_drain() {
        let storage = MemoryStorage::with_page_size(4, PAGE).unwrap();
        let mut producer =
            SyntheticProducer::new(unsafe { PerfRing::from_storage(&storage).unwrap() });
        let disabled = Arc::new(AtomicBool::new(false));
        let reader = SourceReader::new(
            SourceRegistration {
                source_id: 0,
                target: SourceTarget::Cpu(0),
                sample_kind: SampleKind::Callchain,
                storage: Box::new(DisableTracking {
                    storage,
                    disabled: disabled.clone(),
                }),
            },
            64,
        )
        .unwrap();

        let poll_disabled = disabled.clone();
        let poller = FnPoller(move |fds: &[Option<RawFd>], stop: &CancellationToken| {
            assert!(!poll_disabled.load(Ordering::SeqCst));
            producer.emit(&record(5)).unwrap();
            stop.cancel();
            vec![SourceReadiness::Idle; fds.len()]
        });
        let mut driver =
            Driver::new(config(), vec![reader], poller, ManualClock::default()).unwrap();

        let mut sink = RecordingSink::default();
        driver.run(&mut sink, CancellationToken::new()).unwrap();

        assert!(disabled.load(Ordering::SeqCst));
        assert_eq!(*sink.times.borrow(), vec![5]);
    }

    #[test]
    fn test_refused_batch_is_counted_and_logged() {
        testing_logger::setup();
        let (mut producer, reader, _) = memory_source(3);
        for time in [1, 2, 3] {
            producer.emit(&record(time)).unwrap();
        }
        let poller = FnPoller(|fds: &[Option<RawFd>], _: &CancellationToken| {
            vec![SourceReadiness::Idle; fds.len()]
        });
        let mut driver =
            Driver::new(config(), vec![reader], poller, ManualClock::default()).unwrap();

        // Sources are only registered with the merger once the run starts
        driver.drain_source(0, 0, false).unwrap();
        assert_eq!(driver.events_discarded, 3);
        assert_eq!(driver.merger.queued(), 0);

        testing_logger::validate(|captured_logs| {
            let errors: Vec<_> = captured_logs
                .iter()
                .filter(|log| log.level == log::Level::Error)
                .collect();
            assert_eq!(errors.len(), 1);
            assert!(errors[0]
                .body
                .starts_with("Source 3: discarding 3 events the merger refused:"));
        });
    }
}
