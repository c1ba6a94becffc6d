use log::{debug, warn};
use perf_events::{Event, SourceId};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use thiserror::Error;
use watermark::WatermarkTracker;

/// Errors that can occur when feeding the merger
#[derive(Error, Debug, PartialEq)]
pub enum MergerError {
    #[error("watermark error: {0}")]
    Watermark(#[from] watermark::Error),
}

/// Watermark tuning, in the clock's nanoseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergerConfig {
    pub stall_timeout_ns: u64,
    pub idle_slack_ns: u64,
    pub rejoin_stalled: bool,
}

/// Merger counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergerStats {
    pub events_pushed: u64,
    pub events_emitted: u64,

    /// Number of LOST records merged
    pub lost_records: u64,

    /// Sum of the counts carried by LOST records
    pub lost_total: u64,

    /// Events emitted with a timestamp below one already emitted
    pub late_events: u64,
}

/// Head of one source's queue
struct MergeEntry {
    time: u64,
    source_id: SourceId,
}

impl Eq for MergeEntry {}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.source_id == other.source_id
    }
}

// We implement Ord and PartialOrd to create a min-heap
// (BinaryHeap in Rust is a max-heap by default)
impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap; ties go to the lower source id
        (other.time, other.source_id).cmp(&(self.time, self.source_id))
    }
}

/// EventMerger turns per-source batches into one time-ordered stream.
///
/// Each source's events are queued in arrival order. The heap holds exactly
/// one entry per non-empty queue, keyed by the time of its head event. An
/// event leaves the merger once its time is at or below the watermark, the
/// point every live source has progressed past.
pub struct EventMerger {
    config: MergerConfig,
    tracker: WatermarkTracker,
    queues: Vec<VecDeque<Event>>,
    heap: BinaryHeap<MergeEntry>,
    lost_by_source: Vec<u64>,
    last_emitted: Option<u64>,
    stats: MergerStats,
}

impl EventMerger {
    pub fn new(config: MergerConfig) -> Self {
        EventMerger {
            config,
            tracker: WatermarkTracker::new(config.stall_timeout_ns, config.rejoin_stalled),
            queues: Vec::new(),
            heap: BinaryHeap::new(),
            lost_by_source: Vec::new(),
            last_emitted: None,
            stats: MergerStats::default(),
        }
    }

    /// Starts holding events back for `source_id` until it reports or stalls
    pub fn register_source(&mut self, source_id: SourceId, now: u64) -> Result<(), MergerError> {
        self.tracker.register_source(source_id, now)?;
        if source_id >= self.queues.len() {
            self.queues.resize_with(source_id + 1, VecDeque::new);
            self.lost_by_source.resize(source_id + 1, 0);
        }
        Ok(())
    }

    /// Stops waiting on `source_id`. Events it already delivered are still emitted.
    pub fn remove_source(&mut self, source_id: SourceId) -> Result<(), MergerError> {
        self.tracker.remove_source(source_id)?;
        Ok(())
    }

    /// Queues a batch drained from `source_id`, in buffer order.
    ///
    /// The time of the batch's last event becomes the source's contribution
    /// to the watermark.
    pub fn push_batch(
        &mut self,
        source_id: SourceId,
        events: Vec<Event>,
        now: u64,
    ) -> Result<(), MergerError> {
        let Some(last_time) = events.last().map(Event::time) else {
            return Ok(());
        };
        self.tracker.update(source_id, last_time, now)?;

        let queue = &mut self.queues[source_id];
        let was_empty = queue.is_empty();
        self.stats.events_pushed += events.len() as u64;

        for event in events {
            if let Event::Lost(lost) = &event {
                self.stats.lost_records += 1;
                self.stats.lost_total += lost.lost;
                self.lost_by_source[source_id] += lost.lost;
            }
            queue.push_back(event);
        }

        if was_empty {
            if let Some(head) = queue.front() {
                self.heap.push(MergeEntry {
                    time: head.time(),
                    source_id,
                });
            }
        }
        Ok(())
    }

    /// Records that `source_id` was found empty at `now`, so it will not
    /// produce events older than `now` minus the idle slack.
    pub fn mark_drained(&mut self, source_id: SourceId, now: u64) -> Result<(), MergerError> {
        let progress = now.saturating_sub(self.config.idle_slack_ns);
        self.tracker.update(source_id, progress, now)?;
        Ok(())
    }

    /// Current watermark. Stalled sources are excluded first.
    pub fn watermark(&mut self, now: u64) -> Option<u64> {
        self.tracker.get_min(now)
    }

    /// Removes and returns, in time order, every queued event at or below the watermark
    pub fn pop_ready(&mut self, now: u64) -> Vec<Event> {
        let mut ready = Vec::new();
        let Some(watermark) = self.watermark(now) else {
            return ready;
        };

        while let Some(entry) = self.heap.peek() {
            if entry.time > watermark {
                break;
            }
            if let Some(event) = self.pop_head() {
                ready.push(event);
            }
        }

        if !ready.is_empty() {
            debug!(
                "Emitting {} events up to watermark {}",
                ready.len(),
                watermark
            );
        }
        ready
    }

    /// Removes and returns every queued event in time order, regardless of the watermark
    pub fn flush(&mut self) -> Vec<Event> {
        let mut remaining = Vec::with_capacity(self.queued());
        while let Some(event) = self.pop_head() {
            remaining.push(event);
        }
        remaining
    }

    /// Number of events waiting for the watermark
    pub fn queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> MergerStats {
        self.stats
    }

    /// Cumulative lost counts, indexed by source id
    pub fn lost_by_source(&self) -> &[u64] {
        &self.lost_by_source
    }

    /// Pops the globally oldest queued event and re-arms its source's heap entry
    fn pop_head(&mut self) -> Option<Event> {
        let entry = self.heap.pop()?;
        let queue = &mut self.queues[entry.source_id];
        let event = queue.pop_front()?;

        if let Some(next) = queue.front() {
            self.heap.push(MergeEntry {
                time: next.time(),
                source_id: entry.source_id,
            });
        }

        let time = event.time();
        match self.last_emitted {
            Some(last) if time < last => {
                self.stats.late_events += 1;
                warn!(
                    "Source {} delivered an event at {} after events up to {} were emitted",
                    entry.source_id, time, last
                );
            }
            _ => self.last_emitted = Some(time),
        }
        self.stats.events_emitted += 1;
        Some(event)
    }
}
