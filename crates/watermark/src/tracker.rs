use log::{info, warn};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during WatermarkTracker operations
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    /// The source was never registered or has been removed
    #[error("source {0} is not registered")]
    UnknownSource(usize),

    /// The source is already registered
    #[error("source {0} is already registered")]
    DuplicateSource(usize),
}

#[derive(Debug, Clone, Copy)]
struct SourceState {
    /// Highest timestamp reported, `None` until the first report
    contribution: Option<u64>,

    /// Clock time of the last report, or of registration
    last_refresh: u64,

    /// Stalled out of the minimum
    excluded: bool,
}

/// Tracks the minimum progress across a dynamic set of event sources.
///
/// Each source contributes the highest timestamp it has reported. The
/// watermark is the minimum contribution over all live sources. A source
/// that has not reported for `stall_timeout` (measured with the `now`
/// values passed in) is excluded from the minimum.
///
/// # Examples
///
/// ```
/// use watermark::WatermarkTracker;
///
/// // Exclude sources after 1s without a report
/// let mut tracker = WatermarkTracker::new(1_000_000_000, true);
/// tracker.register_source(0, 0).unwrap();
/// tracker.register_source(1, 0).unwrap();
///
/// tracker.update(0, 5_000, 10).unwrap();
/// assert_eq!(tracker.get_min(10), None); // source 1 has not reported
///
/// tracker.update(1, 3_000, 10).unwrap();
/// assert_eq!(tracker.get_min(10), Some(3_000));
/// ```
///
/// # Stalled sources
///
/// ```
/// use watermark::WatermarkTracker;
///
/// let mut tracker = WatermarkTracker::new(100, false);
/// tracker.register_source(0, 0).unwrap();
/// tracker.register_source(1, 0).unwrap();
/// tracker.update(0, 50, 0).unwrap();
/// tracker.update(1, 10, 0).unwrap();
///
/// // Source 1 goes quiet while source 0 keeps reporting
/// tracker.update(0, 150, 150).unwrap();
/// assert_eq!(tracker.get_min(150), Some(150));
/// assert!(tracker.is_excluded(1));
/// ```
pub struct WatermarkTracker {
    /// Time without a report after which a source is excluded
    stall_timeout: u64,

    /// Whether an excluded source that reports again counts once more
    rejoin_stalled: bool,

    /// State of each registered source, indexed by source id
    sources: Vec<Option<SourceState>>,

    /// Map of contributions to count of live sources reporting that contribution
    contribution_counts: BTreeMap<u64, usize>,

    /// Count of live sources that have not yet reported a timestamp
    uninitialized_sources: usize,

    /// Count of registered sources that are not excluded
    live_sources: usize,
}

impl WatermarkTracker {
    /// Creates a tracker with no sources.
    ///
    /// # Arguments
    ///
    /// * `stall_timeout` - Time without a report after which a source is
    ///   excluded from the minimum, in the unit of the `now` arguments
    /// * `rejoin_stalled` - Whether an excluded source rejoins when it reports again
    pub fn new(stall_timeout: u64, rejoin_stalled: bool) -> Self {
        Self {
            stall_timeout,
            rejoin_stalled,
            sources: Vec::new(),
            contribution_counts: BTreeMap::new(),
            uninitialized_sources: 0,
            live_sources: 0,
        }
    }

    /// Starts tracking `source_id`. It holds the watermark back until it
    /// first reports or stalls.
    pub fn register_source(&mut self, source_id: usize, now: u64) -> Result<(), Error> {
        if source_id >= self.sources.len() {
            self.sources.resize(source_id + 1, None);
        }
        if self.sources[source_id].is_some() {
            return Err(Error::DuplicateSource(source_id));
        }

        self.sources[source_id] = Some(SourceState {
            contribution: None,
            last_refresh: now,
            excluded: false,
        });
        self.uninitialized_sources += 1;
        self.live_sources += 1;
        Ok(())
    }

    /// Stops tracking `source_id`. Its contribution no longer holds the watermark back.
    pub fn remove_source(&mut self, source_id: usize) -> Result<(), Error> {
        let state = self
            .sources
            .get_mut(source_id)
            .and_then(Option::take)
            .ok_or(Error::UnknownSource(source_id))?;

        if !state.excluded {
            self.forget(state);
        }
        Ok(())
    }

    /// Records that `source_id` has delivered every event up to `timestamp`.
    ///
    /// Contributions only move forward: a timestamp below the previous one is
    /// clamped, but still refreshes the source's liveness. An excluded source
    /// rejoins here when the tracker was built with `rejoin_stalled`.
    ///
    /// # Examples
    ///
    /// ```
    /// use watermark::WatermarkTracker;
    ///
    /// let mut tracker = WatermarkTracker::new(1_000, true);
    /// tracker.register_source(0, 0).unwrap();
    /// tracker.update(0, 500, 0).unwrap();
    /// tracker.update(0, 400, 1).unwrap(); // clamped
    /// assert_eq!(tracker.contribution(0), Some(500));
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `UnknownSource` if the source is not registered.
    pub fn update(&mut self, source_id: usize, timestamp: u64, now: u64) -> Result<(), Error> {
        let rejoin_stalled = self.rejoin_stalled;
        let state = self
            .sources
            .get_mut(source_id)
            .and_then(Option::as_mut)
            .ok_or(Error::UnknownSource(source_id))?;

        let prev = state.contribution;
        let new = prev.map_or(timestamp, |prev| prev.max(timestamp));
        state.contribution = Some(new);
        state.last_refresh = state.last_refresh.max(now);

        if state.excluded {
            if !rejoin_stalled {
                return Ok(());
            }
            state.excluded = false;
            info!("Source {} reported again, rejoining the watermark", source_id);
            self.live_sources += 1;
            *self.contribution_counts.entry(new).or_insert(0) += 1;
            return Ok(());
        }

        match prev {
            None => {
                // First report from this source
                self.uninitialized_sources -= 1;
                *self.contribution_counts.entry(new).or_insert(0) += 1;
            }
            Some(prev) if prev != new => {
                self.decrement(prev);
                *self.contribution_counts.entry(new).or_insert(0) += 1;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Excludes every live source that has not reported for `stall_timeout`
    /// as of `now`. Returns the newly excluded source ids.
    pub fn expire_stalled(&mut self, now: u64) -> Vec<usize> {
        let mut expired = Vec::new();
        for (source_id, slot) in self.sources.iter_mut().enumerate() {
            let Some(state) = slot else { continue };
            if state.excluded || now.saturating_sub(state.last_refresh) < self.stall_timeout {
                continue;
            }
            state.excluded = true;
            expired.push((source_id, *state));
        }

        expired
            .into_iter()
            .map(|(source_id, state)| {
                warn!(
                    "Source {} has not reported for {} (last contribution {:?}), excluding it from the watermark",
                    source_id,
                    now.saturating_sub(state.last_refresh),
                    state.contribution
                );
                self.forget(state);
                source_id
            })
            .collect()
    }

    /// Gets the timestamp below which every live source has delivered its events.
    ///
    /// Stalled sources are excluded first. Returns `None` while a live source
    /// has never reported, and `u64::MAX` when no source is live.
    ///
    /// # Examples
    ///
    /// ```
    /// use watermark::WatermarkTracker;
    ///
    /// let mut tracker = WatermarkTracker::new(1_000, true);
    /// assert_eq!(tracker.get_min(0), Some(u64::MAX));
    ///
    /// tracker.register_source(0, 0).unwrap();
    /// assert_eq!(tracker.get_min(0), None);
    ///
    /// tracker.update(0, 42, 0).unwrap();
    /// assert_eq!(tracker.get_min(0), Some(42));
    /// ```
    pub fn get_min(&mut self, now: u64) -> Option<u64> {
        self.expire_stalled(now);

        if self.live_sources == 0 {
            return Some(u64::MAX);
        }
        // If not all live sources have reported yet, return None
        if self.uninitialized_sources > 0 {
            return None;
        }
        self.contribution_counts.keys().next().copied()
    }

    /// Latest contribution of a source, if it is registered and has reported
    pub fn contribution(&self, source_id: usize) -> Option<u64> {
        self.state(source_id).and_then(|state| state.contribution)
    }

    /// Whether a registered source is currently excluded
    pub fn is_excluded(&self, source_id: usize) -> bool {
        self.state(source_id).is_some_and(|state| state.excluded)
    }

    /// Number of registered sources that count toward the minimum
    pub fn live_sources(&self) -> usize {
        self.live_sources
    }

    fn state(&self, source_id: usize) -> Option<&SourceState> {
        self.sources.get(source_id).and_then(Option::as_ref)
    }

    /// Removes a live source's share of the minimum
    fn forget(&mut self, state: SourceState) {
        self.live_sources -= 1;
        match state.contribution {
            Some(contribution) => self.decrement(contribution),
            None => self.uninitialized_sources -= 1,
        }
    }

    fn decrement(&mut self, contribution: u64) {
        if let Some(count) = self.contribution_counts.get_mut(&contribution) {
            *count -= 1;
            if *count == 0 {
                self.contribution_counts.remove(&contribution);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_initialization() {
        let mut tracker = WatermarkTracker::new(1000, true);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 0).unwrap();
        assert_eq!(
            tracker.get_min(0),
            None,
            "All sources should report before get_min returns a value"
        );
    }

    #[test]
    fn test_multiple_sources_initialization() {
        let mut tracker = WatermarkTracker::new(1_000_000, true);
        for source_id in 0..3 {
            tracker.register_source(source_id, 0).unwrap();
        }

        tracker.update(0, 5000, 1).unwrap();
        assert_eq!(tracker.get_min(1), None);

        tracker.update(1, 3000, 1).unwrap();
        assert_eq!(tracker.get_min(1), None);

        tracker.update(2, 4000, 1).unwrap();
        assert_eq!(tracker.get_min(1), Some(3000));
    }

    #[test]
    fn test_non_monotonic_updates_are_clamped() {
        let mut tracker = WatermarkTracker::new(1000, true);
        tracker.register_source(0, 0).unwrap();

        tracker.update(0, 5000, 0).unwrap();
        tracker.update(0, 4000, 1).unwrap();
        assert_eq!(tracker.contribution(0), Some(5000));
        assert_eq!(tracker.get_min(1), Some(5000));
    }

    #[test]
    fn test_unknown_and_duplicate_sources() {
        let mut tracker = WatermarkTracker::new(1000, true);
        tracker.register_source(1, 0).unwrap();

        assert_eq!(tracker.update(0, 5, 0), Err(Error::UnknownSource(0)));
        assert_eq!(tracker.update(7, 5, 0), Err(Error::UnknownSource(7)));
        assert_eq!(tracker.register_source(1, 0), Err(Error::DuplicateSource(1)));

        tracker.remove_source(1).unwrap();
        assert_eq!(tracker.remove_source(1), Err(Error::UnknownSource(1)));
        assert_eq!(tracker.update(1, 5, 0), Err(Error::UnknownSource(1)));
    }

    #[rstest]
    #[case(vec![(0, 5000), (1, 3000), (0, 7000)], Some(3000))]
    #[case(vec![(0, 5000), (1, 6000), (0, 8000), (1, 9000)], Some(8000))]
    #[case(vec![(0, 1000), (1, 2000), (2, 3000), (0, 4000), (1, 5000)], Some(3000))]
    #[case(vec![(0, 1000), (1, 1000), (0, 1000)], Some(1000))]
    fn test_various_update_patterns(
        #[case] updates: Vec<(usize, u64)>,
        #[case] expected_min: Option<u64>,
    ) {
        let num_sources = updates.iter().map(|(source, _)| source + 1).max().unwrap_or(0);
        let mut tracker = WatermarkTracker::new(u64::MAX, true);
        for source_id in 0..num_sources {
            tracker.register_source(source_id, 0).unwrap();
        }

        for (source_id, timestamp) in updates {
            tracker.update(source_id, timestamp, 0).unwrap();
        }

        assert_eq!(tracker.get_min(0), expected_min);
    }

    #[test]
    fn test_removed_source_releases_the_minimum() {
        let mut tracker = WatermarkTracker::new(1000, true);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 0).unwrap();
        tracker.update(0, 500, 0).unwrap();
        tracker.update(1, 100, 0).unwrap();
        assert_eq!(tracker.get_min(0), Some(100));

        tracker.remove_source(1).unwrap();
        assert_eq!(tracker.get_min(0), Some(500));

        tracker.remove_source(0).unwrap();
        assert_eq!(tracker.get_min(0), Some(u64::MAX));
    }

    #[test]
    fn test_removing_uninitialized_source_unblocks() {
        let mut tracker = WatermarkTracker::new(1000, true);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 0).unwrap();
        tracker.update(0, 500, 0).unwrap();
        assert_eq!(tracker.get_min(0), None);

        tracker.remove_source(1).unwrap();
        assert_eq!(tracker.get_min(0), Some(500));
    }

    #[rstest]
    #[case(99, false)]
    #[case(100, true)]
    #[case(101, true)]
    fn test_stall_timeout_boundary(#[case] now: u64, #[case] excluded: bool) {
        let mut tracker = WatermarkTracker::new(100, true);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 0).unwrap();
        tracker.update(0, 10, 0).unwrap();
        tracker.update(1, 20, 0).unwrap();
        tracker.update(1, 30, now).unwrap();

        let expected = if excluded { Some(30) } else { Some(10) };
        assert_eq!(tracker.get_min(now), expected);
        assert_eq!(tracker.is_excluded(0), excluded);
    }

    #[test]
    fn test_uninitialized_source_stalls_out() {
        testing_logger::setup();
        let mut tracker = WatermarkTracker::new(100, true);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 50).unwrap();
        tracker.update(0, 10, 120).unwrap();

        assert_eq!(tracker.get_min(120), None);
        assert_eq!(tracker.get_min(150), Some(10));
        assert!(tracker.is_excluded(1));

        testing_logger::validate(|captured_logs| {
            let warnings: Vec<_> = captured_logs
                .iter()
                .filter(|log| log.level == log::Level::Warn)
                .collect();
            assert_eq!(warnings.len(), 1);
            assert!(warnings[0].body.starts_with("Source 1 has not reported for 100"));
        });
    }

    #[test]
    fn test_stalled_source_rejoins() {
        let mut tracker = WatermarkTracker::new(100, true);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 0).unwrap();
        tracker.update(0, 10, 0).unwrap();
        tracker.update(1, 20, 0).unwrap();

        tracker.update(1, 300, 200).unwrap();
        assert_eq!(tracker.expire_stalled(200), vec![0]);
        assert_eq!(tracker.get_min(200), Some(300));

        // Source 0 comes back with an older timestamp and holds the minimum again
        tracker.update(0, 250, 210).unwrap();
        assert!(!tracker.is_excluded(0));
        assert_eq!(tracker.live_sources(), 2);
        assert_eq!(tracker.get_min(210), Some(250));
    }

    #[test]
    fn test_stalled_source_stays_out_without_rejoin() {
        let mut tracker = WatermarkTracker::new(100, false);
        tracker.register_source(0, 0).unwrap();
        tracker.register_source(1, 0).unwrap();
        tracker.update(0, 10, 0).unwrap();
        tracker.update(1, 20, 0).unwrap();

        tracker.update(1, 300, 200).unwrap();
        assert_eq!(tracker.get_min(200), Some(300));

        tracker.update(0, 250, 210).unwrap();
        assert!(tracker.is_excluded(0));
        assert_eq!(tracker.contribution(0), Some(250));
        assert_eq!(tracker.get_min(210), Some(300));
    }

    #[test]
    fn test_all_sources_stalled() {
        let mut tracker = WatermarkTracker::new(100, true);
        tracker.register_source(0, 0).unwrap();
        tracker.update(0, 10, 0).unwrap();
        assert_eq!(tracker.get_min(1000), Some(u64::MAX));
        assert_eq!(tracker.live_sources(), 0);
    }
}
