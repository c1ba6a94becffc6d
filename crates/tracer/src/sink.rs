use log::{debug, warn};
use perf_events::{
    CallchainSample, CommEvent, Event, ForkExitEvent, ForkExitKind, LostEvent, MmapEvent,
    StackSample, TracepointSample,
};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// A sample of either configured kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Stack(StackSample),
    Callchain(CallchainSample),
}

impl Sample {
    pub fn pid(&self) -> u32 {
        match self {
            Sample::Stack(s) => s.pid,
            Sample::Callchain(s) => s.pid,
        }
    }

    pub fn time(&self) -> u64 {
        match self {
            Sample::Stack(s) => s.time,
            Sample::Callchain(s) => s.time,
        }
    }
}

/// Consumer of the merged, time-ordered event stream
pub trait EventSink {
    fn on_sample(&mut self, sample: Sample);
    fn on_tracepoint(&mut self, tracepoint: TracepointSample);
    fn on_mmap(&mut self, mmap: MmapEvent);
    fn on_lost(&mut self, lost: LostEvent);
    fn on_comm(&mut self, comm: CommEvent);
    fn on_fork_exit(&mut self, event: ForkExitEvent);

    /// No events follow
    fn on_session_end(&mut self);
}

/// Routes one event to the matching sink callback
pub fn dispatch<S: EventSink + ?Sized>(sink: &mut S, event: Event) {
    match event {
        Event::StackSample(s) => sink.on_sample(Sample::Stack(s)),
        Event::CallchainSample(s) => sink.on_sample(Sample::Callchain(s)),
        Event::Tracepoint(t) => sink.on_tracepoint(t),
        Event::Mmap(m) => sink.on_mmap(m),
        Event::Lost(l) => sink.on_lost(l),
        Event::Comm(c) => sink.on_comm(c),
        Event::ForkExit(f) => sink.on_fork_exit(f),
    }
}

/// What travels from the driver thread to the consumer task
#[derive(Debug)]
pub enum SinkMessage {
    Event(Event),
    SessionEnd,
}

/// Hands events to a bounded channel without ever blocking the caller.
///
/// When the consumer falls behind the channel fills up and further events
/// are dropped and counted; the drain loop keeps emptying kernel buffers.
pub struct ChannelSink {
    sender: mpsc::Sender<SinkMessage>,
    dropped: u64,
    session_end_dropped: bool,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<SinkMessage>) -> Self {
        ChannelSink {
            sender,
            dropped: 0,
            session_end_dropped: false,
        }
    }

    /// Events dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// The session-end signal could not be queued; the consumer only sees
    /// the channel close
    pub fn session_end_dropped(&self) -> bool {
        self.session_end_dropped
    }

    fn send(&mut self, message: SinkMessage) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    warn!("Sink queue is full, dropping events");
                }
                self.dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                if self.dropped == 0 {
                    warn!("Sink consumer is gone, dropping events");
                }
                self.dropped += 1;
            }
        }
    }
}

impl EventSink for ChannelSink {
    fn on_sample(&mut self, sample: Sample) {
        let event = match sample {
            Sample::Stack(s) => Event::StackSample(s),
            Sample::Callchain(s) => Event::CallchainSample(s),
        };
        self.send(SinkMessage::Event(event));
    }

    fn on_tracepoint(&mut self, tracepoint: TracepointSample) {
        self.send(SinkMessage::Event(Event::Tracepoint(tracepoint)));
    }

    fn on_mmap(&mut self, mmap: MmapEvent) {
        self.send(SinkMessage::Event(Event::Mmap(mmap)));
    }

    fn on_lost(&mut self, lost: LostEvent) {
        self.send(SinkMessage::Event(Event::Lost(lost)));
    }

    fn on_comm(&mut self, comm: CommEvent) {
        self.send(SinkMessage::Event(Event::Comm(comm)));
    }

    fn on_fork_exit(&mut self, event: ForkExitEvent) {
        self.send(SinkMessage::Event(Event::ForkExit(event)));
    }

    fn on_session_end(&mut self) {
        if self.dropped > 0 {
            warn!("Sink dropped {} events this session", self.dropped);
        }
        if let Err(e) = self.sender.try_send(SinkMessage::SessionEnd) {
            let reason = match e {
                TrySendError::Full(_) => "queue is full",
                TrySendError::Closed(_) => "consumer is gone",
            };
            warn!("Sink could not deliver the session end: {}", reason);
            self.session_end_dropped = true;
        }
    }
}

/// Aggregate view of a session's event stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SummarySink {
    pub stack_samples: u64,
    pub callchain_samples: u64,
    pub tracepoints: u64,
    pub mmaps: u64,
    pub comms: u64,
    pub execs: u64,
    pub forks: u64,
    pub exits: u64,
    pub lost_records: u64,
    pub lost_total: u64,
    pub samples_by_pid: HashMap<u32, u64>,
    pub comm_by_pid: HashMap<u32, String>,
    pub first_time: Option<u64>,
    pub last_time: Option<u64>,

    /// Events that arrived with a timestamp below the previous one
    pub out_of_order: u64,

    pub session_ended: bool,
}

impl SummarySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total events seen
    pub fn events(&self) -> u64 {
        self.stack_samples
            + self.callchain_samples
            + self.tracepoints
            + self.mmaps
            + self.comms
            + self.forks
            + self.exits
            + self.lost_records
    }

    /// Processes with the most samples, busiest first
    pub fn top_processes(&self, n: usize) -> Vec<(u32, u64)> {
        let mut pids: Vec<(u32, u64)> = self
            .samples_by_pid
            .iter()
            .map(|(&pid, &count)| (pid, count))
            .collect();
        pids.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pids.truncate(n);
        pids
    }

    fn observe(&mut self, time: u64) {
        if self.last_time.is_some_and(|last| time < last) {
            self.out_of_order += 1;
        } else {
            self.last_time = Some(time);
        }
        self.first_time.get_or_insert(time);
    }
}

impl EventSink for SummarySink {
    fn on_sample(&mut self, sample: Sample) {
        self.observe(sample.time());
        *self.samples_by_pid.entry(sample.pid()).or_insert(0) += 1;
        match sample {
            Sample::Stack(_) => self.stack_samples += 1,
            Sample::Callchain(_) => self.callchain_samples += 1,
        }
    }

    fn on_tracepoint(&mut self, tracepoint: TracepointSample) {
        self.observe(tracepoint.time);
        self.tracepoints += 1;
    }

    fn on_mmap(&mut self, mmap: MmapEvent) {
        self.observe(mmap.time);
        self.mmaps += 1;
    }

    fn on_lost(&mut self, lost: LostEvent) {
        self.observe(lost.time);
        self.lost_records += 1;
        self.lost_total += lost.lost;
    }

    fn on_comm(&mut self, comm: CommEvent) {
        self.observe(comm.time);
        self.comms += 1;
        if comm.exec {
            self.execs += 1;
        }
        self.comm_by_pid.insert(comm.pid, comm.comm);
    }

    fn on_fork_exit(&mut self, event: ForkExitEvent) {
        self.observe(event.time);
        match event.kind {
            ForkExitKind::Fork => self.forks += 1,
            ForkExitKind::Exit => self.exits += 1,
        }
    }

    fn on_session_end(&mut self) {
        self.session_ended = true;
    }
}

impl fmt::Display for SummarySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(
            f,
            "events={} samples(stack={} callchain={}) tracepoints={} mmaps={}",
            self.events(),
            self.stack_samples,
            self.callchain_samples,
            self.tracepoints,
            self.mmaps
        )?;
        writeln!(
            f,
            "comms={} execs={} forks={} exits={} lost_records={} lost_total={}",
            self.comms, self.execs, self.forks, self.exits, self.lost_records, self.lost_total
        )?;
        if let (Some(first), Some(last)) = (self.first_time, self.last_time) {
            writeln!(
                f,
                "span_ns={} out_of_order={}",
                last.saturating_sub(first),
                self.out_of_order
            )?;
        }
        for (pid, count) in self.top_processes(10) {
            let comm = self
                .comm_by_pid
                .get(&pid)
                .map(String::as_str)
                .unwrap_or("<unknown>");
            writeln!(f, "  PID={:<7} COMM={:<16} samples={}", pid, comm, count)?;
        }
        write!(f, "{}", "-".repeat(60))
    }
}

/// Consumer task that folds the channel's events into a [`SummarySink`]
pub struct SummaryTask {
    sender: mpsc::Sender<SinkMessage>,
    join_handle: JoinHandle<SummarySink>,
}

impl SummaryTask {
    /// Create a new SummaryTask with a specified channel buffer size
    pub fn new(buffer_size: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SinkMessage>(buffer_size);

        let join_handle = tokio::spawn(async move {
            let mut summary = SummarySink::new();
            while let Some(message) = receiver.recv().await {
                match message {
                    SinkMessage::Event(event) => dispatch(&mut summary, event),
                    SinkMessage::SessionEnd => {
                        summary.on_session_end();
                        break;
                    }
                }
            }
            debug!("Summary task saw {} events", summary.events());
            summary
        });

        Self {
            sender,
            join_handle,
        }
    }

    /// A sink feeding this task
    pub fn sink(&self) -> ChannelSink {
        ChannelSink::new(self.sender.clone())
    }

    /// Waits for the session to end and returns the summary
    pub async fn finish(self) -> anyhow::Result<SummarySink> {
        // Drop our sender so the task also ends when every sink is gone
        drop(self.sender);
        match self.join_handle.await {
            Ok(summary) => Ok(summary),
            Err(e) => Err(anyhow::anyhow!("SummaryTask panicked: {:?}", e)),
        }
    }
}
