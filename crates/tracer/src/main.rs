use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::{error, info};
use perf_events::SampleKind;
use tokio_util::sync::CancellationToken;

use tracer::session::{self, SessionOptions};
use tracer::task_completion_handler::task_completion_handler;
use tracer::{Driver, DriverStats, FdPoller, MonotonicClock, SummaryTask, TracerConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Copy user registers and stack for offline unwinding
    Stack,
    /// Let the kernel walk the call chain
    Callchain,
}

impl From<Mode> for SampleKind {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Stack => SampleKind::Stack,
            Mode::Callchain => SampleKind::Callchain,
        }
    }
}

/// Linux sampling profiler core: drains perf rings into one time-ordered stream
#[derive(Debug, Parser)]
struct Command {
    /// Verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Track duration in seconds (0 = until Ctrl-C)
    #[arg(short, long, default_value = "0")]
    duration: u64,

    /// Sample one thread instead of every CPU
    #[arg(long)]
    pid: Option<u32>,

    /// Number of CPUs to sample (default: all)
    #[arg(long)]
    cpus: Option<u32>,

    /// What each sample carries
    #[arg(long, value_enum, default_value = "callchain")]
    mode: Mode,

    /// Samples per second per source
    #[arg(long, default_value = "99")]
    frequency: u64,

    /// Data pages per ring buffer (power of two)
    #[arg(long, default_value = "64")]
    buffer_pages: u32,

    /// Longest wait for ring readiness, in milliseconds
    #[arg(long, default_value = "10")]
    poll_timeout_ms: u64,

    /// Time without progress before a source stops holding back output, in milliseconds
    #[arg(long, default_value = "1000")]
    stall_timeout_ms: u64,

    /// How far behind the clock an idle source is assumed to be, in milliseconds
    #[arg(long, default_value = "5")]
    idle_slack_ms: u64,

    /// Records read from one ring per round
    #[arg(long, default_value = "4096")]
    batch_cap: usize,
}

impl Command {
    fn tracer_config(&self) -> TracerConfig {
        TracerConfig {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
            idle_slack: Duration::from_millis(self.idle_slack_ms),
            batch_cap: self.batch_cap,
            ..TracerConfig::default()
        }
    }

    fn session_options(&self, config: &TracerConfig) -> SessionOptions {
        SessionOptions {
            pid: self.pid,
            cpus: self.cpus,
            mode: self.mode.into(),
            frequency: self.frequency,
            buffer_pages: self.buffer_pages,
            batch_cap: config.batch_cap,
        }
    }
}

fn print_driver_stats(stats: &DriverStats, sink_dropped: u64) {
    println!(
        "rounds={} emitted={} lost_records={} lost_total={} late_events={} sink_dropped={}",
        stats.rounds,
        stats.events_emitted,
        stats.merger.lost_records,
        stats.merger.lost_total,
        stats.merger.late_events,
        sink_dropped
    );
    for (source_id, source) in &stats.sources {
        println!(
            "  SOURCE={:<4} records={:<10} decoded={:<10} unknown={:<6} malformed={:<6} lost={}",
            source_id,
            source.records_read,
            source.events_decoded,
            source.unknown_skipped,
            source.decode_errors,
            source.lost_total
        );
    }
    if !stats.failed_sources.is_empty() {
        println!("  failed sources: {:?}", stats.failed_sources);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Command::parse();

    let default_level = if opts.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let config = opts.tracer_config();
    config.validate()?;
    let sources = session::open_sources(&opts.session_options(&config))?;

    let token = CancellationToken::new();

    let signal_token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl-C, stopping"),
                    Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
                }
                signal_token.cancel();
            }
            _ = signal_token.cancelled() => {}
        }
    });

    if opts.duration > 0 {
        let duration_token = token.clone();
        let duration = Duration::from_secs(opts.duration);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    info!("Duration of {:?} elapsed, stopping", duration);
                    duration_token.cancel();
                }
                _ = duration_token.cancelled() => {}
            }
        });
    }

    let summary_task = SummaryTask::new(config.sink_queue);
    let mut sink = summary_task.sink();
    let mut driver = Driver::new(config, sources, FdPoller::new(), MonotonicClock)?;

    println!("Successfully started! Sampling until Ctrl-C...");

    // The drain loop blocks in poll(2), so it gets its own thread
    let driver_token = token.clone();
    let driver_task = async move {
        let output = tokio::task::spawn_blocking(move || -> Result<(DriverStats, u64)> {
            let stats = driver.run(&mut sink, driver_token)?;
            Ok((stats, sink.dropped()))
        })
        .await??;
        Ok::<_, anyhow::Error>(output)
    };
    let driver_output = task_completion_handler(driver_task, token.clone(), "driver").await;

    let summary = summary_task.finish().await?;
    println!("{}", summary);
    if let Some((stats, sink_dropped)) = driver_output {
        print_driver_stats(&stats, sink_dropped);
    }

    Ok(())
}
