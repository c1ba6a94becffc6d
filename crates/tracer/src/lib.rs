//! # Tracer
//!
//! Drains the perf rings of a capture session and hands their events to a
//! sink in global time order.
//!
//! The [`Driver`] waits for readiness across all sources, drains each one
//! through its [`perf_events::SourceReader`], and feeds the batches to the
//! [`EventMerger`], which only releases events once every live source has
//! progressed past them. Released events go to an [`EventSink`].

pub mod config;
pub mod driver;
pub mod merger;
#[cfg(target_os = "linux")]
pub mod session;
pub mod sink;
pub mod task_completion_handler;

pub use config::*;
pub use driver::*;
pub use merger::*;
pub use sink::*;
