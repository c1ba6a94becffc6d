//! # Watermark
//!
//! Tracks how far each event source has progressed in time and derives the
//! timestamp below which every live source is known to have delivered all of
//! its events.
//!
//! A merger that holds back events until they fall under this watermark can
//! emit them in global time order even though sources are drained in
//! arbitrary order. Sources that stop reporting are excluded after a stall
//! timeout so they cannot hold the watermark back forever.
//!
//! The primary interface is through the [`WatermarkTracker`] struct.

pub mod tracker;

pub use tracker::*;
