//! # camlink-probe: clock-sync and streaming probe
//!
//! Connects to one bus device, estimates the clock offset, streams for a
//! fixed interval while counting drops and transit latency, then estimates
//! the offset again and reports the drift.

pub mod config;
pub mod probe;
