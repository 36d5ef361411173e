//! # camlink-devices: device listing tool
//!
//! Builds a camlink `Context` (local backend plus the `bus` module) and
//! prints the address of every device it can see. Optionally hosts
//! simulated bus devices in the same process so the listing has something
//! to find.

pub mod config;
pub mod listing;
