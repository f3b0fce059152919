//! Network I/O module for MicroPulse communication
//!
//! Provides the blocking transport, the session driver and the continuous
//! acquisition machinery.

pub mod acquisition;
pub mod client;
pub mod handler;
pub mod latest;

pub use acquisition::{AcquisitionTask, Callback};
pub use client::PeakClient;
pub use handler::{HandlerConfig, PeakHandler};
pub use latest::LatestData;
