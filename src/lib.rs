//! Peak NDT MicroPulse / LTPA driver in Rust
//!
//! This library drives Peak NDT MicroPulse and LTPA ultrasonic phased-array
//! instruments over their binary TCP interface: it loads MPS configuration
//! files, resets and configures the instrument, triggers acquisitions and
//! decodes the A-scan responses.
//!
//! # Features
//!
//! - **MPS configuration** - Geometry derived from `DOF`, `GATS` and `SWP` directives
//! - **Strict framing** - Every sub-frame validated against the configured geometry
//! - **Synchronous and continuous acquisition** - Blocking requests, or a
//!   background loop publishing the latest result
//! - **Hardware simulator** - A protocol-accurate peer for tests and demos
//!
//! # Quick Start
//!
//! ## Single acquisition
//!
//! ```no_run
//! use peak_micropulse::io::{HandlerConfig, PeakHandler};
//!
//! let mut handler = PeakHandler::new(HandlerConfig::new("10.1.1.2:1067").with_digitisation_rate(10));
//! handler.read_mps_file("mps/roller_probe.mps")?;
//! handler.connect()?;
//! handler.send_mps_configuration()?;
//!
//! let result = handler.send_data_request()?;
//! println!("{} A-scans, peak amplitude {}", result.ascans.len(), result.max_amplitude);
//! # Ok::<(), peak_micropulse::PeakError>(())
//! ```
//!
//! ## Continuous acquisition
//!
//! ```no_run
//! use peak_micropulse::io::{HandlerConfig, PeakHandler};
//! use peak_micropulse::protocol::AcquisitionResult;
//!
//! let mut handler = PeakHandler::new(HandlerConfig::new("10.1.1.2:1067"));
//! handler.read_mps_file("mps/roller_probe.mps")?;
//! handler.connect()?;
//! handler.send_mps_configuration()?;
//!
//! handler.start_async_acquisition_with(|ok| {
//!     if !ok {
//!         eprintln!("acquisition cycle rejected");
//!     }
//! })?;
//!
//! let mut latest = AcquisitionResult::default();
//! for _ in 0..100 {
//!     if handler.get_latest_data(&mut latest) {
//!         println!("peak amplitude {}", latest.max_amplitude);
//!     }
//!     std::thread::sleep(std::time::Duration::from_millis(10));
//! }
//! handler.stop_async_acquisition()?;
//! # Ok::<(), peak_micropulse::PeakError>(())
//! ```
//!
//! ## Without hardware
//!
//! ```no_run
//! use peak_micropulse::io::{HandlerConfig, PeakHandler};
//! use peak_micropulse::protocol::{Geometry, SampleMode};
//! use peak_micropulse::simulator::{PeakSimulator, SimulatorConfig};
//! use std::time::Duration;
//!
//! let simulator = PeakSimulator::start(SimulatorConfig::default())?;
//!
//! let config = HandlerConfig::new(simulator.local_addr().to_string())
//!     .with_reset_settle(Duration::ZERO);
//! let mut handler = PeakHandler::new(config);
//! handler.set_geometry(Geometry::new(SampleMode::EightBit, 100, 5));
//! handler.connect()?;
//!
//! let result = handler.send_data_request()?;
//! assert_eq!(result.ascans.len(), 5);
//! # Ok::<(), peak_micropulse::PeakError>(())
//! ```
//!
//! # Architecture
//!
//! ## Module Structure
//!
//! - **`protocol`** - Pure codecs, no I/O
//!   - `mps` - MPS parsing and geometry derivation
//!   - `command` - Outbound command lines and inbound command classification
//!   - `header` / `scan` - 8-byte sub-header and A-scan messages
//!   - `status` - 32-byte reset status block
//!   - `acquisition` - Response walk, validation and result records
//!
//! - **`io`** - Network layer
//!   - `PeakClient` - Blocking TCP transport
//!   - `PeakHandler` - Session driver
//!   - `AcquisitionTask` - Continuous acquisition thread
//!   - `LatestData` - Single-slot result store
//!
//! - **`simulator`** - `PeakSimulator` hardware peer
//!
//! - **`error`** - `PeakError` and `Result<T>`
//!
//! # Error Handling
//!
//! All operations return `Result<T, PeakError>`. Protocol errors
//! ([`PeakError::is_protocol`]) reject one acquisition and leave the session
//! usable; fatal errors ([`PeakError::is_fatal`]) do not.
//!
//! ```no_run
//! use peak_micropulse::io::{HandlerConfig, PeakHandler};
//! use peak_micropulse::PeakError;
//!
//! let mut handler = PeakHandler::new(HandlerConfig::default());
//! match handler.send_data_request() {
//!     Ok(result) => println!("peak {}", result.max_amplitude),
//!     Err(e) if e.is_protocol() => eprintln!("rejected: {}", e),
//!     Err(PeakError::Io(e)) => eprintln!("link error: {}", e),
//!     Err(e) => eprintln!("session error: {}", e),
//! }
//! ```
//!
//! # Logging
//!
//! The library reports through [`tracing`]. Install a subscriber such as
//! `tracing-subscriber` to see it.

pub mod error;
pub mod io;
pub mod protocol;
pub mod simulator;

// Re-export commonly used types
pub use error::{PeakError, Result};
