//! MicroPulse protocol implementation module
//!
//! Pure codecs for the instrument's command language and binary responses.
//! Nothing in this module performs I/O.

pub mod acquisition;
pub mod command;
pub mod header;
pub mod mps;
pub mod scan;
pub mod status;

// Re-export commonly used types
pub use acquisition::{parse_response, AcquisitionResult, ReconstructionConfig, ScanSet};
pub use command::{encode_command, DeviceCommand, DigitisationRate, TRIGGER_COMMAND};
pub use header::{MessageKind, ScanHeader};
pub use mps::{Geometry, MpsConfig, SampleMode};
pub use scan::{validate, ScanMessage};
pub use status::{DeviceStatus, SystemFamily};
