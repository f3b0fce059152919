//! Error types for MicroPulse driver operations
//!
//! This module defines all error types that can occur while configuring,
//! talking to, or decoding responses from a MicroPulse / LTPA instrument.

use crate::protocol::header::MessageKind;
use thiserror::Error;

/// MicroPulse driver error types
///
/// All operations in this library return `Result<T, PeakError>` to provide
/// explicit error handling. Variants fall into four families:
///
/// - configuration errors (`Configuration`, `UnsupportedDof`, `InvalidDigitisationRate`)
/// - link errors (`Io`, `NotConnected`)
/// - protocol errors, local to one acquisition cycle (`DofMismatch`,
///   `LengthMismatch`, `UnexpectedMessage`, `WrongScanCount`, `InvalidSize`)
/// - session errors (`ResetRejected`, `ResetExhausted`)
#[derive(Error, Debug)]
pub enum PeakError {
    /// Invalid or incomplete MPS configuration
    ///
    /// This error occurs when:
    /// - A `DOF`, `GATS` or `SWP` directive is missing tokens or has non-numeric arguments
    /// - A gate ends before it starts, or a sweep ends before it starts
    /// - The MPS file does not define one of the required directives
    /// - No geometry has been loaded when an acquisition is requested
    ///
    /// # Example
    /// ```no_run
    /// # use peak_micropulse::error::PeakError;
    /// let err = PeakError::Configuration("missing GATS directive".to_string());
    /// ```
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Data output format (DOF) not implemented by this driver
    ///
    /// Only DOF 1 (8-bit) and DOF 4 (16-bit) A-scans are decoded. DOF 2, 3,
    /// 5 and 6 are rejected rather than guessed.
    #[error("Unsupported data output format (DOF): {0}")]
    UnsupportedDof(u8),

    /// Requested digitisation rate is not one the device accepts
    ///
    /// Valid requests are 0 (device default), 10, 25, 50 and 100 MHz.
    #[error("Invalid digitisation rate: {0} MHz (expected 0, 10, 25, 50 or 100)")]
    InvalidDigitisationRate(u32),

    /// I/O error occurred during network communication
    ///
    /// This error wraps standard library I/O errors and occurs when:
    /// - TCP connection failed or was refused
    /// - Connection lost during transmission (broken pipe)
    /// - A read timeout elapsed before the full response arrived
    /// - Socket was closed by the instrument
    ///
    /// # Example
    /// ```no_run
    /// # use peak_micropulse::error::PeakError;
    /// # use std::io;
    /// let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "Connection refused");
    /// let err = PeakError::Io(io_err);
    /// ```
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer too short for the structure being decoded
    #[error("Invalid message size: expected {expected}, got {actual}")]
    InvalidSize {
        /// Expected size in bytes
        expected: usize,
        /// Actual size in bytes available
        actual: usize,
    },

    /// Returned A-scan uses a different DOF than the MPS configuration
    ///
    /// The instrument and the driver disagree about sample width, so none of
    /// the samples in the response can be trusted.
    #[error("Returned DOF [{actual}] does not match MPS file [{expected}]")]
    DofMismatch {
        /// DOF code from the MPS configuration
        expected: u8,
        /// DOF code found in the sub-header
        actual: u8,
    },

    /// Returned A-scan byte count differs from the configured sub-frame length
    #[error("Returned A-scan length [{actual}] does not match MPS file [{expected}]")]
    LengthMismatch {
        /// Sub-frame length derived from the MPS configuration
        expected: usize,
        /// Byte count declared by the sub-header
        actual: usize,
    },

    /// A message other than an A-scan arrived where one was expected
    #[error("Returned data message is not an A-scan: {0:?}")]
    UnexpectedMessage(MessageKind),

    /// Response held a different number of A-scans than the sweep defines
    #[error("Incorrect number of A-scans returned: expected {expected}, got {actual}")]
    WrongScanCount {
        /// A-scan count derived from the `SWP` directive
        expected: usize,
        /// A-scans accepted from the response
        actual: usize,
    },

    /// Reset status frame did not carry the success marker
    #[error("Reset failed: status marker {marker:#04x}")]
    ResetRejected {
        /// First byte of the status frame
        marker: u8,
    },

    /// Every reset attempt failed; the link cannot be trusted
    ///
    /// The connection is closed when this is returned. Framing on an
    /// un-reset link is unverified, so the session must not continue.
    #[error("Unable to reset instrument after {attempts} attempts")]
    ResetExhausted {
        /// Number of reset attempts made
        attempts: usize,
    },

    /// Operation requires an open connection
    #[error("Not connected to instrument")]
    NotConnected,

    /// Synchronous request attempted while asynchronous acquisition owns the link
    #[error("Asynchronous acquisition is active")]
    AcquisitionActive,

    /// The acquisition thread could not be started or did not shut down cleanly
    #[error("Acquisition thread error: {0}")]
    AcquisitionThread(String),
}

impl PeakError {
    /// Whether this error is local to one acquisition cycle
    ///
    /// Protocol errors abort the current cycle only; the session stays usable.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            PeakError::DofMismatch { .. }
                | PeakError::LengthMismatch { .. }
                | PeakError::UnexpectedMessage(_)
                | PeakError::WrongScanCount { .. }
                | PeakError::InvalidSize { .. }
        )
    }

    /// Whether this error leaves the session unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PeakError::ResetExhausted { .. }
                | PeakError::Configuration(_)
                | PeakError::UnsupportedDof(_)
                | PeakError::InvalidDigitisationRate(_)
        )
    }
}

/// Result type alias for MicroPulse driver operations
pub type Result<T> = std::result::Result<T, PeakError>;
