//! Acquisition results and response decoding
//!
//! A trigger produces one response: `num_a_scans` A-scan messages laid end
//! to end. [`parse_response`] walks that buffer, validates every sub-frame
//! against the configured [`Geometry`] and tracks the peak amplitude.

use crate::error::{PeakError, Result};
use crate::protocol::header::ScanHeader;
use crate::protocol::mps::Geometry;
use crate::protocol::scan::{validate, ScanMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Probe and specimen geometry used downstream for image reconstruction
///
/// Not interpreted by the driver; copied into every [`AcquisitionResult`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconstructionConfig {
    /// Number of array elements
    pub n_elements: u32,
    /// Element pitch (mm)
    pub element_pitch: f64,
    /// Gap between elements (mm)
    pub inter_element_spacing: f64,
    /// Element width (mm)
    pub element_width: f64,
    /// Sound velocity in the wedge (m/s)
    pub vel_wedge: f64,
    /// Sound velocity in the couplant (m/s)
    pub vel_couplant: f64,
    /// Sound velocity in the material (m/s)
    pub vel_material: f64,
    /// Wedge angle (degrees)
    pub wedge_angle: f64,
    /// Wedge depth (mm)
    pub wedge_depth: f64,
    /// Specimen depth (mm)
    pub specimen_depth: f64,
    /// Couplant depth (mm)
    pub couplant_depth: f64,
}

/// One complete acquisition
///
/// The static fields describe the configuration the scans were taken with;
/// `ascans` and `max_amplitude` change with every cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionResult {
    /// Digitisation rate reported by the last reset (MHz)
    pub digitisation_rate: u32,
    /// Samples per A-scan
    pub ascan_length: usize,
    /// A-scans per response
    pub num_a_scans: usize,
    /// Reconstruction geometry, passed through
    pub reconstruction: ReconstructionConfig,
    /// Decoded A-scans in response order
    pub ascans: Vec<ScanMessage>,
    /// Largest absolute amplitude across all A-scans
    pub max_amplitude: i32,
}

impl AcquisitionResult {
    /// Result carrying only the static fields
    pub fn template(
        geometry: &Geometry,
        digitisation_rate: u32,
        reconstruction: ReconstructionConfig,
    ) -> Self {
        AcquisitionResult {
            digitisation_rate,
            ascan_length: geometry.ascan_length(),
            num_a_scans: geometry.num_a_scans(),
            reconstruction,
            ascans: Vec::new(),
            max_amplitude: 0,
        }
    }

    /// Copy of the static fields with scans attached
    pub fn with_scans(&self, scans: ScanSet) -> Self {
        AcquisitionResult {
            ascans: scans.ascans,
            max_amplitude: scans.max_amplitude,
            ..self.clone()
        }
    }
}

/// A-scans accepted from one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanSet {
    /// Accepted A-scans in response order
    pub ascans: Vec<ScanMessage>,
    /// Largest absolute amplitude across `ascans`
    pub max_amplitude: i32,
}

/// Decode and validate a complete response
///
/// The buffer is walked one sub-frame at a time, advancing by each
/// sub-frame's declared byte count once it has been validated. No partial
/// result is returned.
///
/// # Errors
///
/// - [`PeakError::DofMismatch`], [`PeakError::LengthMismatch`],
///   [`PeakError::UnexpectedMessage`] - First rejected sub-frame
/// - [`PeakError::InvalidSize`] - Sub-frame payload shorter than declared
/// - [`PeakError::WrongScanCount`] - Walk ended with a different number of A-scans
///
/// # Examples
///
/// ```
/// use peak_micropulse::protocol::acquisition::parse_response;
/// use peak_micropulse::protocol::mps::{Geometry, SampleMode};
///
/// let geometry = Geometry::new(SampleMode::EightBit, 4, 1);
/// let response = [0x1A, 12, 0, 0, 1, 0, 1, 0, 128, 228, 138, 148];
/// let scans = parse_response(&response, &geometry)?;
/// assert_eq!(scans.ascans[0].amps, vec![0, 100, 10, 20]);
/// assert_eq!(scans.max_amplitude, 100);
/// # Ok::<(), peak_micropulse::error::PeakError>(())
/// ```
pub fn parse_response(response: &[u8], geometry: &Geometry) -> Result<ScanSet> {
    let subframe_length = geometry.subframe_length();
    let mut ascans = Vec::with_capacity(geometry.num_a_scans());
    let mut max_amplitude = 0;
    let mut offset = 0;

    while offset + subframe_length <= response.len() {
        let subframe = &response[offset..offset + subframe_length];
        let header = ScanHeader::decode(subframe)?;

        if let Err(e) = validate(&header, geometry) {
            error!(
                offset = offset,
                accepted = ascans.len(),
                error = %e,
                "Rejected response sub-frame"
            );
            return Err(e);
        }

        let message = ScanMessage::decode_with_header(header, subframe)?;
        max_amplitude = max_amplitude.max(message.peak_amplitude());
        ascans.push(message);

        offset += header.count as usize;
    }

    debug!(count = ascans.len(), "A-scans received");

    if ascans.len() != geometry.num_a_scans() {
        error!(
            expected = geometry.num_a_scans(),
            actual = ascans.len(),
            "Incorrect number of A-scans returned"
        );
        return Err(PeakError::WrongScanCount {
            expected: geometry.num_a_scans(),
            actual: ascans.len(),
        });
    }

    Ok(ScanSet {
        ascans,
        max_amplitude,
    })
}
