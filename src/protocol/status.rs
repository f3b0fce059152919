//! Reset status frame
//!
//! The instrument answers `RST` with a fixed 32-byte status block. Byte
//! offsets here index from zero; the vendor protocol document indexes from one.

use crate::error::{PeakError, Result};
use serde::{Deserialize, Serialize};

/// Instrument family, from the high nibble of the system type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemFamily {
    /// MicroPulse 5
    MicroPulse5,
    /// MicroPulse LT1
    MicroPulseLt1,
    /// MicroPulse LT2
    MicroPulseLt2,
    /// LTPA
    Ltpa,
    /// MPLT
    Mplt,
    /// MicroPulse 6
    MicroPulse6,
    /// Family code not listed in the protocol document
    Unknown(u8),
}

impl SystemFamily {
    /// Decode bits 4-7 of the system type byte
    pub fn from_system_type(system_type: u8) -> Self {
        match system_type >> 4 {
            0 => SystemFamily::MicroPulse5,
            1 => SystemFamily::MicroPulseLt1,
            2 => SystemFamily::MicroPulseLt2,
            3 => SystemFamily::Ltpa,
            4 => SystemFamily::Mplt,
            5 => SystemFamily::MicroPulse6,
            other => SystemFamily::Unknown(other),
        }
    }
}

/// Decoded reset status block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// System type byte (byte 4)
    pub system_type: u8,
    /// DOF currently in effect (byte 7)
    pub actual_dof: u8,
    /// Default digitisation rate in MHz (byte 8)
    pub default_digitisation_rate: u8,
    /// Digitisation rate in effect in MHz (byte 9)
    pub actual_digitisation_rate: u8,
    /// Default DOF (byte 10)
    pub default_dof: u8,
}

impl DeviceStatus {
    /// Status block size in bytes
    pub const SIZE: usize = 32;

    /// First byte of a successful reset ('#')
    pub const SUCCESS_MARKER: u8 = 0x23;

    /// Decode a status block
    ///
    /// # Errors
    ///
    /// - [`PeakError::InvalidSize`] - Fewer than 32 bytes
    /// - [`PeakError::ResetRejected`] - First byte is not the success marker
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(PeakError::InvalidSize {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        if buf[0] != Self::SUCCESS_MARKER {
            return Err(PeakError::ResetRejected { marker: buf[0] });
        }

        Ok(DeviceStatus {
            system_type: buf[4],
            actual_dof: buf[7],
            default_digitisation_rate: buf[8],
            actual_digitisation_rate: buf[9],
            default_dof: buf[10],
        })
    }

    /// Encode a successful status block
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[0] = Self::SUCCESS_MARKER;
        buf[4] = self.system_type;
        buf[7] = self.actual_dof;
        buf[8] = self.default_digitisation_rate;
        buf[9] = self.actual_digitisation_rate;
        buf[10] = self.default_dof;
        buf
    }

    /// Instrument family
    pub fn family(&self) -> SystemFamily {
        SystemFamily::from_system_type(self.system_type)
    }
}
