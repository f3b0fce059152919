//! Data output format (DOF) sub-header
//!
//! Every message inside a response starts with a fixed 8-byte sub-header.

use crate::error::{PeakError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Kind of message, taken from the first sub-header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// 0x1A - A-scan samples
    Ascan,
    /// 0x1C - normal indications
    NormalIndications,
    /// 0x1D - gain reduced indications
    GainReducedIndications,
    /// 0x1E - LWL coupling failure
    CouplingFailure,
    /// 0x06, or any byte not listed above
    Error,
}

impl MessageKind {
    /// Classify a sub-header marker byte
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x1A => MessageKind::Ascan,
            0x1C => MessageKind::NormalIndications,
            0x1D => MessageKind::GainReducedIndications,
            0x1E => MessageKind::CouplingFailure,
            _ => MessageKind::Error,
        }
    }

    /// Marker byte for this kind
    pub fn to_byte(self) -> u8 {
        match self {
            MessageKind::Ascan => 0x1A,
            MessageKind::NormalIndications => 0x1C,
            MessageKind::GainReducedIndications => 0x1D,
            MessageKind::CouplingFailure => 0x1E,
            MessageKind::Error => 0x06,
        }
    }
}

/// DOF message sub-header (8 bytes fixed size)
///
/// # Structure (multi-byte values little-endian)
/// - Marker: u8 (1 byte)
/// - Byte count: u24 (3 bytes) - whole message including this header
/// - Test number: u16 (2 bytes)
/// - DOF: u8 (1 byte)
/// - Channel: u8 (1 byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHeader {
    /// Message kind
    pub kind: MessageKind,
    /// Declared message length in bytes, header included
    pub count: u32,
    /// Test number the A-scan belongs to
    pub test_no: u16,
    /// DOF code the samples are encoded with
    pub dof: u8,
    /// Receiver channel
    pub channel: u8,
}

impl ScanHeader {
    /// Sub-header size in bytes
    pub const SIZE: usize = 8;

    /// Largest byte count the 24-bit field can carry
    pub const MAX_COUNT: u32 = 0x00FF_FFFF;

    /// Decode a sub-header from the start of a byte slice
    ///
    /// Unknown marker bytes decode as [`MessageKind::Error`]; the remaining
    /// fields are still read so the message can be reported.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(PeakError::InvalidSize {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }

        let mut cursor = std::io::Cursor::new(buf);

        let marker = cursor.get_u8();
        let kind = MessageKind::from_byte(marker);
        let count = cursor.get_uint_le(3) as u32;
        let test_no = cursor.get_u16_le();
        let dof = cursor.get_u8();
        let channel = cursor.get_u8();

        match kind {
            MessageKind::Ascan => {}
            MessageKind::NormalIndications => info!("Normal indications returned"),
            MessageKind::GainReducedIndications => info!("Gain reduced indications returned"),
            MessageKind::CouplingFailure => info!("LWL coupling failure returned"),
            MessageKind::Error if marker == 0x06 => error!("Instrument error message returned"),
            MessageKind::Error => {
                error!(marker = marker, "Unknown DOF sub-header byte")
            }
        }

        Ok(ScanHeader {
            kind,
            count,
            test_no,
            dof,
            channel,
        })
    }

    /// Encode the sub-header
    ///
    /// # Returns
    /// 8-byte vector containing the encoded sub-header
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_u8(self.kind.to_byte());
        buf.put_uint_le(u64::from(self.count & Self::MAX_COUNT), 3);
        buf.put_u16_le(self.test_no);
        buf.put_u8(self.dof);
        buf.put_u8(self.channel);
        buf.to_vec()
    }
}
