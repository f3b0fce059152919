//! A-scan message decoding and validation

use crate::error::{PeakError, Result};
use crate::protocol::header::{MessageKind, ScanHeader};
use crate::protocol::mps::{Geometry, SampleMode};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tracing::error;

/// One decoded DOF message: sub-header plus zero-centred samples
///
/// Only [`MessageKind::Ascan`] messages carry samples; the payload of the
/// other kinds is not decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanMessage {
    /// Sub-header
    pub header: ScanHeader,
    /// Signed amplitudes (raw value minus the mode's zero point)
    pub amps: Vec<i32>,
}

impl ScanMessage {
    /// Decode one message from the start of `buf`
    ///
    /// Samples run from byte 8 up to the declared byte count. An A-scan with
    /// a DOF other than 1 or 4 is reported and returned without samples;
    /// [`validate`] then rejects it against the configured geometry.
    ///
    /// # Errors
    ///
    /// - [`PeakError::InvalidSize`] - Buffer shorter than the sub-header or the declared count
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = ScanHeader::decode(buf)?;
        Self::decode_with_header(header, buf)
    }

    /// Decode the payload for an already decoded sub-header
    pub fn decode_with_header(header: ScanHeader, buf: &[u8]) -> Result<Self> {
        if header.kind != MessageKind::Ascan {
            return Ok(ScanMessage {
                header,
                amps: Vec::new(),
            });
        }

        let count = header.count as usize;
        if count < ScanHeader::SIZE || count > buf.len() {
            return Err(PeakError::InvalidSize {
                expected: count.max(ScanHeader::SIZE),
                actual: buf.len(),
            });
        }

        let mode = match SampleMode::from_code(header.dof) {
            Ok(mode) => mode,
            Err(e) => {
                error!(dof = header.dof, error = %e, "A-scan samples not decoded");
                return Ok(ScanMessage {
                    header,
                    amps: Vec::new(),
                });
            }
        };

        let mut payload = &buf[ScanHeader::SIZE..count];
        let zero = mode.zero_point();
        let amps = match mode {
            SampleMode::EightBit => payload.iter().map(|&b| i32::from(b) - zero).collect(),
            SampleMode::SixteenBit => {
                if payload.len() % 2 != 0 {
                    return Err(PeakError::InvalidSize {
                        expected: payload.len() + 1,
                        actual: payload.len(),
                    });
                }
                let mut amps = Vec::with_capacity(payload.len() / 2);
                while payload.has_remaining() {
                    amps.push(i32::from(payload.get_u16_le()) - zero);
                }
                amps
            }
        };

        Ok(ScanMessage { header, amps })
    }

    /// Build an A-scan message from signed samples
    ///
    /// The byte count is derived from the sample count and mode.
    pub fn ascan(test_no: u16, channel: u8, mode: SampleMode, amps: Vec<i32>) -> Self {
        let count = ScanHeader::SIZE + amps.len() * mode.bytes_per_sample();
        ScanMessage {
            header: ScanHeader {
                kind: MessageKind::Ascan,
                count: count as u32,
                test_no,
                dof: mode.code(),
                channel,
            },
            amps,
        }
    }

    /// Encode the message, re-applying the zero-point offset
    ///
    /// Samples are clamped to the raw range of the header's DOF; a DOF this
    /// driver does not decode encodes as header only.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = self.header.encode();
        match SampleMode::from_code(self.header.dof) {
            Ok(SampleMode::EightBit) => {
                for &amp in &self.amps {
                    buf.put_u8((amp + 128).clamp(0, 255) as u8);
                }
            }
            Ok(SampleMode::SixteenBit) => {
                for &amp in &self.amps {
                    buf.put_u16_le((amp + 32768).clamp(0, 65535) as u16);
                }
            }
            Err(_) => {}
        }
        buf
    }

    /// Largest absolute sample value, 0 for an empty message
    pub fn peak_amplitude(&self) -> i32 {
        self.amps.iter().map(|a| a.abs()).max().unwrap_or(0)
    }
}

/// Check a sub-header against the configured geometry
///
/// # Errors
///
/// - [`PeakError::UnexpectedMessage`] - Not an A-scan
/// - [`PeakError::DofMismatch`] - DOF differs from the MPS configuration
/// - [`PeakError::LengthMismatch`] - Byte count differs from the sub-frame length
pub fn validate(header: &ScanHeader, geometry: &Geometry) -> Result<()> {
    if header.kind != MessageKind::Ascan {
        return Err(PeakError::UnexpectedMessage(header.kind));
    }

    let expected_dof = geometry.sample_mode().code();
    if header.dof != expected_dof {
        return Err(PeakError::DofMismatch {
            expected: expected_dof,
            actual: header.dof,
        });
    }

    if header.count as usize != geometry.subframe_length() {
        return Err(PeakError::LengthMismatch {
            expected: geometry.subframe_length(),
            actual: header.count as usize,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dof1_ascan(samples: &[u8], test_no: u16, channel: u8) -> Vec<u8> {
        let count = 8 + samples.len();
        let mut buf = vec![0x1A, count as u8, (count >> 8) as u8, (count >> 16) as u8];
        buf.extend_from_slice(&test_no.to_le_bytes());
        buf.push(1);
        buf.push(channel);
        buf.extend_from_slice(samples);
        buf
    }

    #[test]
    fn test_decode_eight_bit_samples() {
        let buf = dof1_ascan(&[128, 200, 50, 255], 1, 0);
        let msg = ScanMessage::decode(&buf).unwrap();
        assert_eq!(msg.header.count, 12);
        assert_eq!(msg.amps, vec![0, 72, -78, 127]);
    }

    #[test]
    fn test_decode_sixteen_bit_samples() {
        let mut buf = vec![0x1A, 14, 0, 0, 1, 0, 4, 0];
        buf.extend_from_slice(&[0x00, 0x80]); // 32768 -> 0
        buf.extend_from_slice(&[0xE8, 0x80]); // 33000 -> 232
        buf.extend_from_slice(&[0x64, 0x00]); // 100 -> -32668
        let msg = ScanMessage::decode(&buf).unwrap();
        assert_eq!(msg.header.dof, 4);
        assert_eq!(msg.amps, vec![0, 232, -32668]);
    }

    #[test]
    fn test_decode_stops_at_declared_count() {
        let mut buf = dof1_ascan(&[130, 131], 1, 0);
        buf.extend_from_slice(&[0xAA; 16]);
        let msg = ScanMessage::decode(&buf).unwrap();
        assert_eq!(msg.amps, vec![2, 3]);
    }

    #[test]
    fn test_non_ascan_kinds_carry_no_samples() {
        for marker in [0x1C, 0x1D, 0x1E, 0x06] {
            let mut buf = vec![0u8; 16];
            buf[0] = marker;
            let msg = ScanMessage::decode(&buf).unwrap();
            assert_eq!(msg.header.kind, MessageKind::from_byte(marker));
            assert!(msg.amps.is_empty());
        }
    }

    #[test]
    fn test_unsupported_dof_yields_no_samples() {
        let mut buf = dof1_ascan(&[1, 2, 3, 4], 1, 0);
        buf[6] = 2;
        let msg = ScanMessage::decode(&buf).unwrap();
        assert!(msg.amps.is_empty());
    }

    #[test]
    fn test_count_beyond_buffer_rejected() {
        let mut buf = dof1_ascan(&[128; 4], 1, 0);
        buf[1] = 200;
        assert!(matches!(
            ScanMessage::decode(&buf),
            Err(PeakError::InvalidSize { .. })
        ));
    }

    #[test]
    fn test_encode_matches_wire_layout() {
        let msg = ScanMessage::ascan(42, 3, SampleMode::SixteenBit, vec![0, 232, -32668]);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), 14);
        assert_eq!(&encoded[..8], &[0x1A, 14, 0, 0, 42, 0, 4, 3]);
        assert_eq!(&encoded[8..], &[0x00, 0x80, 0xE8, 0x80, 0x64, 0x00]);
        assert_eq!(ScanMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_peak_amplitude_uses_absolute_value() {
        let msg = ScanMessage::ascan(1, 0, SampleMode::EightBit, vec![0, -120, 10, 20]);
        assert_eq!(msg.peak_amplitude(), 120);
    }

    #[test]
    fn test_validate() {
        let geometry = Geometry::new(SampleMode::EightBit, 100, 2);
        let ok = ScanMessage::ascan(1, 0, SampleMode::EightBit, vec![0; 100]);
        assert!(validate(&ok.header, &geometry).is_ok());

        let mut wrong_dof = ok.header;
        wrong_dof.dof = 4;
        assert!(matches!(
            validate(&wrong_dof, &geometry),
            Err(PeakError::DofMismatch {
                expected: 1,
                actual: 4
            })
        ));

        let mut wrong_count = ok.header;
        wrong_count.count = 50;
        assert!(matches!(
            validate(&wrong_count, &geometry),
            Err(PeakError::LengthMismatch {
                expected: 108,
                actual: 50
            })
        ));

        let mut not_ascan = ok.header;
        not_ascan.kind = MessageKind::CouplingFailure;
        assert!(matches!(
            validate(&not_ascan, &geometry),
            Err(PeakError::UnexpectedMessage(MessageKind::CouplingFailure))
        ));
    }
}
