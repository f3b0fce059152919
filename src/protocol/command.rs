//! Text commands exchanged with the instrument
//!
//! Outbound commands are plain ASCII lines terminated by CR/LF. The same
//! parser is used by the simulator to dispatch inbound lines.

use crate::error::{PeakError, Result};
use crate::protocol::mps::tokenize;

/// Line terminator the instrument expects after every command
pub const TERMINATOR: &[u8] = b"\r\n";

/// Command requesting one full acquisition (one response per trigger)
pub const TRIGGER_COMMAND: &str = "CALS 1";

/// Encode a command line for the wire
///
/// # Examples
///
/// ```
/// use peak_micropulse::protocol::command::encode_command;
///
/// assert_eq!(encode_command("CALS 1"), b"CALS 1\r\n".to_vec());
/// ```
pub fn encode_command(command: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(command.len() + TERMINATOR.len());
    buf.extend_from_slice(command.as_bytes());
    buf.extend_from_slice(TERMINATOR);
    buf
}

/// Digitisation rate requested with the reset command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitisationRate {
    /// Keep the instrument's default rate (`RST`)
    Default,
    /// 10 MHz
    Mhz10,
    /// 25 MHz
    Mhz25,
    /// 50 MHz
    Mhz50,
    /// 100 MHz
    Mhz100,
}

impl DigitisationRate {
    /// Rate in MHz, `None` for the device default
    pub fn mhz(self) -> Option<u32> {
        match self {
            DigitisationRate::Default => None,
            DigitisationRate::Mhz10 => Some(10),
            DigitisationRate::Mhz25 => Some(25),
            DigitisationRate::Mhz50 => Some(50),
            DigitisationRate::Mhz100 => Some(100),
        }
    }

    /// Reset command requesting this rate
    pub fn reset_command(self) -> String {
        match self.mhz() {
            Some(mhz) => format!("RST {}", mhz),
            None => "RST".to_string(),
        }
    }
}

impl TryFrom<u32> for DigitisationRate {
    type Error = PeakError;

    fn try_from(mhz: u32) -> Result<Self> {
        match mhz {
            0 => Ok(DigitisationRate::Default),
            10 => Ok(DigitisationRate::Mhz10),
            25 => Ok(DigitisationRate::Mhz25),
            50 => Ok(DigitisationRate::Mhz50),
            100 => Ok(DigitisationRate::Mhz100),
            other => Err(PeakError::InvalidDigitisationRate(other)),
        }
    }
}

/// An inbound command line, classified by prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// `RST` or `RST <rate>`
    Reset(Option<u32>),
    /// `GATS`/`GAT <test#> <gate start> <gate end>`
    Gates {
        /// Gate start in machine units
        start: u32,
        /// Gate end in machine units
        end: u32,
    },
    /// `CALS ...`
    Trigger,
    /// Any other configuration line
    Other(String),
}

impl DeviceCommand {
    /// Classify a command line (terminator already stripped)
    ///
    /// A gate line whose numbers do not parse is kept as `Other`.
    pub fn parse(line: &str) -> Self {
        let args = tokenize(line);
        match args.first().copied() {
            Some(keyword) if keyword.starts_with("RST") => {
                DeviceCommand::Reset(args.get(1).and_then(|rate| rate.parse().ok()))
            }
            Some(keyword) if keyword.starts_with("CALS") => DeviceCommand::Trigger,
            Some("GATS") | Some("GAT") => {
                let start = args.get(2).and_then(|v| v.parse().ok());
                let end = args.get(3).and_then(|v| v.parse().ok());
                match (start, end) {
                    (Some(start), Some(end)) => DeviceCommand::Gates { start, end },
                    _ => DeviceCommand::Other(line.to_string()),
                }
            }
            _ => DeviceCommand::Other(line.to_string()),
        }
    }
}
