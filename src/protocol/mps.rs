//! MPS configuration parsing and scan geometry
//!
//! An MPS file is the line-oriented command script the instrument is
//! configured with. Three directives determine how responses are framed:
//!
//! - `DOF <mode>` - data output format (1 = 8-bit, 4 = 16-bit A-scans)
//! - `GATS <test#> <gate start> <gate end>` - A-scan gate, in machine units
//! - `SWP <sweep#> <start test#> - <end test#>` - number of A-scans per sweep
//!
//! Every other line is kept verbatim and forwarded to the device.

use crate::error::{PeakError, Result};
use crate::protocol::header::ScanHeader;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// A-scan sample encoding (data output format)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleMode {
    /// DOF 1: one unsigned byte per sample, zero point 128
    EightBit,
    /// DOF 4: one little-endian `u16` per sample, zero point 32768
    SixteenBit,
}

impl SampleMode {
    /// Map a DOF code to a sample mode
    ///
    /// DOF 2, 3, 5 and 6 exist on the instrument but are not decoded here.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(SampleMode::EightBit),
            4 => Ok(SampleMode::SixteenBit),
            other => Err(PeakError::UnsupportedDof(other)),
        }
    }

    /// DOF code as sent to and returned by the instrument
    pub fn code(self) -> u8 {
        match self {
            SampleMode::EightBit => 1,
            SampleMode::SixteenBit => 4,
        }
    }

    /// Bytes occupied by one sample on the wire
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleMode::EightBit => 1,
            SampleMode::SixteenBit => 2,
        }
    }

    /// Raw value that represents zero amplitude
    pub fn zero_point(self) -> i32 {
        match self {
            SampleMode::EightBit => 128,
            SampleMode::SixteenBit => 32768,
        }
    }
}

/// Wire-level framing derived from an MPS configuration
///
/// Immutable once built; reconfiguring means building a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    sample_mode: SampleMode,
    ascan_length: usize,
    num_a_scans: usize,
    subframe_length: usize,
    packet_length: usize,
}

impl Geometry {
    /// Size of the sub-header that precedes every A-scan
    pub const SUB_HEADER_SIZE: usize = 8;

    /// Build a geometry and derive its sub-frame and packet lengths
    ///
    /// Lengths saturate instead of wrapping; use [`Geometry::try_new`] for
    /// dimensions that come from outside the program.
    ///
    /// # Examples
    ///
    /// ```
    /// use peak_micropulse::protocol::mps::{Geometry, SampleMode};
    ///
    /// let geometry = Geometry::new(SampleMode::EightBit, 775, 49);
    /// assert_eq!(geometry.subframe_length(), 783);
    /// assert_eq!(geometry.packet_length(), 38367);
    /// ```
    pub fn new(sample_mode: SampleMode, ascan_length: usize, num_a_scans: usize) -> Self {
        let subframe_length = ascan_length
            .saturating_mul(sample_mode.bytes_per_sample())
            .saturating_add(Self::SUB_HEADER_SIZE);
        Geometry {
            sample_mode,
            ascan_length,
            num_a_scans,
            subframe_length,
            packet_length: num_a_scans.saturating_mul(subframe_length),
        }
    }

    /// Build a geometry the wire format can actually carry
    ///
    /// # Errors
    ///
    /// - [`PeakError::Configuration`] - A sub-frame would not fit the 24-bit
    ///   length field of its sub-header, or the packet length overflows
    pub fn try_new(
        sample_mode: SampleMode,
        ascan_length: usize,
        num_a_scans: usize,
    ) -> Result<Self> {
        let subframe_length = ascan_length
            .checked_mul(sample_mode.bytes_per_sample())
            .and_then(|bytes| bytes.checked_add(Self::SUB_HEADER_SIZE))
            .filter(|&len| len <= ScanHeader::MAX_COUNT as usize)
            .ok_or_else(|| {
                PeakError::Configuration(format!(
                    "A-scan of {} samples exceeds the largest sub-frame of {} bytes",
                    ascan_length,
                    ScanHeader::MAX_COUNT
                ))
            })?;
        let packet_length = num_a_scans.checked_mul(subframe_length).ok_or_else(|| {
            PeakError::Configuration(format!(
                "{} A-scans of {} bytes overflow the packet length",
                num_a_scans, subframe_length
            ))
        })?;

        Ok(Geometry {
            sample_mode,
            ascan_length,
            num_a_scans,
            subframe_length,
            packet_length,
        })
    }

    /// Sample encoding
    pub fn sample_mode(&self) -> SampleMode {
        self.sample_mode
    }

    /// Samples per A-scan (gate end - gate start)
    pub fn ascan_length(&self) -> usize {
        self.ascan_length
    }

    /// A-scans per response
    pub fn num_a_scans(&self) -> usize {
        self.num_a_scans
    }

    /// Bytes per A-scan sub-frame, sub-header included
    pub fn subframe_length(&self) -> usize {
        self.subframe_length
    }

    /// Bytes in one complete response to a trigger
    pub fn packet_length(&self) -> usize {
        self.packet_length
    }
}

/// A parsed MPS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpsConfig {
    /// Every configuration line, forwarded verbatim at session start
    pub commands: Vec<String>,
    /// Raw DOF code from the `DOF` directive
    pub dof: u8,
    /// Gate start from the `GATS` directive
    pub gate_start: u32,
    /// Gate end from the `GATS` directive
    pub gate_end: u32,
    /// Derived framing
    pub geometry: Geometry,
}

impl MpsConfig {
    /// Read and parse an MPS file
    ///
    /// # Errors
    ///
    /// - [`PeakError::Io`] - The file could not be read
    /// - [`PeakError::Configuration`] - A directive is malformed or missing
    /// - [`PeakError::UnsupportedDof`] - The `DOF` mode is not 1 or 4
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Reading MPS file");
        let text = std::fs::read_to_string(path)?;
        let config = text.parse::<MpsConfig>()?;
        info!(
            path = %path.display(),
            lines = config.commands.len(),
            "MPS file read successfully"
        );
        Ok(config)
    }

    /// Parse an ordered sequence of configuration lines
    ///
    /// Directives are matched on their leading keyword, first match wins.
    /// Geometry is derived once after every line is consumed, so a later
    /// directive overrides an earlier one.
    ///
    /// # Examples
    ///
    /// ```
    /// use peak_micropulse::protocol::mps::{MpsConfig, SampleMode};
    ///
    /// let config = MpsConfig::from_lines(["DOF 4", "GATS 1 0 2000", "SWP 1 256 - 316"])?;
    /// assert_eq!(config.geometry.sample_mode(), SampleMode::SixteenBit);
    /// assert_eq!(config.geometry.ascan_length(), 2000);
    /// assert_eq!(config.geometry.num_a_scans(), 61);
    /// # Ok::<(), peak_micropulse::error::PeakError>(())
    /// ```
    pub fn from_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut commands = Vec::new();
        let mut dof = None;
        let mut gates = None;
        let mut num_a_scans = None;

        for line in lines {
            let line = line.as_ref().trim_end();
            if line.trim().is_empty() {
                continue;
            }
            commands.push(line.to_string());

            if line.starts_with("DOF") {
                debug!(command = line, "Found data output format definition");
                dof = Some(parse_dof(line)?);
            } else if line.starts_with("GATS") {
                debug!(command = line, "Found gate definition");
                gates = Some(parse_gates(line)?);
            } else if line.starts_with("SWP") {
                debug!(command = line, "Found A-scan sweep definition");
                num_a_scans = Some(parse_sweep(line)?);
            }
        }

        let dof = dof.ok_or_else(|| missing("DOF"))?;
        let (gate_start, gate_end) = gates.ok_or_else(|| missing("GATS"))?;
        let num_a_scans = num_a_scans.ok_or_else(|| missing("SWP"))?;

        let sample_mode = SampleMode::from_code(dof)?;
        let ascan_length = (gate_end - gate_start) as usize;
        let geometry = Geometry::try_new(sample_mode, ascan_length, num_a_scans)?;

        info!(
            dof = dof,
            gate_start = gate_start,
            gate_end = gate_end,
            num_a_scans = num_a_scans,
            subframe_length = geometry.subframe_length(),
            packet_length = geometry.packet_length(),
            "Derived scan geometry"
        );

        Ok(MpsConfig {
            commands,
            dof,
            gate_start,
            gate_end,
            geometry,
        })
    }
}

impl FromStr for MpsConfig {
    type Err = PeakError;

    fn from_str(text: &str) -> Result<Self> {
        MpsConfig::from_lines(text.lines())
    }
}

/// Split a configuration line into its space-delimited tokens
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

fn missing(directive: &str) -> PeakError {
    PeakError::Configuration(format!("MPS configuration has no {} directive", directive))
}

fn argument<T: FromStr>(line: &str, args: &[&str], index: usize) -> Result<T> {
    let token = args.get(index).ok_or_else(|| {
        PeakError::Configuration(format!("'{}': missing argument {}", line, index))
    })?;
    token.parse::<T>().map_err(|_| {
        PeakError::Configuration(format!("'{}': invalid argument '{}'", line, token))
    })
}

// DOF <mode> [ascan mode]
fn parse_dof(line: &str) -> Result<u8> {
    let args = tokenize(line);
    argument(line, &args, 1)
}

// GATS <test#> <gate start> <gate end>
fn parse_gates(line: &str) -> Result<(u32, u32)> {
    let args = tokenize(line);
    let start: u32 = argument(line, &args, 2)?;
    let end: u32 = argument(line, &args, 3)?;
    if end < start {
        return Err(PeakError::Configuration(format!(
            "'{}': gate end {} precedes gate start {}",
            line, end, start
        )));
    }
    Ok((start, end))
}

// SWP <sweep#> <start test#> - <end test#>
fn parse_sweep(line: &str) -> Result<usize> {
    let args = tokenize(line);
    let start: usize = argument(line, &args, 2)?;
    let end: usize = argument(line, &args, 4)?;
    if end < start {
        return Err(PeakError::Configuration(format!(
            "'{}': sweep end {} precedes sweep start {}",
            line, end, start
        )));
    }
    (end - start).checked_add(1).ok_or_else(|| {
        PeakError::Configuration(format!("'{}': sweep count overflows", line))
    })
}
