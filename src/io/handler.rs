//! Instrument session driver
//!
//! [`PeakHandler`] owns everything a session needs: the MPS configuration
//! and the geometry derived from it, the connection, the reset handshake,
//! synchronous data requests and the asynchronous acquisition loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{PeakError, Result};
use crate::io::acquisition::AcquisitionTask;
use crate::io::client::PeakClient;
use crate::io::latest::LatestData;
use crate::protocol::acquisition::{parse_response, AcquisitionResult, ReconstructionConfig};
use crate::protocol::command::{DeviceCommand, DigitisationRate, TRIGGER_COMMAND};
use crate::protocol::mps::{Geometry, MpsConfig};
use crate::protocol::status::DeviceStatus;

/// Session configuration
///
/// # Examples
///
/// ```
/// use peak_micropulse::io::HandlerConfig;
/// use std::time::Duration;
///
/// let config = HandlerConfig::new("127.0.0.1:1067")
///     .with_digitisation_rate(50)
///     .with_reset_settle(Duration::ZERO);
/// assert_eq!(config.reset_retries, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Instrument address
    pub addr: String,
    /// Digitisation rate requested on connect (MHz, 0 = device default)
    pub digitisation_rate: u32,
    /// Pause between sending a reset and reading its status block
    pub reset_settle: Duration,
    /// Reset retries after the first attempt
    pub reset_retries: usize,
    /// Read timeout for synchronous receives (None blocks forever)
    pub read_timeout: Option<Duration>,
    /// Kernel receive buffer size (SO_RCVBUF), left untouched when None
    pub recv_buffer_size: Option<usize>,
    /// Pause after a link error before the acquisition loop triggers again
    pub link_error_backoff: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            addr: "10.1.1.2:1067".to_string(),
            digitisation_rate: 0,
            reset_settle: Duration::from_secs(10),
            reset_retries: 2,
            read_timeout: None,
            recv_buffer_size: None,
            link_error_backoff: Duration::from_millis(100),
        }
    }
}

impl HandlerConfig {
    /// Default configuration for the instrument at `addr`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Request a digitisation rate on connect
    pub fn with_digitisation_rate(mut self, mhz: u32) -> Self {
        self.digitisation_rate = mhz;
        self
    }

    /// Set the reset settle delay
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    /// Set the number of reset retries
    pub fn with_reset_retries(mut self, retries: usize) -> Self {
        self.reset_retries = retries;
        self
    }

    /// Set a read timeout for synchronous receives
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the kernel receive buffer size
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set the pause after a link error in the acquisition loop
    pub fn with_link_error_backoff(mut self, backoff: Duration) -> Self {
        self.link_error_backoff = backoff;
        self
    }
}

/// MicroPulse / LTPA session
///
/// # Examples
///
/// ```no_run
/// use peak_micropulse::io::{HandlerConfig, PeakHandler};
/// use peak_micropulse::protocol::AcquisitionResult;
///
/// let mut handler = PeakHandler::new(HandlerConfig::new("10.1.1.2:1067"));
/// handler.read_mps_file("mps/roller_probe.mps")?;
/// handler.connect()?;
/// handler.send_mps_configuration()?;
///
/// let result = handler.send_data_request()?;
/// println!("peak amplitude {}", result.max_amplitude);
///
/// handler.start_async_acquisition()?;
/// let mut latest = AcquisitionResult::default();
/// if handler.get_latest_data(&mut latest) {
///     println!("{} A-scans", latest.ascans.len());
/// }
/// handler.stop_async_acquisition()?;
/// # Ok::<(), peak_micropulse::error::PeakError>(())
/// ```
pub struct PeakHandler {
    config: HandlerConfig,
    commands: Vec<String>,
    geometry: Option<Geometry>,
    reconstruction: ReconstructionConfig,
    device_status: Option<DeviceStatus>,
    digitisation_rate: u32,
    client: Option<PeakClient>,
    acquisition: Option<AcquisitionTask>,
    latest: Arc<LatestData>,
}

impl PeakHandler {
    /// Create an unconnected session
    pub fn new(config: HandlerConfig) -> Self {
        PeakHandler {
            config,
            commands: Vec::new(),
            geometry: None,
            reconstruction: ReconstructionConfig::default(),
            device_status: None,
            digitisation_rate: 0,
            client: None,
            acquisition: None,
            latest: LatestData::new(),
        }
    }

    /// Session configuration
    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Read an MPS file and derive the geometry from it
    ///
    /// # Errors
    ///
    /// - [`PeakError::Io`] - The file could not be read
    /// - [`PeakError::Configuration`] / [`PeakError::UnsupportedDof`] - The
    ///   file does not describe a usable geometry. The previous
    ///   configuration is kept.
    pub fn read_mps_file<P: AsRef<Path>>(&mut self, path: P) -> Result<Geometry> {
        let mps = MpsConfig::from_file(path)?;
        Ok(self.load_mps(mps))
    }

    /// Adopt an already parsed MPS configuration
    pub fn load_mps(&mut self, mps: MpsConfig) -> Geometry {
        self.commands = mps.commands;
        self.geometry = Some(mps.geometry);
        mps.geometry
    }

    /// Use an explicit geometry without an MPS file
    pub fn set_geometry(&mut self, geometry: Geometry) {
        self.geometry = Some(geometry);
    }

    /// Current geometry, if one has been loaded
    pub fn geometry(&self) -> Option<Geometry> {
        self.geometry
    }

    /// Configuration lines forwarded by [`send_mps_configuration`](Self::send_mps_configuration)
    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Set the reconstruction geometry copied into every result
    pub fn set_reconstruction_configuration(&mut self, reconstruction: ReconstructionConfig) {
        self.reconstruction = reconstruction;
    }

    /// Reconstruction geometry
    pub fn reconstruction_configuration(&self) -> &ReconstructionConfig {
        &self.reconstruction
    }

    /// Status block from the last successful reset
    pub fn device_status(&self) -> Option<&DeviceStatus> {
        self.device_status.as_ref()
    }

    /// Digitisation rate reported by the last successful reset (MHz)
    pub fn digitisation_rate(&self) -> u32 {
        self.digitisation_rate
    }

    /// Whether a connection is open, owned by either path
    pub fn is_connected(&self) -> bool {
        self.client.is_some() || self.acquisition.is_some()
    }

    /// Whether asynchronous acquisition is running
    pub fn is_acquiring(&self) -> bool {
        self.acquisition.is_some()
    }

    /// Connect and reset the instrument at the configured rate
    ///
    /// # Errors
    ///
    /// - [`PeakError::Io`] - Connection failed
    /// - [`PeakError::ResetExhausted`] - The instrument never acknowledged a reset
    /// - [`PeakError::InvalidDigitisationRate`] - Configured rate is not accepted
    pub fn connect(&mut self) -> Result<DeviceStatus> {
        if self.acquisition.is_some() {
            return Err(PeakError::AcquisitionActive);
        }

        let client = PeakClient::connect(&self.config.addr)?;
        client.set_read_timeout(self.config.read_timeout)?;
        if let Some(size) = self.config.recv_buffer_size {
            tune_recv_buffer(&client, size)?;
        }
        self.client = Some(client);

        self.send_reset(self.config.digitisation_rate)
    }

    /// Close the connection, stopping acquisition first
    pub fn disconnect(&mut self) -> Result<()> {
        self.stop_async_acquisition()?;
        if self.client.take().is_some() {
            info!(addr = %self.config.addr, "Disconnected from instrument");
        }
        Ok(())
    }

    /// Reset the instrument and read back its status block
    ///
    /// Sends `RST` (or `RST <rate>`), waits the settle delay and reads the
    /// 32-byte status block. A rejected reset is retried
    /// [`reset_retries`](HandlerConfig::reset_retries) times.
    ///
    /// # Errors
    ///
    /// - [`PeakError::InvalidDigitisationRate`] - `mhz` is not 0, 10, 25, 50 or 100; nothing is sent
    /// - [`PeakError::ResetExhausted`] - Every attempt was rejected. The connection is closed.
    /// - [`PeakError::Io`] - Link failure during the handshake. The connection is closed.
    pub fn send_reset(&mut self, mhz: u32) -> Result<DeviceStatus> {
        let rate = DigitisationRate::try_from(mhz).map_err(|e| {
            error!(requested = mhz, "Digitisation rate ought to be 0, 10, 25, 50 or 100 MHz");
            e
        })?;

        if self.acquisition.is_some() {
            return Err(PeakError::AcquisitionActive);
        }
        let client = self.client.as_mut().ok_or(PeakError::NotConnected)?;

        let command = rate.reset_command();
        let attempts = self.config.reset_retries + 1;

        for attempt in 1..=attempts {
            debug!(attempt = attempt, command = %command, "Attempting reset");
            let response = match reset_exchange(client, &command, self.config.reset_settle) {
                Ok(response) => response,
                Err(e) => {
                    error!(attempt = attempt, error = %e, "Link failed during reset");
                    self.client = None;
                    return Err(e);
                }
            };

            match DeviceStatus::decode(&response) {
                Ok(status) => {
                    log_status(&status);
                    self.digitisation_rate = u32::from(status.actual_digitisation_rate);
                    self.device_status = Some(status);
                    return Ok(status);
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Reset failed");
                }
            }
        }

        error!(attempts = attempts, "Unable to reset instrument");
        self.client = None;
        Err(PeakError::ResetExhausted { attempts })
    }

    /// Forward every MPS line to the instrument
    ///
    /// An `RST` line in the file answers with a status block like any other
    /// reset. It is read back after the settle delay and adopted, so the
    /// stream stays aligned for the data requests that follow.
    ///
    /// # Errors
    ///
    /// - [`PeakError::ResetRejected`] - A forwarded reset was not acknowledged.
    ///   The remaining lines are not sent.
    /// - [`PeakError::Io`] - Link failure. The connection is closed.
    pub fn send_mps_configuration(&mut self) -> Result<()> {
        if self.acquisition.is_some() {
            return Err(PeakError::AcquisitionActive);
        }
        let client = self.client.as_mut().ok_or(PeakError::NotConnected)?;

        for command in &self.commands {
            let exchange = match DeviceCommand::parse(command) {
                DeviceCommand::Reset(_) => {
                    reset_exchange(client, command, self.config.reset_settle).map(Some)
                }
                _ => client.send_command(command).map(|_| None),
            };

            let response = match exchange {
                Ok(response) => response,
                Err(e) => {
                    error!(command = %command, error = %e, "Link failed sending MPS configuration");
                    self.client = None;
                    return Err(e);
                }
            };

            if let Some(response) = response {
                let status = DeviceStatus::decode(&response).map_err(|e| {
                    error!(command = %command, error = %e, "Reset in MPS configuration failed");
                    e
                })?;
                log_status(&status);
                self.digitisation_rate = u32::from(status.actual_digitisation_rate);
                self.device_status = Some(status);
            }
        }

        info!(lines = self.commands.len(), "MPS configuration sent to instrument");
        Ok(())
    }

    /// Adjust the read timeout of the synchronous link
    ///
    /// Applies to the open connection, if any, and to later connections. A
    /// connection held by the acquisition loop picks it up when stopped.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Some(client) = self.client.as_ref() {
            client.set_read_timeout(timeout)?;
        }
        self.config.read_timeout = timeout;
        Ok(())
    }

    /// Trigger one acquisition and wait for the response
    ///
    /// # Errors
    ///
    /// - [`PeakError::AcquisitionActive`] - The asynchronous loop owns the connection
    /// - [`PeakError::NotConnected`] - No connection is open
    /// - [`PeakError::Configuration`] - No geometry has been loaded
    /// - [`PeakError::Io`] - Link failure
    /// - Any protocol error from [`parse_response`]
    pub fn send_data_request(&mut self) -> Result<AcquisitionResult> {
        if self.acquisition.is_some() {
            return Err(PeakError::AcquisitionActive);
        }
        let geometry = self.require_geometry()?;
        let client = self.client.as_mut().ok_or(PeakError::NotConnected)?;

        client.send_command(TRIGGER_COMMAND)?;
        let response = client.receive_exact(geometry.packet_length())?;
        let scans = parse_response(&response, &geometry)?;

        debug!(
            num_a_scans = scans.ascans.len(),
            max_amplitude = scans.max_amplitude,
            "Data request complete"
        );
        Ok(self.template(&geometry).with_scans(scans))
    }

    /// Start continuous acquisition without a callback
    pub fn start_async_acquisition(&mut self) -> Result<()> {
        self.start_async_acquisition_with(|_| {})
    }

    /// Start continuous acquisition
    ///
    /// Does nothing if acquisition is already running. The result slot is
    /// seeded with the static fields first, so a poll before the first
    /// cycle completes returns `false` and never a stale geometry.
    ///
    /// `callback` runs on the acquisition thread after every cycle with
    /// `true` for an accepted response.
    ///
    /// # Errors
    ///
    /// - [`PeakError::NotConnected`] - No connection is open
    /// - [`PeakError::Configuration`] - No geometry has been loaded
    /// - [`PeakError::Io`] - The acquisition thread could not be started.
    ///   The connection is closed.
    pub fn start_async_acquisition_with<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(bool) + Send + 'static,
    {
        if self.acquisition.is_some() {
            debug!("Asynchronous acquisition already running");
            return Ok(());
        }
        let geometry = self.require_geometry()?;
        let client = self.client.take().ok_or(PeakError::NotConnected)?;

        let template = self.template(&geometry);
        self.latest.seed(template.clone());

        let task = AcquisitionTask::start(
            client,
            geometry,
            template,
            Arc::clone(&self.latest),
            Box::new(callback),
            self.config.link_error_backoff,
        )?;
        self.acquisition = Some(task);
        Ok(())
    }

    /// Stop continuous acquisition
    ///
    /// Blocks until the acquisition thread has exited and the connection is
    /// back with the handler. Does nothing if acquisition is not running.
    pub fn stop_async_acquisition(&mut self) -> Result<()> {
        if let Some(task) = self.acquisition.take() {
            let client = task.stop()?;
            client.set_read_timeout(self.config.read_timeout)?;
            self.client = Some(client);
        }
        Ok(())
    }

    /// Copy the latest unread result into `out`
    ///
    /// Returns `false` and leaves `out` untouched if nothing new has been
    /// published since the last successful call.
    pub fn get_latest_data(&self, out: &mut AcquisitionResult) -> bool {
        self.latest.take(out)
    }

    /// Shared handle to the result slot, for polling from other threads
    pub fn latest_handle(&self) -> Arc<LatestData> {
        Arc::clone(&self.latest)
    }

    fn require_geometry(&self) -> Result<Geometry> {
        self.geometry
            .ok_or_else(|| PeakError::Configuration("no MPS geometry loaded".to_string()))
    }

    fn template(&self, geometry: &Geometry) -> AcquisitionResult {
        AcquisitionResult::template(geometry, self.digitisation_rate, self.reconstruction)
    }
}

/// Send one reset and read back the raw status block
fn reset_exchange(client: &mut PeakClient, command: &str, settle: Duration) -> Result<Vec<u8>> {
    client.send_command(command)?;
    std::thread::sleep(settle);
    client.receive_exact(DeviceStatus::SIZE)
}

fn log_status(status: &DeviceStatus) {
    info!(
        system_type = status.system_type,
        family = ?status.family(),
        default_dof = status.default_dof,
        actual_dof = status.actual_dof,
        default_rate_mhz = status.default_digitisation_rate,
        actual_rate_mhz = status.actual_digitisation_rate,
        "Reset successful"
    );
}

#[cfg(unix)]
fn tune_recv_buffer(client: &PeakClient, size: usize) -> Result<()> {
    client.set_recv_buffer_size(size)
}

#[cfg(not(unix))]
fn tune_recv_buffer(_client: &PeakClient, size: usize) -> Result<()> {
    warn!(size = size, "Receive buffer size not supported on this platform");
    Ok(())
}

impl Drop for PeakHandler {
    fn drop(&mut self) {
        if let Err(e) = self.stop_async_acquisition() {
            warn!(error = %e, "Acquisition did not stop cleanly");
        }
    }
}
