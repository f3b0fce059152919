//! MicroPulse / LTPA hardware simulator
//!
//! A protocol peer for running the driver without an instrument. It frames
//! inbound commands on CR/LF, answers resets with a status block, absorbs
//! configuration lines and answers every trigger with one full response
//! after a delay modelled on the gate window and digitisation rate.
//!
//! Commands run strictly in arrival order. A trigger keeps the device busy
//! for one acquisition window and everything received meanwhile waits behind
//! it, so back-to-back triggers are answered one window apart and a reset
//! never overtakes a response that is already owed.

use std::collections::VecDeque;
use std::future::pending;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, Sleep};
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::protocol::command::{DeviceCommand, DigitisationRate, TERMINATOR};
use crate::protocol::mps::SampleMode;
use crate::protocol::scan::ScanMessage;
use crate::protocol::status::DeviceStatus;

/// Simulated instrument configuration
///
/// # Examples
///
/// ```
/// use peak_micropulse::simulator::SimulatorConfig;
/// use peak_micropulse::protocol::SampleMode;
///
/// let config = SimulatorConfig::default()
///     .with_sample_mode(SampleMode::SixteenBit)
///     .with_ascan_length(2000)
///     .with_num_a_scans(61);
/// assert_eq!(config.gate_end, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Interface to listen on
    pub host: String,
    /// Port to listen on (0 = ephemeral)
    pub port: u16,
    /// Sample encoding of generated A-scans
    pub sample_mode: SampleMode,
    /// Samples per generated A-scan
    pub ascan_length: usize,
    /// A-scans per response
    pub num_a_scans: usize,
    /// System type byte reported on reset (0x30 = LTPA)
    pub system_type: u8,
    /// Default digitisation rate reported on reset (MHz)
    pub default_digitisation_rate: u8,
    /// Digitisation rate in effect until a `RST <rate>` changes it (MHz)
    pub actual_digitisation_rate: u8,
    /// Gate start until a `GATS` line changes it
    pub gate_start: u32,
    /// Gate end until a `GATS` line changes it
    pub gate_end: u32,
    /// Fixed per-response processing time added to the acquisition window
    pub processing_delay: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            sample_mode: SampleMode::EightBit,
            ascan_length: 100,
            num_a_scans: 5,
            system_type: 0x30,
            default_digitisation_rate: 50,
            actual_digitisation_rate: 50,
            gate_start: 0,
            gate_end: 100,
            processing_delay: Duration::from_millis(1),
        }
    }
}

impl SimulatorConfig {
    /// Listen on a fixed port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Generate 8-bit or 16-bit A-scans
    pub fn with_sample_mode(mut self, mode: SampleMode) -> Self {
        self.sample_mode = mode;
        self
    }

    /// Set the samples per A-scan
    pub fn with_ascan_length(mut self, length: usize) -> Self {
        self.ascan_length = length;
        self
    }

    /// Set the A-scans per response
    pub fn with_num_a_scans(mut self, count: usize) -> Self {
        self.num_a_scans = count;
        self
    }

    /// Set the initial gate window
    pub fn with_gates(mut self, start: u32, end: u32) -> Self {
        self.gate_start = start;
        self.gate_end = end;
        self
    }

    /// Set the default and initial actual digitisation rates
    pub fn with_digitisation_rate(mut self, mhz: u8) -> Self {
        self.default_digitisation_rate = mhz;
        self.actual_digitisation_rate = mhz;
        self
    }

    /// Set the fixed processing delay
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }
}

/// Time the instrument needs to answer one trigger
///
/// `gate_end / rate` microseconds of acquisition plus the processing delay.
/// A zero rate contributes no acquisition time.
pub fn response_delay(gate_end: u32, digitisation_rate_mhz: u32, processing: Duration) -> Duration {
    if digitisation_rate_mhz == 0 {
        return processing;
    }
    let acquisition_ns = u64::from(gate_end) * 1_000 / u64::from(digitisation_rate_mhz);
    Duration::from_nanos(acquisition_ns) + processing
}

/// Counters and live settings shared with the simulator thread
#[derive(Debug, Default)]
struct Shared {
    resets: AtomicUsize,
    config_lines: AtomicUsize,
    data_requests: AtomicUsize,
    responses: AtomicUsize,
    gate_start: AtomicU32,
    gate_end: AtomicU32,
    actual_rate: AtomicU32,
}

/// Protocol state of the simulated instrument
struct Device {
    config: SimulatorConfig,
    shared: Arc<Shared>,
    queue: VecDeque<String>,
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// Running acquisition window; `None` while the device is idle
type Timer = Option<Pin<Box<Sleep>>>;

async fn fire(timer: &mut Timer) {
    match timer {
        Some(deadline) => deadline.as_mut().await,
        None => pending().await,
    }
}

impl Device {
    fn response_delay(&self) -> Duration {
        response_delay(
            self.shared.gate_end.load(Ordering::Relaxed),
            self.shared.actual_rate.load(Ordering::Relaxed),
            self.config.processing_delay,
        )
    }

    fn status(&self) -> DeviceStatus {
        let dof = self.config.sample_mode.code();
        DeviceStatus {
            system_type: self.config.system_type,
            actual_dof: dof,
            default_digitisation_rate: self.config.default_digitisation_rate,
            actual_digitisation_rate: self.shared.actual_rate.load(Ordering::Relaxed) as u8,
            default_dof: dof,
        }
    }

    /// One A-scan of the deterministic ramp pattern
    fn ascan(&self, index: usize) -> Vec<u8> {
        let modulus = match self.config.sample_mode {
            SampleMode::EightBit => 100,
            SampleMode::SixteenBit => 1000,
        };
        let amps = (0..self.config.ascan_length)
            .map(|s| ((index * 7 + s) % modulus) as i32)
            .collect();
        ScanMessage::ascan(
            (index + 1) as u16,
            (index & 0xFF) as u8,
            self.config.sample_mode,
            amps,
        )
        .encode()
    }

    fn packet(&self) -> Vec<u8> {
        (0..self.config.num_a_scans)
            .flat_map(|i| self.ascan(i))
            .collect()
    }

    /// Run queued commands in order until one starts an acquisition
    async fn advance(&mut self, stream: &mut TcpStream, timer: &mut Timer) -> std::io::Result<()> {
        while timer.is_none() {
            match self.queue.pop_front() {
                Some(line) => self.execute(&line, stream, timer).await?,
                None => break,
            }
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        line: &str,
        stream: &mut TcpStream,
        timer: &mut Timer,
    ) -> std::io::Result<()> {
        match DeviceCommand::parse(line) {
            DeviceCommand::Reset(rate) => {
                if let Some(mhz) = rate {
                    match DigitisationRate::try_from(mhz).map(DigitisationRate::mhz) {
                        Ok(Some(mhz)) => self.shared.actual_rate.store(mhz, Ordering::Relaxed),
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Reset rate ignored"),
                    }
                }
                self.shared.resets.fetch_add(1, Ordering::Relaxed);
                stream.write_all(&self.status().encode()).await?;
                debug!(command = line, "Reset answered");
            }
            DeviceCommand::Gates { start, end } => {
                self.shared.gate_start.store(start, Ordering::Relaxed);
                self.shared.gate_end.store(end, Ordering::Relaxed);
                self.shared.config_lines.fetch_add(1, Ordering::Relaxed);
                debug!(gate_start = start, gate_end = end, "Gates updated");
            }
            DeviceCommand::Trigger => {
                self.shared.data_requests.fetch_add(1, Ordering::Relaxed);
                *timer = Some(Box::pin(sleep(self.response_delay())));
                trace!(queued = self.queue.len(), "Acquisition started");
            }
            DeviceCommand::Other(_) => {
                self.shared.config_lines.fetch_add(1, Ordering::Relaxed);
                trace!(command = line, "Configuration line absorbed");
            }
        }
        Ok(())
    }

    async fn session(
        &mut self,
        mut stream: TcpStream,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> SessionEnd {
        let mut inbound = BytesMut::with_capacity(1024);
        let mut timer: Timer = None;
        self.queue.clear();

        loop {
            let advanced = tokio::select! {
                biased;
                _ = &mut *shutdown => return SessionEnd::Shutdown,
                _ = fire(&mut timer) => {
                    timer = None;
                    let packet = self.packet();
                    self.shared.responses.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = stream.write_all(&packet).await {
                        warn!(error = %e, "Failed to send response");
                        return SessionEnd::Disconnected;
                    }
                    trace!(bytes = packet.len(), queued = self.queue.len(), "Response sent");
                    self.advance(&mut stream, &mut timer).await
                }
                read = stream.read_buf(&mut inbound) => {
                    match read {
                        Ok(0) => return SessionEnd::Disconnected,
                        Ok(_) => {
                            while let Some(line) = next_line(&mut inbound) {
                                self.queue.push_back(line);
                            }
                            self.advance(&mut stream, &mut timer).await
                        }
                        Err(e) => {
                            warn!(error = %e, "Read failed");
                            return SessionEnd::Disconnected;
                        }
                    }
                }
            };

            if let Err(e) = advanced {
                warn!(error = %e, "Failed to answer command");
                return SessionEnd::Disconnected;
            }
        }
    }
}

/// Split the next CR/LF-terminated line off the inbound buffer
fn next_line(inbound: &mut BytesMut) -> Option<String> {
    let pos = inbound
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)?;
    let line = inbound.split_to(pos + TERMINATOR.len());
    Some(String::from_utf8_lossy(&line[..pos]).into_owned())
}

async fn serve(listener: TcpListener, mut device: Device, mut shutdown: oneshot::Receiver<()>) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        info!(peer_addr = %peer, "Client connected");
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "TCP_NODELAY not set");
        }

        match device.session(stream, &mut shutdown).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Disconnected => info!(peer_addr = %peer, "Client disconnected"),
        }
    }
    debug!("Simulator stopped");
}

/// Running simulated instrument
///
/// Serves one client at a time on a dedicated thread and goes back to
/// accepting when the client disconnects.
///
/// # Examples
///
/// ```no_run
/// use peak_micropulse::simulator::{PeakSimulator, SimulatorConfig};
///
/// let simulator = PeakSimulator::start(SimulatorConfig::default())?;
/// println!("listening on {}", simulator.local_addr());
/// # Ok::<(), peak_micropulse::error::PeakError>(())
/// ```
pub struct PeakSimulator {
    config: SimulatorConfig,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeakSimulator {
    /// Bind and start serving
    ///
    /// Returns once the listener is bound, so a client may connect
    /// immediately.
    ///
    /// # Errors
    ///
    /// - [`PeakError::Io`](crate::error::PeakError::Io) - Bind failed or the
    ///   runtime could not be created
    pub fn start(config: SimulatorConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind((config.host.as_str(), config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let shared = Arc::new(Shared::default());
        shared.gate_start.store(config.gate_start, Ordering::Relaxed);
        shared.gate_end.store(config.gate_end, Ordering::Relaxed);
        shared
            .actual_rate
            .store(u32::from(config.actual_digitisation_rate), Ordering::Relaxed);

        let device = Device {
            config: config.clone(),
            shared: Arc::clone(&shared),
            queue: VecDeque::new(),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = thread::Builder::new()
            .name("peak-simulator".into())
            .spawn(move || runtime.block_on(serve(listener, device, shutdown_rx)))?;

        info!(
            local_addr = %local_addr,
            dof = config.sample_mode.code(),
            ascan_length = config.ascan_length,
            num_a_scans = config.num_a_scans,
            "Simulator listening"
        );

        Ok(PeakSimulator {
            config,
            local_addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Stop serving and wait for the simulator thread to exit
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Simulator thread panicked");
            }
        }
    }

    /// Configuration the simulator was started with
    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of resets answered
    pub fn reset_count(&self) -> usize {
        self.shared.resets.load(Ordering::Relaxed)
    }

    /// Number of configuration lines absorbed (gate lines included)
    pub fn config_lines_count(&self) -> usize {
        self.shared.config_lines.load(Ordering::Relaxed)
    }

    /// Number of triggers received
    pub fn data_request_count(&self) -> usize {
        self.shared.data_requests.load(Ordering::Relaxed)
    }

    /// Number of responses sent
    pub fn response_count(&self) -> usize {
        self.shared.responses.load(Ordering::Relaxed)
    }

    /// Current gate window
    pub fn gates(&self) -> (u32, u32) {
        (
            self.shared.gate_start.load(Ordering::Relaxed),
            self.shared.gate_end.load(Ordering::Relaxed),
        )
    }

    /// Digitisation rate in effect (MHz)
    pub fn digitisation_rate(&self) -> u32 {
        self.shared.actual_rate.load(Ordering::Relaxed)
    }

    /// Time to answer one trigger with the current gates and rate
    pub fn response_delay(&self) -> Duration {
        response_delay(
            self.shared.gate_end.load(Ordering::Relaxed),
            self.digitisation_rate(),
            self.config.processing_delay,
        )
    }
}

impl Drop for PeakSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}
