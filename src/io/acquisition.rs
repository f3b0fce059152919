//! Continuous acquisition worker
//!
//! Runs trigger/receive cycles back to back on a dedicated thread driving a
//! single-threaded tokio runtime. Each accepted response is published to a
//! [`LatestData`] slot and reported through a callback.
//!
//! Stopping cancels the in-flight receive at a read boundary. The number of
//! response bytes the instrument still owes is handed back with the socket,
//! and whoever receives next discards them first.

use std::net::TcpStream as StdTcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::error::{PeakError, Result};
use crate::io::client::PeakClient;
use crate::io::latest::LatestData;
use crate::protocol::acquisition::{parse_response, AcquisitionResult, ScanSet};
use crate::protocol::command::{encode_command, TRIGGER_COMMAND};
use crate::protocol::mps::Geometry;

/// Per-cycle completion callback; the argument is `true` for an accepted response
pub type Callback = Box<dyn FnMut(bool) + Send + 'static>;

const READ_CHUNK: usize = 64 * 1024;

/// Async side of the link: a stream plus the bytes still owed on it
struct AcquisitionLink<S> {
    stream: S,
    pending: usize,
    scratch: Vec<u8>,
}

impl<S> AcquisitionLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S, pending: usize) -> Self {
        AcquisitionLink {
            stream,
            pending,
            scratch: vec![0u8; READ_CHUNK],
        }
    }

    fn into_parts(self) -> (S, usize) {
        (self.stream, self.pending)
    }

    /// Read up to `pending` bytes; cancel-safe at every await
    async fn read_pending(&mut self) -> Result<usize> {
        let want = self.pending.min(self.scratch.len());
        let n = self.stream.read(&mut self.scratch[..want]).await?;
        if n == 0 {
            return Err(PeakError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "instrument closed the connection",
            )));
        }
        self.pending -= n;
        Ok(n)
    }

    /// Discard bytes left over from an abandoned response
    async fn drain(&mut self) -> Result<()> {
        if self.pending > 0 {
            debug!(bytes = self.pending, "Draining stale response bytes");
        }
        while self.pending > 0 {
            self.read_pending().await?;
        }
        Ok(())
    }

    /// Send the trigger and expect `response_len` bytes back
    async fn trigger(&mut self, response_len: usize) -> Result<()> {
        let data = encode_command(TRIGGER_COMMAND);
        self.stream.write_all(&data).await?;
        self.stream.flush().await?;
        self.pending = response_len;
        trace!(expected = response_len, "Trigger sent");
        Ok(())
    }

    /// Receive the rest of the current response
    async fn receive(&mut self) -> Result<Vec<u8>> {
        let mut response = Vec::with_capacity(self.pending);
        while self.pending > 0 {
            let n = self.read_pending().await?;
            response.extend_from_slice(&self.scratch[..n]);
        }
        trace!(bytes = response.len(), "Response received");
        Ok(response)
    }
}

/// One trigger/receive/decode cycle
///
/// Returns `None` once `shutdown` fires. The trigger write itself is never
/// interrupted so the instrument always sees whole commands.
async fn run_cycle<S>(
    link: &mut AcquisitionLink<S>,
    geometry: &Geometry,
    shutdown: &mut oneshot::Receiver<()>,
) -> Option<Result<ScanSet>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = &mut *shutdown => return None,
        drained = link.drain() => {
            if let Err(e) = drained {
                return Some(Err(e));
            }
        }
    }

    if let Err(e) = link.trigger(geometry.packet_length()).await {
        return Some(Err(e));
    }

    let response = tokio::select! {
        biased;
        _ = &mut *shutdown => return None,
        received = link.receive() => received,
    };

    Some(response.and_then(|buf| parse_response(&buf, geometry)))
}

struct LoopState {
    geometry: Geometry,
    template: AcquisitionResult,
    latest: Arc<LatestData>,
    callback: Callback,
    acquiring: Arc<AtomicBool>,
    backoff: Duration,
}

async fn run_loop<S>(
    link: &mut AcquisitionLink<S>,
    state: &mut LoopState,
    mut shutdown: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut cycles: u64 = 0;

    while state.acquiring.load(Ordering::Acquire) {
        let outcome = match run_cycle(link, &state.geometry, &mut shutdown).await {
            Some(outcome) => outcome,
            None => break,
        };
        cycles += 1;

        match outcome {
            Ok(scans) => {
                if !state.acquiring.load(Ordering::Acquire) {
                    break;
                }
                trace!(
                    cycle = cycles,
                    max_amplitude = scans.max_amplitude,
                    "Publishing acquisition"
                );
                state.latest.publish(state.template.with_scans(scans));
                (state.callback)(true);
            }
            Err(e) => {
                warn!(cycle = cycles, error = %e, "Acquisition cycle failed");
                (state.callback)(false);

                if matches!(e, PeakError::Io(_)) {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(state.backoff) => {}
                    }
                }
            }
        }
    }

    debug!(cycles = cycles, stale = link.pending, "Acquisition loop finished");
}

/// Handle to a running acquisition thread
///
/// Owns the connection while acquiring. [`stop`](AcquisitionTask::stop)
/// returns it to the caller once the thread has fully exited.
pub struct AcquisitionTask {
    acquiring: Arc<AtomicBool>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<std::io::Result<(StdTcpStream, usize)>>>,
}

impl AcquisitionTask {
    /// Start acquiring on `client`
    ///
    /// # Arguments
    ///
    /// * `client` - Connection to hand over to the acquisition thread
    /// * `geometry` - Geometry every response is validated against
    /// * `template` - Static result fields copied into every publication
    /// * `latest` - Slot accepted results are published to
    /// * `callback` - Invoked after every cycle with its outcome
    /// * `backoff` - Pause after a link error before the next cycle
    ///
    /// # Errors
    ///
    /// - [`PeakError::Io`] - Runtime or thread could not be created, or the
    ///   socket could not be registered. The connection is closed.
    pub fn start(
        client: PeakClient,
        geometry: Geometry,
        template: AcquisitionResult,
        latest: Arc<LatestData>,
        callback: Callback,
        backoff: Duration,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let (std_stream, stale) = client.into_parts();
        std_stream.set_nonblocking(true)?;
        let stream = {
            let _guard = runtime.enter();
            TcpStream::from_std(std_stream)?
        };

        let acquiring = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut state = LoopState {
            geometry,
            template,
            latest,
            callback,
            acquiring: Arc::clone(&acquiring),
            backoff,
        };

        let handle = thread::Builder::new()
            .name("peak-acquisition".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let mut link = AcquisitionLink::new(stream, stale);
                    run_loop(&mut link, &mut state, shutdown_rx).await;

                    let (stream, pending) = link.into_parts();
                    let std_stream = stream.into_std()?;
                    std_stream.set_nonblocking(false)?;
                    Ok((std_stream, pending))
                })
            })?;

        info!(
            ascan_length = geometry.ascan_length(),
            num_a_scans = geometry.num_a_scans(),
            "Asynchronous acquisition started"
        );

        Ok(AcquisitionTask {
            acquiring,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Whether the loop is still meant to be running
    pub fn is_running(&self) -> bool {
        self.acquiring.load(Ordering::Acquire)
    }

    fn signal(&mut self) {
        self.acquiring.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop acquiring and take the connection back
    ///
    /// Blocks until the acquisition thread has exited; no publication or
    /// callback happens after this returns.
    ///
    /// # Errors
    ///
    /// - [`PeakError::AcquisitionThread`] - The thread panicked
    /// - [`PeakError::Io`] - The socket could not be returned to blocking mode
    pub fn stop(mut self) -> Result<PeakClient> {
        self.signal();

        let handle = self
            .handle
            .take()
            .ok_or_else(|| PeakError::AcquisitionThread("already stopped".into()))?;
        let (stream, stale) = handle
            .join()
            .map_err(|_| PeakError::AcquisitionThread("acquisition thread panicked".into()))??;

        info!(stale_bytes = stale, "Asynchronous acquisition stopped");
        Ok(PeakClient::from_parts(stream, stale))
    }
}

impl Drop for AcquisitionTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.signal();
            let _ = handle.join();
        }
    }
}
