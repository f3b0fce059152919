//! Synchronous instrument client
//!
//! Simple blocking TCP transport: line commands out, exact-length binary
//! responses in.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;

use crate::error::{PeakError, Result};
use crate::protocol::command::encode_command;
use tracing::{debug, info, trace, warn};

const DRAIN_CHUNK: usize = 8 * 1024;

fn closed(context: &str) -> PeakError {
    PeakError::Io(std::io::Error::new(ErrorKind::UnexpectedEof, context.to_string()))
}

/// Synchronous instrument client
///
/// Uses blocking I/O with `std::net::TcpStream`. Besides the stream it
/// tracks how many response bytes the instrument still owes from a receive
/// that was abandoned, and discards them before the next receive so every
/// response starts on a sub-frame boundary.
#[derive(Debug)]
pub struct PeakClient {
    stream: TcpStream,
    stale_bytes: usize,
}

impl PeakClient {
    /// Connect to an instrument
    ///
    /// TCP_NODELAY is enabled so short commands are not held back.
    ///
    /// # Arguments
    ///
    /// * `addr` - Instrument address (e.g., "10.1.1.2:1067")
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use peak_micropulse::io::PeakClient;
    ///
    /// let client = PeakClient::connect("10.1.1.2:1067")?;
    /// # Ok::<(), peak_micropulse::error::PeakError>(())
    /// ```
    pub fn connect(addr: &str) -> Result<Self> {
        info!(addr = %addr, "Connecting to instrument");
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        debug!(
            local_addr = ?stream.local_addr().ok(),
            remote_addr = %addr,
            "Connected to instrument"
        );

        Ok(PeakClient {
            stream,
            stale_bytes: 0,
        })
    }

    pub(crate) fn from_parts(stream: TcpStream, stale_bytes: usize) -> Self {
        PeakClient {
            stream,
            stale_bytes,
        }
    }

    pub(crate) fn into_parts(self) -> (TcpStream, usize) {
        (self.stream, self.stale_bytes)
    }

    /// Send one command line (CR/LF appended)
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        let data = encode_command(command);
        trace!(command = command, "Sending command");

        self.stream.write_all(&data)?;
        self.stream.flush()?;

        debug!(bytes = data.len(), "Sent command");
        Ok(())
    }

    /// Receive exactly `len` bytes
    ///
    /// Blocks until the full length has arrived. Bytes owed from an
    /// abandoned response are discarded first. If the read fails part way
    /// (a read timeout, for instance), the unread remainder is recorded as
    /// owed so the next receive starts on the following response.
    pub fn receive_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        self.drain_stale()?;

        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.stale_bytes = len - filled;
                    return Err(closed("connection closed while receiving response"));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.stale_bytes = len - filled;
                    warn!(
                        received = filled,
                        owed = self.stale_bytes,
                        error = %e,
                        "Receive abandoned"
                    );
                    return Err(e.into());
                }
            }
        }

        trace!(bytes = len, "Received response");
        Ok(buf)
    }

    /// Discard response bytes left over from an abandoned receive
    ///
    /// Progress survives a failed read: whatever was discarded before the
    /// error is no longer owed.
    pub fn drain_stale(&mut self) -> Result<()> {
        if self.stale_bytes == 0 {
            return Ok(());
        }

        debug!(bytes = self.stale_bytes, "Draining stale response bytes");
        let mut scratch = [0u8; DRAIN_CHUNK];
        while self.stale_bytes > 0 {
            let want = self.stale_bytes.min(DRAIN_CHUNK);
            match self.stream.read(&mut scratch[..want]) {
                Ok(0) => {
                    warn!(remaining = self.stale_bytes, "Connection closed while draining");
                    return Err(closed("connection closed while draining stale response"));
                }
                Ok(n) => self.stale_bytes -= n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Response bytes still owed from an abandoned receive
    pub fn stale_bytes(&self) -> usize {
        self.stale_bytes
    }

    /// Set read timeout for receive operations
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout duration (None for blocking forever)
    pub fn set_read_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Set write timeout for send operations
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout duration (None for blocking forever)
    pub fn set_write_timeout(&self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Enable or disable TCP_NODELAY (Nagle's algorithm)
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.stream.set_nodelay(nodelay)?;
        Ok(())
    }

    /// Set the size of the TCP receive buffer (SO_RCVBUF)
    ///
    /// 16-bit responses for large arrays run to hundreds of kilobytes; a
    /// larger kernel buffer keeps the instrument from stalling on them.
    #[cfg(unix)]
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        use std::os::fd::AsRawFd;

        let fd = self.stream.as_raw_fd();
        let size = size as libc::c_int;

        unsafe {
            let ret = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );

            if ret != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        Ok(())
    }

    /// Get the local address
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.stream.local_addr()?)
    }

    /// Get the remote peer address
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }
}
