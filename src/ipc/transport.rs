//! Duplex byte transports to the probe.
//!
//! Three backends: TCP (loopback or routed), Unix domain sockets where the
//! platform has them, and a pre-established pipe pair for hosts without a
//! listen/accept model. Listening backends accept exactly one connection and
//! then give the listener up.

use crate::error::Error;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;
use timeout_readwrite::TimeoutReader;

/// Poll interval for the read loop; bounds how long channel disable may go
/// unnoticed by a blocked read.
pub(crate) const READ_POLL: Duration = Duration::from_millis(100);

/// Transport selection, decided at launch time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: PathBuf },
    /// Endpoints are created out-of-band and handed over directly.
    Pipe,
}

/// A bound, not-yet-accepted listening endpoint.
pub enum ProbeListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl ProbeListener {
    pub fn bind(config: &TransportConfig) -> Result<ProbeListener, Error> {
        match config {
            TransportConfig::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))?;
                // Accepting is polled, never blocked on, so channel disable
                // is noticed while still listening.
                listener.set_nonblocking(true)?;
                Ok(ProbeListener::Tcp(listener))
            }
            #[cfg(unix)]
            TransportConfig::Unix { path } => {
                // A stale socket file from a crashed predecessor blocks bind.
                let _ = std::fs::remove_file(path);
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Ok(ProbeListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            TransportConfig::Pipe => Err(Error::NotConnected),
        }
    }

    /// Actually bound TCP port (useful when configured with port 0).
    pub fn local_port(&self) -> Option<u16> {
        match self {
            ProbeListener::Tcp(listener) => listener.local_addr().ok().map(|a| a.port()),
            #[cfg(unix)]
            ProbeListener::Unix { .. } => None,
        }
    }

    /// Try to accept the single probe connection. `Ok(None)` means nobody
    /// has connected yet. The accepted read half is configured with
    /// [`READ_POLL`] so a disabled channel is noticed promptly mid-read.
    pub fn try_accept(&self) -> Result<Option<ProbeStream>, Error> {
        match self {
            ProbeListener::Tcp(listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!(target: "ipc", "probe connected from {peer}");
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(READ_POLL))?;
                    let reader = stream.try_clone()?;
                    Ok(Some(ProbeStream {
                        reader: ReadHalf::Tcp(reader),
                        writer: WriteHalf::Tcp(stream),
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e.into()),
            },
            #[cfg(unix)]
            ProbeListener::Unix { listener, path } => match listener.accept() {
                Ok((stream, _)) => {
                    log::info!(target: "ipc", "probe connected on {}", path.display());
                    stream.set_nonblocking(false)?;
                    stream.set_read_timeout(Some(READ_POLL))?;
                    let reader = stream.try_clone()?;
                    // The socket file is single-use; remove it as soon as the
                    // one allowed connection is in.
                    let _ = std::fs::remove_file(path);
                    Ok(Some(ProbeStream {
                        reader: ReadHalf::Unix(reader),
                        writer: WriteHalf::Unix(stream),
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }
}

impl Drop for ProbeListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ProbeListener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// An accepted duplex connection, split into independently owned halves so
/// the read loop and writers never contend on one handle.
pub struct ProbeStream {
    pub reader: ReadHalf,
    pub writer: WriteHalf,
}

impl ProbeStream {
    /// Wrap a pre-established pipe pair (no accept phase). The read end is
    /// wrapped with [`READ_POLL`] the same way socket reads are, so channel
    /// disable is noticed even while the probe keeps the pipe open.
    pub fn from_pipe(reader: os_pipe::PipeReader, writer: os_pipe::PipeWriter) -> ProbeStream {
        ProbeStream {
            reader: ReadHalf::Pipe(TimeoutReader::new(reader, READ_POLL)),
            writer: WriteHalf::Pipe(writer),
        }
    }
}

pub enum ReadHalf {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Pipe(TimeoutReader<os_pipe::PipeReader>),
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ReadHalf::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            ReadHalf::Unix(s) => s.read(buf),
            ReadHalf::Pipe(r) => r.read(buf),
        }
    }
}

pub enum WriteHalf {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    Pipe(os_pipe::PipeWriter),
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WriteHalf::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            WriteHalf::Unix(s) => s.write(buf),
            WriteHalf::Pipe(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WriteHalf::Tcp(s) => s.flush(),
            #[cfg(unix)]
            WriteHalf::Unix(s) => s.flush(),
            WriteHalf::Pipe(w) => w.flush(),
        }
    }
}
