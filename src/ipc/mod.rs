//! IPC channel between the engine and the debuggee probe.
//!
//! The channel is a transport-agnostic duplex byte stream: transport
//! (TCP / Unix socket / pipe pair) and framing (text / binary) are chosen at
//! construction, after which the engine only sees `write` plus a blocking
//! accept-and-read loop that decodes inbound frames into [`ProbeMessage`]s.

pub mod frame;
pub mod transport;

use crate::error::Error;
use frame::{Frame, FrameDecoder, Framing};
use serde::Deserialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use transport::{ProbeListener, ProbeStream, TransportConfig, WriteHalf, READ_POLL};

/// Transport plus framing selection for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub transport: TransportConfig,
    pub framing: Framing,
}

/// A message decoded from an inbound probe frame.
///
/// Replies answer a previously issued command (matched by id); everything
/// else is an event the probe raises on its own (stopped, thread started or
/// exited, output, exited).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ProbeMessage {
    Reply {
        #[serde(rename = "replyTo")]
        reply_to: u64,
        success: bool,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        body: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        body: Value,
    },
}

/// Duplex channel to the probe.
///
/// Exactly one inbound connection is accepted per channel; the listening
/// resource is dropped the moment the probe is in (or the channel is disabled
/// before anyone connected).
pub struct DebugChannel {
    framing: Framing,
    listener: Mutex<Option<ProbeListener>>,
    pipe_endpoint: Mutex<Option<ProbeStream>>,
    writer: Mutex<Option<WriteHalf>>,
    disabled: AtomicBool,
    local_port: Option<u16>,
}

impl DebugChannel {
    /// Bind a listening channel (TCP or Unix socket).
    pub fn bind(config: &ChannelConfig) -> Result<DebugChannel, Error> {
        let listener = ProbeListener::bind(&config.transport)?;
        let local_port = listener.local_port();
        Ok(DebugChannel {
            framing: config.framing,
            listener: Mutex::new(Some(listener)),
            pipe_endpoint: Mutex::new(None),
            writer: Mutex::new(None),
            disabled: AtomicBool::new(false),
            local_port,
        })
    }

    /// Wrap a pre-established duplex pipe pair. No accept phase: the read
    /// loop starts decoding immediately.
    pub fn from_pipe(
        framing: Framing,
        reader: os_pipe::PipeReader,
        writer: os_pipe::PipeWriter,
    ) -> DebugChannel {
        DebugChannel {
            framing,
            listener: Mutex::new(None),
            pipe_endpoint: Mutex::new(Some(ProbeStream::from_pipe(reader, writer))),
            writer: Mutex::new(None),
            disabled: AtomicBool::new(false),
            local_port: None,
        }
    }

    /// Actually bound TCP port, when the transport is TCP.
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// True once the probe connection is accepted and writable. The accept
    /// poll runs on the read-loop worker, so a freshly connected probe may
    /// not be visible here for up to one poll interval.
    pub fn is_connected(&self) -> bool {
        self.writer.lock().expect("writer lock poisoned").is_some()
    }

    /// Stop the channel: the read loop exits at its next poll, subsequent
    /// writes fail with [`Error::NotConnected`].
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        *self.writer.lock().expect("writer lock poisoned") = None;
        // An un-accepted listener is closed here so a session that ends
        // before the probe ever connected does not leak it.
        *self.listener.lock().expect("listener lock poisoned") = None;
    }

    /// Send a raw, already-serialized command to the probe.
    pub fn write(&self, raw_command: &str) -> Result<(), Error> {
        if self.is_disabled() {
            return Err(Error::NotConnected);
        }
        let mut guard = self.writer.lock().expect("writer lock poisoned");
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        let encoded = frame::encode(self.framing, raw_command.as_bytes());
        if let Err(e) = writer.write_all(&encoded).and_then(|_| writer.flush()) {
            // A broken writer never recovers; drop it so callers get
            // NotConnected instead of a fresh io error each time.
            *guard = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Serialize and send a structured command object.
    pub fn write_command(&self, command: &Value) -> Result<(), Error> {
        self.write(&serde_json::to_string(command)?)
    }

    /// Accept the probe connection (unless pipe-based) and decode inbound
    /// frames until the peer closes, a transport error occurs, or the
    /// channel is disabled.
    ///
    /// Intended to run on a dedicated worker thread. Returns `Ok(())` on a
    /// clean close or disable; transport failures are returned once, after
    /// the loop has terminated, so the caller can emit a single
    /// "disconnected" notification.
    pub fn run_accept_and_read(
        &self,
        mut on_message: impl FnMut(ProbeMessage),
    ) -> Result<(), Error> {
        let stream = match self.take_endpoint()? {
            Some(stream) => stream,
            // Disabled before anyone connected.
            None => return Ok(()),
        };

        let ProbeStream { mut reader, writer } = stream;
        *self.writer.lock().expect("writer lock poisoned") = Some(writer);

        let mut decoder = FrameDecoder::new(self.framing);
        let mut buf = [0u8; 8192];
        let result = loop {
            if self.is_disabled() {
                break Ok(());
            }
            let read_n = match reader.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::warn!(target: "ipc", "probe read failed: {e}");
                    break Err(Error::Io(e));
                }
            };

            decoder.extend(&buf[..read_n]);
            if let Err(e) = self.drain_frames(&mut decoder, &mut on_message) {
                break Err(e);
            }
        };

        *self.writer.lock().expect("writer lock poisoned") = None;
        result
    }

    fn drain_frames(
        &self,
        decoder: &mut FrameDecoder,
        on_message: &mut impl FnMut(ProbeMessage),
    ) -> Result<(), Error> {
        while let Some(Frame { kind, payload }) = decoder.next_frame()? {
            if kind != frame::FRAME_KIND_EVENT {
                log::warn!(target: "ipc", "ignoring reserved frame kind {kind}");
                continue;
            }
            match serde_json::from_slice::<ProbeMessage>(&payload) {
                Ok(message) => on_message(message),
                // A malformed probe payload is logged and skipped; it never
                // tears the session down.
                Err(e) => {
                    log::warn!(target: "ipc", "undecodable probe frame: {e}");
                }
            }
        }
        Ok(())
    }

    /// Wait for the probe endpoint: either the pre-established pipe pair or
    /// one accepted connection. Polls so channel disable is noticed while
    /// still listening.
    fn take_endpoint(&self) -> Result<Option<ProbeStream>, Error> {
        if let Some(stream) = self
            .pipe_endpoint
            .lock()
            .expect("pipe lock poisoned")
            .take()
        {
            return Ok(Some(stream));
        }

        loop {
            if self.is_disabled() {
                return Ok(None);
            }
            let mut guard = self.listener.lock().expect("listener lock poisoned");
            let Some(listener) = guard.as_ref() else {
                return Ok(None);
            };
            match listener.try_accept() {
                Ok(Some(stream)) => {
                    // One connection per session: drop the listener now.
                    *guard = None;
                    return Ok(Some(stream));
                }
                Ok(None) => {
                    drop(guard);
                    std::thread::sleep(READ_POLL);
                }
                Err(e) => {
                    *guard = None;
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn pipe_disable_unblocks_the_read_loop() {
        let (engine_read, probe_write) = os_pipe::pipe().unwrap();
        let (_probe_read, engine_write) = os_pipe::pipe().unwrap();
        let channel = Arc::new(DebugChannel::from_pipe(
            Framing::Text,
            engine_read,
            engine_write,
        ));

        let worker = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.run_accept_and_read(|_| {}))
        };

        // Let the loop settle into its read before disabling.
        std::thread::sleep(Duration::from_millis(50));
        channel.disable();

        // The probe keeps its write end open the whole time; the loop must
        // still notice the disable within a poll interval or two.
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_finished() {
            assert!(
                Instant::now() < deadline,
                "read loop still blocked after disable"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(worker.join().unwrap().is_ok());
        drop(probe_write);
    }

    #[test]
    fn write_after_disable_reports_not_connected() {
        let (engine_read, _probe_write) = os_pipe::pipe().unwrap();
        let (_probe_read, engine_write) = os_pipe::pipe().unwrap();
        let channel = DebugChannel::from_pipe(Framing::Text, engine_read, engine_write);
        channel.disable();
        assert!(matches!(
            channel.write(r#"{"command":"pause"}"#),
            Err(Error::NotConnected)
        ));
    }
}
