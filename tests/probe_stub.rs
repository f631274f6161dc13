//! Scripted stand-in for the debuggee probe, used by the session
//! integration tests. Speaks the text framing over a real TCP connection.

use anyhow::{ensure, Context};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

pub const POLL_DELAY: Duration = Duration::from_millis(10);
pub const DEADLINE: Duration = Duration::from_secs(5);

pub struct ProbeStub {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl ProbeStub {
    /// Connect to the engine's listening port, retrying until the listener
    /// is up or the deadline passes.
    pub fn connect(port: u16) -> anyhow::Result<ProbeStub> {
        let deadline = Instant::now() + DEADLINE;
        let stream = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(_) if Instant::now() < deadline => std::thread::sleep(POLL_DELAY),
                Err(e) => return Err(e).context("probe connect"),
            }
        };
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(DEADLINE))?;
        Ok(ProbeStub {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
        })
    }

    /// Read the next command the engine wrote to the channel.
    pub fn read_command(&mut self) -> anyhow::Result<Value> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).context("probe read")?;
        ensure!(n > 0, "engine closed the probe connection");
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Read the next command and assert its name.
    pub fn expect_command(&mut self, name: &str) -> anyhow::Result<Value> {
        let command = self.read_command()?;
        ensure!(
            command["command"] == name,
            "expected `{name}`, probe got: {command}"
        );
        Ok(command)
    }

    fn send(&mut self, value: &Value) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec(value)?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn reply_ok(&mut self, command: &Value, body: Value) -> anyhow::Result<()> {
        self.send(&json!({
            "replyTo": command["id"],
            "success": true,
            "body": body,
        }))
    }

    pub fn reply_err(&mut self, command: &Value, message: &str) -> anyhow::Result<()> {
        self.send(&json!({
            "replyTo": command["id"],
            "success": false,
            "message": message,
        }))
    }

    pub fn send_event(&mut self, event: &str, body: Value) -> anyhow::Result<()> {
        self.send(&json!({ "event": event, "body": body }))
    }
}
