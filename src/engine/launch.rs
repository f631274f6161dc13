//! Launch-time configuration surface consumed by the session engine.

use crate::error::Error;
use crate::ipc::frame::Framing;
use crate::ipc::transport::TransportConfig;
use crate::ipc::ChannelConfig;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

/// Probe transport requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Unix,
    Pipe,
}

/// Arguments of the launch request, as the engine consumes them.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct LaunchConfig {
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
    pub stop_on_entry: bool,
    pub no_debug: bool,
    pub in_process: bool,
    pub transport: TransportKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub pipe_name: Option<String>,
    pub binary_framing: bool,
}

impl LaunchConfig {
    /// Deserialize from the launch request's `arguments` value.
    pub fn from_arguments(arguments: &Value) -> Result<LaunchConfig, Error> {
        Ok(serde_json::from_value(arguments.clone())?)
    }

    /// Channel configuration derived from this launch. Binary framing is
    /// preferred when the client advertises it: payloads may then carry
    /// arbitrary bytes without escaping.
    pub fn channel_config(&self) -> ChannelConfig {
        let framing = if self.binary_framing {
            Framing::Binary
        } else {
            Framing::Text
        };
        let transport = match self.transport {
            TransportKind::Tcp => TransportConfig::Tcp {
                host: self.host.clone().unwrap_or_else(|| "127.0.0.1".into()),
                port: self.port.unwrap_or(0),
            },
            #[cfg(unix)]
            TransportKind::Unix => TransportConfig::Unix {
                path: self
                    .pipe_name
                    .clone()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| generate_socket_path("tether")),
            },
            #[cfg(not(unix))]
            TransportKind::Unix => TransportConfig::Tcp {
                host: "127.0.0.1".into(),
                port: self.port.unwrap_or(0),
            },
            TransportKind::Pipe => TransportConfig::Pipe,
        };
        ChannelConfig { transport, framing }
    }
}

/// Auto-generated named-pipe name: `\\.\pipe\<adapter>-<pid>-<random>`.
pub fn generate_pipe_name(adapter: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!(r"\\.\pipe\{adapter}-{}-{suffix:08x}", std::process::id())
}

/// Unix equivalent of the auto-generated pipe name: a per-process socket
/// path in the temp directory.
pub fn generate_socket_path(adapter: &str) -> PathBuf {
    let suffix: u32 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("{adapter}-{}-{suffix:08x}.sock", std::process::id()))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn launch_arguments_deserialize_with_defaults() {
        let config = LaunchConfig::from_arguments(&json!({
            "program": "/work/app.py",
            "args": ["--fast"],
            "stopOnEntry": true,
            "binaryFraming": true,
            "port": 5890,
        }))
        .unwrap();
        assert_eq!(config.program.as_deref(), Some(std::path::Path::new("/work/app.py")));
        assert!(config.stop_on_entry);
        assert!(!config.no_debug);
        assert_eq!(config.transport, TransportKind::Tcp);

        let channel = config.channel_config();
        assert_eq!(channel.framing, Framing::Binary);
        assert_eq!(
            channel.transport,
            TransportConfig::Tcp {
                host: "127.0.0.1".into(),
                port: 5890,
            }
        );
    }

    #[test]
    fn pipe_names_follow_the_adapter_pid_random_pattern() {
        let name = generate_pipe_name("tether");
        let prefix = format!(r"\\.\pipe\tether-{}-", std::process::id());
        assert!(name.starts_with(&prefix), "{name}");
        assert_ne!(name, generate_pipe_name("tether"));
    }
}
