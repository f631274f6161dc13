use std::path::PathBuf;
use std::time::Duration;

/// Engine-wide error type.
///
/// Variants are grouped by the four failure classes the adapter distinguishes:
/// protocol errors (malformed wire messages), transport errors (probe IPC
/// failures), operation errors (request-local failures) and state errors
/// (commands issued in an invalid session state). [`Error::kind`] returns the
/// class discriminator that ends up in failed-response bodies.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- protocol errors -------------------------------------------
    #[error("malformed message payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("message missing required field `{0}`")]
    MissingField(&'static str),
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    #[error("missing Content-Length header")]
    MissingContentLength,

    // --------------------------------- transport errors ------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("no live probe connection")]
    NotConnected,
    #[error("probe connection closed")]
    Disconnected,
    #[error("ipc frame of {0} bytes exceeds the allowed maximum")]
    FrameTooLarge(u32),
    #[error("unknown ipc frame kind {0}")]
    UnknownFrameKind(u8),

    // --------------------------------- operation errors ------------------------------------------
    #[error("no debuggee process")]
    NoDebuggee,
    #[error("debuggee already run")]
    AlreadyRun,
    #[error("breakpoint source path is missing")]
    BreakpointPathMissing,
    #[error("invalid breakpoint path: {0}")]
    InvalidBreakpointPath(PathBuf),
    #[error("thread {0} not found")]
    ThreadNotFound(i64),
    #[error("frame {0} not found")]
    FrameNotFound(i64),
    #[error("unknown variable reference {0}")]
    UnknownVariableReference(i64),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("probe rejected command: {0}")]
    CommandRejected(String),

    // --------------------------------- state errors ----------------------------------------------
    #[error("`{command}` is not valid while session is {state}")]
    InvalidState {
        command: &'static str,
        state: String,
    },
    #[error("session shut down")]
    SessionShutDown,
    #[error("no reply from probe within {0:?}")]
    CommandTimeout(Duration),
}

impl Error {
    /// Stable discriminator placed into the `body.error` field of a failed
    /// response.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedPayload(_)
            | Error::NotAnObject
            | Error::MissingField(_)
            | Error::UnknownMessageType(_)
            | Error::MissingContentLength => "ProtocolError",

            Error::Io(_)
            | Error::NotConnected
            | Error::Disconnected
            | Error::FrameTooLarge(_)
            | Error::UnknownFrameKind(_) => "TransportError",

            Error::NoDebuggee
            | Error::AlreadyRun
            | Error::BreakpointPathMissing
            | Error::InvalidBreakpointPath(_)
            | Error::ThreadNotFound(_)
            | Error::FrameNotFound(_)
            | Error::UnknownVariableReference(_)
            | Error::UnknownCommand(_)
            | Error::CommandRejected(_) => "OperationError",

            Error::InvalidState { .. }
            | Error::SessionShutDown
            | Error::CommandTimeout(_) => "StateError",
        }
    }

    /// True for errors that end the probe connection (and with it the
    /// session), false for errors local to a single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Disconnected | Error::SessionShutDown
        )
    }
}
