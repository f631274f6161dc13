//! Debug-adapter session engine.
//!
//! The crate runs one debugging session: it speaks the client-facing
//! request/response/event protocol ([`proto`]), owns a duplex IPC channel to
//! the in-process probe that actually controls the debuggee ([`ipc`]), and
//! coordinates everything in between ([`engine`]): execution state, threads
//! and frames, breakpoints, variable references, and child-process tracking.
//!
//! The embedding front end supplies the outer transport (stdin/stdout,
//! socket) and a [`engine::ClientSink`] for upward notifications; the engine
//! supplies [`engine::SessionEngine::dispatch`] for inbound requests.

pub mod engine;
pub mod error;
pub mod ipc;
mod log;
pub mod proto;

pub use engine::{ClientEvent, ClientSink, SessionEngine, SessionOps};
pub use error::Error;
