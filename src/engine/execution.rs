//! Stepping/run state machine and the command plumbing behind it.
//!
//! Every operation that needs a probe answer goes through the same path:
//! allocate a pending id, register the result slot, write the command bytes,
//! then suspend the caller on the slot. Registration strictly precedes the
//! write so an instant reply cannot race its waiter.

use crate::engine::pending::PendingCommands;
use crate::error::Error;
use crate::ipc::DebugChannel;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the debuggee stopped.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum_macros::Display,
    strum_macros::AsRefStr,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum StopReason {
    Breakpoint,
    Step,
    Pause,
    Exception,
}

/// Stepping granularity, mapped onto the wire command names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Over,
    Into,
    Out,
}

impl StepKind {
    pub fn command(self) -> &'static str {
        match self {
            StepKind::Over => "next",
            StepKind::Into => "stepIn",
            StepKind::Out => "stepOut",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    NotStarted,
    Running,
    Stopped {
        reason: StopReason,
        thread_id: Option<i64>,
    },
    Terminated,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::NotStarted => f.write_str("not started"),
            ExecutionStatus::Running => f.write_str("running"),
            ExecutionStatus::Stopped { reason, .. } => write!(f, "stopped ({reason})"),
            ExecutionStatus::Terminated => f.write_str("terminated"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueOutcome {
    pub all_threads_continued: bool,
}

/// The stepping/run state machine. Owns no registries itself; it issues
/// commands through the channel and tracks only the execution status.
pub struct ExecutionController {
    channel: Arc<DebugChannel>,
    pending: Arc<PendingCommands>,
    status: Mutex<ExecutionStatus>,
    /// Whether any stop was ever observed; continue before the first stop is
    /// the lenient no-op case, distinct from continue-after-terminate.
    stop_observed: AtomicBool,
    terminated_notified: AtomicBool,
    reply_timeout: Duration,
}

impl ExecutionController {
    pub fn new(
        channel: Arc<DebugChannel>,
        pending: Arc<PendingCommands>,
        reply_timeout: Duration,
    ) -> ExecutionController {
        ExecutionController {
            channel,
            pending,
            status: Mutex::new(ExecutionStatus::NotStarted),
            stop_observed: AtomicBool::new(false),
            terminated_notified: AtomicBool::new(false),
            reply_timeout,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    fn set_status(&self, status: ExecutionStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    /// Issue a command and suspend until its slot resolves. The status lock
    /// is never held across the wait.
    fn command(&self, name: &str, arguments: Value) -> Result<Option<Value>, Error> {
        let reply = self.pending.register();
        let id = reply.id;
        let wire = json!({
            "command": name,
            "id": id,
            "arguments": arguments,
        });
        log::debug!(target: "engine", "probe command {id}: {name}");
        if let Err(e) = self.channel.write_command(&wire) {
            // The slot will never get a wire reply; consume it here.
            self.pending.resolve(id, Err(Error::NotConnected));
            return Err(e);
        }
        reply.wait(self.reply_timeout)
    }

    fn reject_if_terminated(&self, command: &'static str) -> Result<(), Error> {
        let status = self.status();
        match status {
            ExecutionStatus::Terminated => Err(Error::InvalidState {
                command,
                state: status.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// `NotStarted -> Running`. Fails when the debuggee already runs.
    pub fn launch(&self, arguments: Value) -> Result<(), Error> {
        {
            let status = self.status.lock().expect("status lock poisoned");
            match *status {
                ExecutionStatus::NotStarted => {}
                ExecutionStatus::Running | ExecutionStatus::Stopped { .. } => {
                    return Err(Error::AlreadyRun)
                }
                ExecutionStatus::Terminated => {
                    return Err(Error::InvalidState {
                        command: "launch",
                        state: ExecutionStatus::Terminated.to_string(),
                    })
                }
            }
        }
        self.command("launch", arguments)?;
        self.set_status(ExecutionStatus::Running);
        Ok(())
    }

    /// Resume execution.
    ///
    /// Two "no effect" situations stay deliberately distinguishable: a
    /// continue before any stop was ever observed succeeds as a no-op with
    /// `all_threads_continued: false` and performs no IPC write, while a
    /// continue after termination fails fast.
    pub fn continue_(&self, thread_id: Option<i64>) -> Result<ContinueOutcome, Error> {
        self.reject_if_terminated("continue")?;
        match self.status() {
            ExecutionStatus::NotStarted => Err(Error::InvalidState {
                command: "continue",
                state: ExecutionStatus::NotStarted.to_string(),
            }),
            ExecutionStatus::Running => Ok(ContinueOutcome {
                all_threads_continued: false,
            }),
            ExecutionStatus::Stopped { .. } => {
                self.command("continue", json!({ "threadId": thread_id }))?;
                self.set_status(ExecutionStatus::Running);
                Ok(ContinueOutcome {
                    all_threads_continued: true,
                })
            }
            ExecutionStatus::Terminated => unreachable!("rejected above"),
        }
    }

    pub fn step(&self, kind: StepKind, thread_id: i64) -> Result<(), Error> {
        self.reject_if_terminated(kind.command())?;
        match self.status() {
            ExecutionStatus::NotStarted => Err(Error::InvalidState {
                command: kind.command(),
                state: ExecutionStatus::NotStarted.to_string(),
            }),
            ExecutionStatus::Running | ExecutionStatus::Stopped { .. } => {
                self.command(kind.command(), json!({ "threadId": thread_id }))?;
                self.set_status(ExecutionStatus::Running);
                Ok(())
            }
            ExecutionStatus::Terminated => unreachable!("rejected above"),
        }
    }

    pub fn pause(&self, thread_id: Option<i64>) -> Result<(), Error> {
        self.reject_if_terminated("pause")?;
        match self.status() {
            ExecutionStatus::NotStarted => Err(Error::InvalidState {
                command: "pause",
                state: ExecutionStatus::NotStarted.to_string(),
            }),
            ExecutionStatus::Running | ExecutionStatus::Stopped { .. } => {
                self.command("pause", json!({ "threadId": thread_id }))?;
                Ok(())
            }
            ExecutionStatus::Terminated => unreachable!("rejected above"),
        }
    }

    /// Evaluate an expression in an optional frame context.
    pub fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> Result<Option<Value>, Error> {
        self.reject_if_terminated("evaluate")?;
        if self.status() == ExecutionStatus::NotStarted {
            return Err(Error::NoDebuggee);
        }
        self.command(
            "evaluate",
            json!({ "expression": expression, "frameId": frame_id }),
        )
    }

    /// Request data the probe has to produce (stack traces, scope variable
    /// lists) through the pending machinery.
    pub fn query(&self, command: &'static str, arguments: Value) -> Result<Option<Value>, Error> {
        self.reject_if_terminated(command)?;
        if self.status() == ExecutionStatus::NotStarted {
            return Err(Error::NoDebuggee);
        }
        self.command(command, arguments)
    }

    /// Apply an inbound "stopped" event: `Running -> Stopped`.
    pub fn on_stopped(&self, reason: StopReason, thread_id: Option<i64>) {
        self.stop_observed.store(true, Ordering::SeqCst);
        self.set_status(ExecutionStatus::Stopped { reason, thread_id });
    }

    /// True once any stop has ever been observed this session.
    pub fn stop_observed(&self) -> bool {
        self.stop_observed.load(Ordering::SeqCst)
    }

    /// Transition to `Terminated` unconditionally and fail every in-flight
    /// command. Returns true exactly once so the terminated notification is
    /// emitted a single time no matter how often termination is signalled.
    pub fn terminate(&self) -> bool {
        self.set_status(ExecutionStatus::Terminated);
        self.pending.fail_all(|| Error::SessionShutDown);
        !self.terminated_notified.swap(true, Ordering::SeqCst)
    }
}
