//! Session engine facade.
//!
//! Composes the execution controller, breakpoint manager, session state and
//! subprocess watcher behind the full operation set a protocol front end
//! needs. Collaborators are injected at construction: a [`ClientSink`] for
//! upward notifications and a [`DebugChannel`] as the probe command sink;
//! there is no process-wide lookup of either.

pub mod breakpoint;
pub mod execution;
pub mod launch;
pub mod pending;
pub mod state;
pub mod subprocess;

use crate::engine::breakpoint::{
    BreakpointManager, DataBreakpointInfo, DataBreakpointSpec, FunctionBreakpointSpec,
    SourceBreakpointSpec, VerifiedBreakpoint,
};
use crate::engine::execution::{
    ContinueOutcome, ExecutionController, StepKind, StopReason, DEFAULT_REPLY_TIMEOUT,
};
use crate::engine::pending::PendingCommands;
use crate::engine::state::{
    alloc_pseudo_frame_id, ScopeKind, SessionState, Source, StackFrame, ThreadInfo, Variable,
    VariableBacking,
};
use crate::engine::subprocess::{ChildRecord, SpawnDecision, SubprocessWatcher, WatcherConfig};
use crate::error::Error;
use crate::ipc::{DebugChannel, ProbeMessage};
use crate::proto::{MessageCodec, Request, Response};
use crate::weak_error;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Notification the engine sends up to its client collaborator.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Stopped {
        reason: StopReason,
        thread_id: Option<i64>,
        description: Option<String>,
    },
    Thread {
        reason: &'static str,
        thread_id: i64,
    },
    Output {
        category: &'static str,
        output: String,
    },
    Exited {
        code: i32,
    },
    Terminated,
    Process {
        body: Value,
    },
    Breakpoint {
        body: Value,
    },
    ChildProcess {
        body: Value,
    },
    ChildProcessExited {
        body: Value,
    },
    ChildProcessCandidate {
        body: Value,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Stopped { .. } => "stopped",
            ClientEvent::Thread { .. } => "thread",
            ClientEvent::Output { .. } => "output",
            ClientEvent::Exited { .. } => "exited",
            ClientEvent::Terminated => "terminated",
            ClientEvent::Process { .. } => "process",
            ClientEvent::Breakpoint { .. } => "breakpoint",
            ClientEvent::ChildProcess { .. } => "childProcess",
            ClientEvent::ChildProcessExited { .. } => "childProcessExited",
            ClientEvent::ChildProcessCandidate { .. } => "childProcessCandidate",
        }
    }

    pub fn body(&self) -> Option<Value> {
        match self {
            ClientEvent::Stopped {
                reason,
                thread_id,
                description,
            } => Some(json!({
                "reason": reason.as_ref(),
                "threadId": thread_id,
                "description": description,
                "allThreadsStopped": true,
            })),
            ClientEvent::Thread { reason, thread_id } => Some(json!({
                "reason": reason,
                "threadId": thread_id,
            })),
            ClientEvent::Output { category, output } => Some(json!({
                "category": category,
                "output": output,
            })),
            ClientEvent::Exited { code } => Some(json!({ "exitCode": code })),
            ClientEvent::Terminated => None,
            ClientEvent::Process { body }
            | ClientEvent::Breakpoint { body }
            | ClientEvent::ChildProcess { body }
            | ClientEvent::ChildProcessExited { body }
            | ClientEvent::ChildProcessCandidate { body } => Some(body.clone()),
        }
    }
}

/// "Send message to client" capability, injected at engine construction.
pub trait ClientSink: Send + Sync {
    fn send_event(&self, event: ClientEvent) -> anyhow::Result<()>;
}

/// The operation set the engine exposes to its protocol front end. A
/// lightweight fake implementing this trait stands in for the engine in
/// front-end tests.
pub trait SessionOps {
    fn launch(&self, arguments: &Value) -> Result<(), Error>;
    fn set_breakpoints(
        &self,
        path: Option<&str>,
        specs: &[SourceBreakpointSpec],
    ) -> Vec<VerifiedBreakpoint>;
    fn set_function_breakpoints(&self, specs: &[FunctionBreakpointSpec]) -> Vec<VerifiedBreakpoint>;
    fn set_exception_breakpoints(&self, filters: &[String]) -> Vec<VerifiedBreakpoint>;
    fn data_breakpoint_info(&self, name: &str, frame_id: i64) -> Result<DataBreakpointInfo, Error>;
    fn set_data_breakpoints(&self, specs: &[DataBreakpointSpec]) -> Vec<VerifiedBreakpoint>;
    fn threads(&self) -> Vec<ThreadInfo>;
    fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>, Error>;
    fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>, Error>;
    fn variables(&self, reference: i64) -> Result<Vec<Variable>, Error>;
    fn continue_(&self, thread_id: Option<i64>) -> Result<ContinueOutcome, Error>;
    fn step(&self, kind: StepKind, thread_id: i64) -> Result<(), Error>;
    fn pause(&self, thread_id: Option<i64>) -> Result<(), Error>;
    fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<Value, Error>;
    fn shutdown(&self);
}

/// One scope entry of a frame.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    pub expensive: bool,
}

/// Variable record as the probe reports it. `object` carries a structured
/// value whose children the engine serves locally.
#[derive(Debug, Clone, Deserialize)]
struct ProbeVariable {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(rename = "type", default)]
    type_name: Option<String>,
    #[serde(default)]
    object: Option<Value>,
}

/// Stack frame as the probe reports it. Frames of lightweight units carry
/// no id of their own; the engine numbers them from the reserved range.
#[derive(Debug, Clone, Deserialize)]
struct ProbeFrame {
    #[serde(default)]
    id: Option<i64>,
    name: String,
    line: i64,
    column: i64,
    #[serde(default)]
    source: Option<Source>,
}

fn assign_frame_ids(frames: Vec<ProbeFrame>) -> Vec<StackFrame> {
    frames
        .into_iter()
        .map(|frame| StackFrame {
            id: frame.id.unwrap_or_else(alloc_pseudo_frame_id),
            name: frame.name,
            line: frame.line,
            column: frame.column,
            source: frame.source,
        })
        .collect_vec()
}

/// Message posted onto the engine's primary inbox. IPC workers never touch
/// engine state directly; everything is marshalled through here.
enum EngineMessage {
    Probe(ProbeMessage),
    Disconnected,
}

pub struct SessionEngine {
    codec: Arc<MessageCodec>,
    channel: Arc<DebugChannel>,
    pending: Arc<PendingCommands>,
    controller: ExecutionController,
    state: Mutex<SessionState>,
    breakpoints: Mutex<BreakpointManager>,
    watcher: SubprocessWatcher,
    sink: Arc<dyn ClientSink>,
    session_id: Uuid,
    shut_down: AtomicBool,
}

impl SessionEngine {
    pub fn new(channel: Arc<DebugChannel>, sink: Arc<dyn ClientSink>) -> Arc<SessionEngine> {
        Self::with_codec(channel, sink, Arc::new(MessageCodec::new()))
    }

    pub fn with_codec(
        channel: Arc<DebugChannel>,
        sink: Arc<dyn ClientSink>,
        codec: Arc<MessageCodec>,
    ) -> Arc<SessionEngine> {
        let pending = Arc::new(PendingCommands::new());
        let session_id = Uuid::new_v4();
        Arc::new(SessionEngine {
            codec,
            controller: ExecutionController::new(
                channel.clone(),
                pending.clone(),
                DEFAULT_REPLY_TIMEOUT,
            ),
            pending,
            watcher: SubprocessWatcher::new(WatcherConfig::default(), session_id),
            channel,
            state: Mutex::new(SessionState::new()),
            breakpoints: Mutex::new(BreakpointManager::new()),
            sink,
            session_id,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    /// Start the IPC pump and the primary event loop.
    ///
    /// The pump worker runs the channel's accept-and-read loop and posts
    /// every decoded message onto the inbox; the primary loop thread owns
    /// all state mutation. Both exit when the channel is disabled or the
    /// probe goes away.
    pub fn start(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<EngineMessage>();

        let pump = {
            let engine = self.clone();
            let tx = tx.clone();
            move || {
                let result = engine.channel.run_accept_and_read(|message| {
                    let _ = tx.send(EngineMessage::Probe(message));
                });
                if let Err(e) = result {
                    log::warn!(target: "ipc", "probe connection lost: {e:#}");
                }
                // Terminal notification: exactly one, whatever ended the loop.
                let _ = tx.send(EngineMessage::Disconnected);
            }
        };
        std::thread::spawn(pump);

        let event_loop = {
            let engine = self.clone();
            move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        EngineMessage::Probe(probe) => engine.apply_probe_message(probe),
                        EngineMessage::Disconnected => {
                            engine.on_disconnect();
                            break;
                        }
                    }
                }
                log::debug!(target: "engine", "event loop exiting");
            }
        };
        std::thread::spawn(event_loop);
    }

    /// Apply one inbound probe message. Runs on the primary loop thread;
    /// events mutate state in arrival order, replies resolve pending slots.
    fn apply_probe_message(&self, message: ProbeMessage) {
        match message {
            ProbeMessage::Reply {
                reply_to,
                success,
                message,
                body,
            } => {
                let outcome = if success {
                    Ok(body)
                } else {
                    Err(Error::CommandRejected(
                        message.unwrap_or_else(|| "unspecified probe error".into()),
                    ))
                };
                if !self.pending.resolve(reply_to, outcome) {
                    log::debug!(target: "engine", "late reply for command {reply_to} dropped");
                }
            }
            ProbeMessage::Event { event, body } => self.apply_probe_event(&event, body),
        }
    }

    fn apply_probe_event(&self, event: &str, body: Value) {
        match event {
            "stopped" => {
                let reason = body
                    .get("reason")
                    .and_then(Value::as_str)
                    .and_then(|r| StopReason::from_str(r).ok())
                    .unwrap_or(StopReason::Pause);
                let thread_id = {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    // Stops inside a lightweight unit are reported by key.
                    let thread_id = body.get("threadId").and_then(Value::as_i64).or_else(|| {
                        body.get("key")
                            .and_then(Value::as_str)
                            .and_then(|key| state.pseudo_thread_id(key))
                    });
                    // A fresh stop invalidates every previously issued
                    // variable reference before the client hears about it.
                    state.clear_stop_scoped();
                    thread_id
                };
                self.controller.on_stopped(reason, thread_id);
                self.emit(ClientEvent::Stopped {
                    reason,
                    thread_id,
                    description: body
                        .get("description")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned),
                });
            }
            "thread" => {
                let started = body.get("reason").and_then(Value::as_str) == Some("started");
                let pseudo = body.get("pseudo").and_then(Value::as_bool).unwrap_or(false);
                let thread_id = {
                    let mut state = self.state.lock().expect("state lock poisoned");
                    if pseudo {
                        // Lightweight units are identified by a probe-local
                        // key; their ids come from the reserved high range.
                        let Some(key) = body.get("key").and_then(Value::as_str) else {
                            log::warn!(target: "engine", "pseudo thread event without key");
                            return;
                        };
                        if started {
                            let name = body
                                .get("name")
                                .and_then(Value::as_str)
                                .map(ToOwned::to_owned)
                                .unwrap_or_else(|| key.to_owned());
                            state.ensure_pseudo_thread(key, name)
                        } else {
                            match state.remove_pseudo_thread(key) {
                                Some(info) => info.id,
                                None => {
                                    log::warn!(
                                        target: "engine",
                                        "exit event for untracked pseudo thread `{key}`"
                                    );
                                    return;
                                }
                            }
                        }
                    } else {
                        let Some(thread_id) = body.get("threadId").and_then(Value::as_i64)
                        else {
                            log::warn!(target: "engine", "thread event without threadId");
                            return;
                        };
                        if started {
                            let name = body
                                .get("name")
                                .and_then(Value::as_str)
                                .map(ToOwned::to_owned)
                                .unwrap_or_else(|| format!("Thread #{thread_id}"));
                            state.add_thread(thread_id, name);
                        } else {
                            state.remove_thread(thread_id);
                        }
                        thread_id
                    }
                };
                self.emit(ClientEvent::Thread {
                    reason: if started { "started" } else { "exited" },
                    thread_id,
                });
            }
            "output" => {
                let output = body
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                let category = match body.get("category").and_then(Value::as_str) {
                    Some("stderr") => "stderr",
                    _ => "stdout",
                };
                self.emit(ClientEvent::Output { category, output });
            }
            "exited" => {
                let code = body
                    .get("exitCode")
                    .and_then(Value::as_i64)
                    .unwrap_or_default() as i32;
                self.emit(ClientEvent::Exited { code });
                self.terminate_session();
            }
            "process" => self.emit(ClientEvent::Process { body }),
            "breakpoint" => self.emit(ClientEvent::Breakpoint { body }),
            "childProcess" => self.emit(ClientEvent::ChildProcess { body }),
            "childProcessExited" => self.emit(ClientEvent::ChildProcessExited { body }),
            other => {
                log::warn!(target: "engine", "unknown probe event `{other}`");
            }
        }
    }

    fn on_disconnect(&self) {
        if !self.shut_down.load(Ordering::SeqCst) {
            log::info!(target: "engine", "probe disconnected; terminating session");
        }
        self.terminate_session();
    }

    /// Idempotent terminal transition shared by probe exit, disconnect and
    /// explicit shutdown.
    fn terminate_session(&self) {
        let first = self.controller.terminate();
        self.channel.disable();
        self.state.lock().expect("state lock poisoned").clear_all();
        self.breakpoints
            .lock()
            .expect("breakpoints lock poisoned")
            .clear_all();
        if first {
            self.emit(ClientEvent::Terminated);
        }
    }

    fn emit(&self, event: ClientEvent) {
        weak_error!(self.sink.send_event(event), "client sink:");
    }

    /// Spawn drain workers that forward the debuggee's stdout/stderr to the
    /// client until EOF.
    pub fn attach_output_pipes<O, E>(self: &Arc<Self>, stdout: O, stderr: E)
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        self.spawn_drain(stdout, "stdout");
        self.spawn_drain(stderr, "stderr");
    }

    fn spawn_drain<R: Read + Send + 'static>(self: &Arc<Self>, reader: R, category: &'static str) {
        let engine = self.clone();
        std::thread::spawn(move || {
            let mut stream = BufReader::new(reader);
            loop {
                let mut line = String::new();
                let Ok(size) = stream.read_line(&mut line) else {
                    break;
                };
                if size == 0 {
                    break;
                }
                engine.emit(ClientEvent::Output {
                    category,
                    output: line,
                });
            }
        });
    }

    // ------------------------------- subprocess watching -----------------------------------------

    pub fn watcher(&self) -> &SubprocessWatcher {
        &self.watcher
    }

    /// Run one spawn attempt through the watcher. Instrumentation candidates
    /// are announced upward before the host actually launches anything.
    pub fn observe_spawn(&self, argv: &[String]) -> SpawnDecision {
        let decision = self.watcher.observe_spawn(argv);
        if let SpawnDecision::Instrument { child, .. } = &decision {
            self.emit(ClientEvent::ChildProcessCandidate {
                body: json!({
                    "sessionId": child.session_id.to_string(),
                    "port": child.port,
                }),
            });
        }
        decision
    }

    pub fn report_child_started(&self, child: ChildRecord, pid: u32) {
        let body = self.watcher.register_child(child, pid);
        self.emit(ClientEvent::ChildProcess { body });
    }

    pub fn report_child_exited(&self, session_id: Uuid) {
        if let Some(body) = self.watcher.child_exited(session_id) {
            self.emit(ClientEvent::ChildProcessExited { body });
        }
    }

    // ------------------------------- request dispatch --------------------------------------------

    /// Handle one client request and produce its response. Any handler
    /// error, expected or not, becomes a failed response; nothing that
    /// happens here tears the session down.
    pub fn dispatch(&self, request: &Request) -> Response {
        match self.handle_request(request) {
            Ok(body) => self.codec.response(request, body),
            Err(e) => {
                log::debug!(target: "engine", "request {} failed: {e:#}", request.seq);
                self.codec.error_response(request, &e)
            }
        }
    }

    fn handle_request(&self, request: &Request) -> Result<Option<Value>, Error> {
        let args = request.arguments.clone().unwrap_or(Value::Null);
        match request.command.as_str() {
            "launch" => {
                self.launch(&args)?;
                Ok(None)
            }
            "setBreakpoints" => {
                let path = args
                    .get("source")
                    .and_then(|s| s.get("path"))
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                let specs: Vec<SourceBreakpointSpec> = args
                    .get("breakpoints")
                    .map(|b| serde_json::from_value(b.clone()))
                    .transpose()?
                    .unwrap_or_default();
                let verified = self.set_breakpoints(path.as_deref(), &specs);
                Ok(Some(json!({ "breakpoints": verified })))
            }
            "setFunctionBreakpoints" => {
                let specs: Vec<FunctionBreakpointSpec> = args
                    .get("breakpoints")
                    .map(|b| serde_json::from_value(b.clone()))
                    .transpose()?
                    .unwrap_or_default();
                Ok(Some(json!({
                    "breakpoints": self.set_function_breakpoints(&specs)
                })))
            }
            "setExceptionBreakpoints" => {
                let filters: Vec<String> = args
                    .get("filters")
                    .map(|f| serde_json::from_value(f.clone()))
                    .transpose()?
                    .unwrap_or_default();
                Ok(Some(json!({
                    "breakpoints": self.set_exception_breakpoints(&filters)
                })))
            }
            "dataBreakpointInfo" => {
                let name = args
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField("name"))?;
                let frame_id = args
                    .get("frameId")
                    .and_then(Value::as_i64)
                    .ok_or(Error::MissingField("frameId"))?;
                let info = self.data_breakpoint_info(name, frame_id)?;
                Ok(Some(serde_json::to_value(info)?))
            }
            "setDataBreakpoints" => {
                let specs: Vec<DataBreakpointSpec> = args
                    .get("breakpoints")
                    .map(|b| serde_json::from_value(b.clone()))
                    .transpose()?
                    .unwrap_or_default();
                Ok(Some(json!({
                    "breakpoints": self.set_data_breakpoints(&specs)
                })))
            }
            "threads" => Ok(Some(json!({ "threads": self.threads() }))),
            "stackTrace" => {
                let thread_id = args
                    .get("threadId")
                    .and_then(Value::as_i64)
                    .ok_or(Error::MissingField("threadId"))?;
                let frames = self.stack_trace(thread_id)?;
                Ok(Some(json!({
                    "stackFrames": frames,
                    "totalFrames": frames.len(),
                })))
            }
            "scopes" => {
                let frame_id = args
                    .get("frameId")
                    .and_then(Value::as_i64)
                    .ok_or(Error::MissingField("frameId"))?;
                Ok(Some(json!({ "scopes": self.scopes(frame_id)? })))
            }
            "variables" => {
                let reference = args
                    .get("variablesReference")
                    .and_then(Value::as_i64)
                    .ok_or(Error::MissingField("variablesReference"))?;
                Ok(Some(json!({ "variables": self.variables(reference)? })))
            }
            "continue" => {
                let outcome = self.continue_(args.get("threadId").and_then(Value::as_i64))?;
                Ok(Some(json!({
                    "allThreadsContinued": outcome.all_threads_continued
                })))
            }
            "next" | "stepIn" | "stepOut" => {
                let kind = match request.command.as_str() {
                    "next" => StepKind::Over,
                    "stepIn" => StepKind::Into,
                    _ => StepKind::Out,
                };
                let thread_id = args
                    .get("threadId")
                    .and_then(Value::as_i64)
                    .ok_or(Error::MissingField("threadId"))?;
                self.step(kind, thread_id)?;
                Ok(None)
            }
            "pause" => {
                self.pause(args.get("threadId").and_then(Value::as_i64))?;
                Ok(None)
            }
            "evaluate" => {
                let expression = args
                    .get("expression")
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField("expression"))?;
                let frame_id = args.get("frameId").and_then(Value::as_i64);
                Ok(Some(self.evaluate(expression, frame_id)?))
            }
            "disconnect" | "terminate" => {
                self.shutdown();
                Ok(None)
            }
            unknown => Err(Error::UnknownCommand(unknown.to_owned())),
        }
    }

    /// Serve the children of an opaque structured value locally, allocating
    /// references for nested containers.
    fn object_children(&self, value: &Value) -> Vec<Variable> {
        let mut state = self.state.lock().expect("state lock poisoned");
        let entries: Vec<(String, &Value)> = match value {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => return vec![],
        };
        entries
            .into_iter()
            .map(|(name, v)| {
                let reference = match v {
                    Value::Object(_) | Value::Array(_) => {
                        state.allocate_variable_reference(VariableBacking::Object(v.clone()))
                    }
                    _ => 0,
                };
                Variable {
                    name,
                    value: render_value(v),
                    type_name: Some(json_type_name(v).to_owned()),
                    variables_reference: reference,
                }
            })
            .collect_vec()
    }

    /// Fetch scope variables from the probe and convert them into client
    /// records, allocating references for expandable values.
    fn scope_variables(&self, frame_id: i64, kind: ScopeKind) -> Result<Vec<Variable>, Error> {
        let body = self
            .controller
            .query(
                "variables",
                json!({ "frameId": frame_id, "scope": kind.as_ref() }),
            )?
            .unwrap_or(Value::Null);
        let probe_vars: Vec<ProbeVariable> = body
            .get("variables")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?
            .unwrap_or_default();

        let mut state = self.state.lock().expect("state lock poisoned");
        let variables = probe_vars
            .into_iter()
            .map(|var| {
                let reference = match var.object {
                    Some(object) => {
                        state.allocate_variable_reference(VariableBacking::Object(object))
                    }
                    None => 0,
                };
                Variable {
                    name: var.name,
                    value: var.value,
                    type_name: var.type_name,
                    variables_reference: reference,
                }
            })
            .collect_vec();

        if kind == ScopeKind::Locals {
            state.set_frame_locals(frame_id, variables.clone());
        }
        Ok(variables)
    }
}

impl SessionOps for SessionEngine {
    fn launch(&self, arguments: &Value) -> Result<(), Error> {
        // Validated eagerly so a bad launch payload fails the request
        // instead of confusing the probe.
        let config = launch::LaunchConfig::from_arguments(arguments)?;
        log::info!(
            target: "engine",
            "launching {:?} (stop_on_entry: {}, no_debug: {})",
            config.program,
            config.stop_on_entry,
            config.no_debug
        );
        self.controller.launch(arguments.clone())
    }

    fn set_breakpoints(
        &self,
        path: Option<&str>,
        specs: &[SourceBreakpointSpec],
    ) -> Vec<VerifiedBreakpoint> {
        self.breakpoints
            .lock()
            .expect("breakpoints lock poisoned")
            .set_breakpoints(path, specs)
    }

    fn set_function_breakpoints(&self, specs: &[FunctionBreakpointSpec]) -> Vec<VerifiedBreakpoint> {
        self.breakpoints
            .lock()
            .expect("breakpoints lock poisoned")
            .set_function_breakpoints(specs)
    }

    fn set_exception_breakpoints(&self, filters: &[String]) -> Vec<VerifiedBreakpoint> {
        self.breakpoints
            .lock()
            .expect("breakpoints lock poisoned")
            .set_exception_breakpoints(filters)
    }

    fn data_breakpoint_info(&self, name: &str, frame_id: i64) -> Result<DataBreakpointInfo, Error> {
        let state = self.state.lock().expect("state lock poisoned");
        self.breakpoints
            .lock()
            .expect("breakpoints lock poisoned")
            .data_breakpoint_info(&state, name, frame_id)
    }

    fn set_data_breakpoints(&self, specs: &[DataBreakpointSpec]) -> Vec<VerifiedBreakpoint> {
        self.breakpoints
            .lock()
            .expect("breakpoints lock poisoned")
            .set_data_breakpoints(specs)
    }

    fn threads(&self) -> Vec<ThreadInfo> {
        self.state.lock().expect("state lock poisoned").threads()
    }

    fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>, Error> {
        let pseudo_key = {
            let state = self.state.lock().expect("state lock poisoned");
            if let Some(frames) = state.stack_frames(thread_id) {
                return Ok(frames.to_vec());
            }
            if state.thread(thread_id).is_none() {
                return Err(Error::ThreadNotFound(thread_id));
            }
            state.pseudo_thread_key(thread_id).map(ToOwned::to_owned)
        };

        // The probe resolves pseudo-threads by its own key, not by the
        // engine-allocated id.
        let mut arguments = json!({ "threadId": thread_id });
        if let Some(key) = pseudo_key {
            arguments["key"] = Value::String(key);
        }
        let body = self
            .controller
            .query("stackTrace", arguments)?
            .unwrap_or(Value::Null);
        let probe_frames: Vec<ProbeFrame> = body
            .get("stackFrames")
            .map(|f| serde_json::from_value(f.clone()))
            .transpose()?
            .unwrap_or_default();
        let frames = assign_frame_ids(probe_frames);

        self.state
            .lock()
            .expect("state lock poisoned")
            .set_stack_frames(thread_id, frames.clone());
        Ok(frames)
    }

    fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>, Error> {
        let mut state = self.state.lock().expect("state lock poisoned");
        if state.frame(frame_id).is_none() {
            return Err(Error::FrameNotFound(frame_id));
        }
        let locals = state.scope_reference(frame_id, ScopeKind::Locals);
        let globals = state.scope_reference(frame_id, ScopeKind::Globals);
        Ok(vec![
            Scope {
                name: "Locals".into(),
                variables_reference: locals,
                expensive: false,
            },
            Scope {
                name: "Globals".into(),
                variables_reference: globals,
                expensive: true,
            },
        ])
    }

    fn variables(&self, reference: i64) -> Result<Vec<Variable>, Error> {
        let backing = {
            let state = self.state.lock().expect("state lock poisoned");
            state
                .resolve_variable_reference(reference)
                .cloned()
                .ok_or(Error::UnknownVariableReference(reference))?
        };
        match backing {
            VariableBacking::List(variables) => Ok(variables),
            VariableBacking::Object(value) => Ok(self.object_children(&value)),
            VariableBacking::Scope { frame_id, kind } => self.scope_variables(frame_id, kind),
        }
    }

    fn continue_(&self, thread_id: Option<i64>) -> Result<ContinueOutcome, Error> {
        let outcome = self.controller.continue_(thread_id)?;
        if outcome.all_threads_continued {
            // Frame scanning starts from a clean slate after a resume.
            self.state
                .lock()
                .expect("state lock poisoned")
                .clear_stop_scoped();
        }
        Ok(outcome)
    }

    fn step(&self, kind: StepKind, thread_id: i64) -> Result<(), Error> {
        self.controller.step(kind, thread_id)?;
        self.state
            .lock()
            .expect("state lock poisoned")
            .clear_stop_scoped();
        Ok(())
    }

    fn pause(&self, thread_id: Option<i64>) -> Result<(), Error> {
        self.controller.pause(thread_id)
    }

    fn evaluate(&self, expression: &str, frame_id: Option<i64>) -> Result<Value, Error> {
        let body = self.controller.evaluate(expression, frame_id)?;
        Ok(body.unwrap_or_else(|| json!({ "result": "", "variablesReference": 0 })))
    }

    /// Tear the session down: fail every pending operation, clear all
    /// registries, disable the channel. Safe to call repeatedly and from
    /// any thread.
    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.terminate_session();
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
