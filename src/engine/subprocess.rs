//! Detection and rewrite of probe-launchable child processes.
//!
//! The watcher never intercepts process creation itself; the host runtime
//! implements [`ProcessLauncher`] with whatever spawn facility it has. The
//! decision and construction logic here (candidate detection, port
//! allocation, launcher argument building) is pure and testable on its own.

use serde_json::json;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use uuid::Uuid;

/// Default capacity of the child registry.
pub const DEFAULT_CHILD_CAPACITY: usize = 64;

/// Capability interface for actually spawning a process. Implemented by the
/// host environment; swapped per target platform.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, argv: &[String]) -> anyhow::Result<u32>;
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Module name of the adapter's own launcher, inserted via `-m`.
    pub launcher_module: String,
    /// Ports handed to children, cycled with wrap-around.
    pub port_range: RangeInclusive<u16>,
    pub capacity: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        WatcherConfig {
            launcher_module: "tether_launcher".into(),
            port_range: 5890..=5999,
            capacity: DEFAULT_CHILD_CAPACITY,
        }
    }
}

/// How the original command line invoked the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationMode {
    Script(String),
    Module(String),
    Code(String),
}

/// True when `argv` looks like a Python-style interpreter invocation
/// (`python`, `python3`, `python3.11`, optionally `.exe`), judged on the
/// executable's basename.
pub fn is_candidate_command(argv: &[String]) -> bool {
    let Some(program) = argv.first() else {
        return false;
    };
    let basename = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program.as_str());
    interpreter_regex().is_match(basename)
}

fn interpreter_regex() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^python(\d+(\.\d+)?)?(\.exe)?$").expect("static regex")
    })
}

/// Split an interpreter command line into leading interpreter options, the
/// invocation mode and the arguments forwarded to the target.
fn classify_invocation(args: &[String]) -> Option<(Vec<String>, InvocationMode, Vec<String>)> {
    let mut opts = Vec::new();
    let mut iter = args.iter().enumerate();
    while let Some((idx, arg)) = iter.next() {
        match arg.as_str() {
            "-m" => {
                let module = args.get(idx + 1)?.clone();
                return Some((
                    opts,
                    InvocationMode::Module(module),
                    args[idx + 2..].to_vec(),
                ));
            }
            "-c" => {
                let code = args.get(idx + 1)?.clone();
                return Some((opts, InvocationMode::Code(code), args[idx + 2..].to_vec()));
            }
            other if other.starts_with('-') => opts.push(other.to_owned()),
            script => {
                return Some((
                    opts,
                    InvocationMode::Script(script.to_owned()),
                    args[idx + 1..].to_vec(),
                ))
            }
        }
    }
    None
}

/// A detected, instrumented child.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildRecord {
    pub session_id: Uuid,
    pub parent_session_id: Uuid,
    pub port: u16,
    pub target: InvocationMode,
    pub pid: Option<u32>,
}

/// Decision for one observed spawn attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SpawnDecision {
    /// Command is not ours to touch (or the registry is full); run it
    /// exactly as given.
    PassThrough(Vec<String>),
    /// Command was rewritten to run under the adapter launcher.
    Instrument {
        argv: Vec<String>,
        child: ChildRecord,
    },
}

/// Observes spawn attempts, rewrites candidate interpreter invocations to go
/// through the adapter launcher, and keeps a bounded registry of resulting
/// children.
pub struct SubprocessWatcher {
    config: WatcherConfig,
    parent_session_id: Uuid,
    next_port: Mutex<u16>,
    children: Mutex<HashMap<Uuid, ChildRecord>>,
}

impl SubprocessWatcher {
    pub fn new(config: WatcherConfig, parent_session_id: Uuid) -> SubprocessWatcher {
        let first_port = *config.port_range.start();
        SubprocessWatcher {
            config,
            parent_session_id,
            next_port: Mutex::new(first_port),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next IPC port, cycling through the configured range.
    pub fn allocate_port(&self) -> u16 {
        let mut next = self.next_port.lock().expect("port lock poisoned");
        let port = *next;
        *next = if port >= *self.config.port_range.end() {
            *self.config.port_range.start()
        } else {
            port + 1
        };
        port
    }

    /// Decide what to do with one observed spawn attempt.
    pub fn observe_spawn(&self, argv: &[String]) -> SpawnDecision {
        if !is_candidate_command(argv) || self.targets_launcher(argv) {
            return SpawnDecision::PassThrough(argv.to_vec());
        }
        let Some((opts, mode, forwarded)) = classify_invocation(&argv[1..]) else {
            return SpawnDecision::PassThrough(argv.to_vec());
        };

        {
            let children = self.children.lock().expect("children lock poisoned");
            if children.len() >= self.config.capacity {
                log::warn!(
                    target: "engine",
                    "child registry full ({} entries); not instrumenting: {argv:?}",
                    children.len()
                );
                return SpawnDecision::PassThrough(argv.to_vec());
            }
        }

        let port = self.allocate_port();
        let session_id = Uuid::new_v4();
        let child = ChildRecord {
            session_id,
            parent_session_id: self.parent_session_id,
            port,
            target: mode.clone(),
            pid: None,
        };

        let mut rewritten = vec![argv[0].clone()];
        rewritten.extend(opts);
        rewritten.extend([
            "-m".to_owned(),
            self.config.launcher_module.clone(),
            "--port".to_owned(),
            port.to_string(),
            "--session".to_owned(),
            session_id.to_string(),
            "--parent-session".to_owned(),
            self.parent_session_id.to_string(),
        ]);
        match &mode {
            InvocationMode::Script(script) => {
                rewritten.extend(["--program".to_owned(), script.clone()])
            }
            InvocationMode::Module(module) => {
                rewritten.extend(["--module".to_owned(), module.clone()])
            }
            InvocationMode::Code(code) => rewritten.extend(["--code".to_owned(), code.clone()]),
        }
        rewritten.extend(forwarded);

        SpawnDecision::Instrument {
            argv: rewritten,
            child,
        }
    }

    fn targets_launcher(&self, argv: &[String]) -> bool {
        argv.windows(2)
            .any(|w| w[0] == "-m" && w[1] == self.config.launcher_module)
    }

    /// Record an instrumented child once its pid is known. Returns the body
    /// for the upward `childProcess` notification.
    pub fn register_child(&self, mut child: ChildRecord, pid: u32) -> serde_json::Value {
        child.pid = Some(pid);
        let body = child_body(&child);
        self.children
            .lock()
            .expect("children lock poisoned")
            .insert(child.session_id, child);
        body
    }

    /// Drop a child on exit. Returns the `childProcessExited` body when the
    /// child was actually tracked.
    pub fn child_exited(&self, session_id: Uuid) -> Option<serde_json::Value> {
        self.children
            .lock()
            .expect("children lock poisoned")
            .remove(&session_id)
            .map(|child| child_body(&child))
    }

    pub fn tracked_children(&self) -> usize {
        self.children.lock().expect("children lock poisoned").len()
    }
}

fn child_body(child: &ChildRecord) -> serde_json::Value {
    json!({
        "sessionId": child.session_id.to_string(),
        "parentSessionId": child.parent_session_id.to_string(),
        "port": child.port,
        "pid": child.pid,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use itertools::Itertools;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect_vec()
    }

    fn watcher() -> SubprocessWatcher {
        SubprocessWatcher::new(WatcherConfig::default(), Uuid::new_v4())
    }

    #[test]
    fn candidate_detection() {
        for yes in ["python", "python3", "python3.11", "python.exe", "/usr/bin/python3"] {
            assert!(is_candidate_command(&argv(&[yes, "x.py"])), "{yes}");
        }
        for no in ["bash", "pythonish", "node", "python-config"] {
            assert!(!is_candidate_command(&argv(&[no, "x.py"])), "{no}");
        }
        assert!(!is_candidate_command(&[]));
    }

    #[test]
    fn script_invocation_is_rewritten_with_forwarded_args() {
        let w = watcher();
        let decision = w.observe_spawn(&argv(&["python", "child.py", "--name", "alice"]));
        let SpawnDecision::Instrument { argv: rewritten, child } = decision else {
            panic!("expected instrument");
        };

        assert_eq!(rewritten[0], "python");
        let launcher_at = rewritten.iter().position(|a| a == "-m").unwrap();
        assert_eq!(rewritten[launcher_at + 1], "tether_launcher");
        let program_at = rewritten.iter().position(|a| a == "--program").unwrap();
        assert_eq!(rewritten[program_at + 1], "child.py");
        // Original target arguments stay at the tail, in order.
        assert_eq!(&rewritten[rewritten.len() - 2..], &["--name", "alice"]);
        assert_eq!(child.target, InvocationMode::Script("child.py".into()));
    }

    #[test]
    fn module_invocation_keeps_module_marker() {
        let w = watcher();
        let decision = w.observe_spawn(&argv(&["python", "-m", "http.server", "8000"]));
        let SpawnDecision::Instrument { argv: rewritten, .. } = decision else {
            panic!("expected instrument");
        };
        let module_at = rewritten.iter().position(|a| a == "--module").unwrap();
        assert_eq!(rewritten[module_at + 1], "http.server");
        assert_eq!(rewritten.last().unwrap(), "8000");
        assert!(!rewritten.iter().any(|a| a == "--program"));
    }

    #[test]
    fn code_invocation_keeps_code_marker() {
        let w = watcher();
        let decision = w.observe_spawn(&argv(&["python3", "-c", "print(1)"]));
        let SpawnDecision::Instrument { argv: rewritten, .. } = decision else {
            panic!("expected instrument");
        };
        let code_at = rewritten.iter().position(|a| a == "--code").unwrap();
        assert_eq!(rewritten[code_at + 1], "print(1)");
    }

    #[test]
    fn non_python_commands_pass_through_unmodified() {
        let w = watcher();
        let original = argv(&["bash", "-lc", "echo hi"]);
        assert_eq!(
            w.observe_spawn(&original),
            SpawnDecision::PassThrough(original.clone())
        );
    }

    #[test]
    fn launcher_invocations_are_not_rewrapped() {
        let w = watcher();
        let original = argv(&["python", "-m", "tether_launcher", "--port", "5890"]);
        assert_eq!(
            w.observe_spawn(&original),
            SpawnDecision::PassThrough(original.clone())
        );
    }

    #[test]
    fn interpreter_options_are_preserved_before_launcher() {
        let w = watcher();
        let decision = w.observe_spawn(&argv(&["python", "-u", "app.py"]));
        let SpawnDecision::Instrument { argv: rewritten, .. } = decision else {
            panic!("expected instrument");
        };
        let u_at = rewritten.iter().position(|a| a == "-u").unwrap();
        let m_at = rewritten.iter().position(|a| a == "-m").unwrap();
        assert!(u_at < m_at);
    }

    #[test]
    fn ports_cycle_through_the_range() {
        let config = WatcherConfig {
            port_range: 6000..=6002,
            ..Default::default()
        };
        let w = SubprocessWatcher::new(config, Uuid::new_v4());
        let ports: Vec<u16> = (0..5).map(|_| w.allocate_port()).collect();
        assert_eq!(ports, vec![6000, 6001, 6002, 6000, 6001]);
    }

    #[test]
    fn registry_capacity_bounds_instrumentation() {
        let config = WatcherConfig {
            capacity: 1,
            ..Default::default()
        };
        let w = SubprocessWatcher::new(config, Uuid::new_v4());

        let first = w.observe_spawn(&argv(&["python", "a.py"]));
        let SpawnDecision::Instrument { child, .. } = first else {
            panic!("expected instrument");
        };
        w.register_child(child, 100);
        assert_eq!(w.tracked_children(), 1);

        // Full registry: the spawn still happens, just untouched.
        let second = w.observe_spawn(&argv(&["python", "b.py"]));
        assert!(matches!(second, SpawnDecision::PassThrough(_)));
    }

    #[test]
    fn child_exit_reports_only_tracked_children() {
        let w = watcher();
        let SpawnDecision::Instrument { child, .. } =
            w.observe_spawn(&argv(&["python", "a.py"]))
        else {
            panic!("expected instrument");
        };
        let id = child.session_id;
        w.register_child(child, 42);

        let body = w.child_exited(id).unwrap();
        assert_eq!(body["pid"], 42);
        assert!(w.child_exited(id).is_none());
        assert!(w.child_exited(Uuid::new_v4()).is_none());
    }
}
