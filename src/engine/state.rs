//! Authoritative in-memory registry for the current run: threads, stack
//! frames, variable-reference handles. Mutated by inbound probe events,
//! read by outbound client requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

/// First id handed out to pseudo-threads (lightweight concurrent units the
/// probe surfaces as threads). Real OS threads get small integers; the two
/// ranges must never collide, even across session restarts in one process.
pub const PSEUDO_THREAD_ID_BASE: i64 = 1_000_000_000;

/// First id handed out to pseudo-thread stack frames; disjoint from both
/// real frame ids and the pseudo-thread range.
pub const PSEUDO_FRAME_ID_BASE: i64 = 2_000_000_000;

static NEXT_PSEUDO_THREAD_ID: AtomicI64 = AtomicI64::new(PSEUDO_THREAD_ID_BASE);
static NEXT_PSEUDO_FRAME_ID: AtomicI64 = AtomicI64::new(PSEUDO_FRAME_ID_BASE);

/// Allocate a pseudo-thread id. The counter is process-global and never
/// reset, so ids stay unique across restarts.
pub fn alloc_pseudo_thread_id() -> i64 {
    NEXT_PSEUDO_THREAD_ID.fetch_add(1, Ordering::SeqCst)
}

/// Allocate a pseudo-frame id from the reserved high range.
pub fn alloc_pseudo_frame_id() -> i64 {
    NEXT_PSEUDO_FRAME_ID.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Source {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    pub line: i64,
    pub column: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

/// Variable record as reported to the client. `variables_reference` 0 means
/// the value has no children to expand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
}

/// Scope selector inside one frame.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::Display,
    strum_macros::AsRefStr,
    strum_macros::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Locals,
    Globals,
}

/// Backing storage behind a variable-reference handle.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableBacking {
    /// A single opaque structured value; children are derived from its
    /// fields/elements on demand.
    Object(Value),
    /// A (frame, scope) pair; children come from the probe.
    Scope { frame_id: i64, kind: ScopeKind },
    /// A precomputed, ordered variable list.
    List(Vec<Variable>),
}

/// Registry of the session's live entities.
///
/// Variable-reference ids are monotonically increasing and never reused
/// within a session: [`SessionState::clear_all`] zeroes the registries but
/// deliberately leaves the allocation counter alone, so references issued
/// after a resume can never collide with stale ones a client still holds.
#[derive(Debug, Default)]
pub struct SessionState {
    threads: BTreeMap<i64, ThreadInfo>,
    /// Probe-local key of each lightweight unit surfaced as a pseudo-thread,
    /// mapped to the engine-allocated id from the reserved range.
    pseudo_threads: HashMap<String, i64>,
    frames: HashMap<i64, Vec<StackFrame>>,
    frame_locals: HashMap<i64, Vec<Variable>>,
    var_refs: HashMap<i64, VariableBacking>,
    next_var_ref: i64,
}

impl SessionState {
    pub fn new() -> SessionState {
        SessionState {
            next_var_ref: 1,
            ..Default::default()
        }
    }

    pub fn add_thread(&mut self, id: i64, name: impl Into<String>) {
        self.threads.insert(
            id,
            ThreadInfo {
                id,
                name: name.into(),
            },
        );
    }

    pub fn remove_thread(&mut self, id: i64) -> Option<ThreadInfo> {
        self.frames.remove(&id);
        self.threads.remove(&id)
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.threads.values().cloned().collect()
    }

    pub fn thread(&self, id: i64) -> Option<&ThreadInfo> {
        self.threads.get(&id)
    }

    /// Register a probe-reported lightweight unit under its probe-local key,
    /// allocating an id from the reserved pseudo range on first sight. A
    /// repeated start for the same key keeps the id stable.
    pub fn ensure_pseudo_thread(&mut self, key: &str, name: impl Into<String>) -> i64 {
        let id = match self.pseudo_threads.get(key) {
            Some(&id) => id,
            None => {
                let id = alloc_pseudo_thread_id();
                self.pseudo_threads.insert(key.to_owned(), id);
                id
            }
        };
        self.add_thread(id, name);
        id
    }

    pub fn remove_pseudo_thread(&mut self, key: &str) -> Option<ThreadInfo> {
        let id = self.pseudo_threads.remove(key)?;
        self.remove_thread(id)
    }

    /// Engine id previously allocated for a probe-local key.
    pub fn pseudo_thread_id(&self, key: &str) -> Option<i64> {
        self.pseudo_threads.get(key).copied()
    }

    /// Probe-local key behind a pseudo-thread id, if `id` is one.
    pub fn pseudo_thread_key(&self, id: i64) -> Option<&str> {
        self.pseudo_threads
            .iter()
            .find_map(|(key, &i)| (i == id).then_some(key.as_str()))
    }

    pub fn set_stack_frames(&mut self, thread_id: i64, frames: Vec<StackFrame>) {
        self.frames.insert(thread_id, frames);
    }

    pub fn stack_frames(&self, thread_id: i64) -> Option<&[StackFrame]> {
        self.frames.get(&thread_id).map(Vec::as_slice)
    }

    /// Find a frame by id across all threads.
    pub fn frame(&self, frame_id: i64) -> Option<&StackFrame> {
        self.frames
            .values()
            .flat_map(|frames| frames.iter())
            .find(|frame| frame.id == frame_id)
    }

    /// Cache the probe-reported locals of a frame (used by data-breakpoint
    /// info and scope reuse within one stop).
    pub fn set_frame_locals(&mut self, frame_id: i64, variables: Vec<Variable>) {
        self.frame_locals.insert(frame_id, variables);
    }

    pub fn frame_locals(&self, frame_id: i64) -> Option<&[Variable]> {
        self.frame_locals.get(&frame_id).map(Vec::as_slice)
    }

    /// Allocate a fresh variable-reference handle. Never returns 0 (the
    /// reserved "no children" value) and never reuses an id.
    pub fn allocate_variable_reference(&mut self, backing: VariableBacking) -> i64 {
        let id = self.next_var_ref;
        self.next_var_ref += 1;
        self.var_refs.insert(id, backing);
        id
    }

    /// Reference for a (frame, scope) pair, reusing the handle issued
    /// earlier within the same stop if there is one.
    pub fn scope_reference(&mut self, frame_id: i64, kind: ScopeKind) -> i64 {
        let existing = self.var_refs.iter().find_map(|(id, backing)| match backing {
            VariableBacking::Scope {
                frame_id: f,
                kind: k,
            } if *f == frame_id && *k == kind => Some(*id),
            _ => None,
        });
        existing.unwrap_or_else(|| {
            self.allocate_variable_reference(VariableBacking::Scope { frame_id, kind })
        })
    }

    pub fn resolve_variable_reference(&self, id: i64) -> Option<&VariableBacking> {
        self.var_refs.get(&id)
    }

    /// Drop everything issued during the current stop/run. Counters are kept
    /// so new ids never collide with ones issued before the clear.
    pub fn clear_all(&mut self) {
        self.threads.clear();
        self.pseudo_threads.clear();
        self.frames.clear();
        self.frame_locals.clear();
        self.var_refs.clear();
    }

    /// Invalidate stop-scoped data (frames, locals, variable references) on
    /// resume, keeping the thread registry alive.
    pub fn clear_stop_scoped(&mut self) {
        self.frames.clear();
        self.frame_locals.clear();
        self.var_refs.clear();
    }
}
