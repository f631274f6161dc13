//! Breakpoint bookkeeping: line, function, exception and data breakpoints.
//!
//! The manager owns normalization and verification results only; condition
//! evaluation happens in the probe, so a syntactically dubious condition is
//! still accepted here.

use crate::engine::state::{SessionState, Source};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Exception filters the engine recognizes out of the box.
pub const EXCEPTION_FILTERS: [&str; 2] = ["raised", "uncaught"];

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpointSpec {
    pub line: i64,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionBreakpointSpec {
    pub name: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpointSpec {
    #[serde(default)]
    pub data_id: Option<String>,
    #[serde(default)]
    pub access_type: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
}

/// Per-item verification outcome returned for every set-* call.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedBreakpoint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

impl VerifiedBreakpoint {
    fn unverified(message: impl Into<String>) -> VerifiedBreakpoint {
        VerifiedBreakpoint {
            id: None,
            verified: false,
            message: Some(message.into()),
            line: None,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataBreakpointInfo {
    pub data_id: Option<String>,
    pub description: String,
    pub access_types: Vec<String>,
    pub can_persist: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineBreakpoint {
    pub id: i64,
    pub line: i64,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
    pub log_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBreakpoint {
    pub id: i64,
    pub name: String,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataBreakpoint {
    pub id: i64,
    pub frame_id: i64,
    pub variable: String,
    pub access_type: Option<String>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

/// Stable data-breakpoint id: `frame:<frameId>:var:<name>`.
pub fn make_data_id(frame_id: i64, name: &str) -> String {
    format!("frame:{frame_id}:var:{name}")
}

/// Parse a data id back into its (frame, variable) parts. Returns `None`
/// for anything that does not follow the `frame:<id>:var:<name>` shape.
pub fn parse_data_id(data_id: &str) -> Option<(i64, &str)> {
    let rest = data_id.strip_prefix("frame:")?;
    let (frame, var) = rest.split_once(":var:")?;
    let frame_id = frame.parse().ok()?;
    Some((frame_id, var))
}

/// Normalize a client-supplied source path into the canonical registry key.
/// Canonicalization resolves symlinks when the file exists; otherwise the
/// path is absolutized and `.`/`..` components are collapsed lexically, so
/// breakpoints in not-yet-created files still land on one key.
fn canonical_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    if let Ok(canonical) = std::fs::canonicalize(p) {
        return canonical;
    }
    let absolute = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    };
    normalize_lexically(&absolute)
}

fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` above the root stays; anything else pops the
                // last real component.
                if !normalized.pop() {
                    normalized.push(component.as_os_str());
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Registry of every breakpoint kind for the current session.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    next_id: i64,
    line: HashMap<PathBuf, Vec<LineBreakpoint>>,
    function: Vec<FunctionBreakpoint>,
    exception_filters: Vec<String>,
    data: Vec<DataBreakpoint>,
}

impl BreakpointManager {
    pub fn new() -> BreakpointManager {
        BreakpointManager {
            next_id: 1,
            ..Default::default()
        }
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Replace the line breakpoints of one source file.
    ///
    /// The new set fully supersedes the previous one for that path; specs
    /// omitted from the call are dropped. A missing `path` verifies nothing
    /// and stores nothing.
    pub fn set_breakpoints(
        &mut self,
        path: Option<&str>,
        specs: &[SourceBreakpointSpec],
    ) -> Vec<VerifiedBreakpoint> {
        let Some(path) = path else {
            return vec![VerifiedBreakpoint::unverified(
                Error::BreakpointPathMissing.to_string(),
            )];
        };
        if path.is_empty() {
            return vec![VerifiedBreakpoint::unverified(
                Error::InvalidBreakpointPath(PathBuf::new()).to_string(),
            )];
        }
        let key = canonical_path(path);

        let mut stored = Vec::with_capacity(specs.len());
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.next_id();
            stored.push(LineBreakpoint {
                id,
                line: spec.line,
                condition: spec.condition.clone(),
                hit_condition: spec.hit_condition.clone(),
                log_message: spec.log_message.clone(),
            });
            // Condition checking is the probe's job; acceptance here is
            // static, so every spec with a resolvable path verifies.
            results.push(VerifiedBreakpoint {
                id: Some(id),
                verified: true,
                message: None,
                line: Some(spec.line),
                source: Some(Source {
                    name: key
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned()),
                    path: Some(key.to_string_lossy().into_owned()),
                }),
            });
        }
        self.line.insert(key, stored);
        results
    }

    pub fn line_breakpoints(&self, path: &str) -> Option<&[LineBreakpoint]> {
        self.line.get(&canonical_path(path)).map(Vec::as_slice)
    }

    /// Replace the whole function-breakpoint set.
    pub fn set_function_breakpoints(
        &mut self,
        specs: &[FunctionBreakpointSpec],
    ) -> Vec<VerifiedBreakpoint> {
        self.function.clear();
        specs
            .iter()
            .map(|spec| {
                let id = self.next_id();
                self.function.push(FunctionBreakpoint {
                    id,
                    name: spec.name.clone(),
                    condition: spec.condition.clone(),
                    hit_condition: spec.hit_condition.clone(),
                });
                VerifiedBreakpoint {
                    id: Some(id),
                    verified: true,
                    message: None,
                    line: None,
                    source: None,
                }
            })
            .collect()
    }

    pub fn function_breakpoints(&self) -> &[FunctionBreakpoint] {
        &self.function
    }

    /// Replace the active exception filters. Recognized filters verify;
    /// unknown ones are reported unverified rather than dropped.
    pub fn set_exception_breakpoints(&mut self, filters: &[String]) -> Vec<VerifiedBreakpoint> {
        self.exception_filters = filters
            .iter()
            .filter(|f| EXCEPTION_FILTERS.contains(&f.as_str()))
            .cloned()
            .collect();
        filters
            .iter()
            .map(|filter| {
                if EXCEPTION_FILTERS.contains(&filter.as_str()) {
                    VerifiedBreakpoint {
                        id: None,
                        verified: true,
                        message: None,
                        line: None,
                        source: None,
                    }
                } else {
                    VerifiedBreakpoint::unverified(format!("unknown exception filter `{filter}`"))
                }
            })
            .collect()
    }

    pub fn exception_filters(&self) -> &[String] {
        &self.exception_filters
    }

    /// Describe a variable as a data-breakpoint target: stable id plus a
    /// snapshot of its current type/value taken from the resolved frame.
    pub fn data_breakpoint_info(
        &self,
        state: &SessionState,
        name: &str,
        frame_id: i64,
    ) -> Result<DataBreakpointInfo, Error> {
        state.frame(frame_id).ok_or(Error::FrameNotFound(frame_id))?;

        // Only locals resolvable right now can be watched; globals are
        // served by the probe on demand and have no cached snapshot.
        let variable = state
            .frame_locals(frame_id)
            .and_then(|locals| locals.iter().find(|v| v.name == name));

        match variable {
            Some(var) => Ok(DataBreakpointInfo {
                data_id: Some(make_data_id(frame_id, name)),
                description: format!(
                    "{name} = {} ({})",
                    var.value,
                    var.type_name.as_deref().unwrap_or("unknown")
                ),
                access_types: vec!["read".into(), "write".into()],
                can_persist: false,
            }),
            None => Ok(DataBreakpointInfo {
                data_id: None,
                description: format!("variable `{name}` is not available in frame {frame_id}"),
                access_types: vec![],
                can_persist: false,
            }),
        }
    }

    /// Replace the data-breakpoint set. Specs with a missing or malformed
    /// `dataId` come back unverified; the rest of the batch is unaffected.
    pub fn set_data_breakpoints(&mut self, specs: &[DataBreakpointSpec]) -> Vec<VerifiedBreakpoint> {
        self.data.clear();
        specs
            .iter()
            .map(|spec| {
                let parsed = spec.data_id.as_deref().and_then(parse_data_id);
                match (parsed, spec.data_id.as_deref()) {
                    (Some((frame_id, variable)), _) => {
                        let id = self.next_id();
                        self.data.push(DataBreakpoint {
                            id,
                            frame_id,
                            variable: variable.to_owned(),
                            access_type: spec.access_type.clone(),
                            condition: spec.condition.clone(),
                            hit_condition: spec.hit_condition.clone(),
                        });
                        VerifiedBreakpoint {
                            id: Some(id),
                            verified: true,
                            message: None,
                            line: None,
                            source: None,
                        }
                    }
                    (None, Some(raw)) => {
                        VerifiedBreakpoint::unverified(format!("malformed data id `{raw}`"))
                    }
                    (None, None) => VerifiedBreakpoint::unverified("data id is missing"),
                }
            })
            .collect()
    }

    pub fn data_breakpoints(&self) -> &[DataBreakpoint] {
        &self.data
    }

    pub fn clear_all(&mut self) {
        self.line.clear();
        self.function.clear();
        self.exception_filters.clear();
        self.data.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::state::{StackFrame, Variable};

    fn manager() -> BreakpointManager {
        BreakpointManager::new()
    }

    fn line_spec(line: i64) -> SourceBreakpointSpec {
        SourceBreakpointSpec {
            line,
            ..Default::default()
        }
    }

    #[test]
    fn second_set_fully_replaces_first() {
        let mut mgr = manager();
        let first = mgr.set_breakpoints(Some("src/app.py"), &[line_spec(3), line_spec(9)]);
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|bp| bp.verified));

        let second = mgr.set_breakpoints(Some("src/app.py"), &[line_spec(20)]);
        assert_eq!(second.len(), 1);

        let stored = mgr.line_breakpoints("src/app.py").unwrap();
        assert_eq!(stored.len(), 1, "old breakpoints accumulated");
        assert_eq!(stored[0].line, 20);
    }

    #[test]
    fn same_file_two_spellings_one_entry() {
        let mut mgr = manager();
        mgr.set_breakpoints(Some("src/app.py"), &[line_spec(1)]);
        // The file does not exist, so the dotted spelling is collapsed
        // lexically rather than through the filesystem.
        mgr.set_breakpoints(Some("./src/../src/app.py"), &[line_spec(2)]);
        let cwd = std::env::current_dir().unwrap();
        let abs = cwd.join("src/app.py");
        mgr.set_breakpoints(Some(abs.to_str().unwrap()), &[line_spec(3)]);
        let stored = mgr.line_breakpoints("src/app.py").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].line, 3);
    }

    #[test]
    fn dotted_spelling_replaces_the_plain_one() {
        let mut mgr = manager();
        mgr.set_breakpoints(Some("sandbox/job.py"), &[line_spec(4)]);
        mgr.set_breakpoints(Some("./sandbox/../sandbox/job.py"), &[line_spec(7)]);
        let stored = mgr.line_breakpoints("sandbox/job.py").unwrap();
        assert_eq!(stored.len(), 1, "two registry entries for one file");
        assert_eq!(stored[0].line, 7);
    }

    #[test]
    fn missing_path_yields_single_failure_and_stores_nothing() {
        let mut mgr = manager();
        let results = mgr.set_breakpoints(None, &[line_spec(1), line_spec(2)]);
        assert_eq!(results.len(), 1);
        assert!(!results[0].verified);
        assert!(results[0].message.is_some());
        assert!(mgr.line_breakpoints("whatever").is_none());
    }

    #[test]
    fn empty_path_is_rejected_without_storing() {
        let mut mgr = manager();
        let results = mgr.set_breakpoints(Some(""), &[line_spec(1)]);
        assert_eq!(results.len(), 1);
        assert!(!results[0].verified);
    }

    #[test]
    fn conditional_breakpoints_are_statically_accepted() {
        let mut mgr = manager();
        let results = mgr.set_breakpoints(
            Some("src/app.py"),
            &[SourceBreakpointSpec {
                line: 5,
                condition: Some("this is (not valid python".into()),
                ..Default::default()
            }],
        );
        assert!(results[0].verified);
    }

    #[test]
    fn function_breakpoints_replace() {
        let mut mgr = manager();
        mgr.set_function_breakpoints(&[FunctionBreakpointSpec {
            name: "main".into(),
            ..Default::default()
        }]);
        mgr.set_function_breakpoints(&[FunctionBreakpointSpec {
            name: "handler".into(),
            ..Default::default()
        }]);
        assert_eq!(mgr.function_breakpoints().len(), 1);
        assert_eq!(mgr.function_breakpoints()[0].name, "handler");
    }

    #[test]
    fn exception_filters_partition_known_and_unknown() {
        let mut mgr = manager();
        let results = mgr.set_exception_breakpoints(&[
            "raised".into(),
            "uncaught".into(),
            "segfault".into(),
        ]);
        assert_eq!(
            results.iter().map(|r| r.verified).collect::<Vec<_>>(),
            vec![true, true, false]
        );
        assert_eq!(mgr.exception_filters(), &["raised", "uncaught"]);
    }

    fn state_with_frame_12() -> SessionState {
        let mut state = SessionState::new();
        state.add_thread(1, "main");
        state.set_stack_frames(
            1,
            vec![StackFrame {
                id: 12,
                name: "work".into(),
                line: 40,
                column: 1,
                source: None,
            }],
        );
        state.set_frame_locals(
            12,
            vec![Variable {
                name: "x".into(),
                value: "123".into(),
                type_name: Some("int".into()),
                variables_reference: 0,
            }],
        );
        state
    }

    #[test]
    fn data_breakpoint_info_snapshots_the_variable() {
        let state = state_with_frame_12();
        let info = manager().data_breakpoint_info(&state, "x", 12).unwrap();
        assert_eq!(info.data_id.as_deref(), Some("frame:12:var:x"));
        assert!(info.description.contains("123"));
        assert!(!info.can_persist);

        let missing = manager().data_breakpoint_info(&state, "y", 12).unwrap();
        assert!(missing.data_id.is_none());
    }

    #[test]
    fn data_breakpoints_verify_per_item() {
        let mut mgr = manager();
        let results = mgr.set_data_breakpoints(&[
            DataBreakpointSpec {
                data_id: Some("frame:12:var:x".into()),
                ..Default::default()
            },
            DataBreakpointSpec {
                data_id: None,
                ..Default::default()
            },
            DataBreakpointSpec {
                data_id: Some("nonsense".into()),
                ..Default::default()
            },
        ]);
        assert_eq!(
            results.iter().map(|r| r.verified).collect::<Vec<_>>(),
            vec![true, false, false]
        );
        assert_eq!(mgr.data_breakpoints().len(), 1);
        assert_eq!(mgr.data_breakpoints()[0].frame_id, 12);
        assert_eq!(mgr.data_breakpoints()[0].variable, "x");
    }

    #[test]
    fn data_id_roundtrip() {
        assert_eq!(parse_data_id("frame:12:var:x"), Some((12, "x")));
        assert_eq!(parse_data_id("frame:12:var:outer:inner"), Some((12, "outer:inner")));
        assert_eq!(parse_data_id("frame:abc:var:x"), None);
        assert_eq!(parse_data_id("var:x"), None);
    }
}
