//! Read-only job registry backed by a JSON file.
//!
//! The file is either a bare list or `{"jobs": [...]}` of entries like
//! `{"id": "df", "label": "Disk usage", "cmd": ["df", "-h", "[label]"], "style": "table"}`.
//! Lookups happen once per run, at execution time, so a reload takes effect
//! for the next run of every task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ExecError, Result};

/// An external job definition: an argv template plus presentation hints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: String,
    pub label: String,
    pub cmd: Vec<String>,
    pub style: String,
}

impl Job {
    /// Expand placeholders in every argv token for a run of `task_name`.
    ///
    /// `[label]`, `[style]`, `[task_name]` and their `{…}` spellings are
    /// replaced in one left-to-right pass; substituted text is never scanned
    /// again, so a label containing `[style]` stays literal. Unknown
    /// bracketed words are left as they are.
    pub fn render_argv(&self, task_name: &str) -> Vec<String> {
        self.cmd
            .iter()
            .map(|token| {
                substitute(token, |name| match name {
                    "label" => Some(self.label.as_str()),
                    "style" => Some(self.style.as_str()),
                    "task_name" => Some(task_name),
                    _ => None,
                })
            })
            .collect()
    }
}

/// Single-pass `[name]` / `{name}` substitution.
pub(crate) fn substitute<'a>(token: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(token.len());
    let mut rest = token;
    while let Some(pos) = rest.find(['[', '{']) {
        out.push_str(&rest[..pos]);
        let open = rest.as_bytes()[pos];
        let close = if open == b'[' { ']' } else { '}' };
        let after = &rest[pos + 1..];
        match after.find(close) {
            Some(end) => match lookup(&after[..end]) {
                Some(value) => {
                    out.push_str(value);
                    rest = &after[end + 1..];
                }
                None => {
                    out.push(open as char);
                    rest = after;
                }
            },
            None => {
                out.push_str(&rest[pos..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Thread-safe job lookup with atomic whole-file reloads.
pub struct JobRegistry {
    path: PathBuf,
    jobs: RwLock<Arc<HashMap<String, Arc<Job>>>>,
    last_error: RwLock<Option<String>>,
}

impl JobRegistry {
    /// Load the registry from `path`.
    ///
    /// A missing or malformed file yields an empty registry and records the
    /// problem in [`last_error`](Self::last_error); runs then fail with
    /// `JobNotFound` until a reload succeeds.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let registry = Self {
            path: path.as_ref().to_path_buf(),
            jobs: RwLock::new(Arc::new(HashMap::new())),
            last_error: RwLock::new(None),
        };
        if let Err(e) = registry.reload() {
            warn!(path = %registry.path.display(), "job registry empty: {e}");
        }
        registry
    }

    /// Build a registry from in-memory jobs (no backing file).
    pub fn from_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        let map = jobs
            .into_iter()
            .map(|job| (job.id.clone(), Arc::new(job)))
            .collect();
        Self {
            path: PathBuf::new(),
            jobs: RwLock::new(Arc::new(map)),
            last_error: RwLock::new(None),
        }
    }

    /// Re-read the backing file and swap in the new map.
    ///
    /// On failure the previous map stays in place and the error is kept for
    /// [`last_error`](Self::last_error).
    pub fn reload(&self) -> Result<usize> {
        let result = std::fs::read_to_string(&self.path)
            .map_err(|e| ExecError::Io(format!("{}: {e}", self.path.display())))
            .and_then(|text| parse_jobs(&text));

        match result {
            Ok(jobs) => {
                let count = jobs.len();
                let map = jobs
                    .into_iter()
                    .map(|job| (job.id.clone(), Arc::new(job)))
                    .collect();
                *self.jobs.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);
                *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = None;
                info!(path = %self.path.display(), count, "job registry loaded");
                Ok(count)
            }
            Err(e) => {
                *self.last_error.write().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub fn resolve(&self, id: &str) -> Result<Arc<Job>> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| ExecError::JobNotFound(id.to_string()))
    }

    /// All jobs, sorted by id.
    pub fn list(&self) -> Vec<Arc<Job>> {
        let mut jobs: Vec<_> = self.snapshot().values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Error from the most recent failed load, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn snapshot(&self) -> Arc<HashMap<String, Arc<Job>>> {
        Arc::clone(&self.jobs.read().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Parse registry JSON. Entries without an id (or label to fall back on) or
/// without an array `cmd` are skipped with a warning.
pub fn parse_jobs(text: &str) -> Result<Vec<Job>> {
    let data: Value = serde_json::from_str(text)
        .map_err(|e| ExecError::Io(format!("invalid job file: {e}")))?;
    let items = match data {
        Value::Object(mut obj) if obj.contains_key("jobs") => obj.remove("jobs").unwrap_or_default(),
        other => other,
    };
    let Value::Array(items) = items else {
        return Err(ExecError::Io(
            "job file must be a list or {\"jobs\": [...]}".into(),
        ));
    };

    let mut jobs = Vec::with_capacity(items.len());
    for (index, raw) in items.iter().enumerate() {
        match parse_entry(raw) {
            Some(job) => jobs.push(job),
            None => warn!(index, "skipping job entry without id or cmd array"),
        }
    }
    Ok(jobs)
}

fn parse_entry(raw: &Value) -> Option<Job> {
    let obj = raw.as_object()?;
    let text = |key: &str| -> String {
        match obj.get(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    };
    let label = text("label");
    let id = match text("id") {
        id if !id.is_empty() => id,
        _ if !label.is_empty() => label.clone(),
        _ => return None,
    };
    let cmd = obj
        .get("cmd")?
        .as_array()?
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    Some(Job {
        label: if label.is_empty() { id.clone() } else { label },
        id,
        cmd,
        style: text("style"),
    })
}
