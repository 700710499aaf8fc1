//! Phase timing with per-thread stacks.
//!
//! `events` keep arrival order so nesting can be reconstructed from depth and
//! thread; only the cumulative rollup is sorted.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::io::fs_util::write_canonical_json;
use crate::io::runner::utc_timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub phase: String,
    pub thread: String,
    pub depth: usize,
    pub start_s: f64,
    pub end_s: f64,
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRollup {
    pub phase: String,
    pub count: u64,
    pub total_s: f64,
    pub min_s: f64,
    pub max_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub run_started_utc: String,
    pub total_runtime_s: f64,
    pub cumulative: Vec<PhaseRollup>,
    pub events: Vec<PhaseEvent>,
}

struct OpenPhase {
    name: String,
    started: Instant,
    meta: Option<Value>,
}

#[derive(Default)]
struct ProfilerState {
    stacks: HashMap<ThreadId, Vec<OpenPhase>>,
    thread_labels: HashMap<ThreadId, String>,
    events: Vec<PhaseEvent>,
}

impl ProfilerState {
    fn label(&mut self, id: ThreadId) -> String {
        let next = self.thread_labels.len();
        self.thread_labels
            .entry(id)
            .or_insert_with(|| format!("t{next}"))
            .clone()
    }
}

pub struct Profiler {
    started: Instant,
    run_started_utc: String,
    state: Mutex<ProfilerState>,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            run_started_utc: utc_timestamp(),
            state: Mutex::new(ProfilerState::default()),
        }
    }

    pub fn start_phase(&self, name: &str, meta: Option<Value>) {
        let id = thread::current().id();
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.label(id);
        state.stacks.entry(id).or_default().push(OpenPhase {
            name: name.to_string(),
            started: Instant::now(),
            meta,
        });
    }

    /// Close the innermost open phase called `name` on this thread.
    ///
    /// Returns the phase duration, or `None` when no such phase is open.
    pub fn end_phase(&self, name: &str, meta: Option<Value>) -> Option<f64> {
        let id = thread::current().id();
        let ended = Instant::now();
        let mut state = self.state.lock().ok()?;
        let thread = state.label(id);
        let stack = state.stacks.entry(id).or_default();
        let Some(index) = stack.iter().rposition(|open| open.name == name) else {
            warn!(phase = name, "end_phase without matching start_phase");
            return None;
        };
        let open = stack.remove(index);
        let depth = index;
        let meta = merge_meta(open.meta, meta);
        let start_s = round_micros(open.started.duration_since(self.started).as_secs_f64());
        let end_s = round_micros(ended.duration_since(self.started).as_secs_f64());
        let duration_s = round_micros(ended.duration_since(open.started).as_secs_f64());
        state.events.push(PhaseEvent {
            phase: name.to_string(),
            thread,
            depth,
            start_s,
            end_s,
            duration_s,
            meta,
        });
        Some(duration_s)
    }

    /// Run `f` inside a phase.
    pub fn time<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        self.start_phase(name, None);
        let out = f();
        self.end_phase(name, None);
        out
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let events = self
            .state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default();
        let mut rollups: BTreeMap<String, PhaseRollup> = BTreeMap::new();
        for event in &events {
            let rollup = rollups
                .entry(event.phase.clone())
                .or_insert_with(|| PhaseRollup {
                    phase: event.phase.clone(),
                    count: 0,
                    total_s: 0.0,
                    min_s: f64::MAX,
                    max_s: 0.0,
                });
            rollup.count += 1;
            rollup.total_s += event.duration_s;
            rollup.min_s = rollup.min_s.min(event.duration_s);
            rollup.max_s = rollup.max_s.max(event.duration_s);
        }
        let cumulative = rollups
            .into_values()
            .map(|mut rollup| {
                rollup.total_s = round_micros(rollup.total_s);
                rollup
            })
            .collect();
        ProfileSnapshot {
            run_started_utc: self.run_started_utc.clone(),
            total_runtime_s: round_micros(self.started.elapsed().as_secs_f64()),
            cumulative,
            events,
        }
    }

    /// Write the snapshot (plus `extra` under `"extra"`) as canonical JSON.
    pub fn export_json(&self, path: &Path, extra: Option<Value>) -> Result<()> {
        let mut value = serde_json::to_value(self.snapshot())?;
        if let (Some(extra), Some(object)) = (extra, value.as_object_mut()) {
            object.insert("extra".to_string(), extra);
        }
        write_canonical_json(path, &value)
    }
}

fn merge_meta(start: Option<Value>, end: Option<Value>) -> Option<Value> {
    match (start, end) {
        (Some(Value::Object(mut a)), Some(Value::Object(b))) => {
            a.extend(b);
            Some(Value::Object(a))
        }
        (_, Some(end)) => Some(end),
        (start, None) => start,
    }
}

fn round_micros(seconds: f64) -> f64 {
    (seconds * 1_000_000.0).round() / 1_000_000.0
}
