//! Live product log for gate runs.
//!
//! Separate from `tracing`: these lines are the orchestrator's user-facing
//! progress output and ignore `RUST_LOG`. With `trace` on, each event is one
//! canonical JSON object per line on stdout; otherwise a compact
//! `[xstack] <event> k=v` line on stderr, leaving stdout to the summary.

use std::io::Write;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::canonical::canonical_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEvent {
    PhaseStart,
    PhaseEnd,
    PlanSummary,
    PlanExplain,
    CacheHit,
    CacheMiss,
    ProfileSummary,
    FailureSummary,
    EscalationTrigger,
}

impl LiveEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhaseStart => "phase_start",
            Self::PhaseEnd => "phase_end",
            Self::PlanSummary => "plan_summary",
            Self::PlanExplain => "plan_explain",
            Self::CacheHit => "cache_hit",
            Self::CacheMiss => "cache_miss",
            Self::ProfileSummary => "profile_summary",
            Self::FailureSummary => "failure_summary",
            Self::EscalationTrigger => "escalation_trigger",
        }
    }
}

pub struct LiveLog {
    trace: bool,
    sink: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for LiveLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveLog").field("trace", &self.trace).finish()
    }
}

impl LiveLog {
    /// Terminal log: JSON events on stdout, human lines on stderr.
    pub fn console(trace: bool) -> Self {
        if trace {
            Self::with_sink(true, Box::new(std::io::stdout()))
        } else {
            Self::with_sink(false, Box::new(std::io::stderr()))
        }
    }

    pub fn with_sink(trace: bool, sink: Box<dyn Write + Send>) -> Self {
        Self {
            trace,
            sink: Mutex::new(sink),
        }
    }

    /// A log that discards everything.
    pub fn silent() -> Self {
        Self::with_sink(false, Box::new(std::io::sink()))
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    /// Emit `event` with `fields` (a JSON object; other values are ignored).
    pub fn emit(&self, event: LiveEvent, fields: Value) {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let line = if self.trace {
            trace_line(event, fields)
        } else {
            human_line(event, &fields)
        };
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        if let Err(err) = writeln!(sink, "{line}").and_then(|()| sink.flush()) {
            warn!(err = %err, "live log write failed");
        }
    }
}

fn trace_line(event: LiveEvent, mut fields: Map<String, Value>) -> String {
    fields.insert("event".to_string(), Value::String(event.as_str().to_string()));
    let value = Value::Object(fields);
    canonical_json(&value).unwrap_or_else(|_| value.to_string())
}

fn human_line(event: LiveEvent, fields: &Map<String, Value>) -> String {
    let mut line = format!("[xstack] {}", event.as_str());
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();
    for key in keys {
        let rendered = match &fields[key] {
            Value::String(text) => text.clone(),
            Value::Null => continue,
            other => other.to_string(),
        };
        line.push_str(&format!(" {key}={rendered}"));
    }
    line
}
