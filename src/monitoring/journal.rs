//! Lifecycle Journal
//!
//! Records every manifest, pipeline, tool, and stage lifecycle event of a
//! run and emits each one as a machine-parsable log line.
//!
//! The line format is space-separated `key=value` tokens:
//!
//! ```text
//! level=info timestamp=1700000000000 pipeline=build stage=compile event=started
//! ```
//!
//! Existing consumers parse these lines with grep/awk, so the token order
//! and spelling must not change.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{error, info};

/// Severity of a journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

/// Lifecycle transition named by a record's `event=` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A manifest load was requested
    Requested,
    /// A manifest could not be read or interpreted
    LoadingFailed,
    /// A pipeline or stage began executing
    Started,
    /// A pipeline or stage completed without failure
    Succeeded,
    /// A stage predicate was falsy; the script never ran
    Skipped,
    /// A pipeline or stage failed
    Failed,
    /// A tool instance became available to a pipeline
    Imported,
    /// A pipeline's environment was built
    EnvironmentLoaded,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::LoadingFailed => "loading-failed",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::Imported => "imported",
            Self::EnvironmentLoaded => "environment-loaded",
        }
    }
}

/// The subject a record describes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Manifest { path: String },
    Pipeline { pipeline: String },
    Tool { pipeline: String, tool: String },
    Stage { pipeline: String, stage: String },
}

/// A single journal record.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub level: Level,
    /// Unix epoch milliseconds
    pub timestamp: i64,
    pub scope: Scope,
    pub event: EventKind,
}

impl Record {
    /// Pipeline name of the record's scope, if it has one.
    pub fn pipeline(&self) -> Option<&str> {
        match &self.scope {
            Scope::Manifest { .. } => None,
            Scope::Pipeline { pipeline }
            | Scope::Tool { pipeline, .. }
            | Scope::Stage { pipeline, .. } => Some(pipeline),
        }
    }

    /// Stage name of the record's scope, if it has one.
    pub fn stage(&self) -> Option<&str> {
        match &self.scope {
            Scope::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "level={} timestamp={} ",
            self.level.as_str(),
            self.timestamp
        )?;

        match &self.scope {
            Scope::Manifest { path } => write!(f, "manifest={}", path)?,
            Scope::Pipeline { pipeline } => write!(f, "pipeline={}", pipeline)?,
            Scope::Tool { pipeline, tool } => {
                write!(f, "pipeline={} tool={}", pipeline, tool)?
            }
            Scope::Stage { pipeline, stage } => {
                write!(f, "pipeline={} stage={}", pipeline, stage)?
            }
        }

        write!(f, " event={}", self.event.as_str())
    }
}

/// Shared, run-scoped event journal.
///
/// Cloning is cheap; all clones append to the same record list. Every
/// recorded event is also emitted through the `log` facade so that normal
/// logger configuration produces the parsable line stream.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    records: Arc<Mutex<Vec<Record>>>,
}

impl Journal {
    /// Creates an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and emits it as a log line.
    pub fn record(&self, level: Level, scope: Scope, event: EventKind) {
        let record = Record {
            level,
            timestamp: Utc::now().timestamp_millis(),
            scope,
            event,
        };

        match level {
            Level::Info => info!("{}", record),
            Level::Error => error!("{}", record),
        }

        self.lock().push(record);
    }

    /// Records a manifest-scoped event.
    pub fn manifest(&self, path: &str, event: EventKind) {
        self.record(
            Level::Info,
            Scope::Manifest {
                path: path.to_string(),
            },
            event,
        );
    }

    /// Records a pipeline-scoped event.
    pub fn pipeline(&self, pipeline: &str, level: Level, event: EventKind) {
        self.record(
            level,
            Scope::Pipeline {
                pipeline: pipeline.to_string(),
            },
            event,
        );
    }

    /// Records a tool import for a pipeline.
    pub fn tool_imported(&self, pipeline: &str, tool: &str) {
        self.record(
            Level::Info,
            Scope::Tool {
                pipeline: pipeline.to_string(),
                tool: tool.to_string(),
            },
            EventKind::Imported,
        );
    }

    /// Records a stage-scoped event.
    pub fn stage(&self, pipeline: &str, stage: &str, level: Level, event: EventKind) {
        self.record(
            level,
            Scope::Stage {
                pipeline: pipeline.to_string(),
                stage: stage.to_string(),
            },
            event,
        );
    }

    /// Returns a snapshot of all records in emission order.
    pub fn records(&self) -> Vec<Record> {
        self.lock().clone()
    }

    /// Returns all records for a given event kind.
    pub fn with_event(&self, event: EventKind) -> Vec<Record> {
        self.lock()
            .iter()
            .filter(|r| r.event == event)
            .cloned()
            .collect()
    }

    /// Returns all records describing the named stage.
    pub fn for_stage(&self, stage: &str) -> Vec<Record> {
        self.lock()
            .iter()
            .filter(|r| r.stage() == Some(stage))
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Record>> {
        // A poisoned journal still holds valid records; keep going.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_line_format() {
        let record = Record {
            level: Level::Info,
            timestamp: 1700000000000,
            scope: Scope::Manifest {
                path: "./deploy.yaml".to_string(),
            },
            event: EventKind::Requested,
        };

        assert_eq!(
            record.to_string(),
            "level=info timestamp=1700000000000 manifest=./deploy.yaml event=requested"
        );
    }

    #[test]
    fn test_stage_line_format() {
        let record = Record {
            level: Level::Error,
            timestamp: 42,
            scope: Scope::Stage {
                pipeline: "build".to_string(),
                stage: "compile".to_string(),
            },
            event: EventKind::Failed,
        };

        assert_eq!(
            record.to_string(),
            "level=error timestamp=42 pipeline=build stage=compile event=failed"
        );
    }

    #[test]
    fn test_tool_line_format() {
        let record = Record {
            level: Level::Info,
            timestamp: 7,
            scope: Scope::Tool {
                pipeline: "build".to_string(),
                tool: "git".to_string(),
            },
            event: EventKind::Imported,
        };

        assert_eq!(
            record.to_string(),
            "level=info timestamp=7 pipeline=build tool=git event=imported"
        );
    }

    #[test]
    fn test_loading_failed_spelling() {
        assert_eq!(EventKind::LoadingFailed.as_str(), "loading-failed");
        assert_eq!(EventKind::EnvironmentLoaded.as_str(), "environment-loaded");
    }

    #[test]
    fn test_journal_records_in_order() {
        let journal = Journal::new();
        journal.manifest("m.yaml", EventKind::Requested);
        journal.pipeline("p", Level::Info, EventKind::Started);
        journal.stage("p", "s", Level::Info, EventKind::Skipped);

        let records = journal.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].event, EventKind::Requested);
        assert_eq!(records[1].event, EventKind::Started);
        assert_eq!(records[2].event, EventKind::Skipped);
    }

    #[test]
    fn test_journal_clones_share_records() {
        let journal = Journal::new();
        let clone = journal.clone();

        clone.pipeline("p", Level::Info, EventKind::Started);
        assert_eq!(journal.records().len(), 1);
    }

    #[test]
    fn test_journal_stage_filter() {
        let journal = Journal::new();
        journal.stage("p", "a", Level::Info, EventKind::Started);
        journal.stage("p", "a", Level::Info, EventKind::Succeeded);
        journal.stage("p", "b", Level::Info, EventKind::Skipped);

        assert_eq!(journal.for_stage("a").len(), 2);
        assert_eq!(journal.for_stage("b").len(), 1);
        assert_eq!(journal.with_event(EventKind::Skipped).len(), 1);
    }

    #[test]
    fn test_record_scope_accessors() {
        let record = Record {
            level: Level::Info,
            timestamp: 0,
            scope: Scope::Stage {
                pipeline: "p".to_string(),
                stage: "s".to_string(),
            },
            event: EventKind::Started,
        };

        assert_eq!(record.pipeline(), Some("p"));
        assert_eq!(record.stage(), Some("s"));
    }
}
