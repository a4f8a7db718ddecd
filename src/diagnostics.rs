use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::content::FileMetadata;

/// How bad a reported problem is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A single problem attached to a path, optionally pinned to a position.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}
impl DiagnosticMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            line: None,
            column: None,
        }
    }
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            line: None,
            column: None,
        }
    }
}

/// How long a named operation took, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationTiming {
    pub operation: String,
    pub duration_ms: u64,
}

/// Everything the engine has to say about one path at one moment: derived
/// content statistics, any problems, and how long the triggering operation
/// took. A report wholly replaces the previous report for its path, so a
/// report with an empty error list clears that path's diagnostics.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    #[serde(default)]
    pub errors: Vec<DiagnosticMessage>,
    #[serde(default)]
    pub timings: Vec<OperationTiming>,
}
impl FileReport {
    /// A report carrying only content statistics (and clearing any errors).
    pub fn stats(metadata: FileMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            errors: Vec::new(),
            timings: Vec::new(),
        }
    }
    /// A report carrying a single problem.
    pub fn problem(diagnostic: DiagnosticMessage) -> Self {
        Self {
            metadata: None,
            errors: vec![diagnostic],
            timings: Vec::new(),
        }
    }
    pub fn with_timing(mut self, operation: impl Into<String>, duration_ms: u64) -> Self {
        self.timings.push(OperationTiming {
            operation: operation.into(),
            duration_ms,
        });
        self
    }
}

/// Where the engine sends its per-path reports. This is a boundary: the
/// engine calls `report` and assumes nothing about what the implementation
/// does with it (an editor might render squiggles, a daemon might serve them
/// over an API, tests just keep them).
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, path: &Path, report: FileReport);
}

/// A sink that forwards reports to the `tracing` infrastructure. This is the
/// default for embedders that don't have anywhere better to put them.
#[derive(Default)]
pub struct TracingSink;
impl DiagnosticsSink for TracingSink {
    fn report(&self, path: &Path, report: FileReport) {
        if report.errors.is_empty() {
            info!(?path, metadata = ?report.metadata, timings = ?report.timings, "file report");
            return;
        }
        for diagnostic in &report.errors {
            match diagnostic.severity {
                Severity::Error => error!(?path, message = %diagnostic.message, "file diagnostic"),
                Severity::Warning => warn!(?path, message = %diagnostic.message, "file diagnostic"),
                Severity::Info => info!(?path, message = %diagnostic.message, "file diagnostic"),
            }
        }
    }
}

/// A sink for embedders that poll (and for tests). [`Self::latest`] is the
/// current report under the replacement semantics; the full history stays
/// queryable because tests often need to count what led up to it.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<HashMap<PathBuf, Vec<FileReport>>>,
}
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
    /// The most recent report for the given path, if any.
    pub fn latest(&self, path: &Path) -> Option<FileReport> {
        self.reports
            .lock()
            .get(path)
            .and_then(|history| history.last().cloned())
    }
    /// Every report ever made for the given path, oldest first. The
    /// replacement semantics apply to *current* state, but tests often want
    /// the history (e.g. counting per-attempt write failures).
    pub fn history(&self, path: &Path) -> Vec<FileReport> {
        self.reports.lock().get(path).cloned().unwrap_or_default()
    }
}
impl DiagnosticsSink for MemorySink {
    fn report(&self, path: &Path, report: FileReport) {
        self.reports
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(report);
    }
}
