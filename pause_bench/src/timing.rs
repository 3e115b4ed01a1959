//! Splitting a measured interval into application and platform time, and
//! persisting the result.
//!
//! Scenarios that measure a plain pod have no application share to subtract;
//! they record the elapsed time only.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One benchmark result. `overhead_time_ms == elapsed_time_ms - application_time_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub elapsed_time_ms: i64,
    pub application_time_ms: i64,
    pub overhead_time_ms: i64,
    /// Set when the application took longer to start than the whole measured
    /// interval, which means the two clocks disagree.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub negative_overhead: bool,
}

impl TimingRecord {
    /// Both durations are truncated to whole milliseconds before subtracting.
    /// The overhead is not clamped.
    pub fn decompose(elapsed: Duration, application: Duration) -> Self {
        Self::from_millis(whole_millis(elapsed), whole_millis(application))
    }

    pub fn from_millis(elapsed_time_ms: i64, application_time_ms: i64) -> Self {
        let overhead_time_ms = elapsed_time_ms - application_time_ms;
        let negative_overhead = overhead_time_ms < 0;
        if negative_overhead {
            warn!(
                elapsed_time_ms,
                application_time_ms,
                "application startup took longer than the measured interval"
            );
        }
        Self {
            elapsed_time_ms,
            application_time_ms,
            overhead_time_ms,
            negative_overhead,
        }
    }
}

/// Time until a pod became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessRecord {
    pub elapsed_time_ms: i64,
}

impl ReadinessRecord {
    pub fn new(elapsed: Duration) -> Self {
        Self {
            elapsed_time_ms: whole_millis(elapsed),
        }
    }
}

/// A line of a results file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunRecord {
    Decomposed(TimingRecord),
    Readiness(ReadinessRecord),
}

impl RunRecord {
    pub fn elapsed_time_ms(&self) -> i64 {
        match self {
            RunRecord::Decomposed(r) => r.elapsed_time_ms,
            RunRecord::Readiness(r) => r.elapsed_time_ms,
        }
    }

    pub fn decomposed(&self) -> Option<&TimingRecord> {
        match self {
            RunRecord::Decomposed(r) => Some(r),
            RunRecord::Readiness(_) => None,
        }
    }
}

impl From<TimingRecord> for RunRecord {
    fn from(record: TimingRecord) -> Self {
        RunRecord::Decomposed(record)
    }
}

impl From<ReadinessRecord> for RunRecord {
    fn from(record: ReadinessRecord) -> Self {
        RunRecord::Readiness(record)
    }
}

fn whole_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Append-only destination of results.
pub trait ResultSink: Send {
    fn append(&mut self, record: &RunRecord) -> anyhow::Result<()>;
}

/// One JSON object per line.
pub struct JsonLinesFile {
    path: Utf8PathBuf,
    file: File,
}

impl JsonLinesFile {
    /// Creates the file, and its directory, if they don't exist yet.
    pub fn open(path: &Utf8Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create directory {dir}"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open results file {path}"))?;
        Ok(Self {
            path: path.to_owned(),
            file,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl ResultSink for JsonLinesFile {
    fn append(&mut self, record: &RunRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(record).context("serialize result")?;
        line.push('\n');
        // A single write keeps concurrent appenders from interleaving lines.
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .with_context(|| format!("append to results file {}", self.path))
    }
}

/// Reads back everything a [`JsonLinesFile`] wrote. Blank lines are skipped.
pub fn read_records(path: &Utf8Path) -> anyhow::Result<Vec<RunRecord>> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read results file {path}"))?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse line {} of {path}", i + 1))
        })
        .collect()
}
