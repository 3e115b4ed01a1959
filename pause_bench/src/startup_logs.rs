//! Recovering the database's own startup time from container logs.
//!
//! The log source prefixes every line with an RFC 3339 timestamp of when the
//! line was emitted. Two lines matter: the one announcing that the process
//! started, and the one announcing that the CQL server is serving. The
//! difference between their timestamps is the time the database spent starting
//! up, regardless of how long the platform took to get it scheduled.
//!
//! A container that restarted logs the markers more than once; only the first
//! occurrence of each marker counts.

use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use regex::Regex;

/// The RFC 3339 timestamp prepended by the log source, captured as group 1,
/// followed by the log level and ScyllaDB's own timestamp.
const LOG_PREFIX: &str = r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))\s+INFO\s+\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}(?:,\d+)? ";

const SCYLLA_PROCESS_START: &str = r"starting ScyllaDB\.{3}";
const SCYLLA_SERVING_START: &str = r"\[shard \d+:main\] init - serving";

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("no process start marker found in the logs")]
    MissingProcessStart,
    #[error("no serving start marker found in the logs")]
    MissingServingStart,
    #[error("malformed timestamp {timestamp:?}")]
    MalformedTimestamp {
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("serving started at {serving_start} before the process started at {process_start}")]
    InvertedWindow {
        process_start: DateTime<FixedOffset>,
        serving_start: DateTime<FixedOffset>,
    },
    #[error("no members to compute a startup duration for")]
    EmptyGroup,
    #[error("every member started serving the instant its process started")]
    ZeroStartup,
}

/// The two log lines that delimit a startup. Both patterns must capture the
/// source timestamp as their first group.
#[derive(Debug, Clone)]
pub struct StartupMarkers {
    process_start: Regex,
    serving_start: Regex,
}

impl StartupMarkers {
    /// Builds markers out of the message patterns, which are matched after the
    /// usual log prefix.
    pub fn new(process_start: &str, serving_start: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            process_start: Regex::new(&format!("{LOG_PREFIX}{process_start}"))?,
            serving_start: Regex::new(&format!("{LOG_PREFIX}{serving_start}"))?,
        })
    }

    pub fn scylla() -> Self {
        Self::new(SCYLLA_PROCESS_START, SCYLLA_SERVING_START)
            .expect("ScyllaDB startup markers are valid regexes")
    }
}

impl Default for StartupMarkers {
    fn default() -> Self {
        Self::scylla()
    }
}

/// Process start and serving start of one member. Serving never starts
/// before the process does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberLogWindow {
    process_start: DateTime<FixedOffset>,
    serving_start: DateTime<FixedOffset>,
}

impl MemberLogWindow {
    pub fn new(
        process_start: DateTime<FixedOffset>,
        serving_start: DateTime<FixedOffset>,
    ) -> Result<Self, ExtractionError> {
        if serving_start < process_start {
            return Err(ExtractionError::InvertedWindow {
                process_start,
                serving_start,
            });
        }
        Ok(Self {
            process_start,
            serving_start,
        })
    }

    pub fn process_start(&self) -> DateTime<FixedOffset> {
        self.process_start
    }

    pub fn serving_start(&self) -> DateTime<FixedOffset> {
        self.serving_start
    }

    pub fn startup_duration(&self) -> Duration {
        (self.serving_start - self.process_start)
            .to_std()
            .unwrap_or_default()
    }
}

/// Single pass over the lines of one container's logs.
pub struct StartupLogScanner<'a> {
    markers: &'a StartupMarkers,
    process_start: Option<DateTime<FixedOffset>>,
    serving_start: Option<DateTime<FixedOffset>>,
}

impl<'a> StartupLogScanner<'a> {
    pub fn new(markers: &'a StartupMarkers) -> Self {
        Self {
            markers,
            process_start: None,
            serving_start: None,
        }
    }

    pub fn feed(&mut self, line: &str) -> Result<(), ExtractionError> {
        if let Some(timestamp) = capture_timestamp(&self.markers.process_start, line) {
            if self.process_start.is_none() {
                self.process_start = Some(parse_timestamp(timestamp)?);
            }
        } else if let Some(timestamp) = capture_timestamp(&self.markers.serving_start, line) {
            if self.serving_start.is_none() {
                self.serving_start = Some(parse_timestamp(timestamp)?);
            }
        }
        Ok(())
    }

    pub fn finish(self) -> Result<MemberLogWindow, ExtractionError> {
        let process_start = self
            .process_start
            .ok_or(ExtractionError::MissingProcessStart)?;
        let serving_start = self
            .serving_start
            .ok_or(ExtractionError::MissingServingStart)?;
        MemberLogWindow::new(process_start, serving_start)
    }
}

fn capture_timestamp<'l>(pattern: &Regex, line: &'l str) -> Option<&'l str> {
    pattern
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str())
}

fn parse_timestamp(timestamp: &str) -> Result<DateTime<FixedOffset>, ExtractionError> {
    DateTime::parse_from_rfc3339(timestamp).map_err(|source| ExtractionError::MalformedTimestamp {
        timestamp: timestamp.to_string(),
        source,
    })
}

/// Time from process start to serving start of one member.
pub fn member_startup_duration<'l>(
    markers: &StartupMarkers,
    lines: impl IntoIterator<Item = &'l str>,
) -> Result<Duration, ExtractionError> {
    let mut scanner = StartupLogScanner::new(markers);
    for line in lines {
        scanner.feed(line)?;
    }
    Ok(scanner.finish()?.startup_duration())
}

/// The group is serving once its slowest member is. A group that took no time
/// at all to start means the logs didn't capture the startup.
pub fn group_startup_duration(
    durations: impl IntoIterator<Item = Duration>,
) -> Result<Duration, ExtractionError> {
    let slowest = durations
        .into_iter()
        .max()
        .ok_or(ExtractionError::EmptyGroup)?;
    if slowest.is_zero() {
        return Err(ExtractionError::ZeroStartup);
    }
    Ok(slowest)
}
