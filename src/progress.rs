//! Test progress inferred from the suite's result log
//!
//! Ginkgo announces how many specs it is about to run and then prints one
//! `•` per completed spec. Scraping that text is best effort: the result is
//! an overlay on the raw log and never decides whether the run is over.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::fmt;

const SPEC_COUNT_PATTERN: &str = r"Will run (\S+) of (\S+) specs";
const SUITE_FINISHED_PATTERN: &str = r"Ginkgo ran \d+ suites?";
const COMPLETION_GLYPH: char = '•';

/// Errors from progress parsing
#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("could not find test spec count")]
    SpecCountNotFound,

    #[error("malformed test spec count '{0}'")]
    MalformedCount(String),

    #[error("invalid progress pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Compiled log markers, built once per run
#[derive(Debug, Clone)]
pub struct ProgressMarkers {
    spec_count: Regex,
    suite_finished: Regex,
}

impl ProgressMarkers {
    pub fn new() -> Result<Self, ProgressError> {
        Ok(Self {
            spec_count: Regex::new(SPEC_COUNT_PATTERN)?,
            suite_finished: Regex::new(SUITE_FINISHED_PATTERN)?,
        })
    }

    /// Parse `(total, completed)` out of the accumulated result log.
    ///
    /// `total` is the number of specs ginkgo says it will run. Only glyphs
    /// after the announcement count as completed.
    pub fn parse(&self, log: &str) -> Result<(u32, u32), ProgressError> {
        let captures = self
            .spec_count
            .captures(log)
            .ok_or(ProgressError::SpecCountNotFound)?;

        // Group 0 always exists on a match
        let (Some(marker), Some(count)) = (captures.get(0), captures.get(1)) else {
            return Err(ProgressError::SpecCountNotFound);
        };

        let total = count
            .as_str()
            .parse::<u32>()
            .map_err(|_| ProgressError::MalformedCount(count.as_str().to_string()))?;

        let completed = log[marker.end()..]
            .chars()
            .filter(|c| *c == COMPLETION_GLYPH)
            .count();

        Ok((total, u32::try_from(completed).unwrap_or(u32::MAX)))
    }

    /// Whether a log line is ginkgo's end-of-suite summary
    pub fn is_suite_finished(&self, line: &str) -> bool {
        self.suite_finished.is_match(line)
    }
}

/// Parse `(total, completed)` from a result log
pub fn parse_progress(log: &str) -> Result<(u32, u32), ProgressError> {
    ProgressMarkers::new()?.parse(log)
}

/// Point-in-time view of test progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub total: u32,
    pub completed: u32,
    pub observed_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(total: u32, completed: u32) -> Self {
        Self {
            total,
            completed,
            observed_at: Utc::now(),
        }
    }

    /// Finished as far as the progress signal can tell
    pub fn is_finished(&self) -> bool {
        self.completed >= self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (f64::from(self.completed.min(self.total)) / f64::from(self.total)) * 100.0
    }
}

impl fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_finished() {
            return write!(f, "Completed {} of {} tests (100%)", self.completed, self.total);
        }
        write!(
            f,
            "Running test {} of {} ({:.0}% complete)",
            self.completed + 1,
            self.total,
            self.percent()
        )
    }
}
