//! Output-line matchers used to estimate archive progress.
//!
//! Only the completion marker decides success; matchers just count lines.

use regex::Regex;

use crate::progress::PhaseBand;

/// Decides whether an archiver output line stands for one archived entry.
pub trait LineMatcher: Send + Sync {
    fn is_entry(&self, line: &str) -> bool;
}

/// Info-ZIP verbose output: `  adding: dir/file.txt (deflated 61%)`
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipVerboseMatcher;

impl LineMatcher for ZipVerboseMatcher {
    fn is_entry(&self, line: &str) -> bool {
        let line = line.trim_start();
        line.starts_with("adding: ") || line.starts_with("updating: ")
    }
}

/// Matcher for archivers with a different verbose format.
pub struct RegexLineMatcher {
    pattern: Regex,
}

impl RegexLineMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl LineMatcher for RegexLineMatcher {
    fn is_entry(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// Files at which the estimate reaches half the band
const HALF_BAND_FILES: f64 = 50.0;

/// Map an entry count into `band` without knowing the total.
///
/// `n / (n + K)` rises quickly at first and flattens out, never reaching the
/// band end; the end is reported only when the archive command finishes.
pub fn entries_to_percent(band: PhaseBand, entries: usize) -> u8 {
    let n = entries as f64;
    let fraction = n / (n + HALF_BAND_FILES);
    band.at_fraction(fraction).min(band.end.saturating_sub(1).max(band.start))
}
