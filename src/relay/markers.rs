//! Marker classification and the per-invocation progress mapping.
//!
//! The automation scripts print step lines such as `[2/4] Compiling` and
//! verdict tokens such as `[OK]` or `FAILED`. Everything here works on lines
//! that have already been stripped of escape sequences.

use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

const FAILURE_TOKENS: [&str; 2] = ["[FAIL]", "FAILED"];
const SUCCESS_TOKENS: [&str; 2] = ["[OK]", "SUCCESS"];
const OUTPUT_SECTION_LABEL: &str = "Running";

fn strict_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*\[(\d+)/(\d+)\](?:\s+(.*?))?\s*$").expect("progress pattern is valid")
    })
}

fn shape_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[\d+/\d+\]").expect("progress shape is valid"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressMarker {
    pub current: u32,
    pub total: u32,
    pub label: String,
}

impl ProgressMarker {
    /// Parses `[<current>/<total>] <label>`; anything looser is not a marker.
    pub fn parse(line: &str) -> Option<Self> {
        let captures = strict_pattern().captures(line)?;
        let current = captures.get(1)?.as_str().parse().ok()?;
        let total = captures.get(2)?.as_str().parse().ok()?;
        let label = captures
            .get(3)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        Some(Self {
            current,
            total,
            label,
        })
    }

    /// The final step, when labelled `Running`, hands the terminal over to
    /// the compiled program. Earlier `Running` steps are ordinary progress.
    pub fn opens_output_section(&self) -> bool {
        self.current == self.total && self.label.starts_with(OUTPUT_SECTION_LABEL)
    }
}

/// Cheap check used on incomplete fragments before attempting a full parse.
pub fn looks_like_progress(fragment: &str) -> bool {
    shape_pattern().is_match(fragment)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    Progress(ProgressMarker),
    Success,
    Failure,
    Plain,
}

pub fn classify(line: &str) -> LineKind {
    if let Some(marker) = ProgressMarker::parse(line) {
        return LineKind::Progress(marker);
    }
    if FAILURE_TOKENS.iter().any(|token| line.contains(token)) {
        return LineKind::Failure;
    }
    if SUCCESS_TOKENS.iter().any(|token| line.contains(token)) {
        return LineKind::Success;
    }
    LineKind::Plain
}

/// Only the bracketed verdicts end a program-output section; a program that
/// prints the bare word `FAILED` keeps its output flowing.
pub fn closes_output_section(line: &str) -> bool {
    line.contains("[OK]") || line.contains("[FAIL]")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub marker: ProgressMarker,
    /// Percentage points added by this marker.
    pub increment: f64,
    /// Cumulative percentage after this marker, within `0..=100`.
    pub percent: f64,
    /// Reported from an incomplete line ahead of its newline.
    pub partial: bool,
}

/// Maps successive markers of one invocation onto a cumulative percentage.
///
/// The first accepted total is fixed for the lifetime of the tracker. Markers
/// with another total, a zero total, or `current > total` are rejected.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    total: Option<u32>,
    previous: u32,
    advanced: u64,
}

impl ProgressTracker {
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) => {
                let done = self.advanced.min(u64::from(total));
                done as f64 / f64::from(total) * 100.0
            }
            None => 0.0,
        }
    }

    pub fn accepts(&self, marker: &ProgressMarker) -> bool {
        marker.total > 0
            && marker.current <= marker.total
            && self.total.map_or(true, |total| total == marker.total)
    }

    pub fn advance(&mut self, marker: &ProgressMarker, partial: bool) -> Option<ProgressEvent> {
        if !self.accepts(marker) {
            return None;
        }
        self.total = Some(marker.total);
        let before = self.percent();
        self.advanced += u64::from(marker.current.saturating_sub(self.previous));
        self.previous = marker.current;
        let percent = self.percent();
        Some(ProgressEvent {
            marker: marker.clone(),
            increment: percent - before,
            percent,
            partial,
        })
    }
}

/// Success/failure counts gathered from forwarded lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MarkerTally {
    pub successes: usize,
    pub failures: usize,
}

impl MarkerTally {
    /// Verdict tokens are scanned on every line, step lines included, so
    /// `[2/15] fedora ... FAILED` still counts as a failure.
    pub fn record(&mut self, line: &str) {
        if FAILURE_TOKENS.iter().any(|token| line.contains(token)) {
            self.failures += 1;
        }
        if SUCCESS_TOKENS.iter().any(|token| line.contains(token)) {
            self.successes += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(current: u32, total: u32, label: &str) -> ProgressMarker {
        ProgressMarker {
            current,
            total,
            label: label.to_string(),
        }
    }

    #[test]
    fn parses_step_lines() {
        assert_eq!(
            ProgressMarker::parse("[2/4] Compiling main.c"),
            Some(marker(2, 4, "Compiling main.c"))
        );
        assert_eq!(ProgressMarker::parse("  [1/15] ubuntu  "), Some(marker(1, 15, "ubuntu")));
        assert_eq!(ProgressMarker::parse("[3/3]"), Some(marker(3, 3, "")));
    }

    #[test]
    fn rejects_loose_lookalikes() {
        for line in [
            "[2/4]Compiling",
            "note: [2/4] inside text",
            "[2/x] Step",
            "[2-4] Step",
            "[99999999999/4] Step",
        ] {
            assert_eq!(ProgressMarker::parse(line), None, "line {line:?}");
        }
        assert!(looks_like_progress("note: [2/4] inside text"));
        assert!(!looks_like_progress("[2/4"));
    }

    #[test]
    fn classify_orders_progress_failure_success() {
        assert_eq!(
            classify("[4/4] Running program"),
            LineKind::Progress(marker(4, 4, "Running program"))
        );
        assert_eq!(classify("[FAIL] ubuntu"), LineKind::Failure);
        assert_eq!(classify("fedora: FAILED"), LineKind::Failure);
        assert_eq!(classify("[OK] Execution complete"), LineKind::Success);
        assert_eq!(classify("debian: SUCCESS"), LineKind::Success);
        assert_eq!(classify("[OK] 3 passed, [FAIL] 1 failed"), LineKind::Failure);
        assert_eq!(classify("hello world"), LineKind::Plain);
    }

    #[test]
    fn output_section_is_opened_by_running_step() {
        assert!(marker(4, 4, "Running ./a.out").opens_output_section());
        assert!(!marker(3, 4, "Compiling").opens_output_section());
        assert!(!marker(1, 3, "Running on ubuntu").opens_output_section());
        assert!(closes_output_section("[OK] Execution complete"));
        assert!(closes_output_section("[FAIL] exit code 3"));
        assert!(!closes_output_section("TESTS FAILED"));
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_hundred() {
        for total in 1..=17u32 {
            let mut tracker = ProgressTracker::default();
            let mut last = 0.0;
            for current in 1..=total {
                let event = tracker
                    .advance(&marker(current, total, "step"), false)
                    .expect("accepted");
                assert!(event.percent > last, "total {total} current {current}");
                assert!(event.percent <= 100.0);
                last = event.percent;
            }
            assert_eq!(last, 100.0);
        }
    }

    #[test]
    fn increments_follow_current_deltas() {
        let mut tracker = ProgressTracker::default();
        let first = tracker.advance(&marker(1, 4, "A"), false).unwrap();
        assert_eq!((first.increment, first.percent), (25.0, 25.0));
        let skip = tracker.advance(&marker(3, 4, "C"), false).unwrap();
        assert_eq!((skip.increment, skip.percent), (50.0, 75.0));
        let back = tracker.advance(&marker(1, 4, "A again"), false).unwrap();
        assert_eq!((back.increment, back.percent), (0.0, 75.0));
        let repeat = tracker.advance(&marker(4, 4, "D"), false).unwrap();
        assert_eq!((repeat.increment, repeat.percent), (25.0, 100.0));
        let over = tracker.advance(&marker(4, 4, "D"), false).unwrap();
        assert_eq!((over.increment, over.percent), (0.0, 100.0));
    }

    #[test]
    fn first_total_wins() {
        let mut tracker = ProgressTracker::default();
        assert!(tracker.advance(&marker(1, 4, "A"), false).is_some());
        assert!(tracker.advance(&marker(2, 8, "other"), false).is_none());
        assert_eq!(tracker.percent(), 25.0);
        let next = tracker.advance(&marker(2, 4, "B"), false).unwrap();
        assert_eq!(next.percent, 50.0);
    }

    #[test]
    fn degenerate_markers_are_rejected() {
        let mut tracker = ProgressTracker::default();
        assert!(tracker.advance(&marker(1, 0, "zero"), false).is_none());
        assert!(tracker.advance(&marker(5, 4, "overflow"), false).is_none());
        assert_eq!(tracker.percent(), 0.0);
    }

    #[test]
    fn tally_counts_verdicts() {
        let mut tally = MarkerTally::default();
        for line in [
            "[1/3] ubuntu",
            "[OK] ubuntu",
            "[2/3] fedora",
            "[FAIL] fedora",
            "[3/3] alpine",
            "alpine: SUCCESS",
            "plain",
        ] {
            tally.record(line);
        }
        assert_eq!(
            tally,
            MarkerTally {
                successes: 2,
                failures: 1
            }
        );
    }

    #[test]
    fn tally_counts_verdicts_on_step_lines() {
        let mut tally = MarkerTally::default();
        tally.record("[2/15] fedora ... FAILED");
        tally.record("[3/15] alpine ... SUCCESS");
        tally.record("[4/15] debian");
        assert_eq!(tally.failures, 1);
        assert_eq!(tally.successes, 1);
        assert_eq!(
            classify("[2/15] fedora ... FAILED"),
            LineKind::Progress(marker(2, 15, "fedora ... FAILED"))
        );
    }
}
