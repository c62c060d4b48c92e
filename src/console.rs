//! Terminal and log-file sinks for relayed output, plus tracing setup.

use crate::config::ensure_parent;
use crate::error::DistroLabError;
use crate::relay::{LineSink, ProgressEvent, ProgressSink, StreamSource};
use chrono::{DateTime, SecondsFormat, Utc};
use dialoguer::console::{style, Term};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "DISTROLAB_LOG";

/// `DISTROLAB_LOG` wins; otherwise `-v` raises the default `warn` level.
pub fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(io::stderr)
        .init();
    debug!(verbose, "tracing initialized");
}

fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    }
}

struct LogFile {
    path: PathBuf,
    file: File,
}

/// Line sink for the CLI: every relayed line goes to the console and, when
/// configured, to an append-only log file.
pub struct ConsoleSink {
    console: Box<dyn Write>,
    log: Option<LogFile>,
}

impl ConsoleSink {
    /// In `--json` mode relayed lines go to stderr so stdout holds only the
    /// JSON payload.
    pub fn new(json: bool, log_path: Option<&Path>) -> Result<Self, DistroLabError> {
        let console: Box<dyn Write> = if json {
            Box::new(io::stderr())
        } else {
            Box::new(io::stdout())
        };
        Self::with_writer(console, log_path)
    }

    pub fn with_writer(
        console: Box<dyn Write>,
        log_path: Option<&Path>,
    ) -> Result<Self, DistroLabError> {
        let log = match log_path {
            Some(path) => {
                ensure_parent(path)?;
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                debug!(path = %path.display(), "appending relayed output to log file");
                Some(LogFile {
                    path: path.to_path_buf(),
                    file,
                })
            }
            None => None,
        };
        Ok(Self { console, log })
    }

    /// Section header such as the command about to run.
    pub fn note(&mut self, text: &str) {
        let _ = writeln!(self.console, "{}", style(text).bold());
        self.append_log("note", text);
    }

    fn append_log(&mut self, tag: &str, text: &str) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let entry = format_log_entry(Utc::now(), tag, text);
        if let Err(err) = log.file.write_all(entry.as_bytes()) {
            warn!(path = %log.path.display(), error = %err, "log file write failed; disabling");
            self.log = None;
        }
    }
}

impl LineSink for ConsoleSink {
    fn line(&mut self, source: StreamSource, text: &str) {
        let _ = writeln!(self.console, "{text}");
        let _ = self.console.flush();
        let tag = match source {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        };
        self.append_log(tag, text);
    }
}

pub fn format_log_entry(timestamp: DateTime<Utc>, tag: &str, text: &str) -> String {
    format!(
        "{} [{tag}] {text}\n",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Progress for steps still in flight goes to stderr when it is a terminal.
/// Completed steps are already on screen as relayed lines, so they only reach
/// the trace log.
pub struct ConsoleProgress {
    term: Option<Term>,
}

impl ConsoleProgress {
    pub fn new(json: bool) -> Self {
        let term = Term::stderr();
        let term = if !json && term.is_term() { Some(term) } else { None };
        Self { term }
    }
}

impl ProgressSink for ConsoleProgress {
    fn progress(&mut self, event: &ProgressEvent) {
        match &self.term {
            Some(term) if shows_on_terminal(event) => {
                let _ = term.write_line(&style(render_progress(event)).cyan().to_string());
            }
            _ => debug!(
                current = event.marker.current,
                total = event.marker.total,
                percent = event.percent,
                partial = event.partial,
                label = %event.marker.label,
                "progress"
            ),
        }
    }
}

fn shows_on_terminal(event: &ProgressEvent) -> bool {
    event.partial
}

pub fn render_progress(event: &ProgressEvent) -> String {
    let label = if event.marker.label.is_empty() {
        format!("{}/{}", event.marker.current, event.marker.total)
    } else {
        event.marker.label.clone()
    };
    format!("[{:>3.0}%] {label}", event.percent)
}

/// The console handles one command uses, created once in `main`.
pub struct Session {
    pub console: ConsoleSink,
    pub progress: ConsoleProgress,
}

impl Session {
    pub fn new(json: bool, log_path: Option<&Path>) -> Result<Self, DistroLabError> {
        Ok(Self {
            console: ConsoleSink::new(json, log_path)?,
            progress: ConsoleProgress::new(json),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ProgressMarker;
    use chrono::TimeZone;
    use std::fs;
    use tempfile::tempdir;

    fn event(current: u32, total: u32, label: &str, percent: f64) -> ProgressEvent {
        ProgressEvent {
            marker: ProgressMarker {
                current,
                total,
                label: label.to_string(),
            },
            increment: 0.0,
            percent,
            partial: false,
        }
    }

    #[test]
    fn log_entry_is_timestamped_and_tagged() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(
            format_log_entry(ts, "stderr", "boom"),
            "2024-05-01T12:30:00.000Z [stderr] boom\n"
        );
    }

    #[test]
    fn progress_renders_percent_and_label() {
        assert_eq!(render_progress(&event(1, 4, "Step A", 25.0)), "[ 25%] Step A");
        assert_eq!(render_progress(&event(4, 4, "", 100.0)), "[100%] 4/4");
    }

    #[test]
    fn only_partial_steps_reach_the_terminal() {
        let mut partial = event(2, 4, "Compiling", 50.0);
        partial.partial = true;
        assert!(shows_on_terminal(&partial));
        assert!(!shows_on_terminal(&event(2, 4, "Compiling", 50.0)));
    }

    #[test]
    fn lines_are_appended_to_log_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("distrolab.log");
        {
            let mut sink = ConsoleSink::with_writer(Box::new(io::sink()), Some(&path)).unwrap();
            sink.note("$ make setup");
            sink.line(StreamSource::Stdout, "hello");
            sink.line(StreamSource::Stderr, "warning");
        }
        {
            let mut sink = ConsoleSink::with_writer(Box::new(io::sink()), Some(&path)).unwrap();
            sink.line(StreamSource::Stdout, "second run");
        }
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("[note] $ make setup"));
        assert!(lines[1].ends_with("[stdout] hello"));
        assert!(lines[2].ends_with("[stderr] warning"));
        assert!(lines[3].ends_with("[stdout] second run"));
    }

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_level(0), "warn");
        assert_eq!(default_level(1), "debug");
        assert_eq!(default_level(5), "trace");
    }
}
