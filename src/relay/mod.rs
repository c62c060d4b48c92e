//! Streaming relay between a child process and the line/progress sinks.
//!
//! One [`run`] call owns one subprocess. Its stdout and stderr are read on the
//! calling task with `tokio::select!`, so chunks from the two pipes are
//! handled strictly one after the other and the sinks are never re-entered.
//! The pipeline itself lives in [`LineAssembler`], which has no I/O and can be
//! fed chunks directly.

mod ansi;
mod buffer;
pub mod markers;

pub use ansi::strip_ansi;
pub use buffer::LineBuffer;
pub use markers::{classify, LineKind, MarkerTally, ProgressEvent, ProgressMarker};

use markers::{closes_output_section, looks_like_progress, ProgressTracker};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

const READ_CHUNK_BYTES: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// A single subprocess run. Built once, then handed to [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    #[cfg(test)]
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    #[cfg(test)]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    #[cfg(test)]
    pub fn working_dir(&self) -> Option<&std::path::Path> {
        self.working_dir.as_deref()
    }

    /// Shell-like rendering for log headers and error messages.
    pub fn render(&self) -> String {
        fn quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace()) {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(quote(&self.program.to_string_lossy()));
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub success: bool,
    /// `None` when the process never started or was killed by a signal.
    pub exit_code: Option<i32>,
    pub output: String,
}

impl InvocationResult {
    fn launch_failure(message: String) -> Self {
        Self {
            success: false,
            exit_code: None,
            output: message,
        }
    }
}

pub trait LineSink {
    fn line(&mut self, source: StreamSource, text: &str);
}

pub trait ProgressSink {
    fn progress(&mut self, event: &ProgressEvent);
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Line { source: StreamSource, text: String },
    Progress(ProgressEvent),
}

#[derive(Debug, Default)]
struct StreamState {
    buffer: LineBuffer,
    last_partial: Option<ProgressMarker>,
}

/// The I/O-free half of the relay: bytes in, events out.
///
/// The two streams keep separate buffers but share the progress tracker and
/// the program-output section flag, since both belong to one invocation.
#[derive(Debug, Default)]
pub struct LineAssembler {
    stdout: StreamState,
    stderr: StreamState,
    tracker: ProgressTracker,
    in_output_section: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, source: StreamSource, chunk: &[u8]) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        let lines = self.state_mut(source).buffer.push(chunk);
        for raw in lines {
            self.complete_line(source, &raw, &mut events);
        }
        self.check_fragment(source, &mut events);
        events
    }

    /// Flushes trailing fragments, stdout first. Blank remainders are dropped.
    pub fn finish(&mut self) -> Vec<RelayEvent> {
        let mut events = Vec::new();
        for source in [StreamSource::Stdout, StreamSource::Stderr] {
            let Some(raw) = self.state_mut(source).buffer.take_remainder() else {
                continue;
            };
            if raw.trim().is_empty() {
                continue;
            }
            self.complete_line(source, &raw, &mut events);
        }
        events
    }

    fn state_mut(&mut self, source: StreamSource) -> &mut StreamState {
        match source {
            StreamSource::Stdout => &mut self.stdout,
            StreamSource::Stderr => &mut self.stderr,
        }
    }

    fn complete_line(&mut self, source: StreamSource, raw: &str, events: &mut Vec<RelayEvent>) {
        let text = strip_ansi(raw);
        let last_partial = self.state_mut(source).last_partial.take();

        if self.in_output_section {
            if closes_output_section(&text) {
                self.in_output_section = false;
            }
            events.push(RelayEvent::Line { source, text });
            return;
        }

        if text.trim().is_empty() {
            return;
        }
        let progress = match classify(&text) {
            LineKind::Progress(marker) => {
                if marker.opens_output_section() {
                    self.in_output_section = true;
                }
                if last_partial.as_ref() == Some(&marker) {
                    None
                } else {
                    self.tracker.advance(&marker, false)
                }
            }
            LineKind::Success | LineKind::Failure | LineKind::Plain => None,
        };
        events.push(RelayEvent::Line { source, text });
        if let Some(event) = progress {
            events.push(RelayEvent::Progress(event));
        }
    }

    fn check_fragment(&mut self, source: StreamSource, events: &mut Vec<RelayEvent>) {
        if self.in_output_section {
            return;
        }
        let Some(fragment) = self.state_mut(source).buffer.fragment() else {
            return;
        };
        let text = strip_ansi(&fragment);
        if !looks_like_progress(&text) {
            return;
        }
        let Some(marker) = ProgressMarker::parse(&text) else {
            return;
        };
        if self.state_mut(source).last_partial.as_ref() == Some(&marker) {
            return;
        }
        if let Some(event) = self.tracker.advance(&marker, true) {
            self.state_mut(source).last_partial = Some(marker);
            events.push(RelayEvent::Progress(event));
        }
    }
}

fn dispatch(
    events: Vec<RelayEvent>,
    lines: &mut dyn LineSink,
    progress: &mut Option<&mut dyn ProgressSink>,
) {
    for event in events {
        match event {
            RelayEvent::Line { source, text } => lines.line(source, &text),
            RelayEvent::Progress(event) => {
                if let Some(sink) = progress.as_deref_mut() {
                    sink.progress(&event);
                }
            }
        }
    }
}

async fn read_chunk<R>(stream: Option<&mut R>, buf: &mut [u8]) -> Option<usize>
where
    R: AsyncRead + Unpin,
{
    let Some(stream) = stream else {
        return std::future::pending().await;
    };
    match stream.read(buf).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(err) => {
            warn!(error = %err, "output pipe read failed; treating stream as closed");
            None
        }
    }
}

/// Runs `invocation` to completion, forwarding lines and progress as they
/// arrive. Never fails: launch errors and non-zero exits both come back as
/// `success == false` with diagnostic text in `output`.
pub async fn run(
    invocation: &Invocation,
    lines: &mut dyn LineSink,
    mut progress: Option<&mut dyn ProgressSink>,
) -> InvocationResult {
    let rendered = invocation.render();
    if invocation.program.as_os_str().is_empty() {
        let message = "cannot start process: program path is empty".to_string();
        lines.line(StreamSource::Stderr, &message);
        return InvocationResult::launch_failure(message);
    }

    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &invocation.working_dir {
        command.current_dir(dir);
    }

    debug!(command = %rendered, cwd = ?invocation.working_dir, "spawning");
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let message = format!("failed to start `{rendered}`: {err}");
            warn!(command = %rendered, error = %err, "spawn failed");
            lines.line(StreamSource::Stderr, &message);
            return InvocationResult::launch_failure(message);
        }
    };

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stdout_chunk = [0u8; READ_CHUNK_BYTES];
    let mut stderr_chunk = [0u8; READ_CHUNK_BYTES];
    let mut captured_stdout = Vec::new();
    let mut captured_stderr = Vec::new();
    let mut assembler = LineAssembler::new();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(stdout.as_mut(), &mut stdout_chunk) => match read {
                Some(n) => {
                    let chunk = &stdout_chunk[..n];
                    captured_stdout.extend_from_slice(chunk);
                    let events = assembler.push(StreamSource::Stdout, chunk);
                    dispatch(events, lines, &mut progress);
                }
                None => stdout = None,
            },
            read = read_chunk(stderr.as_mut(), &mut stderr_chunk) => match read {
                Some(n) => {
                    let chunk = &stderr_chunk[..n];
                    captured_stderr.extend_from_slice(chunk);
                    let events = assembler.push(StreamSource::Stderr, chunk);
                    dispatch(events, lines, &mut progress);
                }
                None => stderr = None,
            },
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(command = %rendered, error = %err, "waiting for process failed");
            None
        }
    };
    dispatch(assembler.finish(), lines, &mut progress);

    let mut output = String::from_utf8_lossy(&captured_stdout).into_owned();
    if !captured_stderr.is_empty() {
        output.push('\n');
        output.push_str(&String::from_utf8_lossy(&captured_stderr));
    }
    debug!(command = %rendered, ?exit_code, "process finished");
    InvocationResult {
        success: exit_code == Some(0),
        exit_code,
        output,
    }
}

/// [`run`] on a fresh current-thread runtime, for synchronous callers.
pub fn run_blocking(
    invocation: &Invocation,
    lines: &mut dyn LineSink,
    progress: Option<&mut dyn ProgressSink>,
) -> InvocationResult {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let message = format!("failed to start async runtime: {err}");
            lines.line(StreamSource::Stderr, &message);
            return InvocationResult::launch_failure(message);
        }
    };
    runtime.block_on(run(invocation, lines, progress))
}
