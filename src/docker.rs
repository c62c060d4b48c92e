use crate::error::{DistroLabError, ProcessErrorDetails};
use crate::relay::Invocation;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

pub const DOCKER_PROGRAM: &str = "docker";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// Captured, short-lived docker queries. Long-running compose actions go
/// through the relay instead so their output streams.
pub trait DockerRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error>;
}

pub struct RealDockerRunner;

impl DockerRunner for RealDockerRunner {
    fn run(&self, args: &[String]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(DOCKER_PROGRAM)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeAction {
    Up,
    Stop,
}

impl ComposeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ComposeAction::Up => "up",
            ComposeAction::Stop => "stop",
        }
    }
}

pub fn compose_invocation(compose_file: &Path, bundle_dir: &Path, action: ComposeAction) -> Invocation {
    let invocation = Invocation::new(DOCKER_PROGRAM)
        .arg("compose")
        .arg("-f")
        .arg(compose_file.to_string_lossy())
        .current_dir(bundle_dir);
    match action {
        ComposeAction::Up => invocation.arg("up").arg("-d"),
        ComposeAction::Stop => invocation.arg("stop"),
    }
}

pub fn render_docker_command(args: &[String]) -> String {
    Invocation::new(DOCKER_PROGRAM).args(args.iter().cloned()).render()
}

pub fn docker_spawn_error_details(err: &io::Error, command: &str) -> ProcessErrorDetails {
    if err.kind() == io::ErrorKind::NotFound {
        return ProcessErrorDetails {
            error_code: "docker_not_found".to_string(),
            hint: Some("Install Docker and ensure `docker` is on your PATH.".to_string()),
            command: Some(command.to_string()),
            raw_stderr: None,
        };
    }
    ProcessErrorDetails {
        error_code: "process_command_failed".to_string(),
        hint: None,
        command: Some(command.to_string()),
        raw_stderr: None,
    }
}

pub fn classify_docker_command_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("error during connect")
    {
        return (
            "docker_daemon_unreachable".to_string(),
            Some("Docker is not running. Please start Docker Desktop (or dockerd) and retry.".to_string()),
        );
    }

    if lower.contains("unknown command: docker compose")
        || lower.contains("is not a docker command")
    {
        return (
            "docker_compose_unavailable".to_string(),
            Some("Docker Compose is unavailable. Install the compose plugin and retry.".to_string()),
        );
    }

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        return (
            "docker_port_conflict".to_string(),
            Some("A required host port is already in use. Free the conflicting port and retry.".to_string()),
        );
    }

    if lower.contains("denied") || lower.contains("unauthorized") || lower.contains("authentication") {
        return (
            "docker_registry_auth".to_string(),
            Some("Authenticate with `docker login` to pull the distribution images.".to_string()),
        );
    }

    ("process_command_failed".to_string(), None)
}

/// Builds a detailed error for a docker invocation that failed with `text`.
pub fn docker_failure(command: &str, status: Option<i32>, text: &str) -> DistroLabError {
    let text = text.trim().to_string();
    let (error_code, hint) = classify_docker_command_failure(&text);
    let mut message = match status {
        Some(code) => format!("command failed with status {code} while running `{command}`"),
        None => format!("command did not complete while running `{command}`"),
    };
    if !text.is_empty() {
        message = format!("{message}: {text}");
    }
    if let Some(ref hint_message) = hint {
        message = format!("{message}\nHint: {hint_message}");
    }
    DistroLabError::ProcessDetailed {
        message,
        details: ProcessErrorDetails {
            error_code,
            hint,
            command: Some(command.to_string()),
            raw_stderr: if text.is_empty() { None } else { Some(text) },
        },
    }
}

pub fn execute_docker<R: DockerRunner>(
    runner: &R,
    args: &[String],
) -> Result<CommandOutput, DistroLabError> {
    let command = render_docker_command(args);
    debug!(%command, "docker query");
    let cmd_output = runner.run(args).map_err(|err| {
        let details = docker_spawn_error_details(&err, &command);
        DistroLabError::ProcessDetailed {
            message: format!("failed to run command `{command}`: {err}"),
            details,
        }
    })?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr);
        return Err(docker_failure(&command, Some(cmd_output.status_code), &stderr));
    }
    Ok(cmd_output)
}

/// `docker ps` succeeds only when the CLI is installed and the daemon answers.
pub fn ensure_docker_running<R: DockerRunner>(runner: &R) -> Result<(), DistroLabError> {
    execute_docker(runner, &["ps".to_string()]).map(|_| ())
}

pub fn containers_running<R: DockerRunner>(runner: &R, prefix: &str) -> Result<bool, DistroLabError> {
    let args = vec![
        "ps".to_string(),
        "--format".to_string(),
        "{{.Names}}".to_string(),
    ];
    let output = execute_docker(runner, &args)?;
    let names = String::from_utf8_lossy(&output.stdout);
    Ok(names
        .lines()
        .map(str::trim)
        .any(|name| !name.is_empty() && name.contains(prefix)))
}
