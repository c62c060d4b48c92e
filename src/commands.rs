use crate::bundle::{detect_bundle_dir, prepare_source_file, script_env, validate_bundle};
use crate::config::{
    ensure_parent, load_config, read_config, resolve_bundle_dir, write_config, Config, Context,
    Distribution, DEFAULT_CONFIG_YAML,
};
use crate::console::Session;
use crate::docker::{
    self, compose_invocation, containers_running, ensure_docker_running, ComposeAction,
    DockerRunner,
};
use crate::error::{DistroLabError, ProcessErrorDetails};
use crate::relay::{
    self, Invocation, InvocationResult, LineSink, MarkerTally, ProgressSink, StreamSource,
};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Select};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, Serialize)]
pub struct JsonResult<T: Serialize> {
    pub ok: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ProcessErrorDetails>,
}

pub fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), DistroLabError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

/// Like [`output`], but prints `text` instead of the raw payload outside
/// `--json` mode.
fn report(ctx: &Context, payload: serde_json::Value, text: &str) -> Result<(), DistroLabError> {
    if ctx.json {
        return output(ctx, payload);
    }
    println!("{text}");
    Ok(())
}

pub fn print_json<T: Serialize>(payload: &T) -> Result<(), DistroLabError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

pub fn extract_process_error_details(err: &DistroLabError) -> Option<ProcessErrorDetails> {
    err.details().cloned()
}

fn can_prompt(ctx: &Context) -> bool {
    !ctx.json && io::stdin().is_terminal() && io::stderr().is_terminal()
}

fn ready_bundle(ctx: &Context, cfg: &Config) -> Result<PathBuf, DistroLabError> {
    let bundle_dir = resolve_bundle_dir(ctx, cfg);
    debug!(bundle_dir = %bundle_dir.display(), "resolved bundle directory");
    validate_bundle(&bundle_dir, cfg.scripts.dir.trim()).into_result()
}

fn script_failure(invocation: &Invocation, result: &InvocationResult) -> DistroLabError {
    match result.exit_code {
        Some(code) => DistroLabError::Process(format!(
            "`{}` failed with exit code {code}",
            invocation.render()
        )),
        None if result.output.trim().is_empty() => DistroLabError::Process(format!(
            "`{}` did not exit normally",
            invocation.render()
        )),
        None => DistroLabError::Process(result.output.trim().to_string()),
    }
}

fn relay_script(session: &mut Session, invocation: &Invocation) -> InvocationResult {
    session.console.note(&format!("$ {}", invocation.render()));
    let Session { console, progress } = session;
    relay::run_blocking(invocation, console, Some(progress as &mut dyn ProgressSink))
}

fn compose(
    cfg: &Config,
    bundle_dir: &Path,
    session: &mut Session,
    action: ComposeAction,
) -> Result<InvocationResult, DistroLabError> {
    let compose_file = cfg.compose_file(bundle_dir);
    if !compose_file.is_file() {
        return Err(DistroLabError::Config(format!(
            "compose file not found: {}",
            compose_file.display()
        )));
    }
    let invocation = compose_invocation(&compose_file, bundle_dir, action);
    info!(action = action.as_str(), compose_file = %compose_file.display(), "docker compose");
    let result = relay_script(session, &invocation);
    if !result.success {
        return Err(docker::docker_failure(
            &invocation.render(),
            result.exit_code,
            &result.output,
        ));
    }
    Ok(result)
}

/// Makes sure the distribution containers are up, starting them when allowed.
fn ensure_containers<R: DockerRunner>(
    ctx: &Context,
    cfg: &Config,
    bundle_dir: &Path,
    runner: &R,
    session: &mut Session,
    yes: bool,
) -> Result<(), DistroLabError> {
    let prefix = cfg.docker.container_prefix.trim();
    if containers_running(runner, prefix)? {
        return Ok(());
    }
    let start = if cfg.auto_setup || yes {
        true
    } else if can_prompt(ctx) {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Containers are not running. Start them now?")
            .default(true)
            .interact()?
    } else {
        false
    };
    if !start {
        return Err(DistroLabError::Config(format!(
            "no running containers match `{prefix}`; run `distrolab up` or pass --yes"
        )));
    }
    compose(cfg, bundle_dir, session, ComposeAction::Up).map(|_| ())
}

fn preflight<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    session: &mut Session,
    yes: bool,
) -> Result<(Config, PathBuf), DistroLabError> {
    let cfg = load_config(&ctx.config_path)?;
    let bundle_dir = ready_bundle(ctx, &cfg)?;
    ensure_docker_running(runner)?;
    ensure_containers(ctx, &cfg, &bundle_dir, runner, session, yes)?;
    Ok((cfg, bundle_dir))
}

pub fn handle_compile_run<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    session: &mut Session,
    file: &Path,
    distro: Option<Distribution>,
    yes: bool,
) -> Result<(), DistroLabError> {
    let (cfg, bundle_dir) = preflight(ctx, runner, session, yes)?;
    let relative = prepare_source_file(&bundle_dir, file)?;
    let distro = distro.unwrap_or(cfg.default_distro);

    let invocation = Invocation::new(cfg.script_path(&bundle_dir, &cfg.scripts.compile_run))
        .arg(distro.as_str())
        .arg(relative.clone())
        .current_dir(&bundle_dir)
        .envs(script_env());
    let result = relay_script(session, &invocation);
    if !result.success {
        return Err(script_failure(&invocation, &result));
    }
    report(
        ctx,
        json!({
            "distro": distro,
            "file": relative,
            "exit_code": result.exit_code,
            "output": result.output,
        }),
        &format!("{} {relative} on {distro}", style("Finished").green().bold()),
    )
}

/// Forwards every line while counting success and failure markers.
struct TallySink<'a> {
    inner: &'a mut dyn LineSink,
    tally: MarkerTally,
}

impl LineSink for TallySink<'_> {
    fn line(&mut self, source: StreamSource, text: &str) {
        self.tally.record(text);
        self.inner.line(source, text);
    }
}

pub fn handle_test_all<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    session: &mut Session,
    file: &Path,
    yes: bool,
) -> Result<(), DistroLabError> {
    let (cfg, bundle_dir) = preflight(ctx, runner, session, yes)?;
    let relative = prepare_source_file(&bundle_dir, file)?;

    let invocation = Invocation::new(cfg.script_path(&bundle_dir, &cfg.scripts.run_all))
        .arg("--compile")
        .arg(relative.clone())
        .current_dir(&bundle_dir)
        .envs(script_env());
    session.console.note(&format!("$ {}", invocation.render()));
    let Session { console, progress } = session;
    let mut sink = TallySink {
        inner: console,
        tally: MarkerTally::default(),
    };
    let result = relay::run_blocking(&invocation, &mut sink, Some(progress as &mut dyn ProgressSink));
    let tally = sink.tally;

    let summary = format!("{} passed, {} failed", tally.successes, tally.failures);
    if !result.success {
        return Err(DistroLabError::Process(format!(
            "{} ({summary})",
            script_failure(&invocation, &result)
        )));
    }
    if tally.failures > 0 {
        return Err(DistroLabError::Process(format!(
            "{} distribution(s) failed for {relative} ({summary})",
            tally.failures
        )));
    }
    report(
        ctx,
        json!({
            "file": relative,
            "successes": tally.successes,
            "failures": tally.failures,
            "exit_code": result.exit_code,
        }),
        &format!("{} {summary}", style("Summary:").bold()),
    )
}

pub fn handle_setup<R: DockerRunner>(
    ctx: &Context,
    runner: &R,
    session: &mut Session,
    yes: bool,
) -> Result<(), DistroLabError> {
    let cfg = load_config(&ctx.config_path)?;
    let bundle_dir = ready_bundle(ctx, &cfg)?;
    ensure_docker_running(runner)?;
    compose(&cfg, &bundle_dir, session, ComposeAction::Up)?;

    let proceed = if yes {
        true
    } else if can_prompt(ctx) {
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Run `make setup`? Building every distribution image can take a while.")
            .default(true)
            .interact()?
    } else {
        return Err(DistroLabError::Config(
            "setup needs confirmation; pass --yes to run non-interactively".to_string(),
        ));
    };
    if !proceed {
        return report(ctx, json!({"setup": false}), "Setup cancelled.");
    }

    let invocation = Invocation::new("make")
        .arg("setup")
        .current_dir(&bundle_dir)
        .envs(script_env());
    let result = relay_script(session, &invocation);
    if !result.success {
        return Err(script_failure(&invocation, &result));
    }
    report(
        ctx,
        json!({"setup": true, "bundle_dir": bundle_dir}),
        &format!("{} environment is ready", style("Setup complete:").green().bold()),
    )
}

pub fn handle_compose(
    ctx: &Context,
    session: &mut Session,
    action: ComposeAction,
) -> Result<(), DistroLabError> {
    let cfg = load_config(&ctx.config_path)?;
    let bundle_dir = resolve_bundle_dir(ctx, &cfg);
    compose(&cfg, &bundle_dir, session, action)?;
    let compose_file = cfg.compose_file(&bundle_dir);
    let verb = match action {
        ComposeAction::Up => "started",
        ComposeAction::Stop => "stopped",
    };
    report(
        ctx,
        json!({"action": action.as_str(), "compose_file": compose_file}),
        &format!("Containers {verb}."),
    )
}

#[derive(clap::Subcommand, Debug)]
pub enum DistroCommand {
    /// List every distribution, marking the default.
    List,
    /// Set the default distribution.
    Select { name: Option<Distribution> },
    /// Print the default distribution.
    Show,
}

pub fn handle_distro(ctx: &Context, command: DistroCommand) -> Result<(), DistroLabError> {
    match command {
        DistroCommand::List => {
            let cfg = load_config(&ctx.config_path)?;
            let names: Vec<&str> = Distribution::ALL.iter().map(|d| d.as_str()).collect();
            let text = Distribution::ALL
                .iter()
                .map(|distro| {
                    if *distro == cfg.default_distro {
                        format!("* {distro}")
                    } else {
                        format!("  {distro}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n");
            report(
                ctx,
                json!({"default_distro": cfg.default_distro, "distributions": names}),
                &text,
            )
        }
        DistroCommand::Select { name } => {
            let mut cfg = load_config(&ctx.config_path)?;
            let selected = match name {
                Some(distro) => distro,
                None if can_prompt(ctx) => {
                    let items: Vec<&str> = Distribution::ALL.iter().map(|d| d.as_str()).collect();
                    let current = Distribution::ALL
                        .iter()
                        .position(|d| *d == cfg.default_distro)
                        .unwrap_or(0);
                    let index = Select::with_theme(&ColorfulTheme::default())
                        .with_prompt("Select the default distribution")
                        .items(&items)
                        .default(current)
                        .interact()?;
                    Distribution::ALL[index]
                }
                None => {
                    return Err(DistroLabError::Config(
                        "no distribution given; pass a name such as `ubuntu`".to_string(),
                    ))
                }
            };
            cfg.default_distro = selected;
            write_config(&ctx.config_path, &cfg)?;
            info!(distro = %selected, "default distribution updated");
            report(
                ctx,
                json!({"default_distro": selected, "path": ctx.config_path}),
                &format!("Default distribution set to {selected}."),
            )
        }
        DistroCommand::Show => {
            let cfg = load_config(&ctx.config_path)?;
            report(
                ctx,
                json!({"default_distro": cfg.default_distro}),
                &format!("Distro: {}", cfg.default_distro),
            )
        }
    }
}

#[derive(clap::Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write the default config file if it does not exist.
    Init,
    /// Parse and validate the config file.
    Validate,
    /// Show or change the bundle directory.
    Path {
        #[arg(long, conflicts_with = "detect")]
        set: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        detect: bool,
    },
}

pub fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), DistroLabError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(ctx, json!({"path": ctx.config_path, "created": false}));
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)?;
            output(ctx, json!({"path": ctx.config_path, "created": true}))
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
        ConfigCommand::Path { set, detect } => {
            let mut cfg = load_config(&ctx.config_path)?;
            let chosen = if let Some(dir) = set {
                Some(absolute(&dir)?)
            } else if detect {
                let exe = env::current_exe().ok();
                let cwd = env::current_dir().ok();
                Some(detect_bundle_dir(exe.as_deref(), cwd.as_deref()).ok_or_else(|| {
                    DistroLabError::Config(
                        "could not find a directory containing docker-compose.yml; use --set"
                            .to_string(),
                    )
                })?)
            } else {
                None
            };

            let Some(dir) = chosen else {
                let bundle_dir = resolve_bundle_dir(ctx, &cfg);
                let validation = validate_bundle(&bundle_dir, cfg.scripts.dir.trim());
                return output(
                    ctx,
                    json!({
                        "bundle_dir": bundle_dir,
                        "valid": validation.is_valid(),
                        "missing": validation.missing,
                    }),
                );
            };

            let bundle_dir = validate_bundle(&dir, cfg.scripts.dir.trim()).into_result()?;
            cfg.paths.bundle_dir = bundle_dir.to_string_lossy().to_string();
            write_config(&ctx.config_path, &cfg)?;
            output(
                ctx,
                json!({"bundle_dir": bundle_dir, "valid": true, "path": ctx.config_path}),
            )
        }
    }
}

fn absolute(dir: &Path) -> Result<PathBuf, DistroLabError> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    Ok(env::current_dir()?.join(dir))
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    id: String,
    ok: bool,
    message: String,
    remediation: String,
    details: serde_json::Value,
}

fn doctor_check(
    id: &str,
    ok: bool,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> DoctorCheck {
    DoctorCheck {
        id: id.to_string(),
        ok,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

fn collect_doctor_checks<R: DockerRunner>(
    ctx: &Context,
    cfg: &Config,
    runner: &R,
    docker_installed: bool,
) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    let daemon = if docker_installed {
        ensure_docker_running(runner)
    } else {
        Ok(())
    };
    let docker_ok = docker_installed && daemon.is_ok();
    let error_code = daemon
        .as_ref()
        .err()
        .and_then(|err| err.details())
        .map(|details| details.error_code.clone());
    checks.push(doctor_check(
        "docker_runtime",
        docker_ok,
        if docker_ok {
            "docker daemon reachable"
        } else if docker_installed {
            "docker is installed but daemon is unreachable"
        } else {
            "docker is not installed or not in PATH"
        },
        "Install/start Docker Desktop (or dockerd) and rerun `distrolab doctor`.",
        json!({"docker_installed": docker_installed, "error_code": error_code}),
    ));

    let compose_ok = docker_installed
        && docker::execute_docker(runner, &["compose".to_string(), "version".to_string()])
            .is_ok();
    checks.push(doctor_check(
        "docker_compose",
        compose_ok,
        if compose_ok {
            "docker compose available"
        } else {
            "docker compose is unavailable"
        },
        "Install the Docker Compose plugin.",
        json!({}),
    ));

    let bundle_dir = resolve_bundle_dir(ctx, cfg);
    let validation = validate_bundle(&bundle_dir, cfg.scripts.dir.trim());
    checks.push(doctor_check(
        "bundle",
        validation.is_valid(),
        if validation.is_valid() {
            format!("bundle found at {}", bundle_dir.display())
        } else {
            format!(
                "bundle at {} is missing: {}",
                bundle_dir.display(),
                validation.missing.join(", ")
            )
        },
        "Run `distrolab config path --set <dir>` with the directory holding docker-compose.yml.",
        json!({"bundle_dir": bundle_dir, "missing": validation.missing}),
    ));

    checks
}

pub fn handle_doctor<R: DockerRunner>(ctx: &Context, runner: &R) -> Result<(), DistroLabError> {
    let cfg = load_config(&ctx.config_path)?;
    let docker_installed = which::which(docker::DOCKER_PROGRAM).is_ok();
    let checks = collect_doctor_checks(ctx, &cfg, runner, docker_installed);
    let failure = checks
        .iter()
        .find(|check| !check.ok)
        .map(|check| check.message.clone());

    if ctx.json {
        let payload = JsonResult {
            ok: failure.is_none(),
            result: Some(json!({ "checks": checks })),
            error: failure,
            error_details: None,
        };
        print_json(&payload)?;
        return Ok(());
    }

    for check in &checks {
        let state = if check.ok {
            style("ok").green()
        } else {
            style("fail").red()
        };
        println!("[{}] {} - {}", state, check.id, check.message);
        if !check.ok {
            println!("  remediation: {}", check.remediation);
        }
    }
    match failure {
        None => Ok(()),
        Some(message) => Err(DistroLabError::Process(message)),
    }
}
