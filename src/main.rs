mod bundle;
mod commands;
mod config;
mod console;
mod docker;
mod error;
mod relay;

use clap::{ArgAction, Parser, Subcommand};
use commands::{ConfigCommand, DistroCommand, JsonResult};
use config::{Context, Distribution};
use console::Session;
use docker::{ComposeAction, RealDockerRunner};
use error::DistroLabError;
use std::path::PathBuf;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(
    name = "distrolab",
    version,
    about = "Compile and run code across Linux distribution containers"
)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true, hide = true)]
    bundle_dir: Option<PathBuf>,
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Distro {
        #[command(subcommand)]
        command: DistroCommand,
    },
    /// Start the distribution containers.
    Up,
    /// Stop the distribution containers.
    Down,
    /// Compile and run a source file in one distribution.
    CompileRun {
        file: PathBuf,
        #[arg(long)]
        distro: Option<Distribution>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Compile and run a source file in every distribution.
    TestAll {
        file: PathBuf,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Start the containers and run `make setup`.
    Setup {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    Doctor,
}

fn main() -> Result<(), DistroLabError> {
    let cli = Cli::parse();
    console::init_tracing(cli.verbose);
    let ctx = build_context(&cli);
    let runner = RealDockerRunner;

    let result = open_session(&ctx).and_then(|mut session| match cli.command {
        Commands::Config { command } => commands::handle_config(&ctx, command),
        Commands::Distro { command } => commands::handle_distro(&ctx, command),
        Commands::Up => commands::handle_compose(&ctx, &mut session, ComposeAction::Up),
        Commands::Down => commands::handle_compose(&ctx, &mut session, ComposeAction::Stop),
        Commands::CompileRun { file, distro, yes } => {
            commands::handle_compile_run(&ctx, &runner, &mut session, &file, distro, yes)
        }
        Commands::TestAll { file, yes } => {
            commands::handle_test_all(&ctx, &runner, &mut session, &file, yes)
        }
        Commands::Setup { yes } => commands::handle_setup(&ctx, &runner, &mut session, yes),
        Commands::Doctor => commands::handle_doctor(&ctx, &runner),
    });

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: commands::extract_process_error_details(&err),
            };
            commands::print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: config::resolve_config_path(cli.config.as_ref()),
        bundle_dir_override: cli.bundle_dir.clone(),
        json: cli.json,
    }
}

/// The log file comes from config; a broken config is reported by the
/// command itself, so it only costs the log file here.
fn open_session(ctx: &Context) -> Result<Session, DistroLabError> {
    let log_path = config::load_config(&ctx.config_path)
        .ok()
        .and_then(|cfg| cfg.log_file());
    match Session::new(ctx.json, log_path.as_deref()) {
        Ok(session) => Ok(session),
        Err(err) => {
            warn!(error = %err, "cannot open log file; continuing without it");
            Session::new(ctx.json, None)
        }
    }
}
