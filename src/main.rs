use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use armada::actions::Action;
use armada::config::Manifest;
use armada::engine::{Engine, EngineOptions};
use armada::error::{print_error, Result};

#[derive(Parser)]
#[command(name = "armada", version, about = "Provision and control manifest-defined machines")]
struct Cli {
    /// Action to run against the selected nodes.
    #[arg(value_enum, default_value_t = Action::Status)]
    action: Action,

    /// Node names; all nodes when omitted.
    names: Vec<String>,

    /// Manifest file or directory containing armada.json.
    #[arg(short = 'f', long = "file", env = "ARMADA_FILE")]
    file: Option<PathBuf>,

    /// Provider override applying to every selected node.
    #[arg(short = 'p', long)]
    provider: Option<String>,

    /// Log provisioning commands without running them.
    #[arg(short = 'd', long)]
    dry: bool,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,

    /// Increase log verbosity (-v, -vv).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    verbose: u8,

    /// Command to run for the shell action, after `--`.
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let level = match cli.verbose {
        0 => "warn",
        1 => "info,armada=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            print_error(&err, cli.verbose > 0);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let path = Manifest::locate(cli.file.as_deref())?;
    let manifest = Manifest::load(&path)?;

    let command = if cli.command.is_empty() {
        None
    } else {
        Some(cli.command.join(" "))
    };

    let options = EngineOptions {
        provider: cli.provider.clone(),
        dry: cli.dry,
        command,
    };

    Engine::new(manifest, options)
        .run(cli.action, &cli.names)
        .await
}
