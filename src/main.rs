//! remcap - interactive shell driving the capture controller.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::EnvFilter;

use remcap::capture::Registry;
use remcap::commands;
use remcap::config::{self, Config};
use remcap::feedback::Feedback;

const DEFAULT_CONFIG_PATH: &str = "remcap.yml";

#[derive(Parser)]
#[command(name = "remcap")]
#[command(version, about = "Remote packet capture controller")]
struct Cli {
    /// Path to the targets configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Append structured logs to this file
    #[arg(long = "log")]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fully commented sample configuration
    Init {
        /// Destination path for the sample
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Commands::Init { path }) = &cli.command {
        return match config::write_sample(path) {
            Ok(()) => {
                println!("Saved sample configuration to {}", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let _log_guard = match init_logging(cli.log.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(config = %cli.config.display(), targets = config.targets.len(), "remcap starting");

    if let Err(e) = run_shell(&config).await {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Route structured logs to the requested file. Without `--log` the events
/// are simply dropped; the shell stays clean either way.
fn init_logging(path: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let Some(path) = path else {
        return Ok(None);
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file = path
        .file_name()
        .with_context(|| format!("invalid log path {}", path.display()))?;

    let appender = rolling::never(dir, file);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .init();

    Ok(Some(guard))
}

/// The interactive loop: read a line, dispatch a command, repeat until
/// exit or EOF.
async fn run_shell(config: &Config) -> anyhow::Result<()> {
    let feedback = Feedback::stdout();
    let registry = Registry::new(feedback.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("remcap> ");
        std::io::stdout().flush().context("can't flush prompt")?;

        let Some(line) = lines.next_line().await.context("can't read command")? else {
            break; // EOF
        };

        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<String> = words.map(str::to_string).collect();

        match command {
            "start" => commands::cmd_start(&registry, config, &feedback).await,
            "stop" => commands::cmd_stop(&registry, &feedback).await,
            "wireshark" => commands::cmd_wireshark(&registry, &args),
            "targets" => commands::cmd_targets(config, &feedback).await,
            "help" => print_help(&feedback),
            "exit" | "quit" => break,
            other => feedback.emit(&format!("Unknown command: {other}. Try help.")),
        }
    }

    registry.close().await;
    Ok(())
}

fn print_help(feedback: &Feedback) {
    feedback.emit("start              start capturing on every configured target");
    feedback.emit("stop               stop all running captures");
    feedback.emit("wireshark [name..] open a live Wireshark window per target");
    feedback.emit("targets            probe each target's SSH access and tcpdump");
    feedback.emit("exit | quit        stop everything and leave");
}
