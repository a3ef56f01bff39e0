#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use std::env;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "nudge: notification aggregation and read-state reconciliation",
    long_about = None
)]
struct Cli {
    /// Output format (defaults to pretty on a TTY, text when piped).
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Verification",
        about = "Deterministic simulation campaigns",
        long_about = "Drive the engine through seeded workloads of concurrent conversation\n\
                      traffic and check every run against the consistency oracle."
    )]
    Sim(cmd::sim::SimArgs),

    #[command(
        next_help_heading = "Store",
        about = "Inspect a notification store",
        after_help = "EXAMPLES:\n    # List an owner's notifications\n    nudge inbox --db nudge.sqlite3 --owner coach-1 list\n\n\
                      # Emit machine-readable output\n    nudge inbox --db nudge.sqlite3 --owner coach-1 list --format json"
    )]
    Inbox(cmd::inbox::InboxArgs),

    #[command(
        next_help_heading = "Preferences",
        about = "Show or update alert settings",
        after_help = "EXAMPLES:\n    nudge settings show\n    nudge settings set --sound off --push on"
    )]
    Settings(cmd::settings::SettingsArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NUDGE_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "nudge=debug,info"
        } else {
            "nudge=info,warn"
        })
    });

    let format = env::var("NUDGE_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so `--format json` output stays parseable.
    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = resolve_output_mode(cli.format, cli.json);
    debug!(?output, "resolved output mode");

    match &cli.command {
        Commands::Sim(args) => match &args.command {
            cmd::sim::SimCommand::Run(run) => cmd::sim::run_sim_run(run, output),
            cmd::sim::SimCommand::Replay(replay) => cmd::sim::run_sim_replay(replay, output),
        },
        Commands::Inbox(args) => cmd::inbox::run_inbox(args, output),
        Commands::Settings(args) => cmd::settings::run_settings(args, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn json_flag_parses_anywhere() {
        let cli = Cli::try_parse_from(["nudge", "sim", "replay", "--seed", "3", "--json"])
            .expect("parse");
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Sim(_)));
    }

    #[test]
    fn read_requires_ids_or_all() {
        let err = Cli::try_parse_from(["nudge", "inbox", "--db", "x", "--owner", "o", "read"]);
        assert!(err.is_err());
        let ok = Cli::try_parse_from(["nudge", "inbox", "--db", "x", "--owner", "o", "read", "--all"]);
        assert!(ok.is_ok());
    }
}
