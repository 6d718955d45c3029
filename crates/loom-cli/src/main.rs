mod cmd;
mod output;
mod root;
mod setup;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use loom_core::types::ReplayMode;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "loom",
    about = "Task ceremony orchestrator: decompose, negotiate, delegate, recover, synthesize",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .loom/ or .git/)
    #[arg(long, global = true, env = "LOOM_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .loom/ with a default config
    Init,

    /// Decompose a master task and start a ceremony
    Begin {
        /// The master task, in plain words
        master_task: String,

        /// Task graph file (YAML or JSON) to use instead of the decomposer
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Drive the ceremony to the end before returning
        #[arg(long)]
        run: bool,
    },

    /// Run one orchestration step: recover, offer, spawn
    Advance { ceremony: String },

    /// Advance until the ceremony is COMPLETE, DEGRADED or ABANDONED
    Run { ceremony: String },

    /// Show one ceremony's task table, or list all ceremonies
    Status { ceremony: Option<String> },

    /// Every task that did not complete, with attempts and reason
    Report { ceremony: String },

    /// Print the final artifact of a finished ceremony
    Synthesize {
        ceremony: String,

        /// Write the artifact to a file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Stop a ceremony and terminate its workers
    Abandon {
        ceremony: String,

        #[arg(long, default_value = "abandoned by operator")]
        reason: String,
    },

    /// Put a task back in line under a replay mode
    Replay {
        ceremony: String,
        task: String,

        /// resume, restart, selective or debug
        #[arg(long, default_value = "resume")]
        mode: ReplayMode,
    },

    /// Worker entry point (launched by the isolated transport)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        ceremony: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        worker_id: String,
        #[arg(long)]
        ledger: PathBuf,
        /// DEBUG replay: verbose logging
        #[arg(long)]
        debug: bool,
    },

    /// Inspect and validate .loom/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Worker { debug: true, .. } => tracing::Level::DEBUG,
        Commands::Run { .. } | Commands::Worker { .. } | Commands::Begin { run: true, .. } => {
            tracing::Level::INFO
        }
        _ => tracing::Level::WARN,
    };

    // Stdout carries command output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Begin {
            master_task,
            graph,
            run,
        } => cmd::ceremony::begin(&root, &master_task, graph.as_deref(), run, cli.json),
        Commands::Advance { ceremony } => cmd::ceremony::advance(&root, &ceremony, cli.json),
        Commands::Run { ceremony } => cmd::ceremony::run(&root, &ceremony, cli.json),
        Commands::Status { ceremony } => cmd::status::run(&root, ceremony.as_deref(), cli.json),
        Commands::Report { ceremony } => cmd::status::report(&root, &ceremony, cli.json),
        Commands::Synthesize { ceremony, output } => {
            cmd::ceremony::synthesize(&root, &ceremony, output.as_deref(), cli.json)
        }
        Commands::Abandon { ceremony, reason } => {
            cmd::ceremony::abandon(&root, &ceremony, &reason, cli.json)
        }
        Commands::Replay {
            ceremony,
            task,
            mode,
        } => cmd::ceremony::replay(&root, &ceremony, &task, mode, cli.json),
        Commands::Worker {
            ceremony,
            task,
            worker_id,
            ledger,
            debug,
        } => cmd::worker::run(&root, ceremony, task, worker_id, ledger, debug),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
