//! Concerto CLI — validate and dry-run agent composition plans.
//!
//! Plans run against scripted fixture agents, so a plan's control flow
//! (retries, parallel merges, loops, routing, gates) can be exercised
//! without any real agent behind it.

use clap::{Parser, Subcommand};

use concerto_cli::commands;

/// Concerto — multi-agent workflow composition
#[derive(Parser)]
#[command(name = "concerto", version, about = "Concerto — multi-agent workflow composition")]
pub struct Cli {
    /// Engine config YAML (retry backoff, progress buffer, plan validation)
    #[arg(long, env = "CONCERTO_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and run composition plans
    Plan {
        #[command(subcommand)]
        action: PlanAction,
    },

    /// Inspect agent fixtures
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },
}

#[derive(Subcommand)]
enum PlanAction {
    /// Check a plan against the contracts in a fixture file
    Validate {
        /// Path to the plan YAML file
        plan: String,
        /// Path to the agent fixture YAML file
        #[arg(long)]
        agents: String,
    },
    /// Run a plan against scripted fixture agents
    Run {
        /// Path to the plan YAML file
        plan: String,
        /// Path to the agent fixture YAML file
        #[arg(long)]
        agents: String,
        /// Initial context as a JSON object
        #[arg(long)]
        context: Option<String>,
        /// Approve the gate with this name when it is reached (repeatable)
        #[arg(long)]
        approve: Vec<String>,
        /// Reject the gate with this name when it is reached (repeatable)
        #[arg(long)]
        reject: Vec<String>,
        /// Print the full workflow result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List the contracts declared in a fixture file
    List {
        /// Path to the agent fixture YAML file
        #[arg(long)]
        agents: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "concerto_core=warn,concerto_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Plan { action } => match action {
            PlanAction::Validate { plan, agents } => {
                commands::plan::validate(&plan, &agents).await
            }
            PlanAction::Run {
                plan,
                agents,
                context,
                approve,
                reject,
                json,
            } => match commands::load_engine_config(cli.config.as_deref()) {
                Ok(config) => {
                    let options = commands::plan::RunOptions {
                        context,
                        approve,
                        reject,
                        config,
                    };
                    commands::plan::run(&plan, &agents, options, json).await
                }
                Err(e) => Err(e),
            },
        },
        Commands::Agents { action } => match action {
            AgentsAction::List { agents } => commands::agents::list(&agents).await,
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
