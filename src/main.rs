//! # KB Indexer CLI (`kbx`)
//!
//! ## Usage
//!
//! ```bash
//! kbx --config ./config/kbx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbx init` | Create the SQLite database and run schema migrations |
//! | `kbx doc put <ws> <base> <doc> <file>` | Store a document version and queue it |
//! | `kbx enqueue <ws> <base> <doc>` | Queue an indexing job |
//! | `kbx worker` | Run the worker loop until Ctrl-C |
//! | `kbx jobs` | Show queue counts and recent jobs |
//! | `kbx action start\|show\|pause\|resume\|cancel` | Manage indexing runs |
//! | `kbx revision show <ws> <doc>` | Show a document's revisions |
//! | `kbx sweep` | Delete vectors of non-current revisions |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kb_indexer::commands::{self, ActionControl};
use kb_indexer::models::RunConfig;
use kb_indexer::{config, logging, migrate};

/// KB Indexer: chunk, embed and index knowledge-base documents.
#[derive(Parser)]
#[command(name = "kbx", version, about = "Knowledge-base indexing pipeline")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbx.toml")]
    config: PathBuf,

    /// Debug logging for this crate (overridden by KBX_LOG / RUST_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage document content.
    Doc {
        #[command(subcommand)]
        action: DocAction,
    },

    /// Queue an indexing job for a document.
    Enqueue {
        workspace: String,
        base: String,
        document: String,
        /// Version to index; defaults to the stored version.
        #[arg(long)]
        version: Option<String>,
    },

    /// Run the indexing worker.
    Worker {
        /// Drain the queue once and exit instead of polling forever.
        #[arg(long)]
        once: bool,
    },

    /// Show queue counts and recent jobs.
    Jobs {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long)]
        base: Option<String>,
        /// Only list jobs with this status (pending, processing, completed, failed).
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },

    /// Manage indexing actions (runs).
    Action {
        #[command(subcommand)]
        action: ActionCommand,
    },

    /// Inspect document revisions.
    Revision {
        #[command(subcommand)]
        action: RevisionAction,
    },

    /// Delete vectors that belong to no current revision.
    Sweep,
}

#[derive(Subcommand)]
enum DocAction {
    /// Store a document body from a file and queue it for indexing.
    Put {
        workspace: String,
        base: String,
        document: String,
        file: PathBuf,
        /// Version id; a fresh one is generated if omitted.
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Subcommand)]
enum ActionCommand {
    /// Start a new indexing run for a knowledge base.
    Start {
        workspace: String,
        base: String,
        /// Queue every document of the base.
        #[arg(long)]
        reindex: bool,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        chunk_size: Option<usize>,
        #[arg(long)]
        chunk_overlap: Option<usize>,
    },
    /// Show the latest run of a knowledge base.
    Show { workspace: String, base: String },
    Pause { action_id: String },
    Resume { action_id: String },
    Cancel { action_id: String },
}

#[derive(Subcommand)]
enum RevisionAction {
    Show { workspace: String, document: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Doc { action } => match action {
            DocAction::Put {
                workspace,
                base,
                document,
                file,
                version,
            } => {
                commands::run_doc_put(&cfg, &workspace, &base, &document, &file, version).await?;
            }
        },
        Commands::Enqueue {
            workspace,
            base,
            document,
            version,
        } => {
            commands::run_enqueue(&cfg, &workspace, &base, &document, version).await?;
        }
        Commands::Worker { once } => {
            commands::run_worker(&cfg, once).await?;
        }
        Commands::Jobs {
            workspace,
            base,
            status,
            limit,
        } => {
            commands::run_jobs(
                &cfg,
                workspace.as_deref(),
                base.as_deref(),
                status.as_deref(),
                limit,
            )
            .await?;
        }
        Commands::Action { action } => match action {
            ActionCommand::Start {
                workspace,
                base,
                reindex,
                provider,
                model,
                chunk_size,
                chunk_overlap,
            } => {
                let run_config = RunConfig {
                    provider_id: provider,
                    model,
                    chunk_size,
                    chunk_overlap,
                };
                commands::run_action_start(&cfg, &workspace, &base, run_config, reindex).await?;
            }
            ActionCommand::Show { workspace, base } => {
                commands::run_action_show(&cfg, &workspace, &base).await?;
            }
            ActionCommand::Pause { action_id } => {
                commands::run_action_control(&cfg, &action_id, ActionControl::Pause).await?;
            }
            ActionCommand::Resume { action_id } => {
                commands::run_action_control(&cfg, &action_id, ActionControl::Resume).await?;
            }
            ActionCommand::Cancel { action_id } => {
                commands::run_action_control(&cfg, &action_id, ActionControl::Cancel).await?;
            }
        },
        Commands::Revision { action } => match action {
            RevisionAction::Show {
                workspace,
                document,
            } => {
                commands::run_revision_show(&cfg, &workspace, &document).await?;
            }
        },
        Commands::Sweep => {
            commands::run_sweep(&cfg).await?;
        }
    }

    Ok(())
}
