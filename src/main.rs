//! # Knowledge Harness CLI (`kb`)
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb init` | Create the SQLite database and run schema migrations |
//! | `kb upload <path>…` | Upload files or directories and ingest them |
//! | `kb ingest <id>…` | Ingest pending documents |
//! | `kb reingest <id>` | Re-run ingestion for a finished document |
//! | `kb reset <id>` | Reset a document stuck in `processing` |
//! | `kb list` | List documents, newest first |
//! | `kb get <id>` | Show a document's status and diagnostics |
//! | `kb chunks <id>` | Print a document's chunks in order |
//! | `kb delete <id>` | Delete a document and everything derived from it |
//! | `kb query "<q>"` | Retrieve relevant chunks (`--answer` to generate) |
//! | `kb serve` | Start the HTTP server |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use knowledge_harness::app::App;
use knowledge_harness::{commands, config, migrate, server};

/// Knowledge Harness: multi-format document ingestion and retrieval.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/kb.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Knowledge Harness: multi-format document ingestion and retrieval",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Upload files and ingest them.
    ///
    /// Directories are walked recursively; hidden entries are skipped.
    Upload {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Store the files as pending without ingesting them.
        #[arg(long)]
        no_ingest: bool,
    },

    /// Ingest pending documents by id.
    Ingest {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Move a completed or failed document back to pending and ingest it.
    Reingest { id: String },

    /// Reset a document stuck in `processing` back to pending.
    Reset { id: String },

    /// List documents, newest first.
    List {
        #[arg(long, default_value = "50")]
        limit: i64,

        #[arg(long, default_value = "0")]
        offset: i64,
    },

    /// Show a document's status, encoding and diagnostics.
    Get { id: String },

    /// Print a document's chunks in ordinal order.
    Chunks { id: String },

    /// Delete a document with its chunks, vectors and stored bytes.
    Delete { id: String },

    /// Retrieve the chunks most relevant to a query.
    Query {
        query: String,

        /// Number of chunks to return (defaults to `retrieval.final_top_k`).
        #[arg(long)]
        top_k: Option<usize>,

        /// Generate an answer from the retrieved chunks.
        #[arg(long)]
        answer: bool,
    },

    /// Start the HTTP server on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let app = App::from_config(cfg).await?;

    match cli.command {
        Commands::Init => {}
        Commands::Upload { paths, no_ingest } => {
            commands::run_upload(&app, &paths, no_ingest).await?;
        }
        Commands::Ingest { ids } => {
            commands::run_ingest(&app, &ids).await?;
        }
        Commands::Reingest { id } => {
            commands::run_reingest(&app, &id).await?;
        }
        Commands::Reset { id } => {
            commands::run_reset(&app, &id).await?;
        }
        Commands::List { limit, offset } => {
            commands::run_list(&app, limit, offset).await?;
        }
        Commands::Get { id } => {
            commands::run_get(&app, &id).await?;
        }
        Commands::Chunks { id } => {
            commands::run_chunks(&app, &id).await?;
        }
        Commands::Delete { id } => {
            commands::run_delete(&app, &id).await?;
        }
        Commands::Query {
            query,
            top_k,
            answer,
        } => {
            commands::run_query(&app, &query, top_k, answer).await?;
        }
        Commands::Serve => {
            server::run_server(app).await?;
        }
    }

    Ok(())
}
