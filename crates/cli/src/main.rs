//! lorekeep CLI: the main entry point.
//!
//! Commands:
//! - `onboard` : Write the default config
//! - `chunk`   : Show how a file would be chunked
//! - `sanitize`: Run a message through the injection filter
//! - `ingest`  : Index a backstory or document
//! - `context` : Assemble the context for a message
//! - `facts`   : List and correct learned facts

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "lorekeep",
    about = "lorekeep — context assembly for character conversations",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SourceKind {
    Backstory,
    Document,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Onboard,

    /// Split a text file into chunks using the configured sizes
    Chunk {
        file: PathBuf,

        /// Override chunking.max_tokens
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Override chunking.overlap_tokens
        #[arg(long)]
        overlap: Option<usize>,
    },

    /// Neutralize injection attempts in a message
    Sanitize {
        text: String,

        /// Treat the text as retrieved content instead of user input
        #[arg(long)]
        context: bool,
    },

    /// Chunk, embed and index a backstory or document
    Ingest {
        #[arg(long, value_enum)]
        kind: SourceKind,

        /// Character id (backstory) or document id
        #[arg(long)]
        owner: String,

        #[arg(long)]
        user: String,

        file: PathBuf,

        /// Delete the indexed source instead of saving it
        #[arg(long)]
        remove: bool,
    },

    /// Assemble the prompt context for a message
    Context {
        #[arg(long)]
        user: String,

        #[arg(long)]
        character: String,

        #[arg(long, default_value = "cli")]
        session: String,

        #[arg(short, long)]
        message: String,

        /// Token ceiling; defaults to budget.default_ceiling
        #[arg(long)]
        ceiling: Option<usize>,

        /// TOML file with the character's setting record
        #[arg(long)]
        setting: Option<PathBuf>,

        /// JSON file with recent turns: [{"role": "user", "content": "..."}]
        #[arg(long)]
        history: Option<PathBuf>,

        /// Attach an indexed document (repeatable)
        #[arg(long = "document")]
        documents: Vec<String>,

        /// Print the budget report after the prompt
        #[arg(long)]
        report: bool,
    },

    /// Manage learned facts
    Facts {
        #[command(subcommand)]
        action: FactsAction,
    },
}

#[derive(Subcommand)]
enum FactsAction {
    /// List active facts, character-scoped first
    List {
        #[arg(long)]
        user: String,
        #[arg(long)]
        character: Option<String>,
    },
    /// Record a fact directly
    Set {
        #[arg(long)]
        user: String,
        #[arg(long)]
        character: Option<String>,
        /// name, preference, relationship, event, trait or other
        #[arg(long = "type", default_value = "other")]
        fact_type: String,
        key: String,
        value: String,
    },
    /// Correct the value of a fact by id
    Update { id: String, value: String },
    /// Delete a fact by id
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run()?,
        Commands::Chunk {
            file,
            max_tokens,
            overlap,
        } => commands::chunk::run(&file, max_tokens, overlap)?,
        Commands::Sanitize { text, context } => commands::sanitize::run(&text, context),
        Commands::Ingest {
            kind,
            owner,
            user,
            file,
            remove,
        } => commands::ingest::run(kind, &owner, &user, &file, remove).await?,
        Commands::Context {
            user,
            character,
            session,
            message,
            ceiling,
            setting,
            history,
            documents,
            report,
        } => {
            commands::context::run(commands::context::ContextArgs {
                user,
                character,
                session,
                message,
                ceiling,
                setting,
                history,
                documents,
                report,
            })
            .await?
        }
        Commands::Facts { action } => match action {
            FactsAction::List { user, character } => commands::facts::list(&user, character.as_deref()).await?,
            FactsAction::Set {
                user,
                character,
                fact_type,
                key,
                value,
            } => commands::facts::set(&user, character.as_deref(), &fact_type, &key, &value).await?,
            FactsAction::Update { id, value } => commands::facts::update(&id, &value).await?,
            FactsAction::Delete { id } => commands::facts::delete(&id).await?,
        },
    }

    Ok(())
}
