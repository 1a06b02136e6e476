//! `lorekeep context`: Assemble and print the context for one message.

use lorekeep_core::message::{ConversationTurn, Role};
use lorekeep_core::setting::SettingRecord;
use lorekeep_engine::{ContextEngine, ExternalSources};
use lorekeep_memory::{InMemoryDocuments, InMemoryHistory, InMemorySettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ContextArgs {
    pub user: String,
    pub character: String,
    pub session: String,
    pub message: String,
    pub ceiling: Option<usize>,
    pub setting: Option<PathBuf>,
    pub history: Option<PathBuf>,
    pub documents: Vec<String>,
    pub report: bool,
}

/// One turn of a history file.
#[derive(Deserialize)]
struct TurnLine {
    role: Role,
    content: String,
}

pub async fn run(args: ContextArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;

    let settings = InMemorySettings::new();
    if let Some(path) = &args.setting {
        settings.put(read_setting(path, &args.character)?).await;
    }

    let history = InMemoryHistory::new();
    if let Some(path) = &args.history {
        for turn in read_history(path, &args.session)? {
            history.append(turn).await;
        }
    }

    let documents = InMemoryDocuments::new();
    for document_id in &args.documents {
        documents.attach(&args.user, &args.character, document_id).await;
    }

    let engine = ContextEngine::from_config(
        &config,
        ExternalSources {
            history: Arc::new(history),
            settings: Arc::new(settings),
            documents: Arc::new(documents),
        },
    )
    .await?;

    let ceiling = args.ceiling.unwrap_or(engine.default_ceiling());
    let assembled = engine
        .build_context(&args.user, &args.character, &args.session, &args.message, ceiling)
        .await?;

    println!("{}", assembled.prompt);
    println!("\n{}", assembled.user_message);

    for warning in &assembled.warnings {
        eprintln!("warning: {warning}");
    }
    for note in &assembled.degraded {
        eprintln!("degraded: {} ({})", note.source, note.reason);
    }

    if args.report {
        println!("\n── Budget (ceiling {ceiling}, reserved {}) ──", assembled.budget.reserved);
        for section in &assembled.sections {
            let granted = assembled.budget.granted(section.source);
            println!(
                "  {:<10} {:>5} / {:>5} tokens   {}/{} items",
                section.source.as_str(),
                section.tokens,
                granted,
                section.items_included,
                section.items_total
            );
        }
        println!("  total      {:>5} tokens", assembled.total_tokens());
    }
    Ok(())
}

/// A setting record from TOML. `character_id` may be omitted.
fn read_setting(path: &Path, character_id: &str) -> Result<SettingRecord, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let mut table: toml::Table = toml::from_str(&content).map_err(|e| format!("{}: {e}", path.display()))?;
    if !table.contains_key("character_id") {
        table.insert("character_id".into(), toml::Value::String(character_id.to_string()));
    }
    let record = SettingRecord::deserialize(toml::Value::Table(table))
        .map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(record)
}

fn read_history(path: &Path, session_id: &str) -> Result<Vec<ConversationTurn>, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let lines: Vec<TurnLine> = serde_json::from_str(&content).map_err(|e| format!("{}: {e}", path.display()))?;
    Ok(lines
        .into_iter()
        .map(|line| ConversationTurn::new(session_id, line.role, line.content))
        .collect())
}
