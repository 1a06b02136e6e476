//! `lorekeep ingest`: Index or remove a backstory or document.

use crate::SourceKind;
use std::path::Path;

pub async fn run(
    kind: SourceKind,
    owner: &str,
    user: &str,
    file: &Path,
    remove: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let engine = super::open_engine(&config).await?;

    if remove {
        let removed = match kind {
            SourceKind::Backstory => engine.remove_backstory(owner, user).await?,
            SourceKind::Document => engine.remove_document(owner, user).await?,
        };
        if removed {
            println!("Removed {owner} for {user}");
        } else {
            println!("Nothing indexed for {owner} / {user}");
        }
        return Ok(());
    }

    let text = std::fs::read_to_string(file).map_err(|e| format!("{}: {e}", file.display()))?;
    let chunks = match kind {
        SourceKind::Backstory => engine.save_backstory(owner, user, &text).await?,
        SourceKind::Document => engine.save_document(owner, user, &text).await?,
    };
    println!("Indexed {} as {chunks} chunks", file.display());
    Ok(())
}
