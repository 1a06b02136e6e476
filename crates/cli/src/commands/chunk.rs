//! `lorekeep chunk`: Preview chunk boundaries for a file.

use lorekeep_core::token::estimate_tokens;
use lorekeep_memory::Chunker;
use std::path::Path;

pub fn run(file: &Path, max_tokens: Option<usize>, overlap: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;
    let text = std::fs::read_to_string(file).map_err(|e| format!("{}: {e}", file.display()))?;

    let chunker = Chunker::new(
        max_tokens.unwrap_or(config.chunking.max_tokens),
        overlap.unwrap_or(config.chunking.overlap_tokens),
    )?
    .with_min_chunk_tokens(config.chunking.min_chunk_tokens);
    let chunks = chunker.chunk(&text)?;

    println!(
        "{} → {} chunks (max {} tokens, overlap {})\n",
        file.display(),
        chunks.len(),
        chunker.max_tokens(),
        chunker.overlap_tokens()
    );
    for (i, chunk) in chunks.iter().enumerate() {
        println!("── chunk {i} · ~{} tokens", estimate_tokens(chunk));
        println!("{chunk}\n");
    }
    Ok(())
}
