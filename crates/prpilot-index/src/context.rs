//! Contextualized embedding text generation.
//!
//! Raw code embeds poorly on its own. Prepending the file path, owner scope,
//! language tag and a few imports places a chunk near the code it belongs with.

use crate::chunker::Chunk;

/// Maximum number of import lines included in the embedding text.
pub const MAX_IMPORT_LINES: usize = 5;

/// Text sent to the embedding provider for `chunk`.
#[must_use]
pub fn contextualize_for_embedding(chunk: &Chunk, imports: &str) -> String {
    let mut text = String::with_capacity(chunk.text.len() + 256);

    text.push_str("# ");
    text.push_str(&chunk.file_path);
    text.push('\n');

    if !chunk.scope.is_empty() {
        text.push_str("# Scope: ");
        text.push_str(&chunk.scope);
        text.push('\n');
    }

    text.push_str("# Language: ");
    text.push_str(&chunk.language);
    text.push('\n');

    for line in imports
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(MAX_IMPORT_LINES)
    {
        text.push_str(line);
        text.push('\n');
    }

    text.push_str(&chunk.text);
    text
}

/// Short header used when printing retrieved chunks.
#[must_use]
pub fn chunk_display_header(chunk: &Chunk) -> String {
    format!(
        "{} :: {} (lines {}-{})",
        chunk.file_path, chunk.name, chunk.start_line, chunk.end_line
    )
}
