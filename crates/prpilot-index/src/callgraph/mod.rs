//! Call extraction and symbol resolution.
//!
//! Extractors turn one parsed file into [`RawCall`]s: caller chunk plus a
//! symbolic callee. Resolution against the collection's symbol table happens
//! later in [`resolve`], so a file's raw calls never need re-parsing when
//! other files change.

pub mod dot;
pub mod generic;
pub mod python;
pub mod resolve;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tree_sitter::Tree;

use crate::chunker::Chunk;
use crate::config::ExternalToolConfig;
use crate::error::Result;
use crate::languages::LanguageEntry;

pub use dot::DotToolExtractor;
pub use generic::GrammarCallExtractor;
pub use python::PythonCallExtractor;
pub use resolve::{ResolutionPolicy, Symbol, SymbolTable};

/// One parsed file handed to an extractor.
#[derive(Debug, Clone, Copy)]
pub struct SourceFile<'a> {
    /// Path relative to the repository root, as stored in chunks.
    pub path: &'a str,
    /// Absolute path on disk, for external tools.
    pub abs_path: &'a Path,
    pub source: &'a str,
    pub entry: &'a LanguageEntry,
    pub tree: Option<&'a Tree>,
}

/// An unresolved call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCall {
    /// Chunk id of the calling definition.
    pub caller: String,
    /// Final identifier of the callee (`bar` in `foo.bar()`).
    pub callee: String,
    /// Receiver text, or the enclosing class for `self` calls.
    pub qualifier: Option<String>,
    /// Module the callee was imported from.
    pub import_hint: Option<String>,
    pub language: String,
    /// 1-based line of the call site.
    pub line: usize,
}

pub trait EdgeExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw calls made by `chunks` of `file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be analyzed.
    fn extract_edges(&self, file: &SourceFile<'_>, chunks: &[Chunk]) -> Result<Vec<RawCall>>;
}

/// Picks the extractor for each language and normalizes its output.
pub struct CallGraphBuilder {
    generic: GrammarCallExtractor,
    python: PythonCallExtractor,
    tools: HashMap<String, DotToolExtractor>,
}

impl CallGraphBuilder {
    #[must_use]
    pub fn new(tools: &[ExternalToolConfig]) -> Self {
        Self {
            generic: GrammarCallExtractor,
            python: PythonCallExtractor,
            tools: tools
                .iter()
                .map(|t| {
                    (
                        t.language.clone(),
                        DotToolExtractor::new(t.command.clone(), t.args.clone())
                            .with_timeout(Duration::from_secs(t.timeout_secs)),
                    )
                })
                .collect(),
        }
    }

    fn extractor_for(&self, language: &str) -> &dyn EdgeExtractor {
        if let Some(tool) = self.tools.get(language) {
            return tool;
        }
        if language == "python" {
            &self.python
        } else {
            &self.generic
        }
    }

    /// Raw calls of one file, self-calls dropped and deduplicated on
    /// `(caller, callee, qualifier)`. Extractor failures yield no calls.
    #[must_use]
    pub fn extract(&self, file: &SourceFile<'_>, chunks: &[Chunk]) -> Vec<RawCall> {
        let extractor = self.extractor_for(file.entry.id);
        let calls = match extractor.extract_edges(file, chunks) {
            Ok(calls) => calls,
            Err(e) => {
                tracing::warn!(
                    file = %file.path,
                    extractor = extractor.name(),
                    "call extraction failed: {e:#}"
                );
                return Vec::new();
            }
        };
        normalize(calls, chunks)
    }
}

impl Default for CallGraphBuilder {
    fn default() -> Self {
        Self::new(&[])
    }
}

fn normalize(mut calls: Vec<RawCall>, chunks: &[Chunk]) -> Vec<RawCall> {
    let by_id: HashMap<&str, &Chunk> = chunks.iter().map(|c| (c.id.as_str(), c)).collect();
    calls.retain(|call| {
        let Some(caller) = by_id.get(call.caller.as_str()) else {
            return false;
        };
        !is_self_call(caller, call)
    });
    calls.sort_by(|a, b| {
        (&a.caller, &a.callee, &a.qualifier, a.line).cmp(&(
            &b.caller,
            &b.callee,
            &b.qualifier,
            b.line,
        ))
    });
    let mut seen = HashSet::new();
    calls.retain(|c| seen.insert((c.caller.clone(), c.callee.clone(), c.qualifier.clone())));
    calls.sort_by_key(|c| c.line);
    calls
}

/// A definition calling its own name on itself.
fn is_self_call(caller: &Chunk, call: &RawCall) -> bool {
    if caller.short_name() != call.callee {
        return false;
    }
    match call.qualifier.as_deref() {
        None => caller.owner().is_none(),
        Some(q) => caller.owner() == Some(q),
    }
}

/// Innermost function/method chunk containing `[start, end)`, else the
/// innermost chunk of any kind.
pub(crate) fn enclosing_chunk(chunks: &[Chunk], start: usize, end: usize) -> Option<&Chunk> {
    let containing = || {
        chunks
            .iter()
            .filter(move |c| c.start_byte <= start && end <= c.end_byte)
    };
    containing()
        .filter(|c| c.kind.is_callable())
        .min_by_key(|c| c.end_byte - c.start_byte)
        .or_else(|| containing().min_by_key(|c| c.end_byte - c.start_byte))
}
