use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::RawCall;
use crate::chunker::ChunkKind;

/// How a callee name is bound to a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Unique name, else narrowed by owner, same file, then import hint.
    #[default]
    Scoped,
    /// Only globally unique names resolve.
    UniqueOnly,
}

/// A definition that calls can bind to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub id: String,
    pub file_path: String,
    pub name: String,
    pub kind: ChunkKind,
}

impl Symbol {
    fn short_name(&self) -> &str {
        self.name.rsplit_once('.').map_or(&self.name, |(_, n)| n)
    }
}

/// Collection-wide index of definitions by trailing name segment.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_short: HashMap<String, Vec<Symbol>>,
}

impl SymbolTable {
    /// Paragraph chunks are never call targets and are skipped.
    pub fn new(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        let mut by_short: HashMap<String, Vec<Symbol>> = HashMap::new();
        for symbol in symbols {
            if symbol.kind == ChunkKind::Paragraph {
                continue;
            }
            by_short
                .entry(symbol.short_name().to_string())
                .or_default()
                .push(symbol);
        }
        for list in by_short.values_mut() {
            list.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Self { by_short }
    }

    /// Chunks named `callee` or ending in `.callee`.
    #[must_use]
    pub fn candidates(&self, callee: &str) -> &[Symbol] {
        self.by_short.get(callee).map_or(&[], Vec::as_slice)
    }

    /// Chunk id the call binds to, or `None` if unknown or ambiguous.
    #[must_use]
    pub fn resolve(
        &self,
        call: &RawCall,
        caller_file: &str,
        policy: ResolutionPolicy,
    ) -> Option<String> {
        let all: Vec<&Symbol> = self.candidates(&call.callee).iter().collect();
        if all.len() == 1 {
            return Some(all[0].id.clone());
        }
        if all.is_empty() || policy == ResolutionPolicy::UniqueOnly {
            return None;
        }

        let owner_name = call
            .qualifier
            .as_deref()
            .map(|q| format!("{q}.{}", call.callee));
        let narrowers: [Box<dyn Fn(&Symbol) -> bool + '_>; 3] = [
            Box::new(|s| owner_name.as_deref().is_some_and(|n| s.name == n)),
            Box::new(|s| s.file_path == caller_file),
            Box::new(|s| {
                call.import_hint
                    .as_deref()
                    .is_some_and(|h| hint_matches(&s.file_path, h))
            }),
        ];

        let mut remaining = all;
        for narrow in &narrowers {
            let narrowed: Vec<&Symbol> = remaining.iter().copied().filter(|&s| narrow(s)).collect();
            match narrowed.len() {
                0 => {}
                1 => return Some(narrowed[0].id.clone()),
                _ => remaining = narrowed,
            }
        }
        None
    }
}

/// Dotted module segments of a source path: `pkg/util/__init__.py` → `[pkg, util]`.
fn module_segments(path: &str) -> Vec<&str> {
    let stem = path.rsplit_once('.').map_or(path, |(s, ext)| {
        if ext.contains('/') { path } else { s }
    });
    let mut segments: Vec<&str> = stem.split('/').filter(|s| !s.is_empty()).collect();
    if segments.last() == Some(&"__init__") || segments.last() == Some(&"index") {
        segments.pop();
    }
    segments
}

fn ends_with_segments(a: &[&str], b: &[&str]) -> bool {
    !b.is_empty() && a.len() >= b.len() && a[a.len() - b.len()..] == *b
}

/// Whether an import hint (`pkg.util`, `./util`, `crate::util`) names the
/// module at `path`. Leading hint segments may carry the symbol's class.
pub(crate) fn hint_matches(path: &str, hint: &str) -> bool {
    let module = module_segments(path);
    let hint: Vec<&str> = hint
        .split(['.', '/', ':'])
        .filter(|s| !s.is_empty())
        .collect();
    (1..=hint.len()).any(|n| {
        let prefix = &hint[..n];
        ends_with_segments(&module, prefix) || ends_with_segments(prefix, &module)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: &str, path: &str, name: &str) -> Symbol {
        Symbol {
            id: id.into(),
            file_path: path.into(),
            name: name.into(),
            kind: if name.contains('.') {
                ChunkKind::Method
            } else {
                ChunkKind::Function
            },
        }
    }

    fn call(callee: &str, qualifier: Option<&str>, hint: Option<&str>) -> RawCall {
        RawCall {
            caller: "caller".into(),
            callee: callee.into(),
            qualifier: qualifier.map(str::to_owned),
            import_hint: hint.map(str::to_owned),
            language: "python".into(),
            line: 1,
        }
    }

    #[test]
    fn unique_name_resolves() {
        let table = SymbolTable::new([sym("1", "b.py", "foo")]);
        assert_eq!(
            table.resolve(&call("foo", None, None), "a.py", ResolutionPolicy::Scoped),
            Some("1".into())
        );
    }

    #[test]
    fn method_suffix_is_a_candidate() {
        let table = SymbolTable::new([sym("1", "b.py", "Greeter.hello")]);
        assert_eq!(table.candidates("hello").len(), 1);
        assert!(table.candidates("Greeter.hello").is_empty());
    }

    #[test]
    fn paragraphs_are_not_symbols() {
        let table = SymbolTable::new([Symbol {
            id: "p".into(),
            file_path: "a.md".into(),
            name: "foo".into(),
            kind: ChunkKind::Paragraph,
        }]);
        assert!(table.candidates("foo").is_empty());
    }

    #[test]
    fn ambiguous_stays_unresolved() {
        let table = SymbolTable::new([sym("1", "b.py", "run"), sym("2", "c.py", "run")]);
        assert_eq!(
            table.resolve(&call("run", None, None), "a.py", ResolutionPolicy::Scoped),
            None
        );
    }

    #[test]
    fn owner_narrows_first() {
        let table = SymbolTable::new([
            sym("1", "a.py", "Greeter.render"),
            sym("2", "a.py", "Page.render"),
        ]);
        assert_eq!(
            table.resolve(
                &call("render", Some("Greeter"), None),
                "a.py",
                ResolutionPolicy::Scoped
            ),
            Some("1".into())
        );
    }

    #[test]
    fn same_file_narrows() {
        let table = SymbolTable::new([sym("1", "a.py", "run"), sym("2", "c.py", "run")]);
        assert_eq!(
            table.resolve(&call("run", None, None), "a.py", ResolutionPolicy::Scoped),
            Some("1".into())
        );
    }

    #[test]
    fn import_hint_narrows() {
        let table = SymbolTable::new([
            sym("1", "pkg/helpers.py", "load"),
            sym("2", "other/io.py", "load"),
        ]);
        assert_eq!(
            table.resolve(
                &call("load", None, Some("pkg.helpers")),
                "main.py",
                ResolutionPolicy::Scoped
            ),
            Some("1".into())
        );
    }

    #[test]
    fn unique_only_ignores_scope() {
        let table = SymbolTable::new([sym("1", "a.py", "run"), sym("2", "c.py", "run")]);
        assert_eq!(
            table.resolve(&call("run", None, None), "a.py", ResolutionPolicy::UniqueOnly),
            None
        );
    }

    #[test]
    fn hint_matching() {
        assert!(hint_matches("pkg/helpers.py", "pkg.helpers"));
        assert!(hint_matches("src/pkg/helpers.py", "helpers"));
        assert!(hint_matches("pkg/__init__.py", "pkg"));
        assert!(hint_matches("pkg/mod.py", "pkg.mod.Greeter"));
        assert!(hint_matches("src/util.ts", "./util"));
        assert!(!hint_matches("pkg/helpers.py", "numpy"));
    }

    #[test]
    fn policy_deserializes_snake_case() {
        let p: ResolutionPolicy = serde_json::from_str("\"unique_only\"").unwrap();
        assert_eq!(p, ResolutionPolicy::UniqueOnly);
    }
}
