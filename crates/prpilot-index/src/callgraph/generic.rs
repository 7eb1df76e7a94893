use tree_sitter::Node;

use super::{EdgeExtractor, RawCall, SourceFile, enclosing_chunk};
use crate::chunker::Chunk;
use crate::error::{IndexError, Result};
use crate::languages::Grammar;

/// Member-access fields holding the accessed name, tried in order.
const MEMBER_NAME_FIELDS: &[&str] = &["property", "field", "attribute", "name"];
/// Member-access fields holding the receiver, tried in order.
const RECEIVER_FIELDS: &[&str] = &["object", "operand", "value", "path", "scope", "argument"];
/// Receivers naming the enclosing type.
const SELF_RECEIVERS: &[&str] = &["self", "this", "Self"];

/// Grammar-table-driven call extraction, shared by every Tier-1 language.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrammarCallExtractor;

impl EdgeExtractor for GrammarCallExtractor {
    fn name(&self) -> &'static str {
        "grammar"
    }

    fn extract_edges(&self, file: &SourceFile<'_>, chunks: &[Chunk]) -> Result<Vec<RawCall>> {
        let calls = collect_calls(file, chunks)?;
        Ok(calls
            .into_iter()
            .map(|mut site| {
                if let Some(q) = site.call.qualifier.as_deref()
                    && SELF_RECEIVERS.contains(&q)
                {
                    site.call.qualifier = site.owner;
                }
                site.call
            })
            .collect())
    }
}

/// A call plus the owner of its calling chunk.
pub(crate) struct CallSite {
    pub call: RawCall,
    pub owner: Option<String>,
}

/// Walk the file's tree and attribute every call node to its enclosing chunk.
pub(crate) fn collect_calls(file: &SourceFile<'_>, chunks: &[Chunk]) -> Result<Vec<CallSite>> {
    let grammar = file
        .entry
        .grammar
        .as_ref()
        .ok_or_else(|| IndexError::Parse(format!("no grammar for {}", file.entry.id)))?;
    let tree = file
        .tree
        .ok_or_else(|| IndexError::Parse(format!("no syntax tree for {}", file.path)))?;

    let mut out = Vec::new();
    let mut stack = vec![tree.root_node()];
    while let Some(node) = stack.pop() {
        if grammar.calls.contains(&node.kind())
            && let Some((callee, qualifier)) = callee_of(node, grammar, file.source)
            && let Some(caller) = enclosing_chunk(chunks, node.start_byte(), node.end_byte())
        {
            out.push(CallSite {
                owner: caller.owner().map(str::to_owned),
                call: RawCall {
                    caller: caller.id.clone(),
                    callee,
                    qualifier,
                    import_hint: None,
                    language: file.entry.id.to_string(),
                    line: node.start_position().row + 1,
                },
            });
        }
        let child_count = u32::try_from(node.named_child_count()).unwrap_or(u32::MAX);
        for i in (0..child_count).rev() {
            if let Some(child) = node.named_child(i) {
                stack.push(child);
            }
        }
    }
    Ok(out)
}

fn callee_of(call: Node<'_>, grammar: &Grammar, source: &str) -> Option<(String, Option<String>)> {
    let target = grammar
        .callee_fields
        .iter()
        .find_map(|f| call.child_by_field_name(f))?;
    let (name, qualifier) = reduce(target, grammar, source)?;
    // Java-style invocations carry the receiver on the call node itself.
    let qualifier = qualifier.or_else(|| {
        call.child_by_field_name("object")
            .map(|n| source[n.byte_range()].to_string())
    });
    Some((name, qualifier))
}

/// Reduce a callee expression through member, selector and scoped nodes to
/// its final identifier and receiver text.
fn reduce(node: Node<'_>, grammar: &Grammar, source: &str) -> Option<(String, Option<String>)> {
    let kind = node.kind();
    if grammar.identifiers.contains(&kind) || grammar.type_identifiers.contains(&kind) {
        let text = source[node.byte_range()].trim();
        return (!text.is_empty()).then(|| (text.to_string(), None));
    }
    for field in MEMBER_NAME_FIELDS {
        if let Some(member) = node.child_by_field_name(field) {
            let (name, _) = reduce(member, grammar, source)?;
            let receiver = RECEIVER_FIELDS
                .iter()
                .find_map(|f| node.child_by_field_name(f))
                .map(|n| source[n.byte_range()].to_string());
            return Some((name, receiver));
        }
    }
    node.child_by_field_name("function")
        .and_then(|inner| reduce(inner, grammar, source))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::extract_calls;
    use super::*;

    fn summary(calls: &[RawCall]) -> Vec<(String, Option<String>)> {
        calls
            .iter()
            .map(|c| (c.callee.clone(), c.qualifier.clone()))
            .collect()
    }

    #[cfg(feature = "lang-rust")]
    #[test]
    fn rust_calls_with_receivers() {
        let source = r"
struct Foo;
impl Foo {
    fn run(&self) {
        self.step();
        helper();
        std::mem::drop(1);
    }
    fn step(&self) {}
}
fn helper() {}
";
        let (extraction, calls) = extract_calls(&GrammarCallExtractor, "rust", "src/foo.rs", source);
        let run = extraction.chunks.iter().find(|c| c.name == "Foo.run").unwrap();
        assert!(calls.iter().all(|c| c.caller == run.id));
        assert_eq!(
            summary(&calls),
            vec![
                ("step".to_string(), Some("Foo".to_string())),
                ("helper".to_string(), None),
                ("drop".to_string(), Some("std::mem".to_string())),
            ]
        );
        assert_eq!(calls[0].line, 5);
    }

    #[cfg(feature = "lang-go")]
    #[test]
    fn go_selector_calls() {
        let source = "package main\n\nimport \"fmt\"\n\nfunc main() {\n\tfmt.Println(greet())\n}\n\nfunc greet() string { return \"hi\" }\n";
        let (_, calls) = extract_calls(&GrammarCallExtractor, "go", "main.go", source);
        assert_eq!(
            summary(&calls),
            vec![
                ("Println".to_string(), Some("fmt".to_string())),
                ("greet".to_string(), None),
            ]
        );
    }

    #[cfg(feature = "lang-js")]
    #[test]
    fn js_member_and_this_calls() {
        let source = "class Api {\n  load() { return this.fetch(); }\n  fetch() { return http.get('/'); }\n}\n";
        let (_, calls) = extract_calls(&GrammarCallExtractor, "javascript", "api.js", source);
        assert_eq!(
            summary(&calls),
            vec![
                ("fetch".to_string(), Some("Api".to_string())),
                ("get".to_string(), Some("http".to_string())),
            ]
        );
    }

    #[cfg(feature = "lang-java")]
    #[test]
    fn java_invocations_and_constructors() {
        let source = "class Svc {\n  void run() {\n    repo.save(new Item());\n    audit();\n  }\n}\n";
        let (_, calls) = extract_calls(&GrammarCallExtractor, "java", "Svc.java", source);
        let names: Vec<_> = calls.iter().map(|c| c.callee.as_str()).collect();
        assert_eq!(names, vec!["save", "Item", "audit"]);
        assert_eq!(calls[0].qualifier.as_deref(), Some("repo"));
    }

    #[cfg(feature = "lang-bash")]
    #[test]
    fn bash_commands_are_calls() {
        let source = "deploy() {\n  build\n  echo done\n}\nbuild() {\n  make\n}\n";
        let (_, calls) = extract_calls(&GrammarCallExtractor, "bash", "ci.sh", source);
        let names: Vec<_> = calls.iter().map(|c| c.callee.as_str()).collect();
        assert_eq!(names, vec!["build", "echo", "make"]);
    }

    #[cfg(feature = "lang-python")]
    #[test]
    fn top_level_calls_are_ignored() {
        let source = "def f():\n    g()\n\nf()\n";
        let (_, calls) = extract_calls(&GrammarCallExtractor, "python", "m.py", source);
        assert_eq!(summary(&calls), vec![("g".to_string(), None)]);
    }
}
