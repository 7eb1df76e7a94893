use std::collections::HashMap;

use tree_sitter::Node;

use super::generic::collect_calls;
use super::{EdgeExtractor, RawCall, SourceFile};
use crate::chunker::Chunk;
use crate::error::{IndexError, Result};

/// Python call extraction with import-alias tracking.
///
/// `from m import a as b; b()` is recorded as a call to `a` with import hint
/// `m`, and `import m as n; n.f()` as a call to `f` hinted to `m`. Calls on
/// `self`/`cls` are qualified with the enclosing class.
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonCallExtractor;

#[derive(Debug, Default, PartialEq, Eq)]
struct ImportMap {
    /// Local module name → imported module path.
    modules: HashMap<String, String>,
    /// Local name → (original name, module path).
    names: HashMap<String, (String, String)>,
}

impl EdgeExtractor for PythonCallExtractor {
    fn name(&self) -> &'static str {
        "python"
    }

    fn extract_edges(&self, file: &SourceFile<'_>, chunks: &[Chunk]) -> Result<Vec<RawCall>> {
        let tree = file
            .tree
            .ok_or_else(|| IndexError::Parse(format!("no syntax tree for {}", file.path)))?;
        let imports = import_map(tree.root_node(), file.source);

        let sites = collect_calls(file, chunks)?;
        Ok(sites
            .into_iter()
            .map(|site| {
                let mut call = site.call;
                match call.qualifier.as_deref() {
                    Some("self" | "cls") => call.qualifier = site.owner,
                    Some(q) => {
                        let (head, rest) = q.split_once('.').unwrap_or((q, ""));
                        let module = imports.modules.get(head).cloned().or_else(|| {
                            imports
                                .names
                                .get(head)
                                .map(|(orig, module)| join_module(module, orig))
                        });
                        if let Some(module) = module {
                            let full = if rest.is_empty() {
                                module
                            } else {
                                format!("{module}.{rest}")
                            };
                            call.qualifier = Some(full.clone());
                            call.import_hint = Some(full);
                        }
                    }
                    None => {
                        if let Some((orig, module)) = imports.names.get(&call.callee) {
                            call.callee.clone_from(orig);
                            call.import_hint = Some(module.clone());
                        }
                    }
                }
                call
            })
            .collect())
    }
}

fn join_module(module: &str, name: &str) -> String {
    if module.ends_with('.') {
        format!("{module}{name}")
    } else {
        format!("{module}.{name}")
    }
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    &source[node.byte_range()]
}

fn import_map(root: Node<'_>, source: &str) -> ImportMap {
    let mut map = ImportMap::default();
    let child_count = u32::try_from(root.named_child_count()).unwrap_or(u32::MAX);
    for i in 0..child_count {
        let Some(stmt) = root.named_child(i) else {
            continue;
        };
        match stmt.kind() {
            "import_statement" => {
                let mut cursor = stmt.walk();
                for name in stmt.children_by_field_name("name", &mut cursor) {
                    if name.kind() == "aliased_import" {
                        if let (Some(module), Some(alias)) = (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) {
                            map.modules
                                .insert(text(alias, source).into(), text(module, source).into());
                        }
                    } else {
                        let module = text(name, source);
                        let head = module.split('.').next().unwrap_or(module);
                        map.modules.insert(head.into(), head.into());
                    }
                }
            }
            "import_from_statement" => {
                let Some(module) = stmt.child_by_field_name("module_name") else {
                    continue;
                };
                let module = text(module, source).to_string();
                let mut cursor = stmt.walk();
                for name in stmt.children_by_field_name("name", &mut cursor) {
                    let (orig, local) = if name.kind() == "aliased_import" {
                        match (
                            name.child_by_field_name("name"),
                            name.child_by_field_name("alias"),
                        ) {
                            (Some(orig), Some(alias)) => (text(orig, source), text(alias, source)),
                            _ => continue,
                        }
                    } else {
                        (text(name, source), text(name, source))
                    };
                    map.names
                        .insert(local.into(), (orig.into(), module.clone()));
                }
            }
            _ => {}
        }
    }
    map
}

#[cfg(all(test, feature = "lang-python"))]
mod tests {
    use super::super::test_support::extract_calls;
    use super::*;

    const SOURCE: &str = "\
import os.path
import numpy as np
from pkg.helpers import load as load_cfg, save
from . import sibling

class Greeter:
    def hello(self):
        self.render()
        load_cfg()
        save()
        np.zeros(3)
        os.path.join('a')
        sibling.run()

    def render(self):
        pass
";

    fn parse_imports(source: &str) -> ImportMap {
        let mut parser = tree_sitter::Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .unwrap();
        let tree = parser.parse(source, None).unwrap();
        import_map(tree.root_node(), source)
    }

    #[test]
    fn import_aliases_collected() {
        let map = parse_imports(SOURCE);
        assert_eq!(map.modules.get("np").map(String::as_str), Some("numpy"));
        assert_eq!(map.modules.get("os").map(String::as_str), Some("os"));
        assert_eq!(
            map.names.get("load_cfg"),
            Some(&("load".to_string(), "pkg.helpers".to_string()))
        );
        assert_eq!(
            map.names.get("save"),
            Some(&("save".to_string(), "pkg.helpers".to_string()))
        );
        assert_eq!(
            map.names.get("sibling"),
            Some(&("sibling".to_string(), ".".to_string()))
        );
    }

    #[test]
    fn relative_module_join() {
        assert_eq!(join_module(".", "sibling"), ".sibling");
        assert_eq!(join_module("pkg", "mod"), "pkg.mod");
    }

    #[test]
    fn calls_rewritten_through_imports() {
        let (_, calls) = extract_calls(&PythonCallExtractor, "python", "app.py", SOURCE);
        let summary: Vec<_> = calls
            .iter()
            .map(|c| {
                (
                    c.callee.as_str(),
                    c.qualifier.as_deref(),
                    c.import_hint.as_deref(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("render", Some("Greeter"), None),
                ("load", None, Some("pkg.helpers")),
                ("save", None, Some("pkg.helpers")),
                ("zeros", Some("numpy"), Some("numpy")),
                ("join", Some("os.path"), Some("os.path")),
                ("run", Some(".sibling"), Some(".sibling")),
            ]
        );
    }
}
