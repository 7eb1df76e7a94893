//! Language registry: extensions, tiers and tree-sitter node categories.
//!
//! Every language is a [`LanguageEntry`] value. Extraction and call-graph code
//! only ever consult the entry's [`Grammar`] tables, so supporting a new
//! language means registering another entry.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Language id used for files handled by the paragraph splitter.
pub const TEXT_LANGUAGE: &str = "text";

/// Extraction tier of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Syntax-aware extraction through a tree-sitter grammar.
    One,
    /// Blank-line paragraph splitting.
    Two,
}

impl Tier {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }

    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        if v == 1 { Self::One } else { Self::Two }
    }
}

/// Syntax-node categories of a Tier-1 grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct Grammar {
    /// Function definitions; nested inside a class they become methods.
    pub functions: &'static [&'static str],
    /// Definitions that are always methods (e.g. Go `method_declaration`).
    pub methods: &'static [&'static str],
    /// Class, struct, trait and interface definitions.
    pub classes: &'static [&'static str],
    /// Call expressions.
    pub calls: &'static [&'static str],
    /// Fields of a call node holding the callee, tried in order.
    pub callee_fields: &'static [&'static str],
    /// Plain identifier kinds a callee reduces to.
    pub identifiers: &'static [&'static str],
    /// Import statements, collected as chunk context.
    pub imports: &'static [&'static str],
    /// Declarators naming an anonymous function value (`const f = () => {}`).
    pub bindings: &'static [&'static str],
    /// Anonymous function kinds accepted as a binding value.
    pub lambdas: &'static [&'static str],
    /// Type name kinds, used for receiver and impl owners.
    pub type_identifiers: &'static [&'static str],
}

/// One registered language.
#[derive(Clone)]
pub struct LanguageEntry {
    pub id: &'static str,
    pub extensions: &'static [&'static str],
    pub grammar: Option<Grammar>,
    pub language: Option<tree_sitter::Language>,
}

impl LanguageEntry {
    /// Tier-1 only when both the node tables and a compiled grammar are present.
    #[must_use]
    pub fn tier(&self) -> Tier {
        if self.grammar.is_some() && self.language.is_some() {
            Tier::One
        } else {
            Tier::Two
        }
    }
}

impl fmt::Debug for LanguageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LanguageEntry")
            .field("id", &self.id)
            .field("extensions", &self.extensions)
            .field("tier", &self.tier())
            .finish_non_exhaustive()
    }
}

/// Outcome of resolving a path against the registry.
#[derive(Debug, Clone, Copy)]
pub enum Lookup<'a> {
    Language(&'a LanguageEntry),
    /// Unregistered extension; handled by the Tier-2 splitter.
    Text,
    /// Binary extension; never indexed.
    Skip,
}

/// Extensions never read as source.
pub const DEFAULT_BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff", "psd", "pdf", "zip", "gz", "tgz",
    "bz2", "xz", "7z", "rar", "tar", "jar", "war", "class", "so", "dll", "dylib", "exe", "bin",
    "o", "a", "lib", "obj", "pyc", "pyo", "whl", "woff", "woff2", "ttf", "otf", "eot", "mp3",
    "mp4", "wav", "ogg", "flac", "avi", "mov", "mkv", "webm", "sqlite", "db", "npy", "pkl",
];

/// Extension → language table, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct GrammarRegistry {
    entries: Vec<LanguageEntry>,
    by_ext: HashMap<String, usize>,
    skip_exts: HashSet<String>,
}

impl GrammarRegistry {
    /// Empty registry with no languages and no skipped extensions.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            by_ext: HashMap::new(),
            skip_exts: HashSet::new(),
        }
    }

    /// Registry with every built-in language and the default binary set.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for entry in builtin_entries() {
            registry.register(entry);
        }
        registry.skip_extensions(DEFAULT_BINARY_EXTENSIONS.iter().copied());
        registry
    }

    /// Register a language. Later registrations win for shared extensions.
    pub fn register(&mut self, entry: LanguageEntry) {
        let idx = match self.entries.iter().position(|e| e.id == entry.id) {
            Some(idx) => {
                self.entries[idx] = entry;
                idx
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        };
        for ext in self.entries[idx].extensions {
            self.by_ext.insert(ext.to_ascii_lowercase(), idx);
        }
    }

    /// Add extensions whose files are skipped outright.
    pub fn skip_extensions<'a>(&mut self, exts: impl IntoIterator<Item = &'a str>) {
        self.skip_exts
            .extend(exts.into_iter().map(|e| e.trim_start_matches('.').to_ascii_lowercase()));
    }

    /// Resolve a path by its extension, case-insensitively.
    #[must_use]
    pub fn lookup(&self, path: &Path) -> Lookup<'_> {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return Lookup::Text;
        };
        let ext = ext.to_ascii_lowercase();
        if self.skip_exts.contains(&ext) {
            return Lookup::Skip;
        }
        match self.by_ext.get(&ext) {
            Some(&idx) => Lookup::Language(&self.entries[idx]),
            None => Lookup::Text,
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&LanguageEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LanguageEntry> {
        self.entries.iter()
    }
}

impl Default for GrammarRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Compiled tree-sitter grammar for a built-in id. Returns `None` if the
/// corresponding feature is not enabled.
fn compiled_grammar(id: &str) -> Option<tree_sitter::Language> {
    match id {
        #[cfg(feature = "lang-python")]
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        #[cfg(feature = "lang-rust")]
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        #[cfg(feature = "lang-js")]
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        #[cfg(feature = "lang-js")]
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        #[cfg(feature = "lang-js")]
        "tsx" => Some(tree_sitter_typescript::LANGUAGE_TSX.into()),
        #[cfg(feature = "lang-go")]
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        #[cfg(feature = "lang-java")]
        "java" => Some(tree_sitter_java::LANGUAGE.into()),
        #[cfg(feature = "lang-bash")]
        "bash" => Some(tree_sitter_bash::LANGUAGE.into()),
        _ => None,
    }
}

const PYTHON: Grammar = Grammar {
    functions: &["function_definition"],
    methods: &[],
    classes: &["class_definition"],
    calls: &["call"],
    callee_fields: &["function"],
    identifiers: &["identifier"],
    imports: &["import_statement", "import_from_statement"],
    bindings: &[],
    lambdas: &[],
    type_identifiers: &[],
};

const RUST: Grammar = Grammar {
    functions: &["function_item"],
    methods: &[],
    classes: &["struct_item", "enum_item", "union_item", "trait_item", "impl_item"],
    calls: &["call_expression"],
    callee_fields: &["function"],
    identifiers: &["identifier", "field_identifier"],
    imports: &["use_declaration"],
    bindings: &[],
    lambdas: &[],
    type_identifiers: &["type_identifier"],
};

const JAVASCRIPT: Grammar = Grammar {
    functions: &["function_declaration", "generator_function_declaration"],
    methods: &["method_definition"],
    classes: &["class_declaration"],
    calls: &["call_expression"],
    callee_fields: &["function"],
    identifiers: &["identifier", "property_identifier"],
    imports: &["import_statement"],
    bindings: &["variable_declarator"],
    lambdas: &["arrow_function", "function_expression", "function"],
    type_identifiers: &[],
};

const TYPESCRIPT: Grammar = Grammar {
    functions: &["function_declaration", "generator_function_declaration"],
    methods: &["method_definition"],
    classes: &[
        "class_declaration",
        "abstract_class_declaration",
        "interface_declaration",
    ],
    calls: &["call_expression"],
    callee_fields: &["function"],
    identifiers: &["identifier", "property_identifier"],
    imports: &["import_statement"],
    bindings: &["variable_declarator"],
    lambdas: &["arrow_function", "function_expression", "function"],
    type_identifiers: &["type_identifier"],
};

const GO: Grammar = Grammar {
    functions: &["function_declaration"],
    methods: &["method_declaration"],
    classes: &["type_spec"],
    calls: &["call_expression"],
    callee_fields: &["function"],
    identifiers: &["identifier", "field_identifier"],
    imports: &["import_declaration"],
    bindings: &[],
    lambdas: &[],
    type_identifiers: &["type_identifier"],
};

const JAVA: Grammar = Grammar {
    functions: &["method_declaration", "constructor_declaration"],
    methods: &[],
    classes: &[
        "class_declaration",
        "interface_declaration",
        "enum_declaration",
        "record_declaration",
    ],
    calls: &["method_invocation", "object_creation_expression"],
    callee_fields: &["name", "type"],
    identifiers: &["identifier", "type_identifier"],
    imports: &["import_declaration"],
    bindings: &[],
    lambdas: &[],
    type_identifiers: &["type_identifier"],
};

const BASH: Grammar = Grammar {
    functions: &["function_definition"],
    methods: &[],
    classes: &[],
    calls: &["command"],
    callee_fields: &["name"],
    identifiers: &["command_name", "word"],
    imports: &[],
    bindings: &[],
    lambdas: &[],
    type_identifiers: &[],
};

fn builtin_entries() -> Vec<LanguageEntry> {
    let table: [(&'static str, &'static [&'static str], Grammar); 8] = [
        ("python", &["py", "pyi"], PYTHON),
        ("rust", &["rs"], RUST),
        ("javascript", &["js", "jsx", "mjs", "cjs"], JAVASCRIPT),
        ("typescript", &["ts", "mts", "cts"], TYPESCRIPT),
        ("tsx", &["tsx"], TYPESCRIPT),
        ("go", &["go"], GO),
        ("java", &["java"], JAVA),
        ("bash", &["sh", "bash"], BASH),
    ];
    table
        .into_iter()
        .map(|(id, extensions, grammar)| LanguageEntry {
            id,
            extensions,
            grammar: Some(grammar),
            language: compiled_grammar(id),
        })
        .collect()
}
