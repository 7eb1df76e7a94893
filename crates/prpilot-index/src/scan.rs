//! Working-tree walk with the binary, oversize and ignore-directory policy.

use std::path::{Path, PathBuf};

use crate::languages::{GrammarRegistry, Lookup};

/// Leading bytes inspected for a NUL when sniffing binary content.
pub const BINARY_SNIFF_BYTES: usize = 8192;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Directory names skipped anywhere in the tree.
    pub ignore_dirs: Vec<String>,
    pub max_file_size: u64,
}

/// A readable, indexable file.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    /// Relative to the root, `/`-separated.
    pub rel_path: String,
    pub abs_path: PathBuf,
    /// Registered language id, or `None` for plain text.
    pub language: Option<&'static str>,
    pub source: String,
    /// blake3 hex of the raw bytes.
    pub content_hash: String,
}

/// A file that exists but could not be read as UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFailure {
    pub rel_path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Sorted by `rel_path`.
    pub files: Vec<ScannedFile>,
    pub failures: Vec<ScanFailure>,
    /// Files excluded by policy (skip extension, size, binary content).
    pub excluded: usize,
}

enum Classified {
    Indexable(ScannedFile),
    Excluded(&'static str),
    Failed(String),
}

/// Relative `/`-separated path of `path` under `root`.
#[must_use]
pub fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Whether the first [`BINARY_SNIFF_BYTES`] contain a NUL byte.
#[must_use]
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes[..bytes.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

/// Walk `root`, honouring `.gitignore`, and classify every file.
///
/// Blocking; run it off the async executor.
#[must_use]
pub fn scan(root: &Path, registry: &GrammarRegistry, options: &ScanOptions) -> ScanResult {
    let ignore_dirs = options.ignore_dirs.clone();
    let walker = ignore::WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
            !(is_dir && ignore_dirs.iter().any(|d| entry.file_name() == d.as_str()))
        })
        .build();

    let mut result = ScanResult::default();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("walk error: {e}");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let rel_path = relative_path(root, entry.path());
        match classify(entry.path(), rel_path.clone(), registry, options) {
            Classified::Indexable(file) => result.files.push(file),
            Classified::Excluded(why) => {
                tracing::debug!(file = %rel_path, reason = why, "excluded from index");
                result.excluded += 1;
            }
            Classified::Failed(reason) => {
                tracing::warn!(file = %rel_path, "unreadable: {reason}");
                result.failures.push(ScanFailure { rel_path, reason });
            }
        }
    }
    result.files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    result.failures.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    result
}

/// Classify one file.
fn classify(
    path: &Path,
    rel_path: String,
    registry: &GrammarRegistry,
    options: &ScanOptions,
) -> Classified {
    let language = match registry.lookup(path) {
        Lookup::Skip => return Classified::Excluded("skip extension"),
        Lookup::Text => None,
        Lookup::Language(entry) => Some(entry.id),
    };
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > options.max_file_size => {
            return Classified::Excluded("oversize");
        }
        Ok(_) => {}
        Err(e) => return Classified::Failed(e.to_string()),
    }
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return Classified::Failed(e.to_string()),
    };
    if looks_binary(&bytes) {
        return Classified::Excluded("binary content");
    }
    let content_hash = blake3::hash(&bytes).to_hex().to_string();
    match String::from_utf8(bytes) {
        Ok(source) => Classified::Indexable(ScannedFile {
            rel_path,
            abs_path: path.to_path_buf(),
            language,
            source,
            content_hash,
        }),
        Err(e) => Classified::Failed(format!("invalid UTF-8: {e}")),
    }
}

/// Whether a single path would be considered by [`scan`]: inside `root`, not
/// under an ignored directory and not a skipped extension.
#[must_use]
pub fn is_candidate(root: &Path, path: &Path, registry: &GrammarRegistry, options: &ScanOptions) -> bool {
    let Ok(rel) = path.strip_prefix(root) else {
        return false;
    };
    let in_ignored_dir = rel.parent().is_some_and(|parent| {
        parent.components().any(|c| {
            let name = c.as_os_str().to_string_lossy();
            name.starts_with('.') || options.ignore_dirs.iter().any(|d| *d == name)
        })
    });
    !in_ignored_dir && !matches!(registry.lookup(path), Lookup::Skip)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn options() -> ScanOptions {
        ScanOptions {
            ignore_dirs: vec!["node_modules".into(), "target".into()],
            max_file_size: 64,
        }
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("node_modules/lib")).unwrap();
        fs::write(root.join("src/app.py"), "def main():\n    pass\n").unwrap();
        fs::write(root.join("README.md"), "# hello\n").unwrap();
        fs::write(root.join("node_modules/lib/x.js"), "function x() {}\n").unwrap();
        fs::write(root.join("logo.png"), "not really a png").unwrap();
        fs::write(root.join("big.txt"), "x".repeat(100)).unwrap();
        fs::write(root.join("blob.dat"), b"abc\0def").unwrap();
        fs::write(root.join("latin1.txt"), [0x63, 0x61, 0x66, 0xE9]).unwrap();
        fs::write(root.join(".gitignore"), "generated.py\n").unwrap();
        fs::write(root.join("generated.py"), "x = 1\n").unwrap();
        dir
    }

    #[test]
    fn scan_applies_policy() {
        let dir = tree();
        let registry = GrammarRegistry::builtin();
        let result = scan(dir.path(), &registry, &options());

        let paths: Vec<_> = result.files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/app.py"]);
        assert_eq!(result.excluded, 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].rel_path, "latin1.txt");

        let app = &result.files[1];
        assert_eq!(app.language, Some("python"));
        assert_eq!(
            app.content_hash,
            blake3::hash(b"def main():\n    pass\n").to_hex().to_string()
        );
        assert_eq!(result.files[0].language, None);
    }

    #[test]
    fn binary_sniff_window() {
        assert!(looks_binary(b"ab\0"));
        let mut late = vec![b'a'; BINARY_SNIFF_BYTES];
        late.push(0);
        assert!(!looks_binary(&late));
        assert!(!looks_binary(b""));
    }

    #[test]
    fn candidate_paths() {
        let registry = GrammarRegistry::builtin();
        let root = Path::new("/repo");
        let opts = options();
        assert!(is_candidate(root, Path::new("/repo/src/a.py"), &registry, &opts));
        assert!(!is_candidate(root, Path::new("/repo/node_modules/a.js"), &registry, &opts));
        assert!(!is_candidate(root, Path::new("/repo/.git/HEAD"), &registry, &opts));
        assert!(!is_candidate(root, Path::new("/repo/a.png"), &registry, &opts));
        assert!(!is_candidate(root, Path::new("/elsewhere/a.py"), &registry, &opts));
    }
}
