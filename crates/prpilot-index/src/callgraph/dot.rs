use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::LazyLock;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use regex::Regex;

use super::{EdgeExtractor, RawCall, SourceFile};
use crate::chunker::Chunk;
use crate::error::{IndexError, Result};

/// Placeholder in tool arguments replaced by the file's absolute path.
pub const FILE_PLACEHOLDER: &str = "{file}";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

static EDGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*"?([A-Za-z0-9_.:/$]+)"?\s*->\s*"?([A-Za-z0-9_.:/$]+)"?\s*(\[.*\])?\s*;?\s*$"#)
        .expect("DOT edge regex is valid")
});

/// Runs an external call-graph analyzer and reads its DOT edges.
///
/// Node names are qualified paths, either dotted (`pkg.module.Class.method`)
/// or with `__` separators as pyan writes them (`pkg__module__Class__method`).
/// The caller side is matched against this file's chunks by name suffix; the
/// callee's last segment becomes the callee name and the rest its import hint.
///
/// An analyzer that outlives its timeout is killed and the file gets no edges.
#[derive(Debug, Clone)]
pub struct DotToolExtractor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl DotToolExtractor {
    #[must_use]
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, file: &SourceFile<'_>) -> Result<String> {
        let path = file.abs_path.to_string_lossy();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(FILE_PLACEHOLDER, &path))
            .collect();
        if !self.args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
            args.push(path.into_owned());
        }
        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = wait_until(&mut child, deadline)?;
        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(IndexError::Other(format!(
                "{} timed out after {:?}",
                self.command, self.timeout
            )));
        };

        // Grandchildren may hold the pipes open past the deadline.
        let remaining = || deadline.saturating_duration_since(Instant::now());
        let stdout = stdout.recv_timeout(remaining()).unwrap_or_default();
        if !status.success() {
            let stderr = stderr.recv_timeout(remaining()).unwrap_or_default();
            return Err(IndexError::Other(format!(
                "{} exited with {status}: {}",
                self.command,
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        String::from_utf8(stdout)
            .map_err(|e| IndexError::Parse(format!("{} produced non-UTF-8 output: {e}", self.command)))
    }
}

/// Read a pipe to the end on a helper thread so the child never blocks on a
/// full buffer.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(buf);
        });
    }
    rx
}

/// Exit status, or `None` once `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

impl EdgeExtractor for DotToolExtractor {
    fn name(&self) -> &'static str {
        "dot-tool"
    }

    fn extract_edges(&self, file: &SourceFile<'_>, chunks: &[Chunk]) -> Result<Vec<RawCall>> {
        let dot = self.run(file)?;
        Ok(calls_from_dot(&dot, file.entry.id, chunks))
    }
}

/// Parse `"a" -> "b" [...];` lines.
#[must_use]
pub fn parse_dot_edges(dot: &str) -> Vec<(String, String)> {
    dot.lines()
        .filter_map(|line| {
            let caps = EDGE_RE.captures(line)?;
            Some((caps[1].to_string(), caps[2].to_string()))
        })
        .collect()
}

fn calls_from_dot(dot: &str, language: &str, chunks: &[Chunk]) -> Vec<RawCall> {
    parse_dot_edges(dot)
        .into_iter()
        .filter_map(|(from, to)| {
            let caller = match_chunk(&normalize_node(&from), chunks)?;
            let to = normalize_node(&to);
            let (hint, callee) = split_node(&to);
            let qualifier = hint.and_then(|h| h.rsplit('.').find(|s| !s.is_empty()));
            Some(RawCall {
                caller: caller.id.clone(),
                callee: callee.to_string(),
                qualifier: qualifier.map(str::to_owned),
                import_hint: hint.map(str::to_owned),
                language: language.to_string(),
                line: caller.start_line,
            })
        })
        .collect()
}

/// Rewrite `::`, `/` and `__` separators as dots. Dunder names such as
/// `__init__` survive: `pkg__C____init__` becomes `pkg.C.__init__`.
fn normalize_node(node: &str) -> String {
    node.replace("::", ".")
        .replace('/', ".")
        .split('.')
        .map(split_dunder_separators)
        .collect::<Vec<_>>()
        .join(".")
}

fn split_dunder_separators(segment: &str) -> String {
    let parts: Vec<&str> = segment.split("__").collect();
    let mut out: Vec<String> = Vec::with_capacity(parts.len());
    let mut i = 0;
    while i < parts.len() {
        let part = parts[i];
        let dunder = part.is_empty()
            && parts.get(i + 1).is_some_and(|p| !p.is_empty())
            && parts.get(i + 2).is_some_and(|p| p.is_empty());
        if dunder {
            out.push(format!("__{}__", parts[i + 1]));
            i += 3;
        } else if part.is_empty() {
            match out.last_mut() {
                Some(last) => last.push_str("__"),
                None => out.push("__".to_string()),
            }
            i += 1;
        } else {
            out.push(part.to_string());
            i += 1;
        }
    }
    out.join(".")
}

/// `pkg.mod.f` → (`Some("pkg.mod")`, `"f"`). Expects a normalized node.
fn split_node(node: &str) -> (Option<&str>, &str) {
    match node.rfind('.') {
        Some(idx) => {
            let hint = node[..idx].trim_end_matches('.');
            let name = &node[idx + 1..];
            ((!hint.is_empty()).then_some(hint), name)
        }
        None => (None, node),
    }
}

/// Most specific chunk whose name is a dotted suffix of a normalized `node`.
fn match_chunk<'c>(node: &str, chunks: &'c [Chunk]) -> Option<&'c Chunk> {
    chunks
        .iter()
        .filter(|c| {
            node == c.name
                || node
                    .strip_suffix(c.name.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
        .max_by_key(|c| (c.name.len(), std::cmp::Reverse(c.start_byte)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkKind, chunk_id};

    fn chunk(name: &str, kind: ChunkKind, line: usize) -> Chunk {
        Chunk {
            id: chunk_id("pkg/mod.py", name, line * 10),
            file_path: "pkg/mod.py".into(),
            language: "python".into(),
            kind,
            name: name.into(),
            scope: String::new(),
            start_byte: line * 10,
            end_byte: line * 10 + 5,
            start_line: line,
            end_line: line,
            text: String::new(),
            content_hash: String::new(),
        }
    }

    #[test]
    fn parses_quoted_and_bare_edges() {
        let dot = r#"digraph G {
    "pkg.mod.main" -> "pkg.util.load" [style="solid"];
    a -> b;
    node [shape=box];
    "pkg.mod.Greeter" [label="Greeter"];
}"#;
        let edges = parse_dot_edges(dot);
        assert_eq!(
            edges,
            vec![
                ("pkg.mod.main".to_string(), "pkg.util.load".to_string()),
                ("a".to_string(), "b".to_string()),
            ]
        );
    }

    #[test]
    fn split_node_variants() {
        assert_eq!(split_node("pkg.util.load"), (Some("pkg.util"), "load"));
        assert_eq!(split_node("load"), (None, "load"));
        let rust = normalize_node("crate::util::load");
        assert_eq!(split_node(&rust), (Some("crate.util"), "load"));
    }

    #[test]
    fn double_underscore_separators_normalized() {
        assert_eq!(normalize_node("pkg__mod__Greeter__hello"), "pkg.mod.Greeter.hello");
        assert_eq!(normalize_node("pkg__mod__Greeter____init__"), "pkg.mod.Greeter.__init__");
        assert_eq!(normalize_node("__main__"), "__main__");
        assert_eq!(normalize_node("pkg.mod._private"), "pkg.mod._private");
        assert_eq!(normalize_node("pkg/mod::run"), "pkg.mod.run");
    }

    #[test]
    fn pyan_style_nodes_attributed() {
        let chunks = vec![
            chunk("main", ChunkKind::Function, 1),
            chunk("Greeter", ChunkKind::Class, 5),
            chunk("Greeter.hello", ChunkKind::Method, 6),
        ];
        let dot = r##"digraph G {
    pkg__mod__Greeter__hello -> pkg__util__render [style="dashed", color="#000000"];
    pkg__mod__main -> pkg__mod__Greeter__hello [style="solid", color="#000000"];
}"##;
        let calls = calls_from_dot(dot, "python", &chunks);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].caller, chunks[2].id);
        assert_eq!(calls[0].callee, "render");
        assert_eq!(calls[0].import_hint.as_deref(), Some("pkg.util"));
        assert_eq!(calls[1].caller, chunks[0].id);
        assert_eq!(calls[1].callee, "hello");
        assert_eq!(calls[1].qualifier.as_deref(), Some("Greeter"));
    }

    #[test]
    fn calls_attributed_by_suffix() {
        let chunks = vec![
            chunk("main", ChunkKind::Function, 1),
            chunk("Greeter", ChunkKind::Class, 5),
            chunk("Greeter.hello", ChunkKind::Method, 6),
        ];
        let dot = r#""pkg.mod.Greeter.hello" -> "pkg.util.render" [];
"pkg.mod.main" -> "pkg.mod.Greeter" [];
"other.remain" -> "x.y" [];"#;
        let calls = calls_from_dot(dot, "python", &chunks);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].caller, chunks[2].id);
        assert_eq!(calls[0].callee, "render");
        assert_eq!(calls[0].import_hint.as_deref(), Some("pkg.util"));
        assert_eq!(calls[0].qualifier.as_deref(), Some("util"));
        assert_eq!(calls[1].caller, chunks[0].id);
        assert_eq!(calls[1].callee, "Greeter");
    }

    #[test]
    fn missing_tool_is_an_error() {
        let registry = crate::languages::GrammarRegistry::builtin();
        let entry = registry.get("python").unwrap();
        let file = SourceFile {
            path: "a.py",
            abs_path: std::path::Path::new("/nonexistent/a.py"),
            source: "",
            entry,
            tree: None,
        };
        let tool = DotToolExtractor::new("prpilot-no-such-analyzer".into(), vec![]);
        assert!(tool.extract_edges(&file, &[]).is_err());
    }

    fn python_file(registry: &crate::languages::GrammarRegistry) -> SourceFile<'_> {
        SourceFile {
            path: "a.py",
            abs_path: std::path::Path::new("/tmp/a.py"),
            source: "",
            entry: registry.get("python").unwrap(),
            tree: None,
        }
    }

    #[cfg(unix)]
    #[test]
    fn hung_tool_is_killed_at_deadline() {
        let registry = crate::languages::GrammarRegistry::builtin();
        let file = python_file(&registry);
        let tool = DotToolExtractor::new(
            "sh".into(),
            vec!["-c".into(), "sleep 5".into(), FILE_PLACEHOLDER.into()],
        )
        .with_timeout(Duration::from_millis(300));

        let started = Instant::now();
        let err = tool.extract_edges(&file, &[]).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[test]
    fn tool_output_read_within_deadline() {
        let registry = crate::languages::GrammarRegistry::builtin();
        let file = python_file(&registry);
        let tool = DotToolExtractor::new(
            "sh".into(),
            vec![
                "-c".into(),
                "echo 'pkg__mod__main -> pkg__util__render;'".into(),
                FILE_PLACEHOLDER.into(),
            ],
        )
        .with_timeout(Duration::from_secs(10));
        let chunks = vec![chunk("main", ChunkKind::Function, 1)];
        let calls = tool.extract_edges(&file, &chunks).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].callee, "render");
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_is_an_error() {
        let registry = crate::languages::GrammarRegistry::builtin();
        let file = python_file(&registry);
        let tool = DotToolExtractor::new(
            "sh".into(),
            vec!["-c".into(), "echo boom >&2; exit 3".into(), FILE_PLACEHOLDER.into()],
        );
        let err = tool.extract_edges(&file, &[]).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }
}
