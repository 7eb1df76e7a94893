//! Unified diff parsing: which new-file lines a change touches.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunker::Chunk;

/// Changed new-file line numbers (1-based) per path.
pub type ChangedLines = BTreeMap<String, BTreeSet<usize>>;

/// `12,3` → (12, 3); a bare `12` counts one line.
fn parse_hunk_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// `@@ -a,b +c,d @@ ...` → ((a, b), (c, d)).
fn parse_hunk_header(line: &str) -> Option<((usize, usize), (usize, usize))> {
    let ranges = line.strip_prefix("@@ ")?.split("@@").next()?;
    let mut parts = ranges.split_whitespace();
    let old = parse_hunk_range(parts.next()?.strip_prefix('-')?)?;
    let new = parse_hunk_range(parts.next()?.strip_prefix('+')?)?;
    Some((old, new))
}

fn target_path(line: &str) -> Option<String> {
    let raw = line.strip_prefix("+++ ")?;
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    if raw == "/dev/null" {
        return None;
    }
    Some(raw.strip_prefix("b/").unwrap_or(raw).to_string())
}

/// Map each file in a unified diff to the new-file lines it adds or
/// modifies. A pure deletion marks the new-file line at the deletion point.
/// Deleted files contribute nothing.
#[must_use]
pub fn changed_lines(diff: &str) -> ChangedLines {
    let mut out = ChangedLines::new();
    let mut current: Option<String> = None;
    let mut new_line = 0usize;
    let mut old_remaining = 0usize;
    let mut new_remaining = 0usize;

    for line in diff.lines() {
        let in_hunk = old_remaining > 0 || new_remaining > 0;
        if !in_hunk {
            if line.starts_with("+++ ") {
                current = target_path(line);
            } else if let Some(((_, old_count), (new_start, new_count))) = parse_hunk_header(line) {
                new_line = new_start;
                old_remaining = old_count;
                new_remaining = new_count;
            }
            continue;
        }

        let Some(path) = current.as_ref() else {
            match line.as_bytes().first() {
                Some(b'+') => new_remaining = new_remaining.saturating_sub(1),
                Some(b'-') => old_remaining = old_remaining.saturating_sub(1),
                Some(b'\\') => {}
                _ => {
                    old_remaining = old_remaining.saturating_sub(1);
                    new_remaining = new_remaining.saturating_sub(1);
                }
            }
            continue;
        };

        match line.as_bytes().first() {
            Some(b'+') => {
                out.entry(path.clone()).or_default().insert(new_line.max(1));
                new_line += 1;
                new_remaining = new_remaining.saturating_sub(1);
            }
            Some(b'-') => {
                let at = if new_remaining == 0 {
                    new_line.saturating_sub(1)
                } else {
                    new_line
                };
                out.entry(path.clone()).or_default().insert(at.max(1));
                old_remaining = old_remaining.saturating_sub(1);
            }
            Some(b'\\') => {}
            _ => {
                new_line += 1;
                old_remaining = old_remaining.saturating_sub(1);
                new_remaining = new_remaining.saturating_sub(1);
            }
        }
    }
    out
}

/// Chunks whose line span contains any of `lines`, in input order.
#[must_use]
pub fn overlapping_chunks<'c>(chunks: &'c [Chunk], lines: &BTreeSet<usize>) -> Vec<&'c Chunk> {
    chunks
        .iter()
        .filter(|c| lines.range(c.start_line..=c.end_line).next().is_some())
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::chunker::{ChunkKind, chunk_id};

    const DIFF: &str = "\
diff --git a/src/app.py b/src/app.py
index 83db48f..bf269f4 100644
--- a/src/app.py
+++ b/src/app.py
@@ -1,5 +1,6 @@
 import os
-def main():
+def main(argv):
+    print(argv)
     run()

 def run():
@@ -20,3 +21,2 @@ def tail():
     a = 1
-    b = 2
     c = 3
diff --git a/old.py b/old.py
deleted file mode 100644
--- a/old.py
+++ /dev/null
@@ -1,2 +0,0 @@
-def gone():
-    pass
diff --git a/new.txt b/new.txt
new file mode 100644
--- /dev/null
+++ b/new.txt
@@ -0,0 +1,2 @@
+hello
+++ not a header
";

    #[test]
    fn parses_hunks_per_file() {
        let lines = changed_lines(DIFF);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines["src/app.py"].iter().copied().collect::<Vec<_>>(),
            vec![2, 3, 22]
        );
        assert_eq!(
            lines["new.txt"].iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn deletion_at_hunk_end_marks_previous_line() {
        let diff = "+++ b/a.py\n@@ -1,2 +1,1 @@\n keep\n-drop\n";
        let lines = changed_lines(diff);
        assert_eq!(lines["a.py"].iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn hunk_range_forms() {
        assert_eq!(parse_hunk_range("12,3"), Some((12, 3)));
        assert_eq!(parse_hunk_range("7"), Some((7, 1)));
        assert_eq!(parse_hunk_range("x"), None);
        assert_eq!(
            parse_hunk_header("@@ -1 +1,2 @@ fn main()"),
            Some(((1, 1), (1, 2)))
        );
    }

    #[test]
    fn empty_diff() {
        assert!(changed_lines("").is_empty());
    }

    fn chunk(name: &str, start_line: usize, end_line: usize) -> Chunk {
        Chunk {
            id: chunk_id("a.py", name, start_line),
            file_path: "a.py".into(),
            language: "python".into(),
            kind: ChunkKind::Function,
            name: name.into(),
            scope: String::new(),
            start_byte: start_line,
            end_byte: end_line,
            start_line,
            end_line,
            text: String::new(),
            content_hash: String::new(),
        }
    }

    #[test]
    fn overlap_selects_touching_chunks() {
        let chunks = vec![chunk("a", 1, 4), chunk("b", 6, 10), chunk("c", 12, 12)];
        let lines: BTreeSet<usize> = [4, 12].into_iter().collect();
        let names: Vec<_> = overlapping_chunks(&chunks, &lines)
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    proptest! {
        #[test]
        fn replaced_lines_are_reported(modified in prop::collection::vec(any::<bool>(), 1..40)) {
            let n = modified.len();
            let mut diff = format!("--- a/f.rs\n+++ b/f.rs\n@@ -1,{n} +1,{n} @@\n");
            for (i, &m) in modified.iter().enumerate() {
                if m {
                    diff.push_str(&format!("-old {i}\n+new {i}\n"));
                } else {
                    diff.push_str(&format!(" same {i}\n"));
                }
            }
            let expected: BTreeSet<usize> = modified
                .iter()
                .enumerate()
                .filter(|(_, m)| **m)
                .map(|(i, _)| i + 1)
                .collect();
            let got = changed_lines(&diff).remove("f.rs").unwrap_or_default();
            prop_assert_eq!(got, expected);
        }
    }
}
