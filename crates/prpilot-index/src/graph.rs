//! Repository-wide call graph and bounded reachability search.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::chunker::Chunk;
use crate::error::Result;
use crate::store::{CallEdge, IndexStore};

/// A graph vertex: an indexed chunk or a callee name nothing resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Node {
    Chunk(String),
    Unresolved { language: String, name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow calls forward: what does X reach.
    Callees,
    /// Follow calls backward: what reaches X.
    Callers,
}

/// A chunk reached from the start set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reach {
    pub chunk_id: String,
    /// Minimum hop count from any start chunk.
    pub hops: usize,
    /// Chunk ids from the start chunk to this one, inclusive.
    pub path: Vec<String>,
}

#[derive(Debug, Clone)]
struct ChunkInfo {
    file_path: String,
    name: String,
    start_byte: usize,
}

/// Sort key shared by traversal and output: path, start offset, id.
type NodeKey<'a> = (u8, &'a str, usize, &'a str);

#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<Node, usize>,
    chunks: HashMap<String, ChunkInfo>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build from chunks and stored edges. Edges whose caller is not a known
    /// chunk are ignored; a target that is not a known chunk becomes an
    /// unresolved node.
    #[must_use]
    pub fn from_parts(chunks: &[Chunk], edges: &[CallEdge]) -> Self {
        let mut graph = Self::default();
        for chunk in chunks {
            graph.chunks.insert(
                chunk.id.clone(),
                ChunkInfo {
                    file_path: chunk.file_path.clone(),
                    name: chunk.name.clone(),
                    start_byte: chunk.start_byte,
                },
            );
            graph.intern(Node::Chunk(chunk.id.clone()));
        }

        for edge in edges {
            if !graph.chunks.contains_key(&edge.call.caller) {
                continue;
            }
            let from = graph.intern(Node::Chunk(edge.call.caller.clone()));
            let target = match &edge.target {
                Some(id) if graph.chunks.contains_key(id) => Node::Chunk(id.clone()),
                _ => Node::Unresolved {
                    language: edge.call.language.clone(),
                    name: edge.call.callee.clone(),
                },
            };
            let to = graph.intern(target);
            graph.outgoing[from].push(to);
            graph.incoming[to].push(from);
        }

        for i in 0..graph.nodes.len() {
            let mut out = std::mem::take(&mut graph.outgoing[i]);
            graph.sort_dedup(&mut out);
            graph.outgoing[i] = out;
            let mut inc = std::mem::take(&mut graph.incoming[i]);
            graph.sort_dedup(&mut inc);
            graph.incoming[i] = inc;
        }
        graph
    }

    /// Load the collection's chunks and edges from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if either query fails.
    pub async fn load(store: &IndexStore, collection: &str) -> Result<Self> {
        let chunks = store.all_chunks(collection).await?;
        let edges = store.call_edges(collection).await?;
        let graph = Self::from_parts(&chunks, &edges);
        tracing::debug!(
            collection,
            nodes = graph.nodes.len(),
            edges = graph.edge_count(),
            "loaded dependency graph"
        );
        Ok(graph)
    }

    fn intern(&mut self, node: Node) -> usize {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.nodes.len();
        self.index.insert(node.clone(), idx);
        self.nodes.push(node);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        idx
    }

    fn key(&self, idx: usize) -> NodeKey<'_> {
        match &self.nodes[idx] {
            Node::Chunk(id) => {
                let info = &self.chunks[id];
                (0, info.file_path.as_str(), info.start_byte, id.as_str())
            }
            Node::Unresolved { language, name } => (1, language.as_str(), 0, name.as_str()),
        }
    }

    fn sort_dedup(&self, list: &mut Vec<usize>) {
        list.sort_by(|&a, &b| self.key(a).cmp(&self.key(b)));
        list.dedup();
    }

    fn neighbours(&self, idx: usize, direction: Direction) -> &[usize] {
        match direction {
            Direction::Callees => &self.outgoing[idx],
            Direction::Callers => &self.incoming[idx],
        }
    }

    fn chunk_index(&self, id: &str) -> Option<usize> {
        self.index.get(&Node::Chunk(id.to_string())).copied()
    }

    #[must_use]
    pub fn contains_chunk(&self, id: &str) -> bool {
        self.chunks.contains_key(id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.outgoing.iter().map(Vec::len).sum()
    }

    /// Resolved callees of a chunk, in traversal order.
    #[must_use]
    pub fn callees(&self, id: &str) -> Vec<&Node> {
        self.chunk_index(id)
            .map(|i| self.outgoing[i].iter().map(|&n| &self.nodes[n]).collect())
            .unwrap_or_default()
    }

    /// `path::name` of a chunk, or the id itself if unknown.
    #[must_use]
    pub fn label(&self, id: &str) -> String {
        self.chunks
            .get(id)
            .map_or_else(|| id.to_string(), |c| format!("{}::{}", c.file_path, c.name))
    }

    /// Chunks reachable from `start` within `max_hops`, each reported once at
    /// its minimum hop count. Start chunks and unresolved nodes are never
    /// reported. Output is ordered by hops, file path, start offset, then id.
    #[must_use]
    pub fn reachable(&self, start: &[String], max_hops: usize, direction: Direction) -> Vec<Reach> {
        let mut starts: Vec<usize> = start.iter().filter_map(|id| self.chunk_index(id)).collect();
        self.sort_dedup(&mut starts);

        let mut visited: HashSet<usize> = starts.iter().copied().collect();
        let mut queue: VecDeque<(usize, usize, Vec<usize>)> =
            starts.iter().map(|&s| (s, 0, vec![s])).collect();
        let mut found: Vec<(usize, usize, Vec<usize>)> = Vec::new();

        while let Some((current, hops, path)) = queue.pop_front() {
            if hops >= max_hops {
                continue;
            }
            for &next in self.neighbours(current, direction) {
                if !visited.insert(next) {
                    continue;
                }
                let mut next_path = path.clone();
                next_path.push(next);
                if matches!(self.nodes[next], Node::Chunk(_)) {
                    found.push((next, hops + 1, next_path.clone()));
                }
                queue.push_back((next, hops + 1, next_path));
            }
        }

        found.sort_by(|a, b| (a.1, self.key(a.0)).cmp(&(b.1, self.key(b.0))));
        found
            .into_iter()
            .map(|(idx, hops, path)| Reach {
                chunk_id: self.chunk_id_of(idx),
                hops,
                path: path.into_iter().map(|i| self.chunk_id_of(i)).collect(),
            })
            .collect()
    }

    fn chunk_id_of(&self, idx: usize) -> String {
        match &self.nodes[idx] {
            Node::Chunk(id) => id.clone(),
            Node::Unresolved { name, .. } => name.clone(),
        }
    }

    /// Shortest call path from `from` to `to` as chunk ids, both inclusive.
    #[must_use]
    pub fn find_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        let start = self.chunk_index(from)?;
        let goal = self.chunk_index(to)?;
        if start == goal {
            return Some(vec![from.to_string()]);
        }

        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut visited = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &next in &self.outgoing[current] {
                if !visited.insert(next) {
                    continue;
                }
                parent.insert(next, current);
                if next == goal {
                    let mut path = vec![goal];
                    let mut cursor = goal;
                    while let Some(&p) = parent.get(&cursor) {
                        path.push(p);
                        cursor = p;
                    }
                    path.reverse();
                    return Some(path.into_iter().map(|i| self.chunk_id_of(i)).collect());
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// Call chains between changed chunks and retrieved candidates, in both
    /// directions, formatted `path::name -> path::name`. Sorted, no duplicates.
    #[must_use]
    pub fn dependency_chains(&self, changed: &[String], candidates: &[String]) -> Vec<String> {
        let mut chains = BTreeSet::new();
        for candidate in candidates {
            for source in changed {
                if candidate == source {
                    continue;
                }
                for path in [
                    self.find_path(source, candidate),
                    self.find_path(candidate, source),
                ]
                .into_iter()
                .flatten()
                {
                    let labels: Vec<String> = path.iter().map(|id| self.label(id)).collect();
                    chains.insert(labels.join(" -> "));
                }
            }
        }
        chains.into_iter().collect()
    }
}
