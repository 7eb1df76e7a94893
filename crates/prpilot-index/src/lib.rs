//! Incremental cross-language code knowledge index.
//!
//! Source files are split into semantic chunks with tree-sitter (or into
//! paragraphs for languages without a grammar), embedded and stored in a
//! vector collection. Call sites are recorded as symbolic edges and resolved
//! against the whole collection, giving a dependency graph that survives
//! incremental updates. A [`reconciler::Reconciler`] keeps both in step with
//! a working tree; a [`retriever::Retriever`] answers similarity queries for
//! a diff.

pub mod callgraph;
pub mod chunker;
pub mod config;
pub mod context;
pub mod diff;
pub mod embedder;
pub mod error;
pub mod graph;
pub mod in_memory_store;
pub mod languages;
pub mod qdrant_ops;
pub mod reconciler;
pub mod retriever;
pub mod scan;
pub mod store;
pub mod vector_store;
pub mod watcher;

pub use config::Config;
pub use error::{IndexError, Result};
pub use graph::{DependencyGraph, Direction};
pub use reconciler::{ReconcileReport, Reconciler};
pub use retriever::{QueryResult, RetrievalMode, RetrievalRequest, Retriever};
pub use store::IndexStore;
pub use vector_store::VectorStore;
