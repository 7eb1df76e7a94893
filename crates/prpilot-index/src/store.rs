//! `SQLite` persistence for the manifest, chunks and call graph.
//!
//! Every row is keyed by collection. Per-file writes happen in one
//! transaction so a file is either fully indexed or absent.

use std::collections::HashMap;
use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::callgraph::{RawCall, ResolutionPolicy, Symbol, SymbolTable};
use crate::chunker::{Chunk, ChunkKind};
use crate::error::Result;
use crate::languages::Tier;

const IN_CLAUSE_BATCH: usize = 500;

/// Indexed state of one file. Replaced wholesale when its hash changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub language: String,
    pub tier: Tier,
    /// blake3 hex of the raw file bytes.
    pub content_hash: String,
    /// Owned chunk ids in extraction order.
    pub chunk_ids: Vec<String>,
    /// Unix seconds.
    pub indexed_at: i64,
}

/// Per-collection embedding identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMeta {
    pub name: String,
    pub model_id: String,
    pub dimension: u64,
    pub built_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    DirectCall,
    Unresolved,
}

impl EdgeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectCall => "direct_call",
            Self::Unresolved => "unresolved",
        }
    }
}

/// A stored call edge: the raw call plus its current resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEdge {
    pub id: i64,
    /// File that owns the edge (the caller's file).
    pub file_path: String,
    pub call: RawCall,
    /// Resolved callee chunk id.
    pub target: Option<String>,
}

impl CallEdge {
    #[must_use]
    pub fn kind(&self) -> EdgeKind {
        if self.target.is_some() {
            EdgeKind::DirectCall
        } else {
            EdgeKind::Unresolved
        }
    }
}

/// Outcome of a collection-wide [`IndexStore::relink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelinkStats {
    pub resolved: usize,
    pub unresolved: usize,
    /// Edges whose target changed.
    pub updated: usize,
}

type ChunkRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    String,
    String,
);

type EdgeRow = (
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    i64,
    Option<String>,
);

const CHUNK_COLUMNS: &str = "id, file_path, language, kind, name, scope, start_byte, end_byte, \
                             start_line, end_line, text, content_hash";

const EDGE_COLUMNS: &str = "id, file_path, caller_id, callee_name, qualifier, import_hint, \
                            language, line, target_id";

fn chunk_from_row(row: ChunkRow) -> Result<Chunk> {
    let (
        id,
        file_path,
        language,
        kind,
        name,
        scope,
        start_byte,
        end_byte,
        start_line,
        end_line,
        text,
        content_hash,
    ) = row;
    Ok(Chunk {
        id,
        file_path,
        language,
        kind: ChunkKind::from_str(&kind)?,
        name,
        scope,
        start_byte: usize::try_from(start_byte)?,
        end_byte: usize::try_from(end_byte)?,
        start_line: usize::try_from(start_line)?,
        end_line: usize::try_from(end_line)?,
        text,
        content_hash,
    })
}

fn edge_from_row(row: EdgeRow) -> Result<CallEdge> {
    let (id, file_path, caller, callee, qualifier, import_hint, language, line, target) = row;
    Ok(CallEdge {
        id,
        file_path,
        call: RawCall {
            caller,
            callee,
            qualifier,
            import_hint,
            language,
            line: usize::try_from(line)?,
        },
        target,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

#[derive(Debug, Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    /// Open (or create) the database at `path` and run migrations.
    /// `:memory:` opens a private in-memory database on a single connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrations fail.
    pub async fn new(path: &str) -> Result<Self> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Path → content hash for every file indexed in `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn load_manifest(&self, collection: &str) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT path, content_hash FROM manifest WHERE collection = ?")
                .bind(collection)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn collection_meta(&self, collection: &str) -> Result<Option<CollectionMeta>> {
        let row: Option<(String, String, i64, i64)> = sqlx::query_as(
            "SELECT name, model_id, dimension, built_at FROM collections WHERE name = ?",
        )
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(name, model_id, dimension, built_at)| {
            Ok(CollectionMeta {
                name,
                model_id,
                dimension: u64::try_from(dimension)?,
                built_at,
            })
        })
        .transpose()
    }

    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn put_collection_meta(&self, meta: &CollectionMeta) -> Result<()> {
        sqlx::query(
            "INSERT INTO collections (name, model_id, dimension, built_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(name) DO UPDATE SET model_id = excluded.model_id, \
             dimension = excluded.dimension, built_at = excluded.built_at",
        )
        .bind(&meta.name)
        .bind(&meta.model_id)
        .bind(i64::try_from(meta.dimension)?)
        .bind(meta.built_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the query fails or the stored chunk list is corrupt.
    pub async fn file_record(&self, collection: &str, path: &str) -> Result<Option<FileRecord>> {
        let row: Option<(String, String, i64, String, String, i64)> = sqlx::query_as(
            "SELECT path, language, tier, content_hash, chunk_ids, indexed_at \
             FROM file_records WHERE collection = ? AND path = ?",
        )
        .bind(collection)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(path, language, tier, content_hash, chunk_ids, indexed_at)| {
            Ok(FileRecord {
                path,
                language,
                tier: Tier::from_i64(tier),
                content_hash,
                chunk_ids: serde_json::from_str(&chunk_ids)?,
                indexed_at,
            })
        })
        .transpose()
    }

    /// Remove a file's chunks, owned edges, record and manifest entry in one
    /// transaction. Edges from other files that resolved into it are demoted
    /// to unresolved first.
    ///
    /// Returns the number of demoted inbound edges.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled back.
    pub async fn retract_file(&self, collection: &str, path: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let demoted = sqlx::query(
            "UPDATE call_edges SET target_id = NULL, kind = 'unresolved' \
             WHERE collection = ? AND file_path <> ? AND target_id IN \
             (SELECT id FROM chunks WHERE collection = ? AND file_path = ?)",
        )
        .bind(collection)
        .bind(path)
        .bind(collection)
        .bind(path)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        for table in ["call_edges", "chunks"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE collection = ? AND file_path = ?"
            ))
            .bind(collection)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }
        for table in ["file_records", "manifest"] {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE collection = ? AND path = ?"
            ))
            .bind(collection)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(demoted)
    }

    /// Write a file's record, chunks and raw calls, then its manifest hash,
    /// in one transaction. Calls are stored unresolved; [`Self::relink`]
    /// binds them. The file must have been retracted beforehand if it was
    /// previously indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if any statement fails; the transaction is rolled back.
    pub async fn commit_file(
        &self,
        collection: &str,
        record: &FileRecord,
        chunks: &[Chunk],
        calls: &[RawCall],
    ) -> Result<()> {
        let chunk_ids = serde_json::to_string(&record.chunk_ids)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO file_records \
             (collection, path, language, tier, content_hash, chunk_ids, indexed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(&record.path)
        .bind(&record.language)
        .bind(record.tier.as_i64())
        .bind(&record.content_hash)
        .bind(&chunk_ids)
        .bind(record.indexed_at)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT OR REPLACE INTO chunks (collection, {CHUNK_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(collection)
            .bind(&chunk.id)
            .bind(&chunk.file_path)
            .bind(&chunk.language)
            .bind(chunk.kind.as_str())
            .bind(&chunk.name)
            .bind(&chunk.scope)
            .bind(i64::try_from(chunk.start_byte)?)
            .bind(i64::try_from(chunk.end_byte)?)
            .bind(i64::try_from(chunk.start_line)?)
            .bind(i64::try_from(chunk.end_line)?)
            .bind(&chunk.text)
            .bind(&chunk.content_hash)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM call_edges WHERE collection = ? AND file_path = ?")
            .bind(collection)
            .bind(&record.path)
            .execute(&mut *tx)
            .await?;
        for call in calls {
            sqlx::query(
                "INSERT INTO call_edges \
                 (collection, file_path, caller_id, callee_name, qualifier, import_hint, \
                  language, line, target_id, kind) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, 'unresolved')",
            )
            .bind(collection)
            .bind(&record.path)
            .bind(&call.caller)
            .bind(&call.callee)
            .bind(call.qualifier.as_deref())
            .bind(call.import_hint.as_deref())
            .bind(&call.language)
            .bind(i64::try_from(call.line)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO manifest (collection, path, content_hash) VALUES (?, ?, ?)",
        )
        .bind(collection)
        .bind(&record.path)
        .bind(&record.content_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Chunks of one file ordered by start offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn chunks_of_file(&self, collection: &str, path: &str) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE collection = ? AND file_path = ? \
             ORDER BY start_byte, id"
        ))
        .bind(collection)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(chunk_from_row).collect()
    }

    /// Every chunk of the collection ordered by path and start offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn all_chunks(&self, collection: &str) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE collection = ? \
             ORDER BY file_path, start_byte, id"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(chunk_from_row).collect()
    }

    /// Chunks with the given ids, in request order. Unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn chunks_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut found: HashMap<String, Chunk> = HashMap::with_capacity(ids.len());
        for batch in ids.chunks(IN_CLAUSE_BATCH) {
            let sql = format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE collection = ? AND id IN ({})",
                placeholders(batch.len())
            );
            let mut query = sqlx::query_as::<_, ChunkRow>(&sql).bind(collection);
            for id in batch {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await? {
                let chunk = chunk_from_row(row)?;
                found.insert(chunk.id.clone(), chunk);
            }
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// Every stored edge of the collection, ordered by owning file and line.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn call_edges(&self, collection: &str) -> Result<Vec<CallEdge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {EDGE_COLUMNS} FROM call_edges WHERE collection = ? \
             ORDER BY file_path, line, id"
        ))
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(edge_from_row).collect()
    }

    /// Raw calls owned by one file.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn raw_calls(&self, collection: &str, path: &str) -> Result<Vec<RawCall>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {EDGE_COLUMNS} FROM call_edges WHERE collection = ? AND file_path = ? \
             ORDER BY line, id"
        ))
        .bind(collection)
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| edge_from_row(row).map(|e| e.call))
            .collect()
    }

    /// Re-resolve every stored call of the collection against its current
    /// symbols. Only edges whose target changed are written.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails; the transaction is rolled back.
    pub async fn relink(&self, collection: &str, policy: ResolutionPolicy) -> Result<RelinkStats> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, file_path, name, kind FROM chunks WHERE collection = ?",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        let symbols = rows
            .into_iter()
            .map(|(id, file_path, name, kind)| {
                Ok(Symbol {
                    id,
                    file_path,
                    name,
                    kind: ChunkKind::from_str(&kind)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let table = SymbolTable::new(symbols);

        let mut stats = RelinkStats::default();
        let mut updates = Vec::new();
        for edge in self.call_edges(collection).await? {
            let target = table
                .resolve(&edge.call, &edge.file_path, policy)
                .filter(|t| *t != edge.call.caller);
            if target.is_some() {
                stats.resolved += 1;
            } else {
                stats.unresolved += 1;
            }
            if target != edge.target {
                updates.push((edge.id, target));
            }
        }
        stats.updated = updates.len();

        if !updates.is_empty() {
            let mut tx = self.pool.begin().await?;
            for (id, target) in &updates {
                let kind = if target.is_some() {
                    EdgeKind::DirectCall
                } else {
                    EdgeKind::Unresolved
                };
                sqlx::query("UPDATE call_edges SET target_id = ?, kind = ? WHERE id = ?")
                    .bind(target.as_deref())
                    .bind(kind.as_str())
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
        }

        tracing::debug!(
            collection,
            resolved = stats.resolved,
            unresolved = stats.unresolved,
            updated = stats.updated,
            "relinked call graph"
        );
        Ok(stats)
    }
}
