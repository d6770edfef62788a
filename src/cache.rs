//! Content-addressed cache of validated batch responses.
//!
//! Entries are written once and never mutated: the first accepted response
//! for a key wins. An entry the reader cannot use is evicted, which frees the
//! key for the next accepted response. Two backends share the `BatchCache`
//! trait: an append-only JSONL log (replayed at open) and a SQLite table.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{BatchRequest, BatchResponse, ModelTier, Requirement};

/// Bumped whenever the canonical form below changes.
pub const CACHE_SCHEMA: &str = "control-mapper/batch/v1";

// =============================================================================
// KEY
// =============================================================================

/// Hash of a batch's canonical content. The model tier is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchCacheKey {
    pub requirements_hash: String,
    pub catalog_hash: String,
    pub key_hash: String,
}

impl BatchCacheKey {
    pub fn new(request: &BatchRequest) -> Self {
        let requirements_hash = hash_text(&canonical_requirements(&request.requirements));

        let mut names: Vec<&str> = request.catalog_names.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        let catalog_hash = hash_fields(&names);

        let key_hash = derive_key_hash(&requirements_hash, &catalog_hash);
        Self {
            requirements_hash,
            catalog_hash,
            key_hash,
        }
    }
}

fn derive_key_hash(requirements_hash: &str, catalog_hash: &str) -> String {
    hash_fields(&[CACHE_SCHEMA, requirements_hash, catalog_hash])
}

/// Requirements in batch order; within each requirement, map keys sorted
/// and existing names sorted.
fn canonical_requirements(requirements: &[Requirement]) -> String {
    let items: Vec<serde_json::Value> = requirements
        .iter()
        .map(|req| {
            let mut existing = req.existing_function_names.clone();
            existing.sort();
            existing.dedup();
            serde_json::json!({
                "id": req.id,
                "title": req.title,
                "assessment_kind": req.assessment_kind.as_str(),
                "context": req.context,
                "existing": existing,
            })
        })
        .collect();
    serde_json::Value::Array(items).to_string()
}

// =============================================================================
// ENTRIES
// =============================================================================

/// One stored response, self-describing so a log line can be checked on
/// replay without the request that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedBatch {
    pub key_hash: String,
    pub requirements_hash: String,
    pub catalog_hash: String,
    /// Tier that produced the response. Informational only.
    pub tier: ModelTier,
    pub response: BatchResponse,
    pub response_hash: String,
    pub created_at: i64,
}

impl CachedBatch {
    pub fn new(key: &BatchCacheKey, tier: &ModelTier, response: &BatchResponse) -> Self {
        Self {
            key_hash: key.key_hash.clone(),
            requirements_hash: key.requirements_hash.clone(),
            catalog_hash: key.catalog_hash.clone(),
            tier: tier.clone(),
            response: response.clone(),
            response_hash: hash_response(response),
            created_at: now_epoch(),
        }
    }

    /// Stored key and response hash both match their recomputed values.
    pub fn verify(&self) -> bool {
        self.key_hash == derive_key_hash(&self.requirements_hash, &self.catalog_hash)
            && self.response_hash == hash_response(&self.response)
    }
}

fn hash_response(response: &BatchResponse) -> String {
    let payloads = serde_json::Value::Array(response.payloads.clone());
    hash_text(&payloads.to_string())
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("corrupt cache entry {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait BatchCache: Send + Sync {
    async fn get(&self, key: &BatchCacheKey) -> Result<Option<CachedBatch>, CacheError>;
    /// No-op when the key is already present.
    async fn put(
        &self,
        key: &BatchCacheKey,
        tier: &ModelTier,
        response: &BatchResponse,
    ) -> Result<(), CacheError>;
    /// Forget the entry for `key` so a later `put` is stored.
    async fn evict(&self, key: &BatchCacheKey) -> Result<(), CacheError>;
}

/// Default cache location: `CONTROL_MAPPER_CACHE_PATH` or a dotfile in the
/// working directory.
pub fn default_path() -> PathBuf {
    if let Ok(path) = std::env::var("CONTROL_MAPPER_CACHE_PATH") {
        return PathBuf::from(path);
    }
    PathBuf::from(".control_mapper_cache.jsonl")
}

// =============================================================================
// JSONL BACKEND
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct JsonlState {
    index: HashMap<String, CachedBatch>,
    file: Option<File>,
}

#[derive(Debug, Clone)]
pub struct JsonlBatchCache {
    path: Option<PathBuf>,
    state: Arc<Mutex<JsonlState>>,
    stats: ReplayStats,
}

impl JsonlBatchCache {
    /// Open (or create) the log at `path` and replay it. Lines that do not
    /// parse or do not verify are skipped with a warning. A later line for a
    /// key replaces an earlier one; that only happens after an eviction.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut index = HashMap::new();
        let mut stats = ReplayStats::default();
        let mut torn_tail = false;
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            torn_tail = !bytes.is_empty() && !bytes.ends_with(b"\n");
            let text = String::from_utf8_lossy(&bytes);
            for (line_no, line) in text.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CachedBatch>(line) {
                    Ok(entry) if entry.verify() => {
                        index.insert(entry.key_hash.clone(), entry);
                        stats.loaded += 1;
                    }
                    Ok(entry) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            key_hash = %entry.key_hash,
                            "skipping cache entry whose hashes do not verify"
                        );
                        stats.skipped += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no + 1,
                            error = %err,
                            "skipping unparseable cache line"
                        );
                        stats.skipped += 1;
                    }
                }
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if torn_tail {
            // Terminate a partially written last line so new entries start clean.
            writeln!(file)?;
        }
        tracing::debug!(
            path = %path.display(),
            loaded = stats.loaded,
            skipped = stats.skipped,
            "replayed batch cache"
        );

        Ok(Self {
            path: Some(path),
            state: Arc::new(Mutex::new(JsonlState {
                index,
                file: Some(file),
            })),
            stats,
        })
    }

    /// Cache with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Arc::new(Mutex::new(JsonlState::default())),
            stats: ReplayStats::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn replay_stats(&self) -> ReplayStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.index.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock_exclusive(&self) -> Result<Option<CacheLock>, CacheError> {
        self.path.as_deref().map(CacheLock::new).transpose()
    }

    fn append(&self, entry: CachedBatch) -> Result<(), CacheError> {
        let mut state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        if state.index.contains_key(&entry.key_hash) {
            return Ok(());
        }
        if let Some(file) = state.file.as_mut() {
            let line =
                serde_json::to_string(&entry).map_err(|e| CacheError::Serde(e.to_string()))?;
            writeln!(file, "{line}")?;
            file.flush()?;
        }
        state.index.insert(entry.key_hash.clone(), entry);
        Ok(())
    }
}

#[async_trait]
impl BatchCache for JsonlBatchCache {
    async fn get(&self, key: &BatchCacheKey) -> Result<Option<CachedBatch>, CacheError> {
        let state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(state.index.get(&key.key_hash).cloned())
    }

    async fn put(
        &self,
        key: &BatchCacheKey,
        tier: &ModelTier,
        response: &BatchResponse,
    ) -> Result<(), CacheError> {
        let entry = CachedBatch::new(key, tier, response);
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.append(entry))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn evict(&self, key: &BatchCacheKey) -> Result<(), CacheError> {
        let mut state = self.state.lock().map_err(|_| CacheError::Poisoned)?;
        state.index.remove(&key.key_hash);
        Ok(())
    }
}

// =============================================================================
// SQLITE BACKEND
// =============================================================================

#[derive(Clone)]
pub struct SqliteBatchCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBatchCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS batch_cache (\
               key_hash TEXT PRIMARY KEY,\
               requirements_hash TEXT NOT NULL,\
               catalog_hash TEXT NOT NULL,\
               tier TEXT NOT NULL,\
               response_json TEXT NOT NULL,\
               response_hash TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

fn read_entry(row: &rusqlite::Row<'_>) -> Result<CachedBatch, CacheError> {
    let key_hash: String = row.get(0)?;
    let response_json: String = row.get(4)?;
    let payloads: Vec<serde_json::Value> = serde_json::from_str(&response_json)
        .map_err(|_| CacheError::Corrupt(key_hash.clone()))?;
    Ok(CachedBatch {
        key_hash,
        requirements_hash: row.get(1)?,
        catalog_hash: row.get(2)?,
        tier: ModelTier::new(row.get::<_, String>(3)?),
        response: BatchResponse::new(payloads),
        response_hash: row.get(5)?,
        created_at: row.get(6)?,
    })
}

#[async_trait]
impl BatchCache for SqliteBatchCache {
    async fn get(&self, key: &BatchCacheKey) -> Result<Option<CachedBatch>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, requirements_hash, catalog_hash, tier, response_json,\
                            response_hash, created_at \
                     FROM batch_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                let Some(row) = rows.next()? else {
                    return Ok(None);
                };
                let entry = read_entry(row)?;
                if !entry.verify() {
                    return Err(CacheError::Corrupt(entry.key_hash));
                }
                conn.execute(
                    "UPDATE batch_cache SET hit_count = hit_count + 1 WHERE key_hash = ?1",
                    params![key_hash],
                )?;
                Ok(Some(entry))
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(
        &self,
        key: &BatchCacheKey,
        tier: &ModelTier,
        response: &BatchResponse,
    ) -> Result<(), CacheError> {
        let entry = CachedBatch::new(key, tier, response);
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let response_json = serde_json::to_string(&entry.response.payloads)
                    .map_err(|e| CacheError::Serde(e.to_string()))?;
                conn.execute(
                    "INSERT INTO batch_cache (\
                        key_hash, requirements_hash, catalog_hash, tier,\
                        response_json, response_hash, created_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(key_hash) DO NOTHING",
                    params![
                        entry.key_hash,
                        entry.requirements_hash,
                        entry.catalog_hash,
                        entry.tier.model_id(),
                        response_json,
                        entry.response_hash,
                        entry.created_at,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn evict(&self, key: &BatchCacheKey) -> Result<(), CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                conn.execute("DELETE FROM batch_cache WHERE key_hash = ?1", params![key_hash])?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// Export row: a replayable `CachedBatch` line plus its hit count.
#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    #[serde(flatten)]
    pub entry: CachedBatch,
    pub hit_count: i64,
}

impl SqliteBatchCache {
    /// Write every entry as one JSON line, oldest first. The output can be
    /// opened directly as a `JsonlBatchCache`.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, requirements_hash, catalog_hash, tier, response_json,\
                            response_hash, created_at, hit_count \
                     FROM batch_cache ORDER BY created_at ASC, key_hash ASC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = File::create(path)?;
                let mut written = 0;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        entry: read_entry(row)?,
                        hit_count: row.get(7)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    writeln!(file, "{line}")?;
                    written += 1;
                }
                Ok(written)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

// =============================================================================
// LOCKING
// =============================================================================

/// Advisory lock held for the duration of a run sharing a cache path.
#[derive(Debug)]
pub struct CacheLock {
    _file: File,
}

impl CacheLock {
    fn new(cache_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = cache_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
