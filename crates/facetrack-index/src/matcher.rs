//! The face matcher: gallery state, query path, and checkpointing.
//!
//! In-memory state is a parallel pair (entry list, embedding matrix) plus
//! the backend index, all behind one `RwLock`. Queries take the read lock;
//! `add`/`remove` take the write lock and update every structure before
//! releasing it, so a query never observes a half-applied mutation.
//! Checkpoint writes run on a dedicated thread fed through a channel; the
//! in-memory state is authoritative and a failed write is retried at the
//! next interval.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use ndarray::{Array1, Array2};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{create_backend, BackendConfig, BackendKind, SimilarityBackend};
use crate::cache::{cache_key, CacheStats, QueryCache};
use crate::error::MatcherError;
use crate::store::IndexStore;
use crate::types::{IndexEntry, MatchResult, PERSON_ID_KEY};

const QUALITY_SCORE_KEY: &str = "quality_score";

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Embedding dimensionality; every vector must match exactly.
    pub dim: usize,
    pub backend: BackendConfig,
    /// Results below this confidence are discarded.
    pub min_confidence: f32,
    /// Multiply confidence by the stored capture quality.
    pub quality_weighting: bool,
    /// Hard cap on gallery size.
    pub max_entries: usize,
    /// Checkpoint after this many inserts (0 disables periodic checkpoints).
    pub checkpoint_interval: u64,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    /// Persistence directory; `None` keeps the gallery memory-only.
    pub data_dir: Option<PathBuf>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            dim: 512,
            backend: BackendConfig::default(),
            min_confidence: 0.6,
            quality_weighting: false,
            max_entries: 10_000,
            checkpoint_interval: 32,
            cache_ttl: Duration::from_secs(30),
            cache_max_entries: 256,
            data_dir: None,
        }
    }
}

/// Snapshot of matcher counters for status reporting.
#[derive(Debug, Clone, Copy)]
pub struct MatcherStats {
    pub entries: usize,
    pub persons: usize,
    pub backend: BackendKind,
    pub cache: CacheStats,
}

struct Inner {
    entries: Vec<IndexEntry>,
    embeddings: Array2<f32>,
    backend: Box<dyn SimilarityBackend>,
    inserts_since_checkpoint: u64,
}

struct CheckpointJob {
    entries: Vec<IndexEntry>,
    embeddings: Array2<f32>,
    kind: BackendKind,
    blob: Vec<u8>,
}

pub struct FaceMatcher {
    config: MatcherConfig,
    inner: RwLock<Inner>,
    cache: Mutex<QueryCache>,
    store: Option<IndexStore>,
    checkpoint_tx: Mutex<Option<mpsc::Sender<CheckpointJob>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FaceMatcher {
    /// Open a matcher, restoring any persisted gallery from `data_dir`.
    ///
    /// A missing or corrupt index blob re-indexes from the embeddings; a
    /// corrupt embeddings or metadata file is fatal, since guessing at
    /// identity data is worse than refusing to start.
    pub fn open(config: MatcherConfig) -> Result<Self, MatcherError> {
        let mut backend = create_backend(&config.backend, config.dim);
        let mut entries = Vec::new();
        let mut embeddings = Array2::zeros((0, config.dim));

        let store = match &config.data_dir {
            Some(dir) => Some(IndexStore::open(dir.clone())?),
            None => None,
        };

        if let Some(store) = &store {
            if let Some(state) = store.load(config.dim)? {
                let restored = match &state.index_blob {
                    Some((kind, blob)) if *kind == config.backend.kind => {
                        match backend.load_blob(blob, state.embeddings.view()) {
                            Ok(()) => true,
                            Err(err) => {
                                warn!(error = %err, "index blob rejected, re-indexing");
                                false
                            }
                        }
                    }
                    Some((kind, _)) => {
                        info!(
                            persisted = ?kind,
                            configured = ?config.backend.kind,
                            "backend kind changed, re-indexing"
                        );
                        false
                    }
                    None => false,
                };
                if !restored {
                    backend.rebuild(state.embeddings.view())?;
                }
                entries = state.entries;
                embeddings = state.embeddings;
                info!(
                    entries = entries.len(),
                    backend = ?config.backend.kind,
                    "gallery restored"
                );
            }
        }

        let (checkpoint_tx, worker) = match &store {
            Some(store) => {
                let (tx, rx) = mpsc::channel::<CheckpointJob>(2);
                let handle = spawn_checkpoint_worker(store.clone(), rx);
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let cache = QueryCache::new(config.cache_ttl, config.cache_max_entries);
        Ok(Self {
            config,
            inner: RwLock::new(Inner {
                entries,
                embeddings,
                backend,
                inserts_since_checkpoint: 0,
            }),
            cache: Mutex::new(cache),
            store,
            checkpoint_tx: Mutex::new(checkpoint_tx),
            worker: Mutex::new(worker),
        })
    }

    /// Register one embedding under `face_id`. Metadata must carry
    /// `person_id`; `quality_score` is honored when present.
    pub fn add(
        &self,
        face_id: &str,
        embedding: &[f32],
        metadata: HashMap<String, String>,
    ) -> Result<(), MatcherError> {
        let vector = self.validate_embedding(embedding)?;
        let person_id = metadata
            .get(PERSON_ID_KEY)
            .filter(|p| !p.is_empty())
            .cloned()
            .ok_or_else(|| {
                MatcherError::Validation(format!("metadata missing {PERSON_ID_KEY}"))
            })?;
        let quality_score = metadata
            .get(QUALITY_SCORE_KEY)
            .and_then(|q| q.parse::<f32>().ok())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);

        let mut inner = self.inner.write().expect("matcher lock poisoned");
        if inner.entries.iter().any(|e| e.face_id == face_id) {
            return Err(MatcherError::Validation(format!(
                "face id {face_id} already registered"
            )));
        }
        if inner.entries.len() >= self.config.max_entries {
            return Err(MatcherError::Capacity(format!(
                "gallery full at {} entries",
                self.config.max_entries
            )));
        }

        inner
            .embeddings
            .push_row(vector.view())
            .map_err(|e| MatcherError::Capacity(format!("embedding append: {e}")))?;
        inner.backend.add(vector.view())?;
        inner.entries.push(IndexEntry {
            face_id: face_id.to_string(),
            person_id: person_id.clone(),
            quality_score,
            metadata,
            added_at: Utc::now(),
        });
        inner.inserts_since_checkpoint += 1;

        debug!(face_id, person_id = %person_id, entries = inner.entries.len(), "face registered");

        if self.config.checkpoint_interval > 0
            && inner.inserts_since_checkpoint >= self.config.checkpoint_interval
        {
            inner.inserts_since_checkpoint = 0;
            self.dispatch_checkpoint(&inner);
        }
        Ok(())
    }

    /// Register a batch, halving the chunk size and retrying on capacity
    /// failures. A capacity failure at chunk size 1 propagates to the
    /// caller rather than silently dropping a registration. Returns the
    /// number registered.
    pub fn add_batch(
        &self,
        items: Vec<(String, Vec<f32>, HashMap<String, String>)>,
    ) -> Result<usize, MatcherError> {
        let mut registered = 0;
        let mut pending = items;
        let mut chunk = pending.len().max(1);
        while !pending.is_empty() {
            let take = chunk.min(pending.len());
            let batch: Vec<_> = pending.drain(..take).collect();
            match self.try_batch(batch) {
                Ok(count) => registered += count,
                Err((done, rest, MatcherError::Capacity(reason))) if chunk > 1 => {
                    registered += done;
                    chunk = (chunk / 2).max(1);
                    warn!(chunk, reason = %reason, "capacity failure, retrying with smaller batch");
                    pending.splice(0..0, rest);
                }
                Err((done, _, err)) => {
                    registered += done;
                    return Err(err);
                }
            }
        }
        Ok(registered)
    }

    #[allow(clippy::type_complexity)]
    fn try_batch(
        &self,
        batch: Vec<(String, Vec<f32>, HashMap<String, String>)>,
    ) -> Result<usize, (usize, Vec<(String, Vec<f32>, HashMap<String, String>)>, MatcherError)>
    {
        let total = batch.len();
        let mut iter = batch.into_iter();
        let mut done = 0;
        while let Some((face_id, embedding, metadata)) = iter.next() {
            if let Err(err) = self.add(&face_id, &embedding, metadata.clone()) {
                let mut rest = vec![(face_id, embedding, metadata)];
                rest.extend(iter);
                return Err((done, rest, err));
            }
            done += 1;
        }
        Ok(total)
    }

    /// Rank gallery identities against a probe embedding.
    ///
    /// Never returns an error: a malformed probe or backend failure logs
    /// and yields an empty list so the caller's frame loop stays alive.
    pub fn find(&self, embedding: &[f32], max_matches: usize) -> Vec<MatchResult> {
        let started = Instant::now();
        let vector = match self.validate_embedding(embedding) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "probe rejected");
                return Vec::new();
            }
        };
        if max_matches == 0 {
            return Vec::new();
        }

        let key = cache_key(&vector_bytes(&vector));
        {
            let mut cache = self.cache.lock().expect("cache lock poisoned");
            if let Some(hit) = cache.get(&key) {
                return hit;
            }
        }

        let results = {
            let inner = self.inner.read().expect("matcher lock poisoned");
            if inner.entries.is_empty() {
                Vec::new()
            } else {
                // Overshoot so per-person de-duplication still fills k.
                let neighbors = inner
                    .backend
                    .search(vector.view(), max_matches.saturating_mul(2));
                let mut results = Vec::with_capacity(neighbors.len());
                for neighbor in neighbors {
                    let entry = &inner.entries[neighbor.ordinal];
                    let mut confidence = inner.backend.confidence(neighbor.distance);
                    if self.config.quality_weighting {
                        confidence *= entry.quality_score;
                    }
                    if confidence < self.config.min_confidence {
                        continue;
                    }
                    results.push(MatchResult {
                        person_id: entry.person_id.clone(),
                        confidence,
                        encoding_id: entry.face_id.clone(),
                        quality_score: entry.quality_score,
                        metadata: entry.metadata.clone(),
                        match_time: Duration::ZERO,
                        match_distance: Some(neighbor.distance),
                    });
                }
                dedup_by_person(results, max_matches)
            }
        };

        let match_time = started.elapsed();
        let results: Vec<MatchResult> = results
            .into_iter()
            .map(|mut r| {
                r.match_time = match_time;
                r
            })
            .collect();

        let mut cache = self.cache.lock().expect("cache lock poisoned");
        cache.insert(key, results.clone());
        results
    }

    /// Drop `face_id` from the gallery. The backend is rebuilt (no backend
    /// is assumed to support in-place deletion) and the result cache is
    /// cleared. Returns whether the id existed.
    pub fn remove(&self, face_id: &str) -> Result<bool, MatcherError> {
        let mut inner = self.inner.write().expect("matcher lock poisoned");
        let Some(position) = inner.entries.iter().position(|e| e.face_id == face_id) else {
            return Ok(false);
        };

        inner.entries.remove(position);
        let keep: Vec<usize> = (0..inner.embeddings.nrows())
            .filter(|&row| row != position)
            .collect();
        let kept = inner.embeddings.select(ndarray::Axis(0), &keep);
        inner.backend.rebuild(kept.view())?;
        inner.embeddings = kept;

        self.cache
            .lock()
            .expect("cache lock poisoned")
            .invalidate_all();

        info!(face_id, entries = inner.entries.len(), "face removed");
        self.dispatch_checkpoint(&inner);
        Ok(true)
    }

    /// Force a checkpoint of the current state.
    pub fn checkpoint_now(&self) {
        let inner = self.inner.read().expect("matcher lock poisoned");
        self.dispatch_checkpoint(&inner);
    }

    /// Drop expired cache entries; returns how many were removed.
    pub fn sweep_cache(&self) -> usize {
        self.cache.lock().expect("cache lock poisoned").sweep()
    }

    pub fn stats(&self) -> MatcherStats {
        let inner = self.inner.read().expect("matcher lock poisoned");
        let persons: HashSet<&str> =
            inner.entries.iter().map(|e| e.person_id.as_str()).collect();
        MatcherStats {
            entries: inner.entries.len(),
            persons: persons.len(),
            backend: inner.backend.kind(),
            cache: self.cache.lock().expect("cache lock poisoned").stats(),
        }
    }

    /// Stop the background writer and flush a final checkpoint. Idempotent.
    ///
    /// The final write is synchronous and happens after the worker has
    /// drained, so the newest state is always the last one on disk even
    /// when the checkpoint queue was full at shutdown.
    pub fn shutdown(&self) {
        // Dropping the sender closes the channel; the worker drains queued
        // jobs and exits.
        self.checkpoint_tx
            .lock()
            .expect("checkpoint lock poisoned")
            .take();
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if let Some(store) = &self.store {
            let inner = self.inner.read().expect("matcher lock poisoned");
            if let Err(err) = store.save(
                &inner.entries,
                inner.embeddings.view(),
                inner.backend.kind(),
                &inner.backend.to_blob(),
            ) {
                warn!(error = %err, "final checkpoint failed");
            }
        }
    }

    fn dispatch_checkpoint(&self, inner: &Inner) {
        let guard = self.checkpoint_tx.lock().expect("checkpoint lock poisoned");
        let Some(tx) = guard.as_ref() else {
            return;
        };
        let job = CheckpointJob {
            entries: inner.entries.clone(),
            embeddings: inner.embeddings.clone(),
            kind: inner.backend.kind(),
            blob: inner.backend.to_blob(),
        };
        // A full queue drops this snapshot; a later mutation re-dispatches
        // and shutdown always writes the final state synchronously.
        if let Err(err) = tx.try_send(job) {
            debug!(error = %err, "checkpoint skipped, queue busy");
        }
    }

    fn validate_embedding(&self, embedding: &[f32]) -> Result<Array1<f32>, MatcherError> {
        if embedding.len() != self.config.dim {
            return Err(MatcherError::Validation(format!(
                "embedding has dim {}, expected {}",
                embedding.len(),
                self.config.dim
            )));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(MatcherError::Validation(
                "embedding contains non-finite values".into(),
            ));
        }
        let norm: f32 = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(MatcherError::Validation("embedding has zero norm".into()));
        }
        Ok(Array1::from_iter(embedding.iter().map(|v| v / norm)))
    }
}

impl Drop for FaceMatcher {
    fn drop(&mut self) {
        self.checkpoint_tx
            .lock()
            .expect("checkpoint lock poisoned")
            .take();
        let handle = self.worker.lock().expect("worker lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn spawn_checkpoint_worker(
    store: IndexStore,
    mut rx: mpsc::Receiver<CheckpointJob>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("facetrack-checkpoint".into())
        .spawn(move || {
            debug!("checkpoint thread started");
            while let Some(job) = rx.blocking_recv() {
                if let Err(err) =
                    store.save(&job.entries, job.embeddings.view(), job.kind, &job.blob)
                {
                    warn!(error = %err, "checkpoint write failed, memory state remains authoritative");
                }
            }
            debug!("checkpoint thread exiting");
        })
        .expect("failed to spawn checkpoint thread")
}

/// Keep the best result per person, then order by confidence descending,
/// truncated to `k`. Input arrives in backend neighbor order (distance,
/// then insertion ordinal) and the sort is stable, so equal confidences
/// keep insertion order.
fn dedup_by_person(results: Vec<MatchResult>, k: usize) -> Vec<MatchResult> {
    let mut best: Vec<MatchResult> = Vec::new();
    for result in results {
        match best.iter_mut().find(|r| r.person_id == result.person_id) {
            Some(existing) => {
                if result.confidence > existing.confidence {
                    *existing = result;
                }
            }
            None => best.push(result),
        }
    }
    best.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    best.truncate(k);
    best
}

fn vector_bytes(vector: &Array1<f32>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector.iter() {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
