//! Session index cache - per-directory session summaries with a JSON sidecar.
//!
//! Reads pick one of three paths:
//! - fast: nothing dirty and validated within the TTL, no filesystem calls
//! - incremental: only known sessions were touched, re-stat just those
//! - full: list the directory, stat in batches, reparse fingerprint mismatches
//!
//! Concurrent reads of one directory share a single computation. Sidecar
//! writes go through a small state machine so a burst of changes costs at
//! most one extra write.

use crate::error::{Result, SyncError};
use crate::normalizer::read_log;
use crate::sessions::{Provider, SessionSummary};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// Bump when the sidecar layout changes; older sidecars are discarded.
pub const INDEX_VERSION: u32 = 1;

/// Concurrent stats per batch during a full validation
const STAT_BATCH_SIZE: usize = 32;

/// A summary plus the fingerprint of the file it was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSummary {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub file_name: String,
    pub indexed_bytes: u64,
    /// Milliseconds since the epoch
    pub file_mtime: u64,
}

impl CachedSummary {
    fn matches(&self, fingerprint: Fingerprint) -> bool {
        self.file_mtime == fingerprint.mtime_ms && self.indexed_bytes == fingerprint.bytes
    }
}

/// On-disk sidecar for one directory
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndexState {
    version: u32,
    project_id: String,
    sessions: HashMap<String, CachedSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    mtime_ms: u64,
    bytes: u64,
}

impl Fingerprint {
    fn of(metadata: &Metadata) -> Self {
        let mtime_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as u64);
        Self {
            mtime_ms,
            bytes: metadata.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// A top-level session log
    Session,
    /// A subagent transcript stored beside its parent session
    Agent,
    Other,
}

/// A file-change notification, relative to a provider root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub provider: Provider,
    pub file_type: FileType,
    pub change_type: ChangeType,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Sidecars live in `<data_dir>/indexes/`
    pub data_dir: PathBuf,
    /// How long a full validation stays trusted. Zero validates on every read.
    pub ttl: Duration,
    /// Directories kept in memory before the oldest is evicted
    pub max_directories: usize,
}

/// Read-path counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub reparses: u64,
    pub fast_reads: u64,
    pub incremental_reads: u64,
    pub full_reads: u64,
    /// Sidecar writes that reached disk
    pub saves: u64,
}

#[derive(Default)]
struct Counters {
    reparses: AtomicU64,
    fast_reads: AtomicU64,
    incremental_reads: AtomicU64,
    full_reads: AtomicU64,
    saves: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaveState {
    Idle,
    Saving,
    /// A change landed mid-save; write once more when the current save ends
    SavingAndDirty,
}

struct DirState {
    project_id: String,
    sessions: HashMap<String, CachedSummary>,
    last_validated: Option<Instant>,
    dir_dirty: bool,
    dirty_sessions: HashSet<String>,
    save: SaveState,
}

impl DirState {
    fn new(project_id: &str, sessions: HashMap<String, CachedSummary>) -> Self {
        Self {
            project_id: project_id.to_string(),
            sessions,
            last_validated: None,
            dir_dirty: false,
            dirty_sessions: HashSet::new(),
            save: SaveState::Idle,
        }
    }

    fn summaries(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self.sessions.values().map(|c| c.summary.clone()).collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

/// Directory states in insertion order
#[derive(Default)]
struct DirMap {
    order: VecDeque<PathBuf>,
    states: HashMap<PathBuf, DirState>,
}

impl DirMap {
    fn insert(&mut self, dir: PathBuf, state: DirState, cap: usize) {
        if self.states.insert(dir.clone(), state).is_none() {
            self.order.push_back(dir.clone());
        }
        while self.states.len() > cap.max(1) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if oldest == dir {
                self.order.push_back(oldest);
                continue;
            }
            debug!("Evicting index for {}", oldest.display());
            self.states.remove(&oldest);
        }
    }
}

enum ReadMode {
    Incremental(HashSet<String>),
    Full,
}

type SummaryFuture = Shared<BoxFuture<'static, Arc<Vec<SessionSummary>>>>;

pub struct SessionIndexCache {
    config: IndexConfig,
    dirs: Mutex<DirMap>,
    in_flight: DashMap<PathBuf, (u64, SummaryFuture)>,
    next_generation: AtomicU64,
    counters: Counters,
    pending_saves: AtomicUsize,
    saves_done: Notify,
}

impl SessionIndexCache {
    pub fn new(config: IndexConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            dirs: Mutex::new(DirMap::default()),
            in_flight: DashMap::new(),
            next_generation: AtomicU64::new(0),
            counters: Counters::default(),
            pending_saves: AtomicUsize::new(0),
            saves_done: Notify::new(),
        })
    }

    /// Create the sidecar directory. The only cache failure that reaches the caller.
    pub async fn initialize(&self) -> Result<()> {
        let path = self.indexes_dir();
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| SyncError::DataDir {
                path: path.clone(),
                source,
            })?;
        info!("Session index ready at {}", path.display());
        Ok(())
    }

    /// Wait for in-progress sidecar writes to finish.
    pub async fn dispose(&self) {
        loop {
            let notified = self.saves_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending_saves.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        debug!("Session index disposed");
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            reparses: self.counters.reparses.load(Ordering::Relaxed),
            fast_reads: self.counters.fast_reads.load(Ordering::Relaxed),
            incremental_reads: self.counters.incremental_reads.load(Ordering::Relaxed),
            full_reads: self.counters.full_reads.load(Ordering::Relaxed),
            saves: self.counters.saves.load(Ordering::Relaxed),
        }
    }

    /// Directories currently held in memory, oldest first
    pub async fn cached_directories(&self) -> Vec<PathBuf> {
        self.dirs.lock().await.order.iter().cloned().collect()
    }

    /// Summaries for every session in `dir`, newest first.
    pub async fn get_summaries(
        self: &Arc<Self>,
        dir: &Path,
        project_id: &str,
        provider: Provider,
    ) -> Vec<SessionSummary> {
        let key = dir.to_path_buf();
        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().1.clone(),
            Entry::Vacant(entry) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let this = Arc::clone(self);
                let project_id = project_id.to_string();
                let fut = async move {
                    let summaries = Arc::new(this.compute(&key, &project_id, provider).await);
                    this.in_flight.remove_if(&key, |_, (g, _)| *g == generation);
                    summaries
                }
                .boxed()
                .shared();
                entry.insert((generation, fut.clone()));
                fut
            }
        };
        shared.await.as_ref().clone()
    }

    /// Mark a directory or session dirty in response to a file change under `root`.
    pub async fn handle_change(&self, root: &Path, change: &FileChange) {
        if change.file_type != FileType::Session {
            return;
        }
        let path = root.join(&change.relative_path);
        let Some(dir) = path.parent() else {
            return;
        };

        let mut dirs = self.dirs.lock().await;
        // Unknown directories get a full read on first request anyway
        let Some(state) = dirs.states.get_mut(dir) else {
            return;
        };
        match change.change_type {
            ChangeType::Create | ChangeType::Delete => {
                debug!("Directory dirty: {}", dir.display());
                state.dir_dirty = true;
            }
            ChangeType::Update => {
                if let Some(id) = change.provider.session_id_from_path(&path) {
                    debug!("Session dirty: {}", id);
                    state.dirty_sessions.insert(id);
                }
            }
        }
    }

    async fn compute(self: &Arc<Self>, dir: &Path, project_id: &str, provider: Provider) -> Vec<SessionSummary> {
        let mut dirs = self.dirs.lock().await;
        if !dirs.states.contains_key(dir) {
            drop(dirs);
            let loaded = self.load_sidecar(dir, project_id).await;
            dirs = self.dirs.lock().await;
            if !dirs.states.contains_key(dir) {
                dirs.insert(dir.to_path_buf(), loaded, self.config.max_directories);
            }
        }
        let Some(state) = dirs.states.get_mut(dir) else {
            return Vec::new();
        };

        // Flags raised after this point belong to the next read
        let dir_dirty = std::mem::take(&mut state.dir_dirty);
        let dirty = std::mem::take(&mut state.dirty_sessions);
        let fresh = !self.config.ttl.is_zero()
            && state
                .last_validated
                .is_some_and(|t| t.elapsed() < self.config.ttl);

        let mode = if !fresh || dir_dirty || dirty.iter().any(|id| !state.sessions.contains_key(id)) {
            ReadMode::Full
        } else if dirty.is_empty() {
            self.counters.fast_reads.fetch_add(1, Ordering::Relaxed);
            return state.summaries();
        } else {
            ReadMode::Incremental(dirty)
        };
        let mut sessions = state.sessions.clone();
        drop(dirs);

        let started = Instant::now();
        let is_full = matches!(mode, ReadMode::Full);
        let changed = match mode {
            ReadMode::Incremental(ids) => {
                self.counters.incremental_reads.fetch_add(1, Ordering::Relaxed);
                self.validate_sessions(dir, project_id, provider, &ids, &mut sessions)
                    .await
            }
            ReadMode::Full => {
                self.counters.full_reads.fetch_add(1, Ordering::Relaxed);
                match self.validate_directory(dir, project_id, provider, &mut sessions).await {
                    Ok(changed) => changed,
                    Err(e) => {
                        warn!("Failed to list {}: {}", dir.display(), e);
                        false
                    }
                }
            }
        };
        debug!(
            "Indexed {} ({} sessions, full={}, changed={}) in {:?}",
            dir.display(),
            sessions.len(),
            is_full,
            changed,
            started.elapsed()
        );

        let mut dirs = self.dirs.lock().await;
        let summaries = match dirs.states.get_mut(dir) {
            Some(state) => {
                state.sessions = sessions;
                if is_full {
                    state.last_validated = Some(Instant::now());
                }
                state.summaries()
            }
            None => {
                let mut state = DirState::new(project_id, sessions);
                if is_full {
                    state.last_validated = Some(Instant::now());
                }
                let summaries = state.summaries();
                dirs.insert(dir.to_path_buf(), state, self.config.max_directories);
                summaries
            }
        };
        drop(dirs);

        if changed {
            self.schedule_save(dir).await;
        }
        summaries
    }

    /// Re-stat the given sessions and reparse the ones whose fingerprint moved.
    async fn validate_sessions(
        &self,
        dir: &Path,
        project_id: &str,
        provider: Provider,
        ids: &HashSet<String>,
        sessions: &mut HashMap<String, CachedSummary>,
    ) -> bool {
        let mut changed = false;
        for id in ids {
            let Some(file_name) = sessions.get(id).map(|c| c.file_name.clone()) else {
                continue;
            };
            let path = dir.join(&file_name);
            let fingerprint = match tokio::fs::metadata(&path).await {
                Ok(metadata) => Fingerprint::of(&metadata),
                Err(_) => {
                    sessions.remove(id);
                    changed = true;
                    continue;
                }
            };
            if sessions.get(id).is_some_and(|c| c.matches(fingerprint)) {
                continue;
            }
            changed |= self
                .refresh(&path, &file_name, id, project_id, provider, sessions)
                .await;
        }
        changed
    }

    /// List, stat, and reconcile every session log in `dir`.
    async fn validate_directory(
        &self,
        dir: &Path,
        project_id: &str,
        provider: Provider,
        sessions: &mut HashMap<String, CachedSummary>,
    ) -> Result<bool> {
        let mut candidates: Vec<(String, PathBuf)> = Vec::new();
        match tokio::fs::read_dir(dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if let Some(id) = provider.session_id_from_path(&path) {
                        candidates.push((id, path));
                    }
                }
            }
            // Directory gone: every cached session is pruned below
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut changed = false;
        let mut seen: HashSet<String> = HashSet::new();
        for batch in candidates.chunks(STAT_BATCH_SIZE) {
            let stats = join_all(batch.iter().map(|(id, path)| async move {
                (id, path, tokio::fs::metadata(path).await)
            }))
            .await;

            for (id, path, metadata) in stats {
                let Ok(metadata) = metadata else {
                    continue;
                };
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                seen.insert(id.clone());
                let fingerprint = Fingerprint::of(&metadata);
                if sessions
                    .get(id)
                    .is_some_and(|c| c.file_name == file_name && c.matches(fingerprint))
                {
                    continue;
                }
                changed |= self
                    .refresh(path, file_name, id, project_id, provider, sessions)
                    .await;
            }
        }

        let before = sessions.len();
        sessions.retain(|id, _| seen.contains(id));
        if sessions.len() != before {
            debug!("Pruned {} sessions from {}", before - sessions.len(), dir.display());
            changed = true;
        }
        Ok(changed)
    }

    /// Reparse one log into `sessions`. Returns whether the map changed.
    async fn refresh(
        &self,
        path: &Path,
        file_name: &str,
        session_id: &str,
        project_id: &str,
        provider: Provider,
        sessions: &mut HashMap<String, CachedSummary>,
    ) -> bool {
        self.counters.reparses.fetch_add(1, Ordering::Relaxed);
        match reparse(path, file_name, session_id, project_id, provider).await {
            Ok(cached) => {
                sessions.insert(session_id.to_string(), cached);
                true
            }
            Err(e) if e.is_not_found() => sessions.remove(session_id).is_some(),
            Err(e) => {
                warn!("Failed to index {}: {}", path.display(), e);
                false
            }
        }
    }

    async fn schedule_save(self: &Arc<Self>, dir: &Path) {
        let start = {
            let mut dirs = self.dirs.lock().await;
            let Some(state) = dirs.states.get_mut(dir) else {
                return;
            };
            match state.save {
                SaveState::Idle => {
                    state.save = SaveState::Saving;
                    true
                }
                SaveState::Saving | SaveState::SavingAndDirty => {
                    state.save = SaveState::SavingAndDirty;
                    false
                }
            }
        };
        if start {
            self.pending_saves.fetch_add(1, Ordering::AcqRel);
            let this = Arc::clone(self);
            let dir = dir.to_path_buf();
            tokio::spawn(async move {
                this.save_loop(&dir).await;
                this.pending_saves.fetch_sub(1, Ordering::AcqRel);
                this.saves_done.notify_waiters();
            });
        }
    }

    async fn save_loop(&self, dir: &Path) {
        loop {
            let snapshot = {
                let dirs = self.dirs.lock().await;
                let Some(state) = dirs.states.get(dir) else {
                    return;
                };
                SessionIndexState {
                    version: INDEX_VERSION,
                    project_id: state.project_id.clone(),
                    sessions: state.sessions.clone(),
                }
            };

            if let Err(e) = self.write_sidecar(dir, &snapshot).await {
                warn!("Failed to save index for {}: {}", dir.display(), e);
            }

            let mut dirs = self.dirs.lock().await;
            let Some(state) = dirs.states.get_mut(dir) else {
                return;
            };
            match state.save {
                SaveState::SavingAndDirty => state.save = SaveState::Saving,
                SaveState::Saving | SaveState::Idle => {
                    state.save = SaveState::Idle;
                    return;
                }
            }
        }
    }

    async fn write_sidecar(&self, dir: &Path, state: &SessionIndexState) -> Result<()> {
        let path = self.sidecar_path(dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(state)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        self.counters.saves.fetch_add(1, Ordering::Relaxed);
        debug!("Saved {} sessions to {}", state.sessions.len(), path.display());
        Ok(())
    }

    /// Sidecar contents, or an empty state if missing, unreadable, or stale.
    async fn load_sidecar(&self, dir: &Path, project_id: &str) -> DirState {
        let path = self.sidecar_path(dir);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(_) => return DirState::new(project_id, HashMap::new()),
        };
        match serde_json::from_slice::<SessionIndexState>(&bytes) {
            Ok(saved) if saved.version == INDEX_VERSION && saved.project_id == project_id => {
                debug!("Loaded {} cached sessions for {}", saved.sessions.len(), dir.display());
                DirState::new(project_id, saved.sessions)
            }
            Ok(saved) => {
                debug!(
                    "Discarding index for {} (version {}, project {})",
                    dir.display(),
                    saved.version,
                    saved.project_id
                );
                DirState::new(project_id, HashMap::new())
            }
            Err(e) => {
                warn!("Corrupt index {}, rebuilding: {}", path.display(), e);
                DirState::new(project_id, HashMap::new())
            }
        }
    }

    fn indexes_dir(&self) -> PathBuf {
        self.config.data_dir.join("indexes")
    }

    fn sidecar_path(&self, dir: &Path) -> PathBuf {
        self.indexes_dir().join(format!("{}.json", encode_dir(dir)))
    }
}

async fn reparse(
    path: &Path,
    file_name: &str,
    session_id: &str,
    project_id: &str,
    provider: Provider,
) -> Result<CachedSummary> {
    let log = read_log(path).await?;
    let parsed = provider.parse(&log.content, session_id);
    let mtime_ms = log
        .modified
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    Ok(CachedSummary {
        summary: parsed.summary(session_id, project_id, provider, log.modified),
        file_name: file_name.to_string(),
        indexed_bytes: log.len,
        file_mtime: mtime_ms,
    })
}

/// Flatten a directory path into a file name
fn encode_dir(dir: &Path) -> String {
    dir.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
        .collect()
}
