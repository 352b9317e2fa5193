//! Content-addressed map from conversation prefixes to agent session ids.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use super::digest::context_digest;
use crate::openai::ChatMessage;

/// Configuration for the session store.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    /// Entries older than this are swept.
    pub ttl: Duration,
    /// Backing file for persistence (none = memory only).
    pub persist_path: Option<PathBuf>,
    /// How often a dirty table is written to `persist_path`.
    pub flush_interval: Duration,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            persist_path: None,
            flush_interval: Duration::from_secs(30),
        }
    }
}

/// A resumable agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Maps the digest of a conversation context to the agent session that
/// produced it.
///
/// Safe to share across request handlers: every operation is atomic per
/// digest and the last writer for a digest wins.
#[derive(Debug)]
pub struct SessionStore {
    entries: DashMap<String, SessionEntry>,
    dirty: AtomicBool,
    config: SessionStoreConfig,
}

impl SessionStore {
    /// Create an empty in-memory store.
    pub fn new(config: SessionStoreConfig) -> Self {
        Self {
            entries: DashMap::new(),
            dirty: AtomicBool::new(false),
            config,
        }
    }

    /// Create a store, loading persisted entries if a backing file is
    /// configured. A missing or unreadable file yields an empty store.
    pub fn open(config: SessionStoreConfig) -> Self {
        let store = Self::new(config);
        if let Some(path) = store.config.persist_path.clone() {
            let loaded = load_entries(&path);
            info!(
                "Loaded {} session entries from {}",
                loaded.len(),
                path.display()
            );
            for (digest, entry) in loaded {
                store.entries.insert(digest, entry);
            }
        }
        store
    }

    /// Session id stored for exactly this context, if any.
    pub fn lookup(&self, context: &[ChatMessage]) -> Option<String> {
        if context.is_empty() {
            return None;
        }
        let digest = context_digest(context);
        self.entries
            .get(&digest)
            .map(|entry| entry.session_id.clone())
    }

    /// Record `session_id` as the continuation point for `context`.
    pub fn store(&self, context: &[ChatMessage], session_id: impl Into<String>) {
        self.store_at(context, session_id, Utc::now());
    }

    /// Like [`store`](Self::store) with an explicit creation timestamp.
    pub fn store_at(
        &self,
        context: &[ChatMessage],
        session_id: impl Into<String>,
        created_at: DateTime<Utc>,
    ) {
        let digest = context_digest(context);
        let session_id = session_id.into();
        debug!("Storing session {} for context {}", session_id, digest);
        self.entries.insert(
            digest,
            SessionEntry {
                session_id,
                created_at,
            },
        );
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Remove every entry older than `ttl`. Returns the number removed.
    pub fn sweep(&self, ttl: Duration) -> usize {
        self.sweep_at(ttl, Utc::now())
    }

    /// Sweep relative to an explicit `now`.
    pub fn sweep_at(&self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.signed_duration_since(entry.created_at) <= ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.dirty.store(true, Ordering::SeqCst);
            debug!("Swept {} expired session entries", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the table to the backing file if it changed since the last
    /// successful flush. Failures are logged and leave the store dirty.
    pub async fn flush(&self) {
        let Some(path) = self.config.persist_path.as_deref() else {
            return;
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let snapshot: HashMap<String, SessionEntry> = self
            .entries
            .iter()
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        match write_entries(path, &snapshot).await {
            Ok(()) => debug!(
                "Flushed {} session entries to {}",
                snapshot.len(),
                path.display()
            ),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                warn!("Failed to persist session store: {:?}", e);
            }
        }
    }

    /// Spawn the background task that sweeps every `ttl / 2` and flushes on
    /// `flush_interval`. The task performs a final flush and exits once
    /// `shutdown` is cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let ttl = store.config.ttl;
            let sweep_every = (ttl / 2).max(Duration::from_secs(1));
            let flush_every = store.config.flush_interval.max(Duration::from_secs(1));

            let mut sweep_tick = interval_at(Instant::now() + sweep_every, sweep_every);
            let mut flush_tick = interval_at(Instant::now() + flush_every, flush_every);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sweep_tick.tick() => {
                        store.sweep(ttl);
                    }
                    _ = flush_tick.tick() => {
                        store.flush().await;
                    }
                }
            }

            store.flush().await;
            debug!("Session store maintenance stopped");
        })
    }
}

fn load_entries(path: &Path) -> HashMap<String, SessionEntry> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not read session store {}: {}", path.display(), e);
            }
            return HashMap::new();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                "Ignoring corrupt session store {}: {}",
                path.display(),
                e
            );
            HashMap::new()
        }
    }
}

async fn write_entries(path: &Path, entries: &HashMap<String, SessionEntry>) -> Result<()> {
    let body = serde_json::to_vec_pretty(entries).context("serializing session store")?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, body)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}
