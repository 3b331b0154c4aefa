//! Shared hand-off store for the queued reply strategy.
//!
//! The store is one JSON document, `{incoming: [...], outgoing: [...]}`, read and
//! rewritten as a whole. This process appends to `incoming` and removes from
//! `outgoing`; an out-of-process worker drains `incoming` and appends to `outgoing`.
//!
//! # Single-consumer assumption
//!
//! Removal of an outgoing entry is a check-then-act over the whole document. That is
//! only safe because every id is globally unique (a v4 UUID minted per request) and
//! exactly one caller ever polls for a given id: the turn that enqueued it. Two
//! pollers for the same id could both observe and deliver the same reply. Within
//! this process, writes are serialised by an async mutex; across processes, the
//! worker is trusted to only append. A deployment with more than one consumer
//! needs a store with atomic dequeue instead of this file.
//!
//! # Abandoned requests
//!
//! A request whose turn timed out or whose call hung up is marked with
//! [`QueueStore::abandon`]. Replies the worker writes for it later are dropped from
//! `outgoing` the next time this process rewrites the document.

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A caller utterance handed to the external worker. Never mutated once enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: String,
    pub caller: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(id: impl Into<String>, caller: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            caller: caller.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A reply written by the external worker, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingResponse {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDocument {
    #[serde(default)]
    pub incoming: Vec<PendingMessage>,
    #[serde(default)]
    pub outgoing: Vec<OutgoingResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Location of the shared document
    pub path: PathBuf,

    /// Poll interval for replies (default: 500ms)
    pub poll_interval_ms: u64,

    /// How long to wait for a reply (default: 30000ms)
    pub timeout_ms: u64,

    /// Wake command run after each enqueue; empty disables waking
    pub wake_command: Vec<String>,

    /// Budget for the wake command (default: 5000ms)
    pub wake_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/phone-queue.json"),
            poll_interval_ms: 500,
            timeout_ms: 30_000,
            wake_command: vec![
                "clawdbot".to_string(),
                "system".to_string(),
                "event".to_string(),
                "--text".to_string(),
                "Phone: process queue".to_string(),
                "--mode".to_string(),
                "now".to_string(),
            ],
            wake_timeout_ms: 5_000,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn wake_timeout(&self) -> Duration {
        Duration::from_millis(self.wake_timeout_ms)
    }
}

/// Abandoned ids remembered while their replies may still arrive.
const ABANDONED_CAPACITY: usize = 256;

/// File-backed queue document. See the module docs for the consumption contract.
#[derive(Debug)]
pub struct QueueStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    abandoned: parking_lot::Mutex<VecDeque<String>>,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            abandoned: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, surfacing unavailable/corrupt stores as errors.
    pub async fn try_load(&self) -> VoiceResult<QueueDocument> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueDocument::default())
            }
            Err(e) => return Err(VoiceError::QueueUnavailable(e.to_string())),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(QueueDocument::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| VoiceError::QueueCorrupt(e.to_string()))
    }

    /// Read the document; a missing, unreadable or corrupt store reads as empty.
    pub async fn load(&self) -> QueueDocument {
        match self.try_load().await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("📭 Queue store {} treated as empty: {}", self.path.display(), e);
                QueueDocument::default()
            }
        }
    }

    /// Append a message to `incoming`. Existing entries are carried over untouched,
    /// apart from replies to abandoned requests.
    pub async fn enqueue(&self, message: PendingMessage) -> VoiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        self.discard_abandoned(&mut doc);
        let id = message.id.clone();
        doc.incoming.push(message);
        self.save(&doc).await?;
        info!("📥 Queued {} ({} pending)", id, doc.incoming.len());
        Ok(())
    }

    /// Remove and return the reply for `id`, if the worker has written one.
    ///
    /// The store is only rewritten when something is removed, so polling for an
    /// absent id never touches the file.
    pub async fn take_response(&self, id: &str) -> VoiceResult<Option<String>> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        let discarded = self.discard_abandoned(&mut doc);
        let taken = doc
            .outgoing
            .iter()
            .position(|r| r.id == id)
            .map(|idx| doc.outgoing.remove(idx));
        if taken.is_none() && discarded == 0 {
            return Ok(None);
        }
        self.save(&doc).await?;
        if taken.is_some() {
            debug!("📤 Consumed reply {}", id);
        }
        Ok(taken.map(|r| r.text))
    }

    /// Stop waiting for `id`. A reply that shows up later is discarded instead of
    /// being left in `outgoing`.
    pub fn abandon(&self, id: &str) {
        let mut abandoned = self.abandoned.lock();
        if abandoned.iter().any(|a| a == id) {
            return;
        }
        if abandoned.len() == ABANDONED_CAPACITY {
            abandoned.pop_front();
        }
        abandoned.push_back(id.to_string());
        debug!("🗑️ Abandoned {} ({} tracked)", id, abandoned.len());
    }

    pub fn is_abandoned(&self, id: &str) -> bool {
        self.abandoned.lock().iter().any(|a| a == id)
    }

    /// Drop replies to abandoned requests and forget those ids. Returns how many
    /// replies went.
    fn discard_abandoned(&self, doc: &mut QueueDocument) -> usize {
        let mut abandoned = self.abandoned.lock();
        if abandoned.is_empty() {
            return 0;
        }
        let before = doc.outgoing.len();
        doc.outgoing.retain(|r| match abandoned.iter().position(|a| *a == r.id) {
            Some(idx) => {
                abandoned.remove(idx);
                false
            }
            None => true,
        });
        let discarded = before - doc.outgoing.len();
        if discarded > 0 {
            info!("🗑️ Discarded {} late reply(s) to abandoned requests", discarded);
        }
        discarded
    }

    /// Append a reply to `outgoing`, as the external worker does.
    pub async fn push_response(&self, response: OutgoingResponse) -> VoiceResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load().await;
        doc.outgoing.push(response);
        self.save(&doc).await
    }

    async fn save(&self, doc: &QueueDocument) -> VoiceResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| VoiceError::QueueUnavailable(e.to_string()))?;
        }
        let json = serde_json::to_vec_pretty(doc)?;
        let staging = self.staging_path();
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| VoiceError::QueueUnavailable(e.to_string()))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| VoiceError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "queue.json".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.path.with_file_name(format!(".{}.{}.tmp", name, &suffix[..8]))
    }
}
