//! Permanent, fail-closed alert deduplication.
//!
//! A key's presence means "already alerted, suppress". Keys never expire;
//! edge-triggered rules clear them when their condition stops holding.

use async_trait::async_trait;
use dashmap::DashMap;
use monitor_store::{RecipientId, SqliteStore};
use regex_lite::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup backend unavailable: {0}")]
    Unavailable(String),
    #[error("dedup backend error: {0}")]
    Backend(String),
    #[error("invalid dedup pattern {0:?}")]
    InvalidPattern(String),
}

impl From<anyhow::Error> for DedupError {
    fn from(e: anyhow::Error) -> Self {
        Self::Backend(format!("{:#}", e))
    }
}

/// Key-existence store behind the deduplicator.
#[async_trait]
pub trait DedupBackend: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool, DedupError>;
    async fn insert(&self, key: &str) -> Result<(), DedupError>;
    async fn remove(&self, key: &str) -> Result<(), DedupError>;
    /// Remove keys matching a glob (`*`, `?`, `[...]`); returns how many were removed.
    async fn remove_matching(&self, pattern: &str) -> Result<u64, DedupError>;
}

/// Gate in front of every outbound alert.
#[derive(Clone)]
pub struct Deduplicator {
    backend: Arc<dyn DedupBackend>,
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator").finish_non_exhaustive()
    }
}

impl Deduplicator {
    pub fn new(backend: Arc<dyn DedupBackend>) -> Self {
        Self { backend }
    }

    /// True if the key is marked. Also true when the backend cannot answer.
    pub async fn already_marked(&self, key: &str) -> bool {
        match self.backend.contains(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, error = %e, "Dedup lookup failed, suppressing alert");
                true
            }
        }
    }

    pub async fn mark(&self, key: &str) {
        if let Err(e) = self.backend.insert(key).await {
            warn!(key = %key, error = %e, "Dedup mark failed");
        }
    }

    pub async fn clear(&self, key: &str) {
        if let Err(e) = self.backend.remove(key).await {
            warn!(key = %key, error = %e, "Dedup clear failed");
        }
    }

    pub async fn clear_matching(&self, pattern: &str) {
        match self.backend.remove_matching(pattern).await {
            Ok(0) => {}
            Ok(removed) => debug!(pattern = %pattern, removed, "Cleared dedup keys"),
            Err(e) => warn!(pattern = %pattern, error = %e, "Dedup pattern clear failed"),
        }
    }

    /// Forget every alert sent to a recipient (used when they unsubscribe).
    pub async fn clear_recipient(&self, recipient: RecipientId) {
        self.clear_matching(&format!("{}:*", recipient)).await;
        self.clear_matching(&format!("*:{}:*", recipient)).await;
    }
}

/// Translate a glob into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex, DedupError> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if inner == '\\' {
                        re.push('\\');
                    }
                    re.push(inner);
                }
                if !closed {
                    return Err(DedupError::InvalidPattern(pattern.to_string()));
                }
                re.push(']');
            }
            other => re.push_str(&regex_lite::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|_| DedupError::InvalidPattern(pattern.to_string()))
}

/// Process-local backend. Can be switched off to simulate an outage.
#[derive(Debug)]
pub struct MemoryDedupBackend {
    keys: DashMap<String, ()>,
    available: AtomicBool,
}

impl Default for MemoryDedupBackend {
    fn default() -> Self {
        Self {
            keys: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryDedupBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn check(&self) -> Result<(), DedupError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DedupError::Unavailable("memory backend disabled".to_string()))
        }
    }
}

#[async_trait]
impl DedupBackend for MemoryDedupBackend {
    async fn contains(&self, key: &str) -> Result<bool, DedupError> {
        self.check()?;
        Ok(self.keys.contains_key(key))
    }

    async fn insert(&self, key: &str) -> Result<(), DedupError> {
        self.check()?;
        self.keys.insert(key.to_string(), ());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), DedupError> {
        self.check()?;
        self.keys.remove(key);
        Ok(())
    }

    async fn remove_matching(&self, pattern: &str) -> Result<u64, DedupError> {
        self.check()?;
        let re = glob_to_regex(pattern)?;
        let before = self.keys.len();
        self.keys.retain(|k, _| !re.is_match(k));
        Ok(before.saturating_sub(self.keys.len()) as u64)
    }
}

#[async_trait]
impl DedupBackend for SqliteStore {
    async fn contains(&self, key: &str) -> Result<bool, DedupError> {
        Ok(self.dedup_contains(key).await?)
    }

    async fn insert(&self, key: &str) -> Result<(), DedupError> {
        Ok(self.dedup_insert(key).await?)
    }

    async fn remove(&self, key: &str) -> Result<(), DedupError> {
        Ok(self.dedup_remove(key).await?)
    }

    async fn remove_matching(&self, pattern: &str) -> Result<u64, DedupError> {
        Ok(self.dedup_remove_matching(pattern).await?)
    }
}
