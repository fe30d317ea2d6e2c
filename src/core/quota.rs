//! Per-user upload and download counters
//!
//! Counters only grow; `reset` is the single administrative way down.
//! Entitled users are counted but never limited.
//!
//! A limited action takes a [`QuotaPermit`] first: the permit holds the
//! user's lock from the limit check until it is committed or dropped, so
//! concurrent requests cannot all pass the same check.

use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::core::config::QuotaConfig;
use crate::core::models::{AppError, AppResult, Identity, QuotaUsage, QuotaView};
use crate::utils::file_utils::write_json_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    Upload,
    Download,
}

impl QuotaKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }
}

pub struct QuotaLedger {
    config: QuotaConfig,
    usage: DashMap<String, QuotaUsage>,
    user_locks: DashMap<String, Arc<Mutex<()>>>,
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

/// A passed limit check that has not been counted yet.
///
/// Dropping it records nothing; [`QuotaPermit::commit`] counts the action.
pub struct QuotaPermit<'a> {
    ledger: &'a QuotaLedger,
    user_id: String,
    kind: QuotaKind,
    _guard: OwnedMutexGuard<()>,
}

impl QuotaPermit<'_> {
    pub async fn commit(self) -> AppResult<QuotaUsage> {
        self.ledger.record(&self.user_id, self.kind).await
    }
}

impl QuotaLedger {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            usage: DashMap::new(),
            user_locks: DashMap::new(),
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Ledger snapshotted to `path`, loading existing counters
    pub async fn open(config: QuotaConfig, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let usage = DashMap::new();

        if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read quota ledger: {:?}", path))?;
            if !content.trim().is_empty() {
                let stored: BTreeMap<String, QuotaUsage> = serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse quota ledger: {:?}", path))?;
                for (user, counters) in stored {
                    usage.insert(user, counters);
                }
            }
        }

        info!("Loaded quota counters for {} users", usage.len());
        Ok(Self {
            config,
            usage,
            user_locks: DashMap::new(),
            path: Some(path),
            write_lock: Mutex::new(()),
        })
    }

    pub fn usage(&self, user_id: &str) -> QuotaUsage {
        self.usage
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn view(&self, identity: &Identity) -> QuotaView {
        let usage = self.usage(&identity.user_id);
        let limited = self.is_limited(identity);
        QuotaView {
            uploads: usage.uploads,
            downloads: usage.downloads,
            upload_limit: limited.then_some(self.config.free_upload_limit),
            download_limit: limited.then_some(self.config.free_download_limit),
            entitled: identity.entitled,
        }
    }

    /// Check the limit for `kind` and hold the user's quota lock until the
    /// returned permit is committed or dropped
    pub async fn reserve(&self, identity: &Identity, kind: QuotaKind) -> AppResult<QuotaPermit<'_>> {
        let lock = self
            .user_locks
            .entry(identity.user_id.clone())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        self.check(identity, kind)?;
        Ok(QuotaPermit {
            ledger: self,
            user_id: identity.user_id.clone(),
            kind,
            _guard: guard,
        })
    }

    pub fn check(&self, identity: &Identity, kind: QuotaKind) -> AppResult<()> {
        let usage = self.usage(&identity.user_id);
        let (used, limit) = match kind {
            QuotaKind::Upload => (usage.uploads, self.config.free_upload_limit),
            QuotaKind::Download => (usage.downloads, self.config.free_download_limit),
        };
        if self.is_limited(identity) && used >= limit {
            return Err(AppError::QuotaExceeded(format!(
                "{} limit of {} reached",
                kind.label(),
                limit
            )));
        }
        Ok(())
    }

    /// Count one action without a limit check
    pub async fn record(&self, user_id: &str, kind: QuotaKind) -> AppResult<QuotaUsage> {
        let usage = self.bump(user_id, |u| match kind {
            QuotaKind::Upload => u.uploads = u.uploads.saturating_add(1),
            QuotaKind::Download => u.downloads = u.downloads.saturating_add(1),
        });
        self.persist().await?;
        Ok(usage)
    }

    /// Zero both counters for `user_id`
    pub async fn reset(&self, user_id: &str) -> AppResult<()> {
        if self.usage.remove(user_id).is_some() {
            info!("Reset quota counters for {}", user_id);
            self.persist().await?;
        }
        Ok(())
    }

    fn is_limited(&self, identity: &Identity) -> bool {
        self.config.enforce && !identity.entitled
    }

    fn bump<F>(&self, user_id: &str, apply: F) -> QuotaUsage
    where
        F: FnOnce(&mut QuotaUsage),
    {
        let mut entry = self.usage.entry(user_id.to_string()).or_default();
        apply(entry.value_mut());
        entry.value().clone()
    }

    async fn persist(&self) -> AppResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let snapshot: BTreeMap<String, QuotaUsage> = self
            .usage
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        write_json_atomic(path, &snapshot).await?;
        debug!("Persisted quota counters for {} users", snapshot.len());
        Ok(())
    }
}
