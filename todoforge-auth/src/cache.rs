//! Token cache and its persistence hooks.
//!
//! The cache is an opaque JSON blob as far as callers are concerned. A
//! [`CachePlugin`] is consulted before every cache access (to load the
//! persisted state) and after it (to write the state back when, and only
//! when, the access changed something).

use crate::error::Result;
use crate::AccountInfo;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Access tokens expiring within this window are treated as expired.
const EXPIRY_SKEW_MINUTES: i64 = 5;

/// Scopes the identity platform handles itself; they never show up on an
/// access token and are ignored when checking coverage.
const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

const GRAPH_RESOURCE_PREFIX: &str = "https://graph.microsoft.com/";

// ============================================================================
// Cache Types
// ============================================================================

/// An access token as stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccessToken {
    pub secret: String,
    pub expires_on: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl CachedAccessToken {
    /// Whether this token can be handed out for `scopes` at `now`.
    pub fn is_usable(&self, scopes: &[String], now: DateTime<Utc>) -> bool {
        if self.expires_on <= now + Duration::minutes(EXPIRY_SKEW_MINUTES) {
            return false;
        }

        let granted: Vec<String> = self.scopes.iter().map(|s| normalize_scope(s)).collect();
        scopes
            .iter()
            .map(|s| normalize_scope(s))
            .filter(|s| !RESERVED_SCOPES.contains(&s.as_str()))
            .all(|s| granted.contains(&s))
    }
}

fn normalize_scope(scope: &str) -> String {
    let lower = scope.to_ascii_lowercase();
    lower
        .strip_prefix(GRAPH_RESOURCE_PREFIX)
        .map(str::to_string)
        .unwrap_or(lower)
}

/// Everything the cache knows about one signed-in account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    pub account: AccountInfo,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<CachedAccessToken>,
}

/// In-memory token cache, keyed by home account id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    accounts: BTreeMap<String, CachedAccount>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize the cache to the JSON blob written to disk.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a blob previously produced by [`TokenCache::to_json`].
    pub fn from_json(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }

    /// All cached accounts, ordered by home account id.
    pub fn accounts(&self) -> Vec<AccountInfo> {
        self.accounts
            .values()
            .map(|entry| entry.account.clone())
            .collect()
    }

    pub fn get(&self, home_account_id: &str) -> Option<&CachedAccount> {
        self.accounts.get(home_account_id)
    }

    /// Insert or replace the entry for the entry's account.
    pub fn upsert(&mut self, entry: CachedAccount) {
        self.accounts
            .insert(entry.account.home_account_id.clone(), entry);
    }

    /// Remove an account. Returns `true` if it was present.
    pub fn remove(&mut self, home_account_id: &str) -> bool {
        self.accounts.remove(home_account_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

// ============================================================================
// Cache Plugin
// ============================================================================

/// View of the cache handed to a [`CachePlugin`].
#[derive(Debug)]
pub struct TokenCacheContext<'a> {
    cache: &'a mut TokenCache,
    has_changed: bool,
}

impl<'a> TokenCacheContext<'a> {
    pub fn new(cache: &'a mut TokenCache, has_changed: bool) -> Self {
        Self { cache, has_changed }
    }

    pub fn token_cache(&self) -> &TokenCache {
        self.cache
    }

    /// Replace the in-memory cache, typically with persisted state.
    pub fn replace(&mut self, cache: TokenCache) {
        *self.cache = cache;
    }

    /// Whether the access that just finished modified the cache.
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }
}

/// Persistence hooks around every cache access.
#[async_trait]
pub trait CachePlugin: Send + Sync {
    /// Called before the cache is read or written.
    async fn before_cache_access(&self, context: &mut TokenCacheContext<'_>) -> Result<()>;

    /// Called after the cache was read or written.
    async fn after_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()>;
}

/// Persists the cache as a JSON file.
#[derive(Debug, Clone)]
pub struct FileCachePlugin {
    path: PathBuf,
}

impl FileCachePlugin {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CachePlugin for FileCachePlugin {
    async fn before_cache_access(&self, context: &mut TokenCacheContext<'_>) -> Result<()> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }

        let data = tokio::fs::read_to_string(&self.path).await?;
        context.replace(TokenCache::from_json(&data)?);
        debug!("Loaded token cache from {}", self.path.display());
        Ok(())
    }

    async fn after_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()> {
        if !context.has_changed() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, context.token_cache().to_json()?).await?;
        debug!("Wrote token cache to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
