use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::credential::{FlowKind, IdentityKey};
use crate::error::AuthError;
use crate::oauth::OAuthTokens;
use crate::token_store::{MemoryTokenStore, TokenStore};

/// Tokens closer than this to expiry are treated as expired.
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 60;
// Used when the token endpoint omits `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3600;

#[derive(Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub identity_key: IdentityKey,
    pub access_token: String,
    /// Unix timestamp (seconds).
    pub expires_at: i64,
    #[serde(default)]
    pub scope_set: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub flow: FlowKind,
}

impl CachedToken {
    fn from_oauth(
        identity_key: IdentityKey,
        flow: FlowKind,
        tokens: OAuthTokens,
        previous: Option<&CachedToken>,
        now: i64,
    ) -> Self {
        let lifetime = tokens.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS).max(0);
        let scope_set = tokens
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Self {
            identity_key,
            access_token: tokens.access_token,
            expires_at: now + lifetime,
            scope_set,
            refresh_token: tokens
                .refresh_token
                .or_else(|| previous.and_then(|p| p.refresh_token.clone())),
            flow,
        }
    }

    pub fn expires_at_rfc3339(&self) -> Option<String> {
        chrono::DateTime::from_timestamp(self.expires_at, 0).map(|d| d.to_rfc3339())
    }

    /// Valid when more than `margin` seconds remain before `expires_at`.
    pub fn is_valid_at(&self, now: i64, margin: i64) -> bool {
        !self.access_token.is_empty() && self.expires_at - margin > now
    }
}

impl fmt::Debug for CachedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedToken")
            .field("identity_key", &self.identity_key)
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scope_set", &self.scope_set)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("flow", &self.flow)
            .finish()
    }
}

/// Produces fresh tokens for one identity. `previous` is the last cached
/// token for that identity, expired or not, so sources can refresh silently.
#[async_trait]
pub trait TokenSource: Send + Sync {
    fn flow_kind(&self) -> FlowKind;

    async fn acquire(&self, previous: Option<&CachedToken>) -> Result<OAuthTokens, AuthError>;
}

/// Process-wide token cache keyed by identity.
///
/// Valid tokens are served under a read lock. Acquisition is single-flight per
/// key: callers racing on the same expired identity wait for one refresh and
/// share its result.
pub struct TokenCache {
    entries: RwLock<HashMap<IdentityKey, CachedToken>>,
    guards: StdMutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
    store: Arc<dyn TokenStore>,
    margin: i64,
}

impl TokenCache {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            guards: StdMutex::new(HashMap::new()),
            store,
            margin: EXPIRY_SAFETY_MARGIN_SECS,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTokenStore::new()))
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Last known token for `key`, consulting the backing store on a miss.
    /// May be expired.
    pub fn get(&self, key: &IdentityKey) -> Option<CachedToken> {
        if let Some(t) = self.entries.read().ok()?.get(key) {
            return Some(t.clone());
        }
        let loaded = self.store.load(key)?;
        if let Ok(mut entries) = self.entries.write() {
            entries
                .entry(key.clone())
                .or_insert_with(|| loaded.clone());
        }
        Some(loaded)
    }

    /// A token for `key` that is valid past the safety margin, if one is cached.
    pub fn peek(&self, key: &IdentityKey) -> Option<CachedToken> {
        let now = Self::now();
        self.get(key).filter(|t| t.is_valid_at(now, self.margin))
    }

    pub async fn get_or_refresh(
        &self,
        key: &IdentityKey,
        source: &dyn TokenSource,
    ) -> Result<CachedToken, AuthError> {
        if let Some(t) = self.peek(key) {
            return Ok(t);
        }

        let guard = self.flow_guard(key);
        let _single = guard.lock().await;

        // Another caller may have refreshed while we waited.
        let current = self.get(key);
        if let Some(t) = current
            .as_ref()
            .filter(|t| t.is_valid_at(Self::now(), self.margin))
        {
            debug!(key = %key, "Token refreshed by concurrent caller");
            return Ok(t.clone());
        }

        debug!(key = %key, flow = source.flow_kind().as_str(), "Acquiring token");
        let tokens = source.acquire(current.as_ref()).await?;
        let token = CachedToken::from_oauth(
            key.clone(),
            source.flow_kind(),
            tokens,
            current.as_ref(),
            Self::now(),
        );
        Ok(self.store_if_newer(token))
    }

    /// Replaces a token the upstream rejected. If the cached token already
    /// differs from `stale_access_token` and is valid, it is returned as is.
    pub async fn force_refresh(
        &self,
        key: &IdentityKey,
        stale_access_token: &str,
        source: &dyn TokenSource,
    ) -> Result<CachedToken, AuthError> {
        let guard = self.flow_guard(key);
        let _single = guard.lock().await;

        let current = self.get(key);
        if let Some(t) = current.as_ref().filter(|t| {
            t.access_token != stale_access_token && t.is_valid_at(Self::now(), self.margin)
        }) {
            return Ok(t.clone());
        }
        // The rejected token must not come back from the store if acquisition fails.
        if current.is_some() {
            self.invalidate(key);
        }

        debug!(key = %key, "Forcing token refresh");
        let tokens = source.acquire(current.as_ref()).await?;
        let token = CachedToken::from_oauth(
            key.clone(),
            source.flow_kind(),
            tokens,
            current.as_ref(),
            Self::now(),
        );
        Ok(self.store_if_newer(token))
    }

    /// Stores `token` unless a valid token with a later expiry is already
    /// cached, in which case that one is returned instead.
    pub fn store_if_newer(&self, token: CachedToken) -> CachedToken {
        let now = Self::now();
        {
            let mut entries = match self.entries.write() {
                Ok(e) => e,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = entries.get(&token.identity_key) {
                if existing.expires_at > token.expires_at && existing.is_valid_at(now, self.margin)
                {
                    debug!(key = %token.identity_key, "Discarding token older than cached one");
                    return existing.clone();
                }
            }
            entries.insert(token.identity_key.clone(), token.clone());
        }
        if let Err(e) = self.store.save(&token) {
            warn!(error = %e, "Failed to persist token cache");
        }
        token
    }

    pub fn invalidate(&self, key: &IdentityKey) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(key);
        }
        if let Err(e) = self.store.remove(key) {
            warn!(error = %e, "Failed to remove token from cache store");
        }
    }

    fn flow_guard(&self, key: &IdentityKey) -> Arc<Mutex<()>> {
        let mut guards = match self.guards.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        guards
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
