use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::AuthError;
use crate::oauth::{DeviceAuthStart, DevicePoll, OAuthClient, OAuthTokens};
use crate::token_cache::{CachedToken, TokenCache, TokenSource};

const TENANT_ALIASES: &[&str] = &["common", "organizations", "consumers"];

/// A client secret that never shows up in `Debug` output.
pub struct ClientSecret(SecretString);

impl ClientSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Short, non-reversible tag used to tell secrets apart in cache keys.
    fn fingerprint(&self) -> String {
        let digest = format!("{:x}", Sha256::digest(self.expose().as_bytes()));
        digest[..16].to_string()
    }
}

impl Clone for ClientSecret {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_string())
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret([REDACTED])")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    DeviceCode,
    ClientCredentials,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::DeviceCode => "device_code",
            FlowKind::ClientCredentials => "client_credentials",
        }
    }
}

/// The credential flow for one invocation.
#[derive(Debug, Clone)]
pub enum AuthFlow {
    /// Delegated, read-only sign-in through the device code grant.
    DeviceCode,
    /// Application permissions through the client credentials grant.
    ClientCredentials {
        secret: ClientSecret,
        /// Secret came from the call rather than the process configuration.
        overridden: bool,
    },
}

impl AuthFlow {
    pub fn kind(&self) -> FlowKind {
        match self {
            AuthFlow::DeviceCode => FlowKind::DeviceCode,
            AuthFlow::ClientCredentials { .. } => FlowKind::ClientCredentials,
        }
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, AuthFlow::DeviceCode)
    }

    fn key_label(&self) -> String {
        match self {
            AuthFlow::DeviceCode => FlowKind::DeviceCode.as_str().to_string(),
            AuthFlow::ClientCredentials { secret, overridden } => format!(
                "{}:{}{}",
                FlowKind::ClientCredentials.as_str(),
                if *overridden { "override:" } else { "" },
                secret.fingerprint()
            ),
        }
    }
}

/// Cache key derived from tenant, client and flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn derive(tenant_id: &str, client_id: &str, flow: &AuthFlow) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(tenant_id.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(client_id.trim().to_ascii_lowercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(flow.key_label().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Tenant/client identity fixed at start-up.
#[derive(Debug, Clone)]
pub struct CredentialContext {
    tenant_id: String,
    client_id: String,
    client_secret: Option<ClientSecret>,
    default_flow: FlowKind,
}

impl CredentialContext {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<ClientSecret>,
    ) -> Self {
        let client_secret = client_secret.filter(|s| !s.expose().trim().is_empty());
        let default_flow = if client_secret.is_some() {
            FlowKind::ClientCredentials
        } else {
            FlowKind::DeviceCode
        };
        Self {
            tenant_id: tenant_id.into().trim().to_string(),
            client_id: client_id.into().trim().to_string(),
            client_secret,
            default_flow,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn default_flow(&self) -> FlowKind {
        self.default_flow
    }

    /// Flow for one call. A per-call secret always selects the application flow.
    pub fn flow(&self, override_secret: Option<&ClientSecret>) -> AuthFlow {
        if let Some(secret) = override_secret.filter(|s| !s.expose().trim().is_empty()) {
            return AuthFlow::ClientCredentials {
                secret: secret.clone(),
                overridden: true,
            };
        }
        match (&self.default_flow, &self.client_secret) {
            (FlowKind::ClientCredentials, Some(secret)) => AuthFlow::ClientCredentials {
                secret: secret.clone(),
                overridden: false,
            },
            _ => AuthFlow::DeviceCode,
        }
    }

    pub fn identity_key(&self, flow: &AuthFlow) -> IdentityKey {
        IdentityKey::derive(&self.tenant_id, &self.client_id, flow)
    }

    /// Checks that tenant and client look like something Entra ID would accept for `flow`.
    pub fn validate_for(&self, flow: &AuthFlow) -> Result<(), AuthError> {
        if self.client_id.is_empty() {
            return Err(AuthError::IdentityMalformed(
                "client id is not configured".to_string(),
            ));
        }
        if !is_guid(&self.client_id) {
            return Err(AuthError::IdentityMalformed(format!(
                "client id '{}' is not a GUID",
                self.client_id
            )));
        }
        if self.tenant_id.is_empty() {
            return Err(AuthError::IdentityMalformed(
                "tenant id is not configured".to_string(),
            ));
        }
        let alias = TENANT_ALIASES
            .iter()
            .any(|a| a.eq_ignore_ascii_case(&self.tenant_id));
        if !alias && !is_guid(&self.tenant_id) && !is_domain(&self.tenant_id) {
            return Err(AuthError::IdentityMalformed(format!(
                "tenant id '{}' is neither a GUID nor a domain name",
                self.tenant_id
            )));
        }
        if alias && !flow.is_interactive() {
            return Err(AuthError::IdentityMalformed(format!(
                "the application flow needs a concrete tenant, not '{}'",
                self.tenant_id
            )));
        }
        Ok(())
    }
}

fn is_guid(value: &str) -> bool {
    let parts: Vec<&str> = value.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    parts.len() == lens.len()
        && parts
            .iter()
            .zip(lens)
            .all(|(p, n)| p.len() == n && p.chars().all(|c| c.is_ascii_hexdigit()))
}

fn is_domain(value: &str) -> bool {
    value.contains('.')
        && !value.starts_with('.')
        && !value.ends_with('.')
        && value
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

/// Receives the verification URL and user code when a device sign-in starts.
pub trait DevicePromptSink: Send + Sync {
    fn device_code_issued(&self, prompt: &DeviceAuthStart);
}

/// Writes the device prompt to the log (stderr).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPromptSink;

impl DevicePromptSink for LogPromptSink {
    fn device_code_issued(&self, prompt: &DeviceAuthStart) {
        warn!(
            verification_uri = %prompt.verification_uri,
            user_code = %prompt.user_code,
            expires_in = prompt.expires_in,
            "Sign-in required: open {} and enter code {}",
            prompt.verification_uri,
            prompt.user_code
        );
    }
}

/// Picks the flow for each call and turns it into a cached access token.
pub struct CredentialResolver {
    context: CredentialContext,
    oauth: OAuthClient,
    cache: Arc<TokenCache>,
    delegated_scopes: String,
    device_timeout: Duration,
    prompt: Arc<dyn DevicePromptSink>,
}

impl CredentialResolver {
    pub fn new(
        context: CredentialContext,
        oauth: OAuthClient,
        cache: Arc<TokenCache>,
        delegated_scopes: &[String],
        device_timeout: Duration,
    ) -> Self {
        Self {
            context,
            oauth,
            cache,
            delegated_scopes: delegated_scopes.join(" "),
            device_timeout,
            prompt: Arc::new(LogPromptSink),
        }
    }

    pub fn from_settings(settings: &Settings, cache: Arc<TokenCache>) -> Result<Self, AuthError> {
        let oauth = OAuthClient::new(settings.authority_host.clone(), settings.request_timeout)?;
        Ok(Self::new(
            settings.credential_context(),
            oauth,
            cache,
            &settings.scopes,
            settings.device_flow_timeout,
        ))
    }

    pub fn with_prompt_sink(mut self, prompt: Arc<dyn DevicePromptSink>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn context(&self) -> &CredentialContext {
        &self.context
    }

    pub fn cache(&self) -> &Arc<TokenCache> {
        &self.cache
    }

    pub fn flow_for(&self, override_secret: Option<&ClientSecret>) -> AuthFlow {
        self.context.flow(override_secret)
    }

    /// Returns a valid token for the call, acquiring one if the cache has none.
    pub async fn resolve(
        &self,
        override_secret: Option<&ClientSecret>,
    ) -> Result<CachedToken, AuthError> {
        let flow = self.flow_for(override_secret);
        self.resolve_flow(&flow).await
    }

    pub async fn resolve_flow(&self, flow: &AuthFlow) -> Result<CachedToken, AuthError> {
        self.context.validate_for(flow)?;
        let key = self.context.identity_key(flow);
        let source = FlowSource {
            resolver: self,
            flow,
        };
        self.cache.get_or_refresh(&key, &source).await
    }

    /// Replaces `stale` after the upstream rejected it. Concurrent callers that
    /// already replaced it get the newer token back without another round trip.
    pub async fn force_refresh(
        &self,
        flow: &AuthFlow,
        stale: &CachedToken,
    ) -> Result<CachedToken, AuthError> {
        self.context.validate_for(flow)?;
        let key = self.context.identity_key(flow);
        let source = FlowSource {
            resolver: self,
            flow,
        };
        self.cache
            .force_refresh(&key, &stale.access_token, &source)
            .await
    }

    async fn device_sign_in(&self) -> Result<OAuthTokens, AuthError> {
        let tenant = self.context.tenant_id();
        let client = self.context.client_id();
        let start = self
            .oauth
            .device_authorize(tenant, client, &self.delegated_scopes)
            .await?;
        self.prompt.device_code_issued(&start);

        let lifetime = Duration::from_secs(start.expires_in.max(1) as u64);
        let budget = self.device_timeout.min(lifetime);
        let timeout_secs = budget.as_secs().max(1);
        let mut interval = Duration::from_secs(start.interval.unwrap_or(5).max(1) as u64);

        let poll = async {
            loop {
                tokio::time::sleep(interval).await;
                match self.oauth.device_poll(tenant, client, &start.device_code).await? {
                    DevicePoll::Pending => continue,
                    DevicePoll::SlowDown => {
                        interval += Duration::from_secs(5);
                        debug!(?interval, "device poll asked to slow down");
                    }
                    DevicePoll::Complete(tokens) => return Ok::<_, AuthError>(tokens),
                }
            }
        };

        match tokio::time::timeout(budget, poll).await {
            Ok(Ok(tokens)) => {
                info!("Device code sign-in completed");
                Ok(tokens)
            }
            Ok(Err(AuthError::InteractiveTimeout(_))) | Err(_) => {
                warn!(timeout_secs, "Device code sign-in timed out");
                Err(AuthError::InteractiveTimeout(timeout_secs))
            }
            Ok(Err(e)) => Err(e),
        }
    }
}

struct FlowSource<'a> {
    resolver: &'a CredentialResolver,
    flow: &'a AuthFlow,
}

#[async_trait]
impl TokenSource for FlowSource<'_> {
    fn flow_kind(&self) -> FlowKind {
        self.flow.kind()
    }

    async fn acquire(&self, previous: Option<&CachedToken>) -> Result<OAuthTokens, AuthError> {
        let ctx = &self.resolver.context;
        match self.flow {
            AuthFlow::ClientCredentials { secret, overridden } => {
                debug!(overridden, "Requesting application token");
                self.resolver
                    .oauth
                    .client_credentials(ctx.tenant_id(), ctx.client_id(), secret)
                    .await
            }
            AuthFlow::DeviceCode => {
                if let Some(refresh_token) = previous.and_then(|t| t.refresh_token.as_deref()) {
                    match self
                        .resolver
                        .oauth
                        .refresh(
                            ctx.tenant_id(),
                            ctx.client_id(),
                            refresh_token,
                            &self.resolver.delegated_scopes,
                        )
                        .await
                    {
                        Ok(tokens) => return Ok(tokens),
                        Err(e) => warn!(error = %e, "Silent refresh failed, falling back to device code"),
                    }
                }
                self.resolver.device_sign_in().await
            }
        }
    }
}
