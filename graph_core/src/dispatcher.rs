use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::credential::{AuthFlow, ClientSecret, CredentialResolver};
use crate::error::{AuthError, GatewayError};
use crate::token_cache::CachedToken;

const NO_CONTENT_MESSAGE: &str = "Operation completed successfully (no content returned)";
const NON_JSON_MESSAGE: &str = "Operation completed successfully";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn accepts_body(&self) -> bool {
        matches!(self, HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch)
    }

    /// Only reads are retried after a transport failure.
    pub fn is_retry_safe(&self) -> bool {
        matches!(self, HttpMethod::Get)
    }

    fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(GatewayError::Validation(format!(
                "unsupported HTTP method '{}'; expected GET, POST, PUT, PATCH or DELETE",
                other
            ))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A Graph path relative to the API version root, e.g. `users?$top=5`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePath(String);

impl ResourcePath {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::Validation(
                "command must be a non-empty Graph path such as 'me' or 'users'".to_string(),
            ));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(GatewayError::Validation(
                "command must not contain control characters".to_string(),
            ));
        }
        if trimmed.starts_with("//") || trimmed.starts_with("\\\\") || has_url_scheme(trimmed) {
            return Err(GatewayError::Validation(
                "command must be a relative Graph path, not an absolute URL".to_string(),
            ));
        }

        let relative = trimmed.trim_start_matches('/');
        let path_part = relative
            .split(|c: char| c == '?' || c == '#')
            .next()
            .unwrap_or_default();
        if escapes_root(path_part) {
            return Err(GatewayError::Validation(
                "command must not contain '..' path segments".to_string(),
            ));
        }
        if relative.is_empty() {
            return Err(GatewayError::Validation(
                "command must be a non-empty Graph path such as 'me' or 'users'".to_string(),
            ));
        }
        Ok(Self(relative.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// `scheme://...` as in RFC 3986: a letter, then letters, digits, `+`, `-` or `.`.
fn has_url_scheme(raw: &str) -> bool {
    let Some((scheme, _)) = raw.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

// Checks the raw path and up to three percent-decoded forms of it.
fn escapes_root(path: &str) -> bool {
    let mut current = path.to_string();
    for _ in 0..=3 {
        if current
            .split(|c: char| c == '/' || c == '\\')
            .any(|seg| seg.trim() == "..")
        {
            return true;
        }
        let decoded = match urlencoding::decode(&current) {
            Ok(d) => d.into_owned(),
            Err(_) => return false,
        };
        if decoded == current {
            return false;
        }
        current = decoded;
    }
    false
}

/// One invocation as received from the tool surface, before validation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub resource_path: String,
    pub http_method: String,
    pub payload: Option<Value>,
    pub override_client_secret: Option<ClientSecret>,
}

impl CommandRequest {
    pub fn new(resource_path: impl Into<String>, http_method: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
            http_method: http_method.into(),
            payload: None,
            override_client_secret: None,
        }
    }

    pub fn get(resource_path: impl Into<String>) -> Self {
        Self::new(resource_path, "GET")
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_client_secret(mut self, secret: ClientSecret) -> Self {
        self.override_client_secret = Some(secret);
        self
    }
}

/// Normalized outcome of a successful Graph call.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub status: u16,
    pub body: Value,
}

struct RawResponse {
    status: StatusCode,
    text: String,
}

/// Validates commands, authenticates them and forwards them to Graph.
pub struct Dispatcher {
    http: reqwest::Client,
    base_url: Url,
    resolver: Arc<CredentialResolver>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        base_url: Url,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("graph-mcp/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            base_url,
            resolver,
            max_retries,
            retry_base_delay: RETRY_BASE_DELAY,
        })
    }

    pub fn from_settings(
        settings: &Settings,
        resolver: Arc<CredentialResolver>,
    ) -> Result<Self, GatewayError> {
        Self::new(
            resolver,
            settings.graph_base_url.clone(),
            settings.request_timeout,
            settings.max_retries,
        )
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn resolver(&self) -> &Arc<CredentialResolver> {
        &self.resolver
    }

    /// Executes one Graph command. Validation and permission failures return
    /// before any network traffic.
    pub async fn execute(&self, request: CommandRequest) -> Result<CommandResult, GatewayError> {
        let path = ResourcePath::parse(&request.resource_path)?;
        let method = HttpMethod::from_str(&request.http_method)?;

        let flow = self
            .resolver
            .flow_for(request.override_client_secret.as_ref());
        if flow.is_interactive() && method != HttpMethod::Get {
            return Err(AuthError::InsufficientPermission(format!(
                "{} requires application permissions; interactive mode is read-only",
                method
            ))
            .into());
        }

        let url = self.url_for(&path)?;
        let payload = request.payload.as_ref().filter(|_| method.accepts_body());
        info!(%method, path = %path, flow = flow.kind().as_str(), "Executing Graph command");

        let token = self.resolver.resolve_flow(&flow).await?;
        let first = self.send(method, &url, &token, payload).await?;
        if first.status != StatusCode::UNAUTHORIZED {
            return interpret(first);
        }

        warn!(path = %path, "Graph rejected the access token, refreshing once");
        let fresh = self.refresh_after_reject(&flow, &token).await?;
        let second = self.send(method, &url, &fresh, payload).await?;
        interpret(second)
    }

    async fn refresh_after_reject(
        &self,
        flow: &AuthFlow,
        stale: &CachedToken,
    ) -> Result<CachedToken, GatewayError> {
        Ok(self.resolver.force_refresh(flow, stale).await?)
    }

    fn url_for(&self, path: &ResourcePath) -> Result<Url, GatewayError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let url = Url::parse(&format!("{}/{}", base, path.as_str()))
            .map_err(|e| GatewayError::Validation(format!("invalid Graph path: {}", e)))?;
        let base_path = self.base_url.path().trim_end_matches('/');
        if url.host_str() != self.base_url.host_str()
            || url.port_or_known_default() != self.base_url.port_or_known_default()
            || !url.path().starts_with(base_path)
        {
            return Err(GatewayError::Validation(
                "command resolves outside the Graph API root".to_string(),
            ));
        }
        Ok(url)
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &Url,
        token: &CachedToken,
        payload: Option<&Value>,
    ) -> Result<RawResponse, GatewayError> {
        let attempts_allowed = if method.is_retry_safe() {
            self.max_retries + 1
        } else {
            1
        };
        let mut delay = self.retry_base_delay;

        for attempt in 1..=attempts_allowed {
            let mut req = self
                .http
                .request(method.to_reqwest(), url.clone())
                .bearer_auth(&token.access_token)
                .header(reqwest::header::ACCEPT, "application/json");
            if let Some(body) = payload {
                req = req.json(body);
            }

            let outcome = match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    resp.text().await.map(|text| RawResponse { status, text })
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(raw) => {
                    debug!(status = raw.status.as_u16(), attempt, "Graph responded");
                    return Ok(raw);
                }
                Err(e) if attempt < attempts_allowed => {
                    warn!(error = %e, attempt, "Graph request failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.mul_f64(1.6);
                }
                Err(e) => {
                    return Err(GatewayError::Transport {
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            }
        }

        Err(GatewayError::Internal(
            "request loop ended without a response".to_string(),
        ))
    }
}

fn interpret(raw: RawResponse) -> Result<CommandResult, GatewayError> {
    let status = raw.status.as_u16();
    let text = raw.text.trim();

    if raw.status.is_success() {
        let body = if raw.status == StatusCode::NO_CONTENT || text.is_empty() {
            json!({ "message": NO_CONTENT_MESSAGE })
        } else {
            match serde_json::from_str::<Value>(text) {
                Ok(v) => v,
                Err(_) => json!({ "message": NON_JSON_MESSAGE, "response_text": text }),
            }
        };
        return Ok(CommandResult { status, body });
    }

    let body = serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string()));
    let code = body
        .pointer("/error/code")
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = body
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|m| !m.is_empty())
        .or_else(|| (!text.is_empty() && !body.is_object()).then(|| text.to_string()))
        .unwrap_or_else(|| {
            raw.status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    Err(GatewayError::GraphApi {
        status,
        code,
        message,
        body,
    })
}
