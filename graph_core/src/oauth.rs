use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::credential::ClientSecret;
use crate::error::AuthError;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Application permissions always use the static `.default` scope.
pub const APPLICATION_SCOPE: &str = "https://graph.microsoft.com/.default";

// AADSTS codes that indicate the secret itself is wrong or expired.
const SECRET_REJECTED_CODES: &[&str] = &["AADSTS7000215", "AADSTS7000222", "AADSTS7000216"];
// AADSTS codes for unknown tenant or application.
const IDENTITY_CODES: &[&str] = &["AADSTS700016", "AADSTS90002", "AADSTS900023", "AADSTS90013"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthStart {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    pub interval: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
}

/// Outcome of one device-code poll.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Pending,
    SlowDown,
    Complete(OAuthTokens),
}

/// Client for the Entra ID v2.0 token and device-code endpoints.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    authority: Url,
}

impl OAuthClient {
    pub fn new(authority: Url, timeout: Duration) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("graph-mcp/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::TokenEndpoint(e.to_string()))?;
        Ok(Self { http, authority })
    }

    fn endpoint(&self, tenant_id: &str, leaf: &str) -> String {
        format!(
            "{}/{}/oauth2/v2.0/{}",
            self.authority.as_str().trim_end_matches('/'),
            if tenant_id.is_empty() {
                "common"
            } else {
                tenant_id
            },
            leaf
        )
    }

    pub async fn client_credentials(
        &self,
        tenant_id: &str,
        client_id: &str,
        secret: &ClientSecret,
    ) -> Result<OAuthTokens, AuthError> {
        let body = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", secret.expose()),
            ("scope", APPLICATION_SCOPE),
        ];
        let (status, v) = self.post_form(&self.endpoint(tenant_id, "token"), &body).await?;
        if !status.is_success() {
            return Err(classify_token_error(&v, "client credentials"));
        }
        parse_tokens(&v)
    }

    pub async fn device_authorize(
        &self,
        tenant_id: &str,
        client_id: &str,
        scopes: &str,
    ) -> Result<DeviceAuthStart, AuthError> {
        let body = [("client_id", client_id), ("scope", scopes)];
        let (status, v) = self
            .post_form(&self.endpoint(tenant_id, "devicecode"), &body)
            .await?;
        if !status.is_success() {
            return Err(classify_token_error(&v, "device authorize"));
        }
        let device_code = v["device_code"].as_str().unwrap_or_default().to_string();
        if device_code.is_empty() {
            return Err(AuthError::TokenEndpoint(format!(
                "device authorize response missing device_code: {}",
                v
            )));
        }
        Ok(DeviceAuthStart {
            device_code,
            user_code: v["user_code"].as_str().unwrap_or_default().to_string(),
            verification_uri: v["verification_uri"]
                .as_str()
                .or_else(|| v["verification_url"].as_str())
                .unwrap_or_default()
                .to_string(),
            verification_uri_complete: v
                .get("verification_uri_complete")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string()),
            expires_in: as_i64(&v["expires_in"]).unwrap_or(900),
            interval: as_i64(&v["interval"]),
            message: v.get("message").and_then(|s| s.as_str()).map(|s| s.to_string()),
        })
    }

    pub async fn device_poll(
        &self,
        tenant_id: &str,
        client_id: &str,
        device_code: &str,
    ) -> Result<DevicePoll, AuthError> {
        let body = [
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", client_id),
            ("device_code", device_code),
        ];
        let (status, v) = self.post_form(&self.endpoint(tenant_id, "token"), &body).await?;
        if status.is_success() {
            return parse_tokens(&v).map(DevicePoll::Complete);
        }
        match v["error"].as_str().unwrap_or_default() {
            "authorization_pending" => Ok(DevicePoll::Pending),
            "slow_down" => Ok(DevicePoll::SlowDown),
            "authorization_declined" | "access_denied" => Err(AuthError::InteractiveDenied(
                description(&v).unwrap_or("user declined the sign-in").to_string(),
            )),
            "expired_token" | "code_expired" => Err(AuthError::InteractiveTimeout(0)),
            _ => Err(classify_token_error(&v, "device poll")),
        }
    }

    pub async fn refresh(
        &self,
        tenant_id: &str,
        client_id: &str,
        refresh_token: &str,
        scopes: &str,
    ) -> Result<OAuthTokens, AuthError> {
        let body = [
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("refresh_token", refresh_token),
            ("scope", scopes),
        ];
        let (status, v) = self.post_form(&self.endpoint(tenant_id, "token"), &body).await?;
        if !status.is_success() {
            return Err(classify_token_error(&v, "refresh"));
        }
        parse_tokens(&v)
    }

    async fn post_form(
        &self,
        url: &str,
        body: &[(&str, &str)],
    ) -> Result<(reqwest::StatusCode, Value), AuthError> {
        debug!(url, "POST token endpoint");
        let resp = self
            .http
            .post(url)
            .form(body)
            .send()
            .await
            .map_err(|e| AuthError::TokenEndpoint(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AuthError::TokenEndpoint(e.to_string()))?;
        let v = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok((status, v))
    }
}

fn as_i64(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn description(v: &Value) -> Option<&str> {
    v.get("error_description").and_then(|s| s.as_str())
}

fn parse_tokens(v: &Value) -> Result<OAuthTokens, AuthError> {
    let access_token = v["access_token"].as_str().unwrap_or_default().to_string();
    if access_token.is_empty() {
        return Err(AuthError::TokenEndpoint(
            "token response missing access_token".to_string(),
        ));
    }
    Ok(OAuthTokens {
        access_token,
        refresh_token: v
            .get("refresh_token")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string()),
        expires_in: as_i64(&v["expires_in"]),
        scope: v
            .get("scope")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string()),
        token_type: v
            .get("token_type")
            .and_then(|s| s.as_str())
            .map(|s| s.to_string()),
    })
}

/// Maps an identity-provider error body onto the auth error taxonomy.
pub(crate) fn classify_token_error(v: &Value, stage: &str) -> AuthError {
    let error = v["error"].as_str().unwrap_or_default();
    let desc = description(v).unwrap_or_default();
    let mentions = |codes: &[&str]| {
        codes.iter().any(|c| desc.contains(c))
            || v["error_codes"]
                .as_array()
                .map(|arr| {
                    arr.iter().filter_map(|c| c.as_i64()).any(|n| {
                        codes
                            .iter()
                            .any(|c| c.trim_start_matches("AADSTS") == n.to_string())
                    })
                })
                .unwrap_or(false)
    };
    let detail = if desc.is_empty() {
        v.to_string()
    } else {
        desc.lines().next().unwrap_or(desc).to_string()
    };

    if mentions(SECRET_REJECTED_CODES) || desc.contains("Invalid client secret") {
        AuthError::SecretRejected(detail)
    } else if mentions(IDENTITY_CODES)
        || error == "invalid_tenant"
        || error == "unauthorized_client"
    {
        AuthError::IdentityMalformed(detail)
    } else if error == "invalid_client" {
        AuthError::SecretRejected(detail)
    } else {
        AuthError::TokenEndpoint(format!("{} failed: {}", stage, detail))
    }
}
