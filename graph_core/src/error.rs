// src/error.rs
use serde_json::{json, Value};

/// Failures while acquiring or refreshing an access token.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("Credential identity is missing or malformed: {0}")]
    IdentityMalformed(String),

    #[error("Client secret rejected by the identity provider: {0}")]
    SecretRejected(String),

    #[error("Device code sign-in was not completed within {0} seconds")]
    InteractiveTimeout(u64),

    #[error("Device code sign-in was declined: {0}")]
    InteractiveDenied(String),

    #[error("Insufficient permission context: {0}")]
    InsufficientPermission(String),

    #[error("Token endpoint error: {0}")]
    TokenEndpoint(String),
}

impl AuthError {
    pub fn code_str(&self) -> &'static str {
        match self {
            AuthError::IdentityMalformed(_) => "identity_malformed",
            AuthError::SecretRejected(_) => "secret_rejected",
            AuthError::InteractiveTimeout(_) => "interactive_timeout",
            AuthError::InteractiveDenied(_) => "interactive_denied",
            AuthError::InsufficientPermission(_) => "insufficient_permission",
            AuthError::TokenEndpoint(_) => "token_endpoint",
        }
    }

    fn instructions(&self) -> &'static str {
        match self {
            AuthError::IdentityMalformed(_) => {
                "Check AZURE_TENANT_ID and AZURE_CLIENT_ID. The tenant must be a directory GUID, \
                 a verified domain, or 'common'/'organizations' for interactive sign-in; the \
                 application (client) flow requires a concrete tenant."
            }
            AuthError::SecretRejected(_) => {
                "The client secret was not accepted. Use the secret VALUE from Azure Portal \
                 (Certificates & secrets), not the secret ID, and make sure it has not expired."
            }
            AuthError::InteractiveTimeout(_) => {
                "The device code sign-in was not completed in time. Retry the request and finish \
                 the browser sign-in when the verification code is shown."
            }
            AuthError::InteractiveDenied(_) => {
                "Sign-in was declined in the browser. Retry the request to start a new device code."
            }
            AuthError::InsufficientPermission(_) => {
                "Interactive (device code) mode is read-only. Configure AZURE_CLIENT_SECRET or pass \
                 client_secret with the call to use application permissions."
            }
            AuthError::TokenEndpoint(_) => {
                "The identity provider could not be reached or returned an unexpected response. \
                 Retry shortly."
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Graph API returned HTTP {status}: {message}")]
    GraphApi {
        status: u16,
        code: Option<String>,
        message: String,
        body: Value,
    },

    #[error("Transport error after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Resource not found")]
    ResourceNotFound,

    #[error("Tool not found")]
    ToolNotFound,

    #[error("Method not found")]
    MethodNotFound,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn code_str(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) => "validation_error",
            GatewayError::Auth(_) => "auth_error",
            GatewayError::GraphApi { .. } => "graph_api_error",
            GatewayError::Transport { .. } => "transport_error",
            GatewayError::ResourceNotFound => "not_found",
            GatewayError::ToolNotFound => "tool_not_found",
            GatewayError::MethodNotFound => "method_not_found",
            GatewayError::SerdeJson(_) => "parse_error",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    pub fn to_jsonrpc_error(&self) -> Value {
        let (code, message) = match self {
            GatewayError::ResourceNotFound => (-32602, "Resource not found".to_string()),
            GatewayError::ToolNotFound => (-32602, "Tool not found".to_string()),
            GatewayError::MethodNotFound => (-32601, "Method not found".to_string()),
            GatewayError::SerdeJson(e) => (-32602, e.to_string()),
            GatewayError::Internal(msg) => (-32603, msg.to_string()),
            err => (-32603, err.to_string()),
        };

        json!({
            "code": code,
            "message": message,
        })
    }

    /// Structured body for an `isError` tool result.
    pub fn to_tool_payload(&self) -> Value {
        let mut error = json!({
            "kind": self.code_str(),
            "message": self.to_string(),
        });
        match self {
            GatewayError::Auth(auth) => {
                error["auth_required"] = json!(true);
                error["reason"] = json!(auth.code_str());
                error["instructions"] = json!(auth.instructions());
            }
            GatewayError::GraphApi {
                status, code, body, ..
            } => {
                error["status_code"] = json!(status);
                if let Some(code) = code {
                    error["code"] = json!(code);
                }
                error["error_details"] = body.clone();
            }
            GatewayError::Transport { attempts, .. } => {
                error["attempts"] = json!(attempts);
            }
            _ => {}
        }
        json!({
            "success": false,
            "error": error,
        })
    }
}
