use std::sync::Arc;

use rmcp::model::{JsonObject, Tool};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::credential::ClientSecret;
use crate::dispatcher::CommandRequest;
use crate::error::GatewayError;

pub const GRAPH_COMMAND: &str = "graph_command";

fn input_schema() -> JsonObject {
    let schema = json!({
        "type": "object",
        "properties": {
            "command": {
                "type": "string",
                "description": "Graph path below /v1.0, e.g. 'me', 'users', 'groups?$top=10'"
            },
            "method": {
                "type": "string",
                "enum": ["GET", "POST", "PUT", "PATCH", "DELETE"],
                "default": "GET",
                "description": "HTTP method"
            },
            "data": {
                "type": "object",
                "description": "JSON request body for POST, PUT and PATCH"
            },
            "client_secret": {
                "type": "string",
                "description": "Optional client secret; runs this call with application permissions"
            }
        },
        "required": ["command"]
    });
    match schema {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

pub fn graph_command_tool(read_only: bool) -> Tool {
    let description = if read_only {
        "Execute a Microsoft Graph API command. Interactive sign-in mode: GET only, \
         unless client_secret is supplied with the call."
    } else {
        "Execute a Microsoft Graph API command (GET, POST, PUT, PATCH, DELETE) with \
         application permissions."
    };
    Tool {
        name: GRAPH_COMMAND.into(),
        title: Some("Microsoft Graph command".to_string()),
        description: Some(description.into()),
        input_schema: Arc::new(input_schema()),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

/// Arguments of `graph_command`.
#[derive(Debug, Deserialize)]
pub struct GraphCommandArgs {
    pub command: String,
    /// Absent, null or blank means GET.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl GraphCommandArgs {
    pub fn from_arguments(arguments: Option<JsonObject>) -> Result<Self, GatewayError> {
        let args = Value::Object(arguments.unwrap_or_default());
        serde_json::from_value(args)
            .map_err(|e| GatewayError::Validation(format!("invalid graph_command arguments: {}", e)))
    }

    pub fn method(&self) -> &str {
        self.method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("GET")
    }

    pub fn into_request(self) -> CommandRequest {
        let method = self.method().to_string();
        let mut request = CommandRequest::new(self.command, method);
        if let Some(data) = self.data.filter(|d| !d.is_null()) {
            request = request.with_payload(data);
        }
        if let Some(secret) = self.client_secret.filter(|s| !s.trim().is_empty()) {
            request = request.with_client_secret(ClientSecret::new(secret));
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: Value) -> Option<JsonObject> {
        v.as_object().cloned()
    }

    #[test]
    fn test_method_defaults_to_get() {
        let parsed = GraphCommandArgs::from_arguments(args(json!({"command": "me"}))).unwrap();
        assert_eq!(parsed.method(), "GET");
        let request = parsed.into_request();
        assert!(request.payload.is_none());
        assert!(request.override_client_secret.is_none());
    }

    #[test]
    fn test_null_or_blank_method_means_get() {
        for raw in [json!(null), json!(""), json!("  ")] {
            let parsed =
                GraphCommandArgs::from_arguments(args(json!({"command": "me", "method": raw})))
                    .unwrap();
            assert_eq!(parsed.into_request().http_method, "GET");
        }
        let parsed =
            GraphCommandArgs::from_arguments(args(json!({"command": "me", "method": "patch"})))
                .unwrap();
        assert_eq!(parsed.into_request().http_method, "patch");
    }

    #[test]
    fn test_blank_secret_is_not_an_override() {
        let parsed = GraphCommandArgs::from_arguments(args(json!({
            "command": "users", "method": "POST", "data": {"displayName": "x"}, "client_secret": ""
        })))
        .unwrap();
        let request = parsed.into_request();
        assert!(request.override_client_secret.is_none());
        assert_eq!(request.payload.unwrap()["displayName"], "x");
    }

    #[test]
    fn test_missing_command_is_validation_error() {
        assert!(matches!(
            GraphCommandArgs::from_arguments(args(json!({"method": "GET"}))),
            Err(GatewayError::Validation(_))
        ));
        assert!(matches!(
            GraphCommandArgs::from_arguments(args(json!({"command": 42}))),
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_schema_requires_command() {
        let tool = graph_command_tool(true);
        assert_eq!(tool.input_schema["required"], json!(["command"]));
    }
}
