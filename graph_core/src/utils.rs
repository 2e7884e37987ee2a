use rmcp::model::{CallToolResult, Content};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::GatewayError;

/// Wraps `data` as structured tool output. Non-object values land under `data`.
pub fn structured_result_with_text<T: Serialize>(
    data: &T,
    text: Option<String>,
) -> Result<CallToolResult, GatewayError> {
    let value = serde_json::to_value(data)?;

    let map: JsonMap<String, JsonValue> = match value {
        JsonValue::Object(m) => m,
        other => {
            let mut m = JsonMap::new();
            m.insert("data".to_string(), other);
            m
        }
    };

    Ok(CallToolResult {
        content: text.map(Content::text).into_iter().collect(),
        structured_content: Some(JsonValue::Object(map)),
        is_error: Some(false),
        meta: None,
    })
}

/// Tool-level failure: `isError` set, the error payload as structured content.
pub fn error_result(err: &GatewayError) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(err.to_string())],
        structured_content: Some(err.to_tool_payload()),
        is_error: Some(true),
        meta: None,
    }
}
