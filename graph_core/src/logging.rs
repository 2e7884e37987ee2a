use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::credential::{DevicePromptSink, LogPromptSink};
use crate::oauth::DeviceAuthStart;

pub const LOGGER_NAME: &str = "graph-mcp";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Params of an MCP `notifications/message`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogMessage {
    pub level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

impl LogMessage {
    pub fn new(level: LogLevel, data: Value) -> Self {
        Self {
            level,
            logger: Some(LOGGER_NAME.to_string()),
            data,
        }
    }

    pub fn into_notification(self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "method": "notifications/message",
            "params": self,
        })
    }
}

/// Sends the device sign-in prompt to the MCP client as a log notification,
/// in addition to writing it to stderr.
pub struct NotifyingPromptSink {
    outbound: UnboundedSender<Value>,
}

impl NotifyingPromptSink {
    pub fn new(outbound: UnboundedSender<Value>) -> Self {
        Self { outbound }
    }
}

impl DevicePromptSink for NotifyingPromptSink {
    fn device_code_issued(&self, prompt: &DeviceAuthStart) {
        LogPromptSink.device_code_issued(prompt);

        let text = prompt.message.clone().unwrap_or_else(|| {
            format!(
                "To sign in, open {} and enter the code {}",
                prompt.verification_uri, prompt.user_code
            )
        });
        let message = LogMessage::new(
            LogLevel::Warning,
            json!({
                "event": "device_code",
                "message": text,
                "verification_uri": prompt.verification_uri,
                "user_code": prompt.user_code,
                "expires_in": prompt.expires_in,
            }),
        );
        if self.outbound.send(message.into_notification()).is_err() {
            warn!("Transport closed, device prompt only written to the log");
        }
    }
}
