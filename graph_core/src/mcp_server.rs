use std::sync::Arc;

use rmcp::model::*;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::{
    dispatcher::Dispatcher,
    error::GatewayError,
    resources,
    tools::{self, GraphCommandArgs},
    utils::{error_result, structured_result_with_text},
};

const INTERACTIVE_INSTRUCTIONS: &str = "Microsoft Graph gateway in interactive (device code) mode. \
Calls run with delegated, read-only permissions: only GET is allowed unless a client_secret is \
passed with the call. The first call may ask the user to complete a browser sign-in. \
Read graph://help for examples.";

const APPLICATION_INSTRUCTIONS: &str = "Microsoft Graph gateway in application (client \
credentials) mode. GET, POST, PUT, PATCH and DELETE are allowed, subject to the application \
permissions granted in Entra ID. Read graph://help for examples.";

/// MCP adapter over the Graph dispatcher.
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    read_only: bool,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        let read_only = dispatcher.resolver().context().default_flow()
            == crate::credential::FlowKind::DeviceCode;
        Self {
            dispatcher,
            read_only,
        }
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(Default::default()),
            resources: Some(Default::default()),
            logging: Some(Default::default()),
            ..Default::default()
        }
    }

    pub async fn handle_initialize(
        &self,
        request: InitializeRequestParam,
    ) -> Result<InitializeResult, GatewayError> {
        info!(
            client = %request.client_info.name,
            read_only = self.read_only,
            "MCP session initializing"
        );

        Ok(InitializeResult {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: self.capabilities(),
            server_info: Implementation {
                name: "graph-mcp".to_string(),
                title: Some("Microsoft Graph MCP".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                if self.read_only {
                    INTERACTIVE_INSTRUCTIONS
                } else {
                    APPLICATION_INSTRUCTIONS
                }
                .to_string(),
            ),
        })
    }

    pub async fn handle_list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
    ) -> Result<ListToolsResult, GatewayError> {
        Ok(ListToolsResult {
            tools: vec![tools::graph_command_tool(self.read_only)],
            next_cursor: None,
        })
    }

    /// Runs `graph_command`. Failures of the command itself come back as an
    /// `isError` result; only an unknown tool name is a protocol error.
    pub async fn handle_call_tool(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, GatewayError> {
        if request.name != tools::GRAPH_COMMAND {
            return Err(GatewayError::ToolNotFound);
        }

        let args = match GraphCommandArgs::from_arguments(request.arguments) {
            Ok(args) => args,
            Err(e) => return Ok(error_result(&e)),
        };
        let method = args.method().to_ascii_uppercase();
        let command = args.command.clone();

        match self.dispatcher.execute(args.into_request()).await {
            Ok(result) => {
                info!(%method, %command, status = result.status, "Graph command succeeded");
                let payload = json!({
                    "success": true,
                    "status_code": result.status,
                    "data": result.body,
                });
                let text = format!(
                    "{} {} -> HTTP {}\n{}",
                    method,
                    command,
                    result.status,
                    serde_json::to_string_pretty(&result.body)?
                );
                structured_result_with_text(&payload, Some(text))
            }
            Err(e) => {
                warn!(%method, %command, kind = e.code_str(), error = %e, "Graph command failed");
                Ok(error_result(&e))
            }
        }
    }

    pub async fn handle_list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
    ) -> Result<ListResourcesResult, GatewayError> {
        Ok(ListResourcesResult {
            resources: resources::list(),
            next_cursor: None,
        })
    }

    pub async fn handle_read_resource(
        &self,
        request: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult, GatewayError> {
        Ok(ReadResourceResult {
            contents: resources::read(&request.uri)?,
        })
    }
}

/// JSON-RPC message handler for the MCP server
pub struct JsonRpcHandler {
    server: McpServer,
}

impl JsonRpcHandler {
    pub fn new(server: McpServer) -> Self {
        Self { server }
    }

    /// Process one JSON-RPC message. Notifications (no `id`) never get a response.
    pub async fn handle_request(&self, request: Value) -> Option<Value> {
        debug!("Handling JSON-RPC message: {}", request);

        let id = request.get("id").cloned().filter(|id| !id.is_null());
        let method = request
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or("")
            .to_string();
        let params = request.get("params").cloned().unwrap_or(json!({}));

        let Some(id) = id else {
            match method.as_str() {
                "notifications/initialized" => info!("MCP client initialized"),
                "notifications/cancelled" => debug!("Client cancelled a request"),
                other => debug!(method = other, "Ignoring notification"),
            }
            return None;
        };

        let result: Result<Value, Value> = match method.as_str() {
            "initialize" => match serde_json::from_value::<InitializeRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_initialize(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(GatewayError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(GatewayError::SerdeJson(e).to_jsonrpc_error()),
            },
            "ping" => Ok(json!({})),
            "tools/list" => match serde_json::from_value::<Option<PaginatedRequestParam>>(params) {
                Ok(req) => self
                    .server
                    .handle_list_tools(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(GatewayError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(GatewayError::SerdeJson(e).to_jsonrpc_error()),
            },
            "tools/call" => match serde_json::from_value::<CallToolRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_call_tool(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(GatewayError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(GatewayError::SerdeJson(e).to_jsonrpc_error()),
            },
            "resources/list" => {
                match serde_json::from_value::<Option<PaginatedRequestParam>>(params) {
                    Ok(req) => self
                        .server
                        .handle_list_resources(req)
                        .await
                        .and_then(|r| serde_json::to_value(r).map_err(GatewayError::SerdeJson))
                        .map_err(|e| e.to_jsonrpc_error()),
                    Err(e) => Err(GatewayError::SerdeJson(e).to_jsonrpc_error()),
                }
            }
            "resources/read" => match serde_json::from_value::<ReadResourceRequestParam>(params) {
                Ok(req) => self
                    .server
                    .handle_read_resource(req)
                    .await
                    .and_then(|r| serde_json::to_value(r).map_err(GatewayError::SerdeJson))
                    .map_err(|e| e.to_jsonrpc_error()),
                Err(e) => Err(GatewayError::SerdeJson(e).to_jsonrpc_error()),
            },
            "logging/setLevel" => Ok(json!({})),
            _ => {
                error!(method = %method, "Unknown JSON-RPC method");
                Err(GatewayError::MethodNotFound.to_jsonrpc_error())
            }
        };

        Some(match result {
            Ok(result) => json!({
                "jsonrpc": "2.0",
                "result": result,
                "id": id,
            }),
            Err(error) => json!({
                "jsonrpc": "2.0",
                "error": error,
                "id": id,
            }),
        })
    }
}
