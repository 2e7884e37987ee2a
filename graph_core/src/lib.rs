// src/lib.rs
pub mod config;
pub mod credential;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod mcp_server;
pub mod oauth;
pub mod resources;
pub mod token_cache;
pub mod token_store;
pub mod tools;
pub mod transport;
pub mod utils;

use std::sync::Arc;

// Re-export types from rmcp that users of this library need
pub use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, InitializeRequestParam,
    InitializeResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
    ProtocolVersion, RawResource, ReadResourceRequestParam, Resource, ResourceContents,
    ServerCapabilities, Tool,
};

pub use crate::config::{ConfigError, Settings};
pub use crate::credential::{
    AuthFlow, ClientSecret, CredentialContext, CredentialResolver, DevicePromptSink, FlowKind,
    IdentityKey, LogPromptSink,
};
pub use crate::dispatcher::{CommandRequest, CommandResult, Dispatcher, HttpMethod, ResourcePath};
pub use crate::error::{AuthError, GatewayError};
pub use crate::mcp_server::{JsonRpcHandler, McpServer};
pub use crate::token_cache::{CachedToken, TokenCache, TokenSource};
pub use crate::token_store::{FileTokenStore, MemoryTokenStore, TokenStore};
pub use crate::transport::StdioTransport;

/// Wires settings into a ready dispatcher: file-backed token cache, resolver
/// with the given device prompt sink, and the Graph HTTP client.
pub fn build_dispatcher(
    settings: &Settings,
    prompt: Arc<dyn DevicePromptSink>,
) -> Result<Dispatcher, GatewayError> {
    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(settings.token_cache_path.clone()));
    build_dispatcher_with_store(settings, store, prompt)
}

pub fn build_dispatcher_with_store(
    settings: &Settings,
    store: Arc<dyn TokenStore>,
    prompt: Arc<dyn DevicePromptSink>,
) -> Result<Dispatcher, GatewayError> {
    let cache = Arc::new(TokenCache::new(store));
    let resolver = CredentialResolver::from_settings(settings, cache)?.with_prompt_sink(prompt);
    Dispatcher::from_settings(settings, Arc::new(resolver))
}
