use std::process;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use graph_core::{
    config::LogLevel,
    logging::NotifyingPromptSink,
    mcp_server::{JsonRpcHandler, McpServer},
    transport::StdioTransport,
    ClientSecret, CommandRequest, GatewayError, LogPromptSink, Settings,
};

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("graph_mcp: {}", e);
            process::exit(2);
        }
    };

    // stdout carries protocol frames, so logs go to stderr only.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_directive())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .init();

    let code = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&settings).await,
        Commands::Login => login(&settings).await,
        Commands::Call {
            command,
            method,
            data,
            client_secret,
        } => call(&settings, command, method, data, client_secret).await,
    };
    process::exit(code);
}

fn load_settings(cli: &Cli) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = Settings::from_env()?;
    if let Some(level) = cli.log_level.as_deref() {
        settings.log_level = level.parse::<LogLevel>()?;
    }
    if let Some(path) = cli.token_cache.clone() {
        settings.token_cache_path = path;
    }
    Ok(settings)
}

async fn serve(settings: &Settings) -> i32 {
    info!(
        read_only = settings.is_read_only_mode(),
        tenant = %settings.tenant_id,
        "Starting Microsoft Graph MCP server"
    );

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Value>();
    let prompt = Arc::new(NotifyingPromptSink::new(outbound_tx.clone()));
    let dispatcher = match graph_core::build_dispatcher(settings, prompt) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            error!("Failed to initialise the Graph dispatcher: {}", e);
            return 1;
        }
    };

    let server = McpServer::new(dispatcher);
    let handler = JsonRpcHandler::new(server);
    let transport = StdioTransport::with_channel(handler, outbound_tx, outbound_rx);

    info!("MCP Server ready, listening on stdio");

    tokio::select! {
        result = transport.run() => match result {
            Ok(()) => 0,
            Err(e) => {
                error!("Transport error: {}", e);
                1
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            0
        }
    }
}

async fn login(settings: &Settings) -> i32 {
    let dispatcher = match graph_core::build_dispatcher(settings, Arc::new(LogPromptSink)) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to initialise the Graph dispatcher: {}", e);
            return 1;
        }
    };
    let resolver = dispatcher.resolver();
    let flow = resolver.flow_for(None);
    match resolver.resolve_flow(&flow).await {
        Ok(token) => {
            print_json(&json!({
                "success": true,
                "flow": token.flow,
                "identity_key": token.identity_key,
                "expires_at": token.expires_at_rfc3339(),
                "scopes": token.scope_set,
                "token_cache": settings.token_cache_path.display().to_string(),
            }));
            0
        }
        Err(e) => {
            print_json(&GatewayError::from(e).to_tool_payload());
            1
        }
    }
}

async fn call(
    settings: &Settings,
    command: String,
    method: String,
    data: Option<String>,
    client_secret: Option<String>,
) -> i32 {
    let dispatcher = match graph_core::build_dispatcher(settings, Arc::new(LogPromptSink)) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to initialise the Graph dispatcher: {}", e);
            return 1;
        }
    };

    let mut request = CommandRequest::new(command, method);
    if let Some(raw) = data {
        match serde_json::from_str::<Value>(&raw) {
            Ok(body) => request = request.with_payload(body),
            Err(e) => {
                let err = GatewayError::Validation(format!("--data is not valid JSON: {}", e));
                print_json(&err.to_tool_payload());
                return 2;
            }
        }
    }
    if let Some(secret) = client_secret.filter(|s| !s.trim().is_empty()) {
        request = request.with_client_secret(ClientSecret::new(secret));
    }

    match dispatcher.execute(request).await {
        Ok(result) => {
            print_json(&json!({
                "success": true,
                "status_code": result.status,
                "data": result.body,
            }));
            0
        }
        Err(e) => {
            print_json(&e.to_tool_payload());
            1
        }
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => error!("Failed to render output: {}", e),
    }
}
