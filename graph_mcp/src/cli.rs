use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "graph_mcp")]
#[command(about = "Microsoft Graph MCP server - one generic tool for the whole Graph v1.0 API")]
#[command(version)]
#[command(after_help = "\x1b[1;36mModes:\x1b[0m
  No client secret configured     Interactive device-code sign-in, read-only (GET)
  AZURE_CLIENT_SECRET set         Client credentials, all HTTP methods

\x1b[1;36mExamples:\x1b[0m
  graph_mcp                                   Serve MCP over stdio
  graph_mcp login                             Sign in and cache the token
  graph_mcp call me                           Run one GET and print the JSON
  graph_mcp call users --method POST --data '{\"displayName\":\"x\"}'")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Log level (TRACE, DEBUG, INFO, WARNING, ERROR); overrides LOG_LEVEL
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Token cache file; overrides GRAPH_TOKEN_CACHE
    #[arg(long, global = true, value_name = "PATH")]
    pub token_cache: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve MCP over stdio (default)
    Serve,

    /// Acquire the process-level token and store it in the cache
    Login,

    /// Dispatch a single Graph command and print the result
    Call {
        /// Graph path, e.g. `me` or `users?$top=5`
        command: String,

        /// HTTP method
        #[arg(short, long, default_value = "GET")]
        method: String,

        /// JSON request body for POST, PUT and PATCH
        #[arg(short, long)]
        data: Option<String>,

        /// Run this call with application permissions
        #[arg(long, env = "GRAPH_CALL_CLIENT_SECRET", hide_env_values = true)]
        client_secret: Option<String>,
    },
}
