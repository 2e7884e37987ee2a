use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::credential::{ClientSecret, CredentialContext};

/// Microsoft Graph PowerShell public client, used when no app registration is configured.
pub const GRAPH_POWERSHELL_CLIENT_ID: &str = "14d82eec-204b-4c2f-b7e8-296a70dab67e";
pub const DEFAULT_TENANT: &str = "common";
pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
pub const DEFAULT_DELEGATED_SCOPES: &[&str] = &["https://graph.microsoft.com/.default", "offline_access"];

const CLIENT_ID_VARS: &[&str] = &[
    "AZURE_CLIENT_ID",
    "USE_APP_REG_CLIENTID",
    "CUSTOM_CLIENT_ID",
    "GRAPH_CLIENT_ID",
];
const TENANT_ID_VARS: &[&str] = &[
    "AZURE_TENANT_ID",
    "TENANTID",
    "CUSTOM_TENANT_ID",
    "GRAPH_TENANT_ID",
];
const CLIENT_SECRET_VARS: &[&str] = &[
    "AZURE_CLIENT_SECRET",
    "CLIENT_SECRET",
    "CUSTOM_CLIENT_SECRET",
    "GRAPH_CLIENT_SECRET",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var} ({value:?}): {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::parse(s).ok_or_else(|| ConfigError::InvalidValue {
            var: "LOG_LEVEL",
            value: s.to_string(),
            reason: "expected one of TRACE, DEBUG, INFO, WARNING, ERROR, CRITICAL".to_string(),
        })
    }
}

/// Process-level settings, read once at start-up.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client_id: String,
    pub tenant_id: String,
    pub client_secret: Option<ClientSecret>,
    pub scopes: Vec<String>,
    pub log_level: LogLevel,
    pub request_timeout: Duration,
    pub device_flow_timeout: Duration,
    pub max_retries: u32,
    pub token_cache_path: PathBuf,
    pub graph_base_url: Url,
    pub authority_host: Url,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let first = |names: &[&str]| names.iter().find_map(|n| get(n));

        let client_id =
            first(CLIENT_ID_VARS).unwrap_or_else(|| GRAPH_POWERSHELL_CLIENT_ID.to_string());
        let tenant_id = first(TENANT_ID_VARS).unwrap_or_else(|| DEFAULT_TENANT.to_string());
        let client_secret = first(CLIENT_SECRET_VARS).map(ClientSecret::new);

        let scopes = match get("GRAPH_SCOPES") {
            Some(raw) => parse_scopes(&raw),
            None => DEFAULT_DELEGATED_SCOPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        };

        let log_level = match get("LOG_LEVEL") {
            Some(raw) => raw.parse()?,
            None => LogLevel::Info,
        };

        let request_timeout = seconds(get("GRAPH_REQUEST_TIMEOUT"), "GRAPH_REQUEST_TIMEOUT", 30)?;
        let device_flow_timeout = seconds(get("OPERATION_TIMEOUT"), "OPERATION_TIMEOUT", 300)?;

        let max_retries = match get("GRAPH_MAX_RETRIES") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n <= 10 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "GRAPH_MAX_RETRIES",
                        value: raw,
                        reason: "expected an integer between 0 and 10".to_string(),
                    })
                }
            },
            None => 2,
        };

        let token_cache_path = get("GRAPH_TOKEN_CACHE")
            .map(PathBuf::from)
            .unwrap_or_else(default_token_cache_path);

        let graph_base_url = parse_url(get("GRAPH_BASE_URL"), "GRAPH_BASE_URL", DEFAULT_GRAPH_BASE_URL)?;
        let authority_host = parse_url(
            get("AZURE_AUTHORITY_HOST"),
            "AZURE_AUTHORITY_HOST",
            DEFAULT_AUTHORITY_HOST,
        )?;

        Ok(Self {
            client_id,
            tenant_id,
            client_secret,
            scopes,
            log_level,
            request_timeout,
            device_flow_timeout,
            max_retries,
            token_cache_path,
            graph_base_url,
            authority_host,
        })
    }

    /// True when no client secret is configured, i.e. device code (delegated) mode.
    pub fn is_read_only_mode(&self) -> bool {
        self.client_secret.is_none()
    }

    pub fn credential_context(&self) -> CredentialContext {
        CredentialContext::new(
            self.tenant_id.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
        )
    }
}

fn parse_scopes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn seconds(raw: Option<String>, var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else {
        return Ok(Duration::from_secs(default));
    };
    match raw.parse::<u64>() {
        Ok(n) if (1..=3600).contains(&n) => Ok(Duration::from_secs(n)),
        _ => Err(ConfigError::InvalidValue {
            var,
            value: raw,
            reason: "expected a number of seconds between 1 and 3600".to_string(),
        }),
    }
}

fn parse_url(raw: Option<String>, var: &'static str, default: &str) -> Result<Url, ConfigError> {
    let value = raw.unwrap_or_else(|| default.to_string());
    let url = Url::parse(value.trim_end_matches('/')).map_err(|e| ConfigError::InvalidValue {
        var,
        value: value.clone(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidValue {
            var,
            value,
            reason: "expected an http(s) URL".to_string(),
        });
    }
    Ok(url)
}

/// `~/.config/graph_mcp/token_cache.json` (Unix) or `%APPDATA%/graph_mcp/token_cache.json` (Windows).
pub fn default_token_cache_path() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("graph_mcp").join("token_cache.json")
}
