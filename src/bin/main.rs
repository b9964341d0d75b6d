use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcp_obo_server::auth::{DEFAULT_CACHE_TTL_SECONDS, DEFAULT_REQUIRED_SCOPE, ValidatorConfig};
use mcp_obo_server::config::{
    DEFAULT_BACKEND_SCOPES, DEFAULT_BACKEND_URL, DEFAULT_BIND, DEFAULT_REQUEST_TIMEOUT_SECONDS,
    DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS, tenant_issuer,
};
use mcp_obo_server::delegation::{DEFAULT_AUTHORITY_HOST, DEFAULT_EXCHANGE_TIMEOUT_SECONDS};
use mcp_obo_server::types::{Issuer, ScopeSet};
use mcp_obo_server::{ServerConfig, start_mcp_http};

const DEFAULT_LOG_FILTER: &str = "mcp_obo_server=info,rmcp=warn";

#[derive(Parser)]
#[command(name = "mcp-obo-server")]
#[command(about = "MCP server with Entra ID token validation and on-behalf-of delegation")]
struct Cli {
    /// Bind address, e.g. 0.0.0.0:3000
    #[arg(long, env = "MCP_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Keep MCP sessions and track identity per connection
    #[arg(long, default_value_t = false)]
    stateful: bool,

    /// Close stateful sessions idle for this many seconds
    #[arg(long, default_value_t = DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS)]
    session_idle_timeout_secs: u64,

    /// Entra ID tenant (also the default trusted issuer)
    #[arg(long, env = "AZURE_TENANT_ID")]
    tenant_id: Option<String>,

    /// Application (client) id used for the on-behalf-of exchange
    #[arg(long, env = "AZURE_CLIENT_ID")]
    client_id: Option<String>,

    /// Client secret used for the on-behalf-of exchange
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Authority host for the token endpoint
    #[arg(long, env = "AZURE_AUTHORITY_HOST", default_value = DEFAULT_AUTHORITY_HOST)]
    authority_host: String,

    /// Trusted token issuers, comma separated
    #[arg(long = "issuer", env = "TOKEN_ISSUER", value_delimiter = ',')]
    issuers: Vec<String>,

    /// Expected token audience
    #[arg(long, env = "TOKEN_AUDIENCE")]
    audience: Option<String>,

    /// Scope every inbound token must carry
    #[arg(long, env = "REQUIRED_SCOPE", default_value = DEFAULT_REQUIRED_SCOPE)]
    required_scope: String,

    /// Clock skew tolerance for exp/nbf, in seconds
    #[arg(long, default_value_t = 0)]
    leeway_secs: i64,

    /// How long fetched signing keys are trusted, in seconds
    #[arg(long, default_value_t = DEFAULT_CACHE_TTL_SECONDS)]
    jwks_ttl_secs: u64,

    /// Backend API base URL
    #[arg(long, env = "BACKEND_API_URL", default_value = DEFAULT_BACKEND_URL)]
    backend_url: String,

    /// Scopes requested for the backend API, space separated
    #[arg(long, env = "BACKEND_API_SCOPES", default_value = DEFAULT_BACKEND_SCOPES)]
    backend_scopes: String,

    /// Timeout for one on-behalf-of exchange, in seconds
    #[arg(long, default_value_t = DEFAULT_EXCHANGE_TIMEOUT_SECONDS)]
    exchange_timeout_secs: u64,

    /// Cache delegated tokens until this many seconds before expiry
    #[arg(long)]
    delegation_cache_margin_secs: Option<u64>,

    /// Overall HTTP request timeout, in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_SECONDS)]
    request_timeout_secs: u64,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        let mut issuers: Vec<Issuer> = self
            .issuers
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(Issuer::new)
            .collect();
        if issuers.is_empty()
            && let Some(tenant) = self.tenant_id.as_deref().filter(|t| !t.is_empty())
        {
            issuers.push(tenant_issuer(tenant));
        }

        let required_scope = Some(self.required_scope).filter(|s| !s.trim().is_empty());
        let mut validator = ValidatorConfig::new(issuers)
            .with_required_scope(required_scope)
            .with_leeway_seconds(self.leeway_secs);
        if let Some(audience) = self.audience.filter(|a| !a.is_empty()) {
            validator = validator.with_audience(audience);
        }

        let mut config = ServerConfig::new(validator);
        config.key_set.cache_ttl = Duration::from_secs(self.jwks_ttl_secs);
        config.delegation =
            ServerConfig::delegation_from_parts(self.tenant_id, self.client_id, self.client_secret)?
                .map(|d| {
                    d.with_authority_host(self.authority_host)
                        .with_timeout(Duration::from_secs(self.exchange_timeout_secs))
                });
        config.delegation_cache_margin = self.delegation_cache_margin_secs.map(Duration::from_secs);
        config.backend_url = self.backend_url;
        config.backend_scopes = ScopeSet::from_delimited(&self.backend_scopes);
        config.bind = self.bind;
        config.stateful = self.stateful;
        config.session_idle_timeout = Duration::from_secs(self.session_idle_timeout_secs);
        config.request_timeout = Duration::from_secs(self.request_timeout_secs);

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();

    // RUST_LOG replaces the default filter entirely.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Cli::parse().into_config()?;
    info!(
        stateful = config.stateful,
        delegation = config.delegation.is_some(),
        "Starting MCP server"
    );

    start_mcp_http(config).await
}
