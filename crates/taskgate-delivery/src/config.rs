use clap::Parser;
use std::path::PathBuf;

/// Delivery endpoint configuration.
#[derive(Parser, Clone)]
pub struct DeliveryConfig {
    /// Bind address for the HTTP server.
    #[arg(long, env = "DELIVERY_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,

    /// Path pattern for task deliveries; must have a `task_type` named group.
    #[arg(
        long,
        env = "TASK_ROUTE_PATTERN",
        default_value = r"^/_do_task/(?P<task_type>.+)$"
    )]
    pub task_route_pattern: String,

    /// Task type definitions (YAML).
    #[arg(long, env = "TASK_TYPES_PATH", default_value = "task_types.yaml")]
    pub task_types_path: PathBuf,

    /// Result code to HTTP status / log level overrides (YAML).
    #[arg(long, env = "RESULT_MAP_PATH")]
    pub result_map_path: Option<PathBuf>,

    /// Expected `iss` of push tokens.
    #[arg(long, env = "OIDC_TOKEN_ISSUER", default_value = "https://accounts.google.com")]
    pub oidc_token_issuer: String,

    #[arg(
        long,
        env = "OIDC_JWKS_URL",
        default_value = "https://www.googleapis.com/oauth2/v3/certs"
    )]
    pub oidc_jwks_url: String,

    /// How long fetched signing keys are trusted before refetching.
    #[arg(long, env = "OIDC_JWKS_CACHE_TTL_SECS", default_value_t = 3_600)]
    pub oidc_jwks_cache_ttl_secs: u64,

    /// Key id for locally minted HS256 push tokens (lite-only).
    #[arg(long, env = "DEV_TOKEN_KID", default_value = "dev")]
    pub dev_token_kid: String,

    /// When set, push tokens are verified as HS256 with this secret instead of against JWKS.
    #[arg(long, env = "DEV_TOKEN_SECRET")]
    pub dev_token_secret: Option<String>,

    /// Max wait for the per-request single-flight lock.
    #[arg(long, env = "TASK_MUTEX_TIMEOUT_MS", default_value_t = 1_000)]
    pub task_mutex_timeout_ms: u64,

    /// Postgres for advisory locks and transaction markers. In-process locks when unset.
    #[arg(long, env = "STATE_DATABASE_URL")]
    pub state_database_url: Option<String>,

    /// Hold tasks carrying a transaction marker until the marker is committed.
    #[arg(long, env = "TRANSACTION_MARKERS_ENABLED", default_value_t = false)]
    pub transaction_markers_enabled: bool,

    /// External scheme and authority (e.g. `https://app.example.com`) used to rebuild the URL the
    /// queue called. Taken from `Host` / `X-Forwarded-Proto` when unset.
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: Option<String>,
}

impl std::fmt::Debug for DeliveryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dev_token_secret = self.dev_token_secret.as_deref().map(|_| "<redacted>");
        let state_database_url = self.state_database_url.as_deref().map(|_| "<redacted>");
        f.debug_struct("DeliveryConfig")
            .field("bind", &self.bind)
            .field("task_route_pattern", &self.task_route_pattern)
            .field("task_types_path", &self.task_types_path)
            .field("result_map_path", &self.result_map_path)
            .field("oidc_token_issuer", &self.oidc_token_issuer)
            .field("oidc_jwks_url", &self.oidc_jwks_url)
            .field("oidc_jwks_cache_ttl_secs", &self.oidc_jwks_cache_ttl_secs)
            .field("dev_token_kid", &self.dev_token_kid)
            .field("dev_token_secret", &dev_token_secret)
            .field("task_mutex_timeout_ms", &self.task_mutex_timeout_ms)
            .field("state_database_url", &state_database_url)
            .field(
                "transaction_markers_enabled",
                &self.transaction_markers_enabled,
            )
            .field("public_base_url", &self.public_base_url)
            .finish()
    }
}
