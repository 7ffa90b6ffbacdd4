use std::env;
use std::time::Duration;

fn get_env(key: &str, default: &str) -> String {
    match env::var_os(key) {
        Some(val) => val.into_string().unwrap_or_else(|_| default.to_owned()),
        None => String::from(default),
    }
}

fn get_env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process configuration, read once from the environment at startup. Every
/// field here corresponds to a line in spec.md §6's "Configuration (process
/// env)" list; this crate never re-reads the environment after `Config::load`.
pub struct Config {
    pub database_url: String,
    pub jwt_secret: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub cors_origins: Vec<String>,
    pub log_stack_traces: bool,
    pub kick_grace: Duration,
    pub heartbeat_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub self_url: String,
    pub frontend_url: String,
    pub listening_url: String,
}

impl Config {
    pub fn load() -> Self {
        Self {
            database_url: get_env(
                "DATABASE_URL",
                &format!(
                    "postgres://{}:{}@{}/{}",
                    get_env("POSTGRES_USER", "tablehost"),
                    get_env("POSTGRES_PASSWORD", "tablehost"),
                    get_env("POSTGRES_HOST", "localhost"),
                    get_env("POSTGRES_DB", "tablehost_api"),
                ),
            ),
            jwt_secret: get_env("JWT_SECRET", "secret"),
            oauth_client_id: get_env("OAUTH_CLIENT_ID", ""),
            oauth_client_secret: get_env("OAUTH_CLIENT_SECRET", ""),
            cors_origins: get_env("CORS_ORIGINS", "*")
                .split(',')
                .map(str::to_owned)
                .collect(),
            log_stack_traces: get_env("LOG_STACK_TRACES", "false") == "true",
            kick_grace: Duration::from_secs(get_env_u64("KICK_PLAYER_AFTER_SECONDS", 30)),
            heartbeat_timeout: Duration::from_secs(get_env_u64("HEARTBEAT_TIMEOUT_SECONDS", 30)),
            disconnect_timeout: Duration::from_secs(get_env_u64("DISCONNECT_TIMEOUT_SECONDS", 30)),
            self_url: get_env("SELF_URL", "http://localhost:8080"),
            frontend_url: get_env("FRONTEND_URL", "http://localhost:3000"),
            listening_url: get_env("LISTENING_URL", "127.0.0.1:8080"),
        }
    }
}
