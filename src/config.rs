use std::env;

use tracing::warn;

/// Runtime configuration, read once from the environment at startup.
///
/// Flags that weaken authentication (`hawk_disabled`, `auth_disabled`) exist
/// for test rigs only and default to off.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: String,
    pub jwt_secret: String,
    /// Skip device signature verification entirely. TEST ONLY.
    pub hawk_disabled: bool,
    /// Skip identity-assertion verification at registration. TEST ONLY.
    pub auth_disabled: bool,
    /// Upper bound for lock codes (inclusive).
    pub lock_max: i64,
    /// Upper bound for ring/track durations (inclusive).
    pub track_max: i64,
    /// Whether a device-sent `q` (unregister) is honored.
    pub allow_quit: bool,
    /// Identity assertion verifier endpoint, when assertion auth is live.
    pub assertion_verifier: Option<String>,
    pub version: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("LODESTONE_BIND").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            db_path: env::var("LODESTONE_DB").unwrap_or_else(|_| "lodestone-db".into()),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_else(|_| {
                warn!("JWT_SECRET not set, using development default");
                "supersecret123".into()
            }),
            hawk_disabled: env_flag("HAWK_DISABLED"),
            auth_disabled: env_flag("AUTH_DISABLED"),
            lock_max: env_i64("CMD_LOCK_MAX", 9999),
            track_max: env_i64("CMD_TRACK_MAX", 10500),
            allow_quit: env_flag("CMD_ALLOW_QUIT"),
            assertion_verifier: env::var("ASSERTION_VERIFIER_URL").ok(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Default for Config {
    /// Baseline used by tests; production goes through `from_env`.
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".into(),
            db_path: "lodestone-db".into(),
            jwt_secret: "test-secret".into(),
            hawk_disabled: false,
            auth_disabled: false,
            lock_max: 9999,
            track_max: 10500,
            allow_quit: false,
            assertion_verifier: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn env_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = raw.as_str(), "unparsable numeric config value");
            default
        }),
        Err(_) => default,
    }
}
