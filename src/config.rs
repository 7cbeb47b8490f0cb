use std::time::Duration;

/// Process configuration, read from `LESSONBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            db_acquire_timeout: Duration::from_secs(5),
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("LESSONBOOK_DATABASE_URL").filter(|s| !s.is_empty()),
            db_max_connections: lookup("LESSONBOOK_DB_MAX_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.db_max_connections),
            db_acquire_timeout: lookup("LESSONBOOK_DB_ACQUIRE_TIMEOUT_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.db_acquire_timeout),
            metrics_port: lookup("LESSONBOOK_METRICS_PORT").and_then(|s| s.parse().ok()),
        }
    }
}
