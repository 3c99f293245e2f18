//! Application configuration loaded from environment variables.

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: Postgres connection string; sagas are kept in memory when unset
/// - `SAGA_DEFINITIONS`: path to a JSON array of saga definitions to load at startup
///
/// Orchestrator settings are read separately by `OrchestratorConfig::from_env`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub definitions_path: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            database_url: non_empty_var("DATABASE_URL"),
            definitions_path: non_empty_var("SAGA_DEFINITIONS"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Name of the saga store this configuration selects.
    pub fn store_backend(&self) -> &'static str {
        if self.database_url.is_some() {
            "postgres"
        } else {
            "memory"
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            definitions_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert!(config.database_url.is_none());
        assert!(config.definitions_path.is_none());
        assert_eq!(config.store_backend(), "memory");
    }

    #[test]
    fn test_database_url_selects_postgres() {
        let config = Config {
            database_url: Some("postgres://localhost/sagas".to_string()),
            ..Default::default()
        };
        assert_eq!(config.store_backend(), "postgres");
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
