use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_host: String,
    /// Port number or service name, resolved at bind time.
    pub listen_service: String,
    pub max_auth_attempts: u32,
    pub drain_timeout_ms: u64,
    pub server_version: String,
    /// user -> cleartext password, used for the MD5 exchange.
    pub users: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut users = HashMap::new();
        users.insert("postgres".to_string(), "postgres".to_string());
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_service: "5432".to_string(),
            max_auth_attempts: 3,
            drain_timeout_ms: 5000,
            server_version: "15.0".to_string(),
            users,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Try to load from config file, otherwise use defaults
        let mut config = match fs::read_to_string("pgfe_config.json") {
            Ok(content) => {
                let config: Config = serde_json::from_str(&content)?;
                config
            }
            Err(_) => {
                // Use default config
                let config = Config::default();
                // Save default config for reference
                let _ = fs::write(
                    "pgfe_config.json.example",
                    serde_json::to_string_pretty(&config)?,
                );
                config
            }
        };

        // Override with environment variables if present
        if let Ok(host) = std::env::var("PGFE_LISTEN_HOST") {
            config.listen_host = host;
        }

        if let Ok(service) = std::env::var("PGFE_LISTEN_SERVICE") {
            config.listen_service = service;
        }

        if let Ok(attempts) = std::env::var("PGFE_MAX_AUTH_ATTEMPTS") {
            if let Ok(n) = attempts.parse::<u32>() {
                config.max_auth_attempts = n;
            }
        }

        if let Ok(ms) = std::env::var("PGFE_DRAIN_TIMEOUT_MS") {
            if let Ok(n) = ms.parse::<u64>() {
                config.drain_timeout_ms = n;
            }
        }

        Ok(config)
    }
}
