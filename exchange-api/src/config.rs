//! Configuration for the API server

use std::env;

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8081),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::default()
    }
}
