use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::warn;

/// Placeholder JWT secret shipped as the default.
const PLACEHOLDER_SECRET: &str = "change-me-in-production";

/// Server configuration, read once from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    /// Empty means permissive CORS.
    pub cors_origins: Vec<String>,
    pub ai_endpoint: String,
    /// Empty selects the mock translator.
    pub ai_token: String,
    pub translation_model: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let port = var("MEDIBRIDGE_PORT", "8000");
        let port: u16 = port
            .parse()
            .with_context(|| format!("MEDIBRIDGE_PORT is not a port number: '{}'", port))?;

        let jwt_secret = var("MEDIBRIDGE_JWT_SECRET", PLACEHOLDER_SECRET);
        if jwt_secret == PLACEHOLDER_SECRET {
            warn!("MEDIBRIDGE_JWT_SECRET is unset, using the development placeholder");
        }

        Ok(Self {
            host: var("MEDIBRIDGE_HOST", "0.0.0.0"),
            port,
            db_path: var("MEDIBRIDGE_DB_PATH", "medibridge.db").into(),
            jwt_secret,
            cors_origins: parse_origins(&var(
                "MEDIBRIDGE_CORS_ORIGINS",
                "http://localhost:5173,http://localhost:8080",
            )),
            ai_endpoint: var("MEDIBRIDGE_AI_ENDPOINT", "https://models.inference.ai.azure.com"),
            ai_token: var("MEDIBRIDGE_AI_TOKEN", ""),
            translation_model: var("MEDIBRIDGE_TRANSLATION_MODEL", "gpt-4o"),
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    if raw.trim() == "*" {
        return Vec::new();
    }
    raw.split(',')
        .map(|o| o.trim().trim_end_matches('/'))
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}
