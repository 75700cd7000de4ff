use anyhow::{Context, Result};
use std::net::SocketAddr;

pub const API_KEY_VAR: &str = "OPENROUTER_API_KEY";
const BASE_URL_VAR: &str = "OPENROUTER_BASE_URL";
const DATABASE_URL_VAR: &str = "DATABASE_URL";
const BIND_VAR: &str = "CONVOCHAT_BIND";

// OpenRouter speaks the OpenAI chat API under a different base URL
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://convochat.sqlite";
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub api_url: String,
    pub database_url: String,
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    /// The API key is required; everything else has a default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_key = lookup(API_KEY_VAR)
            .filter(|key| !key.trim().is_empty())
            .with_context(|| {
                format!(
                    "{} environment variable is not set. Please check your environment.",
                    API_KEY_VAR
                )
            })?;

        let api_url = lookup(BASE_URL_VAR).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let database_url =
            lookup(DATABASE_URL_VAR).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
        let bind = lookup(BIND_VAR).unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind_addr = bind
            .parse()
            .with_context(|| format!("Invalid {} address: {}", BIND_VAR, bind))?;

        log::debug!("Using completion API at {}", api_url);
        Ok(Self {
            api_key,
            api_url,
            database_url,
            bind_addr,
        })
    }
}
