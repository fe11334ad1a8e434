//! Configuration management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{self, Context, Result};

use crate::services::source::credentials::DEFAULT_TOKEN_URL;
use crate::services::source::graph::DEFAULT_GRAPH_BASE_URL;
use crate::types::LayoutRules;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    /// HS256 secret; requests are unauthenticated when unset
    pub jwt_secret: Option<String>,

    /// Microsoft Graph API root
    pub graph_base_url: String,
    pub graph_access_token: Option<String>,
    pub graph_client_id: Option<String>,
    pub graph_refresh_token: Option<String>,
    pub graph_token_url: String,

    /// Read workbooks from this directory instead of Graph
    pub local_source_dir: Option<PathBuf>,
    pub source_cache_ttl: Duration,
    /// How long reservation query answers are served from memory
    pub reservation_query_ttl: Duration,

    pub import_default_months: u32,
    pub import_sheet_concurrency: usize,
    pub reconcile_max_retries: u32,

    /// Building-name labels of the excluded / miscellaneous layouts
    pub layout_rules: LayoutRules,
    /// `guest` (default) or `color`
    pub continuity_predicate: String,

    /// Where the run history file lives
    pub logs_dir: PathBuf,

    /// Owner reports are only logged when unset
    pub resend_api_key: Option<String>,
    pub email_from_address: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").context("DATABASE_URL must be set")?;

        let jwt_secret = get("JWT_SECRET");
        if let Some(secret) = &jwt_secret {
            if secret.len() < 32 {
                anyhow::bail!(
                    "JWT_SECRET must be at least 32 bytes (current: {} bytes). Generate one with: openssl rand -base64 48",
                    secret.len()
                );
            }
        }

        let defaults = LayoutRules::default();
        let layout_rules = LayoutRules {
            excluded: get("EXCLUDED_BUILDINGS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.excluded),
            miscellaneous: get("MISC_BUILDINGS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.miscellaneous),
        };

        Ok(Self {
            nats_url: get("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string()),
            nats_user: get("NATS_USER"),
            nats_password: get("NATS_PASSWORD"),
            database_url,
            jwt_secret,
            graph_base_url: get("GRAPH_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.to_string()),
            graph_access_token: get("GRAPH_ACCESS_TOKEN"),
            graph_client_id: get("GRAPH_CLIENT_ID"),
            graph_refresh_token: get("GRAPH_REFRESH_TOKEN"),
            graph_token_url: get("GRAPH_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            local_source_dir: get("LOCAL_SOURCE_DIR").map(PathBuf::from),
            source_cache_ttl: Duration::from_secs(parse_or(&get, "SOURCE_CACHE_TTL_SECS", 3600)?),
            reservation_query_ttl: Duration::from_secs(parse_or(
                &get,
                "RESERVATION_QUERY_TTL_SECS",
                3600,
            )?),
            import_default_months: parse_or(&get, "IMPORT_DEFAULT_MONTHS", 2)?,
            import_sheet_concurrency: parse_or(&get, "IMPORT_SHEET_CONCURRENCY", 2)?,
            reconcile_max_retries: parse_or(&get, "RECONCILE_MAX_RETRIES", 3)?,
            layout_rules,
            continuity_predicate: get("CONTINUITY_PREDICATE").unwrap_or_else(|| "guest".to_string()),
            logs_dir: PathBuf::from(get("LOGS_DIR").unwrap_or_else(|| "../logs".to_string())),
            resend_api_key: get("RESEND_API_KEY"),
            email_from_address: get("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|| "notificaciones@rlhabitt.com".to_string()),
        })
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{} is invalid ('{}'): {}", key, raw, e)),
        None => Ok(default),
    }
}
