use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::http::HeaderValue;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    /// Directory holding uploaded videos, thumbnails and documents
    pub media_root: PathBuf,
    pub signed_url_ttl_secs: i64,
    pub session_ttl_hours: i64,
    pub max_upload_mb: usize,
    pub log_dir: Option<PathBuf>,
    pub tls: Option<TlsConfig>,
    /// Browser origins allowed to call the API with credentials. Empty means same-origin only.
    pub cors_origins: Vec<String>,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Clone, Default)]
pub struct Secrets {
    pub media_signing: String,
    pub payment_webhook: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secrets(..)")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://database/course.db".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            media_root: PathBuf::from("media"),
            signed_url_ttl_secs: 3600,
            session_ttl_hours: 24 * 5,
            max_upload_mb: 512,
            log_dir: None,
            tls: None,
            cors_origins: Vec::new(),
            secrets: Secrets::default(),
        }
    }
}

impl Config {
    /// Load the config file (if any), then apply environment overrides and secrets.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                toml::from_str::<Config>(&content)?
            }
            None => Config::default(),
        };
        if let Ok(url) = dotenvy::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(root) = dotenvy::var("MEDIA_ROOT") {
            config.media_root = PathBuf::from(root);
        }
        if let Ok(origins) = dotenvy::var("CORS_ORIGINS") {
            config.cors_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }
        config.secrets = Secrets {
            media_signing: dotenvy::var("MEDIA_SIGNING_SECRET")
                .context("MEDIA_SIGNING_SECRET must be set")?,
            payment_webhook: dotenvy::var("PAYMENT_WEBHOOK_SECRET")
                .context("PAYMENT_WEBHOOK_SECRET must be set")?,
        };
        Ok(config)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn allowed_origins(&self) -> anyhow::Result<Vec<HeaderValue>> {
        self.cors_origins
            .iter()
            .map(|origin| {
                let origin = origin.trim_end_matches('/');
                if !(origin.starts_with("http://") || origin.starts_with("https://")) {
                    anyhow::bail!("invalid CORS origin {origin:?}");
                }
                HeaderValue::from_str(origin)
                    .with_context(|| format!("invalid CORS origin {origin:?}"))
            })
            .collect()
    }
}
