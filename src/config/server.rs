use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "workbench.toml";

/// Client credentials for one OAuth provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Where OAuth callbacks redirect the browser after login (with `token` or `error`).
    pub frontend_url: String,
    /// Lifetime of session tokens issued by the OAuth callback.
    pub session_ttl_seconds: i64,
    /// Signing secret for billing webhooks. Webhooks are rejected when unset.
    pub stripe_webhook_secret: Option<String>,
    pub google: Option<OAuthClientConfig>,
    pub github: Option<OAuthClientConfig>,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("workbench.db")
    }

    #[must_use]
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Loads `workbench.toml` from the data directory if it exists, then applies
    /// `WORKBENCH_*` environment overrides for secrets.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };
        config.data_dir = data_dir.to_path_buf();
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("{CONFIG_FILE_NAME}: {e}")))?;
        if config.session_ttl_seconds <= 0 {
            return Err(Error::Config(
                "session_ttl_seconds must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("WORKBENCH_FRONTEND_URL") {
            self.frontend_url = url;
        }
        if let Ok(secret) = std::env::var("WORKBENCH_STRIPE_WEBHOOK_SECRET") {
            self.stripe_webhook_secret = Some(secret);
        }
        if let (Some(google), Ok(secret)) = (
            self.google.as_mut(),
            std::env::var("WORKBENCH_GOOGLE_CLIENT_SECRET"),
        ) {
            google.client_secret = secret;
        }
        if let (Some(github), Ok(secret)) = (
            self.github.as_mut(),
            std::env::var("WORKBENCH_GITHUB_CLIENT_SECRET"),
        ) {
            github.client_secret = secret;
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            frontend_url: "http://localhost:5173".to_string(),
            session_ttl_seconds: 7 * 24 * 60 * 60,
            stripe_webhook_secret: None,
            google: None,
            github: None,
        }
    }
}
