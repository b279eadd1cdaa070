//! Configuration for the s3proxy server

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::warn;
use url::Url;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Upstream S3-compatible endpoint URL
    pub endpoint_url: String,

    /// Signing region
    #[serde(default = "default_region")]
    pub region: String,

    /// Static AWS access key id (optional; both keys or neither)
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Static AWS secret access key
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

// Default value functions for serde
fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8000".parse().unwrap()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint_url =
            std::env::var("AWS_S3_ENDPOINT_URL").map_err(|_| ConfigError::MissingEndpoint)?;

        let listen_addr = match std::env::var("S3PROXY_LISTEN_ADDR") {
            Ok(addr) => addr
                .parse()
                .map_err(|e| ConfigError::Parse(format!("S3PROXY_LISTEN_ADDR: {e}")))?,
            Err(_) => default_listen_addr(),
        };

        Ok(Self {
            listen_addr,
            endpoint_url,
            region: std::env::var("S3PROXY_REGION").unwrap_or_else(|_| default_region()),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
        })
    }

    /// Load configuration from file if one is named, otherwise from environment
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("S3PROXY_CONFIG") {
            return Self::from_file(&path);
        }
        if std::path::Path::new("s3proxy.toml").exists() {
            return Self::from_file("s3proxy.toml");
        }
        Self::from_env()
    }

    /// Static credential override. Set only when both halves are present;
    /// a lone key or secret is ignored.
    pub fn static_credentials(&self) -> Option<(String, String)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) => Some((key.clone(), secret.clone())),
            (None, None) => None,
            _ => {
                warn!("only one of AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY is set; ignoring both");
                None
            }
        }
    }

    /// Parse the configured endpoint into its immutable runtime form.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        Endpoint::new(&self.endpoint_url, self.region.clone())
    }
}

/// Immutable upstream endpoint: scheme/host/port plus signing scope.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base: Url,
    host: String,
    region: String,
}

impl Endpoint {
    pub fn new(endpoint_url: &str, region: String) -> Result<Self, ConfigError> {
        let base =
            Url::parse(endpoint_url).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))?;
        let host = base
            .host_str()
            .ok_or_else(|| ConfigError::InvalidEndpoint("endpoint URL has no host".to_string()))?
            .to_string();
        Ok(Self { base, host, region })
    }

    /// Upstream hostname without a port suffix; this is what the rewritten
    /// `host` header carries.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// SigV4 service scope. This proxy only fronts S3-compatible services.
    pub fn service(&self) -> &'static str {
        "s3"
    }

    /// Upstream URL for one request: the configured scheme/host/port with
    /// the inbound path and query carried over unchanged.
    pub fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url.set_query(query);
        url
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("AWS_S3_ENDPOINT_URL is not set")]
    MissingEndpoint,

    #[error("invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
}
