//! Server-side AWS credential provider
//!
//! Resolves the identity the proxy signs with. With a static key pair the
//! provider is a constant source and never touches the network. Otherwise it
//! reads the instance identity document for the profile ARN, assumes that
//! role through STS, and on any failure falls back to the container/instance
//! credentials endpoint. The fallback URL is complete only on ECS/Fargate,
//! where `AWS_CONTAINER_CREDENTIALS_RELATIVE_URI` already names a full
//! document; on plain EC2 it stops at the role listing and the STS path is
//! the one expected to succeed.
//!
//! Readers take lock-free snapshots of the cached record. Refresh is
//! single-flight: concurrent callers wait on the in-flight refresh and share
//! its result. A background task clears the cache when the issued
//! credentials expire; the task never fails the process — the next
//! request-driven refresh retries.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http_client::HttpClient;

const EC2_METADATA_HOST: &str = "http://169.254.169.254";
const ECS_METADATA_HOST: &str = "http://169.254.170.2";
const IDENTITY_DOCUMENT_PATH: &str = "/latest/dynamic/instance-identity/document";
const EC2_CREDENTIALS_PATH: &str = "/latest/meta-data/iam/security-credentials/";
const ROLE_SESSION_NAME: &str = "s3proxy";

/// Failures while producing a credential pair.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no instance identity document at {0}")]
    NoInstanceIdentity(String),

    #[error("metadata service request failed: {0}")]
    Metadata(#[from] reqwest::Error),

    #[error("STS AssumeRole failed: {0}")]
    AssumeRole(String),

    #[error("malformed credentials document: {0}")]
    Malformed(String),
}

/// An issued credential set. Replaced wholesale on refresh, never mutated.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

/// Instance identity document; only the profile ARN is consumed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    instance_profile_arn: String,
}

/// Credentials JSON served by the ECS and EC2 metadata endpoints. ECS calls
/// the token field `Token`, the EC2 document calls it `SessionToken`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialsDocument {
    access_key_id: String,
    secret_access_key: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expiration: Option<String>,
}

pub struct AccessProvider {
    /// Static key pair configured at startup; short-circuits all discovery.
    static_source: bool,
    cached: Arc<ArcSwapOption<Credentials>>,
    role_arn: Mutex<Option<String>>,
    refresh_lock: Mutex<()>,
    invalidation: parking_lot::Mutex<Option<JoinHandle<()>>>,
    sts: OnceCell<aws_sdk_sts::Client>,
    http: Arc<HttpClient>,
    metadata_host: Option<String>,
}

impl AccessProvider {
    /// Build a provider. With `static_keys` the provider is a constant
    /// source: no metadata lookups, no STS, no expiry.
    pub fn new(http: Arc<HttpClient>, static_keys: Option<(String, String)>) -> Self {
        let cached = Arc::new(ArcSwapOption::empty());
        let static_source = static_keys.is_some();

        if let Some((access_key_id, secret_access_key)) = static_keys {
            info!("using configured AWS credentials instead of an IAM role");
            cached.store(Some(Arc::new(Credentials {
                access_key_id,
                secret_access_key,
                session_token: None,
                expiration: None,
            })));
        }

        Self {
            static_source,
            cached,
            role_arn: Mutex::new(None),
            refresh_lock: Mutex::new(()),
            invalidation: parking_lot::Mutex::new(None),
            sts: OnceCell::new(),
            http,
            metadata_host: None,
        }
    }

    /// Override the metadata service base URL (non-standard IMDS endpoints,
    /// stub servers in tests).
    pub fn with_metadata_host(mut self, base_url: impl Into<String>) -> Self {
        self.metadata_host = Some(base_url.into());
        self
    }

    /// Current credentials, refreshing synchronously when nothing is cached.
    /// Concurrent callers share a single in-flight refresh.
    pub async fn current(&self) -> Result<Arc<Credentials>, CredentialError> {
        if let Some(creds) = self.cached.load_full() {
            return Ok(creds);
        }

        let _guard = self.refresh_lock.lock().await;
        // A racing caller may have refreshed while we waited for the lock.
        if let Some(creds) = self.cached.load_full() {
            return Ok(creds);
        }

        let creds = Arc::new(self.refresh().await?);
        // Store before scheduling: an expiry in the past must clear this
        // record, not race an empty cache.
        self.cached.store(Some(creds.clone()));
        self.schedule_invalidation(creds.expiration);
        Ok(creds)
    }

    /// Drop the cached record and cancel the pending expiry. The next
    /// `current()` refreshes. A constant source has nothing to rotate.
    pub fn invalidate(&self) {
        if self.static_source {
            return;
        }
        self.cached.store(None);
        if let Some(task) = self.invalidation.lock().take() {
            task.abort();
        }
        debug!("credential cache invalidated");
    }

    /// Cancel the expiry task and release the outbound HTTP resources.
    pub fn close(&self) {
        if let Some(task) = self.invalidation.lock().take() {
            task.abort();
        }
        self.http.close();
    }

    async fn refresh(&self) -> Result<Credentials, CredentialError> {
        match self.assume_instance_role().await {
            Ok(creds) => Ok(creds),
            Err(err) => {
                warn!("failed to assume instance role, falling back to credentials endpoint: {err}");
                self.fetch_credentials_document().await
            }
        }
    }

    /// Role ARN from the identity document, STS AssumeRole with it. The ARN
    /// is cached across refreshes; a failed STS call does not clear it.
    async fn assume_instance_role(&self) -> Result<Credentials, CredentialError> {
        let role_arn = self.role_arn().await?;
        let sts = self
            .sts
            .get_or_init(|| async {
                let config =
                    aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                aws_sdk_sts::Client::new(&config)
            })
            .await;

        let assumed = sts
            .assume_role()
            .role_arn(&role_arn)
            .role_session_name(ROLE_SESSION_NAME)
            .send()
            .await
            .map_err(|e| {
                CredentialError::AssumeRole(
                    aws_sdk_sts::error::DisplayErrorContext(&e).to_string(),
                )
            })?;

        let issued = assumed.credentials.ok_or_else(|| {
            CredentialError::AssumeRole("response carried no credentials".to_string())
        })?;

        info!("assumed role {role_arn} for session {ROLE_SESSION_NAME}");
        Ok(Credentials {
            access_key_id: issued.access_key_id,
            secret_access_key: issued.secret_access_key,
            session_token: Some(issued.session_token),
            expiration: DateTime::from_timestamp(
                issued.expiration.secs(),
                issued.expiration.subsec_nanos(),
            ),
        })
    }

    async fn role_arn(&self) -> Result<String, CredentialError> {
        let mut cached = self.role_arn.lock().await;
        if let Some(arn) = cached.as_ref() {
            return Ok(arn.clone());
        }
        let arn = self.fetch_role_arn().await?;
        *cached = Some(arn.clone());
        Ok(arn)
    }

    async fn fetch_role_arn(&self) -> Result<String, CredentialError> {
        let url = format!("{}{}", self.metadata_host(), IDENTITY_DOCUMENT_PATH);
        let request = self.http.request(reqwest::Method::GET, url.as_str()).build()?;
        let response = self.http.send(request).await?;

        // 400 is how IMDS answers outside EC2; keep it distinguishable from
        // transport errors so the caller knows the fallback is next.
        if response.status() == reqwest::StatusCode::BAD_REQUEST {
            return Err(CredentialError::NoInstanceIdentity(url));
        }
        let document: IdentityDocument = response.error_for_status()?.json().await?;
        Ok(document.instance_profile_arn)
    }

    async fn fetch_credentials_document(&self) -> Result<Credentials, CredentialError> {
        let url = format!("{}{}", self.metadata_host(), self.credentials_path());
        let request = self.http.request(reqwest::Method::GET, url.as_str()).build()?;
        let response = self.http.send(request).await?.error_for_status()?;
        let document: CredentialsDocument = response.json().await?;

        let expiration = document
            .expiration
            .as_deref()
            .map(parse_expiration)
            .transpose()?;
        Ok(Credentials {
            access_key_id: document.access_key_id,
            secret_access_key: document.secret_access_key,
            session_token: document.session_token.or(document.token),
            expiration,
        })
    }

    /// Clear the cache when the issued credentials lapse. Replaces (and
    /// aborts) whatever expiry was scheduled for the previous record.
    fn schedule_invalidation(&self, expiration: Option<DateTime<Utc>>) {
        let Some(expires_at) = expiration else {
            return;
        };
        let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let cache = Arc::clone(&self.cached);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.store(None);
            info!("credentials expired at {expires_at}, cache cleared");
        });
        if let Some(previous) = self.invalidation.lock().replace(task) {
            previous.abort();
        }
    }

    fn metadata_host(&self) -> String {
        if let Some(host) = &self.metadata_host {
            return host.clone();
        }
        // The relative-URI variable only exists in ECS/Fargate task contexts.
        match container_credentials_uri() {
            Some(_) => ECS_METADATA_HOST.to_string(),
            None => EC2_METADATA_HOST.to_string(),
        }
    }

    fn credentials_path(&self) -> String {
        container_credentials_uri().unwrap_or_else(|| EC2_CREDENTIALS_PATH.to_string())
    }
}

fn container_credentials_uri() -> Option<String> {
    std::env::var("AWS_CONTAINER_CREDENTIALS_RELATIVE_URI")
        .ok()
        .filter(|v| !v.is_empty())
}

/// Expiration format shared by STS and the metadata documents:
/// `2023-07-26T22:16:38Z`, UTC.
fn parse_expiration(raw: &str) -> Result<DateTime<Utc>, CredentialError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%SZ")
        .map(|dt| dt.and_utc())
        .map_err(|e| CredentialError::Malformed(format!("bad Expiration {raw:?}: {e}")))
}
