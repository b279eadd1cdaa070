//! Shared test infrastructure for integration tests
//!
//! Provides an in-process stub upstream that records every request and
//! re-verifies SigV4 signatures with the server-side credentials, a stub
//! metadata service for the credential provider, client-side signing
//! helpers, and spawners that put the proxy itself on an ephemeral port.

#![allow(dead_code)]

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use s3proxy::config::Endpoint;
use s3proxy::credentials::AccessProvider;
use s3proxy::http_client::HttpClient;
use s3proxy::proxy::{query_pairs, router, signed_header_names, AppState};
use s3proxy::sigv4;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Credentials the proxy signs with (the server-managed identity).
pub const SERVER_ACCESS_KEY: &str = "AKIASERVEREXAMPLE";
pub const SERVER_SECRET_KEY: &str = "server-secret/server-secret-EXAMPLEKEY";

/// Credentials the test client signs with; the proxy must replace these.
pub const CLIENT_ACCESS_KEY: &str = "AKIACLIENTEXAMPLE";
pub const CLIENT_SECRET_KEY: &str = "client-secret/client-secret-EXAMPLEKEY";

/// Credentials served by the stub metadata service.
pub const METADATA_ACCESS_KEY: &str = "ASIAMETADATAEXAMPLE";
pub const METADATA_SECRET_KEY: &str = "metadata-secret-EXAMPLEKEY";

pub const EMPTY_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

// === Stub upstream ===

/// One request as the stub upstream saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub host: Option<String>,
    pub body_sha256: String,
    pub body_len: usize,
    /// None when the request carried no Authorization header.
    pub signature_valid: Option<bool>,
}

#[derive(Default)]
pub struct UpstreamState {
    pub requests: Mutex<Vec<RecordedRequest>>,
}

pub struct StubUpstream {
    pub addr: SocketAddr,
    pub state: Arc<UpstreamState>,
}

impl StubUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }
}

/// Start the stub upstream on an ephemeral port.
pub async fn spawn_upstream() -> StubUpstream {
    let state = Arc::new(UpstreamState::default());
    let app = Router::new()
        .fallback(record_request)
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StubUpstream { addr, state }
}

async fn record_request(State(state): State<Arc<UpstreamState>>, req: Request<Body>) -> Response {
    let (parts, body) = req.into_parts();
    // The stub may buffer; the proxy under test must not.
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();

    let authorization = header_string(&parts.headers, "authorization");
    let signature_valid = authorization
        .as_deref()
        .map(|received| expected_authorization(&parts) == received);

    state.requests.lock().push(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        authorization,
        host: header_string(&parts.headers, "host"),
        body_sha256: hex_sha256(&bytes),
        body_len: bytes.len(),
        signature_valid,
    });

    (
        StatusCode::OK,
        [("x-stub-upstream", "1")],
        "<ListAllMyBucketsResult/>",
    )
        .into_response()
}

/// Recompute the Authorization the server credentials produce for the
/// request exactly as received. A re-signing proxy is correct when the
/// recomputed string matches the received one.
fn expected_authorization(parts: &axum::http::request::Parts) -> String {
    let mut to_sign: BTreeMap<String, String> = BTreeMap::new();
    for name in signed_header_names(&parts.headers) {
        let value = parts
            .headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        to_sign.insert(name, value.to_string());
    }
    let params = query_pairs(parts.uri.query());
    let body_hash = header_string(&parts.headers, "x-amz-content-sha256");

    sigv4::sign(
        SERVER_ACCESS_KEY,
        SERVER_SECRET_KEY,
        "us-east-1",
        "s3",
        parts.method.as_str(),
        parts.uri.path(),
        &mut to_sign,
        &params,
        body_hash.as_deref(),
    )
}

// === Proxy spawners ===

/// Start the proxy with the static server credential pair.
pub async fn spawn_proxy(upstream_url: &str) -> SocketAddr {
    let http = Arc::new(HttpClient::new());
    let provider = AccessProvider::new(
        http.clone(),
        Some((SERVER_ACCESS_KEY.to_string(), SERVER_SECRET_KEY.to_string())),
    );
    spawn_proxy_with_provider(upstream_url, provider, http).await
}

/// Start the proxy with a caller-built provider (dynamic-credential tests).
pub async fn spawn_proxy_with_provider(
    upstream_url: &str,
    provider: AccessProvider,
    http: Arc<HttpClient>,
) -> SocketAddr {
    let state = Arc::new(AppState {
        endpoint: Endpoint::new(upstream_url, "us-east-1".to_string()).unwrap(),
        provider,
        http,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

// === Client-side signing ===

/// Sign a request the way an S3 SDK would, with the client credentials.
/// Returns the headers to attach, Authorization included.
pub fn client_signed_headers(
    method: &str,
    proxy_addr: SocketAddr,
    path: &str,
    query: &[(String, Option<String>)],
    body_hash: &str,
) -> Vec<(String, String)> {
    let mut headers = BTreeMap::from([
        ("host".to_string(), proxy_addr.to_string()),
        ("x-amz-content-sha256".to_string(), body_hash.to_string()),
    ]);
    let authorization = sigv4::sign(
        CLIENT_ACCESS_KEY,
        CLIENT_SECRET_KEY,
        "us-east-1",
        "s3",
        method,
        path,
        &mut headers,
        query,
        Some(body_hash),
    );
    headers.insert("authorization".to_string(), authorization);
    headers.into_iter().collect()
}

// === Stub metadata service ===

#[derive(Default)]
pub struct MetadataState {
    pub identity_hits: AtomicUsize,
    pub credentials_hits: AtomicUsize,
    /// Seconds from now until served credentials expire; None omits the
    /// Expiration field entirely.
    pub expires_in: Mutex<Option<i64>>,
}

pub struct StubMetadata {
    pub addr: SocketAddr,
    pub state: Arc<MetadataState>,
}

impl StubMetadata {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Start a metadata stub whose identity-document endpoint answers 400 —
/// the IMDS behavior outside EC2 — forcing the provider onto the
/// container-credentials fallback. No test ever reaches real STS.
pub async fn spawn_metadata(expires_in: Option<i64>) -> StubMetadata {
    async fn identity(State(state): State<Arc<MetadataState>>) -> Response {
        state.identity_hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::BAD_REQUEST, "no identity document").into_response()
    }

    async fn credentials(State(state): State<Arc<MetadataState>>) -> Response {
        state.credentials_hits.fetch_add(1, Ordering::SeqCst);
        let mut doc = serde_json::json!({
            "AccessKeyId": METADATA_ACCESS_KEY,
            "SecretAccessKey": METADATA_SECRET_KEY,
            "Token": "metadata-session-token",
        });
        if let Some(secs) = *state.expires_in.lock() {
            let expires = chrono::Utc::now() + chrono::Duration::seconds(secs);
            doc["Expiration"] =
                serde_json::Value::String(expires.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        }
        axum::Json(doc).into_response()
    }

    let state = Arc::new(MetadataState {
        expires_in: Mutex::new(expires_in),
        ..Default::default()
    });
    let app = Router::new()
        .route("/latest/dynamic/instance-identity/document", get(identity))
        .route(
            "/latest/meta-data/iam/security-credentials/",
            get(credentials),
        )
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StubMetadata { addr, state }
}

// === Data generators ===

/// Generate deterministic binary data
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}

pub fn hex_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
