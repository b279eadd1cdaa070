//! Shared outbound HTTP client pool
//!
//! A single lazily-built reqwest client backs both the upstream S3 calls and
//! the metadata-service lookups. Nothing touches the network until the first
//! request. Redirects are followed (reqwest default) and no global timeout is
//! set — responses may stream for as long as an object takes to transfer.

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Keep-alive connections retained per upstream host.
const DEFAULT_MAX_IDLE_PER_HOST: usize = 100;

pub struct HttpClient {
    max_idle_per_host: usize,
    client: Mutex<Option<reqwest::Client>>,
}

impl HttpClient {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_IDLE_PER_HOST)
    }

    pub fn with_limits(max_idle_per_host: usize) -> Self {
        Self {
            max_idle_per_host,
            client: Mutex::new(None),
        }
    }

    /// Current client handle, building the pool on first use. Cloning a
    /// reqwest client shares the underlying pool.
    pub fn client(&self) -> reqwest::Client {
        self.client
            .lock()
            .get_or_insert_with(|| self.build())
            .clone()
    }

    fn build(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(self.max_idle_per_host)
            .build()
            .expect("reqwest client construction with static options")
    }

    /// Start building a request on the pooled client.
    pub fn request(
        &self,
        method: reqwest::Method,
        url: impl reqwest::IntoUrl,
    ) -> reqwest::RequestBuilder {
        self.client().request(method, url)
    }

    /// Send a request. If the connection layer reports the pool unusable the
    /// pool is rebuilt and the request retried exactly once. A request with a
    /// streaming body cannot be replayed and is never retried.
    pub async fn send(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let replay = request.try_clone();
        match self.client().execute(request).await {
            Err(err) => match replay {
                Some(replay) if err.is_connect() => {
                    warn!("outbound connection failed, rebuilding pool and retrying once: {err}");
                    *self.client.lock() = None;
                    self.client().execute(replay).await
                }
                _ => Err(err),
            },
            ok => ok,
        }
    }

    /// Release the pooled connections. Calling this twice is a no-op; the
    /// next request after a close rebuilds the pool.
    pub fn close(&self) {
        if self.client.lock().take().is_some() {
            debug!("outbound HTTP pool released");
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}
