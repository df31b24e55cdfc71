use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, trace};
use tokio::sync::Semaphore;

use crate::comm::credentials::ClientIdentity;
use crate::error::testwire_error::TestwireError;

// Default caps mirror commons-httpclient tuning that survived years of
// large soak runs: plenty of parallelism against the system under test,
// bounded fan-out per route.
pub const DEFAULT_MAX_TOTAL: usize = 200;
pub const DEFAULT_MAX_PER_ROUTE: usize = 20;
pub const DEFAULT_MAX_FOR_DESTINATION: usize = 200;
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_total: usize,
    pub max_per_route: usize,
    pub max_for_destination: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: DEFAULT_MAX_TOTAL,
            max_per_route: DEFAULT_MAX_PER_ROUTE,
            max_for_destination: DEFAULT_MAX_FOR_DESTINATION,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

// Pooled HTTP client for one destination. hyper's legacy client keeps idle
// connections per host already; the semaphores add the missing hard caps on
// in-flight requests. Permits are held until the response body is fully
// collected, so a slow consumer counts against the route the whole time.
#[derive(Clone)]
pub struct ConnectionPool {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    total_permits: Arc<Semaphore>,
    route_permits: Arc<Semaphore>,
    read_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(
        config: &PoolConfig,
        identity: Option<&ClientIdentity>,
        verify_server: bool,
        idle_timeout: Duration,
    ) -> Result<Self, TestwireError> {
        let tls = crate::tls::channel::build_client_tls(identity, verify_server)?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.connect_timeout));

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .pool_max_idle_per_host(config.max_per_route)
            .build(https);

        // The own-route cap is the larger of the two route limits; requests
        // to this pool's single destination get the dedicated allowance.
        let route_cap = config.max_per_route.max(config.max_for_destination).min(config.max_total);
        debug!("connection pool ready, caps total={} route={}", config.max_total, route_cap);

        Ok(ConnectionPool {
            client,
            total_permits: Arc::new(Semaphore::new(config.max_total)),
            route_permits: Arc::new(Semaphore::new(route_cap)),
            read_timeout: config.read_timeout,
        })
    }

    // Sends the request and collects the whole response body. Queues on the
    // pool caps instead of failing when they are reached.
    pub async fn execute(&self, request: Request<Full<Bytes>>) -> Result<Response<Bytes>, TestwireError> {
        let _total = self
            .total_permits
            .acquire()
            .await
            .map_err(|e| TestwireError::Connection(format!("pool closed: {}", e)))?;
        let _route = self
            .route_permits
            .acquire()
            .await
            .map_err(|e| TestwireError::Connection(format!("pool closed: {}", e)))?;

        trace!("{} {}", request.method(), request.uri());

        let response = tokio::time::timeout(self.read_timeout, self.client.request(request))
            .await
            .map_err(|_| TestwireError::Connection(format!("request timed out after {:?}", self.read_timeout)))??;

        let (parts, body) = response.into_parts();
        let bytes = tokio::time::timeout(self.read_timeout, body.collect())
            .await
            .map_err(|_| TestwireError::Connection(format!("response body timed out after {:?}", self.read_timeout)))?
            .map_err(TestwireError::connection)?
            .to_bytes();

        Ok(Response::from_parts(parts, bytes))
    }
}

// Reads the keep-alive window from response headers. Per RFC 7230 appendix
// A.1.2 the server advertises "Keep-Alive: timeout=N" in seconds; absent or
// malformed headers fall back to 30 seconds.
pub fn keep_alive_window(headers: &HeaderMap) -> Duration {
    let Some(value) = headers.get("keep-alive").and_then(|v| v.to_str().ok()) else {
        return Duration::from_millis(DEFAULT_KEEP_ALIVE_MS);
    };
    for part in value.split(',') {
        let part = part.trim();
        if let Some(seconds) = part.strip_prefix("timeout=") {
            if let Ok(seconds) = seconds.trim().parse::<u64>() {
                return Duration::from_secs(seconds);
            }
        }
    }
    Duration::from_millis(DEFAULT_KEEP_ALIVE_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    #[test]
    fn test_keep_alive_timeout_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5, max=100"));
        assert_eq!(keep_alive_window(&headers), Duration::from_secs(5));
    }

    #[test]
    fn test_keep_alive_default_when_absent() {
        let headers = HeaderMap::new();
        assert_eq!(keep_alive_window(&headers), Duration::from_millis(30_000));
    }

    #[test]
    fn test_keep_alive_default_when_malformed() {
        let mut headers = HeaderMap::new();
        headers.insert("keep-alive", HeaderValue::from_static("timeout=soon"));
        assert_eq!(keep_alive_window(&headers), Duration::from_millis(30_000));
    }

    #[test]
    fn test_pool_builds_with_defaults() {
        let pool = ConnectionPool::new(&PoolConfig::default(), None, false, Duration::from_secs(30));
        assert!(pool.is_ok());
    }
}
