use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, LOCATION, USER_AGENT};
use http::{HeaderMap, Method, Request, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use log::{debug, trace, warn};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::comm::cookie_jar::CookieJar;
use crate::comm::credentials::CredentialStore;
use crate::comm::destination::Destination;
use crate::comm::pool::{self, ConnectionPool, PoolConfig, DEFAULT_KEEP_ALIVE_MS};
use crate::error::testwire_error::TestwireError;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 6.1; WOW64; rv:33.0) Gecko/20120101 Firefox/33.0";

const MAX_REDIRECTS: usize = 5;

// Resilient HTTP client bound to one destination for its whole lifetime.
// Credentials, default headers, cookies and the response-time ledger all
// belong to this instance; two clients never share state.
pub struct WebServiceClient {
    destination: Destination,
    credentials: CredentialStore,
    headers: HashMap<String, String>,
    pool_config: PoolConfig,
    verify_tls: bool,

    cookies: Mutex<CookieJar>,
    response_times: DashMap<String, u64>,
    // Keep-Alive window advertised by the server, in ms. Read at the next
    // connect(), where it becomes the pool idle timeout.
    keep_alive_ms: AtomicU64,
    pool: RwLock<Option<ConnectionPool>>,
}

impl WebServiceClient {
    pub fn new(host: &str, port: u16) -> Self {
        WebServiceClient {
            destination: Destination::new(host, port),
            credentials: CredentialStore::new(),
            headers: HashMap::new(),
            pool_config: PoolConfig::default(),
            verify_tls: false,
            cookies: Mutex::new(CookieJar::new()),
            response_times: DashMap::new(),
            keep_alive_ms: AtomicU64::new(DEFAULT_KEEP_ALIVE_MS),
            pool: RwLock::new(None),
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        self.credentials.set_basic_auth(username, password);
    }

    pub fn set_client_certificate(&mut self, certificate: &str, password: &str) {
        self.credentials.set_client_certificate(certificate, password);
    }

    // Opt in to real server certificate verification. The default accepts
    // anything, which is what talking to self-signed test endpoints needs.
    pub fn set_verify_tls(&mut self, verify: bool) {
        self.verify_tls = verify;
    }

    pub fn set_pool_config(&mut self, config: PoolConfig) {
        self.pool_config = config;
    }

    // Default header sent with every request until cleared. Setting the same
    // name again replaces the previous value.
    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.insert(name.to_string(), value.to_string());
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    pub fn clear_headers(&mut self) {
        self.headers.clear();
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    // (Re)builds the pooled transport. Safe to call on an already connected
    // client; the old pool and its idle connections are dropped first.
    pub async fn connect(&mut self) -> Result<(), TestwireError> {
        self.disconnect().await;
        self.credentials.prime(&self.destination);

        let idle = Duration::from_millis(self.keep_alive_ms.load(Ordering::Relaxed));
        let pool = ConnectionPool::new(&self.pool_config, self.credentials.identity(), self.verify_tls, idle)?;
        debug!("connected to {}", self.destination);

        *self.pool.write().await = Some(pool);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if self.pool.write().await.take().is_some() {
            debug!("disconnected from {}", self.destination);
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    // GET ------------------------------------------------------------------

    pub async fn get(&self, endpoint: &str) -> Result<String, TestwireError> {
        self.get_with(endpoint, "", "").await
    }

    pub async fn get_with(&self, endpoint: &str, params: &str, request_id: &str) -> Result<String, TestwireError> {
        let response = self.execute(Method::GET, endpoint, params, None, Bytes::new(), request_id).await?;
        self.into_text(response)
    }

    pub async fn get_json(&self, endpoint: &str) -> Result<Value, TestwireError> {
        self.get_json_with(endpoint, "", "").await
    }

    pub async fn get_json_with(&self, endpoint: &str, params: &str, request_id: &str) -> Result<Value, TestwireError> {
        let body = self.get_with(endpoint, params, request_id).await?;
        parse_json(&body)
    }

    // POST -----------------------------------------------------------------

    pub async fn post(&self, endpoint: &str, body: &str) -> Result<String, TestwireError> {
        self.post_with(endpoint, "", body, "").await
    }

    pub async fn post_with(&self, endpoint: &str, params: &str, body: &str, request_id: &str) -> Result<String, TestwireError> {
        let response = self
            .execute(Method::POST, endpoint, params, Some("text/plain"), Bytes::from(body.to_string()), request_id)
            .await?;
        self.into_text(response)
    }

    pub async fn post_json(&self, endpoint: &str, json: &Value) -> Result<Value, TestwireError> {
        self.post_json_with(endpoint, "", json, "").await
    }

    pub async fn post_json_with(&self, endpoint: &str, params: &str, json: &Value, request_id: &str) -> Result<Value, TestwireError> {
        let payload = Bytes::from(serde_json::to_vec(json).map_err(|e| TestwireError::Parse {
            message: e.to_string(),
            body: json.to_string(),
        })?);
        let response = self
            .execute(Method::POST, endpoint, params, Some("application/json"), payload, request_id)
            .await?;
        let text = self.into_text(response)?;
        parse_json(&text)
    }

    // PUT ------------------------------------------------------------------

    pub async fn put(&self, endpoint: &str, body: &str) -> Result<String, TestwireError> {
        self.put_with(endpoint, "", body, "").await
    }

    pub async fn put_with(&self, endpoint: &str, params: &str, body: &str, request_id: &str) -> Result<String, TestwireError> {
        let response = self
            .execute(Method::PUT, endpoint, params, Some("text/plain"), Bytes::from(body.to_string()), request_id)
            .await?;
        self.into_text(response)
    }

    pub async fn put_json(&self, endpoint: &str, json: &Value) -> Result<Value, TestwireError> {
        self.put_json_with(endpoint, "", json, "").await
    }

    pub async fn put_json_with(&self, endpoint: &str, params: &str, json: &Value, request_id: &str) -> Result<Value, TestwireError> {
        let payload = Bytes::from(serde_json::to_vec(json).map_err(|e| TestwireError::Parse {
            message: e.to_string(),
            body: json.to_string(),
        })?);
        let response = self
            .execute(Method::PUT, endpoint, params, Some("application/json"), payload, request_id)
            .await?;
        let text = self.into_text(response)?;
        parse_json(&text)
    }

    // DELETE ---------------------------------------------------------------

    pub async fn delete(&self, endpoint: &str) -> Result<String, TestwireError> {
        self.delete_with(endpoint, "", "").await
    }

    pub async fn delete_with(&self, endpoint: &str, params: &str, request_id: &str) -> Result<String, TestwireError> {
        let response = self.execute(Method::DELETE, endpoint, params, None, Bytes::new(), request_id).await?;
        self.into_text(response)
    }

    pub async fn delete_with_body(&self, endpoint: &str, body: &str) -> Result<String, TestwireError> {
        let response = self
            .execute(Method::DELETE, endpoint, "", Some("text/plain"), Bytes::from(body.to_string()), "")
            .await?;
        self.into_text(response)
    }

    // HEAD -----------------------------------------------------------------

    pub async fn head(&self, endpoint: &str) -> Result<HeaderMap, TestwireError> {
        self.head_with(endpoint, "", "").await
    }

    pub async fn head_with(&self, endpoint: &str, params: &str, request_id: &str) -> Result<HeaderMap, TestwireError> {
        let response = self.execute(Method::HEAD, endpoint, params, None, Bytes::new(), request_id).await?;
        let code = response.status().as_u16();
        check_status(code, "")?;
        Ok(response.headers().clone())
    }

    // Response-time ledger -------------------------------------------------

    // Milliseconds between dispatch and full body receipt for the given
    // request id, if that id was supplied to a call on this client
    pub fn response_time(&self, request_id: &str) -> Option<u64> {
        self.response_times.get(request_id).map(|entry| *entry.value())
    }

    pub fn clear_response_time(&self, request_id: &str) -> Option<u64> {
        self.response_times.remove(request_id).map(|(_, ms)| ms)
    }

    pub fn clear_response_times(&self) {
        self.response_times.clear();
    }

    pub async fn cookies(&self) -> Vec<crate::comm::cookie_jar::Cookie> {
        self.cookies.lock().await.cookies().into_iter().cloned().collect()
    }

    pub async fn clear_cookies(&self) {
        self.cookies.lock().await.clear();
    }

    // Core -----------------------------------------------------------------

    fn uri_for(&self, endpoint: &str, params: &str) -> String {
        let mut uri = format!("{}{}", self.destination.base_uri(), endpoint);
        if !params.trim().is_empty() {
            uri.push('?');
            uri.push_str(params);
        }
        uri
    }

    async fn build_request(
        &self,
        method: &Method,
        uri: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> Result<Request<Full<Bytes>>, TestwireError> {
        let mut builder = Request::builder().method(method.clone()).uri(uri).header(USER_AGENT, DEFAULT_USER_AGENT);

        if let Some(ct) = content_type {
            builder = builder.header(CONTENT_TYPE, ct);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(auth) = self.credentials.preemptive_header(&self.destination) {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if let Some(cookie_header) = self.cookies.lock().await.request_header() {
            builder = builder.header(COOKIE, cookie_header);
        }

        Ok(builder.body(Full::new(body))?)
    }

    // Sends one logical request, transparently following up to MAX_REDIRECTS
    // redirects. Times the whole exchange when a request id is given.
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        params: &str,
        content_type: Option<&str>,
        body: Bytes,
        request_id: &str,
    ) -> Result<http::Response<Bytes>, TestwireError> {
        let guard = self.pool.read().await;
        let pool = guard
            .as_ref()
            .ok_or_else(|| TestwireError::Connection(format!("not connected to {}", self.destination)))?;

        let mut uri = self.uri_for(endpoint, params);
        let mut method = method;
        let mut body = body;
        let mut content_type = content_type;
        let started = Instant::now();

        let mut hops = 0;
        let response = loop {
            let request = self.build_request(&method, &uri, content_type, body.clone()).await?;
            let response = pool.execute(request).await?;

            self.keep_alive_ms
                .store(pool::keep_alive_window(response.headers()).as_millis() as u64, Ordering::Relaxed);
            self.cookies.lock().await.store_from_response(response.headers(), self.destination.host());

            let status = response.status();
            if !status.is_redirection() {
                break response;
            }
            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(TestwireError::Connection(format!("too many redirects from {}", uri)));
            }
            let Some(location) = response.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
                break response;
            };
            uri = if location.starts_with('/') {
                format!("{}{}", self.destination.base_uri(), location)
            } else {
                location.to_string()
            };
            trace!("redirect {} -> {}", status, uri);
            if status == StatusCode::SEE_OTHER {
                method = Method::GET;
                body = Bytes::new();
                content_type = None;
            }
        };

        if !request_id.trim().is_empty() {
            let elapsed = started.elapsed().as_millis() as u64;
            trace!("{} took {} ms", request_id, elapsed);
            self.response_times.insert(request_id.to_string(), elapsed);
        }

        Ok(response)
    }

    // The one place where status classification happens. 2xx passes, anything
    // else surfaces as an HttpStatus error carrying the body verbatim.
    fn into_text(&self, response: http::Response<Bytes>) -> Result<String, TestwireError> {
        let code = response.status().as_u16();
        let body = String::from_utf8_lossy(response.body()).into_owned();
        check_status(code, &body)?;
        Ok(body)
    }
}

fn check_status(code: u16, body: &str) -> Result<(), TestwireError> {
    if (200..300).contains(&code) {
        return Ok(());
    }
    warn!("unexpected status {}", code);
    Err(TestwireError::HttpStatus { code, body: body.to_string() })
}

fn parse_json(text: &str) -> Result<Value, TestwireError> {
    serde_json::from_str(text).map_err(|e| TestwireError::Parse {
        message: e.to_string(),
        body: text.to_string(),
    })
}

// One-shot helpers for URLs outside any client's destination, such as poking
// another service's health endpoint.

pub async fn get_uri(uri: &str) -> Result<String, TestwireError> {
    let pool = ConnectionPool::new(&PoolConfig::default(), None, false, Duration::from_millis(DEFAULT_KEEP_ALIVE_MS))?;
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(USER_AGENT, DEFAULT_USER_AGENT)
        .body(Full::new(Bytes::new()))?;
    let response = pool.execute(request).await?;
    let code = response.status().as_u16();
    let body = String::from_utf8_lossy(response.body()).into_owned();
    check_status(code, &body)?;
    Ok(body)
}

pub async fn head_uri(uri: &str) -> Result<HeaderMap, TestwireError> {
    let pool = ConnectionPool::new(&PoolConfig::default(), None, false, Duration::from_millis(DEFAULT_KEEP_ALIVE_MS))?;
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(uri)
        .header(USER_AGENT, DEFAULT_USER_AGENT)
        .body(Full::new(Bytes::new()))?;
    let response = pool.execute(request).await?;
    check_status(response.status().as_u16(), "")?;
    Ok(response.headers().clone())
}

pub async fn head_uri_header(uri: &str, header: &str) -> Result<Option<String>, TestwireError> {
    let headers = head_uri(uri).await?;
    Ok(headers.get(header).and_then(|v| v.to_str().ok()).map(|s| s.to_string()))
}

// URL-encodes a query component, UTF-8 percent escapes
pub fn encode(text: &str) -> String {
    urlencoding::encode(text).into_owned()
}

pub fn decode(text: &str) -> Result<String, TestwireError> {
    urlencoding::decode(text)
        .map(|s| s.into_owned())
        .map_err(|e| TestwireError::Parse { message: e.to_string(), body: text.to_string() })
}

// Fresh opaque id for correlating a call with its response-time entry
pub fn next_request_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_accepts_2xx() {
        assert!(check_status(200, "").is_ok());
        assert!(check_status(204, "").is_ok());
        assert!(check_status(299, "").is_ok());
    }

    #[test]
    fn test_check_status_rejects_everything_else() {
        let err = check_status(404, "missing").unwrap_err();
        assert!(err.matches_http(404, "missing"));
        assert!(check_status(199, "").is_err());
        assert!(check_status(301, "").is_err());
        assert!(check_status(500, "boom").is_err());
    }

    #[test]
    fn test_uri_building() {
        let client = WebServiceClient::new("localhost", 8080);
        assert_eq!(client.uri_for("/status", ""), "http://localhost:8080/status");
        assert_eq!(client.uri_for("/status", "  "), "http://localhost:8080/status");
        assert_eq!(client.uri_for("/q", "a=1&b=2"), "http://localhost:8080/q?a=1&b=2");
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode("a b&c"), "a%20b%26c");
        assert_eq!(decode("a%20b%26c").unwrap(), "a b&c");
    }

    #[test]
    fn test_request_ids_are_unique() {
        assert_ne!(next_request_id(), next_request_id());
    }

    #[tokio::test]
    async fn test_calls_require_connect() {
        let client = WebServiceClient::new("localhost", 8080);
        let err = client.get("/status").await.unwrap_err();
        assert!(matches!(err, TestwireError::Connection(_)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let mut client = WebServiceClient::new("localhost", 8080);
        assert!(!client.is_connected().await);
        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected().await);
    }
}
