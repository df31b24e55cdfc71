use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Bytes;
use serde_json::Value;

use crate::error::testwire_error::TestwireError;

// Immutable snapshot of one inbound request, handed to response updaters.
// The body is fully collected before dispatch, so updaters never await.
#[derive(Debug, Clone)]
pub struct SimRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl SimRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        SimRequest { method, uri, headers, body }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn body_json(&self) -> Result<Value, TestwireError> {
        serde_json::from_slice(&self.body).map_err(|e| TestwireError::Parse {
            message: e.to_string(),
            body: self.body_text(),
        })
    }

    // First value of a query parameter, percent-decoded. None when the
    // parameter is absent.
    pub fn parameter(&self, name: &str) -> Option<String> {
        let query = self.uri.query()?;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == name {
                return urlencoding::decode(value).map(|s| s.into_owned()).ok();
            }
        }
        None
    }
}

// Mutable response under construction. Updaters receive it pre-populated and
// overwrite whichever parts they care about.
#[derive(Debug, Clone)]
pub struct SimResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Default for SimResponse {
    fn default() -> Self {
        SimResponse::ok()
    }
}

impl SimResponse {
    pub fn ok() -> Self {
        SimResponse { status: StatusCode::OK, headers: HeaderMap::new(), body: Bytes::new() }
    }

    // Out-of-range codes collapse to 500 rather than failing dispatch
    pub fn with_status(code: u16) -> Self {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        SimResponse { status, headers: HeaderMap::new(), body: Bytes::new() }
    }

    pub fn text(body: &str) -> Self {
        let mut response = SimResponse::ok();
        response.set_text(body);
        response
    }

    pub fn json(value: &Value) -> Self {
        let mut response = SimResponse::ok();
        response.set_json(value);
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, code: u16) {
        self.status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (name.parse::<http::header::HeaderName>(), value.parse()) {
            self.headers.insert(name, value);
        }
    }

    pub fn set_text(&mut self, body: &str) {
        self.headers.insert(CONTENT_TYPE, "text/plain; charset=utf-8".parse().unwrap());
        self.body = Bytes::from(body.to_string());
    }

    pub fn set_json(&mut self, value: &Value) {
        self.headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        self.body = Bytes::from(value.to_string());
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_hyper(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}
