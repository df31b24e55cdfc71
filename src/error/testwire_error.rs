use std::fmt;

// Error taxonomy of the communication core. Everything propagates to the
// immediate caller; there are no internal retries.
#[derive(Debug)]
pub enum TestwireError {
    // Socket/DNS/connect failures, always fatal to the single call
    Connection(String),
    // Trust/identity material failed to load, raised before any network I/O
    Tls(String),
    // Non-2xx response; body is preserved verbatim so tests can assert on it
    HttpStatus { code: u16, body: String },
    // Server side: no handler for a path, or no matching response rule
    Dispatch(String),
    // Response body could not be decoded into the requested form
    Parse { message: String, body: String },
}

impl TestwireError {
    pub fn connection<E: fmt::Display>(e: E) -> Self {
        TestwireError::Connection(e.to_string())
    }

    pub fn tls<E: fmt::Display>(e: E) -> Self {
        TestwireError::Tls(e.to_string())
    }

    // HTTP status code carried by this error, if any
    pub fn http_code(&self) -> Option<u16> {
        match self {
            TestwireError::HttpStatus { code, .. } => Some(*code),
            _ => None,
        }
    }

    // Matches an HttpStatus error against an expected code and a body fragment.
    // Code 0 matches any code, an empty fragment matches any body.
    pub fn matches_http(&self, code: u16, fragment: &str) -> bool {
        match self {
            TestwireError::HttpStatus { code: c, body } => {
                (code == 0 || *c == code) && (fragment.is_empty() || body.contains(fragment))
            }
            _ => false,
        }
    }
}

impl fmt::Display for TestwireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestwireError::Connection(msg) => write!(f, "connection error: {}", msg),
            TestwireError::Tls(msg) => write!(f, "TLS error: {}", msg),
            TestwireError::HttpStatus { code, body } => write!(f, "HTTP {}: {}", code, body),
            TestwireError::Dispatch(msg) => write!(f, "dispatch error: {}", msg),
            TestwireError::Parse { message, body } => write!(f, "parse error: {} (body: {})", message, body),
        }
    }
}

impl std::error::Error for TestwireError {}

impl From<std::io::Error> for TestwireError {
    fn from(e: std::io::Error) -> Self {
        TestwireError::Connection(e.to_string())
    }
}

impl From<hyper::Error> for TestwireError {
    fn from(e: hyper::Error) -> Self {
        TestwireError::Connection(e.to_string())
    }
}

impl From<hyper_util::client::legacy::Error> for TestwireError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        TestwireError::Connection(e.to_string())
    }
}

impl From<http::Error> for TestwireError {
    fn from(e: http::Error) -> Self {
        TestwireError::Connection(e.to_string())
    }
}

impl From<rustls::Error> for TestwireError {
    fn from(e: rustls::Error) -> Self {
        TestwireError::Tls(e.to_string())
    }
}
