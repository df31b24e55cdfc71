use std::collections::HashMap;

use http::HeaderMap;
use http::header::SET_COOKIE;
use log::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

impl Cookie {
    // Parses a Set-Cookie header value. Attributes other than Domain and Path
    // are ignored; the jar lives only as long as the client instance.
    fn parse(header: &str, default_domain: &str) -> Option<Cookie> {
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut domain = default_domain.to_string();
        let mut path = "/".to_string();
        for attr in parts {
            if let Some((attr_name, attr_value)) = attr.split_once('=') {
                match attr_name.trim().to_ascii_lowercase().as_str() {
                    "domain" => domain = attr_value.trim().to_string(),
                    "path" => path = attr_value.trim().to_string(),
                    _ => {}
                }
            }
        }

        Some(Cookie { name: name.to_string(), value: value.trim().to_string(), domain, path })
    }
}

// Cookies returned by the server under test, keyed by (name, domain, path).
// Mutated by every response, replayed on every request, for the lifetime of
// the owning client instance.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: HashMap<(String, String, String), Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        CookieJar::default()
    }

    pub fn store_from_response(&mut self, headers: &HeaderMap, default_domain: &str) {
        for header in headers.get_all(SET_COOKIE) {
            let Ok(raw) = header.to_str() else { continue };
            if let Some(cookie) = Cookie::parse(raw, default_domain) {
                trace!("incoming {}={} {} {}", cookie.name, cookie.value, cookie.domain, cookie.path);
                let key = (cookie.name.clone(), cookie.domain.clone(), cookie.path.clone());
                self.cookies.insert(key, cookie);
            }
        }
    }

    // Value for the outgoing Cookie header, or None when the jar is empty
    pub fn request_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs: Vec<String> = self.cookies.values().map(|c| {
            trace!("outgoing {}={} {} {}", c.name, c.value, c.domain, c.path);
            format!("{}={}", c.name, c.value)
        }).collect();
        Some(pairs.join("; "))
    }

    pub fn cookies(&self) -> Vec<&Cookie> {
        self.cookies.values().collect()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }
}
