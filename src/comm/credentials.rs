use std::collections::HashMap;
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use log::debug;

use crate::comm::destination::Destination;

#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn username(&self) -> &str {
        &self.username
    }

    // "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ=="
    pub fn authorization_value(&self) -> String {
        let credentials = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(credentials.as_bytes()))
    }
}

// Client certificate material for mutual TLS: a PKCS#12 keystore or a PEM
// bundle on disk, plus the password protecting it.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub certificate: PathBuf,
    pub password: String,
}

// Optional basic-auth and client-certificate credentials, owned exclusively by
// one client instance. Never a process-wide singleton: credentials are sent to
// whatever destination the owning client points at.
#[derive(Debug, Default)]
pub struct CredentialStore {
    basic: Option<BasicAuth>,
    identity: Option<ClientIdentity>,
    // Destination -> precomputed Authorization header, so the first request
    // already carries credentials instead of waiting for a 401 challenge
    preemptive: HashMap<Destination, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        CredentialStore::default()
    }

    pub fn set_basic_auth(&mut self, username: &str, password: &str) {
        debug!("use basic username/password {}/********", username);
        self.basic = Some(BasicAuth { username: username.to_string(), password: password.to_string() });
    }

    pub fn set_client_certificate(&mut self, certificate: &str, password: &str) {
        debug!("use client certificate/password {}/********", certificate);
        self.identity = Some(ClientIdentity { certificate: PathBuf::from(certificate), password: password.to_string() });
    }

    pub fn basic(&self) -> Option<&BasicAuth> {
        self.basic.as_ref()
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    // Populates the preemptive auth cache for the destination. Called from
    // connect(), before any request goes out.
    pub fn prime(&mut self, destination: &Destination) {
        if let Some(basic) = &self.basic {
            self.preemptive.insert(destination.clone(), basic.authorization_value());
        }
    }

    pub fn preemptive_header(&self, destination: &Destination) -> Option<&str> {
        self.preemptive.get(destination).map(|s| s.as_str())
    }
}
