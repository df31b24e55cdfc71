use log::{debug, trace};
use std::sync::Mutex;
use wildcard::{Wildcard, WildcardBuilder};

use crate::error::testwire_error::TestwireError;
use crate::server::request_response::{SimRequest, SimResponse};

// Mutates the prepared response for one matched request. Updaters run on the
// dispatch path and must not block.
pub type ResponseUpdater = Box<dyn Fn(&SimRequest, &mut SimResponse) -> Result<(), TestwireError> + Send + Sync>;

struct Rule {
    pattern: String,
    wildcard: Wildcard<'static>,
    updater: ResponseUpdater,
}

// Ordered pattern -> updater table for one endpoint. Patterns are wildcard
// expressions matched against the request path plus query string; the first
// match wins, in insertion order.
#[derive(Default)]
pub struct ResponseRules {
    rules: Vec<Rule>,
}

impl ResponseRules {
    pub fn new() -> Self {
        ResponseRules::default()
    }

    // Registers an updater for a wildcard pattern. A pattern registered twice
    // keeps its original position but runs the new updater.
    pub fn put(&mut self, pattern: &str, updater: ResponseUpdater) -> Result<(), TestwireError> {
        // Patterns outlive every request, leaking keeps them 'static
        let static_str: &'static str = Box::leak(pattern.to_string().into_boxed_str());
        let wildcard = WildcardBuilder::new(static_str.as_bytes())
            .case_insensitive(true)
            .build()
            .map_err(|e| TestwireError::Dispatch(format!("invalid pattern '{}': {}", pattern, e)))?;

        if let Some(rule) = self.rules.iter_mut().find(|r| r.pattern == pattern) {
            rule.updater = updater;
        } else {
            self.rules.push(Rule { pattern: pattern.to_string(), wildcard, updater });
        }
        Ok(())
    }

    pub fn remove(&mut self, pattern: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.pattern != pattern);
        self.rules.len() != before
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    // Runs the first updater whose pattern matches the request target. No
    // registered rules, or no matching rule, is a configuration bug and
    // surfaces as a Dispatch error rather than a silent 200.
    pub fn apply_first_match(&self, request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        let target = match request.uri().query() {
            Some(query) => format!("{}?{}", request.path(), query),
            None => request.path().to_string(),
        };
        for rule in &self.rules {
            if rule.wildcard.is_match(target.as_bytes()) {
                trace!("{} matched pattern {}", target, rule.pattern);
                return (rule.updater)(request, response);
            }
        }
        Err(TestwireError::Dispatch(format!("no response rule matches {}", target)))
    }
}

// Programmable behavior of one simulated endpoint path. GET dispatches
// through the rule table; other verbs answer 501 until overridden.
pub trait EndpointHandler: Send + Sync {
    // Path this handler owns, e.g. "/inventory"
    fn endpoint(&self) -> &str;

    fn name(&self) -> &str {
        self.endpoint()
    }

    fn rules(&self) -> &Mutex<ResponseRules>;

    fn handle_get(&self, request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        self.rules().lock().unwrap().apply_first_match(request, response)
    }

    fn handle_post(&self, _request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        response.set_status(501);
        response.set_text("not implemented yet");
        Ok(())
    }

    fn handle_put(&self, _request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        response.set_status(501);
        response.set_text("not implemented yet");
        Ok(())
    }

    fn handle_delete(&self, _request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        response.set_status(501);
        response.set_text("not implemented yet");
        Ok(())
    }

    // Drops every registered rule, returning the handler to its pristine state
    fn reset(&self) {
        debug!("reset rules of {}", self.name());
        self.rules().lock().unwrap().clear();
    }
}

// Plain rule-table endpoint for tests that only need GET programmability.
// Richer behavior comes from implementing EndpointHandler directly.
pub struct SimulatedEndpoint {
    endpoint: String,
    rules: Mutex<ResponseRules>,
}

impl SimulatedEndpoint {
    pub fn new(endpoint: &str) -> Self {
        SimulatedEndpoint { endpoint: endpoint.to_string(), rules: Mutex::new(ResponseRules::new()) }
    }

    pub fn with_rule(endpoint: &str, pattern: &str, updater: ResponseUpdater) -> Result<Self, TestwireError> {
        let simulated = SimulatedEndpoint::new(endpoint);
        simulated.rules.lock().unwrap().put(pattern, updater)?;
        Ok(simulated)
    }

    pub fn put_rule(&self, pattern: &str, updater: ResponseUpdater) -> Result<(), TestwireError> {
        self.rules.lock().unwrap().put(pattern, updater)
    }

    pub fn remove_rule(&self, pattern: &str) -> bool {
        self.rules.lock().unwrap().remove(pattern)
    }
}

impl EndpointHandler for SimulatedEndpoint {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn rules(&self) -> &Mutex<ResponseRules> {
        &self.rules
    }
}
