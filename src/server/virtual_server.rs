use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use http::Method;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use log::{debug, info, trace, warn};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::comm::web_service_client::get_uri;
use crate::error::testwire_error::TestwireError;
use crate::server::endpoint_handler::{EndpointHandler, ResponseRules, ResponseUpdater};
use crate::server::request_response::{SimRequest, SimResponse};

pub const DEFAULT_PORT: u16 = 10080;
pub const SHUTDOWN_ENDPOINT: &str = "/shutdown";

const SERVER_NAME: &str = concat!("testwire/", env!("CARGO_PKG_VERSION"));

const STATE_UNSTARTED: u8 = 0;
const STATE_LISTENING: u8 = 1;
const STATE_SHUTTING_DOWN: u8 = 2;
const STATE_STOPPED: u8 = 3;

type HandlerMap = Arc<RwLock<HashMap<String, Arc<dyn EndpointHandler>>>>;

// Programmable in-process HTTP server. Handlers own one path each; the
// reactor collects the request body, routes by exact path, and turns handler
// failures into 500s so a buggy updater never takes the server down.
pub struct VirtualServer {
    port: u16,
    state: Arc<AtomicU8>,
    bound_addr: StdMutex<Option<SocketAddr>>,
    handlers: HandlerMap,
    token: CancellationToken,
    accept_task: StdMutex<Option<JoinHandle<()>>>,
    grace: Duration,
}

impl VirtualServer {
    // Port 0 binds an ephemeral port, reported by start()
    pub fn new(port: u16) -> Self {
        VirtualServer {
            port,
            state: Arc::new(AtomicU8::new(STATE_UNSTARTED)),
            bound_addr: StdMutex::new(None),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            token: CancellationToken::new(),
            accept_task: StdMutex::new(None),
            grace: Duration::from_secs(5),
        }
    }

    pub fn set_grace_period(&mut self, grace: Duration) {
        self.grace = grace;
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }

    // Registers a handler under its endpoint path. Double registration of a
    // path is a test-setup bug and is rejected.
    pub async fn register(&self, handler: Arc<dyn EndpointHandler>) -> Result<(), TestwireError> {
        let endpoint = handler.endpoint().to_string();
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&endpoint) {
            return Err(TestwireError::Dispatch(format!("endpoint {} already registered", endpoint)));
        }
        debug!("register handler {} at {}", handler.name(), endpoint);
        handlers.insert(endpoint, handler);
        Ok(())
    }

    pub async fn unregister(&self, endpoint: &str) -> bool {
        if endpoint == SHUTDOWN_ENDPOINT {
            return false;
        }
        self.handlers.write().await.remove(endpoint).is_some()
    }

    // Drops every handler except the shutdown endpoint
    pub async fn reset(&self) {
        let mut handlers = self.handlers.write().await;
        handlers.retain(|endpoint, _| endpoint == SHUTDOWN_ENDPOINT);
        debug!("server reset, handlers remaining: {}", handlers.len());
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    // Binds the listener and spawns the accept loop. The shutdown endpoint is
    // installed before anything else so the server is always stoppable.
    pub async fn start(&self) -> Result<SocketAddr, TestwireError> {
        self.state
            .compare_exchange(STATE_UNSTARTED, STATE_LISTENING, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| TestwireError::Dispatch("server already started".to_string()))?;

        {
            let mut handlers = self.handlers.write().await;
            handlers.insert(
                SHUTDOWN_ENDPOINT.to_string(),
                Arc::new(ShutdownEndpoint::new(self.token.clone())) as Arc<dyn EndpointHandler>,
            );
        }

        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        let addr = listener.local_addr()?;
        *self.bound_addr.lock().unwrap() = Some(addr);
        info!("listening on {}", addr);

        let handlers = Arc::clone(&self.handlers);
        let token = self.token.clone();
        let state = Arc::clone(&self.state);
        let grace = self.grace;

        let task = tokio::spawn(async move {
            let tracker = TaskTracker::new();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("shutdown requested");
                        break;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("accept failed: {}", e);
                                continue;
                            }
                        };
                        trace!("connection from {}", peer);
                        let handlers = Arc::clone(&handlers);
                        let conn_token = token.clone();
                        tracker.spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |request| {
                                dispatch(request, Arc::clone(&handlers))
                            });
                            let conn = http1::Builder::new()
                                .timer(TokioTimer::new())
                                .header_read_timeout(Duration::from_secs(30))
                                .serve_connection(io, service);
                            tokio::pin!(conn);
                            let result = tokio::select! {
                                result = conn.as_mut() => result,
                                _ = conn_token.cancelled() => {
                                    // finish the in-flight exchange, then close
                                    conn.as_mut().graceful_shutdown();
                                    conn.as_mut().await
                                }
                            };
                            if let Err(e) = result {
                                trace!("connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                }
            }
            state.store(STATE_SHUTTING_DOWN, Ordering::SeqCst);
            drop(listener);
            tracker.close();
            if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
                warn!("grace period expired with connections still open");
            }
            state.store(STATE_STOPPED, Ordering::SeqCst);
            info!("server stopped");
        });
        *self.accept_task.lock().unwrap() = Some(task);

        Ok(addr)
    }

    pub fn is_listening(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_LISTENING
    }

    pub fn is_stopped(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_STOPPED
    }

    // Stops the server the same way an external client would, by calling its
    // own shutdown endpoint. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<(), TestwireError> {
        if self.state.load(Ordering::SeqCst) != STATE_LISTENING {
            return Ok(());
        }
        let Some(addr) = self.bound_addr() else {
            return Ok(());
        };
        let uri = format!("http://127.0.0.1:{}{}", addr.port(), SHUTDOWN_ENDPOINT);
        match get_uri(&uri).await {
            Ok(body) => debug!("shutdown endpoint answered: {}", body),
            // The listener may close before the response is written
            Err(e) => debug!("shutdown call: {}", e),
        }
        self.join().await;
        Ok(())
    }

    // In-process shutdown, without going through the socket
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    // Waits until the accept loop and all in-flight connections finish
    pub async fn join(&self) {
        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn dispatch(request: Request<Incoming>, handlers: HandlerMap) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("body read failed: {}", e);
            return Ok(plain_response(400, &format!("bad request body: {}", e)));
        }
    };

    let path = parts.uri.path().to_string();
    let handler = handlers.read().await.get(&path).cloned();
    let Some(handler) = handler else {
        debug!("no handler for {}", path);
        return Ok(plain_response(500, &format!("no endpoint handler for {}", path)));
    };

    let sim_request = SimRequest::new(parts.method.clone(), parts.uri, parts.headers, body);
    let mut sim_response = SimResponse::ok();

    let result = match parts.method {
        Method::GET | Method::HEAD => handler.handle_get(&sim_request, &mut sim_response),
        Method::POST => handler.handle_post(&sim_request, &mut sim_response),
        Method::PUT => handler.handle_put(&sim_request, &mut sim_response),
        Method::DELETE => handler.handle_delete(&sim_request, &mut sim_response),
        other => {
            trace!("{} {} not supported", other, path);
            return Ok(plain_response(501, &format!("{} not supported", other)));
        }
    };

    let mut response = match result {
        Ok(()) => {
            if parts.method == Method::HEAD {
                sim_response.set_body(Bytes::new());
            }
            sim_response.into_hyper()
        }
        Err(e) => {
            warn!("handler {} failed on {} {}: {}", handler.name(), parts.method, path, e);
            plain_response(500, &e.to_string())
        }
    };
    response.headers_mut().insert(http::header::SERVER, SERVER_NAME.parse().unwrap());
    Ok(response)
}

fn plain_response(code: u16, body: &str) -> Response<Full<Bytes>> {
    let mut response = SimResponse::with_status(code);
    response.set_text(body);
    response.into_hyper()
}

// GET cancels the server token and acknowledges; every other verb answers
// 406, keeping casual crawlers from stopping the server by accident.
struct ShutdownEndpoint {
    rules: StdMutex<ResponseRules>,
    token: CancellationToken,
}

impl ShutdownEndpoint {
    fn new(token: CancellationToken) -> Self {
        ShutdownEndpoint { rules: StdMutex::new(ResponseRules::new()), token }
    }

    fn not_acceptable(response: &mut SimResponse) {
        response.set_status(406);
        response.set_text("shutdown must be requested with GET");
    }
}

impl EndpointHandler for ShutdownEndpoint {
    fn endpoint(&self) -> &str {
        SHUTDOWN_ENDPOINT
    }

    fn rules(&self) -> &StdMutex<ResponseRules> {
        &self.rules
    }

    fn handle_get(&self, request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        if request.method() != Method::GET {
            ShutdownEndpoint::not_acceptable(response);
            return Ok(());
        }
        info!("shutdown requested by client");
        self.token.cancel();
        response.set_text("shutting down");
        Ok(())
    }

    fn handle_post(&self, _request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        ShutdownEndpoint::not_acceptable(response);
        Ok(())
    }

    fn handle_put(&self, _request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        ShutdownEndpoint::not_acceptable(response);
        Ok(())
    }

    fn handle_delete(&self, _request: &SimRequest, response: &mut SimResponse) -> Result<(), TestwireError> {
        ShutdownEndpoint::not_acceptable(response);
        Ok(())
    }
}

// Convenience for registering a single-rule endpoint in one call
pub async fn register_rule(
    server: &VirtualServer,
    endpoint: &str,
    pattern: &str,
    updater: ResponseUpdater,
) -> Result<(), TestwireError> {
    let simulated = crate::server::endpoint_handler::SimulatedEndpoint::with_rule(endpoint, pattern, updater)?;
    server.register(Arc::new(simulated)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::endpoint_handler::SimulatedEndpoint;

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let server = VirtualServer::new(0);
        server.register(Arc::new(SimulatedEndpoint::new("/a"))).await.unwrap();
        let err = server.register(Arc::new(SimulatedEndpoint::new("/a"))).await.unwrap_err();
        assert!(matches!(err, TestwireError::Dispatch(_)));
    }

    #[tokio::test]
    async fn test_reset_keeps_shutdown_endpoint() {
        let server = VirtualServer::new(0);
        server.start().await.unwrap();
        server.register(Arc::new(SimulatedEndpoint::new("/a"))).await.unwrap();
        server.register(Arc::new(SimulatedEndpoint::new("/b"))).await.unwrap();
        assert_eq!(server.handler_count().await, 3);

        server.reset().await;
        assert_eq!(server.handler_count().await, 1);
        assert!(!server.unregister(SHUTDOWN_ENDPOINT).await);

        server.trigger_shutdown();
        server.join().await;
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = VirtualServer::new(0);
        server.start().await.unwrap();
        assert!(server.start().await.is_err());
        server.trigger_shutdown();
        server.join().await;
        assert!(server.is_stopped());
    }
}
