use std::net::SocketAddr;
use std::sync::Arc;

use testwire::comm::pool::PoolConfig;
use testwire::comm::web_service_client::{self, WebServiceClient};
use testwire::error::testwire_error::TestwireError;
use testwire::server::endpoint_handler::SimulatedEndpoint;
use testwire::server::virtual_server::VirtualServer;

async fn start_server() -> (Arc<VirtualServer>, SocketAddr) {
    let server = Arc::new(VirtualServer::new(0));
    let addr = server.start().await.expect("server should bind an ephemeral port");
    (server, addr)
}

async fn register_text_rule(server: &VirtualServer, endpoint: &str, body: &'static str) {
    let simulated = SimulatedEndpoint::new(endpoint);
    let pattern = format!("{}*", endpoint);
    simulated
        .put_rule(&pattern, Box::new(move |_, response| {
            response.set_text(body);
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();
}

#[tokio::test]
async fn test_get_returns_body_on_2xx() {
    let (server, addr) = start_server().await;
    register_text_rule(&server, "/status", "all good").await;

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();
    assert!(client.is_connected().await);

    assert_eq!(client.get("/status").await.unwrap(), "all good");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnect_is_safe() {
    let (server, addr) = start_server().await;
    register_text_rule(&server, "/status", "ok").await;

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();
    assert_eq!(client.get("/status").await.unwrap(), "ok");

    client.connect().await.unwrap();
    assert_eq!(client.get("/status").await.unwrap(), "ok");

    client.disconnect().await;
    let err = client.get("/status").await.unwrap_err();
    assert!(matches!(err, TestwireError::Connection(_)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_preemptive_basic_auth_is_sent() {
    let (server, addr) = start_server().await;
    let simulated = SimulatedEndpoint::new("/private");
    simulated
        .put_rule("/private*", Box::new(|request, response| {
            match request.header("authorization") {
                Some(value) if value.starts_with("Basic ") => response.set_text(value),
                _ => {
                    response.set_status(401);
                    response.set_text("credentials required");
                }
            }
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.set_basic_auth("Aladdin", "open sesame");
    client.connect().await.unwrap();

    // the very first request already carries the header, no 401 round trip
    let echoed = client.get("/private").await.unwrap();
    assert_eq!(echoed, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_default_headers_are_replayed() {
    let (server, addr) = start_server().await;
    let simulated = SimulatedEndpoint::new("/headers");
    simulated
        .put_rule("/headers*", Box::new(|request, response| {
            response.set_text(request.header("x-test-run").unwrap_or("absent"));
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.set_header("x-test-run", "run-17");
    client.connect().await.unwrap();

    assert_eq!(client.get("/headers").await.unwrap(), "run-17");
    assert_eq!(client.get("/headers").await.unwrap(), "run-17");

    assert_eq!(client.remove_header("x-test-run").as_deref(), Some("run-17"));
    assert_eq!(client.get("/headers").await.unwrap(), "absent");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_cookies_are_stored_and_replayed() {
    let (server, addr) = start_server().await;
    let simulated = SimulatedEndpoint::new("/session");
    simulated
        .put_rule("/session*", Box::new(|request, response| {
            match request.header("cookie") {
                Some(cookie) => response.set_text(cookie),
                None => {
                    response.set_header("set-cookie", "session=alpha; Path=/");
                    response.set_text("cookie issued");
                }
            }
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();

    assert_eq!(client.get("/session").await.unwrap(), "cookie issued");
    assert_eq!(client.cookies().await.len(), 1);

    // the second request replays the stored cookie
    assert_eq!(client.get("/session").await.unwrap(), "session=alpha");

    client.clear_cookies().await;
    assert_eq!(client.get("/session").await.unwrap(), "cookie issued");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_response_time_ledger() {
    let (server, addr) = start_server().await;
    register_text_rule(&server, "/timed", "done").await;

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();
    let client = Arc::new(client);

    let mut ids = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let id = web_service_client::next_request_id();
        ids.push(id.clone());
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            client.get_with("/timed", "", &id).await
        }));
    }
    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), "done");
    }

    for id in &ids {
        assert!(client.response_time(id).is_some(), "missing ledger entry for {}", id);
    }

    // blank ids never reach the ledger
    client.get_with("/timed", "", "").await.unwrap();
    client.get_with("/timed", "", "  ").await.unwrap();
    assert!(client.response_time("").is_none());
    assert!(client.response_time("  ").is_none());

    let first = &ids[0];
    assert!(client.clear_response_time(first).is_some());
    assert!(client.response_time(first).is_none());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_requests_queue_on_pool_caps() {
    let (server, addr) = start_server().await;
    register_text_rule(&server, "/capped", "through").await;

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.set_pool_config(PoolConfig {
        max_per_route: 2,
        max_for_destination: 2,
        ..PoolConfig::default()
    });
    client.connect().await.unwrap();
    let client = Arc::new(client);

    // four times the cap; excess requests wait for a permit instead of failing
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move { client.get("/capped").await }));
    }
    for result in futures::future::join_all(tasks).await {
        assert_eq!(result.unwrap().unwrap(), "through");
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_query_parameters_reach_the_handler() {
    let (server, addr) = start_server().await;
    let simulated = SimulatedEndpoint::new("/search");
    simulated
        .put_rule("/search*", Box::new(|request, response| {
            let q = request.parameter("q").unwrap_or_default();
            response.set_text(&q);
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();

    let query = format!("q={}", web_service_client::encode("hello world"));
    assert_eq!(client.get_with("/search", &query, "").await.unwrap(), "hello world");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_one_shot_helpers() {
    let (server, addr) = start_server().await;
    register_text_rule(&server, "/ping", "pong").await;

    let uri = format!("http://127.0.0.1:{}/ping", addr.port());
    assert_eq!(web_service_client::get_uri(&uri).await.unwrap(), "pong");

    let headers = web_service_client::head_uri(&uri).await.unwrap();
    assert!(headers.get("server").is_some());

    let server_header = web_service_client::head_uri_header(&uri, "server").await.unwrap();
    assert!(server_header.unwrap().starts_with("testwire/"));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_redirects_are_followed() {
    let (server, addr) = start_server().await;
    let simulated = SimulatedEndpoint::new("/old");
    simulated
        .put_rule("/old*", Box::new(|_, response| {
            response.set_status(302);
            response.set_header("location", "/new");
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();
    register_text_rule(&server, "/new", "moved here").await;

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();

    assert_eq!(client.get("/old").await.unwrap(), "moved here");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_redirect_loop_is_bounded() {
    let (server, addr) = start_server().await;
    let simulated = SimulatedEndpoint::new("/loop");
    simulated
        .put_rule("/loop*", Box::new(|_, response| {
            response.set_status(302);
            response.set_header("location", "/loop");
            Ok(())
        }))
        .unwrap();
    server.register(Arc::new(simulated)).await.unwrap();

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();

    let err = client.get("/loop").await.unwrap_err();
    assert!(matches!(err, TestwireError::Connection(_)));

    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_json_parse_failure_is_parse_error() {
    let (server, addr) = start_server().await;
    register_text_rule(&server, "/notjson", "plain text, sorry").await;

    let mut client = WebServiceClient::new("127.0.0.1", addr.port());
    client.connect().await.unwrap();

    let err = client.get_json("/notjson").await.unwrap_err();
    match err {
        TestwireError::Parse { body, .. } => assert_eq!(body, "plain text, sorry"),
        other => panic!("expected parse error, got {}", other),
    }

    server.stop().await.unwrap();
}
