use std::{
    collections::VecDeque,
    io::Write,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use flate2::{write::GzEncoder, Compression};
use futures::stream::{self, StreamExt};
use resilient_http::{
    Backoff, BoxError, BoxFuture, CallOptions, CancellationToken, Client, ClientOptions, Error,
    HookPhase, Jitter, Request, Response, ResponseProcessor, RetryPolicy, Transport,
    DEFAULT_USER_AGENT,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
struct MockResponse {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
    delay: Duration,
    stalls: bool,
}

impl MockResponse {
    fn status(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: Duration::from_millis(0),
            stalls: false,
        }
    }

    fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self::status(status)
            .with_header("content-type", "application/json")
            .with_body(body.to_string().into_bytes())
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sends `body` as the first chunk, then never finishes the stream.
    fn stalling(mut self) -> Self {
        self.stalls = true;
        self
    }
}

#[derive(Clone, Debug)]
struct Recorded {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone)]
struct MockState {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    hits: Arc<AtomicUsize>,
}

async fn handler(
    State(state): State<MockState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state
        .recorded
        .lock()
        .expect("recorded mutex must not be poisoned")
        .push(Recorded {
            method,
            uri,
            headers,
            body,
        });

    let response = {
        let mut queue = state
            .responses
            .lock()
            .expect("response queue mutex must not be poisoned");
        queue.pop_front().unwrap_or_else(|| {
            MockResponse::json(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "no mock response available"}),
            )
        })
    };

    if !response.delay.is_zero() {
        tokio::time::sleep(response.delay).await;
    }

    let mut headers = HeaderMap::new();
    for (name, value) in response.headers {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(&value).expect("valid mock header"),
        );
    }
    let body = if response.stalls {
        let first = stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(response.body)) });
        Body::from_stream(first.chain(stream::pending()))
    } else {
        Body::from(response.body)
    };
    (response.status, headers, body).into_response()
}

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<Recorded>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn recorded(&self) -> Vec<Recorded> {
        self.recorded
            .lock()
            .expect("recorded mutex must not be poisoned")
            .clone()
    }
}

async fn spawn_server(responses: Vec<MockResponse>) -> TestServer {
    let state = MockState {
        responses: Arc::new(Mutex::new(responses.into())),
        recorded: Arc::new(Mutex::new(Vec::new())),
        hits: Arc::new(AtomicUsize::new(0)),
    };

    let app = Router::new().fallback(handler).with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("must bind test listener");
    let address = listener.local_addr().expect("must have local addr");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("mock server must run");
    });

    TestServer {
        base_url: format!("http://{address}"),
        hits: state.hits,
        recorded: state.recorded,
        task,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new().wait(Duration::from_millis(1))
}

#[derive(Debug, Deserialize, PartialEq)]
struct Payload {
    name: String,
    id: u32,
}

#[tokio::test]
async fn sends_user_agent_headers_and_merged_query() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)]).await;
    let client = Client::new();

    let response = client
        .get(
            &server.url("/items?page=1&sort=asc"),
            CallOptions::new()
                .header("X-Trace", "abc")
                .query("page", "2")
                .query("limit", "10"),
        )
        .await
        .expect("request must succeed");
    assert_eq!(response.status(), StatusCode::OK);

    let recorded = server.recorded();
    assert_eq!(recorded.len(), 1);
    let request = &recorded[0];
    assert_eq!(request.method, Method::GET);
    assert_eq!(request.uri.path(), "/items");
    assert_eq!(request.uri.query(), Some("sort=asc&limit=10&page=2"));
    assert_eq!(request.headers["user-agent"], DEFAULT_USER_AGENT);
    assert_eq!(request.headers["x-trace"], "abc");
}

#[tokio::test]
async fn caller_header_overrides_configured_user_agent() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)]).await;
    let client = Client::new().options(ClientOptions {
        user_agent: "configured/1.0".to_owned(),
        ..ClientOptions::default()
    });

    client
        .get(
            &server.url("/"),
            CallOptions::new().header("User-Agent", "caller/2.0"),
        )
        .await
        .expect("request must succeed");

    assert_eq!(server.recorded()[0].headers["user-agent"], "caller/2.0");
}

#[tokio::test]
async fn request_hook_mutates_the_outgoing_request() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)]).await;

    Client::new()
        .get(
            &server.url("/hooked"),
            CallOptions::new().request_hook(|request: &mut Request| -> Result<(), BoxError> {
                request
                    .headers_mut()
                    .insert("authorization", "Bearer token".parse()?);
                Ok(())
            }),
        )
        .await
        .expect("request must succeed");

    assert_eq!(server.recorded()[0].headers["authorization"], "Bearer token");
}

#[tokio::test]
async fn request_hook_error_aborts_before_any_network_call() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)]).await;

    let err = Client::new()
        .get(
            &server.url("/never"),
            CallOptions::new().request_hook(|_: &mut Request| -> Result<(), BoxError> {
                Err("missing credentials".into())
            }),
        )
        .await
        .expect_err("hook must abort");

    match &err {
        Error::Hook { phase, source } => {
            assert_eq!(*phase, HookPhase::Request);
            assert_eq!(source.to_string(), "missing credentials");
        }
        other => panic!("expected request hook error, got {other:?}"),
    }
    assert!(err.to_string().starts_with("failed to execute request hook"));
    assert_eq!(server.hits(), 0);
}

#[tokio::test]
async fn malformed_uri_is_a_construction_error() {
    let err = Client::new()
        .get("not a uri", CallOptions::new())
        .await
        .expect_err("uri must be rejected");

    assert!(matches!(err, Error::Construction(_)));
}

#[tokio::test]
async fn retry_policy_recovers_after_unavailable() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE),
        MockResponse::json(StatusCode::OK, json!({"name": "ok", "id": 5})),
    ])
    .await;

    let response = Client::new()
        .get(
            &server.url("/flaky"),
            CallOptions::new().retry_hook(fast_retry()),
        )
        .await
        .expect("fifth attempt must succeed");

    assert_eq!(response.status(), StatusCode::OK);
    let payload: Payload = response.json().await.expect("json body");
    assert_eq!(payload.id, 5);
    assert_eq!(server.hits(), 5);
}

#[tokio::test]
async fn retry_policy_exhaustion_reports_attempts_and_total_wait() {
    let server = spawn_server(Vec::new()).await;
    let mut policy = RetryPolicy::new().poll_limit(3).backoff(Backoff::new(
        Duration::from_millis(2),
        Duration::from_millis(50),
        Jitter::None,
    ));

    let err = Client::new()
        .get(
            &server.url("/down"),
            CallOptions::new().retry_hook(&mut policy),
        )
        .await
        .expect_err("server never recovers");

    match err {
        Error::RetryPoll(err) => {
            assert_eq!(err.attempts, 3);
            assert_eq!(err.total_wait, Duration::from_millis(4 + 8 + 16));
            assert_eq!(err.method, Method::GET);
            assert_eq!(err.url.path(), "/down");
            assert_eq!(err.last_status, Some(StatusCode::INTERNAL_SERVER_ERROR));
        }
        other => panic!("expected retry poll error, got {other:?}"),
    }
    assert_eq!(server.hits(), 4);
    assert!(policy.backoff_engine().is_some());
}

#[tokio::test]
async fn stalled_rejected_body_is_abandoned_after_drain_timeout() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::SERVICE_UNAVAILABLE)
            .with_body(b"partial".to_vec())
            .stalling(),
        MockResponse::status(StatusCode::OK),
    ])
    .await;
    let policy = fast_retry().drain_timeout(Duration::from_millis(20));

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        Client::new().get(&server.url("/stall"), CallOptions::new().retry_hook(policy)),
    )
    .await
    .expect("drain must give up on the stalled body")
    .expect("second attempt must succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.hits(), 2);
}

#[tokio::test]
async fn retried_post_replays_its_body() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::BAD_GATEWAY),
        MockResponse::status(StatusCode::CREATED),
    ])
    .await;

    let response = Client::new()
        .post(
            &server.url("/jobs"),
            r#"{"name":"POST","id":2}"#,
            CallOptions::new()
                .header("content-type", "application/json")
                .retry_hook(fast_retry()),
        )
        .await
        .expect("retry must succeed");

    assert_eq!(response.status(), StatusCode::CREATED);
    let recorded = server.recorded();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.iter().all(|request| request.method == Method::POST
        && &request.body[..] == br#"{"name":"POST","id":2}"#));
}

#[tokio::test]
async fn retry_hook_takes_precedence_over_response_hook() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)]).await;
    let retry_calls = Arc::new(AtomicUsize::new(0));
    let response_calls = Arc::new(AtomicUsize::new(0));

    let retry_counter = Arc::clone(&retry_calls);
    let response_counter = Arc::clone(&response_calls);
    let response = Client::new()
        .get(
            &server.url("/both"),
            CallOptions::new()
                .response_hook(
                    move |_: &Request, _: &Response| -> Result<(), BoxError> {
                        response_counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                )
                .retry_hook(
                    move |_: Request,
                          outcome: resilient_http::Result<Response>,
                          _: Arc<dyn Transport>|
                          -> BoxFuture<'static, resilient_http::Result<Response>> {
                        retry_counter.fetch_add(1, Ordering::SeqCst);
                        Box::pin(async move { outcome })
                    },
                ),
        )
        .await
        .expect("retry hook returns the first outcome");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(retry_calls.load(Ordering::SeqCst), 1);
    assert_eq!(response_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn response_hook_error_discards_the_response() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::ACCEPTED)]).await;

    let err = Client::new()
        .get(
            &server.url("/reject"),
            CallOptions::new().response_hook(
                |_: &Request, response: &Response| -> Result<(), BoxError> {
                    Err(format!("unexpected status {}", response.status()).into())
                },
            ),
        )
        .await
        .expect_err("hook must fail the call");

    match err {
        Error::Hook { phase, source } => {
            assert_eq!(phase, HookPhase::Response);
            assert!(source.to_string().contains("202"));
        }
        other => panic!("expected response hook error, got {other:?}"),
    }
}

#[tokio::test]
async fn response_processor_decodes_gzip_json() {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(json!({"name": "GET", "id": 1}).to_string().as_bytes())
        .expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");

    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)
        .with_header("content-type", "application/json")
        .with_header("content-encoding", "gzip")
        .with_body(compressed)])
    .await;

    let transport = reqwest::Client::builder()
        .no_gzip()
        .build()
        .expect("transport must build");
    let mut processor = ResponseProcessor::<Payload>::new()
        .decompress(true)
        .auto_parse(true);

    let response = Client::with_transport(transport)
        .get(
            &server.url("/compressed"),
            CallOptions::new().response_hook(&mut processor),
        )
        .await
        .expect("request must succeed");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        processor.take_body(),
        Some(Payload {
            name: "GET".to_owned(),
            id: 1
        })
    );
}

#[tokio::test]
async fn response_processor_error_surfaces_as_response_hook_error() {
    let server = spawn_server(vec![MockResponse::status(StatusCode::OK)
        .with_header("content-encoding", "br")
        .with_body(b"opaque".to_vec())])
    .await;

    let transport = reqwest::Client::builder()
        .no_brotli()
        .build()
        .expect("transport must build");
    let err = Client::with_transport(transport)
        .get(
            &server.url("/brotli"),
            CallOptions::new().response_hook(ResponseProcessor::<Payload>::new().decompress(true)),
        )
        .await
        .expect_err("br without decompressor must fail");

    assert!(matches!(
        err.hook_cause(),
        Some(Error::MissingDecompressor(algorithm)) if algorithm == "br"
    ));
}

#[tokio::test]
async fn call_timeout_surfaces_transport_error() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::OK).with_delay(Duration::from_millis(300))
    ])
    .await;

    let err = Client::new()
        .get(
            &server.url("/slow"),
            CallOptions::new().timeout(Duration::from_millis(20)),
        )
        .await
        .expect_err("request must time out");

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
}

#[tokio::test]
async fn cancellation_fails_the_in_flight_call() {
    let server = spawn_server(vec![
        MockResponse::status(StatusCode::OK).with_delay(Duration::from_secs(5))
    ])
    .await;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let err = Client::new()
        .get(&server.url("/hang"), CallOptions::new().cancel_token(token))
        .await
        .expect_err("call must be cancelled");

    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn cancellation_is_evaluated_by_the_retry_condition() -> anyhow::Result<()> {
    let server = spawn_server(Vec::new()).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = Client::new()
        .get(
            &server.url("/cancelled"),
            CallOptions::new()
                .cancel_token(token)
                .retry_hook(fast_retry().poll_limit(2)),
        )
        .await
        .expect_err("cancelled attempts are rejected");

    let err = match err {
        Error::RetryPoll(err) => err,
        other => anyhow::bail!("expected retry poll error, got {other:?}"),
    };
    assert_eq!(err.attempts, 2);
    assert!(matches!(err.last_error.as_deref(), Some(Error::Cancelled)));
    assert_eq!(server.hits(), 0);
    Ok(())
}
