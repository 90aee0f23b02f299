//! HTTP+SSE adapter against local hub stand-ins
//!
//! Finite SSE bodies are served with wiremock; the long-lived stream test
//! runs a small warp hub so the return channel stays open.

use hubconnect::config::{ClientConfig, Credentials};
use hubconnect::correlation::CorrelationRegistry;
use hubconnect::transport::http::HttpSseTransport;
use hubconnect::transport::{Dispatcher, Transport, TransportEvent};
use hubconnect::{
    request_handler_fn, FormProvider, HubError, NotificationMessage, RequestMessage,
    RequestStatus, ResponseMessage, TdFormStore, OP_INVOKE_ACTION, OP_PUBLISH_EVENT,
};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    transport: HttpSseTransport,
    registry: Arc<CorrelationRegistry>,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

fn harness(hub_url: &str) -> Harness {
    harness_with_forms(hub_url, None)
}

fn harness_with_forms(hub_url: &str, forms: Option<Arc<dyn FormProvider>>) -> Harness {
    let registry = Arc::new(CorrelationRegistry::default());
    let dispatcher = Dispatcher::new("consumer1", registry.clone());
    let (tx, events) = mpsc::unbounded_channel();
    let config = Arc::new(ClientConfig::new("consumer1", hub_url));
    let transport = HttpSseTransport::new(config, dispatcher.clone(), tx, forms).unwrap();
    Harness {
        transport,
        registry,
        dispatcher,
        events,
    }
}

fn password() -> Credentials {
    Credentials::Password {
        client_id: "consumer1".to_string(),
        password: "secret".to_string(),
    }
}

async fn mount_login(server: &MockServer, token: &str) {
    Mock::given(method("POST"))
        .and(path("/authn/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(token)))
        .mount(server)
        .await;
}

fn sse_body(events: &[(&str, String)]) -> String {
    events
        .iter()
        .map(|(name, data)| format!("event: {name}\ndata: {data}\n\n"))
        .collect()
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_login_then_sse_stream_with_bearer_and_cid() {
    // Arrange
    let server = MockServer::start().await;
    mount_login(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/hiveot/sse"))
        .and(header("authorization", "bearer tok-1"))
        .and(header_exists("cid"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(": hello\n\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    let mut h = harness(&server.uri());

    // Act
    let token = h.transport.connect(&password()).await.unwrap();

    // Assert
    assert_eq!(token.as_deref(), Some("tok-1"));
    assert_eq!(h.transport.token().as_deref(), Some("tok-1"));
    assert!(h.transport.connection_id().starts_with("http-"));
    assert!(matches!(next_event(&mut h.events).await, TransportEvent::Closed { .. }));
}

#[tokio::test]
async fn test_response_event_resolves_pending_request() {
    let server = MockServer::start().await;
    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
        .with_correlation_id("c-7");
    let reply = request.create_response(Some(json!({"on": true})), None);
    let data = String::from_utf8(reply.to_json().unwrap()).unwrap();
    Mock::given(method("GET"))
        .and(path("/hiveot/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(&[("ping", String::new()), ("response", data)])),
        )
        .mount(&server)
        .await;
    let h = harness(&server.uri());
    let pending = h.registry.register("c-7", None, None).unwrap();

    h.transport
        .connect(&Credentials::Token {
            client_id: "consumer1".to_string(),
            token: "tok-1".to_string(),
        })
        .await
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(2), pending.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status, RequestStatus::Completed);
    assert_eq!(response.output, Some(json!({"on": true})));
    assert!(!h.registry.has("c-7"));
}

#[tokio::test]
async fn test_close_event_reports_session_end() {
    let server = MockServer::start().await;
    mount_login(&server, "tok-1").await;
    Mock::given(method("GET"))
        .and(path("/hiveot/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string("event: close\ndata:\n\n"),
        )
        .mount(&server)
        .await;
    let mut h = harness(&server.uri());

    h.transport.connect(&password()).await.unwrap();

    match next_event(&mut h.events).await {
        TransportEvent::Closed { reason } => assert_eq!(reason, "closed by hub"),
    }
    assert!(!h.transport.is_connected());
}

#[tokio::test]
async fn test_rejected_login_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/authn/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let result = h.transport.connect(&password()).await;

    assert!(matches!(result, Err(HubError::Unauthorized(_))));
    assert!(!h.transport.is_connected());
}

#[tokio::test]
async fn test_rejected_sse_stream_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hiveot/sse"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let h = harness(&server.uri());

    let result = h
        .transport
        .connect(&Credentials::Token {
            client_id: "consumer1".to_string(),
            token: "expired".to_string(),
        })
        .await;

    assert!(matches!(result, Err(HubError::Unauthorized(_))));
}

#[tokio::test]
async fn test_anonymous_credentials_are_refused() {
    let h = harness("http://127.0.0.1:9");

    let result = h
        .transport
        .connect(&Credentials::Anonymous {
            client_id: "consumer1".to_string(),
        })
        .await;

    assert!(matches!(result, Err(HubError::Unauthorized(_))));
}

#[tokio::test]
async fn test_send_before_connect_is_not_connected() {
    let h = harness("http://127.0.0.1:9");
    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
        .with_correlation_id("c-1");

    let result = h.transport.send_request(&request, Duration::from_secs(1)).await;

    assert!(matches!(result, Err(HubError::NotConnected)));
}

/// Hub stand-in with an open SSE stream fed from a channel
async fn spawn_stream_hub() -> (String, mpsc::UnboundedSender<String>) {
    use warp::Filter;

    let (push, rx) = mpsc::unbounded_channel::<String>();
    let rx = Arc::new(parking_lot::Mutex::new(Some(rx)));

    let sse = warp::path!("hiveot" / "sse").and(warp::get()).map(move || {
        let rx = rx.lock().take().expect("single SSE client");
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| {
                let event = warp::sse::Event::default().event("notification").data(data);
                (Ok::<_, Infallible>(event), rx)
            })
        });
        warp::sse::reply(warp::sse::keep_alive().stream(stream))
    });

    let request = warp::path!("hiveot" / "request")
        .and(warp::post())
        .and(warp::body::bytes())
        .map(|body: bytes::Bytes| {
            let request = RequestMessage::from_json(&body).expect("request envelope");
            warp::reply::json(&request.create_response(Some(json!("pong")), None))
        });

    let (addr, server) = warp::serve(sse.or(request)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (format!("http://{addr}"), push)
}

#[tokio::test]
async fn test_open_stream_delivers_notifications_and_direct_replies() {
    let (url, push) = spawn_stream_hub().await;
    let mut h = harness(&url);
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    h.dispatcher
        .set_notification_handler(Some(Arc::new(move |n: NotificationMessage| {
            let _ = seen_tx.send(n);
        })));
    h.transport
        .connect(&Credentials::Token {
            client_id: "consumer1".to_string(),
            token: "tok-1".to_string(),
        })
        .await
        .unwrap();

    let notification =
        NotificationMessage::new(OP_PUBLISH_EVENT, "dtw:lamp1", "switched", Some(json!(true)));
    push.send(String::from_utf8(notification.to_json().unwrap()).unwrap())
        .unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.name, "switched");
    assert_eq!(received.data, Some(json!(true)));

    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "ping", None)
        .with_correlation_id("c-9");
    let reply = h
        .transport
        .send_request(&request, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.correlation_id, "c-9");
    assert_eq!(reply.output, Some(json!("pong")));

    h.transport.disconnect().await;
    assert!(!h.transport.is_connected());
    assert!(h.events.try_recv().is_err());
}

/// A POST received by [`spawn_agent_hub`]
struct Posted {
    path: String,
    content_type: Option<String>,
    body: bytes::Bytes,
}

struct AgentHub {
    url: String,
    push: mpsc::UnboundedSender<(&'static str, String)>,
    posted: mpsc::UnboundedReceiver<Posted>,
}

impl AgentHub {
    fn push(&self, event: &'static str, data: Vec<u8>) {
        self.push.send((event, String::from_utf8(data).unwrap())).unwrap();
    }

    async fn next_post(&mut self) -> Posted {
        tokio::time::timeout(Duration::from_secs(2), self.posted.recv())
            .await
            .expect("a POST from the client")
            .unwrap()
    }
}

/// Hub stand-in that pushes named SSE events and records every POST.
///
/// `/hiveot/response` answers 200, `/hiveot/request` never answers and any
/// other path answers 202.
async fn spawn_agent_hub() -> AgentHub {
    use warp::http::StatusCode;
    use warp::Filter;

    let (push, rx) = mpsc::unbounded_channel::<(&'static str, String)>();
    let rx = Arc::new(parking_lot::Mutex::new(Some(rx)));
    let sse = warp::path!("hiveot" / "sse").and(warp::get()).map(move || {
        let rx = rx.lock().take().expect("single SSE client");
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|(name, data)| {
                let event = warp::sse::Event::default().event(name).data(data);
                (Ok::<_, Infallible>(event), rx)
            })
        });
        warp::sse::reply(warp::sse::keep_alive().stream(stream))
    });

    let (posted_tx, posted) = mpsc::unbounded_channel();
    let post = warp::post()
        .and(warp::path::full())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::body::bytes())
        .and_then(
            move |path: warp::path::FullPath, content_type: Option<String>, body: bytes::Bytes| {
                let posted_tx = posted_tx.clone();
                async move {
                    let path = path.as_str().to_string();
                    let status = match path.as_str() {
                        "/hiveot/response" => StatusCode::OK,
                        "/hiveot/request" => StatusCode::REQUEST_TIMEOUT,
                        _ => StatusCode::ACCEPTED,
                    };
                    let _ = posted_tx.send(Posted {
                        path,
                        content_type,
                        body,
                    });
                    if status == StatusCode::REQUEST_TIMEOUT {
                        futures::future::pending::<()>().await;
                    }
                    Ok::<_, warp::Rejection>(warp::reply::with_status(warp::reply(), status))
                }
            },
        );

    let (addr, server) = warp::serve(sse.or(post)).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    AgentHub {
        url: format!("http://{addr}"),
        push,
        posted,
    }
}

async fn connect_token(h: &Harness) {
    h.transport
        .connect(&Credentials::Token {
            client_id: "consumer1".to_string(),
            token: "tok-1".to_string(),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_sse_request_is_served_and_answered_on_response_path() {
    // Arrange
    let mut hub = spawn_agent_hub().await;
    let h = harness(&hub.url);
    h.dispatcher
        .set_request_handler(Some(request_handler_fn(|request: RequestMessage| async move {
            let level = request.input.clone();
            request.create_response(level, None)
        })));
    connect_token(&h).await;
    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "dim", Some(json!(40)))
        .with_correlation_id("r-1")
        .with_sender("dashboard");

    // Act
    hub.push("request", request.to_json().unwrap());
    let posted = hub.next_post().await;

    // Assert
    assert_eq!(posted.path, "/hiveot/response");
    let reply = ResponseMessage::from_json(&posted.body).unwrap();
    assert_eq!(reply.correlation_id, "r-1");
    assert_eq!(reply.status, RequestStatus::Completed);
    assert_eq!(reply.output, Some(json!(40)));
    assert_eq!(reply.sender_id, "consumer1");
}

#[tokio::test]
async fn test_sse_request_without_handler_gets_failed_reply() {
    let mut hub = spawn_agent_hub().await;
    let h = harness(&hub.url);
    connect_token(&h).await;
    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
        .with_correlation_id("r-2");

    hub.push("request", request.to_json().unwrap());
    let posted = hub.next_post().await;

    assert_eq!(posted.path, "/hiveot/response");
    let reply = ResponseMessage::from_json(&posted.body).unwrap();
    assert_eq!(reply.correlation_id, "r-2");
    assert!(reply.is_failed());
    assert!(reply.error.unwrap().contains("no request handler"));
}

#[tokio::test]
async fn test_malformed_sse_request_with_correlation_id_gets_failed_reply() {
    let mut hub = spawn_agent_hub().await;
    let h = harness(&hub.url);
    connect_token(&h).await;

    // Neither payload has an operation; only the second can be answered
    hub.push("request", br#"{"thingID":"dtw:lamp1"}"#.to_vec());
    hub.push(
        "request",
        br#"{"correlationID":"bad-1","thingID":"dtw:lamp1","name":"dim"}"#.to_vec(),
    );
    let posted = hub.next_post().await;

    assert_eq!(posted.path, "/hiveot/response");
    let reply = ResponseMessage::from_json(&posted.body).unwrap();
    assert_eq!(reply.correlation_id, "bad-1");
    assert_eq!(reply.thing_id, "dtw:lamp1");
    assert!(reply.is_failed());
    assert!(tokio::time::timeout(Duration::from_millis(200), hub.posted.recv())
        .await
        .is_err());
}

#[tokio::test]
async fn test_form_request_posts_raw_input_then_completes_on_sse() {
    // Arrange
    let mut hub = spawn_agent_hub().await;
    let forms = Arc::new(TdFormStore::new());
    let td = json!({
        "id": "dtw:lamp1",
        "actions": {
            "dim": {
                "forms": [{
                    "op": OP_INVOKE_ACTION,
                    "href": "/things/{thingID}/{name}",
                    "contentType": "application/json"
                }]
            }
        }
    });
    assert_eq!(forms.add_td(&td), Some(1));
    let h = harness_with_forms(&hub.url, Some(forms));
    connect_token(&h).await;
    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "dim", Some(json!(40)))
        .with_correlation_id("f-1");
    let pending = h.registry.register("f-1", None, None).unwrap();

    // Act
    let ack = h
        .transport
        .send_request(&request, Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    let posted = hub.next_post().await;
    hub.push(
        "response",
        request.create_response(Some(json!(40)), None).to_json().unwrap(),
    );
    let done = tokio::time::timeout(Duration::from_secs(2), pending.wait())
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert_eq!(ack.status, RequestStatus::Pending);
    assert_eq!(posted.path, "/things/dtw:lamp1/dim");
    assert_eq!(posted.content_type.as_deref(), Some("application/json"));
    assert_eq!(&posted.body[..], b"40");
    assert_eq!(done.status, RequestStatus::Completed);
    assert_eq!(done.output, Some(json!(40)));
    assert!(!h.registry.has("f-1"));
}

#[tokio::test]
async fn test_unanswered_request_post_times_out() {
    let mut hub = spawn_agent_hub().await;
    let h = harness(&hub.url);
    connect_token(&h).await;
    let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "toggle", None)
        .with_correlation_id("slow-1");

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.transport.send_request(&request, Duration::from_millis(200)),
    )
    .await
    .expect("the POST deadline applies");

    assert!(matches!(result, Err(HubError::Timeout { .. })));
    assert_eq!(hub.next_post().await.path, "/hiveot/request");
}
