//! Agent request serving against the loopback hub

use hubconnect::testing::{wait_for_status, MockHub};
use hubconnect::{
    request_handler_fn, Agent, ConnectionStatus, Credentials, RequestMessage, RequestStatus,
    OP_INVOKE_ACTION, OP_PUBLISH_EVENT, OP_UPDATE_PROPERTY, OP_WRITE_PROPERTY,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn token() -> Credentials {
    Credentials::Token {
        client_id: "agent1".to_string(),
        token: "t".to_string(),
    }
}

async fn connected_agent(hub: &Arc<MockHub>) -> Agent {
    let agent = Agent::from_connection(Arc::new(hub.connection("agent1")));
    agent.connect(token()).await.unwrap();
    agent
}

fn toggle() -> RequestMessage {
    RequestMessage::new(OP_INVOKE_ACTION, "dtw:agent1:lamp1", "toggle", Some(json!(true)))
        .with_correlation_id("r-1")
        .with_sender("consumer1")
}

#[tokio::test]
async fn test_request_handler_output_is_sent_back() {
    // Arrange
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            let on = req.input.clone().unwrap_or_default();
            req.create_response(Some(json!({"on": on})), None)
        }))
        .await
        .unwrap();

    // Act
    let response = hub.inject_request(toggle()).await.unwrap();

    // Assert
    assert_eq!(response.correlation_id, "r-1");
    assert_eq!(response.status, RequestStatus::Completed);
    assert_eq!(response.output, Some(json!({"on": true})));
    assert_eq!(response.sender_id, "agent1");
    assert_eq!(hub.served_agents(), vec!["agent1".to_string()]);
}

#[tokio::test]
async fn test_without_handler_the_hub_never_routes_requests() {
    let hub = MockHub::new();
    let _agent = connected_agent(&hub).await;

    assert!(hub.inject_request(toggle()).await.is_none());
}

#[tokio::test]
async fn test_cleared_handler_yields_failure_response() {
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            req.create_response(None, None)
        }))
        .await
        .unwrap();

    agent.clear_request_handler();
    let response = hub.inject_request(toggle()).await.unwrap();

    assert_eq!(response.status, RequestStatus::Failed);
    assert!(response.error.unwrap().contains("no request handler"));
}

#[tokio::test]
async fn test_handler_error_is_sanitized() {
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            req.create_response(None, Some("login failed: password=hunter2".to_string()))
        }))
        .await
        .unwrap();

    let response = hub.inject_request(toggle()).await.unwrap();

    let error = response.error.unwrap();
    assert!(!error.contains("hunter2"));
    assert!(error.contains("password=***"));
}

#[tokio::test]
async fn test_last_handler_registration_wins() {
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            req.create_response(Some(json!("first")), None)
        }))
        .await
        .unwrap();
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            req.create_response(Some(json!("second")), None)
        }))
        .await
        .unwrap();

    let response = hub.inject_request(toggle()).await.unwrap();

    assert_eq!(response.output, Some(json!("second")));
}

#[tokio::test]
async fn test_running_ack_then_terminal_response() {
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            req.create_progress(RequestStatus::Running, None)
        }))
        .await
        .unwrap();

    let ack = hub.inject_request(toggle()).await.unwrap();
    assert_eq!(ack.status, RequestStatus::Running);

    let request = toggle();
    agent
        .send_response(request.create_response(Some(json!("done")), None))
        .await
        .unwrap();

    let sent = hub.responses();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].status, RequestStatus::Completed);
    assert_eq!(sent[1].correlation_id, "r-1");
    assert_eq!(sent[1].sender_id, "agent1");
}

#[tokio::test]
async fn test_serving_is_replayed_after_reconnect() {
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;
    agent
        .set_request_handler(request_handler_fn(|req: RequestMessage| async move {
            req.create_response(None, None)
        }))
        .await
        .unwrap();

    hub.simulate_close("lost");
    while hub.connect_count() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(wait_for_status(agent.connection(), ConnectionStatus::Connected, Duration::from_secs(2)).await);

    assert_eq!(hub.served_agents().len(), 2);
    let response = hub.inject_request(toggle()).await.unwrap();
    assert_eq!(response.status, RequestStatus::Completed);
}

#[tokio::test]
async fn test_pub_event_and_property() {
    let hub = MockHub::new();
    let agent = connected_agent(&hub).await;

    agent
        .pub_event("lamp1", "switched", Some(json!(true)))
        .await
        .unwrap();
    agent.pub_property("lamp1", "level", json!(80)).await.unwrap();

    let sent = hub.notifications();
    assert_eq!(sent[0].operation, OP_PUBLISH_EVENT);
    assert_eq!(sent[0].data, Some(json!(true)));
    assert_eq!(sent[1].operation, OP_UPDATE_PROPERTY);
    assert_eq!(sent[1].name, "level");
    assert!(sent.iter().all(|n| n.sender_id == "agent1"));
}

#[tokio::test]
async fn test_agent_consumer_shares_connection() {
    let hub = MockHub::new();
    hub.reply_completed(None);
    let agent = connected_agent(&hub).await;

    agent
        .consumer()
        .write_property("dtw:other:thermostat", "setpoint", json!(21))
        .await
        .unwrap();

    let sent = hub.requests();
    assert_eq!(sent[0].operation, OP_WRITE_PROPERTY);
    assert_eq!(sent[0].sender_id, "agent1");
    assert_eq!(hub.connect_count(), 1);
}
