//! Loopback hub for tests
//!
//! [`MockHub`] plays the remote side of every adapter created by its
//! [`MockTransportFactory`]. It scripts replies, records everything the
//! client sends, injects inbound traffic and can drop the session.

use crate::config::{ClientConfig, Credentials, ReconnectSection};
use crate::connection::{ConnectionStatus, HubConnection};
use crate::error::{HubError, HubResult};
use crate::protocol::{
    AddressTokens, NotificationMessage, RequestMessage, RequestStatus, ResponseMessage,
    OP_OBSERVE_ALL_PROPERTIES, OP_OBSERVE_PROPERTY, OP_SUBSCRIBE_ALL_EVENTS, OP_SUBSCRIBE_EVENT,
    OP_UNOBSERVE_ALL_PROPERTIES, OP_UNOBSERVE_PROPERTY, OP_UNSUBSCRIBE_ALL_EVENTS,
    OP_UNSUBSCRIBE_EVENT,
};
use crate::transport::{
    Dispatcher, Subscription, SubscriptionKind, SubscriptionMode, Transport, TransportEvent,
    TransportFactory,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Produces the replies for one request, in delivery order
pub type Responder = Arc<dyn Fn(&RequestMessage) -> Vec<ResponseMessage> + Send + Sync>;

/// Scripted outcome of the next connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Fail(String),
    Unauthorized(String),
}

/// Subscribe or unsubscribe seen by the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub subscribed: bool,
    pub subscription: Subscription,
}

struct Session {
    id: u64,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    subscriptions: Vec<Subscription>,
}

struct HubState {
    responder: Option<Responder>,
    mode: SubscriptionMode,
    native: bool,
    sync_replies: bool,
    stalled: bool,
    token: Option<String>,
    connect_outcomes: VecDeque<ConnectOutcome>,
    connect_count: usize,
    credentials: Vec<Credentials>,
    requests: Vec<RequestMessage>,
    responses: Vec<ResponseMessage>,
    notifications: Vec<NotificationMessage>,
    subscription_log: Vec<SubscriptionRecord>,
    served_agents: Vec<String>,
    next_session: u64,
    session: Option<Session>,
}

/// In-process stand-in for a hub
pub struct MockHub {
    state: Mutex<HubState>,
}

impl MockHub {
    /// A hub that completes every request with a null output
    pub fn new() -> Arc<Self> {
        let hub = Arc::new(Self {
            state: Mutex::new(HubState {
                responder: None,
                mode: SubscriptionMode::Broker,
                native: false,
                sync_replies: false,
                stalled: false,
                token: None,
                connect_outcomes: VecDeque::new(),
                connect_count: 0,
                credentials: Vec::new(),
                requests: Vec::new(),
                responses: Vec::new(),
                notifications: Vec::new(),
                subscription_log: Vec::new(),
                served_agents: Vec::new(),
                next_session: 1,
                session: None,
            }),
        });
        hub.reply_completed(None);
        hub
    }

    pub fn factory(self: &Arc<Self>) -> Arc<dyn TransportFactory> {
        Arc::new(MockTransportFactory { hub: self.clone() })
    }

    /// Connection wired to this hub with fast reconnect settings
    pub fn connection(self: &Arc<Self>, client_id: &str) -> HubConnection {
        HubConnection::with_factory(test_config(client_id), self.factory())
    }

    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&RequestMessage) -> Vec<ResponseMessage> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
    }

    pub fn reply_completed(&self, output: Option<Value>) {
        self.respond_with(move |req| vec![req.create_response(output.clone(), None)]);
    }

    pub fn reply_failed(&self, error: &str) {
        let error = error.to_string();
        self.respond_with(move |req| vec![req.create_response(None, Some(error.clone()))]);
    }

    /// A `running` progress response followed by the terminal one
    pub fn reply_progress_then_completed(&self, output: Option<Value>) {
        self.respond_with(move |req| {
            vec![
                req.create_progress(RequestStatus::Running, None),
                req.create_response(output.clone(), None),
            ]
        });
    }

    /// Never answer
    pub fn silence(&self) {
        self.respond_with(|_| Vec::new());
    }

    /// Request sends never complete, like a hub that accepts a POST and never answers
    pub fn stall_sends(&self) {
        self.state.lock().stalled = true;
    }

    /// Subscriptions go through hub requests instead of the broker
    pub fn use_hub_requests(&self) {
        self.state.lock().mode = SubscriptionMode::HubRequest;
    }

    /// Answer requests natively, bypassing the correlation registry
    pub fn use_native_request_reply(&self) {
        self.state.lock().native = true;
    }

    /// Return the terminal reply from `send_request` like an HTTP body
    pub fn use_sync_replies(&self) {
        self.state.lock().sync_replies = true;
    }

    /// Token issued on connect
    pub fn issue_token(&self, token: &str) {
        self.state.lock().token = Some(token.to_string());
    }

    /// Queue the outcome of the next connect attempt
    pub fn push_connect_outcome(&self, outcome: ConnectOutcome) {
        self.state.lock().connect_outcomes.push_back(outcome);
    }

    pub fn connect_count(&self) -> usize {
        self.state.lock().connect_count
    }

    pub fn credentials_seen(&self) -> Vec<Credentials> {
        self.state.lock().credentials.clone()
    }

    pub fn requests(&self) -> Vec<RequestMessage> {
        self.state.lock().requests.clone()
    }

    pub fn responses(&self) -> Vec<ResponseMessage> {
        self.state.lock().responses.clone()
    }

    pub fn notifications(&self) -> Vec<NotificationMessage> {
        self.state.lock().notifications.clone()
    }

    pub fn subscription_log(&self) -> Vec<SubscriptionRecord> {
        self.state.lock().subscription_log.clone()
    }

    pub fn served_agents(&self) -> Vec<String> {
        self.state.lock().served_agents.clone()
    }

    /// Subscriptions active in the current session
    pub fn active_subscriptions(&self) -> Vec<Subscription> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.requests.clear();
        state.responses.clear();
        state.notifications.clear();
        state.subscription_log.clear();
    }

    /// Push a notification to the client if a subscription of the current
    /// session matches it. Returns true when delivered.
    pub fn inject_notification(&self, notification: NotificationMessage) -> bool {
        let dispatcher = {
            let state = self.state.lock();
            match &state.session {
                Some(session)
                    if session
                        .subscriptions
                        .iter()
                        .any(|s| subscription_matches(s, &notification)) =>
                {
                    session.dispatcher.clone()
                }
                _ => return false,
            }
        };
        dispatcher.on_notification(notification);
        true
    }

    /// Push a response the client never asked for, or a late one
    pub fn inject_response(&self, response: ResponseMessage) -> bool {
        let dispatcher = self.state.lock().session.as_ref().map(|s| s.dispatcher.clone());
        match dispatcher {
            Some(dispatcher) => {
                dispatcher.on_response(response);
                true
            }
            None => false,
        }
    }

    /// Deliver a request to the agent and record its reply.
    ///
    /// Returns `None` when no session is up or the agent does not serve
    /// requests.
    pub async fn inject_request(&self, request: RequestMessage) -> Option<ResponseMessage> {
        let dispatcher = {
            let state = self.state.lock();
            let session = state.session.as_ref()?;
            if state.served_agents.is_empty() {
                return None;
            }
            session.dispatcher.clone()
        };
        let response = dispatcher.on_request(request).await;
        self.state.lock().responses.push(response.clone());
        Some(response)
    }

    /// Drop the current session as if the network failed
    pub fn simulate_close(&self, reason: &str) -> bool {
        let session = self.state.lock().session.take();
        match session {
            Some(session) => {
                session.connected.store(false, Ordering::SeqCst);
                let _ = session.events.send(TransportEvent::Closed {
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn open_session(
        &self,
        credentials: &Credentials,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
        connected: Arc<AtomicBool>,
    ) -> HubResult<(u64, Option<String>)> {
        let mut state = self.state.lock();
        state.connect_count += 1;
        state.credentials.push(credentials.clone());
        match state.connect_outcomes.pop_front() {
            Some(ConnectOutcome::Fail(reason)) => return Err(HubError::connection_failed(reason)),
            Some(ConnectOutcome::Unauthorized(reason)) => {
                return Err(HubError::unauthorized(reason))
            }
            None => {}
        }
        let id = state.next_session;
        state.next_session += 1;
        connected.store(true, Ordering::SeqCst);
        state.session = Some(Session {
            id,
            dispatcher,
            events,
            connected,
            subscriptions: Vec::new(),
        });
        Ok((id, state.token.clone()))
    }

    fn close_session(&self, id: u64) {
        let mut state = self.state.lock();
        if state.session.as_ref().is_some_and(|s| s.id == id) {
            state.session = None;
        }
    }

    fn record_subscription(&self, id: u64, subscription: &Subscription, subscribed: bool) {
        let mut state = self.state.lock();
        state.subscription_log.push(SubscriptionRecord {
            subscribed,
            subscription: subscription.clone(),
        });
        if let Some(session) = state.session.as_mut().filter(|s| s.id == id) {
            session.subscriptions.retain(|s| s != subscription);
            if subscribed {
                session.subscriptions.push(subscription.clone());
            }
        }
    }
}

/// Config for tests: short timeouts and millisecond backoff
pub fn test_config(client_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new(client_id, "mqtt://mock-hub:1883");
    config.timeouts.request_timeout_ms = 1_000;
    config.reconnect = ReconnectSection {
        initial_delay_ms: 10,
        max_delay_ms: 50,
        multiplier: 2.0,
        max_attempts: 0,
    };
    config
}

/// Wait until the connection reports `status`; false on timeout
pub async fn wait_for_status(
    connection: &HubConnection,
    status: ConnectionStatus,
    timeout: Duration,
) -> bool {
    let mut rx = connection.status_receiver();
    tokio::time::timeout(timeout, async {
        loop {
            if *rx.borrow_and_update() == status {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false)
}

fn subscription_matches(subscription: &Subscription, notification: &NotificationMessage) -> bool {
    subscription
        .notification_operations()
        .contains(&notification.operation.as_str())
        && (subscription.thing_id.is_empty() || subscription.thing_id == notification.thing_id)
        && (subscription.name.is_empty() || subscription.name == notification.name)
}

/// Subscription carried by a subscribe/observe request, and whether it adds
fn subscription_request(request: &RequestMessage) -> Option<(Subscription, bool)> {
    let (kind, subscribed) = match request.operation.as_str() {
        OP_SUBSCRIBE_EVENT | OP_SUBSCRIBE_ALL_EVENTS => (SubscriptionKind::Event, true),
        OP_UNSUBSCRIBE_EVENT | OP_UNSUBSCRIBE_ALL_EVENTS => (SubscriptionKind::Event, false),
        OP_OBSERVE_PROPERTY | OP_OBSERVE_ALL_PROPERTIES => (SubscriptionKind::Property, true),
        OP_UNOBSERVE_PROPERTY | OP_UNOBSERVE_ALL_PROPERTIES => (SubscriptionKind::Property, false),
        _ => return None,
    };
    Some((
        Subscription {
            kind,
            thing_id: request.thing_id.clone(),
            name: request.name.clone(),
        },
        subscribed,
    ))
}

/// Creates a [`MockTransport`] bound to one hub per connect
pub struct MockTransportFactory {
    hub: Arc<MockHub>,
}

impl MockTransportFactory {
    pub fn new(hub: Arc<MockHub>) -> Self {
        Self { hub }
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        dispatcher: Dispatcher,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> HubResult<Arc<dyn Transport>> {
        Ok(Arc::new(MockTransport {
            hub: self.hub.clone(),
            dispatcher,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            session_id: Mutex::new(None),
        }))
    }
}

/// Adapter side of a [`MockHub`] session
pub struct MockTransport {
    hub: Arc<MockHub>,
    dispatcher: Dispatcher,
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
    session_id: Mutex<Option<u64>>,
}

impl MockTransport {
    fn session(&self) -> HubResult<u64> {
        match *self.session_id.lock() {
            Some(id) if self.connected.load(Ordering::SeqCst) => Ok(id),
            _ => Err(HubError::NotConnected),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn address_tokens(&self) -> AddressTokens {
        AddressTokens::MQTT
    }

    async fn connect(&self, credentials: &Credentials) -> HubResult<Option<String>> {
        let (id, token) = self.hub.open_session(
            credentials,
            self.dispatcher.clone(),
            self.events.clone(),
            self.connected.clone(),
        )?;
        *self.session_id.lock() = Some(id);
        Ok(token)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let id = self.session_id.lock().take();
        if let Some(id) = id {
            self.hub.close_session(id);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn native_request_reply(&self) -> bool {
        self.hub.state.lock().native
    }

    async fn send_request(
        &self,
        request: &RequestMessage,
        timeout: Duration,
    ) -> HubResult<Option<ResponseMessage>> {
        let id = self.session()?;
        let (responder, native, sync_replies, stalled) = {
            let mut state = self.hub.state.lock();
            state.requests.push(request.clone());
            (
                state.responder.clone(),
                state.native,
                state.sync_replies,
                state.stalled,
            )
        };
        if stalled {
            return std::future::pending().await;
        }
        if let Some((subscription, subscribed)) = subscription_request(request) {
            self.hub.record_subscription(id, &subscription, subscribed);
        }

        let mut replies = responder.map(|r| r(request)).unwrap_or_default();

        if native {
            return match replies.into_iter().rev().find(ResponseMessage::is_terminal) {
                Some(reply) => Ok(Some(reply)),
                None => {
                    tokio::time::sleep(timeout).await;
                    Err(HubError::timeout(
                        request.correlation_id.clone(),
                        timeout.as_millis() as u64,
                    ))
                }
            };
        }

        if sync_replies {
            let terminal = replies
                .iter()
                .position(ResponseMessage::is_terminal)
                .map(|i| replies.remove(i));
            for progress in replies {
                self.dispatcher.on_response(progress);
            }
            return Ok(terminal);
        }

        if !replies.is_empty() {
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                for reply in replies {
                    tokio::task::yield_now().await;
                    dispatcher.on_response(reply);
                }
            });
        }
        Ok(None)
    }

    async fn send_response(&self, response: &ResponseMessage) -> HubResult<()> {
        self.session()?;
        self.hub.state.lock().responses.push(response.clone());
        Ok(())
    }

    async fn send_notification(&self, notification: &NotificationMessage) -> HubResult<()> {
        self.session()?;
        self.hub.state.lock().notifications.push(notification.clone());
        Ok(())
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        self.hub.state.lock().mode
    }

    async fn subscribe(&self, subscription: &Subscription) -> HubResult<()> {
        let id = self.session()?;
        self.hub.record_subscription(id, subscription, true);
        Ok(())
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> HubResult<()> {
        let id = self.session()?;
        self.hub.record_subscription(id, subscription, false);
        Ok(())
    }

    async fn serve_requests(&self, agent_id: &str) -> HubResult<()> {
        self.session()?;
        self.hub.state.lock().served_agents.push(agent_id.to_string());
        Ok(())
    }

    async fn refresh_token(&self) -> HubResult<String> {
        self.session()?;
        let mut state = self.hub.state.lock();
        let refreshed = format!("{}-refreshed", state.token.as_deref().unwrap_or("token"));
        state.token = Some(refreshed.clone());
        Ok(refreshed)
    }

    async fn logout(&self) -> HubResult<()> {
        self.session()?;
        self.hub.state.lock().token = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{OP_INVOKE_ACTION, OP_PUBLISH_EVENT};
    use serde_json::json;

    fn credentials() -> Credentials {
        Credentials::Token {
            client_id: "c1".to_string(),
            token: "t".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let hub = MockHub::new();
        hub.push_connect_outcome(ConnectOutcome::Unauthorized("bad token".into()));
        let registry = Arc::new(crate::correlation::CorrelationRegistry::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = hub
            .factory()
            .create(Dispatcher::new("c1", registry), tx)
            .unwrap();

        let result = transport.connect(&credentials()).await;

        assert!(matches!(result, Err(HubError::Unauthorized(_))));
        assert!(!transport.is_connected());
        assert_eq!(hub.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_sync_reply_is_returned() {
        let hub = MockHub::new();
        hub.use_sync_replies();
        hub.reply_completed(Some(json!(1)));
        let registry = Arc::new(crate::correlation::CorrelationRegistry::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = hub
            .factory()
            .create(Dispatcher::new("c1", registry), tx)
            .unwrap();
        transport.connect(&credentials()).await.unwrap();

        let request = RequestMessage::new(OP_INVOKE_ACTION, "dtw:a:lamp", "toggle", None)
            .with_correlation_id("r-1");
        let reply = transport
            .send_request(&request, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(reply.map(|r| r.output), Some(Some(json!(1))));
        assert_eq!(hub.requests().len(), 1);
    }

    #[test]
    fn test_subscription_matching() {
        let n = NotificationMessage::new(OP_PUBLISH_EVENT, "dtw:lamp1", "switched", None);
        assert!(subscription_matches(&Subscription::event("dtw:lamp1", "switched"), &n));
        assert!(subscription_matches(&Subscription::event("", ""), &n));
        assert!(!subscription_matches(&Subscription::event("dtw:lamp2", ""), &n));
        assert!(!subscription_matches(&Subscription::property("dtw:lamp1", ""), &n));
    }
}
