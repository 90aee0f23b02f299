//! Reply routes of inbound requests that are answered later
//!
//! A request acknowledged with `running` keeps its route until the agent
//! sends the terminal response. Routes expire after a fixed lifetime and are
//! dropped with the session.

use crate::protocol::ResponseMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// How long an unanswered request can still be answered
pub const REPLY_ROUTE_TTL: Duration = Duration::from_secs(600);

pub struct ReplyRoutes<R> {
    ttl: Duration,
    routes: Mutex<HashMap<String, (R, Instant)>>,
}

impl<R: Clone> ReplyRoutes<R> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Remember where the answer to `correlation_id` goes; prunes expired routes
    pub fn insert(&self, correlation_id: String, route: R) {
        let now = Instant::now();
        let mut routes = self.routes.lock();
        let before = routes.len();
        routes.retain(|_, (_, created)| now.duration_since(*created) < self.ttl);
        let expired = before - routes.len();
        if expired > 0 {
            debug!(expired, "Dropped expired reply routes");
        }
        routes.insert(correlation_id, (route, now));
    }

    /// Route for a response; a terminal response consumes it
    pub fn route_for(&self, response: &ResponseMessage) -> Option<R> {
        let mut routes = self.routes.lock();
        let expired = routes
            .get(&response.correlation_id)
            .map(|(_, created)| created.elapsed() >= self.ttl)?;
        if expired || response.is_terminal() {
            let (route, _) = routes.remove(&response.correlation_id)?;
            return (!expired).then_some(route);
        }
        routes
            .get(&response.correlation_id)
            .map(|(route, _)| route.clone())
    }

    /// Forget every route; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut routes = self.routes.lock();
        let dropped = routes.len();
        routes.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }
}

impl<R: Clone> Default for ReplyRoutes<R> {
    fn default() -> Self {
        Self::new(REPLY_ROUTE_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestMessage, RequestStatus, OP_INVOKE_ACTION};

    fn request(id: &str) -> RequestMessage {
        RequestMessage::new(OP_INVOKE_ACTION, "dtw:lamp1", "calibrate", None).with_correlation_id(id)
    }

    #[test]
    fn test_progress_keeps_route_and_terminal_consumes_it() {
        let routes = ReplyRoutes::default();
        routes.insert("c-1".to_string(), "reply.topic".to_string());

        let progress = request("c-1").create_progress(RequestStatus::Running, None);
        assert_eq!(routes.route_for(&progress).as_deref(), Some("reply.topic"));
        assert_eq!(routes.len(), 1);

        let done = request("c-1").create_response(None, None);
        assert_eq!(routes.route_for(&done).as_deref(), Some("reply.topic"));
        assert!(routes.is_empty());
        assert!(routes.route_for(&done).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_routes_expire() {
        let routes = ReplyRoutes::new(Duration::from_secs(10));
        routes.insert("old".to_string(), 1u8);
        tokio::time::advance(Duration::from_secs(11)).await;

        let done = request("old").create_response(None, None);
        assert!(routes.route_for(&done).is_none());
        assert!(routes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_prunes_expired_routes() {
        let routes = ReplyRoutes::new(Duration::from_secs(10));
        for i in 0..5 {
            routes.insert(format!("stale-{i}"), i);
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        routes.insert("fresh".to_string(), 9);

        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn test_clear_drops_everything() {
        let routes = ReplyRoutes::default();
        routes.insert("a".to_string(), ());
        routes.insert("b".to_string(), ());
        assert_eq!(routes.clear(), 2);
        assert!(routes.is_empty());
    }
}
