//! Interest that has to survive a reconnect
//!
//! Brokers and hubs forget subscriptions with the session, so the connection
//! keeps its own record and replays it on every new adapter.

use crate::transport::Subscription;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    subscriptions: Vec<Subscription>,
    serving: bool,
}

/// Ordered, duplicate-free set of subscriptions plus the request-serving flag
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    inner: Mutex<Inner>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the subscription was already tracked
    pub fn add(&self, subscription: Subscription) -> bool {
        let mut inner = self.inner.lock();
        if inner.subscriptions.contains(&subscription) {
            return false;
        }
        inner.subscriptions.push(subscription);
        true
    }

    pub fn remove(&self, subscription: &Subscription) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscriptions.len();
        inner.subscriptions.retain(|s| s != subscription);
        inner.subscriptions.len() != before
    }

    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.inner.lock().subscriptions.contains(subscription)
    }

    /// Subscriptions in registration order
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_serving(&self, serving: bool) {
        self.inner.lock().serving = serving;
    }

    /// True once the agent asked to receive requests for its Things
    pub fn is_serving(&self) -> bool {
        self.inner.lock().serving
    }
}
