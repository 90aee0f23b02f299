//! Broker address grammar
//!
//! Brokered transports address messages as
//! `{operation}{sep}{agentID}{sep}{thingID}{sep}{name}{sep}{senderID}`.
//! The separator and wildcards differ per transport and are exposed through
//! [`AddressTokens`] so the upper layers never hardcode them.

use crate::error::{HubError, HubResult};

/// Token used for an absent address segment when publishing
pub const EMPTY_TOKEN: &str = "_";

/// Digital twin prefix: `dtw:{agentID}:{thingID}`
pub const DIGITAL_TWIN_PREFIX: &str = "dtw:";

/// Inbox prefix for MQTT reply topics
pub const INBOX_PREFIX: &str = "_INBOX";

/// Separator and wildcard tokens of a brokered transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTokens {
    pub separator: char,
    /// Matches exactly one segment
    pub wildcard: char,
    /// Matches the remainder of the address
    pub remainder: char,
}

impl AddressTokens {
    pub const MQTT: AddressTokens = AddressTokens {
        separator: '/',
        wildcard: '+',
        remainder: '#',
    };

    pub const NATS: AddressTokens = AddressTokens {
        separator: '.',
        wildcard: '*',
        remainder: '>',
    };

    /// HTTP addresses by URL path; the grammar isn't used but the tokens
    /// keep the seam uniform.
    pub const HTTP: AddressTokens = AddressTokens {
        separator: '/',
        wildcard: '+',
        remainder: '#',
    };

    fn is_reserved(&self, c: char) -> bool {
        c == self.separator || c == self.wildcard || c == self.remainder
    }

    /// Replace reserved characters so a value can't alter the address shape
    pub fn escape(&self, token: &str) -> String {
        token
            .chars()
            .map(|c| if self.is_reserved(c) || c.is_whitespace() { '_' } else { c })
            .collect()
    }

    fn publish_token(&self, token: &str) -> String {
        if token.is_empty() {
            EMPTY_TOKEN.to_string()
        } else {
            self.escape(token)
        }
    }

    fn subscribe_token(&self, token: &str) -> String {
        if token.is_empty() {
            self.wildcard.to_string()
        } else {
            self.escape(token)
        }
    }

    /// Address for publishing. Empty segments become `_`.
    pub fn publish_address(&self, address: &Address) -> String {
        let sep = self.separator.to_string();
        [
            self.publish_token(&address.operation),
            self.publish_token(&address.agent_id),
            self.publish_token(&address.thing_id),
            self.publish_token(&address.name),
            self.publish_token(&address.sender_id),
        ]
        .join(&sep)
    }

    /// Address filter for subscribing. Empty segments match anything.
    pub fn subscribe_filter(&self, address: &Address) -> String {
        let sep = self.separator.to_string();
        [
            self.subscribe_token(&address.operation),
            self.subscribe_token(&address.agent_id),
            self.subscribe_token(&address.thing_id),
            self.subscribe_token(&address.name),
            self.subscribe_token(&address.sender_id),
        ]
        .join(&sep)
    }

    /// Reply inbox of a client instance
    pub fn inbox(&self, instance_id: &str) -> String {
        format!("{INBOX_PREFIX}{}{}", self.separator, self.escape(instance_id))
    }

    pub fn is_inbox(&self, topic: &str) -> bool {
        topic
            .strip_prefix(INBOX_PREFIX)
            .is_some_and(|rest| rest.starts_with(self.separator))
    }

    /// Split an address back into its segments. `_` becomes an empty string.
    pub fn parse(&self, address: &str) -> HubResult<Address> {
        let parts: Vec<&str> = address.split(self.separator).collect();
        if parts.len() < 4 {
            return Err(HubError::protocol(format!(
                "address '{address}' has {} segments, expected at least 4",
                parts.len()
            )));
        }
        let token = |i: usize| -> String {
            match parts.get(i) {
                Some(&EMPTY_TOKEN) | None => String::new(),
                Some(p) => (*p).to_string(),
            }
        };
        Ok(Address {
            operation: token(0),
            agent_id: token(1),
            thing_id: token(2),
            name: token(3),
            sender_id: token(4),
        })
    }
}

/// Segments of a brokered address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    pub operation: String,
    pub agent_id: String,
    pub thing_id: String,
    pub name: String,
    pub sender_id: String,
}

impl Address {
    /// Build an address for a Thing; the agent is derived from the thingID.
    ///
    /// A digital twin ID `dtw:{agent}:{thing}` yields that agent; anything
    /// else leaves the agent segment empty.
    pub fn for_thing(operation: &str, thing_id: &str, name: &str, sender_id: &str) -> Self {
        Self {
            operation: operation.to_string(),
            agent_id: agent_of(thing_id).unwrap_or_default().to_string(),
            thing_id: thing_id.to_string(),
            name: name.to_string(),
            sender_id: sender_id.to_string(),
        }
    }
}

/// Extract the agent ID from a digital twin thingID
pub fn agent_of(thing_id: &str) -> Option<&str> {
    let rest = thing_id.strip_prefix(DIGITAL_TWIN_PREFIX)?;
    let (agent, thing) = rest.split_once(':')?;
    if agent.is_empty() || thing.is_empty() {
        None
    } else {
        Some(agent)
    }
}
