//! Shared types for negotopo negotiation rounds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Errors raised by the negotiation core.
///
/// Timeouts and round exhaustion are terminal statuses, not errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NegotiationError {
    #[error("agent '{0}' is already registered")]
    DuplicateNode(AgentId),

    #[error("unknown agent '{0}'")]
    UnknownAgent(AgentId),

    #[error("round {0} has already been executed")]
    AlreadyCompleted(usize),

    #[error("runner is already running")]
    RunnerBusy,

    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    #[error("orchestration fault: {0}")]
    Orchestration(String),
}

pub type Result<T> = std::result::Result<T, NegotiationError>;

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Explicit round number handed to every round-scoped operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundContext {
    pub round: usize,
    pub started_ms: u64,
}

impl RoundContext {
    pub fn new(round: usize) -> Self {
        Self {
            round,
            started_ms: now_ms(),
        }
    }
}

/// Read-only view of an agent used for compatibility scoring.
#[derive(Clone, Copy, Debug)]
pub struct NodeProfile<'a> {
    pub id: &'a AgentId,
    pub needs: &'a [String],
    pub offers: &'a [String],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Offer,
    Counter,
    Accept,
    Reject,
    Query,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Offer,
        MessageType::Counter,
        MessageType::Accept,
        MessageType::Reject,
        MessageType::Query,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Counter => "counter",
            MessageType::Accept => "accept",
            MessageType::Reject => "reject",
            MessageType::Query => "query",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body. Offers and counters both carry `Offer`; a query reply is a
/// `Query` message carrying a `Snapshot`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Offer {
        offer: String,
    },
    Accept {
        accepted_offer: String,
        satisfied_need: String,
    },
    Reject {
        reason: String,
    },
    Query,
    Snapshot {
        needs: Vec<String>,
        offers: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the bus on delivery when empty.
    pub id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub kind: MessageType,
    pub payload: Payload,
    pub round: usize,
    pub ts_unix_ms: u64,
    pub read: bool,
}

impl Message {
    pub fn new(
        kind: MessageType,
        from: &AgentId,
        to: &AgentId,
        round: usize,
        payload: Payload,
    ) -> Self {
        Self {
            id: String::new(),
            from: from.clone(),
            to: to.clone(),
            kind,
            payload,
            round,
            ts_unix_ms: now_ms(),
            read: false,
        }
    }

    pub fn offer(from: &AgentId, to: &AgentId, round: usize, offer: impl Into<String>) -> Self {
        Self::new(
            MessageType::Offer,
            from,
            to,
            round,
            Payload::Offer {
                offer: offer.into(),
            },
        )
    }

    pub fn counter(from: &AgentId, to: &AgentId, round: usize, offer: impl Into<String>) -> Self {
        Self::new(
            MessageType::Counter,
            from,
            to,
            round,
            Payload::Offer {
                offer: offer.into(),
            },
        )
    }

    pub fn accept(
        from: &AgentId,
        to: &AgentId,
        round: usize,
        accepted_offer: impl Into<String>,
        satisfied_need: impl Into<String>,
    ) -> Self {
        Self::new(
            MessageType::Accept,
            from,
            to,
            round,
            Payload::Accept {
                accepted_offer: accepted_offer.into(),
                satisfied_need: satisfied_need.into(),
            },
        )
    }

    pub fn reject(from: &AgentId, to: &AgentId, round: usize, reason: impl Into<String>) -> Self {
        Self::new(
            MessageType::Reject,
            from,
            to,
            round,
            Payload::Reject {
                reason: reason.into(),
            },
        )
    }

    pub fn query(from: &AgentId, to: &AgentId, round: usize) -> Self {
        Self::new(MessageType::Query, from, to, round, Payload::Query)
    }

    pub fn snapshot(
        from: &AgentId,
        to: &AgentId,
        round: usize,
        needs: Vec<String>,
        offers: Vec<String>,
    ) -> Self {
        Self::new(
            MessageType::Query,
            from,
            to,
            round,
            Payload::Snapshot { needs, offers },
        )
    }

    /// The offered value of an offer or counter.
    pub fn offered_value(&self) -> Option<&str> {
        match &self.payload {
            Payload::Offer { offer } => Some(offer),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: AgentId,
    pub to: AgentId,
    /// `1 - combined`, lower means more compatible.
    pub weight: f32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub density: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub round: usize,
    pub stats: GraphStats,
    pub edges: Vec<Edge>,
    pub ts_unix_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    OfferSent,
    OfferAccepted,
    OfferRejected,
    CounterSent,
    AcceptReceived,
    RejectReceived,
    QuerySent,
    QueryAnswered,
    SnapshotReceived,
    HandlerFailed,
}

/// Bookkeeping entry appended to an agent's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub round: usize,
    pub kind: EventKind,
    pub peer: Option<AgentId>,
    pub detail: String,
    pub ts_unix_ms: u64,
}

impl AgentEvent {
    pub fn new(round: usize, kind: EventKind, peer: Option<&AgentId>, detail: impl Into<String>) -> Self {
        Self {
            round,
            kind,
            peer: peer.cloned(),
            detail: detail.into(),
            ts_unix_ms: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_serializes_lowercase() {
        let s = serde_json::to_string(&MessageType::Counter).unwrap();
        assert_eq!(s, "\"counter\"");
        for kind in MessageType::ALL {
            assert_eq!(format!("\"{}\"", kind), serde_json::to_string(&kind).unwrap());
        }
    }

    #[test]
    fn test_offer_and_counter_share_payload() {
        let a = AgentId::from("a");
        let b = AgentId::from("b");
        let offer = Message::offer(&a, &b, 0, "coffee");
        let counter = Message::counter(&b, &a, 0, "tea");
        assert_eq!(offer.offered_value(), Some("coffee"));
        assert_eq!(counter.offered_value(), Some("tea"));
        assert_eq!(counter.kind, MessageType::Counter);
        assert!(Message::query(&a, &b, 0).offered_value().is_none());
    }

    #[test]
    fn test_error_messages_name_the_agent() {
        let err = NegotiationError::DuplicateNode(AgentId::from("alice"));
        assert_eq!(err.to_string(), "agent 'alice' is already registered");
    }
}
