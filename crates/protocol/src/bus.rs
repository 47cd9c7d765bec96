//! In-process message delivery.

use negotopo_core::{AgentId, Message, NegotiationError, Result};
use std::collections::{HashMap, VecDeque};

/// Per-agent inboxes over a single append-only history.
///
/// Inboxes hold positions into `history`, so the read flag an agent sets
/// when consuming a message is the one the audit trail shows.
#[derive(Debug, Default)]
pub struct MessageBus {
    inboxes: HashMap<AgentId, VecDeque<usize>>,
    history: Vec<Message>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: &AgentId) -> Result<()> {
        if self.inboxes.contains_key(id) {
            return Err(NegotiationError::DuplicateNode(id.clone()));
        }
        self.inboxes.insert(id.clone(), VecDeque::new());
        Ok(())
    }

    /// Drops the agent's inbox. Its messages stay in history.
    pub fn unregister(&mut self, id: &AgentId) -> bool {
        self.inboxes.remove(id).is_some()
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.inboxes.contains_key(id)
    }

    /// Delivers to the receiver's inbox. False if either endpoint is unknown.
    ///
    /// Topology is not checked here.
    pub fn send(&mut self, mut message: Message) -> bool {
        if !self.contains(&message.from) || !self.contains(&message.to) {
            tracing::warn!(
                from = %message.from,
                to = %message.to,
                kind = %message.kind,
                "message to or from unknown agent dropped"
            );
            return false;
        }
        let pos = self.history.len();
        if message.id.is_empty() {
            message.id = format!("msg-{}", pos + 1);
        }
        message.read = false;
        let Some(inbox) = self.inboxes.get_mut(&message.to) else {
            return false;
        };
        inbox.push_back(pos);
        tracing::debug!(id = %message.id, from = %message.from, to = %message.to, kind = %message.kind, "message queued");
        self.history.push(message);
        true
    }

    /// Consumes unread messages sent in `round` or earlier, oldest first.
    ///
    /// A second call only returns what arrived since the first.
    pub fn inbox(&mut self, id: &AgentId, round: usize) -> Vec<Message> {
        let Some(queue) = self.inboxes.get_mut(id) else {
            return Vec::new();
        };
        let mut due = Vec::new();
        let mut later = VecDeque::new();
        for pos in queue.drain(..) {
            if self.history[pos].round <= round {
                due.push(pos);
            } else {
                later.push_back(pos);
            }
        }
        *queue = later;

        due.into_iter()
            .map(|pos| {
                let msg = &mut self.history[pos];
                msg.read = true;
                msg.clone()
            })
            .collect()
    }

    /// Unread messages waiting for `id`, across all rounds.
    pub fn pending_count(&self, id: &AgentId) -> usize {
        self.inboxes.get(id).map_or(0, VecDeque::len)
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn history_for_round(&self, round: usize) -> impl Iterator<Item = &Message> {
        self.history.iter().filter(move |m| m.round == round)
    }

    /// Empties every inbox and the history; registrations are kept.
    pub fn clear(&mut self) {
        for queue in self.inboxes.values_mut() {
            queue.clear();
        }
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus_with(ids: &[&str]) -> MessageBus {
        let mut bus = MessageBus::new();
        for id in ids {
            bus.register(&AgentId::from(*id)).unwrap();
        }
        bus
    }

    #[test]
    fn test_send_to_unknown_returns_false() {
        let mut bus = bus_with(&["a"]);
        let a = AgentId::from("a");
        let ghost = AgentId::from("ghost");
        assert!(!bus.send(Message::query(&a, &ghost, 0)));
        assert!(!bus.send(Message::query(&ghost, &a, 0)));
        assert!(bus.history().is_empty());
    }

    #[test]
    fn test_second_inbox_read_is_empty() {
        let mut bus = bus_with(&["a", "b"]);
        let (a, b) = (AgentId::from("a"), AgentId::from("b"));
        assert!(bus.send(Message::offer(&a, &b, 0, "tea")));
        assert_eq!(bus.pending_count(&b), 1);

        let first = bus.inbox(&b, 0);
        assert_eq!(first.len(), 1);
        assert!(first[0].read);
        assert_eq!(first[0].id, "msg-1");
        assert!(bus.inbox(&b, 0).is_empty());
        assert_eq!(bus.pending_count(&b), 0);
        assert!(bus.history()[0].read);
    }

    #[test]
    fn test_interleaved_arrivals_within_a_round() {
        let mut bus = bus_with(&["a", "b"]);
        let (a, b) = (AgentId::from("a"), AgentId::from("b"));
        bus.send(Message::offer(&a, &b, 1, "tea"));
        assert_eq!(bus.inbox(&b, 1).len(), 1);
        bus.send(Message::offer(&a, &b, 1, "milk"));
        let again = bus.inbox(&b, 1);
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].offered_value(), Some("milk"));
    }

    #[test]
    fn test_future_round_messages_wait() {
        let mut bus = bus_with(&["a", "b"]);
        let (a, b) = (AgentId::from("a"), AgentId::from("b"));
        bus.send(Message::offer(&a, &b, 0, "now"));
        bus.send(Message::offer(&a, &b, 2, "later"));
        assert_eq!(bus.inbox(&b, 1).len(), 1);
        assert_eq!(bus.pending_count(&b), 1);
        assert_eq!(bus.inbox(&b, 2)[0].offered_value(), Some("later"));
        assert_eq!(bus.history_for_round(2).count(), 1);
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut bus = bus_with(&["a"]);
        assert!(matches!(
            bus.register(&AgentId::from("a")),
            Err(NegotiationError::DuplicateNode(_))
        ));
        assert!(bus.unregister(&AgentId::from("a")));
        assert!(!bus.unregister(&AgentId::from("a")));
    }
}
