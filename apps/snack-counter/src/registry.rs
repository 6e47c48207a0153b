use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::protocol::{ServerMessage, SessionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantStatus {
    Connected,
    Waiting,
    Active,
    Finished,
}

/// Per-connection visitor record. The orchestrator only touches `status`
/// and `is_paying`; everything else is set at registration.
#[derive(Debug)]
pub struct Participant {
    pub durable_id: Option<String>,
    pub mood: Option<String>,
    pub mode: SessionMode,
    pub status: ParticipantStatus,
    pub joined_at: i64,
    pub is_paying: bool,
    pub room_tag: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl Participant {
    fn new(tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            durable_id: None,
            mood: None,
            mode: SessionMode::Text,
            status: ParticipantStatus::Connected,
            joined_at: Utc::now().timestamp_millis(),
            is_paying: false,
            room_tag: None,
            tx,
        }
    }

    /// Fire-and-forget notification; a dead channel means the disconnect
    /// path owns the cleanup.
    pub fn send(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }
}

/// Participant table plus the durable-id ⇄ connection-handle maps.
///
/// The durable id is self-asserted by the visitor and survives reconnects;
/// the handle is minted per connection. At most one handle is authoritative
/// per durable id (latest bind wins).
#[derive(Default)]
pub struct Registry {
    participants: HashMap<String, Participant>,
    durable_by_handle: HashMap<String, String>,
    handle_by_durable: HashMap<String, String>,
}

impl Registry {
    /// Record a fresh connection.
    pub fn insert(&mut self, handle: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.participants
            .insert(handle.to_string(), Participant::new(tx));
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.participants.contains_key(handle)
    }

    pub fn get(&self, handle: &str) -> Option<&Participant> {
        self.participants.get(handle)
    }

    pub fn get_mut(&mut self, handle: &str) -> Option<&mut Participant> {
        self.participants.get_mut(handle)
    }

    /// Drop the participant record. The handle→durable edge is kept as a
    /// tombstone so a command naming this handle can still be re-resolved
    /// to the durable id's latest live connection; the reverse edge is
    /// cleared when it pointed here, since a removed handle is no longer
    /// authoritative.
    pub fn remove(&mut self, handle: &str) -> Option<Participant> {
        if let Some(durable_id) = self.durable_by_handle.get(handle) {
            if self.handle_by_durable.get(durable_id).map(String::as_str) == Some(handle) {
                let durable_id = durable_id.clone();
                self.handle_by_durable.remove(&durable_id);
            }
        }
        self.participants.remove(handle)
    }

    pub fn send_to(&self, handle: &str, message: ServerMessage) {
        if let Some(participant) = self.participants.get(handle) {
            participant.send(message);
        }
    }

    /// Record/overwrite the mapping in both directions. The previous handle
    /// for this durable id loses its reverse edge; its forward edge stays
    /// until that record is discarded.
    pub fn bind(&mut self, handle: &str, durable_id: &str) {
        trace!(handle, durable_id, "bind identity");
        self.durable_by_handle
            .insert(handle.to_string(), durable_id.to_string());
        self.handle_by_durable
            .insert(durable_id.to_string(), handle.to_string());
    }

    pub fn resolve(&self, handle: &str) -> Option<&str> {
        self.durable_by_handle.get(handle).map(String::as_str)
    }

    pub fn latest_handle(&self, durable_id: &str) -> Option<&str> {
        self.handle_by_durable.get(durable_id).map(String::as_str)
    }

    /// Remove the handle→durable edge; clears the reverse edge only if this
    /// handle was still the latest one. A new handle may bind the durable id
    /// again later.
    pub fn unbind(&mut self, handle: &str) {
        if let Some(durable_id) = self.durable_by_handle.remove(handle) {
            if self.handle_by_durable.get(&durable_id).map(String::as_str) == Some(handle) {
                self.handle_by_durable.remove(&durable_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with(handles: &[&str]) -> Registry {
        let mut registry = Registry::default();
        for handle in handles {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.insert(handle, tx);
        }
        registry
    }

    #[test]
    fn latest_bind_wins() {
        let mut registry = registry_with(&["h1", "h2"]);
        registry.bind("h1", "guest-a");
        registry.bind("h2", "guest-a");

        assert_eq!(registry.latest_handle("guest-a"), Some("h2"));
        assert_eq!(registry.resolve("h1"), Some("guest-a"));
        assert_eq!(registry.resolve("h2"), Some("guest-a"));
    }

    #[test]
    fn unbind_clears_reverse_edge_only_for_latest() {
        let mut registry = registry_with(&["h1", "h2"]);
        registry.bind("h1", "guest-a");
        registry.bind("h2", "guest-a");

        // Stale handle: forward edge goes, reverse edge survives.
        registry.unbind("h1");
        assert_eq!(registry.resolve("h1"), None);
        assert_eq!(registry.latest_handle("guest-a"), Some("h2"));

        // Latest handle: reverse edge goes too, durable id may rebind later.
        registry.unbind("h2");
        assert_eq!(registry.latest_handle("guest-a"), None);

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert("h3", tx);
        registry.bind("h3", "guest-a");
        assert_eq!(registry.latest_handle("guest-a"), Some("h3"));
    }

    #[test]
    fn remove_keeps_forward_edge_as_tombstone() {
        let mut registry = registry_with(&["h1"]);
        registry.bind("h1", "guest-a");

        assert!(registry.remove("h1").is_some());
        assert!(!registry.contains("h1"));
        // No live handle is authoritative any more, but the stale handle
        // still resolves so a late command can find the durable id.
        assert_eq!(registry.latest_handle("guest-a"), None);
        assert_eq!(registry.resolve("h1"), Some("guest-a"));
        assert!(registry.remove("h1").is_none());

        // A reconnect rebinds; the stale handle now leads to the new one.
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.insert("h2", tx);
        registry.bind("h2", "guest-a");
        assert_eq!(registry.latest_handle("guest-a"), Some("h2"));
    }
}
