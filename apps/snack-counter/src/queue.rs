use crate::protocol::QueueEntry;

/// FIFO waiting queue of connection handles. Insertion order is arrival
/// order; no priority, no starvation handling.
#[derive(Default)]
pub struct WaitingQueue {
    order: Vec<String>,
}

impl WaitingQueue {
    /// Append if absent. Re-registering keeps the original position.
    pub fn enqueue(&mut self, handle: &str) {
        if !self.order.iter().any(|h| h == handle) {
            self.order.push(handle.to_string());
        }
    }

    pub fn remove(&mut self, handle: &str) {
        self.order.retain(|h| h != handle);
    }

    /// Drop every handle the predicate no longer knows.
    pub fn prune<F: Fn(&str) -> bool>(&mut self, exists: F) {
        self.order.retain(|h| exists(h));
    }

    /// 1-based position, or 0 when the handle is not waiting.
    pub fn position_of(&self, handle: &str) -> usize {
        self.order
            .iter()
            .position(|h| h == handle)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Ordered snapshot for broadcast, pruned first: handles for which the
    /// lookup returns no entry are dropped from the queue.
    pub fn snapshot<F: Fn(&str) -> Option<QueueEntry>>(&mut self, entry: F) -> Vec<QueueEntry> {
        self.prune(|h| entry(h).is_some());
        self.order.iter().filter_map(|h| entry(h)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionMode;

    fn entry(handle: &str) -> QueueEntry {
        QueueEntry {
            handle: handle.to_string(),
            mood: None,
            mode: SessionMode::Text,
            joined_at: 0,
        }
    }

    #[test]
    fn enqueue_is_idempotent_and_fifo() {
        let mut queue = WaitingQueue::default();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("a");
        queue.enqueue("c");

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.position_of("a"), 1);
        assert_eq!(queue.position_of("b"), 2);
        assert_eq!(queue.position_of("c"), 3);
        assert_eq!(queue.position_of("missing"), 0);
    }

    #[test]
    fn positions_stable_under_unrelated_mutations() {
        let mut queue = WaitingQueue::default();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("c");

        queue.remove("b");
        assert_eq!(queue.position_of("a"), 1);
        assert_eq!(queue.position_of("c"), 2);

        queue.enqueue("d");
        assert_eq!(queue.position_of("a"), 1);
        assert_eq!(queue.position_of("c"), 2);
        assert_eq!(queue.position_of("d"), 3);
    }

    #[test]
    fn prune_drops_vanished_handles() {
        let mut queue = WaitingQueue::default();
        queue.enqueue("a");
        queue.enqueue("b");
        queue.enqueue("c");

        queue.prune(|h| h != "b");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.position_of("c"), 2);
    }

    #[test]
    fn snapshot_prunes_before_listing() {
        let mut queue = WaitingQueue::default();
        queue.enqueue("a");
        queue.enqueue("gone");
        queue.enqueue("b");

        let snapshot = queue.snapshot(|h| (h != "gone").then(|| entry(h)));
        assert_eq!(
            snapshot.iter().map(|e| e.handle.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        // The vanished handle is gone from the queue itself, not just the view.
        assert_eq!(queue.len(), 2);
    }
}
