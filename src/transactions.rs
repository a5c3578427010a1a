//! Per-connection transaction queue: MULTI/EXEC/DISCARD (spec §3, §4.2).

/// The set of commands that are never themselves queued, even while a
/// transaction is open (spec §4.5 routing rule 2).
pub const TRANSACTION_COMMANDS: &[&str] = &["MULTI", "EXEC", "DISCARD", "WATCH"];

#[derive(Debug, Default)]
pub struct TransactionState {
    queue: Option<Vec<(String, Vec<String>)>>,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        self.queue.is_some()
    }

    pub fn begin(&mut self) {
        self.queue = Some(Vec::new());
    }

    pub fn enqueue(&mut self, name: String, args: Vec<String>) {
        if let Some(queue) = self.queue.as_mut() {
            queue.push((name, args));
        }
    }

    /// Clears the queue atomically and returns what was queued, so the
    /// caller can execute it without any further command being able to
    /// observe or extend the in-flight transaction (spec §4.2).
    pub fn take(&mut self) -> Option<Vec<(String, Vec<String>)>> {
        self.queue.take()
    }

    pub fn discard(&mut self) {
        self.queue = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_in_order_until_taken() {
        let mut tx = TransactionState::default();
        assert!(!tx.is_active());
        tx.begin();
        assert!(tx.is_active());
        tx.enqueue("SET".into(), vec!["x".into(), "1".into()]);
        tx.enqueue("INCR".into(), vec!["x".into()]);
        let queued = tx.take().unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, "SET");
        assert!(!tx.is_active());
    }

    #[test]
    fn discard_clears_without_executing() {
        let mut tx = TransactionState::default();
        tx.begin();
        tx.enqueue("SET".into(), vec!["x".into(), "1".into()]);
        tx.discard();
        assert!(!tx.is_active());
        assert!(tx.take().is_none());
    }
}
