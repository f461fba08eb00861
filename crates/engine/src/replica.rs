//! A replica: current content plus the history of applied operations.
//!
//! The authoritative store and every live editor buffer each hold one of
//! these and merge incoming batches the same way, which is what keeps them
//! convergent without a central sequencer.

use crate::operation::Operation;

/// Content with its timestamp-ordered applied-operation history.
#[derive(Debug, Clone, Default)]
pub struct Replica {
    content: String,
    /// Sorted ascending by timestamp.
    history: Vec<Operation>,
}

impl Replica {
    /// A replica with fresh content and empty history (e.g. from a
    /// snapshot).
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            history: Vec::new(),
        }
    }

    /// Reassemble a replica from stored parts. The history is re-sorted in
    /// case the caller persisted it unsorted.
    pub fn from_parts(content: String, mut history: Vec<Operation>) -> Self {
        history.sort_by_key(|op| op.timestamp);
        Self { content, history }
    }

    pub fn into_parts(self) -> (String, Vec<Operation>) {
        (self.content, self.history)
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn history(&self) -> &[Operation] {
        &self.history
    }

    /// Apply an operation generated against the current content (a local
    /// edit, which is by construction newer than everything in history).
    pub fn commit_local(&mut self, op: Operation) {
        self.content = op.apply(&self.content);
        let at = self
            .history
            .partition_point(|h| h.timestamp <= op.timestamp);
        self.history.insert(at, op);
    }

    /// Merge a batch of remote operations: revert–sort–reapply.
    ///
    /// For each incoming operation in ascending timestamp order: revert the
    /// strictly-newer history suffix (descending), apply the operation,
    /// insert it into history, reapply the suffix (ascending). Operations
    /// already present are skipped, so re-delivery is harmless.
    pub fn merge(&mut self, batch: &[Operation]) {
        let mut incoming: Vec<&Operation> = batch.iter().collect();
        incoming.sort_by_key(|op| op.timestamp);

        for op in incoming {
            if self.contains(op) {
                continue;
            }
            let split = self
                .history
                .partition_point(|h| h.timestamp <= op.timestamp);

            for newer in self.history[split..].iter().rev() {
                self.content = newer.revert(&self.content);
            }
            self.content = op.apply(&self.content);
            self.history.insert(split, op.clone());
            for newer in &self.history[split + 1..] {
                self.content = newer.apply(&self.content);
            }
        }
    }

    fn contains(&self, op: &Operation) -> bool {
        let start = self
            .history
            .partition_point(|h| h.timestamp < op.timestamp);
        self.history[start..]
            .iter()
            .take_while(|h| h.timestamp == op.timestamp)
            .any(|h| h == op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(text: &str, line: usize, ch: usize, ts: i64) -> Operation {
        Operation::insert(text, line, ch).with_timestamp(ts)
    }

    fn delete(text: &str, line: usize, ch: usize, ts: i64) -> Operation {
        Operation::delete(text, line, ch).with_timestamp(ts)
    }

    #[test]
    fn commit_local_applies_and_records() {
        let mut replica = Replica::new("ab");
        replica.commit_local(insert("c", 0, 1, 10));
        assert_eq!(replica.content(), "acb");
        assert_eq!(replica.history().len(), 1);
    }

    #[test]
    fn merge_single_batch() {
        let mut replica = Replica::new("ab");
        replica.merge(&[insert("c", 0, 1, 10)]);
        assert_eq!(replica.content(), "acb");
    }

    #[test]
    fn merge_is_arrival_order_independent() {
        // In-range edits on a shared base: whatever order they arrive in,
        // revert–sort–reapply replays them in timestamp order.
        let base = "aaaa\nbbbb\ncccc";
        let ops = vec![
            insert("X", 0, 2, 10),
            delete("bb", 1, 1, 20),
            insert("YY", 2, 4, 30),
            insert("Z", 0, 0, 40),
        ];

        let orders: &[[usize; 4]] = &[
            [0, 1, 2, 3],
            [3, 2, 1, 0],
            [2, 0, 3, 1],
            [1, 3, 0, 2],
        ];
        let mut finals = Vec::new();
        for order in orders {
            let mut replica = Replica::new(base);
            for &i in order {
                replica.merge(std::slice::from_ref(&ops[i]));
            }
            finals.push(replica.content().to_string());
        }
        for content in &finals {
            assert_eq!(content, "ZaaXaa\nbb\nccccYY", "finals: {finals:?}");
        }
    }

    #[test]
    fn late_arrival_is_reordered_before_newer_ops() {
        // Newer op arrives first; older op must still take effect as if it
        // had been applied first.
        let older = insert("A", 0, 0, 10);
        let newer = insert("B", 0, 0, 20);

        let mut early_first = Replica::new("x");
        early_first.merge(std::slice::from_ref(&older));
        early_first.merge(std::slice::from_ref(&newer));

        let mut late_first = Replica::new("x");
        late_first.merge(std::slice::from_ref(&newer));
        late_first.merge(std::slice::from_ref(&older));

        assert_eq!(early_first.content(), late_first.content());
        assert_eq!(early_first.content(), "BAx");
    }

    #[test]
    fn redelivered_ops_are_skipped() {
        let op = insert("c", 0, 1, 10);
        let mut replica = Replica::new("ab");
        replica.merge(std::slice::from_ref(&op));
        replica.merge(std::slice::from_ref(&op));
        assert_eq!(replica.content(), "acb");
        assert_eq!(replica.history().len(), 1);
    }

    #[test]
    fn history_stays_sorted() {
        let mut replica = Replica::new("");
        replica.merge(&[insert("b", 0, 0, 20)]);
        replica.merge(&[insert("a", 0, 0, 10)]);
        replica.merge(&[insert("c", 0, 0, 30)]);
        let stamps: Vec<i64> = replica.history().iter().map(|op| op.timestamp).collect();
        assert_eq!(stamps, vec![10, 20, 30]);
    }

    #[test]
    fn out_of_range_batch_does_not_poison_replica() {
        let mut replica = Replica::new("ab");
        replica.merge(&[delete("zzzzzz", 9, 9, 10)]);
        // Clamped to a no-op delete at end of content.
        assert_eq!(replica.content(), "ab");
        replica.merge(&[insert("c", 0, 1, 20)]);
        assert_eq!(replica.content(), "acb");
    }
}
