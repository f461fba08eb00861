//! The client-side document buffer.
//!
//! Holds a [`Replica`] seeded from the open-document snapshot. Local edits
//! go through the diff generator so the server only ever sees operation
//! batches; remote batches merge through the same revert–sort–reapply path
//! the server uses.

use coedit_engine::{diff, Operation, Replica};

pub struct EditorBuffer {
    doc: i64,
    replica: Replica,
}

impl EditorBuffer {
    /// Seed a buffer from a content snapshot.
    pub fn new(doc: i64, snapshot: impl Into<String>) -> Self {
        Self {
            doc,
            replica: Replica::new(snapshot),
        }
    }

    pub fn doc(&self) -> i64 {
        self.doc
    }

    pub fn content(&self) -> &str {
        self.replica.content()
    }

    /// Replace the buffer content with `new_text`, committing the minimal
    /// operation batch locally and returning it for transmission. Returns
    /// an empty batch when nothing changed.
    pub fn edit(&mut self, new_text: &str) -> Vec<Operation> {
        let ops = diff(self.replica.content(), new_text);
        for op in &ops {
            self.replica.commit_local(op.clone());
        }
        ops
    }

    /// Merge a broadcast batch from another session.
    pub fn merge_remote(&mut self, ops: &[Operation]) {
        self.replica.merge(ops);
    }
}
