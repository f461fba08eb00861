//! The atomic edit primitive.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Last timestamp handed out by [`timestamp_now`].
static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Wall-clock timestamp in microseconds, strictly increasing within this
/// process. Operations from different machines order by raw wall clock;
/// skew between machines is an accepted limitation of the scheme.
pub fn timestamp_now() -> i64 {
    let now = chrono::Utc::now().timestamp_micros();
    let mut prev = LAST_TIMESTAMP.load(Ordering::SeqCst);
    loop {
        let next = now.max(prev + 1);
        match LAST_TIMESTAMP.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(observed) => prev = observed,
        }
    }
}

/// What an operation does to the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
}

/// An atomic insert or delete at a (line, char) position, 0-indexed.
///
/// The timestamp is assigned when the operation is generated and is the
/// *only* comparison key: two operations compare by timestamp regardless of
/// kind or position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub text: String,
    pub line: usize,
    #[serde(rename = "char")]
    pub ch: usize,
    pub timestamp: i64,
}

impl Operation {
    /// Insert `text` at (line, ch), timestamped now.
    pub fn insert(text: impl Into<String>, line: usize, ch: usize) -> Self {
        Self {
            kind: OpKind::Insert,
            text: text.into(),
            line,
            ch,
            timestamp: timestamp_now(),
        }
    }

    /// Delete `text` starting at (line, ch), timestamped now.
    pub fn delete(text: impl Into<String>, line: usize, ch: usize) -> Self {
        Self {
            kind: OpKind::Delete,
            text: text.into(),
            line,
            ch,
            timestamp: timestamp_now(),
        }
    }

    /// Replace the timestamp (tests and replays).
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Apply this operation to `content`, returning the new content.
    ///
    /// A line index past the end behaves as if the content were padded with
    /// empty lines; a delete extending past end-of-content truncates
    /// silently. Replicas must stay alive on malformed ranges, so neither
    /// case is an error.
    pub fn apply(&self, content: &str) -> String {
        let offset = self.char_offset(content);
        match self.kind {
            OpKind::Insert => splice_in(content, offset, &self.text),
            OpKind::Delete => splice_out(content, offset, self.text.chars().count()),
        }
    }

    /// Structural inverse of [`Operation::apply`].
    pub fn revert(&self, content: &str) -> String {
        let offset = self.char_offset(content);
        match self.kind {
            OpKind::Insert => splice_out(content, offset, self.text.chars().count()),
            OpKind::Delete => splice_in(content, offset, &self.text),
        }
    }

    /// Absolute character offset of (line, ch) in `content`: the summed
    /// character lengths of all prior lines plus `ch`, clamped to the
    /// content length.
    fn char_offset(&self, content: &str) -> usize {
        let mut offset = 0;
        let mut lines = content.split_inclusive('\n');
        for _ in 0..self.line {
            match lines.next() {
                Some(line) => offset += line.chars().count(),
                None => break,
            }
        }
        let total = content.chars().count();
        (offset + self.ch).min(total)
    }
}

/// Byte index of character offset `char_offset`, or the end of `content`.
fn byte_index(content: &str, char_offset: usize) -> usize {
    content
        .char_indices()
        .nth(char_offset)
        .map(|(i, _)| i)
        .unwrap_or(content.len())
}

fn splice_in(content: &str, offset: usize, text: &str) -> String {
    let at = byte_index(content, offset);
    let mut out = String::with_capacity(content.len() + text.len());
    out.push_str(&content[..at]);
    out.push_str(text);
    out.push_str(&content[at..]);
    out
}

fn splice_out(content: &str, offset: usize, len: usize) -> String {
    let start = byte_index(content, offset);
    let end = byte_index(content, offset + len);
    let mut out = String::with_capacity(content.len());
    out.push_str(&content[..start]);
    out.push_str(&content[end..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_at_line_start() {
        let op = Operation::insert("hi ", 0, 0);
        assert_eq!(op.apply("world"), "hi world");
    }

    #[test]
    fn insert_mid_line() {
        let op = Operation::insert("c", 0, 1);
        assert_eq!(op.apply("ab"), "acb");
    }

    #[test]
    fn insert_on_later_line() {
        let op = Operation::insert("X", 1, 1);
        assert_eq!(op.apply("ab\ncd\nef"), "ab\ncXd\nef");
    }

    #[test]
    fn delete_mid_line() {
        let op = Operation::delete("cd", 1, 0);
        assert_eq!(op.apply("ab\ncd\nef"), "ab\n\nef");
    }

    #[test]
    fn delete_spanning_newline() {
        let op = Operation::delete("b\nc", 0, 1);
        assert_eq!(op.apply("ab\ncd"), "ad");
    }

    #[test]
    fn line_past_end_appends() {
        let op = Operation::insert("tail", 10, 0);
        assert_eq!(op.apply("ab\n"), "ab\ntail");
    }

    #[test]
    fn delete_past_end_truncates() {
        let op = Operation::delete("bcdef", 0, 1);
        assert_eq!(op.apply("abc"), "a");
    }

    #[test]
    fn revert_undoes_apply() {
        let content = "line one\nline two\n";
        for op in [
            Operation::insert("XY", 0, 4),
            Operation::insert("\nnew line", 1, 8),
            Operation::delete("one", 0, 5),
            Operation::delete("two", 1, 5),
        ] {
            let applied = op.apply(content);
            assert_eq!(op.revert(&applied), content, "op: {op:?}");
        }
    }

    #[test]
    fn multibyte_text_is_spliced_on_char_boundaries() {
        let op = Operation::insert("é", 0, 1);
        let applied = op.apply("aü");
        assert_eq!(applied, "aéü");
        assert_eq!(op.revert(&applied), "aü");
    }

    #[test]
    fn timestamps_strictly_increase() {
        let a = timestamp_now();
        let b = timestamp_now();
        let c = timestamp_now();
        assert!(a < b && b < c);
    }

    #[test]
    fn serde_uses_char_field_name() {
        let op = Operation::insert("x", 2, 5).with_timestamp(42);
        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains(r#""char":5"#), "{json}");
        assert!(json.contains(r#""kind":"insert""#), "{json}");
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
