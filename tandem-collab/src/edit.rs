//! Position-based text edits.
//!
//! Positions and lengths count Unicode scalar values (`char`s), never bytes,
//! so a client indexing by codepoint and the server agree on every offset.
//!
//! Edits are applied destructively in arrival order: there is no transform
//! against concurrent edits.

use serde::{Deserialize, Serialize};

/// Edit payload as it travels in an `edit` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPayload {
    /// `"insert"` or `"delete"`
    pub operation: String,
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
}

impl EditPayload {
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self {
            operation: "insert".to_string(),
            position,
            content: Some(content.into()),
            length: None,
        }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Self {
            operation: "delete".to_string(),
            position,
            content: None,
            length: Some(length),
        }
    }

    /// Typed view of this payload, `None` for an unrecognized operation.
    pub fn operation(&self) -> Option<EditOperation> {
        match self.operation.as_str() {
            "insert" => Some(EditOperation::Insert {
                position: self.position,
                content: self.content.clone().unwrap_or_default(),
            }),
            "delete" => Some(EditOperation::Delete {
                position: self.position,
                length: self.length.unwrap_or(0),
            }),
            _ => None,
        }
    }

    /// Apply to `content`; an unrecognized operation leaves it unchanged.
    pub fn apply(&self, content: &str) -> String {
        match self.operation() {
            Some(op) => op.apply(content),
            None => content.to_string(),
        }
    }
}

/// A decoded edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOperation {
    Insert { position: usize, content: String },
    Delete { position: usize, length: usize },
}

impl EditOperation {
    /// Produce the new snapshot.
    ///
    /// - insert: `position` is clamped to `[0, len]`
    /// - delete: no-op when `position >= len`; the range end is clamped to `len`
    pub fn apply(&self, text: &str) -> String {
        match self {
            EditOperation::Insert { position, content } => {
                let at = byte_offset(text, *position);
                let mut out = String::with_capacity(text.len() + content.len());
                out.push_str(&text[..at]);
                out.push_str(content);
                out.push_str(&text[at..]);
                out
            }
            EditOperation::Delete { position, length } => {
                let len = text.chars().count();
                if *position >= len {
                    return text.to_string();
                }
                let end = position.saturating_add(*length).min(len);
                let start_byte = byte_offset(text, *position);
                let end_byte = byte_offset(text, end);
                let mut out = String::with_capacity(text.len() - (end_byte - start_byte));
                out.push_str(&text[..start_byte]);
                out.push_str(&text[end_byte..]);
                out
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EditOperation::Insert { .. } => "insert",
            EditOperation::Delete { .. } => "delete",
        }
    }
}

/// Byte offset of the `chars`-th character, or `text.len()` past the end.
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}
