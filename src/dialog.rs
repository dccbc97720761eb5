use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const DEMO_DIALOGS: &str = include_str!("../dialogs/deal_analyst.json");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Display form used in transcripts: `System`, `User`, `Assistant`.
    pub fn capitalized(&self) -> &'static str {
        match self {
            Self::System => "System",
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Ordered sequence of role-tagged messages submitted as one unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Dialog(Vec<Message>);

impl Dialog {
    pub fn new(messages: Vec<Message>) -> Self {
        Self(messages)
    }

    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.0.iter()
    }

    /// Split off a leading system message, if any.
    pub fn split_system(&self) -> (Option<&Message>, &[Message]) {
        match self.0.split_first() {
            Some((first, rest)) if first.role == Role::System => (Some(first), rest),
            _ => (None, &self.0),
        }
    }

    /// Check the chat structure: optional leading system message, then strict
    /// user/assistant alternation starting and ending with a user turn.
    ///
    /// `index` is the dialog's position in its batch and only feeds the error.
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.is_empty() {
            return Err(Error::invalid_dialog(index, "dialog is empty"));
        }

        let (_, turns) = self.split_system();
        if turns.is_empty() {
            return Err(Error::invalid_dialog(
                index,
                "dialog has no user message after the system prompt",
            ));
        }

        for (pos, msg) in turns.iter().enumerate() {
            let expected = if pos % 2 == 0 {
                Role::User
            } else {
                Role::Assistant
            };
            if msg.role != expected {
                return Err(Error::invalid_dialog(
                    index,
                    format!(
                        "message {} should be from {expected}, found {}",
                        pos + usize::from(turns.len() < self.len()),
                        msg.role
                    ),
                ));
            }
        }

        if turns.len() % 2 == 0 {
            return Err(Error::invalid_dialog(
                index,
                "last message must be from user",
            ));
        }
        Ok(())
    }
}

impl From<Vec<Message>> for Dialog {
    fn from(messages: Vec<Message>) -> Self {
        Self(messages)
    }
}

impl<'a> IntoIterator for &'a Dialog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parse a JSON array of dialogs: `[[{"role": "user", "content": "..."}], ...]`.
pub fn parse_dialogs(json: &str) -> Result<Vec<Dialog>> {
    serde_json::from_str(json).map_err(|e| Error::parse(format!("dialogs JSON: {e}")))
}

pub fn load_dialogs(path: &Path) -> Result<Vec<Dialog>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!("Failed to read dialogs {}: {e}", path.display()))
    })?;
    let dialogs = parse_dialogs(&content)?;
    if dialogs.is_empty() {
        return Err(Error::config(format!(
            "{} contains no dialogs",
            path.display()
        )));
    }
    Ok(dialogs)
}

/// The built-in demo: a deal-database analyst asked to record an M&A press release.
pub fn demo_dialogs() -> Result<Vec<Dialog>> {
    parse_dialogs(DEMO_DIALOGS)
}
