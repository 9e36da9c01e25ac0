use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The media kind of a message's content.
///
/// Research sessions only ever produce `Text`, but transcripts imported from
/// chat-completions payloads may carry other kinds; they round-trip through
/// the canonical form untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    File,
}

/// A message in a conversation, containing a role and text content.
///
/// Messages are the primary data structure for session transcripts and for
/// everything handed to the LLM capability. Each message has a role
/// (one of the [`Message`] role constants) and text content; timestamp,
/// sender, and message-id are optional and omitted from the canonical
/// serialized form when unset.
///
/// # Examples
///
/// ```
/// use delver::message::Message;
///
/// let user_msg = Message::user("What changed in the 2024 EU AI Act draft?");
/// let system_msg = Message::system("You are a careful research assistant.");
///
/// assert!(user_msg.has_role(Message::USER));
/// assert!(!user_msg.has_role(Message::ASSISTANT));
/// ```
///
/// # Serialization
///
/// The serde field order is fixed, and optional fields are skipped when
/// `None`, so equal messages always serialize to the same bytes:
///
/// ```
/// use delver::message::Message;
///
/// let msg = Message::user("test");
/// let json = serde_json::to_string(&msg).unwrap();
/// let parsed: Message = serde_json::from_str(&json).unwrap();
/// assert_eq!(msg, parsed);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender. Use the constants on [`Message`].
    pub role: String,
    /// The text content of the message.
    pub content: String,
    /// The media kind of `content`.
    #[serde(default, skip_serializing_if = "is_text")]
    pub content_kind: ContentKind,
    /// When the message was produced, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Free-form sender label (distinct from role).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Opaque message identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

fn is_text(kind: &ContentKind) -> bool {
    *kind == ContentKind::Text
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// AI assistant response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";
    /// Developer instruction message role.
    pub const DEVELOPER: &'static str = "developer";
    /// Tool output message role.
    pub const TOOL: &'static str = "tool";
    /// Function result message role.
    pub const FUNCTION: &'static str = "function";

    /// Creates a new text message with the specified role and content.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            ..Self::default()
        }
    }

    /// Creates a user message with the specified content.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message with the specified content.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message with the specified content.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Stamps the message with the current UTC time.
    #[must_use]
    pub fn timestamped(mut self) -> Self {
        self.timestamp = Some(Utc::now());
        self
    }

    /// Returns true if this message has the specified role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}

/// The canonical `{role, content}` pair consumed by the LLM capability.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Ordered sequence of [`Message`] values forming a session transcript.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, preserving insertion order.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Project the log onto the `{role, content}` pairs the LLM capability
    /// expects, dropping the optional metadata fields.
    #[must_use]
    pub fn chat_turns(&self) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .map(|m| ChatTurn {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect()
    }
}

impl From<Vec<Message>> for MessageLog {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}

impl<'a> IntoIterator for &'a MessageLog {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
