use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Message author. Roles outside the three known ones are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Other(role) => role,
        }
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    role: Role,
    content: String,
    created_at: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// One entry of the request `messages` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

/// Handle to the assistant message currently being streamed into.
///
/// Not `Clone`: it is consumed by [`Conversation::commit`] or
/// [`Conversation::discard`], so a reply can only be settled once.
#[derive(Debug)]
pub struct PendingReply {
    index: usize,
}

/// Linear chat history. Insertion order is the order sent on the wire.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a conversation seeded with a single system prompt.
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conversation = Self::new();
        conversation.append(Role::System, prompt);
        conversation
    }

    pub fn append(&mut self, role: impl Into<Role>, content: impl Into<String>) {
        self.messages.push(Message::new(role.into(), content));
    }

    /// Drop everything except system messages, keeping their relative order.
    pub fn clear(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    pub fn to_wire_format(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .map(|m| WireMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Content of the first system message, which is "the" system prompt.
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }

    /// Replace the first system message in place, or append one if none exists.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.messages.iter_mut().find(|m| m.role == Role::System) {
            Some(existing) => *existing = Message::new(Role::System, prompt),
            None => self.append(Role::System, prompt),
        }
    }

    /// Append an empty assistant message to stream a reply into.
    pub fn begin_reply(&mut self) -> PendingReply {
        self.append(Role::Assistant, "");
        PendingReply {
            index: self.messages.len() - 1,
        }
    }

    pub fn push_delta(&mut self, reply: &PendingReply, delta: &str) {
        if let Some(message) = self.messages.get_mut(reply.index) {
            message.content.push_str(delta);
        }
    }

    /// Settle a finished reply. An assistant message that never received
    /// content is dropped rather than kept empty.
    pub fn commit(&mut self, reply: PendingReply) {
        let empty = self
            .messages
            .get(reply.index)
            .is_some_and(|m| m.content.is_empty());
        if empty {
            self.discard(reply);
        }
    }

    pub fn discard(&mut self, reply: PendingReply) {
        if reply.index < self.messages.len() {
            self.messages.remove(reply.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Conversation {
        let mut c = Conversation::with_system_prompt("be brief");
        c.append(Role::User, "hi");
        c.append(Role::Assistant, "hello");
        c.append(Role::System, "second system");
        c.append("tool", "ignored by renderers");
        c
    }

    #[test]
    fn clear_keeps_only_system_messages_in_order() {
        let mut c = sample();
        c.clear();
        let contents: Vec<&str> = c.messages().iter().map(|m| m.content()).collect();
        assert_eq!(contents, vec!["be brief", "second system"]);
        assert!(c.messages().iter().all(|m| *m.role() == Role::System));
    }

    #[test]
    fn clear_on_conversation_without_system_empties_it() {
        let mut c = Conversation::new();
        c.append(Role::User, "a");
        c.append(Role::Assistant, "b");
        c.clear();
        assert!(c.is_empty());
    }

    #[test]
    fn wire_format_projects_role_and_content_in_order() {
        let c = sample();
        let wire = c.to_wire_format();
        assert_eq!(wire.len(), c.len());
        for (w, m) in wire.iter().zip(c.messages()) {
            assert_eq!(w.role, m.role().as_str());
            assert_eq!(w.content, m.content());
        }
        assert_eq!(wire[4].role, "tool");
    }

    #[test]
    fn wire_format_serializes_without_timestamps() {
        let mut c = Conversation::new();
        c.append(Role::User, "hi");
        let json = serde_json::to_value(c.to_wire_format()).unwrap();
        assert_eq!(json, serde_json::json!([{"role": "user", "content": "hi"}]));
    }

    #[test]
    fn messages_are_stamped_in_append_order() {
        let before = Utc::now();
        let c = sample();
        let after = Utc::now();
        let stamps: Vec<_> = c.messages().iter().map(Message::created_at).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(stamps.iter().all(|t| *t >= before && *t <= after));
    }

    #[test]
    fn unknown_roles_round_trip_verbatim() {
        assert_eq!(Role::from("function"), Role::Other("function".into()));
        assert_eq!(Role::from("function").as_str(), "function");
        assert_eq!(Role::from("assistant"), Role::Assistant);
    }

    #[test]
    fn set_system_prompt_replaces_first_only() {
        let mut c = sample();
        c.set_system_prompt("new prompt");
        assert_eq!(c.system_prompt(), Some("new prompt"));
        assert_eq!(c.messages()[0].content(), "new prompt");
        assert_eq!(c.messages()[3].content(), "second system");
        assert_eq!(c.len(), 5);
    }

    #[test]
    fn set_system_prompt_appends_when_absent() {
        let mut c = Conversation::new();
        c.append(Role::User, "hi");
        c.set_system_prompt("sys");
        assert_eq!(c.len(), 2);
        assert_eq!(*c.messages()[1].role(), Role::System);
        assert_eq!(c.system_prompt(), Some("sys"));
    }

    #[test]
    fn reply_handle_streams_into_its_message() {
        let mut c = Conversation::with_system_prompt("sys");
        c.append(Role::User, "q");
        let reply = c.begin_reply();
        c.push_delta(&reply, "Hel");
        c.push_delta(&reply, "lo");
        c.commit(reply);
        assert_eq!(c.len(), 3);
        assert_eq!(c.messages()[2].content(), "Hello");
        assert_eq!(*c.messages()[2].role(), Role::Assistant);
    }

    #[test]
    fn empty_reply_is_dropped_on_commit() {
        let mut c = Conversation::new();
        c.append(Role::User, "q");
        let reply = c.begin_reply();
        c.commit(reply);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn discard_removes_partial_reply() {
        let mut c = Conversation::new();
        c.append(Role::User, "q");
        let reply = c.begin_reply();
        c.push_delta(&reply, "partial");
        c.discard(reply);
        assert_eq!(c.len(), 1);
        assert_eq!(c.messages()[0].content(), "q");
    }
}
