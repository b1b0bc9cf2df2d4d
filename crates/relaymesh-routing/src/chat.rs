//! Chats, groups and their message logs

use chrono::{DateTime, Utc};
use relaymesh_protocol::payload::{GroupInfo, MessageKind};
use relaymesh_protocol::{NodeId, PacketId, Priority};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Id of the shared emergency chat
pub const EMERGENCY_CHAT_ID: &str = "emergency";

/// Body shown when an encrypted message cannot be opened
pub const UNREADABLE_PLACEHOLDER: &str = "[encrypted message: key unavailable]";

/// Chat id for a one-to-one conversation with `peer`
pub fn private_chat_id(peer: &NodeId) -> String {
    format!("chat_{}", peer.to_hex())
}

/// Delivery status of a message
///
/// Ordered: a message only moves forward, except `Failed -> Queued` when
/// it is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageStatus {
    Queued,
    Sending,
    Sent,
    Relayed,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, MessageStatus::Queued) => true,
            (MessageStatus::Failed, _) => false,
            (MessageStatus::Delivered, _) => false,
            (_, MessageStatus::Failed) => true,
            (current, next) => next > current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: PacketId,
    pub chat_id: String,
    pub sender: NodeId,
    pub content: String,
    pub status: MessageStatus,
    pub hops: u8,
    pub encrypted: bool,
    pub priority: Priority,
    pub kind: MessageKind,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatKind {
    Private,
    Group,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub kind: ChatKind,
    pub name: String,
    pub participants: Vec<NodeId>,
    pub encrypted: bool,
    pub last_message_at: Option<DateTime<Utc>>,
    pub unread: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub participants: Vec<NodeId>,
    pub admins: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn info(&self) -> GroupInfo {
        GroupInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            participants: self.participants.clone(),
        }
    }
}

/// Persisted form of a `ChatLog`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatSnapshot {
    pub chats: Vec<Chat>,
    pub groups: Vec<Group>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
pub struct ChatLog {
    chats: HashMap<String, Chat>,
    groups: HashMap<String, Group>,
    messages: HashMap<String, Vec<Message>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the private chat with `peer`; the flag is `true` when
    /// the chat was created
    pub fn ensure_private(&mut self, peer: NodeId, name: Option<&str>) -> (Chat, bool) {
        let id = private_chat_id(&peer);
        if let Some(chat) = self.chats.get(&id) {
            return (chat.clone(), false);
        }
        let chat = Chat {
            id: id.clone(),
            kind: ChatKind::Private,
            name: name.map(str::to_string).unwrap_or_else(|| peer.to_string()),
            participants: vec![peer],
            encrypted: true,
            last_message_at: None,
            unread: 0,
        };
        self.chats.insert(id, chat.clone());
        (chat, true)
    }

    pub fn ensure_emergency(&mut self) -> (Chat, bool) {
        if let Some(chat) = self.chats.get(EMERGENCY_CHAT_ID) {
            return (chat.clone(), false);
        }
        let chat = Chat {
            id: EMERGENCY_CHAT_ID.to_string(),
            kind: ChatKind::Emergency,
            name: "Emergency Broadcast".to_string(),
            participants: Vec::new(),
            encrypted: false,
            last_message_at: None,
            unread: 0,
        };
        self.chats.insert(chat.id.clone(), chat.clone());
        (chat, true)
    }

    /// Register a group (created locally or learned from a group message)
    pub fn ensure_group(&mut self, group: Group) -> (Chat, bool) {
        if let Some(chat) = self.chats.get(&group.id) {
            return (chat.clone(), false);
        }
        let chat = Chat {
            id: group.id.clone(),
            kind: ChatKind::Group,
            name: group.name.clone(),
            participants: group.participants.clone(),
            encrypted: false,
            last_message_at: None,
            unread: 0,
        };
        self.chats.insert(chat.id.clone(), chat.clone());
        self.groups.insert(group.id.clone(), group);
        (chat, true)
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.get(id)
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    /// All groups, by name
    pub fn groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        groups
    }

    /// All chats, most recently active first
    pub fn chats(&self) -> Vec<Chat> {
        let mut chats: Vec<Chat> = self.chats.values().cloned().collect();
        chats.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        chats
    }

    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.messages.get(chat_id).cloned().unwrap_or_default()
    }

    pub fn message(&self, chat_id: &str, id: &PacketId) -> Option<&Message> {
        self.messages
            .get(chat_id)
            .and_then(|log| log.iter().find(|m| m.id == *id))
    }

    /// Find a message in any chat
    pub fn find(&self, id: &PacketId) -> Option<&Message> {
        self.messages.values().flatten().find(|m| m.id == *id)
    }

    /// Append a message; `incoming` messages count as unread
    pub fn append(&mut self, message: Message, incoming: bool) {
        if let Some(chat) = self.chats.get_mut(&message.chat_id) {
            chat.last_message_at = Some(
                chat.last_message_at
                    .map_or(message.sent_at, |at| at.max(message.sent_at)),
            );
            if incoming {
                chat.unread += 1;
            }
        }
        self.messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
    }

    /// Apply a status transition; returns the updated message when the
    /// transition is allowed
    pub fn update_status(
        &mut self,
        chat_id: &str,
        id: &PacketId,
        status: MessageStatus,
    ) -> Option<Message> {
        let message = self
            .messages
            .get_mut(chat_id)?
            .iter_mut()
            .find(|m| m.id == *id)?;
        if !message.status.can_transition_to(status) {
            return None;
        }
        message.status = status;
        Some(message.clone())
    }

    pub fn mark_read(&mut self, chat_id: &str) {
        if let Some(chat) = self.chats.get_mut(chat_id) {
            chat.unread = 0;
        }
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            chats: self.chats.values().cloned().collect(),
            groups: self.groups.values().cloned().collect(),
            messages: self.messages.values().flatten().cloned().collect(),
        }
    }

    pub fn restore(&mut self, snapshot: ChatSnapshot) {
        for chat in snapshot.chats {
            self.chats.insert(chat.id.clone(), chat);
        }
        for group in snapshot.groups {
            self.groups.insert(group.id.clone(), group);
        }
        let mut messages = snapshot.messages;
        messages.sort_by_key(|m| m.sent_at);
        for message in messages {
            self.messages
                .entry(message.chat_id.clone())
                .or_default()
                .push(message);
        }
    }
}
