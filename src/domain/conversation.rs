use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UserId;

pub type ConversationId = Uuid;
pub type MessageId = Uuid;

/// Direct-message thread between exactly two users.
///
/// The participant columns keep the order of the first contact; identity is
/// the unordered pair, so {A, B} and {B, A} name the same conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_1: UserId,
    pub participant_2: UserId,
    pub last_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Start a conversation initiated by `initiator`. Panics if both ids are equal;
    /// callers reject self-conversations before getting here.
    pub fn new(initiator: UserId, recipient: UserId) -> Self {
        assert_ne!(initiator, recipient, "Conversation needs two distinct users");
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            participant_1: initiator,
            participant_2: recipient,
            last_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_participant(&self, user: UserId) -> bool {
        self.participant_1 == user || self.participant_2 == user
    }

    /// The other side of the conversation, if `user` takes part in it.
    pub fn partner_of(&self, user: UserId) -> Option<UserId> {
        if self.participant_1 == user {
            Some(self.participant_2)
        } else if self.participant_2 == user {
            Some(self.participant_1)
        } else {
            None
        }
    }

    pub fn pair(&self) -> ParticipantPair {
        ParticipantPair::new(self.participant_1, self.participant_2)
    }
}

/// Canonical (least, greatest) ordering of two user ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantPair {
    pub low: UserId,
    pub high: UserId,
}

impl ParticipantPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: ConversationId, sender_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

/// Client-side message list fed by an initial fetch and then by the change feed.
/// The same message can arrive through both paths, so appends are deduplicated by id.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
}

impl MessageLog {
    pub fn from_history(history: Vec<Message>) -> Self {
        let mut log = Self::default();
        for message in history {
            log.append(message);
        }
        log
    }

    /// Returns false when the message was already present.
    pub fn append(&mut self, message: Message) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        self.messages.push(message);
        true
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
}
