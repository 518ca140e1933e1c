use tracing::{debug, warn};

use crate::domain::{Conversation, UserId};
use crate::storage::{InsertOutcome, Repository};

use super::AppError;

/// Storage operations the conversation resolver depends on.
#[allow(async_fn_in_trait)]
pub trait ConversationStore {
    /// Conversation between the two users, in either participant order.
    async fn find_between(&self, a: UserId, b: UserId) -> anyhow::Result<Option<Conversation>>;

    /// Insert a new conversation. A concurrent insert for the same pair
    /// surfaces as `InsertOutcome::Conflict`.
    async fn insert(&self, conversation: &Conversation) -> anyhow::Result<InsertOutcome>;
}

impl ConversationStore for Repository {
    async fn find_between(&self, a: UserId, b: UserId) -> anyhow::Result<Option<Conversation>> {
        self.find_conversation_between(a, b).await
    }

    async fn insert(&self, conversation: &Conversation) -> anyhow::Result<InsertOutcome> {
        self.insert_conversation(conversation).await
    }
}

/// Find or create the single conversation between `initiator` and `recipient`.
///
/// Calling it again, in either order, returns the same conversation. When two
/// callers race to create the first one, the loser's insert hits the pair index
/// and it picks up the winner's record instead.
pub async fn resolve_conversation<S: ConversationStore>(
    store: &S,
    initiator: UserId,
    recipient: UserId,
) -> Result<Conversation, AppError> {
    if initiator == recipient {
        return Err(AppError::InvalidOperation(
            "cannot start a conversation with yourself".to_string(),
        ));
    }

    if let Some(existing) = store.find_between(initiator, recipient).await? {
        return Ok(existing);
    }

    let conversation = Conversation::new(initiator, recipient);
    match store.insert(&conversation).await? {
        InsertOutcome::Inserted => {
            debug!(conversation = %conversation.id, %initiator, %recipient, "conversation created");
            Ok(conversation)
        }
        InsertOutcome::Conflict => {
            debug!(%initiator, %recipient, "conversation insert lost a race, re-reading");
            match store.find_between(initiator, recipient).await? {
                Some(existing) => Ok(existing),
                None => {
                    warn!(%initiator, %recipient, "pair conflict reported but no conversation found");
                    Err(AppError::StateInconsistency(format!(
                        "conversation between {} and {} conflicted but could not be found",
                        initiator, recipient
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;

    /// In-memory store. `racer` simulates another caller creating the pair
    /// between our lookup and our insert; `phantom` reports a conflict without
    /// any record to find.
    #[derive(Default)]
    struct FakeStore {
        rows: Mutex<Vec<Conversation>>,
        racer: Mutex<Option<Conversation>>,
        phantom: bool,
        inserts: Mutex<usize>,
    }

    impl ConversationStore for FakeStore {
        async fn find_between(&self, a: UserId, b: UserId) -> anyhow::Result<Option<Conversation>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.has_participant(a) && c.has_participant(b))
                .cloned())
        }

        async fn insert(&self, conversation: &Conversation) -> anyhow::Result<InsertOutcome> {
            *self.inserts.lock().unwrap() += 1;
            if self.phantom {
                return Ok(InsertOutcome::Conflict);
            }
            let mut rows = self.rows.lock().unwrap();
            if let Some(winner) = self.racer.lock().unwrap().take() {
                rows.push(winner);
            }
            if rows.iter().any(|c| c.pair() == conversation.pair()) {
                return Ok(InsertOutcome::Conflict);
            }
            rows.push(conversation.clone());
            Ok(InsertOutcome::Inserted)
        }
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent_in_both_orders() {
        let store = FakeStore::default();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let first = resolve_conversation(&store, a, b).await.unwrap();
        let again = resolve_conversation(&store, a, b).await.unwrap();
        let reversed = resolve_conversation(&store, b, a).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.id, reversed.id);
        assert_eq!(first.participant_1, a);
        assert_eq!(*store.inserts.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_self_conversation_rejected() {
        let store = FakeStore::default();
        let a = Uuid::new_v4();

        let err = resolve_conversation(&store, a, a).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
        assert_eq!(*store.inserts.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_conflict_returns_winner() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let winner = Conversation::new(b, a);
        let store = FakeStore {
            racer: Mutex::new(Some(winner.clone())),
            ..Default::default()
        };

        let resolved = resolve_conversation(&store, a, b).await.unwrap();
        assert_eq!(resolved.id, winner.id);
        assert_eq!(store.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_without_record_is_inconsistent() {
        let store = FakeStore {
            phantom: true,
            ..Default::default()
        };

        let err = resolve_conversation(&store, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StateInconsistency(_)));
        // no retry loop
        assert_eq!(*store.inserts.lock().unwrap(), 1);
    }
}
