//! In-process change feed.
//!
//! The repository publishes a [`ChangeEvent`] after every write that other
//! parts of the application watch (messages, likes, play counts). Consumers
//! subscribe with a [`FeedFilter`] and pull events from a [`Subscription`].

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Beats,
    Favorites,
    Messages,
    Conversations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One row-level change. `row` carries the new row (or the deleted keys).
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub op: ChangeOp,
    pub row: Value,
}

/// Which events a subscriber wants. Column filters compare the row's JSON
/// value against `value` rendered as a string (`beat_id=eq.<id>`).
#[derive(Debug, Clone)]
pub struct FeedFilter {
    pub table: Table,
    pub op: Option<ChangeOp>,
    pub column: Option<(String, String)>,
}

impl FeedFilter {
    pub fn table(table: Table) -> Self {
        Self {
            table,
            op: None,
            column: None,
        }
    }

    pub fn op(mut self, op: ChangeOp) -> Self {
        self.op = Some(op);
        self
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl ToString) -> Self {
        self.column = Some((column.into(), value.to_string()));
        self
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if self.op.is_some_and(|op| op != event.op) {
            return false;
        }
        match &self.column {
            None => true,
            Some((column, expected)) => match event.row.get(column) {
                Some(Value::String(s)) => s == expected,
                Some(other) => other.to_string() == *expected,
                None => false,
            },
        }
    }
}

/// Broadcast side of the feed. Cheap to clone.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, table: Table, op: ChangeOp, row: Value) {
        let event = ChangeEvent { table, op, row };
        match self.tx.send(event) {
            Ok(receivers) => debug!(?table, ?op, receivers, "change published"),
            Err(_) => debug!(?table, ?op, "change dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self, filter: FeedFilter) -> Subscription {
        Subscription {
            rx: Some(self.tx.subscribe()),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Cancellable handle yielding matching events in publish order.
pub struct Subscription {
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    filter: FeedFilter,
}

impl Subscription {
    /// Wait for the next matching event. Returns `None` once cancelled or when
    /// the feed is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, table = ?self.filter.table, "subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Non-blocking variant of [`Subscription::next`].
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        loop {
            let rx = self.rx.as_mut()?;
            match rx.try_recv() {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, table = ?self.filter.table, "subscriber lagged, events skipped");
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Stop receiving. Further calls to `next` return `None` immediately.
    pub fn cancel(&mut self) {
        self.rx = None;
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.is_none()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_subscription_filters_by_column() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(
            FeedFilter::table(Table::Messages)
                .op(ChangeOp::Insert)
                .eq("conversation_id", "c1"),
        );

        feed.publish(Table::Messages, ChangeOp::Insert, json!({"conversation_id": "c2"}));
        feed.publish(Table::Favorites, ChangeOp::Insert, json!({"conversation_id": "c1"}));
        feed.publish(Table::Messages, ChangeOp::Insert, json!({"conversation_id": "c1", "text": "hi"}));

        let event = sub.next().await.unwrap();
        assert_eq!(event.row["text"], "hi");
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_numeric_column_match() {
        let filter = FeedFilter::table(Table::Beats).eq("plays_count", 3);
        let event = ChangeEvent {
            table: Table::Beats,
            op: ChangeOp::Update,
            row: json!({"plays_count": 3}),
        };
        assert!(filter.matches(&event));
    }

    #[tokio::test]
    async fn test_cancel_ends_subscription() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(FeedFilter::table(Table::Beats));
        assert_eq!(feed.subscriber_count(), 1);

        sub.cancel();
        feed.publish(Table::Beats, ChangeOp::Update, json!({}));

        assert!(sub.is_cancelled());
        assert!(sub.next().await.is_none());
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_feed_ends_subscription() {
        let feed = ChangeFeed::default();
        let mut sub = feed.subscribe(FeedFilter::table(Table::Beats));
        drop(feed);
        assert!(sub.next().await.is_none());
    }
}
