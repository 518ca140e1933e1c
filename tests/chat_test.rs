mod common;

use anyhow::Result;
use beatmarket::application::{message_from_event, AppError};
use beatmarket::domain::{LicenseTier, MessageLog};
use common::{buy, signup, test_service, upload};

#[tokio::test]
async fn test_resolve_twice_returns_same_conversation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;
    let bob = signup(&service, "bob").await?;

    let first = service.open_conversation(alice.id, bob.id).await?;
    let second = service.open_conversation(alice.id, bob.id).await?;
    let reversed = service.open_conversation(bob.id, alice.id).await?;

    assert_eq!(first.id, second.id);
    assert_eq!(first.id, reversed.id);
    assert_eq!(first.participant_1, alice.id);
    assert_eq!(first.participant_2, bob.id);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_first_contact_creates_one_conversation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;
    let bob = signup(&service, "bob").await?;

    let (a, b, c) = tokio::join!(
        service.open_conversation(alice.id, bob.id),
        service.open_conversation(bob.id, alice.id),
        service.open_conversation(alice.id, bob.id),
    );
    let (a, b, c) = (a?, b?, c?);

    assert_eq!(a.id, b.id);
    assert_eq!(a.id, c.id);
    assert_eq!(service.inbox(alice.id).await?.len(), 1);
    assert_eq!(service.inbox(bob.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_conversation_with_self_is_rejected() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;

    let result = service.open_conversation(alice.id, alice.id).await;
    assert!(matches!(result, Err(AppError::InvalidOperation(_))));
    assert!(service.inbox(alice.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_send_and_list_messages() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;
    let bob = signup(&service, "bob").await?;
    let conversation = service.open_conversation(alice.id, bob.id).await?;

    service.send_message(alice.id, conversation.id, "  yo, is the exclusive still open?  ").await?;
    service.send_message(bob.id, conversation.id, "it is").await?;

    let messages = service.list_messages(alice.id, conversation.id).await?;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text, "yo, is the exclusive still open?");
    assert_eq!(messages[0].sender_id, alice.id);
    assert_eq!(messages[1].text, "it is");
    Ok(())
}

#[tokio::test]
async fn test_message_rules() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;
    let bob = signup(&service, "bob").await?;
    let eve = signup(&service, "eve").await?;
    let conversation = service.open_conversation(alice.id, bob.id).await?;

    let empty = service.send_message(alice.id, conversation.id, "   ").await;
    assert!(matches!(empty, Err(AppError::InvalidOperation(_))));

    let outsider = service.send_message(eve.id, conversation.id, "hi").await;
    assert!(matches!(outsider, Err(AppError::InvalidOperation(_))));

    let snoop = service.list_messages(eve.id, conversation.id).await;
    assert!(matches!(snoop, Err(AppError::InvalidOperation(_))));

    let missing = service
        .send_message(alice.id, uuid::Uuid::new_v4(), "hello?")
        .await;
    assert!(matches!(missing, Err(AppError::ConversationNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_inbox_orders_by_latest_activity() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;
    let bob = signup(&service, "bob").await?;
    let carol = signup(&service, "carol").await?;

    let with_bob = service.open_conversation(alice.id, bob.id).await?;
    let with_carol = service.open_conversation(carol.id, alice.id).await?;

    service.send_message(alice.id, with_bob.id, "first").await?;
    service.send_message(carol.id, with_carol.id, "second").await?;

    let inbox = service.inbox(alice.id).await?;
    assert_eq!(inbox.len(), 2);
    assert_eq!(inbox[0].conversation.id, with_carol.id);
    assert_eq!(inbox[0].partner.username, "carol");
    assert_eq!(inbox[0].preview.as_deref(), Some("second"));
    assert!(!inbox[0].is_my_message);
    assert_eq!(inbox[1].partner.username, "bob");
    assert!(inbox[1].is_my_message);

    service.send_message(bob.id, with_bob.id, "bump").await?;
    let inbox = service.inbox(alice.id).await?;
    assert_eq!(inbox[0].conversation.id, with_bob.id);
    assert_eq!(inbox[0].preview.as_deref(), Some("bump"));
    Ok(())
}

#[tokio::test]
async fn test_subscription_receives_only_its_conversation() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let alice = signup(&service, "alice").await?;
    let bob = signup(&service, "bob").await?;
    let carol = signup(&service, "carol").await?;

    let watched = service.open_conversation(alice.id, bob.id).await?;
    let other = service.open_conversation(alice.id, carol.id).await?;

    let mut log = MessageLog::from_history(service.list_messages(bob.id, watched.id).await?);
    let mut sub = service.subscribe_messages(bob.id, watched.id).await?;

    service.send_message(alice.id, other.id, "not for bob").await?;
    let sent = service.send_message(alice.id, watched.id, "for bob").await?;

    let event = sub.next().await.expect("subscription ended early");
    let received = message_from_event(&event.row)?;
    assert_eq!(received, sent);
    assert!(log.append(received.clone()));
    // the same message arriving again through a refetch is ignored
    assert!(!log.append(received));
    assert_eq!(log.len(), 1);

    sub.cancel();
    service.send_message(alice.id, watched.id, "after cancel").await?;
    assert!(sub.next().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_contact_producer_of_sold_out_beat() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "metro").await?;
    let first = signup(&service, "first").await?;
    let late = signup(&service, "late").await?;
    let beat = upload(&service, &producer, "Mask Off").await?;

    buy(&service, &first, &beat, LicenseTier::Exclusive).await?;

    let conversation = service.contact_producer(late.id, beat.id).await?;
    assert!(conversation.has_participant(producer.id));
    assert!(conversation.has_participant(late.id));

    let again = service.open_conversation(producer.id, late.id).await?;
    assert_eq!(again.id, conversation.id);
    Ok(())
}
