mod common;

use anyhow::Result;
use beatmarket::application::{AppError, SessionContext, SessionState};
use beatmarket::domain::ProfileUpdate;
use common::{signup, test_service, upload, PASSWORD};

#[tokio::test]
async fn test_signup_then_sign_in() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let created = service.sign_up("  nova ", "Nova@Example.com", PASSWORD).await?;
    assert_eq!(created.username, "nova");
    assert!(!created.is_producer);
    assert_ne!(created.password_hash, PASSWORD);

    // email lookup ignores case
    let signed_in = service.sign_in("nova@example.com", PASSWORD).await?;
    assert_eq!(signed_in.id, created.id);

    let result = service.sign_in("nova@example.com", "wrong-password").await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));

    let result = service.sign_in("nobody@example.com", PASSWORD).await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));
    Ok(())
}

#[tokio::test]
async fn test_sign_in_with_username() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let created = signup(&service, "nova").await?;

    let signed_in = service.sign_in(" nova ", PASSWORD).await?;
    assert_eq!(signed_in.id, created.id);

    let result = service.sign_in("nova", "wrong-password").await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));

    let result = service.sign_in("ghost", PASSWORD).await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));

    let result = service.sign_up("at@home", "at@example.com", PASSWORD).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    Ok(())
}

#[tokio::test]
async fn test_password_needs_eight_characters() -> Result<()> {
    let (service, _temp) = test_service().await?;

    let result = service.sign_up("seven", "seven@example.com", "abcdefg").await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    service.sign_up("eight", "eight@example.com", "abcdefgh").await?;
    service.sign_in("eight", "abcdefgh").await?;
    Ok(())
}

#[tokio::test]
async fn test_signup_rejects_duplicates_and_bad_input() -> Result<()> {
    let (service, _temp) = test_service().await?;
    signup(&service, "nova").await?;

    let result = service.sign_up("nova", "other@example.com", PASSWORD).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let result = service.sign_up("other", "nova@example.com", PASSWORD).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let result = service.sign_up("short", "short@example.com", "abc").await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let result = service.sign_up("two words", "two@example.com", PASSWORD).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let result = service.sign_up("noemail", "noemail", PASSWORD).await;
    assert!(matches!(result, Err(AppError::Validation(_))));
    Ok(())
}

#[tokio::test]
async fn test_change_password() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = signup(&service, "nova").await?;

    let result = service.change_password(user.id, "not-it", "brand-new-pass").await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));

    let result = service.change_password(user.id, PASSWORD, "abc").await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    service
        .change_password(user.id, PASSWORD, "brand-new-pass")
        .await?;
    assert!(service.sign_in("nova@example.com", PASSWORD).await.is_err());
    service.sign_in("nova@example.com", "brand-new-pass").await?;
    Ok(())
}

#[tokio::test]
async fn test_update_profile() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let nova = signup(&service, "nova").await?;
    signup(&service, "taken").await?;

    let updated = service
        .update_profile(
            nova.id,
            ProfileUpdate {
                bio: Some("late night loops".into()),
                twitter: Some("@nova".into()),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(updated.username, "nova");
    assert_eq!(updated.bio.as_deref(), Some("late night loops"));

    let result = service
        .update_profile(
            nova.id,
            ProfileUpdate {
                username: Some("taken".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let result = service
        .update_profile(
            nova.id,
            ProfileUpdate {
                username: Some("   ".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let result = service
        .update_profile(
            nova.id,
            ProfileUpdate {
                username: Some("nova star".into()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let stored = service.get_profile_by_username("nova").await?;
    assert_eq!(stored.twitter.as_deref(), Some("@nova"));
    Ok(())
}

#[tokio::test]
async fn test_follow_toggle_and_profile_page() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let fan = signup(&service, "fan").await?;
    let shown = upload(&service, &producer, "Shown").await?;
    let hidden = upload(&service, &producer, "Hidden").await?;
    service.set_visibility(producer.id, hidden.id, false).await?;

    assert!(service.toggle_follow(fan.id, "producer").await?);

    let page = service.profile_page("producer", Some(fan.id)).await?;
    assert_eq!(page.followers, 1);
    assert_eq!(page.following, 0);
    assert!(page.viewer_follows);
    assert_eq!(page.beats.len(), 1);
    assert_eq!(page.beats[0].beat.id, shown.id);

    let own = service.profile_page("producer", Some(producer.id)).await?;
    assert_eq!(own.beats.len(), 2);
    assert!(!own.viewer_follows);

    assert!(!service.toggle_follow(fan.id, "producer").await?);
    let page = service.profile_page("producer", None).await?;
    assert_eq!(page.followers, 0);

    let result = service.toggle_follow(fan.id, "fan").await;
    assert!(matches!(result, Err(AppError::InvalidOperation(_))));

    let result = service.toggle_follow(fan.id, "ghost").await;
    assert!(matches!(result, Err(AppError::UserNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_likes_toggle() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let fan = signup(&service, "fan").await?;
    let beat = upload(&service, &producer, "Loved").await?;
    let mut likes = service.subscribe_likes(beat.id);

    let view = service.toggle_like(fan.id, beat.id).await?;
    assert!(view.liked);
    assert_eq!(view.count, 1);
    assert!(likes.try_next().is_some());

    let liked = service.liked_beats(fan.id).await?;
    assert_eq!(liked.len(), 1);
    assert_eq!(liked[0].id, beat.id);

    // another viewer sees the count but not the flag
    let other = service.like_view(Some(producer.id), beat.id).await?;
    assert!(!other.liked);
    assert_eq!(other.count, 1);

    let view = service.toggle_like(fan.id, beat.id).await?;
    assert!(!view.liked);
    assert_eq!(view.count, 0);
    assert!(service.liked_beats(fan.id).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_session_sign_in_through_service() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let user = signup(&service, "nova").await?;
    let session = SessionContext::new();

    let result = session.sign_in(&service, "nova@example.com", "wrong").await;
    assert!(matches!(result, Err(AppError::InvalidCredentials)));
    assert!(matches!(session.current(), SessionState::Loading));

    session.sign_in(&service, "nova", PASSWORD).await?;
    assert_eq!(session.user_id(), Some(user.id));

    let id = user.id;
    let restored = SessionContext::new();
    let state = restored
        .restore(async { service.get_profile(id).await.map(Some) })
        .await;
    assert!(matches!(state, SessionState::SignedIn(_)));
    Ok(())
}
