//! Observable session and player state.
//!
//! Each context owns a `watch` channel: readers call `current()` or hold a
//! receiver from `subscribe()` and are woken on every change.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{BeatId, PlayerState, Profile, UserId};

use super::{AppError, MarketService};

/// How long a session restore may take before the user is treated as signed out.
pub const RESTORE_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub enum SessionState {
    Loading,
    SignedOut,
    SignedIn(Profile),
}

impl SessionState {
    pub fn profile(&self) -> Option<&Profile> {
        match self {
            SessionState::SignedIn(profile) => Some(profile),
            _ => None,
        }
    }
}

pub struct SessionContext {
    tx: watch::Sender<SessionState>,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionContext {
    /// Starts in `Loading` until a restore or sign-in settles it.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionState::Loading);
        Self { tx }
    }

    pub fn current(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.tx.borrow().profile().map(|p| p.id)
    }

    /// The signed-in profile, or `NotSignedIn`.
    pub fn require_user(&self) -> Result<Profile, AppError> {
        self.tx
            .borrow()
            .profile()
            .cloned()
            .ok_or(AppError::NotSignedIn)
    }

    /// Settle the session from a remembered user. A load that fails, finds
    /// nobody, or outlasts [`RESTORE_TIMEOUT`] leaves the session signed out.
    pub async fn restore<F>(&self, load: F) -> SessionState
    where
        F: Future<Output = Result<Option<Profile>, AppError>>,
    {
        let state = match tokio::time::timeout(RESTORE_TIMEOUT, load).await {
            Ok(Ok(Some(profile))) => SessionState::SignedIn(profile),
            Ok(Ok(None)) => SessionState::SignedOut,
            Ok(Err(e)) => {
                warn!(error = %e, "session restore failed");
                SessionState::SignedOut
            }
            Err(_) => {
                warn!(timeout_ms = RESTORE_TIMEOUT.as_millis() as u64, "session restore timed out");
                SessionState::SignedOut
            }
        };
        self.tx.send_replace(state.clone());
        state
    }

    pub async fn sign_in(
        &self,
        service: &MarketService,
        login: &str,
        password: &str,
    ) -> Result<Profile, AppError> {
        let profile = service.sign_in(login, password).await?;
        debug!(user = %profile.id, "signed in");
        self.tx.send_replace(SessionState::SignedIn(profile.clone()));
        Ok(profile)
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(SessionState::SignedOut);
    }

    /// Replace the cached profile after an edit.
    pub fn refresh(&self, profile: Profile) {
        self.tx.send_if_modified(|state| match state {
            SessionState::SignedIn(current) if current.id == profile.id => {
                *current = profile;
                true
            }
            _ => false,
        });
    }
}

/// Global playback state. Starting a different track counts a play.
pub struct PlayerContext {
    tx: watch::Sender<PlayerState>,
}

impl Default for PlayerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayerContext {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PlayerState::default());
        Self { tx }
    }

    pub fn current(&self) -> PlayerState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.tx.subscribe()
    }

    /// Play `track` within `queue`. Returns the track's new play count, or
    /// `None` when the track was already current.
    pub async fn play(
        &self,
        service: &MarketService,
        track: BeatId,
        queue: Vec<BeatId>,
    ) -> Result<Option<i64>, AppError> {
        let previous = self.tx.borrow().current();
        self.tx.send_modify(|state| state.play_track(track, queue));
        self.count_if_changed(service, previous).await
    }

    pub async fn next(&self, service: &MarketService) -> Result<Option<i64>, AppError> {
        let previous = self.tx.borrow().current();
        self.tx.send_if_modified(|state| state.next());
        self.count_if_changed(service, previous).await
    }

    pub async fn prev(&self, service: &MarketService) -> Result<Option<i64>, AppError> {
        let previous = self.tx.borrow().current();
        self.tx.send_if_modified(|state| state.prev());
        self.count_if_changed(service, previous).await
    }

    pub fn pause(&self) {
        self.tx.send_modify(|state| state.pause());
    }

    pub fn resume(&self) {
        self.tx.send_modify(|state| state.resume());
    }

    pub fn toggle(&self) {
        self.tx.send_modify(|state| state.toggle());
    }

    pub fn set_volume(&self, volume: f32) {
        self.tx.send_modify(|state| state.set_volume(volume));
    }

    async fn count_if_changed(
        &self,
        service: &MarketService,
        previous: Option<BeatId>,
    ) -> Result<Option<i64>, AppError> {
        let current = self.tx.borrow().current();
        match current {
            Some(track) if Some(track) != previous => service.record_play(track).await.map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile::new("nova".into(), "nova@example.com".into(), String::new())
    }

    #[tokio::test]
    async fn test_restore_signs_in() {
        let session = SessionContext::new();
        assert!(matches!(session.current(), SessionState::Loading));

        let user = profile();
        let id = user.id;
        let state = session.restore(async move { Ok(Some(user)) }).await;

        assert!(matches!(state, SessionState::SignedIn(_)));
        assert_eq!(session.user_id(), Some(id));
    }

    #[tokio::test]
    async fn test_restore_times_out_to_signed_out() {
        let session = SessionContext::new();
        let mut rx = session.subscribe();

        let slow = async {
            tokio::time::sleep(RESTORE_TIMEOUT * 4).await;
            Ok(Some(profile()))
        };
        let state = session.restore(slow).await;

        assert!(matches!(state, SessionState::SignedOut));
        assert!(rx.has_changed().unwrap());
        assert!(matches!(*rx.borrow_and_update(), SessionState::SignedOut));
    }

    #[tokio::test]
    async fn test_restore_error_signs_out() {
        let session = SessionContext::new();
        let state = session
            .restore(async { Err(AppError::UserNotFound("ghost".into())) })
            .await;
        assert!(matches!(state, SessionState::SignedOut));
        assert!(matches!(session.require_user(), Err(AppError::NotSignedIn)));
    }

    #[tokio::test]
    async fn test_refresh_only_touches_same_user() {
        let session = SessionContext::new();
        let mut user = profile();
        session.restore(async { Ok(Some(user.clone())) }).await;

        user.bio = Some("lofi".into());
        session.refresh(user.clone());
        assert_eq!(session.require_user().unwrap().bio.as_deref(), Some("lofi"));

        let stranger = Profile::new("x".into(), "x@example.com".into(), String::new());
        session.refresh(stranger);
        assert_eq!(session.user_id(), Some(user.id));

        session.sign_out();
        assert!(session.user_id().is_none());
    }

    #[test]
    fn test_player_controls_without_service() {
        let player = PlayerContext::new();
        player.set_volume(3.0);
        assert_eq!(player.current().volume, 1.0);

        player.toggle();
        assert!(!player.current().is_playing);
        assert!(player.current().current().is_none());
    }
}
