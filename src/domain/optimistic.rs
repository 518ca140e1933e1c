use std::future::Future;

use super::{Beat, BeatId};

/// A tentative state change paired with its inverse.
///
/// `compensate` must undo exactly what `apply` did so that a failed remote
/// write leaves the local view as it was before.
pub trait Transition<S> {
    fn apply(&self, state: &mut S);
    fn compensate(&self, state: &mut S);
}

/// Apply `transition` to `state`, run the remote `write`, and roll back on failure.
pub async fn run_optimistic<S, T, E, W, Fut>(
    state: &mut S,
    transition: &T,
    write: W,
) -> Result<(), E>
where
    T: Transition<S>,
    W: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    transition.apply(state);
    match write().await {
        Ok(()) => Ok(()),
        Err(err) => {
            transition.compensate(state);
            Err(err)
        }
    }
}

/// What a beat card shows about likes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LikeView {
    pub liked: bool,
    pub count: i64,
}

/// Flip the liked flag and adjust the counter.
#[derive(Debug, Clone, Copy)]
pub struct LikeToggle {
    previous: LikeView,
}

impl LikeToggle {
    pub fn from_view(view: &LikeView) -> Self {
        Self { previous: *view }
    }

    /// True when the transition removes a like.
    pub fn unlikes(&self) -> bool {
        self.previous.liked
    }
}

impl Transition<LikeView> for LikeToggle {
    fn apply(&self, state: &mut LikeView) {
        state.liked = !self.previous.liked;
        state.count = if self.previous.liked {
            (self.previous.count - 1).max(0)
        } else {
            self.previous.count + 1
        };
    }

    fn compensate(&self, state: &mut LikeView) {
        *state = self.previous;
    }
}

/// Show or hide one beat in a producer's management list.
#[derive(Debug, Clone, Copy)]
pub struct VisibilityToggle {
    pub beat_id: BeatId,
    pub visible: bool,
}

impl VisibilityToggle {
    pub fn flip(beat: &Beat) -> Self {
        Self {
            beat_id: beat.id,
            visible: !beat.is_visible,
        }
    }
}

impl Transition<Vec<Beat>> for VisibilityToggle {
    fn apply(&self, state: &mut Vec<Beat>) {
        for beat in state.iter_mut().filter(|b| b.id == self.beat_id) {
            beat.is_visible = self.visible;
        }
    }

    fn compensate(&self, state: &mut Vec<Beat>) {
        for beat in state.iter_mut().filter(|b| b.id == self.beat_id) {
            beat.is_visible = !self.visible;
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::domain::NewBeat;

    #[test]
    fn test_like_toggle_apply_and_compensate() {
        let mut view = LikeView { liked: false, count: 4 };
        let toggle = LikeToggle::from_view(&view);

        toggle.apply(&mut view);
        assert_eq!(view, LikeView { liked: true, count: 5 });

        toggle.compensate(&mut view);
        assert_eq!(view, LikeView { liked: false, count: 4 });
    }

    #[test]
    fn test_unlike_never_goes_negative() {
        let mut view = LikeView { liked: true, count: 0 };
        LikeToggle::from_view(&view).apply(&mut view);
        assert_eq!(view, LikeView { liked: false, count: 0 });
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back() {
        let mut view = LikeView { liked: false, count: 1 };
        let toggle = LikeToggle::from_view(&view);

        let result: Result<(), &str> =
            run_optimistic(&mut view, &toggle, || async { Err("offline") }).await;

        assert_eq!(result, Err("offline"));
        assert_eq!(view, LikeView { liked: false, count: 1 });
    }

    #[tokio::test]
    async fn test_successful_write_keeps_state() {
        let mut view = LikeView { liked: false, count: 1 };
        let toggle = LikeToggle::from_view(&view);

        let result: Result<(), &str> =
            run_optimistic(&mut view, &toggle, || async { Ok(()) }).await;

        assert!(result.is_ok());
        assert_eq!(view, LikeView { liked: true, count: 2 });
    }

    #[test]
    fn test_visibility_toggle() {
        let beat = Beat::new(Uuid::new_v4(), NewBeat::titled("Haze", 70), "url".into());
        let other = Beat::new(Uuid::new_v4(), NewBeat::titled("Glow", 80), "url".into());
        let toggle = VisibilityToggle::flip(&beat);
        let mut beats = vec![beat, other];

        toggle.apply(&mut beats);
        assert!(!beats[0].is_visible);
        assert!(beats[1].is_visible);

        toggle.compensate(&mut beats);
        assert!(beats[0].is_visible);
    }
}
