use super::BeatId;

pub const DEFAULT_VOLUME: f32 = 0.8;

/// Playback state: a queue of beats, a cursor into it and the transport flags.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub queue: Vec<BeatId>,
    /// Position of the current track in `queue`
    pub index: Option<usize>,
    pub is_playing: bool,
    pub volume: f32,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            index: None,
            is_playing: false,
            volume: DEFAULT_VOLUME,
        }
    }
}

impl PlayerState {
    pub fn current(&self) -> Option<BeatId> {
        self.index.and_then(|i| self.queue.get(i).copied())
    }

    /// Start `track`. A non-empty `queue` replaces the current queue; otherwise the
    /// queue becomes just this track. If the track is missing from the queue,
    /// playback starts from the head of the queue.
    pub fn play_track(&mut self, track: BeatId, queue: Vec<BeatId>) {
        self.queue = if queue.is_empty() { vec![track] } else { queue };
        let index = self.queue.iter().position(|id| *id == track).unwrap_or(0);
        self.index = Some(index);
        self.is_playing = true;
    }

    /// Advance to the next track. Returns false at the end of the queue.
    pub fn next(&mut self) -> bool {
        match self.index {
            Some(i) if i + 1 < self.queue.len() => {
                self.index = Some(i + 1);
                self.is_playing = true;
                true
            }
            _ => false,
        }
    }

    /// Go back one track. Returns false at the head of the queue.
    pub fn prev(&mut self) -> bool {
        match self.index {
            Some(i) if i > 0 => {
                self.index = Some(i - 1);
                self.is_playing = true;
                true
            }
            _ => false,
        }
    }

    pub fn pause(&mut self) {
        self.is_playing = false;
    }

    pub fn resume(&mut self) {
        if self.current().is_some() {
            self.is_playing = true;
        }
    }

    pub fn toggle(&mut self) {
        if self.is_playing {
            self.pause();
        } else {
            self.resume();
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = if volume.is_nan() { DEFAULT_VOLUME } else { volume.clamp(0.0, 1.0) };
    }
}
