use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, UserId};

pub type BeatId = Uuid;

pub const DEFAULT_MP3_PRICE: Cents = 1999;
pub const DEFAULT_WAV_PRICE: Cents = 2999;
pub const DEFAULT_EXCLUSIVE_PRICE: Cents = 14999;

/// A sellable instrumental.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beat {
    pub id: BeatId,
    pub producer_id: UserId,
    pub title: String,
    pub bpm: i64,
    pub key: Option<String>,
    pub genre: Option<String>,
    /// MP3 lease price
    pub price_cents: Cents,
    pub price_wav_cents: Cents,
    pub price_exclusive_cents: Cents,
    pub audio_url: String,
    pub cover_url: Option<String>,
    pub is_visible: bool,
    pub plays_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Upload form. Missing or non-positive prices fall back to the defaults.
#[derive(Debug, Clone, Default)]
pub struct NewBeat {
    pub title: String,
    pub bpm: i64,
    pub key: Option<String>,
    pub genre: Option<String>,
    pub price_cents: Option<Cents>,
    pub price_wav_cents: Option<Cents>,
    pub price_exclusive_cents: Option<Cents>,
}

impl NewBeat {
    pub fn titled(title: impl Into<String>, bpm: i64) -> Self {
        Self {
            title: title.into(),
            bpm,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title is required".into());
        }
        if self.bpm < 0 {
            return Err(format!("bpm must not be negative (got {})", self.bpm));
        }
        Ok(())
    }
}

fn price_or(value: Option<Cents>, fallback: Cents) -> Cents {
    value.filter(|p| *p > 0).unwrap_or(fallback)
}

impl Beat {
    pub fn new(producer_id: UserId, draft: NewBeat, audio_url: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            producer_id,
            title: draft.title.trim().to_string(),
            bpm: draft.bpm,
            key: draft.key,
            genre: draft.genre,
            price_cents: price_or(draft.price_cents, DEFAULT_MP3_PRICE),
            price_wav_cents: price_or(draft.price_wav_cents, DEFAULT_WAV_PRICE),
            price_exclusive_cents: price_or(draft.price_exclusive_cents, DEFAULT_EXCLUSIVE_PRICE),
            audio_url,
            cover_url: None,
            is_visible: true,
            plays_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_cover(mut self, cover_url: impl Into<String>) -> Self {
        self.cover_url = Some(cover_url.into());
        self
    }
}

/// Explore page filters. All fields are optional and combined with AND.
#[derive(Debug, Clone, Default)]
pub struct BeatFilter {
    /// Case-insensitive substring of the title
    pub search: Option<String>,
    /// Case-insensitive substring of the genre
    pub genre: Option<String>,
    pub min_bpm: Option<i64>,
    pub max_bpm: Option<i64>,
    /// Upper bound on the MP3 lease price
    pub max_price_cents: Option<Cents>,
    pub limit: Option<usize>,
}

impl BeatFilter {
    /// Negative lower bounds are clamped to zero.
    pub fn normalized(mut self) -> Self {
        self.min_bpm = self.min_bpm.map(|bpm| bpm.max(0));
        self.search = self.search.filter(|s| !s.trim().is_empty());
        self.genre = self.genre.filter(|g| !g.trim().is_empty());
        self
    }
}

/// Comment left on a beat page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub beat_id: BeatId,
    pub user_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(beat_id: BeatId, user_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            beat_id,
            user_id,
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prices() {
        let beat = Beat::new(Uuid::new_v4(), NewBeat::titled("Tape", 90), "url".into());
        assert_eq!(beat.price_cents, DEFAULT_MP3_PRICE);
        assert_eq!(beat.price_wav_cents, DEFAULT_WAV_PRICE);
        assert_eq!(beat.price_exclusive_cents, DEFAULT_EXCLUSIVE_PRICE);
        assert!(beat.is_visible);
    }

    #[test]
    fn test_custom_prices_and_zero_fallback() {
        let draft = NewBeat {
            price_cents: Some(2500),
            price_wav_cents: Some(0),
            price_exclusive_cents: Some(50000),
            ..NewBeat::titled("Tape", 90)
        };
        let beat = Beat::new(Uuid::new_v4(), draft, "url".into());
        assert_eq!(beat.price_cents, 2500);
        assert_eq!(beat.price_wav_cents, DEFAULT_WAV_PRICE);
        assert_eq!(beat.price_exclusive_cents, 50000);
    }

    #[test]
    fn test_validate_draft() {
        assert!(NewBeat::titled("Tape", 90).validate().is_ok());
        assert!(NewBeat::titled("  ", 90).validate().is_err());
        assert!(NewBeat::titled("Tape", -1).validate().is_err());
    }

    #[test]
    fn test_filter_normalized() {
        let filter = BeatFilter {
            search: Some(" ".into()),
            min_bpm: Some(-20),
            ..Default::default()
        }
        .normalized();
        assert_eq!(filter.search, None);
        assert_eq!(filter.min_bpm, Some(0));
    }
}
