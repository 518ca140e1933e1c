use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Cents;

pub type UserId = Uuid;

pub const MIN_PASSWORD_LEN: usize = 8;

/// A marketplace account. Every user can buy; users who upload become producers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub bio: Option<String>,
    pub twitter: Option<String>,
    pub instagram: Option<String>,
    pub is_producer: bool,
    /// Cached earnings balance. The authoritative value is derived from sales and withdrawals.
    pub balance_cents: Cents,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    pub fn new(username: String, email: String, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            bio: None,
            twitter: None,
            instagram: None,
            is_producer: false,
            balance_cents: 0,
            created_at: Utc::now(),
        }
    }
}

/// Editable profile fields. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub username: Option<String>,
    pub bio: Option<String>,
    pub twitter: Option<String>,
    pub instagram: Option<String>,
}

impl ProfileUpdate {
    pub fn apply_to(self, profile: &mut Profile) {
        if let Some(username) = self.username {
            profile.username = username;
        }
        if let Some(bio) = self.bio {
            profile.bio = non_empty(bio);
        }
        if let Some(twitter) = self.twitter {
            profile.twitter = non_empty(twitter);
        }
        if let Some(instagram) = self.instagram {
            profile.instagram = non_empty(instagram);
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Usernames double as login names, so they cannot look like an email address.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.trim().is_empty() {
        return Err("username is required".into());
    }
    if username.chars().any(char::is_whitespace) {
        return Err("username cannot contain spaces".into());
    }
    if username.contains('@') {
        return Err("username cannot contain '@'".into());
    }
    Ok(())
}

/// Checks sign-up input. Returns a human readable reason on failure.
pub fn validate_signup(username: &str, email: &str, password: &str) -> Result<(), String> {
    validate_username(username)?;
    if !email.contains('@') {
        return Err(format!("invalid email address: {}", email));
    }
    if password.len() < MIN_PASSWORD_LEN {
        return Err(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    Ok(())
}
