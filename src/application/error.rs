use thiserror::Error;

use crate::domain::{Cents, LicenseTier, WithdrawalError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Inconsistent state: {0}")]
    StateInconsistency(String),

    #[error("Minimum withdrawal is {minimum} cents (requested {requested})")]
    BelowMinimum { requested: Cents, minimum: Cents },

    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: Cents, requested: Cents },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Beat {beat} was sold exclusively; {requested} can no longer be purchased")]
    ExclusiveSoldOut { beat: String, requested: LicenseTier },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Not signed in")]
    NotSignedIn,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Beat not found: {0}")]
    BeatNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl From<WithdrawalError> for AppError {
    fn from(err: WithdrawalError) -> Self {
        match err {
            WithdrawalError::NonPositive { requested } => {
                AppError::InvalidAmount(format!("withdrawal must be positive (got {})", requested))
            }
            WithdrawalError::BelowMinimum { requested, minimum } => {
                AppError::BelowMinimum { requested, minimum }
            }
            WithdrawalError::InsufficientFunds { requested, balance } => {
                AppError::InsufficientFunds { balance, requested }
            }
        }
    }
}
