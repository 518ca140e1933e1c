use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{format_price, Cents, UserId};

/// Smallest amount a producer may withdraw ($15.00).
pub const MIN_WITHDRAWAL_CENTS: Cents = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Sale,
    Withdrawal,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Sale => "sale",
            TransactionKind::Withdrawal => "withdrawal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sale" => Some(TransactionKind::Sale),
            "withdrawal" => Some(TransactionKind::Withdrawal),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry in a producer's transaction history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: UserId,
    pub amount_cents: Cents,
    pub kind: TransactionKind,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn withdrawal(user_id: UserId, amount_cents: Cents) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            amount_cents,
            kind: TransactionKind::Withdrawal,
            status: "completed".to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Available balance = sum of sales - sum of withdrawals, never below zero.
pub fn compute_balance(sales: &[Cents], withdrawals: &[Cents]) -> Cents {
    let earned: Cents = sales.iter().sum();
    let withdrawn: Cents = withdrawals.iter().sum();
    (earned - withdrawn).max(0)
}

/// Withdrawal amounts recorded in a transaction history. Other kinds are ignored.
pub fn withdrawal_amounts(transactions: &[Transaction]) -> Vec<Cents> {
    transactions
        .iter()
        .filter(|t| t.kind == TransactionKind::Withdrawal)
        .map(|t| t.amount_cents)
        .collect()
}

/// Check a withdrawal request against the current balance.
/// Returns the balance that remains after the withdrawal.
pub fn validate_withdrawal(requested: Cents, balance: Cents) -> Result<Cents, WithdrawalError> {
    if requested <= 0 {
        return Err(WithdrawalError::NonPositive { requested });
    }
    if requested < MIN_WITHDRAWAL_CENTS {
        return Err(WithdrawalError::BelowMinimum {
            requested,
            minimum: MIN_WITHDRAWAL_CENTS,
        });
    }
    if requested > balance {
        return Err(WithdrawalError::InsufficientFunds { requested, balance });
    }
    Ok(balance - requested)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WithdrawalError {
    NonPositive { requested: Cents },
    BelowMinimum { requested: Cents, minimum: Cents },
    InsufficientFunds { requested: Cents, balance: Cents },
}

impl std::fmt::Display for WithdrawalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalError::NonPositive { requested } => {
                write!(f, "withdrawal amount must be positive (got {})", format_price(*requested))
            }
            WithdrawalError::BelowMinimum { requested, minimum } => write!(
                f,
                "minimum withdrawal is {} (requested {})",
                format_price(*minimum),
                format_price(*requested)
            ),
            WithdrawalError::InsufficientFunds { requested, balance } => write!(
                f,
                "insufficient balance: {} available, {} requested",
                format_price(*balance),
                format_price(*requested)
            ),
        }
    }
}

impl std::error::Error for WithdrawalError {}
