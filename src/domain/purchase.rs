use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BeatId, Cents, LicenseTier, UserId, CURRENCY};

pub type PurchaseId = Uuid;

/// A completed sale: `user_id` bought a license for `beat_id` from `seller_id`.
/// Sale records are never modified once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: PurchaseId,
    /// Buyer
    pub user_id: UserId,
    pub seller_id: UserId,
    pub beat_id: BeatId,
    pub price_paid_cents: Cents,
    pub currency: String,
    pub license: LicenseTier,
    /// Checkout reference shared by every purchase of one checkout
    pub transaction_id: String,
    pub created_at: DateTime<Utc>,
}

impl Purchase {
    pub fn from_cart_item(item: &CartItem, seller_id: UserId, transaction_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: item.user_id,
            seller_id,
            beat_id: item.beat_id,
            price_paid_cents: item.price_cents,
            currency: item.currency.clone(),
            license: item.license,
            transaction_id: transaction_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// A license waiting in a user's cart. One per (user, beat).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub id: Uuid,
    pub user_id: UserId,
    pub beat_id: BeatId,
    pub price_cents: Cents,
    pub currency: String,
    pub license: LicenseTier,
    pub created_at: DateTime<Utc>,
}

impl CartItem {
    pub fn new(user_id: UserId, beat_id: BeatId, license: LicenseTier, price_cents: Cents) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            beat_id,
            price_cents,
            currency: CURRENCY.to_string(),
            license,
            created_at: Utc::now(),
        }
    }
}

pub fn cart_total(items: &[CartItem]) -> Cents {
    items.iter().map(|item| item.price_cents).sum()
}

/// Reference stamped on every purchase of a checkout.
pub fn checkout_reference(at: DateTime<Utc>) -> String {
    format!("TXID_{}", at.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cart_total() {
        let user = Uuid::new_v4();
        let items = vec![
            CartItem::new(user, Uuid::new_v4(), LicenseTier::Mp3Lease, 1999),
            CartItem::new(user, Uuid::new_v4(), LicenseTier::WavLease, 2999),
        ];
        assert_eq!(cart_total(&items), 4998);
        assert_eq!(cart_total(&[]), 0);
    }

    #[test]
    fn test_purchase_copies_cart_item() {
        let buyer = Uuid::new_v4();
        let seller = Uuid::new_v4();
        let item = CartItem::new(buyer, Uuid::new_v4(), LicenseTier::Exclusive, 14999);

        let purchase = Purchase::from_cart_item(&item, seller, "TXID_1");

        assert_eq!(purchase.user_id, buyer);
        assert_eq!(purchase.seller_id, seller);
        assert_eq!(purchase.beat_id, item.beat_id);
        assert_eq!(purchase.price_paid_cents, 14999);
        assert_eq!(purchase.license, LicenseTier::Exclusive);
        assert_eq!(purchase.currency, "USD");
    }

    #[test]
    fn test_checkout_reference() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(checkout_reference(at), "TXID_1700000000123");
    }
}
