mod common;

use anyhow::Result;
use beatmarket::application::AppError;
use beatmarket::domain::{LicenseTier, TransactionKind, MIN_WITHDRAWAL_CENTS};
use common::{buy, signup, test_service, upload};

#[tokio::test]
async fn test_sales_then_withdrawal() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let buyer = signup(&service, "buyer").await?;
    let fan = signup(&service, "fan").await?;
    let beat = upload(&service, &producer, "Night Drive").await?;

    // 19.99 + 29.99
    service.add_to_cart(buyer.id, beat.id, LicenseTier::Mp3Lease).await?;
    service.checkout(buyer.id).await?;
    buy(&service, &fan, &beat, LicenseTier::WavLease).await?;

    assert_eq!(service.balance(producer.id).await?, 4998);

    let receipt = service.withdraw(producer.id, 1500).await?;
    assert_eq!(receipt.balance, 3498);
    assert_eq!(receipt.transaction.amount_cents, 1500);
    assert_eq!(receipt.transaction.kind, TransactionKind::Withdrawal);
    assert_eq!(receipt.transaction.status, "completed");

    assert_eq!(service.balance(producer.id).await?, 3498);
    let stored = service.get_profile(producer.id).await?;
    assert_eq!(stored.balance_cents, 3498);

    let transactions = service.transactions(producer.id).await?;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount_cents, 1500);
    Ok(())
}

#[tokio::test]
async fn test_withdrawal_below_minimum() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let buyer = signup(&service, "buyer").await?;
    let beat = upload(&service, &producer, "Haze").await?;
    buy(&service, &buyer, &beat, LicenseTier::WavLease).await?;

    let result = service.withdraw(producer.id, 1499).await;
    assert!(matches!(
        result,
        Err(AppError::BelowMinimum {
            requested: 1499,
            minimum: MIN_WITHDRAWAL_CENTS
        })
    ));
    assert!(service.transactions(producer.id).await?.is_empty());
    assert_eq!(service.balance(producer.id).await?, 2999);
    Ok(())
}

#[tokio::test]
async fn test_withdrawal_above_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;

    // no sales at all
    let result = service.withdraw(producer.id, 2000).await;
    assert!(matches!(
        result,
        Err(AppError::InsufficientFunds {
            balance: 0,
            requested: 2000
        })
    ));

    let result = service.withdraw(producer.id, 0).await;
    assert!(matches!(result, Err(AppError::InvalidAmount(_))));
    Ok(())
}

#[tokio::test]
async fn test_withdraw_entire_balance() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let buyer = signup(&service, "buyer").await?;

    let mut draft = beatmarket::domain::NewBeat::titled("Exact", 120);
    draft.price_cents = Some(1500);
    let beat = service
        .upload_beat(producer.id, draft, common::audio("exact.wav"), None)
        .await?;
    buy(&service, &buyer, &beat, LicenseTier::Mp3Lease).await?;

    let receipt = service.withdraw(producer.id, 1500).await?;
    assert_eq!(receipt.balance, 0);

    let again = service.withdraw(producer.id, 1500).await;
    assert!(matches!(again, Err(AppError::InsufficientFunds { balance: 0, .. })));
    Ok(())
}

#[tokio::test]
async fn test_dashboard() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let buyer = signup(&service, "buyer").await?;
    let kept = upload(&service, &producer, "Kept").await?;
    let gone = upload(&service, &producer, "Gone").await?;
    service.set_visibility(producer.id, kept.id, false).await?;

    buy(&service, &buyer, &kept, LicenseTier::Mp3Lease).await?;
    buy(&service, &buyer, &gone, LicenseTier::Exclusive).await?;
    service.delete_beat(producer.id, gone.id).await?;
    service.withdraw(producer.id, 2000).await?;

    let dashboard = service.dashboard(producer.id).await?;
    assert_eq!(dashboard.beats.len(), 1);
    assert!(!dashboard.beats[0].is_visible);
    assert_eq!(dashboard.sale_count, 2);
    assert_eq!(dashboard.total_earnings, 1999 + 14999);
    assert_eq!(dashboard.balance, 1999 + 14999 - 2000);
    assert_eq!(dashboard.transactions.len(), 1);

    // newest sale first; its beat no longer exists
    assert_eq!(dashboard.sales[0].beat_title, None);
    assert_eq!(dashboard.sales[1].beat_title.as_deref(), Some("Kept"));
    Ok(())
}

#[tokio::test]
async fn test_stored_balances_stay_in_sync() -> Result<()> {
    let (service, _temp) = test_service().await?;
    let producer = signup(&service, "producer").await?;
    let other = signup(&service, "other").await?;
    let buyer = signup(&service, "buyer").await?;
    let a = upload(&service, &producer, "A").await?;
    let b = upload(&service, &other, "B").await?;

    service.add_to_cart(buyer.id, a.id, LicenseTier::WavLease).await?;
    service.add_to_cart(buyer.id, b.id, LicenseTier::Mp3Lease).await?;
    let receipt = service.checkout(buyer.id).await?;
    assert_eq!(receipt.purchases.len(), 2);
    assert_eq!(receipt.total, 2999 + 1999);
    assert!(receipt.transaction_id.starts_with("TXID_"));

    service.withdraw(producer.id, 1500).await?;

    assert!(service.check_balances().await?.is_empty());
    assert_eq!(service.get_profile(producer.id).await?.balance_cents, 1499);
    assert_eq!(service.get_profile(other.id).await?.balance_cents, 1999);
    Ok(())
}
