// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use anyhow::Result;
use beatmarket::application::{CheckoutReceipt, MarketService, Upload};
use beatmarket::domain::{Beat, LicenseTier, NewBeat, Profile};
use beatmarket::storage::BlobStore;
use tempfile::TempDir;

pub const PASSWORD: &str = "hunter22";

/// Lowest cost bcrypt accepts, so hashing stays fast in tests.
const TEST_BCRYPT_COST: u32 = 4;

/// Helper to create a test service with a temporary database and blob store
pub async fn test_service() -> Result<(MarketService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let blobs = BlobStore::new(temp_dir.path().join("blobs"), "http://cdn.test");
    let service = MarketService::init(db_path.to_str().unwrap(), blobs)
        .await?
        .with_bcrypt_cost(TEST_BCRYPT_COST);
    Ok((service, temp_dir))
}

/// Create an account named `username` with a matching email.
pub async fn signup(service: &MarketService, username: &str) -> Result<Profile> {
    let email = format!("{}@example.com", username);
    Ok(service.sign_up(username, &email, PASSWORD).await?)
}

pub fn audio(name: &str) -> Upload {
    Upload {
        file_name: name.to_string(),
        bytes: b"RIFF....WAVEfmt ".to_vec(),
    }
}

/// Upload a beat with default prices.
pub async fn upload(service: &MarketService, producer: &Profile, title: &str) -> Result<Beat> {
    Ok(service
        .upload_beat(
            producer.id,
            NewBeat::titled(title, 90),
            audio(&format!("{}.mp3", title)),
            None,
        )
        .await?)
}

/// Put one beat in the buyer's cart and check out.
pub async fn buy(
    service: &MarketService,
    buyer: &Profile,
    beat: &Beat,
    license: LicenseTier,
) -> Result<CheckoutReceipt> {
    service.add_to_cart(buyer.id, beat.id, license).await?;
    Ok(service.checkout(buyer.id).await?)
}
