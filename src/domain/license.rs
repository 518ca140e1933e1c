use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Beat, Cents, UserId};

/// Purchase options for a beat. Leases can be sold any number of times,
/// an exclusive transfers full rights and ends all further sales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LicenseTier {
    #[serde(rename = "MP3 Lease")]
    Mp3Lease,
    #[serde(rename = "WAV Lease")]
    WavLease,
    #[serde(rename = "Exclusive")]
    Exclusive,
}

impl LicenseTier {
    pub const ALL: [LicenseTier; 3] = [
        LicenseTier::Mp3Lease,
        LicenseTier::WavLease,
        LicenseTier::Exclusive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseTier::Mp3Lease => "MP3 Lease",
            LicenseTier::WavLease => "WAV Lease",
            LicenseTier::Exclusive => "Exclusive",
        }
    }

    /// Accepts the stored names as well as short forms ("mp3", "wav", "exclusive").
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mp3 lease" | "mp3" => Some(LicenseTier::Mp3Lease),
            "wav lease" | "wav" => Some(LicenseTier::WavLease),
            "exclusive" => Some(LicenseTier::Exclusive),
            _ => None,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LicenseTier::Exclusive)
    }

    /// The beat's asking price for this tier.
    pub fn price_for(&self, beat: &Beat) -> Cents {
        match self {
            LicenseTier::Mp3Lease => beat.price_cents,
            LicenseTier::WavLease => beat.price_wav_cents,
            LicenseTier::Exclusive => beat.price_exclusive_cents,
        }
    }
}

impl fmt::Display for LicenseTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sale state of a single beat.
///
/// `Available` survives any number of lease sales. The first exclusive sale
/// moves the beat to `ExclusiveSold`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleState {
    Available,
    ExclusiveSold,
}

impl SaleState {
    /// Derive the state from the tiers of every sale recorded for the beat.
    pub fn from_sales<I>(tiers: I) -> Self
    where
        I: IntoIterator<Item = LicenseTier>,
    {
        tiers.into_iter().fold(SaleState::Available, SaleState::after_sale)
    }

    /// State after recording a sale of `tier`.
    pub fn after_sale(self, tier: LicenseTier) -> Self {
        match (self, tier) {
            (SaleState::ExclusiveSold, _) => SaleState::ExclusiveSold,
            (SaleState::Available, LicenseTier::Exclusive) => SaleState::ExclusiveSold,
            (SaleState::Available, _) => SaleState::Available,
        }
    }

    pub fn is_sold_out(&self) -> bool {
        matches!(self, SaleState::ExclusiveSold)
    }

    /// Gate for every purchase attempt, whatever the tier.
    pub fn check_purchase(&self, tier: LicenseTier) -> Result<(), PurchaseError> {
        match self {
            SaleState::Available => Ok(()),
            SaleState::ExclusiveSold => Err(PurchaseError::ExclusiveSoldOut { requested: tier }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    ExclusiveSoldOut { requested: LicenseTier },
}

impl fmt::Display for PurchaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseError::ExclusiveSoldOut { requested } => write!(
                f,
                "beat was sold with an exclusive license; {} is no longer available",
                requested
            ),
        }
    }
}

impl std::error::Error for PurchaseError {}

/// What a viewer is offered on a beat page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchasePath {
    /// The viewer produced the beat.
    Manage,
    /// Sold out: purchasing is blocked and the viewer is sent to message the producer.
    ContactProducer { producer_id: UserId },
    /// The viewer already holds a license for the beat.
    Owned,
    /// Tiers with their prices.
    Purchase { options: Vec<(LicenseTier, Cents)> },
}

/// `owned` tells whether the viewer already bought a license. A sold-out beat
/// sends everyone but its producer to the contact path, buyers included.
pub fn purchase_path(
    beat: &Beat,
    state: SaleState,
    viewer: Option<UserId>,
    owned: bool,
) -> PurchasePath {
    if viewer == Some(beat.producer_id) {
        return PurchasePath::Manage;
    }
    if state.is_sold_out() {
        return PurchasePath::ContactProducer {
            producer_id: beat.producer_id,
        };
    }
    if owned {
        return PurchasePath::Owned;
    }
    PurchasePath::Purchase {
        options: LicenseTier::ALL
            .iter()
            .map(|tier| (*tier, tier.price_for(beat)))
            .collect(),
    }
}
