use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{
    compute_balance, validate_withdrawal, Beat, BeatFilter, BeatId, CartItem, Cents, Comment,
    Conversation, ConversationId, LicenseTier, Message, Profile, Purchase, SaleState, Transaction,
    TransactionKind, UserId, WithdrawalError,
};

use super::feed::{ChangeFeed, ChangeOp, Table};
use super::MIGRATION_001_INITIAL;

const PROFILE_COLUMNS: &str = "id, username, email, password_hash, bio, twitter, instagram, is_producer, balance_cents, created_at";

const BEAT_COLUMNS: &str = "id, producer_id, title, bpm, musical_key, genre, price_cents, price_wav_cents, price_exclusive_cents, audio_url, cover_url, is_visible, plays_count, created_at";

const PURCHASE_COLUMNS: &str = "id, user_id, seller_id, beat_id, price_paid_cents, currency, license_type, transaction_id, created_at";

const CONVERSATION_COLUMNS: &str =
    "id, participant_1, participant_2, last_message, created_at, updated_at";

/// Result of an insert guarded by a uniqueness constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same unique key already exists.
    Conflict,
}

/// Result of moving a cart into purchases.
#[derive(Debug)]
pub enum CheckoutOutcome {
    Completed(Vec<Purchase>),
    EmptyCart,
    /// A beat in the cart already has an exclusive sale. Nothing was written.
    SoldOut { beat_id: BeatId, license: LicenseTier },
    /// A beat in the cart was deleted. Nothing was written.
    MissingBeat(BeatId),
}

/// Result of a withdrawal attempt.
#[derive(Debug)]
pub enum WithdrawOutcome {
    Completed {
        transaction: Transaction,
        balance: Cents,
    },
    Rejected(WithdrawalError),
}

/// Stored balance that disagrees with the sales and withdrawals on record.
#[derive(Debug, Clone)]
pub struct BalanceMismatch {
    pub user_id: UserId,
    pub username: String,
    pub stored: Cents,
    pub derived: Cents,
}

/// Repository for persisting and querying marketplace records.
/// Writes that other components watch are published on the change feed.
pub struct Repository {
    pool: SqlitePool,
    feed: ChangeFeed,
}

impl Repository {
    pub fn new(pool: SqlitePool, feed: ChangeFeed) -> Self {
        Self { pool, feed }
    }

    /// Connect to a SQLite database at the given URL.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool, ChangeFeed::default()))
    }

    /// Create the schema. Safe to run against an existing database.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Connect and migrate.
    pub async fn init(database_url: &str) -> Result<Self> {
        let repo = Self::connect(database_url).await?;
        repo.migrate().await?;
        info!(database_url, "database ready");
        Ok(repo)
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    // ========================
    // Profiles
    // ========================

    pub async fn save_profile(&self, profile: &Profile) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO profiles (id, username, email, password_hash, bio, twitter, instagram, is_producer, balance_cents, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(profile.id.to_string())
        .bind(&profile.username)
        .bind(&profile.email)
        .bind(&profile.password_hash)
        .bind(&profile.bio)
        .bind(&profile.twitter)
        .bind(&profile.instagram)
        .bind(profile.is_producer)
        .bind(profile.balance_cents)
        .bind(ts(profile.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e).context("Failed to save profile"),
        }
    }

    pub async fn get_profile(&self, id: UserId) -> Result<Option<Profile>> {
        let sql = format!("SELECT {} FROM profiles WHERE id = ?", PROFILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch profile")?;
        row.as_ref().map(Self::row_to_profile).transpose()
    }

    pub async fn get_profile_by_username(&self, username: &str) -> Result<Option<Profile>> {
        let sql = format!("SELECT {} FROM profiles WHERE username = ?", PROFILE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch profile by username")?;
        row.as_ref().map(Self::row_to_profile).transpose()
    }

    pub async fn get_profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE lower(email) = lower(?)",
            PROFILE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch profile by email")?;
        row.as_ref().map(Self::row_to_profile).transpose()
    }

    /// Persist editable fields. Returns `Conflict` if the new username is taken.
    pub async fn update_profile(&self, profile: &Profile) -> Result<InsertOutcome> {
        let result = sqlx::query(
            "UPDATE profiles SET username = ?, bio = ?, twitter = ?, instagram = ? WHERE id = ?",
        )
        .bind(&profile.username)
        .bind(&profile.bio)
        .bind(&profile.twitter)
        .bind(&profile.instagram)
        .bind(profile.id.to_string())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e).context("Failed to update profile"),
        }
    }

    pub async fn update_password_hash(&self, id: UserId, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE profiles SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update password")?;
        Ok(())
    }

    pub async fn mark_producer(&self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE profiles SET is_producer = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to mark producer")?;
        Ok(())
    }

    /// Profiles whose username contains `query` (case-insensitive).
    pub async fn search_profiles(&self, query: &str, limit: usize) -> Result<Vec<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE username LIKE '%' || ? || '%' ORDER BY username LIMIT ?",
            PROFILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(query)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to search profiles")?;
        rows.iter().map(Self::row_to_profile).collect()
    }

    pub async fn list_producers(&self, limit: usize) -> Result<Vec<Profile>> {
        let sql = format!(
            "SELECT {} FROM profiles WHERE is_producer = 1 ORDER BY created_at DESC LIMIT ?",
            PROFILE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list producers")?;
        rows.iter().map(Self::row_to_profile).collect()
    }

    fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<Profile> {
        Ok(Profile {
            id: parse_id(row, "id")?,
            username: row.get("username"),
            email: row.get("email"),
            password_hash: row.get("password_hash"),
            bio: row.get("bio"),
            twitter: row.get("twitter"),
            instagram: row.get("instagram"),
            is_producer: row.get::<i32, _>("is_producer") != 0,
            balance_cents: row.get("balance_cents"),
            created_at: parse_ts(row, "created_at")?,
        })
    }

    // ========================
    // Beats
    // ========================

    pub async fn save_beat(&self, beat: &Beat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO beats (id, producer_id, title, bpm, musical_key, genre, price_cents, price_wav_cents, price_exclusive_cents, audio_url, cover_url, is_visible, plays_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(beat.id.to_string())
        .bind(beat.producer_id.to_string())
        .bind(&beat.title)
        .bind(beat.bpm)
        .bind(&beat.key)
        .bind(&beat.genre)
        .bind(beat.price_cents)
        .bind(beat.price_wav_cents)
        .bind(beat.price_exclusive_cents)
        .bind(&beat.audio_url)
        .bind(&beat.cover_url)
        .bind(beat.is_visible)
        .bind(beat.plays_count)
        .bind(ts(beat.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to save beat")?;
        Ok(())
    }

    pub async fn get_beat(&self, id: BeatId) -> Result<Option<Beat>> {
        let sql = format!("SELECT {} FROM beats WHERE id = ?", BEAT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch beat")?;
        row.as_ref().map(Self::row_to_beat).transpose()
    }

    /// Visible beats matching the filter, newest first.
    pub async fn list_beats_filtered(&self, filter: &BeatFilter) -> Result<Vec<Beat>> {
        let mut query = format!("SELECT {} FROM beats WHERE is_visible = 1", BEAT_COLUMNS);

        if filter.search.is_some() {
            query.push_str(" AND title LIKE '%' || ? || '%'");
        }
        if filter.genre.is_some() {
            query.push_str(" AND genre LIKE '%' || ? || '%'");
        }
        if filter.min_bpm.is_some() {
            query.push_str(" AND bpm >= ?");
        }
        if filter.max_bpm.is_some() {
            query.push_str(" AND bpm <= ?");
        }
        if filter.max_price_cents.is_some() {
            query.push_str(" AND price_cents <= ?");
        }

        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        if let Some(lim) = filter.limit {
            query.push_str(&format!(" LIMIT {}", lim));
        }

        let mut sql_query = sqlx::query(&query);
        if let Some(search) = &filter.search {
            sql_query = sql_query.bind(search.trim());
        }
        if let Some(genre) = &filter.genre {
            sql_query = sql_query.bind(genre.trim());
        }
        if let Some(min) = filter.min_bpm {
            sql_query = sql_query.bind(min);
        }
        if let Some(max) = filter.max_bpm {
            sql_query = sql_query.bind(max);
        }
        if let Some(price) = filter.max_price_cents {
            sql_query = sql_query.bind(price);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list filtered beats")?;

        rows.iter().map(Self::row_to_beat).collect()
    }

    /// Most played visible beats.
    pub async fn trending_beats(&self, limit: usize) -> Result<Vec<Beat>> {
        let sql = format!(
            "SELECT {} FROM beats WHERE is_visible = 1 ORDER BY plays_count DESC, created_at DESC LIMIT ?",
            BEAT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list trending beats")?;
        rows.iter().map(Self::row_to_beat).collect()
    }

    pub async fn list_beats_by_producer(
        &self,
        producer_id: UserId,
        include_hidden: bool,
    ) -> Result<Vec<Beat>> {
        let sql = if include_hidden {
            format!(
                "SELECT {} FROM beats WHERE producer_id = ? ORDER BY created_at DESC, rowid DESC",
                BEAT_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM beats WHERE producer_id = ? AND is_visible = 1 ORDER BY created_at DESC, rowid DESC",
                BEAT_COLUMNS
            )
        };
        let rows = sqlx::query(&sql)
            .bind(producer_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list producer beats")?;
        rows.iter().map(Self::row_to_beat).collect()
    }

    /// Beats the user liked, most recent like first.
    pub async fn list_liked_beats(&self, user_id: UserId) -> Result<Vec<Beat>> {
        let sql = format!(
            r#"
            SELECT {} FROM beats
            JOIN (SELECT beat_id, created_at AS liked_at FROM favorites WHERE user_id = ?) f ON f.beat_id = beats.id
            ORDER BY f.liked_at DESC
            "#,
            prefixed(BEAT_COLUMNS, "beats")
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list liked beats")?;
        rows.iter().map(Self::row_to_beat).collect()
    }

    /// Beats the user holds at least one license for.
    pub async fn list_purchased_beats(&self, user_id: UserId) -> Result<Vec<Beat>> {
        let sql = format!(
            "SELECT {} FROM beats WHERE id IN (SELECT beat_id FROM purchases WHERE user_id = ?) ORDER BY created_at DESC",
            BEAT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list purchased beats")?;
        rows.iter().map(Self::row_to_beat).collect()
    }

    pub async fn set_beat_visibility(&self, id: BeatId, visible: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE beats SET is_visible = ? WHERE id = ?")
            .bind(visible)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update beat visibility")?;
        if result.rows_affected() > 0 {
            self.feed.publish(
                Table::Beats,
                ChangeOp::Update,
                json!({ "id": id.to_string(), "is_visible": visible }),
            );
        }
        Ok(result.rows_affected() > 0)
    }

    /// Server-side increment; returns the new play count, or `None` for an unknown beat.
    pub async fn increment_plays(&self, id: BeatId) -> Result<Option<i64>> {
        let row = sqlx::query(
            "UPDATE beats SET plays_count = plays_count + 1 WHERE id = ? RETURNING plays_count",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to increment plays")?;

        let plays: Option<i64> = row.map(|r| r.get("plays_count"));
        if let Some(count) = plays {
            self.feed.publish(
                Table::Beats,
                ChangeOp::Update,
                json!({ "id": id.to_string(), "plays_count": count }),
            );
        }
        Ok(plays)
    }

    /// Remove a beat together with its comments, likes, cart entries and view logs.
    /// Sale records are kept: they belong to the buyers and the seller's ledger.
    pub async fn delete_beat(&self, id: BeatId) -> Result<bool> {
        let id_str = id.to_string();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        for table in ["comments", "favorites", "cart_items", "view_logs"] {
            sqlx::query(&format!("DELETE FROM {} WHERE beat_id = ?", table))
                .bind(&id_str)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to delete {} for beat", table))?;
        }

        let deleted = sqlx::query("DELETE FROM beats WHERE id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await
            .context("Failed to delete beat")?
            .rows_affected();

        tx.commit().await.context("Failed to commit beat deletion")?;

        if deleted > 0 {
            self.feed
                .publish(Table::Beats, ChangeOp::Delete, json!({ "id": id_str }));
        }
        Ok(deleted > 0)
    }

    fn row_to_beat(row: &sqlx::sqlite::SqliteRow) -> Result<Beat> {
        Ok(Beat {
            id: parse_id(row, "id")?,
            producer_id: parse_id(row, "producer_id")?,
            title: row.get("title"),
            bpm: row.get("bpm"),
            key: row.get("musical_key"),
            genre: row.get("genre"),
            price_cents: row.get("price_cents"),
            price_wav_cents: row.get("price_wav_cents"),
            price_exclusive_cents: row.get("price_exclusive_cents"),
            audio_url: row.get("audio_url"),
            cover_url: row.get("cover_url"),
            is_visible: row.get::<i32, _>("is_visible") != 0,
            plays_count: row.get("plays_count"),
            created_at: parse_ts(row, "created_at")?,
        })
    }

    // ========================
    // Licensing
    // ========================

    pub async fn sale_state(&self, beat_id: BeatId) -> Result<SaleState> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM purchases WHERE beat_id = ? AND license_type = ?) AS sold",
        )
        .bind(beat_id.to_string())
        .bind(LicenseTier::Exclusive.as_str())
        .fetch_one(&self.pool)
        .await
        .context("Failed to check exclusive sale")?;

        Ok(if row.get::<i32, _>("sold") != 0 {
            SaleState::ExclusiveSold
        } else {
            SaleState::Available
        })
    }

    /// Ids of the producer's beats that have been sold exclusively.
    pub async fn exclusive_sold_beats(&self, producer_id: UserId) -> Result<HashSet<BeatId>> {
        let rows = sqlx::query(
            "SELECT DISTINCT beat_id FROM purchases WHERE seller_id = ? AND license_type = ?",
        )
        .bind(producer_id.to_string())
        .bind(LicenseTier::Exclusive.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list exclusive sales")?;

        rows.iter().map(|row| parse_id(row, "beat_id")).collect()
    }

    pub async fn has_purchased(&self, user_id: UserId, beat_id: BeatId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM purchases WHERE user_id = ? AND beat_id = ?) AS owned",
        )
        .bind(user_id.to_string())
        .bind(beat_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to check ownership")?;
        Ok(row.get::<i32, _>("owned") != 0)
    }

    pub async fn list_purchases_for_buyer(&self, user_id: UserId) -> Result<Vec<Purchase>> {
        let sql = format!(
            "SELECT {} FROM purchases WHERE user_id = ? ORDER BY created_at DESC, rowid DESC",
            PURCHASE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list purchases")?;
        rows.iter().map(Self::row_to_purchase).collect()
    }

    /// Sale records where `seller_id` is the seller, newest first.
    pub async fn list_sales_for_seller(&self, seller_id: UserId) -> Result<Vec<Purchase>> {
        let sql = format!(
            "SELECT {} FROM purchases WHERE seller_id = ? ORDER BY created_at DESC, rowid DESC",
            PURCHASE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(seller_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list sales")?;
        rows.iter().map(Self::row_to_purchase).collect()
    }

    fn row_to_purchase(row: &sqlx::sqlite::SqliteRow) -> Result<Purchase> {
        let license_str: String = row.get("license_type");
        Ok(Purchase {
            id: parse_id(row, "id")?,
            user_id: parse_id(row, "user_id")?,
            seller_id: parse_id(row, "seller_id")?,
            beat_id: parse_id(row, "beat_id")?,
            price_paid_cents: row.get("price_paid_cents"),
            currency: row.get("currency"),
            license: LicenseTier::from_str(&license_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid license type: {}", license_str))?,
            transaction_id: row.get("transaction_id"),
            created_at: parse_ts(row, "created_at")?,
        })
    }

    // ========================
    // Cart & checkout
    // ========================

    /// Returns `Conflict` if the beat is already in the user's cart.
    pub async fn save_cart_item(&self, item: &CartItem) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO cart_items (id, user_id, beat_id, price_cents, currency, license_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.user_id.to_string())
        .bind(item.beat_id.to_string())
        .bind(item.price_cents)
        .bind(&item.currency)
        .bind(item.license.as_str())
        .bind(ts(item.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e).context("Failed to save cart item"),
        }
    }

    pub async fn list_cart(&self, user_id: UserId) -> Result<Vec<CartItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, beat_id, price_cents, currency, license_type, created_at
            FROM cart_items
            WHERE user_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list cart")?;
        rows.iter().map(Self::row_to_cart_item).collect()
    }

    pub async fn remove_cart_item(&self, user_id: UserId, item_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cart_items WHERE id = ? AND user_id = ?")
            .bind(item_id.to_string())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to remove cart item")?;
        Ok(result.rows_affected() > 0)
    }

    /// Turn every cart item into a purchase, credit the sellers and empty the cart,
    /// all in one transaction. Any sold-out or missing beat aborts the whole checkout.
    pub async fn checkout(&self, user_id: UserId, transaction_id: &str) -> Result<CheckoutOutcome> {
        let user_str = user_id.to_string();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // take the write lock before reading sale state
        sqlx::query("UPDATE profiles SET balance_cents = balance_cents WHERE id = ?")
            .bind(&user_str)
            .execute(&mut *tx)
            .await
            .context("Failed to lock checkout")?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, beat_id, price_cents, currency, license_type, created_at
            FROM cart_items
            WHERE user_id = ?
            ORDER BY created_at, rowid
            "#,
        )
        .bind(&user_str)
        .fetch_all(&mut *tx)
        .await
        .context("Failed to read cart")?;
        let items: Vec<CartItem> = rows
            .iter()
            .map(Self::row_to_cart_item)
            .collect::<Result<_>>()?;

        if items.is_empty() {
            return Ok(CheckoutOutcome::EmptyCart);
        }

        let mut purchases = Vec::with_capacity(items.len());
        for item in &items {
            let beat_id = item.beat_id.to_string();
            let seller: Option<String> = sqlx::query("SELECT producer_id FROM beats WHERE id = ?")
                .bind(&beat_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to look up beat")?
                .map(|row| row.get("producer_id"));
            let Some(seller) = seller else {
                return Ok(CheckoutOutcome::MissingBeat(item.beat_id));
            };
            let seller_id = Uuid::parse_str(&seller).context("Invalid producer ID")?;

            let exclusive_rows = sqlx::query(
                "SELECT license_type FROM purchases WHERE beat_id = ? AND license_type = ?",
            )
            .bind(&beat_id)
            .bind(LicenseTier::Exclusive.as_str())
            .fetch_all(&mut *tx)
            .await
            .context("Failed to check exclusive sale")?;
            let already_sold = exclusive_rows.iter().map(|_| LicenseTier::Exclusive);
            let in_this_checkout = purchases
                .iter()
                .filter(|p: &&Purchase| p.beat_id == item.beat_id)
                .map(|p| p.license);
            let state = SaleState::from_sales(already_sold.chain(in_this_checkout));
            if state.check_purchase(item.license).is_err() {
                return Ok(CheckoutOutcome::SoldOut {
                    beat_id: item.beat_id,
                    license: item.license,
                });
            }

            purchases.push(Purchase::from_cart_item(item, seller_id, transaction_id));
        }

        for purchase in &purchases {
            let inserted = sqlx::query(
                r#"
                INSERT INTO purchases (id, user_id, seller_id, beat_id, price_paid_cents, currency, license_type, transaction_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(purchase.id.to_string())
            .bind(purchase.user_id.to_string())
            .bind(purchase.seller_id.to_string())
            .bind(purchase.beat_id.to_string())
            .bind(purchase.price_paid_cents)
            .bind(&purchase.currency)
            .bind(purchase.license.as_str())
            .bind(&purchase.transaction_id)
            .bind(ts(purchase.created_at))
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Ok(CheckoutOutcome::SoldOut {
                        beat_id: purchase.beat_id,
                        license: purchase.license,
                    });
                }
                Err(e) => return Err(e).context("Failed to record purchase"),
            }

            sqlx::query("UPDATE profiles SET balance_cents = balance_cents + ? WHERE id = ?")
                .bind(purchase.price_paid_cents)
                .bind(purchase.seller_id.to_string())
                .execute(&mut *tx)
                .await
                .context("Failed to credit seller")?;
        }

        sqlx::query("DELETE FROM cart_items WHERE user_id = ?")
            .bind(&user_str)
            .execute(&mut *tx)
            .await
            .context("Failed to clear cart")?;

        tx.commit().await.context("Failed to commit checkout")?;
        debug!(user = %user_id, count = purchases.len(), transaction_id, "checkout committed");

        Ok(CheckoutOutcome::Completed(purchases))
    }

    fn row_to_cart_item(row: &sqlx::sqlite::SqliteRow) -> Result<CartItem> {
        let license_str: String = row.get("license_type");
        Ok(CartItem {
            id: parse_id(row, "id")?,
            user_id: parse_id(row, "user_id")?,
            beat_id: parse_id(row, "beat_id")?,
            price_cents: row.get("price_cents"),
            currency: row.get("currency"),
            license: LicenseTier::from_str(&license_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid license type: {}", license_str))?,
            created_at: parse_ts(row, "created_at")?,
        })
    }

    // ========================
    // Ledger
    // ========================

    pub async fn list_transactions(&self, user_id: UserId) -> Result<Vec<Transaction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount_cents, kind, status, created_at
            FROM transactions
            WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(user_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list transactions")?;
        rows.iter().map(Self::row_to_transaction).collect()
    }

    /// Validate and record a withdrawal. The balance is recomputed from sales and
    /// withdrawals inside the transaction, and the cached profile balance and the
    /// withdrawal record are written together or not at all.
    pub async fn withdraw(&self, user_id: UserId, amount: Cents) -> Result<WithdrawOutcome> {
        let user_str = user_id.to_string();
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        // take the write lock before reading the balance
        sqlx::query("UPDATE profiles SET balance_cents = balance_cents WHERE id = ?")
            .bind(&user_str)
            .execute(&mut *tx)
            .await
            .context("Failed to lock balance")?;

        let sales: Cents = sqlx::query(
            "SELECT COALESCE(SUM(price_paid_cents), 0) AS total FROM purchases WHERE seller_id = ?",
        )
        .bind(&user_str)
        .fetch_one(&mut *tx)
        .await
        .context("Failed to sum sales")?
        .get("total");

        let withdrawn: Cents = sqlx::query(
            "SELECT COALESCE(SUM(amount_cents), 0) AS total FROM transactions WHERE user_id = ? AND kind = ?",
        )
        .bind(&user_str)
        .bind(TransactionKind::Withdrawal.as_str())
        .fetch_one(&mut *tx)
        .await
        .context("Failed to sum withdrawals")?
        .get("total");

        let balance = compute_balance(&[sales], &[withdrawn]);
        let remaining = match validate_withdrawal(amount, balance) {
            Ok(remaining) => remaining,
            Err(reason) => return Ok(WithdrawOutcome::Rejected(reason)),
        };

        sqlx::query("UPDATE profiles SET balance_cents = ? WHERE id = ?")
            .bind(remaining)
            .bind(&user_str)
            .execute(&mut *tx)
            .await
            .context("Failed to update balance")?;

        let transaction = Transaction::withdrawal(user_id, amount);
        sqlx::query(
            r#"
            INSERT INTO transactions (id, user_id, amount_cents, kind, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(transaction.id.to_string())
        .bind(&user_str)
        .bind(transaction.amount_cents)
        .bind(transaction.kind.as_str())
        .bind(&transaction.status)
        .bind(ts(transaction.created_at))
        .execute(&mut *tx)
        .await
        .context("Failed to record withdrawal")?;

        tx.commit().await.context("Failed to commit withdrawal")?;

        Ok(WithdrawOutcome::Completed {
            transaction,
            balance: remaining,
        })
    }

    /// Profiles whose cached balance differs from the derived one.
    pub async fn find_balance_mismatches(&self) -> Result<Vec<BalanceMismatch>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.username, p.balance_cents,
                COALESCE((SELECT SUM(price_paid_cents) FROM purchases WHERE seller_id = p.id), 0) AS sales,
                COALESCE((SELECT SUM(amount_cents) FROM transactions WHERE user_id = p.id AND kind = 'withdrawal'), 0) AS withdrawn
            FROM profiles p
            ORDER BY p.username
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to compute balances")?;

        let mut mismatches = Vec::new();
        for row in &rows {
            let stored: Cents = row.get("balance_cents");
            let derived = compute_balance(&[row.get("sales")], &[row.get("withdrawn")]);
            if stored != derived {
                mismatches.push(BalanceMismatch {
                    user_id: parse_id(row, "id")?,
                    username: row.get("username"),
                    stored,
                    derived,
                });
            }
        }
        Ok(mismatches)
    }

    fn row_to_transaction(row: &sqlx::sqlite::SqliteRow) -> Result<Transaction> {
        let kind_str: String = row.get("kind");
        Ok(Transaction {
            id: parse_id(row, "id")?,
            user_id: parse_id(row, "user_id")?,
            amount_cents: row.get("amount_cents"),
            kind: TransactionKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction kind: {}", kind_str))?,
            status: row.get("status"),
            created_at: parse_ts(row, "created_at")?,
        })
    }

    // ========================
    // Likes, follows, comments, views
    // ========================

    /// Returns false if the like already existed.
    pub async fn add_favorite(&self, user_id: UserId, beat_id: BeatId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO favorites (user_id, beat_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(user_id.to_string())
        .bind(beat_id.to_string())
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to add favorite")?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            self.feed.publish(
                Table::Favorites,
                ChangeOp::Insert,
                json!({ "user_id": user_id.to_string(), "beat_id": beat_id.to_string() }),
            );
        }
        Ok(inserted)
    }

    pub async fn remove_favorite(&self, user_id: UserId, beat_id: BeatId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM favorites WHERE user_id = ? AND beat_id = ?")
            .bind(user_id.to_string())
            .bind(beat_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to remove favorite")?;

        let removed = result.rows_affected() > 0;
        if removed {
            self.feed.publish(
                Table::Favorites,
                ChangeOp::Delete,
                json!({ "user_id": user_id.to_string(), "beat_id": beat_id.to_string() }),
            );
        }
        Ok(removed)
    }

    pub async fn is_favorite(&self, user_id: UserId, beat_id: BeatId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM favorites WHERE user_id = ? AND beat_id = ?) AS liked",
        )
        .bind(user_id.to_string())
        .bind(beat_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to check favorite")?;
        Ok(row.get::<i32, _>("liked") != 0)
    }

    pub async fn count_favorites(&self, beat_id: BeatId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM favorites WHERE beat_id = ?")
            .bind(beat_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count favorites")?;
        Ok(row.get("count"))
    }

    pub async fn add_follow(&self, follower: UserId, following: UserId) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO follows (follower_id, following_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(follower.to_string())
        .bind(following.to_string())
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to follow")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_follow(&self, follower: UserId, following: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM follows WHERE follower_id = ? AND following_id = ?")
            .bind(follower.to_string())
            .bind(following.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to unfollow")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_following(&self, follower: UserId, following: UserId) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM follows WHERE follower_id = ? AND following_id = ?) AS follows",
        )
        .bind(follower.to_string())
        .bind(following.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to check follow")?;
        Ok(row.get::<i32, _>("follows") != 0)
    }

    /// (followers, following) for a user.
    pub async fn count_follows(&self, user_id: UserId) -> Result<(i64, i64)> {
        let user_str = user_id.to_string();
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM follows WHERE following_id = ?) AS followers,
                (SELECT COUNT(*) FROM follows WHERE follower_id = ?) AS following
            "#,
        )
        .bind(&user_str)
        .bind(&user_str)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count follows")?;
        Ok((row.get("followers"), row.get("following")))
    }

    pub async fn save_comment(&self, comment: &Comment) -> Result<()> {
        sqlx::query(
            "INSERT INTO comments (id, beat_id, user_id, text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(comment.id.to_string())
        .bind(comment.beat_id.to_string())
        .bind(comment.user_id.to_string())
        .bind(&comment.text)
        .bind(ts(comment.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to save comment")?;
        Ok(())
    }

    /// Comments on a beat, newest first.
    pub async fn list_comments(&self, beat_id: BeatId) -> Result<Vec<Comment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, beat_id, user_id, text, created_at
            FROM comments
            WHERE beat_id = ?
            ORDER BY created_at DESC, rowid DESC
            "#,
        )
        .bind(beat_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list comments")?;

        rows.iter()
            .map(|row| {
                Ok(Comment {
                    id: parse_id(row, "id")?,
                    beat_id: parse_id(row, "beat_id")?,
                    user_id: parse_id(row, "user_id")?,
                    text: row.get("text"),
                    created_at: parse_ts(row, "created_at")?,
                })
            })
            .collect()
    }

    pub async fn record_view(&self, beat_id: BeatId, user_id: UserId) -> Result<()> {
        sqlx::query("INSERT INTO view_logs (beat_id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(beat_id.to_string())
            .bind(user_id.to_string())
            .bind(ts(Utc::now()))
            .execute(&self.pool)
            .await
            .context("Failed to record view")?;
        Ok(())
    }

    pub async fn count_views(&self, beat_id: BeatId) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM view_logs WHERE beat_id = ?")
            .bind(beat_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to count views")?;
        Ok(row.get("count"))
    }

    // ========================
    // Conversations & messages
    // ========================

    /// Conversation between `a` and `b` in either participant order.
    pub async fn find_conversation_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Conversation>> {
        let sql = format!(
            r#"
            SELECT {} FROM conversations
            WHERE (participant_1 = ? AND participant_2 = ?)
               OR (participant_1 = ? AND participant_2 = ?)
            LIMIT 1
            "#,
            CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(a.to_string())
            .bind(b.to_string())
            .bind(b.to_string())
            .bind(a.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to look up conversation")?;
        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    /// Insert a conversation. Returns `Conflict` when the pair already has one.
    pub async fn insert_conversation(&self, conversation: &Conversation) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO conversations (id, participant_1, participant_2, last_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conversation.id.to_string())
        .bind(conversation.participant_1.to_string())
        .bind(conversation.participant_2.to_string())
        .bind(&conversation.last_message)
        .bind(ts(conversation.created_at))
        .bind(ts(conversation.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                self.feed.publish(
                    Table::Conversations,
                    ChangeOp::Insert,
                    serde_json::to_value(conversation)?,
                );
                Ok(InsertOutcome::Inserted)
            }
            Err(e) if is_unique_violation(&e) => Ok(InsertOutcome::Conflict),
            Err(e) => Err(e).context("Failed to create conversation"),
        }
    }

    pub async fn get_conversation(&self, id: ConversationId) -> Result<Option<Conversation>> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE id = ?",
            CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch conversation")?;
        row.as_ref().map(Self::row_to_conversation).transpose()
    }

    /// Conversations involving the user, most recently active first.
    pub async fn list_conversations_for(&self, user_id: UserId) -> Result<Vec<Conversation>> {
        let sql = format!(
            r#"
            SELECT {} FROM conversations
            WHERE participant_1 = ? OR participant_2 = ?
            ORDER BY updated_at DESC, rowid DESC
            "#,
            CONVERSATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.to_string())
            .bind(user_id.to_string())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list conversations")?;
        rows.iter().map(Self::row_to_conversation).collect()
    }

    /// Append a message and bump the conversation's preview and activity time.
    pub async fn save_message(&self, message: &Message) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, text, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.conversation_id.to_string())
        .bind(message.sender_id.to_string())
        .bind(&message.text)
        .bind(ts(message.created_at))
        .execute(&mut *tx)
        .await
        .context("Failed to save message")?;

        sqlx::query("UPDATE conversations SET last_message = ?, updated_at = ? WHERE id = ?")
            .bind(&message.text)
            .bind(ts(message.created_at))
            .bind(message.conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to update conversation")?;

        tx.commit().await.context("Failed to commit message")?;

        self.feed
            .publish(Table::Messages, ChangeOp::Insert, serde_json::to_value(message)?);
        Ok(())
    }

    /// Messages of a conversation in the order they were sent.
    pub async fn list_messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, text, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to list messages")?;
        rows.iter().map(Self::row_to_message).collect()
    }

    pub async fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        let row = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, text, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT 1
            "#,
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch last message")?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
        Ok(Conversation {
            id: parse_id(row, "id")?,
            participant_1: parse_id(row, "participant_1")?,
            participant_2: parse_id(row, "participant_2")?,
            last_message: row.get("last_message"),
            created_at: parse_ts(row, "created_at")?,
            updated_at: parse_ts(row, "updated_at")?,
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        Ok(Message {
            id: parse_id(row, "id")?,
            conversation_id: parse_id(row, "conversation_id")?,
            sender_id: parse_id(row, "sender_id")?,
            text: row.get("text"),
            created_at: parse_ts(row, "created_at")?,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.get(column);
    Ok(DateTime::parse_from_rfc3339(&raw)
        .with_context(|| format!("Invalid {} timestamp: {}", column, raw))?
        .with_timezone(&Utc))
}

fn parse_id(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.get(column);
    Uuid::parse_str(&raw).with_context(|| format!("Invalid {}: {}", column, raw))
}

fn prefixed(columns: &str, table: &str) -> String {
    columns
        .split(", ")
        .map(|c| format!("{}.{}", table, c))
        .collect::<Vec<_>>()
        .join(", ")
}
