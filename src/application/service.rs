use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{
    cart_total, checkout_reference, compute_balance, purchase_path, validate_signup, validate_username,
    withdrawal_amounts, Beat, BeatFilter, BeatId, CartItem, Cents, Comment, Conversation,
    ConversationId, LicenseTier, LikeToggle, LikeView, Message, NewBeat, Profile, ProfileUpdate,
    Purchase, PurchasePath, SaleState, Transaction, UserId, VisibilityToggle,
    run_optimistic,
};
use crate::storage::{
    object_name, BalanceMismatch, BlobStore, ChangeFeed, ChangeOp, CheckoutOutcome, FeedFilter,
    InsertOutcome, Repository, Subscription, Table, WithdrawOutcome, AUDIO_BUCKET, COVER_BUCKET,
};

use super::chat::resolve_conversation;
use super::AppError;

const HOME_LATEST_LIMIT: usize = 4;
const HOME_TRENDING_LIMIT: usize = 4;
const FEATURED_PRODUCERS_LIMIT: usize = 6;
const PROFILE_SEARCH_LIMIT: usize = 4;

const MB: usize = 1024 * 1024;
pub const MAX_AUDIO_BYTES: usize = 20 * MB;
pub const MAX_COVER_BYTES: usize = 2 * MB;

/// Application service providing the marketplace operations.
/// This is the primary interface for any client (CLI, API, TUI, etc.).
pub struct MarketService {
    repo: Repository,
    blobs: BlobStore,
    bcrypt_cost: u32,
}

/// A file handed to an upload.
pub struct Upload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Beat with its sold-out flag, as listed on a profile page.
pub struct BeatCard {
    pub beat: Beat,
    pub sold_out: bool,
}

/// Public profile page
pub struct ProfilePage {
    pub profile: Profile,
    pub beats: Vec<BeatCard>,
    pub followers: i64,
    pub following: i64,
    pub viewer_follows: bool,
}

/// Everything a beat page shows
pub struct BeatDetails {
    pub beat: Beat,
    pub producer: Profile,
    pub sale_state: SaleState,
    pub path: PurchasePath,
    pub likes: LikeView,
    pub views: i64,
    pub comments: Vec<Comment>,
}

pub struct HomeFeed {
    pub latest: Vec<Beat>,
    pub trending: Vec<Beat>,
    pub producers: Vec<Profile>,
}

pub struct ExploreResult {
    pub beats: Vec<Beat>,
    pub profiles: Vec<Profile>,
}

pub struct CartSummary {
    pub items: Vec<CartItem>,
    pub total: Cents,
}

/// Result of a completed checkout
pub struct CheckoutReceipt {
    pub transaction_id: String,
    pub purchases: Vec<Purchase>,
    pub total: Cents,
}

/// Result of a completed withdrawal
pub struct WithdrawalReceipt {
    pub transaction: Transaction,
    pub balance: Cents,
}

/// One sale on the earnings dashboard. The title is gone once the beat is deleted.
pub struct SaleLine {
    pub purchase: Purchase,
    pub beat_title: Option<String>,
}

/// Producer earnings overview
pub struct Dashboard {
    pub beats: Vec<Beat>,
    pub sales: Vec<SaleLine>,
    pub total_earnings: Cents,
    pub sale_count: usize,
    pub balance: Cents,
    pub transactions: Vec<Transaction>,
}

/// One row of a user's inbox
pub struct InboxEntry {
    pub conversation: Conversation,
    pub partner: Profile,
    pub preview: Option<String>,
    pub is_my_message: bool,
}

impl MarketService {
    /// Create a new service over a repository and a blob store.
    pub fn new(repo: Repository, blobs: BlobStore) -> Self {
        Self {
            repo,
            blobs,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        }
    }

    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str, blobs: BlobStore) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}?mode=rwc", database_path);
        let repo = Repository::init(&db_url).await?;
        Ok(Self::new(repo, blobs))
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str, blobs: BlobStore) -> Result<Self, AppError> {
        let db_url = format!("sqlite:{}", database_path);
        let repo = Repository::connect(&db_url).await?;
        Ok(Self::new(repo, blobs))
    }

    /// Lower the hashing cost. Used by tests, where the default cost is slow.
    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    pub fn feed(&self) -> &ChangeFeed {
        self.repo.feed()
    }

    // ========================
    // Accounts
    // ========================

    /// Register a new account.
    pub async fn sign_up(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Profile, AppError> {
        let username = username.trim();
        let email = email.trim();
        validate_signup(username, email, password).map_err(AppError::Validation)?;

        let hash = hash_password(password.to_string(), self.bcrypt_cost).await?;
        let profile = Profile::new(username.to_string(), email.to_string(), hash);

        match self.repo.save_profile(&profile).await? {
            InsertOutcome::Inserted => {
                info!(user = %profile.id, username = %profile.username, "account created");
                Ok(profile)
            }
            InsertOutcome::Conflict => Err(AppError::Conflict(format!(
                "username '{}' or email '{}' is already registered",
                username, email
            ))),
        }
    }

    /// Check credentials and return the account. `login` is an email address,
    /// or a username when it contains no `@`.
    pub async fn sign_in(&self, login: &str, password: &str) -> Result<Profile, AppError> {
        let login = login.trim();
        let profile = if login.contains('@') {
            self.repo.get_profile_by_email(login).await?
        } else {
            self.repo.get_profile_by_username(login).await?
        };
        let profile = profile.ok_or(AppError::InvalidCredentials)?;

        if !verify_password(password.to_string(), profile.password_hash.clone()).await? {
            debug!(user = %profile.id, "password mismatch");
            return Err(AppError::InvalidCredentials);
        }
        Ok(profile)
    }

    pub async fn change_password(
        &self,
        user_id: UserId,
        current: &str,
        new_password: &str,
    ) -> Result<(), AppError> {
        let profile = self.get_profile(user_id).await?;
        if !verify_password(current.to_string(), profile.password_hash.clone()).await? {
            return Err(AppError::InvalidCredentials);
        }
        validate_signup(&profile.username, &profile.email, new_password)
            .map_err(AppError::Validation)?;

        let hash = hash_password(new_password.to_string(), self.bcrypt_cost).await?;
        self.repo.update_password_hash(user_id, &hash).await?;
        Ok(())
    }

    pub async fn get_profile(&self, id: UserId) -> Result<Profile, AppError> {
        self.repo
            .get_profile(id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(id.to_string()))
    }

    pub async fn get_profile_by_username(&self, username: &str) -> Result<Profile, AppError> {
        self.repo
            .get_profile_by_username(username)
            .await?
            .ok_or_else(|| AppError::UserNotFound(username.to_string()))
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        update: ProfileUpdate,
    ) -> Result<Profile, AppError> {
        let mut profile = self.get_profile(user_id).await?;
        update.apply_to(&mut profile);
        validate_username(&profile.username).map_err(AppError::Validation)?;

        match self.repo.update_profile(&profile).await? {
            InsertOutcome::Inserted => Ok(profile),
            InsertOutcome::Conflict => Err(AppError::Conflict(format!(
                "username '{}' is taken",
                profile.username
            ))),
        }
    }

    /// Profile page of `username` as seen by `viewer`. Hidden beats are listed
    /// only for the owner.
    pub async fn profile_page(
        &self,
        username: &str,
        viewer: Option<UserId>,
    ) -> Result<ProfilePage, AppError> {
        let profile = self.get_profile_by_username(username).await?;
        let is_owner = viewer == Some(profile.id);

        let beats = self.repo.list_beats_by_producer(profile.id, is_owner).await?;
        let sold = self.repo.exclusive_sold_beats(profile.id).await?;
        let beats = beats
            .into_iter()
            .map(|beat| BeatCard {
                sold_out: sold.contains(&beat.id),
                beat,
            })
            .collect();

        let (followers, following) = self.repo.count_follows(profile.id).await?;
        let viewer_follows = match viewer {
            Some(v) if v != profile.id => self.repo.is_following(v, profile.id).await?,
            _ => false,
        };

        Ok(ProfilePage {
            profile,
            beats,
            followers,
            following,
            viewer_follows,
        })
    }

    /// Beats the user holds a license for.
    pub async fn collection(&self, user_id: UserId) -> Result<Vec<Beat>, AppError> {
        Ok(self.repo.list_purchased_beats(user_id).await?)
    }

    /// Follow or unfollow. Returns whether `follower` follows the target afterwards.
    pub async fn toggle_follow(&self, follower: UserId, username: &str) -> Result<bool, AppError> {
        let target = self.get_profile_by_username(username).await?;
        if target.id == follower {
            return Err(AppError::InvalidOperation("cannot follow yourself".to_string()));
        }

        if self.repo.is_following(follower, target.id).await? {
            self.repo.remove_follow(follower, target.id).await?;
            Ok(false)
        } else {
            self.repo.add_follow(follower, target.id).await?;
            Ok(true)
        }
    }

    // ========================
    // Catalog
    // ========================

    /// Store the audio (and optional cover) and publish the beat.
    /// The uploader becomes a producer.
    pub async fn upload_beat(
        &self,
        producer_id: UserId,
        draft: NewBeat,
        audio: Upload,
        cover: Option<Upload>,
    ) -> Result<Beat, AppError> {
        draft.validate().map_err(AppError::Validation)?;
        if audio.bytes.is_empty() {
            return Err(AppError::Validation("audio file is empty".to_string()));
        }
        if audio.bytes.len() > MAX_AUDIO_BYTES {
            return Err(AppError::Validation(format!(
                "audio file too large, max {} MB",
                MAX_AUDIO_BYTES / MB
            )));
        }
        if cover.as_ref().is_some_and(|c| c.bytes.len() > MAX_COVER_BYTES) {
            return Err(AppError::Validation(format!(
                "cover image too large, max {} MB",
                MAX_COVER_BYTES / MB
            )));
        }
        let producer = self.get_profile(producer_id).await?;

        let millis = Utc::now().timestamp_millis();
        let owner = producer.id.to_string();
        let audio_path = object_name(&owner, &audio.file_name, millis);
        let audio_url = self
            .blobs
            .upload(AUDIO_BUCKET, &audio_path, &audio.bytes)
            .await?;

        let mut beat = Beat::new(producer.id, draft, audio_url);
        if let Some(cover) = cover {
            let cover_path = object_name(&owner, &cover.file_name, millis);
            let cover_url = self
                .blobs
                .upload(COVER_BUCKET, &cover_path, &cover.bytes)
                .await?;
            beat = beat.with_cover(cover_url);
        }

        self.repo.save_beat(&beat).await?;
        if !producer.is_producer {
            self.repo.mark_producer(producer.id).await?;
        }

        info!(beat = %beat.id, producer = %producer.username, title = %beat.title, "beat uploaded");
        Ok(beat)
    }

    pub async fn get_beat(&self, id: BeatId) -> Result<Beat, AppError> {
        self.repo
            .get_beat(id)
            .await?
            .ok_or_else(|| AppError::BeatNotFound(id.to_string()))
    }

    /// Beat page for `viewer`. Signed-in views are logged.
    pub async fn beat_details(
        &self,
        id: BeatId,
        viewer: Option<UserId>,
    ) -> Result<BeatDetails, AppError> {
        let beat = self.visible_beat(id, viewer).await?;

        let owned = match viewer {
            Some(user) => {
                self.repo.record_view(beat.id, user).await?;
                self.repo.has_purchased(user, beat.id).await?
            }
            None => false,
        };

        let producer = self.get_profile(beat.producer_id).await?;
        let sale_state = self.repo.sale_state(beat.id).await?;
        let path = purchase_path(&beat, sale_state, viewer, owned);
        let likes = self.like_view(viewer, beat.id).await?;
        let views = self.repo.count_views(beat.id).await?;
        let comments = self.repo.list_comments(beat.id).await?;

        Ok(BeatDetails {
            beat,
            producer,
            sale_state,
            path,
            likes,
            views,
            comments,
        })
    }

    /// Visible beats matching the filter, plus matching profiles when searching.
    pub async fn explore(&self, filter: BeatFilter) -> Result<ExploreResult, AppError> {
        let filter = filter.normalized();
        let beats = self.repo.list_beats_filtered(&filter).await?;
        let profiles = match &filter.search {
            Some(query) => self.repo.search_profiles(query, PROFILE_SEARCH_LIMIT).await?,
            None => Vec::new(),
        };
        Ok(ExploreResult { beats, profiles })
    }

    pub async fn home(&self) -> Result<HomeFeed, AppError> {
        let latest = self
            .repo
            .list_beats_filtered(&BeatFilter {
                limit: Some(HOME_LATEST_LIMIT),
                ..Default::default()
            })
            .await?;
        let trending = self.repo.trending_beats(HOME_TRENDING_LIMIT).await?;
        let producers = self.repo.list_producers(FEATURED_PRODUCERS_LIMIT).await?;
        Ok(HomeFeed {
            latest,
            trending,
            producers,
        })
    }

    /// Show or hide a beat. Only its producer may do this.
    pub async fn set_visibility(
        &self,
        owner: UserId,
        beat_id: BeatId,
        visible: bool,
    ) -> Result<Beat, AppError> {
        let beat = self.owned_beat(owner, beat_id).await?;
        if beat.is_visible == visible {
            return Ok(beat);
        }

        let toggle = VisibilityToggle::flip(&beat);
        let mut view = vec![beat];
        run_optimistic(&mut view, &toggle, || async {
            match self.repo.set_beat_visibility(beat_id, toggle.visible).await? {
                true => Ok(()),
                false => Err(AppError::BeatNotFound(beat_id.to_string())),
            }
        })
        .await?;

        view.pop()
            .ok_or_else(|| AppError::BeatNotFound(beat_id.to_string()))
    }

    /// Permanently delete a beat. Stored files are removed afterwards on a
    /// best-effort basis.
    pub async fn delete_beat(&self, owner: UserId, beat_id: BeatId) -> Result<(), AppError> {
        let beat = self.owned_beat(owner, beat_id).await?;

        if !self.repo.delete_beat(beat.id).await? {
            return Err(AppError::BeatNotFound(beat_id.to_string()));
        }
        info!(beat = %beat.id, title = %beat.title, "beat deleted");

        let files = [
            (AUDIO_BUCKET, Some(beat.audio_url.as_str())),
            (COVER_BUCKET, beat.cover_url.as_deref()),
        ];
        for (bucket, url) in files {
            let Some(path) = url.and_then(|u| self.blobs.path_from_url(bucket, u)) else {
                continue;
            };
            if let Err(e) = self.blobs.remove(bucket, path).await {
                warn!(beat = %beat.id, bucket, error = %e, "failed to remove stored file");
            }
        }
        Ok(())
    }

    /// Count one play. Returns the new total.
    pub async fn record_play(&self, beat_id: BeatId) -> Result<i64, AppError> {
        self.repo
            .increment_plays(beat_id)
            .await?
            .ok_or_else(|| AppError::BeatNotFound(beat_id.to_string()))
    }

    pub async fn add_comment(
        &self,
        user_id: UserId,
        beat_id: BeatId,
        text: &str,
    ) -> Result<Comment, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidOperation("comment is empty".to_string()));
        }
        let beat = self.visible_beat(beat_id, Some(user_id)).await?;
        let comment = Comment::new(beat.id, user_id, text);
        self.repo.save_comment(&comment).await?;
        Ok(comment)
    }

    pub async fn list_comments(&self, beat_id: BeatId) -> Result<Vec<Comment>, AppError> {
        Ok(self.repo.list_comments(beat_id).await?)
    }

    /// A hidden beat exists only for its producer.
    async fn visible_beat(
        &self,
        beat_id: BeatId,
        viewer: Option<UserId>,
    ) -> Result<Beat, AppError> {
        let beat = self.get_beat(beat_id).await?;
        if !beat.is_visible && viewer != Some(beat.producer_id) {
            return Err(AppError::BeatNotFound(beat_id.to_string()));
        }
        Ok(beat)
    }

    async fn owned_beat(&self, owner: UserId, beat_id: BeatId) -> Result<Beat, AppError> {
        let beat = self.get_beat(beat_id).await?;
        if beat.producer_id != owner {
            return Err(AppError::InvalidOperation(
                "only the producer can manage this beat".to_string(),
            ));
        }
        Ok(beat)
    }

    // ========================
    // Likes
    // ========================

    pub async fn like_view(
        &self,
        viewer: Option<UserId>,
        beat_id: BeatId,
    ) -> Result<LikeView, AppError> {
        let count = self.repo.count_favorites(beat_id).await?;
        let liked = match viewer {
            Some(user) => self.repo.is_favorite(user, beat_id).await?,
            None => false,
        };
        Ok(LikeView { liked, count })
    }

    /// Like or unlike. Returns the view after the change.
    pub async fn toggle_like(&self, user_id: UserId, beat_id: BeatId) -> Result<LikeView, AppError> {
        self.visible_beat(beat_id, Some(user_id)).await?;
        let mut view = self.like_view(Some(user_id), beat_id).await?;
        let toggle = LikeToggle::from_view(&view);

        run_optimistic(&mut view, &toggle, || async {
            if toggle.unlikes() {
                self.repo.remove_favorite(user_id, beat_id).await?;
            } else {
                self.repo.add_favorite(user_id, beat_id).await?;
            }
            Ok::<(), AppError>(())
        })
        .await?;

        Ok(view)
    }

    pub async fn liked_beats(&self, user_id: UserId) -> Result<Vec<Beat>, AppError> {
        Ok(self.repo.list_liked_beats(user_id).await?)
    }

    /// Like changes for one beat, for keeping a counter live.
    pub fn subscribe_likes(&self, beat_id: BeatId) -> Subscription {
        self.feed()
            .subscribe(FeedFilter::table(Table::Favorites).eq("beat_id", beat_id))
    }

    // ========================
    // Cart & checkout
    // ========================

    pub async fn add_to_cart(
        &self,
        user_id: UserId,
        beat_id: BeatId,
        license: LicenseTier,
    ) -> Result<CartItem, AppError> {
        let beat = self.visible_beat(beat_id, Some(user_id)).await?;
        if beat.producer_id == user_id {
            return Err(AppError::InvalidOperation(
                "cannot buy your own beat".to_string(),
            ));
        }
        if self.repo.has_purchased(user_id, beat.id).await? {
            return Err(AppError::InvalidOperation(format!(
                "you already own a license for '{}'",
                beat.title
            )));
        }

        let state = self.repo.sale_state(beat.id).await?;
        state
            .check_purchase(license)
            .map_err(|_| AppError::ExclusiveSoldOut {
                beat: beat.title.clone(),
                requested: license,
            })?;

        let item = CartItem::new(user_id, beat.id, license, license.price_for(&beat));
        match self.repo.save_cart_item(&item).await? {
            InsertOutcome::Inserted => Ok(item),
            InsertOutcome::Conflict => Err(AppError::Conflict(format!(
                "'{}' is already in the cart",
                beat.title
            ))),
        }
    }

    pub async fn cart(&self, user_id: UserId) -> Result<CartSummary, AppError> {
        let items = self.repo.list_cart(user_id).await?;
        let total = cart_total(&items);
        Ok(CartSummary { items, total })
    }

    pub async fn remove_from_cart(&self, user_id: UserId, item_id: Uuid) -> Result<(), AppError> {
        if !self.repo.remove_cart_item(user_id, item_id).await? {
            return Err(AppError::InvalidOperation(format!(
                "cart item {} not found",
                item_id
            )));
        }
        Ok(())
    }

    /// Buy everything in the cart. Either every item becomes a purchase or none does.
    pub async fn checkout(&self, user_id: UserId) -> Result<CheckoutReceipt, AppError> {
        let transaction_id = checkout_reference(Utc::now());

        match self.repo.checkout(user_id, &transaction_id).await? {
            CheckoutOutcome::Completed(purchases) => {
                let total: Cents = purchases.iter().map(|p| p.price_paid_cents).sum();
                info!(user = %user_id, %transaction_id, items = purchases.len(), total, "checkout completed");
                Ok(CheckoutReceipt {
                    transaction_id,
                    purchases,
                    total,
                })
            }
            CheckoutOutcome::EmptyCart => {
                Err(AppError::InvalidOperation("cart is empty".to_string()))
            }
            CheckoutOutcome::SoldOut { beat_id, license } => {
                let beat = self
                    .repo
                    .get_beat(beat_id)
                    .await?
                    .map(|b| b.title)
                    .unwrap_or_else(|| beat_id.to_string());
                Err(AppError::ExclusiveSoldOut {
                    beat,
                    requested: license,
                })
            }
            CheckoutOutcome::MissingBeat(beat_id) => Err(AppError::BeatNotFound(beat_id.to_string())),
        }
    }

    // ========================
    // Earnings
    // ========================

    /// Available balance derived from sales and withdrawals.
    pub async fn balance(&self, user_id: UserId) -> Result<Cents, AppError> {
        let sales = self.repo.list_sales_for_seller(user_id).await?;
        let transactions = self.repo.list_transactions(user_id).await?;
        Ok(derived_balance(&sales, &transactions))
    }

    pub async fn withdraw(&self, user_id: UserId, amount: Cents) -> Result<WithdrawalReceipt, AppError> {
        match self.repo.withdraw(user_id, amount).await? {
            WithdrawOutcome::Completed {
                transaction,
                balance,
            } => {
                info!(user = %user_id, amount, balance, "withdrawal recorded");
                Ok(WithdrawalReceipt {
                    transaction,
                    balance,
                })
            }
            WithdrawOutcome::Rejected(reason) => {
                debug!(user = %user_id, amount, %reason, "withdrawal rejected");
                Err(reason.into())
            }
        }
    }

    pub async fn dashboard(&self, user_id: UserId) -> Result<Dashboard, AppError> {
        let beats = self.repo.list_beats_by_producer(user_id, true).await?;
        let sales = self.repo.list_sales_for_seller(user_id).await?;
        let transactions = self.repo.list_transactions(user_id).await?;

        let balance = derived_balance(&sales, &transactions);
        let total_earnings: Cents = sales.iter().map(|s| s.price_paid_cents).sum();
        let titles: HashMap<BeatId, &str> =
            beats.iter().map(|b| (b.id, b.title.as_str())).collect();
        let sales: Vec<SaleLine> = sales
            .into_iter()
            .map(|purchase| SaleLine {
                beat_title: titles.get(&purchase.beat_id).map(|t| t.to_string()),
                purchase,
            })
            .collect();

        Ok(Dashboard {
            sale_count: sales.len(),
            beats,
            sales,
            total_earnings,
            balance,
            transactions,
        })
    }

    /// Accounts whose stored balance disagrees with their sales and withdrawals.
    pub async fn check_balances(&self) -> Result<Vec<BalanceMismatch>, AppError> {
        Ok(self.repo.find_balance_mismatches().await?)
    }

    pub async fn sales(&self, user_id: UserId) -> Result<Vec<Purchase>, AppError> {
        Ok(self.repo.list_sales_for_seller(user_id).await?)
    }

    /// Licenses the user bought, newest first.
    pub async fn purchases(&self, user_id: UserId) -> Result<Vec<Purchase>, AppError> {
        Ok(self.repo.list_purchases_for_buyer(user_id).await?)
    }

    pub async fn transactions(&self, user_id: UserId) -> Result<Vec<Transaction>, AppError> {
        Ok(self.repo.list_transactions(user_id).await?)
    }

    // ========================
    // Messaging
    // ========================

    /// The conversation between two users, created on first contact.
    pub async fn open_conversation(
        &self,
        initiator: UserId,
        recipient: UserId,
    ) -> Result<Conversation, AppError> {
        self.get_profile(recipient).await?;
        resolve_conversation(&self.repo, initiator, recipient).await
    }

    /// Conversation with the producer of a beat.
    pub async fn contact_producer(
        &self,
        viewer: UserId,
        beat_id: BeatId,
    ) -> Result<Conversation, AppError> {
        let beat = self.visible_beat(beat_id, Some(viewer)).await?;
        self.open_conversation(viewer, beat.producer_id).await
    }

    pub async fn send_message(
        &self,
        sender: UserId,
        conversation_id: ConversationId,
        text: &str,
    ) -> Result<Message, AppError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AppError::InvalidOperation("message is empty".to_string()));
        }
        self.participant_conversation(sender, conversation_id).await?;

        let message = Message::new(conversation_id, sender, text);
        self.repo.save_message(&message).await?;
        debug!(conversation = %conversation_id, sender = %sender, "message sent");
        Ok(message)
    }

    /// Messages in send order. Only participants may read them.
    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Vec<Message>, AppError> {
        self.participant_conversation(user_id, conversation_id)
            .await?;
        Ok(self.repo.list_messages(conversation_id).await?)
    }

    /// Conversations of a user, most recently active first.
    pub async fn inbox(&self, user_id: UserId) -> Result<Vec<InboxEntry>, AppError> {
        let conversations = self.repo.list_conversations_for(user_id).await?;
        let mut entries = Vec::with_capacity(conversations.len());

        for conversation in conversations {
            let Some(partner_id) = conversation.partner_of(user_id) else {
                continue;
            };
            let partner = self.get_profile(partner_id).await?;
            let last = self.repo.last_message(conversation.id).await?;
            let is_my_message = last.as_ref().is_some_and(|m| m.sender_id == user_id);

            entries.push(InboxEntry {
                preview: conversation.last_message.clone(),
                conversation,
                partner,
                is_my_message,
            });
        }
        Ok(entries)
    }

    /// New messages of one conversation as they are sent.
    pub async fn subscribe_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Subscription, AppError> {
        self.participant_conversation(user_id, conversation_id)
            .await?;
        Ok(self.feed().subscribe(
            FeedFilter::table(Table::Messages)
                .op(ChangeOp::Insert)
                .eq("conversation_id", conversation_id),
        ))
    }

    async fn participant_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<Conversation, AppError> {
        let conversation = self
            .repo
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound(conversation_id.to_string()))?;
        if !conversation.has_participant(user_id) {
            return Err(AppError::InvalidOperation(
                "not a participant of this conversation".to_string(),
            ));
        }
        Ok(conversation)
    }
}

fn derived_balance(sales: &[Purchase], transactions: &[Transaction]) -> Cents {
    let earned: Vec<Cents> = sales.iter().map(|s| s.price_paid_cents).collect();
    compute_balance(&earned, &withdrawal_amounts(transactions))
}

async fn hash_password(password: String, cost: u32) -> Result<String, AppError> {
    let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("Password hashing task failed")?
        .context("Failed to hash password")?;
    Ok(hash)
}

async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    let ok = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash).unwrap_or(false))
        .await
        .context("Password verification task failed")?;
    Ok(ok)
}

/// Decode a message carried by a change event.
pub fn message_from_event(row: &serde_json::Value) -> Result<Message, AppError> {
    Ok(serde_json::from_value(row.clone()).context("Malformed message event")?)
}
