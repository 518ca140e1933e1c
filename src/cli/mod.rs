use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::application::{AppError, MarketService, PlayerContext, SessionContext, Upload};
use crate::config::{AppConfig, Overrides};
use crate::domain::{
    format_price, parse_cents, BeatFilter, LicenseTier, MessageLog, NewBeat, Profile,
    ProfileUpdate, PurchasePath,
};
use crate::storage::BlobStore;

const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Beatmarket - beat marketplace engine
#[derive(Parser)]
#[command(name = "beatmarket")]
#[command(about = "A local-first marketplace for beats: upload, license, sell and chat")]
#[command(version)]
pub struct Cli {
    /// Database file path
    #[arg(short, long, global = true, env = "BEATMARKET_DATABASE")]
    pub database: Option<String>,

    /// Directory holding uploaded files
    #[arg(long, global = true, env = "BEATMARKET_BLOB_ROOT")]
    pub blob_root: Option<PathBuf>,

    /// Base URL under which uploaded files are served
    #[arg(long, global = true, env = "BEATMARKET_PUBLIC_URL")]
    pub public_url: Option<String>,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "BEATMARKET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Username to act as. No password is asked for: anyone who can open
    /// the database file can act as any account.
    #[arg(short, long, global = true, env = "BEATMARKET_USER")]
    pub user: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new database
    Init,

    /// Create an account
    Signup {
        username: String,
        email: String,
        #[arg(long, env = "BEATMARKET_PASSWORD")]
        password: String,
    },

    /// Check credentials
    Login {
        /// Email address or username
        login: String,
        #[arg(long, env = "BEATMARKET_PASSWORD")]
        password: String,
    },

    /// Profile commands
    #[command(subcommand)]
    Profile(ProfileCommands),

    /// Beat management commands
    #[command(subcommand)]
    Beat(BeatCommands),

    /// Latest and trending beats
    Home,

    /// Browse visible beats
    Explore {
        /// Search in titles (also matches usernames)
        #[arg(short, long)]
        search: Option<String>,

        #[arg(short, long)]
        genre: Option<String>,

        #[arg(long)]
        min_bpm: Option<i64>,

        #[arg(long)]
        max_bpm: Option<i64>,

        /// Maximum MP3 lease price (e.g., "25.00")
        #[arg(long)]
        max_price: Option<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Like or unlike a beat
    Like { beat: String },

    /// Beats you liked
    Liked,

    /// Shopping cart commands
    #[command(subcommand)]
    Cart(CartCommands),

    /// Earnings overview
    Dashboard,

    /// Withdraw earnings (minimum $15.00)
    Withdraw {
        /// Amount (e.g., "15.00" or "15")
        amount: String,
    },

    /// Compare stored balances with sales and withdrawals
    Check,

    /// Direct messages
    #[command(subcommand)]
    Chat(ChatCommands),

    /// Export your sales and ledger
    Export {
        /// What to export: sales, transactions, json
        #[arg(default_value = "sales")]
        export_type: String,

        /// Output file path (default: stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ProfileCommands {
    /// Show a profile page (default: your own)
    Show { username: Option<String> },

    /// Edit your profile. Pass an empty string to clear a field.
    Update {
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        bio: Option<String>,
        #[arg(long)]
        twitter: Option<String>,
        #[arg(long)]
        instagram: Option<String>,
    },

    /// Follow or unfollow a user
    Follow { username: String },

    /// Beats you own a license for
    Collection,

    /// Change your password
    Password {
        #[arg(long)]
        current: String,
        #[arg(long)]
        new: String,
    },
}

#[derive(Subcommand)]
pub enum BeatCommands {
    /// Upload a beat
    Upload {
        /// Audio file
        file: PathBuf,

        #[arg(short, long)]
        title: String,

        #[arg(short, long)]
        bpm: i64,

        #[arg(short, long)]
        key: Option<String>,

        #[arg(short, long)]
        genre: Option<String>,

        /// MP3 lease price (default 19.99)
        #[arg(long)]
        price: Option<String>,

        /// WAV lease price (default 29.99)
        #[arg(long)]
        price_wav: Option<String>,

        /// Exclusive price (default 149.99)
        #[arg(long)]
        price_exclusive: Option<String>,

        /// Cover image
        #[arg(long)]
        cover: Option<PathBuf>,
    },

    /// Show a beat page
    Show { beat: String },

    /// Hide a beat from listings
    Hide { beat: String },

    /// Make a hidden beat visible again
    Unhide { beat: String },

    /// Delete a beat permanently
    Delete { beat: String },

    /// Play beats in order and count the plays
    Play {
        #[arg(required = true)]
        beats: Vec<String>,
    },

    /// Comment on a beat
    Comment { beat: String, text: String },
}

#[derive(Subcommand)]
pub enum CartCommands {
    /// Add a beat to the cart
    Add {
        beat: String,

        /// License tier: mp3, wav, exclusive
        #[arg(short, long, default_value = "mp3")]
        license: String,
    },

    /// Show the cart
    List,

    /// Remove an item from the cart
    Remove { item: String },

    /// Buy everything in the cart
    Checkout,
}

#[derive(Subcommand)]
pub enum ChatCommands {
    /// Open (or create) the conversation with a user
    Open { username: String },

    /// Open the conversation with a beat's producer
    Contact { beat: String },

    /// Send a message
    Send { conversation: String, text: String },

    /// Show the messages of a conversation
    History { conversation: String },

    /// List your conversations
    Inbox,

    /// Print new messages as they arrive
    Watch { conversation: String },
}

impl Cli {
    pub fn app_config(&self) -> Result<AppConfig> {
        AppConfig::load(
            Overrides {
                database: self.database.clone(),
                blob_root: self.blob_root.clone(),
                public_url: self.public_url.clone(),
            },
            self.config.as_deref(),
        )
    }

    /// Settle the acting user from `--user`.
    async fn signed_in(&self, service: &MarketService) -> Result<Profile> {
        let session = SessionContext::new();
        let username = self.user.clone();
        session
            .restore(async {
                match username {
                    Some(name) => service.get_profile_by_username(&name).await.map(Some),
                    None => Ok(None),
                }
            })
            .await;

        session
            .require_user()
            .context("Pass --user <username> or set BEATMARKET_USER")
    }

    pub async fn run(self) -> Result<()> {
        let config = self.app_config()?;
        let blobs = BlobStore::new(&config.blob_root, &config.public_url);

        if matches!(self.command, Commands::Init) {
            MarketService::init(&config.database, blobs).await?;
            println!("Database initialized: {}", config.database);
            return Ok(());
        }

        let service = MarketService::connect(&config.database, blobs).await?;

        match &self.command {
            Commands::Init => {}

            Commands::Signup {
                username,
                email,
                password,
            } => {
                let profile = service.sign_up(username, email, password).await?;
                println!("Created account: {} ({})", profile.username, profile.id);
            }

            Commands::Login { login, password } => {
                let session = SessionContext::new();
                let profile = session.sign_in(&service, login, password).await?;
                println!("Signed in as {}", profile.username);
                println!("Use --user {} (or BEATMARKET_USER) to act as this account.", profile.username);
            }

            Commands::Profile(cmd) => {
                run_profile_command(&service, self.user_or_none(&service).await?, cmd).await?;
            }

            Commands::Beat(cmd) => {
                run_beat_command(&service, &self, cmd).await?;
            }

            Commands::Home => run_home_command(&service).await?,

            Commands::Explore {
                search,
                genre,
                min_bpm,
                max_bpm,
                max_price,
                limit,
            } => {
                let max_price_cents = max_price
                    .as_deref()
                    .map(parse_cents)
                    .transpose()
                    .context("Invalid price format. Use '25.00' or '25'")?;
                let filter = BeatFilter {
                    search: search.clone(),
                    genre: genre.clone(),
                    min_bpm: *min_bpm,
                    max_bpm: *max_bpm,
                    max_price_cents,
                    limit: *limit,
                };
                run_explore_command(&service, filter).await?;
            }

            Commands::Like { beat } => {
                let user = self.signed_in(&service).await?;
                let view = service.toggle_like(user.id, parse_id(beat)?).await?;
                println!(
                    "{} ({} like{})",
                    if view.liked { "Liked" } else { "Unliked" },
                    view.count,
                    if view.count == 1 { "" } else { "s" }
                );
            }

            Commands::Liked => {
                let user = self.signed_in(&service).await?;
                let beats = service.liked_beats(user.id).await?;
                print_beats(&beats);
            }

            Commands::Cart(cmd) => {
                let user = self.signed_in(&service).await?;
                run_cart_command(&service, &user, cmd).await?;
            }

            Commands::Dashboard => {
                let user = self.signed_in(&service).await?;
                run_dashboard_command(&service, &user).await?;
            }

            Commands::Withdraw { amount } => {
                let user = self.signed_in(&service).await?;
                let amount_cents =
                    parse_cents(amount).context("Invalid amount format. Use '15.00' or '15'")?;
                let receipt = service.withdraw(user.id, amount_cents).await?;
                println!(
                    "Withdrew {} ({})",
                    format_price(receipt.transaction.amount_cents),
                    receipt.transaction.id
                );
                println!("Available balance: {}", format_price(receipt.balance));
            }

            Commands::Check => run_check_command(&service).await?,

            Commands::Chat(cmd) => {
                let user = self.signed_in(&service).await?;
                run_chat_command(&service, &user, cmd).await?;
            }

            Commands::Export {
                export_type,
                output,
            } => {
                let user = self.signed_in(&service).await?;
                run_export_command(&service, &user, export_type, output.as_deref()).await?;
            }
        }

        Ok(())
    }

    async fn user_or_none(&self, service: &MarketService) -> Result<Option<Profile>> {
        if self.user.is_none() {
            return Ok(None);
        }
        self.signed_in(service).await.map(Some)
    }
}

async fn run_profile_command(
    service: &MarketService,
    user: Option<Profile>,
    cmd: &ProfileCommands,
) -> Result<()> {
    let require = || user.clone().ok_or(AppError::NotSignedIn);

    match cmd {
        ProfileCommands::Show { username } => {
            let name = match username {
                Some(name) => name.clone(),
                None => require()?.username,
            };
            let page = service
                .profile_page(&name, user.as_ref().map(|u| u.id))
                .await?;
            let profile = &page.profile;

            println!("{}{}", profile.username, if profile.is_producer { " (producer)" } else { "" });
            if let Some(bio) = &profile.bio {
                println!("  {}", bio);
            }
            if let Some(twitter) = &profile.twitter {
                println!("  Twitter:    {}", twitter);
            }
            if let Some(instagram) = &profile.instagram {
                println!("  Instagram:  {}", instagram);
            }
            println!(
                "  Followers:  {}   Following: {}{}",
                page.followers,
                page.following,
                if page.viewer_follows { "   (you follow)" } else { "" }
            );
            println!(
                "  Joined:     {}",
                profile.created_at.format("%Y-%m-%d")
            );
            println!();

            if page.beats.is_empty() {
                println!("No beats.");
            } else {
                println!("{:<36} {:<24} {:>5} {:>10}  STATUS", "ID", "TITLE", "BPM", "PRICE");
                println!("{}", "-".repeat(90));
                for card in &page.beats {
                    let status = match (card.sold_out, card.beat.is_visible) {
                        (true, _) => "sold out",
                        (false, false) => "hidden",
                        (false, true) => "",
                    };
                    println!(
                        "{:<36} {:<24} {:>5} {:>10}  {}",
                        card.beat.id,
                        truncate(&card.beat.title, 24),
                        card.beat.bpm,
                        format_price(card.beat.price_cents),
                        status
                    );
                }
            }
        }

        ProfileCommands::Update {
            username,
            bio,
            twitter,
            instagram,
        } => {
            let me = require()?;
            let update = ProfileUpdate {
                username: username.clone(),
                bio: bio.clone(),
                twitter: twitter.clone(),
                instagram: instagram.clone(),
            };
            let profile = service.update_profile(me.id, update).await?;
            println!("Updated profile: {}", profile.username);
        }

        ProfileCommands::Follow { username } => {
            let me = require()?;
            let following = service.toggle_follow(me.id, username).await?;
            if following {
                println!("Following {}", username);
            } else {
                println!("Unfollowed {}", username);
            }
        }

        ProfileCommands::Collection => {
            let me = require()?;
            let beats = service.collection(me.id).await?;
            print_beats(&beats);
        }

        ProfileCommands::Password { current, new } => {
            let me = require()?;
            service.change_password(me.id, current, new).await?;
            println!("Password changed.");
        }
    }
    Ok(())
}

async fn run_beat_command(service: &MarketService, cli: &Cli, cmd: &BeatCommands) -> Result<()> {
    match cmd {
        BeatCommands::Upload {
            file,
            title,
            bpm,
            key,
            genre,
            price,
            price_wav,
            price_exclusive,
            cover,
        } => {
            let user = cli.signed_in(service).await?;
            let parse_price = |value: &Option<String>| {
                value
                    .as_deref()
                    .map(parse_cents)
                    .transpose()
                    .context("Invalid price format. Use '19.99' or '20'")
            };
            let draft = NewBeat {
                title: title.clone(),
                bpm: *bpm,
                key: key.clone(),
                genre: genre.clone(),
                price_cents: parse_price(price)?,
                price_wav_cents: parse_price(price_wav)?,
                price_exclusive_cents: parse_price(price_exclusive)?,
            };
            let audio = read_upload(file).await?;
            let cover = match cover {
                Some(path) => Some(read_upload(path).await?),
                None => None,
            };

            let beat = service.upload_beat(user.id, draft, audio, cover).await?;
            println!("Uploaded beat: {} ({})", beat.title, beat.id);
            println!("  Audio: {}", beat.audio_url);
        }

        BeatCommands::Show { beat } => {
            let viewer = cli.user_or_none(service).await?;
            let details = service
                .beat_details(parse_id(beat)?, viewer.as_ref().map(|u| u.id))
                .await?;
            let b = &details.beat;

            println!("{}", b.title);
            println!("  ID:        {}", b.id);
            println!("  Producer:  {}", details.producer.username);
            println!(
                "  BPM:       {}{}{}",
                b.bpm,
                b.key.as_deref().map(|k| format!("   Key: {}", k)).unwrap_or_default(),
                b.genre.as_deref().map(|g| format!("   Genre: {}", g)).unwrap_or_default()
            );
            println!(
                "  Plays:     {}   Views: {}   Likes: {}{}",
                b.plays_count,
                details.views,
                details.likes.count,
                if details.likes.liked { " (you like this)" } else { "" }
            );
            if !b.is_visible {
                println!("  Hidden from listings");
            }
            println!();

            match &details.path {
                PurchasePath::Manage => println!("This is your beat."),
                PurchasePath::ContactProducer { .. } => {
                    println!("SOLD OUT: this beat was sold exclusively.");
                    println!("Message the producer: beatmarket chat contact {}", b.id);
                }
                PurchasePath::Owned => println!("Already owned. See `beatmarket profile collection`."),
                PurchasePath::Purchase { options } => {
                    println!("Licenses:");
                    for (tier, price) in options {
                        println!("  {:<14} {:>10}", tier.as_str(), format_price(*price));
                    }
                }
            }

            if !details.comments.is_empty() {
                println!();
                println!("Comments:");
                for comment in &details.comments {
                    println!(
                        "  [{}] {}",
                        comment.created_at.format("%Y-%m-%d %H:%M"),
                        comment.text
                    );
                }
            }
        }

        BeatCommands::Hide { beat } | BeatCommands::Unhide { beat } => {
            let user = cli.signed_in(service).await?;
            let visible = matches!(cmd, BeatCommands::Unhide { .. });
            let beat = service.set_visibility(user.id, parse_id(beat)?, visible).await?;
            println!(
                "{}: {}",
                beat.title,
                if beat.is_visible { "visible" } else { "hidden" }
            );
        }

        BeatCommands::Delete { beat } => {
            let user = cli.signed_in(service).await?;
            let id = parse_id(beat)?;
            service.delete_beat(user.id, id).await?;
            println!("Deleted beat {}", id);
        }

        BeatCommands::Play { beats } => {
            let queue = beats
                .iter()
                .map(|b| parse_id(b))
                .collect::<Result<Vec<_>>>()?;
            let player = PlayerContext::new();

            if let Some(first) = queue.first().copied() {
                if let Some(count) = player.play(service, first, queue.clone()).await? {
                    println!("Playing {} ({} plays)", first, count);
                }
            }
            while let Some(count) = player.next(service).await? {
                if let Some(current) = player.current().current() {
                    println!("Playing {} ({} plays)", current, count);
                }
            }
            player.pause();
        }

        BeatCommands::Comment { beat, text } => {
            let user = cli.signed_in(service).await?;
            let comment = service.add_comment(user.id, parse_id(beat)?, text).await?;
            println!("Comment added ({})", comment.id);
        }
    }
    Ok(())
}

async fn run_home_command(service: &MarketService) -> Result<()> {
    let home = service.home().await?;

    println!("Latest");
    print_beats(&home.latest);
    println!();
    println!("Trending");
    print_beats(&home.trending);

    if !home.producers.is_empty() {
        println!();
        println!("Producers");
        for producer in &home.producers {
            println!("  {}", producer.username);
        }
    }
    Ok(())
}

async fn run_explore_command(service: &MarketService, filter: BeatFilter) -> Result<()> {
    let result = service.explore(filter).await?;

    if !result.profiles.is_empty() {
        println!("Profiles:");
        for profile in &result.profiles {
            println!("  {}", profile.username);
        }
        println!();
    }
    print_beats(&result.beats);
    Ok(())
}

async fn run_cart_command(service: &MarketService, user: &Profile, cmd: &CartCommands) -> Result<()> {
    match cmd {
        CartCommands::Add { beat, license } => {
            let tier = LicenseTier::from_str(license).with_context(|| {
                format!(
                    "Invalid license '{}'. Valid licenses: mp3, wav, exclusive",
                    license
                )
            })?;
            let item = service.add_to_cart(user.id, parse_id(beat)?, tier).await?;
            println!(
                "Added to cart: {} {} ({})",
                item.license,
                format_price(item.price_cents),
                item.id
            );
        }

        CartCommands::List => {
            let cart = service.cart(user.id).await?;
            if cart.items.is_empty() {
                println!("Cart is empty.");
            } else {
                println!("{:<36} {:<36} {:<12} {:>10}", "ITEM", "BEAT", "LICENSE", "PRICE");
                println!("{}", "-".repeat(97));
                for item in &cart.items {
                    println!(
                        "{:<36} {:<36} {:<12} {:>10}",
                        item.id,
                        item.beat_id,
                        item.license.as_str(),
                        format_price(item.price_cents)
                    );
                }
                println!("{:>97}", format!("Total: {}", format_price(cart.total)));
            }
        }

        CartCommands::Remove { item } => {
            service.remove_from_cart(user.id, parse_id(item)?).await?;
            println!("Removed {}", item);
        }

        CartCommands::Checkout => {
            let receipt = service.checkout(user.id).await?;
            println!(
                "Purchased {} license(s) for {} ({})",
                receipt.purchases.len(),
                format_price(receipt.total),
                receipt.transaction_id
            );
        }
    }
    Ok(())
}

async fn run_dashboard_command(service: &MarketService, user: &Profile) -> Result<()> {
    let dashboard = service.dashboard(user.id).await?;

    println!("Earnings for {}", user.username);
    println!("  Total earnings:    {}", format_price(dashboard.total_earnings));
    println!("  Sales:             {}", dashboard.sale_count);
    println!("  Available balance: {}", format_price(dashboard.balance));
    println!("  Beats:             {}", dashboard.beats.len());
    println!();

    if dashboard.sales.is_empty() {
        println!("No sales yet.");
    } else {
        println!("{:<12} {:<24} {:<12} {:>10}", "DATE", "BEAT", "LICENSE", "AMOUNT");
        println!("{}", "-".repeat(61));
        for line in &dashboard.sales {
            println!(
                "{:<12} {:<24} {:<12} {:>10}",
                line.purchase.created_at.format("%Y-%m-%d"),
                truncate(line.beat_title.as_deref().unwrap_or("(deleted)"), 24),
                line.purchase.license.as_str(),
                format_price(line.purchase.price_paid_cents)
            );
        }
    }
    println!();

    if dashboard.transactions.is_empty() {
        println!("No transactions yet.");
    } else {
        println!("{:<12} {:<12} {:>10} STATUS", "DATE", "TYPE", "AMOUNT");
        println!("{}", "-".repeat(45));
        for tx in &dashboard.transactions {
            println!(
                "{:<12} {:<12} {:>10} {}",
                tx.created_at.format("%Y-%m-%d"),
                tx.kind.as_str(),
                format_price(-tx.amount_cents),
                tx.status
            );
        }
    }
    Ok(())
}

async fn run_check_command(service: &MarketService) -> Result<()> {
    println!("Checking balances...\n");

    let mismatches = service.check_balances().await?;
    if mismatches.is_empty() {
        println!("Stored balances match sales and withdrawals.");
        return Ok(());
    }

    println!("{:<20} {:>12} {:>12}", "USER", "STORED", "DERIVED");
    println!("{}", "-".repeat(46));
    for m in &mismatches {
        println!(
            "{:<20} {:>12} {:>12}",
            truncate(&m.username, 20),
            format_price(m.stored),
            format_price(m.derived)
        );
    }
    anyhow::bail!("{} balance(s) out of sync", mismatches.len());
}

async fn run_chat_command(service: &MarketService, user: &Profile, cmd: &ChatCommands) -> Result<()> {
    match cmd {
        ChatCommands::Open { username } => {
            let partner = service.get_profile_by_username(username).await?;
            let conversation = service.open_conversation(user.id, partner.id).await?;
            println!("Conversation with {}: {}", partner.username, conversation.id);
        }

        ChatCommands::Contact { beat } => {
            let conversation = service.contact_producer(user.id, parse_id(beat)?).await?;
            println!("Conversation: {}", conversation.id);
        }

        ChatCommands::Send { conversation, text } => {
            let message = service
                .send_message(user.id, parse_id(conversation)?, text)
                .await?;
            println!("Sent ({})", message.id);
        }

        ChatCommands::History { conversation } => {
            let messages = service.list_messages(user.id, parse_id(conversation)?).await?;
            if messages.is_empty() {
                println!("No messages yet.");
            }
            for message in &messages {
                print_message(user, message);
            }
        }

        ChatCommands::Inbox => {
            let entries = service.inbox(user.id).await?;
            if entries.is_empty() {
                println!("No conversations.");
            } else {
                println!("{:<36} {:<20} {:<17} LAST MESSAGE", "CONVERSATION", "WITH", "UPDATED");
                println!("{}", "-".repeat(100));
                for entry in &entries {
                    let preview = entry.preview.as_deref().unwrap_or("");
                    println!(
                        "{:<36} {:<20} {:<17} {}{}",
                        entry.conversation.id,
                        truncate(&entry.partner.username, 20),
                        entry.conversation.updated_at.format("%Y-%m-%d %H:%M"),
                        if entry.is_my_message { "You: " } else { "" },
                        truncate(preview, 40)
                    );
                }
            }
        }

        ChatCommands::Watch { conversation } => {
            let conversation_id = parse_id(conversation)?;
            let history = service.list_messages(user.id, conversation_id).await?;
            let mut log = MessageLog::from_history(history);
            for message in log.messages() {
                print_message(user, message);
            }

            // the change feed is per process, so poll for messages sent elsewhere
            let mut interval = tokio::time::interval(WATCH_INTERVAL);
            loop {
                interval.tick().await;
                for message in service.list_messages(user.id, conversation_id).await? {
                    let shown = message.clone();
                    if log.append(message) {
                        print_message(user, &shown);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn run_export_command(
    service: &MarketService,
    user: &Profile,
    export_type: &str,
    output: Option<&str>,
) -> Result<()> {
    use crate::io::Exporter;
    use std::fs::File;
    use std::io::{stdout, Write};

    let exporter = Exporter::new(service);

    let writer: Box<dyn Write> = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path))?;
            Box::new(file)
        }
        None => Box::new(stdout()),
    };

    match export_type {
        "sales" => {
            let count = exporter.export_sales_csv(user, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} sales", count);
            }
        }
        "transactions" => {
            let count = exporter.export_transactions_csv(user, writer).await?;
            if output.is_some() {
                eprintln!("Exported {} transactions", count);
            }
        }
        "json" => {
            let snapshot = exporter.export_json(user, writer).await?;
            if output.is_some() {
                eprintln!(
                    "Exported {} sales and {} transactions",
                    snapshot.sales.len(),
                    snapshot.transactions.len()
                );
            }
        }
        _ => {
            anyhow::bail!(
                "Invalid export type '{}'. Valid types: sales, transactions, json",
                export_type
            );
        }
    }

    Ok(())
}

async fn read_upload(path: &Path) -> Result<Upload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    Ok(Upload { file_name, bytes })
}

fn print_beats(beats: &[crate::domain::Beat]) {
    if beats.is_empty() {
        println!("No beats found.");
        return;
    }
    println!("{:<36} {:<24} {:>5} {:<12} {:>10} {:>6}", "ID", "TITLE", "BPM", "GENRE", "PRICE", "PLAYS");
    println!("{}", "-".repeat(98));
    for beat in beats {
        println!(
            "{:<36} {:<24} {:>5} {:<12} {:>10} {:>6}",
            beat.id,
            truncate(&beat.title, 24),
            beat.bpm,
            truncate(beat.genre.as_deref().unwrap_or(""), 12),
            format_price(beat.price_cents),
            beat.plays_count
        );
    }
}

fn print_message(user: &Profile, message: &crate::domain::Message) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        if message.sender_id == user.id { "you" } else { "them" },
        message.text
    );
}

fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim()).with_context(|| format!("Invalid ID '{}' (expected UUID)", value))
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
