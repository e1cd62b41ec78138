use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tapfarm_client::{Client, Config, FileStore};
use tapfarm_types::api::{LeaderboardPeriod, LeaderboardScope};
use tracing::{debug, Level};

mod commands;

/// CLI flags. Flags override the config file, which overrides defaults.
#[derive(Parser, Debug)]
#[command(name = "tapfarm", version, about = "Play the tapfarm mini-app from a terminal")]
struct Args {
    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// API base URL (e.g. https://example.com/api/)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Auth base URL (e.g. https://example.com/auth/)
    #[arg(long, global = true)]
    auth_url: Option<String>,

    /// Where the session token is kept
    #[arg(long, global = true)]
    token_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit structured JSON logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange Telegram init data for a session
    Login {
        /// Signed init data as issued by the Telegram WebApp host
        #[arg(long, env = "TAPFARM_INIT_DATA", hide_env_values = true)]
        init_data: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show the profile of the logged in user
    Whoami,
    /// Tap the rotor, boosting whenever possible
    Tap {
        /// Number of taps to send
        #[arg(long, default_value_t = 1)]
        count: u64,

        /// Pause between taps
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,

        /// Never boost automatically
        #[arg(long)]
        no_boost: bool,
    },
    /// Request a boost without local preconditions
    Boost,
    /// Buy the next upgrade
    Upgrade {
        /// Upgrade the GPU instead
        #[arg(long)]
        gpu: bool,
    },
    /// Show the server cooldown state
    Cooldown,
    /// Claim the daily XP reward
    Daily,
    /// List quests
    Quests,
    /// Complete a quest and claim its reward
    CompleteQuest { id: String },
    /// List achievements
    Achievements,
    /// Claim an unlocked achievement
    ClaimAchievement { id: String },
    /// Show a leaderboard
    Leaderboard {
        #[arg(long, default_value = "daily")]
        period: LeaderboardPeriod,

        #[arg(long, default_value = "global")]
        scope: LeaderboardScope,
    },
    /// Referral program
    Referral {
        #[command(subcommand)]
        action: ReferralAction,
    },
    /// User preferences
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand, Debug)]
enum ReferralAction {
    /// Show referral code, earnings and top referrals
    Stats,
    /// Generate a referral code and print the invite link
    Generate,
    /// Apply a friend's referral code
    Apply { code: String },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Get,
    Set { key: String, value: String },
}

/// Resolves the effective configuration.
fn build_config(args: &Args) -> Result<Config> {
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("could not load config file {}", path.display()))?,
        None => Config::default(),
    };
    let mut config = config.with_env();
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(url) = &args.auth_url {
        config.auth_base_url = url.clone();
    }
    if let Some(path) = &args.token_path {
        config.token_path = Some(path.clone());
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

fn token_path(config: &Config) -> Result<PathBuf> {
    if let Some(path) = &config.token_path {
        return Ok(path.clone());
    }
    let dirs = ProjectDirs::from("dev", "tapfarm", "tapfarm")
        .context("could not determine a data directory; pass --token-path")?;
    Ok(dirs.data_dir().join("session"))
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let level = Level::from_str(level).with_context(|| format!("invalid log level: {level}"))?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = build_config(&args)?;
    init_tracing(&config.log_level, args.json)?;

    let path = token_path(&config)?;
    debug!(path = %path.display(), "using session file");
    let client = Client::new(&config, Arc::new(FileStore::new(path)))
        .context("could not create API client")?;

    commands::run(args.command, &config, client).await
}
