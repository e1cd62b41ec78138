use crate::{Command, ReferralAction, SettingsAction};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tapfarm_client::{
    telegram::Haptic, Authenticator, Backend, Client, Config, Controller, Error, Outcome, Phase,
    SkipReason, Snapshot, StaticHost, Verification, WebAppHost,
};
use tapfarm_types::{
    api::{Id, User},
    game::{referral_link, REFERRAL_TIERS},
};
use tracing::{info, warn};

pub async fn run(command: Command, config: &Config, client: Client) -> Result<()> {
    if needs_session(&command) && !client.is_authenticated() {
        bail!("not logged in; run `tapfarm login` first");
    }
    let result = dispatch(command, config, &client).await;
    if let Err(err) = &result {
        if err
            .downcast_ref::<Error>()
            .is_some_and(Error::is_unauthorized)
        {
            warn!("session rejected by the server");
            bail!("session expired; run `tapfarm login` again");
        }
    }
    result
}

fn needs_session(command: &Command) -> bool {
    !matches!(command, Command::Login { .. } | Command::Logout)
}

async fn dispatch(command: Command, config: &Config, client: &Client) -> Result<()> {
    let host = StaticHost::default();
    match command {
        Command::Login { init_data } => login(config, client, init_data).await,
        Command::Logout => {
            client.logout()?;
            println!("logged out");
            Ok(())
        }
        Command::Whoami => whoami(client).await,
        Command::Tap {
            count,
            interval_ms,
            no_boost,
        } => {
            let interval = Duration::from_millis(interval_ms);
            tap(client, &host, count, interval, !no_boost).await
        }
        Command::Boost => {
            let response = client.boost().await.context("boost failed")?;
            print_user(&response.user);
            Ok(())
        }
        Command::Upgrade { gpu } => {
            let response = if gpu {
                client.upgrade_gpu().await
            } else {
                client.upgrade().await
            }
            .context("upgrade failed")?;
            print_user(&response.user);
            Ok(())
        }
        Command::Cooldown => {
            let status = client.cooldown_status().await?;
            match status.remaining(Utc::now()) {
                Some(left) => println!("cooling, {}s left", left.as_secs()),
                None => println!("ready"),
            }
            Ok(())
        }
        Command::Daily => {
            let claim = client.claim_daily_xp().await.context("daily claim failed")?;
            host.haptic(Haptic::Claim);
            println!("+{} XP", claim.xp_gained);
            if let Some(next) = claim.next_claim_at {
                println!("next claim at {}", next.to_rfc3339());
            }
            Ok(())
        }
        Command::Quests => {
            for quest in client.quests().await? {
                let state = match (quest.completed, quest.claimed) {
                    (_, true) => "claimed",
                    (true, false) => "completed",
                    _ => "open",
                };
                println!(
                    "{:<12} {:<10} {:>6} XP  {}",
                    quest.id.0, state, quest.xp_reward, quest.title
                );
            }
            Ok(())
        }
        Command::CompleteQuest { id } => {
            let claim = client
                .complete_quest(&Id::from(id.as_str()))
                .await
                .with_context(|| format!("could not complete quest {id}"))?;
            host.haptic(Haptic::Quest);
            println!("+{} XP", claim.xp_gained);
            Ok(())
        }
        Command::Achievements => {
            for achievement in client.achievements().await? {
                let progress = match achievement.target {
                    Some(target) => format!("{}/{}", achievement.progress, target),
                    None => achievement.progress.to_string(),
                };
                let state = if achievement.claimed {
                    "claimed"
                } else if achievement.unlocked {
                    "unlocked"
                } else {
                    "locked"
                };
                println!(
                    "{:<12} {:<9} {:>9} {:>6} XP  {}",
                    achievement.id.0, state, progress, achievement.xp_reward, achievement.title
                );
            }
            Ok(())
        }
        Command::ClaimAchievement { id } => {
            let claim = client
                .claim_achievement(&Id::from(id.as_str()))
                .await
                .with_context(|| format!("could not claim achievement {id}"))?;
            host.haptic(Haptic::Bonus);
            println!("+{} XP", claim.xp_gained);
            Ok(())
        }
        Command::Leaderboard { period, scope } => {
            let entries = client.leaderboard(period, scope).await?;
            println!("{period} / {scope}");
            for entry in &entries {
                println!("{:>4}. {:<24} {:>10} XP", entry.rank, entry.username, entry.xp);
            }
            match client.leaderboard_position(period).await? {
                Some(position) => println!("your position: {position}"),
                None => println!("you are not ranked yet"),
            }
            Ok(())
        }
        Command::Referral { action } => referral(config, client, &host, action).await,
        Command::Settings { action } => settings(client, action).await,
    }
}

async fn login(config: &Config, client: &Client, init_data: Option<String>) -> Result<()> {
    let host = StaticHost::new(init_data);
    let verification = Verification::from_config(config)?;
    let login = Authenticator::new(client, verification)
        .login(&host)
        .await
        .context("login failed")?;
    println!(
        "logged in as {}",
        login.user.display_name().unwrap_or("unknown user")
    );
    Ok(())
}

async fn whoami(client: &Client) -> Result<()> {
    let dashboard = client.profile_dashboard().await?;
    match dashboard.user {
        Some(user) => print_user(&user),
        None => println!("{}", serde_json::to_string_pretty(&dashboard.extra)?),
    }
    Ok(())
}

fn print_user(user: &User) {
    if let Some(name) = user.display_name() {
        println!("user:          {name}");
    }
    let fields = [
        ("level", user.level.map(u64::from)),
        ("xp", user.xp),
        ("compute", user.compute),
        ("compute power", user.compute_power),
        ("total taps", user.total_taps),
        ("gpu level", user.gpu_level.map(u64::from)),
    ];
    for (label, value) in fields {
        if let Some(value) = value {
            println!("{:<14} {value}", format!("{label}:"));
        }
    }
}

fn print_progress(snapshot: &Snapshot) {
    let compute = snapshot
        .user
        .as_ref()
        .and_then(|user| user.compute)
        .unwrap_or_default();
    println!(
        "taps {:>3}  rpm {:>6}  fan {:>3}%  compute {}{}",
        snapshot.tap.tap_count,
        snapshot.tap.rpm,
        snapshot.tap.fan_speed,
        compute,
        if snapshot.boosting { "  BOOST" } else { "" }
    );
}

async fn tap(
    client: &Client,
    host: &dyn WebAppHost,
    count: u64,
    interval: Duration,
    auto_boost: bool,
) -> Result<()> {
    let controller = Controller::new(Arc::new(client.clone()), None);
    controller.sync().await.context("could not fetch cooldown status")?;
    let sent = drive_taps(&controller, host, count, interval, auto_boost).await;
    controller.shutdown().await;
    let sent = sent?;

    let snapshot = controller.snapshot();
    if let Some(user) = &snapshot.user {
        println!(
            "sent {sent} taps, total {} taps, {} compute",
            user.total_taps.unwrap_or_default(),
            user.compute.unwrap_or_default()
        );
    }
    Ok(())
}

/// Taps `count` times, waiting out cooldowns instead of skipping them.
/// Returns the number of taps the server accepted.
async fn drive_taps<B: Backend>(
    controller: &Controller<B>,
    host: &dyn WebAppHost,
    count: u64,
    interval: Duration,
    auto_boost: bool,
) -> Result<u64> {
    let mut updates = controller.subscribe();
    let mut sent = 0;
    while sent < count {
        match controller.tap().await? {
            Outcome::Applied(snapshot) => {
                sent += 1;
                host.haptic(Haptic::Tap);
                print_progress(&snapshot);
                if snapshot.phase == Phase::Cooling {
                    host.haptic(Haptic::Cooldown);
                    println!("overheated, cooling down");
                } else if auto_boost {
                    if let Outcome::Applied(snapshot) = controller.boost().await? {
                        host.haptic(Haptic::Bonus);
                        println!("boost x{}", snapshot.boost_count);
                    }
                }
            }
            Outcome::Skipped(SkipReason::Cooling) => {
                let ends = controller.snapshot().tap.cooldown_ends_at;
                info!(?ends, "waiting for cooldown");
                updates
                    .wait_for(|snapshot| snapshot.phase != Phase::Cooling)
                    .await
                    .context("controller stopped")?;
                println!("cooled down");
                continue;
            }
            Outcome::Skipped(reason) => bail!("tap skipped: {reason:?}"),
        }
        tokio::time::sleep(interval).await;
    }
    Ok(sent)
}

async fn referral(
    config: &Config,
    client: &Client,
    host: &dyn WebAppHost,
    action: ReferralAction,
) -> Result<()> {
    match action {
        ReferralAction::Stats => {
            let stats = client.referral_stats().await?;
            println!("code:   {}", stats.referral_code);
            println!("link:   {}", referral_link(&config.bot_username, &stats.referral_code));
            println!("earned: {} XP", stats.referral_xp);
            for (tier, basis_points) in REFERRAL_TIERS {
                println!("  {tier:<10} {:>5.1}%", f64::from(basis_points) / 100.0);
            }
            for referral in &stats.top_referrals {
                println!("  {:<24} {:>10} XP", referral.name, referral.xp);
            }
        }
        ReferralAction::Generate => {
            let code = client.generate_referral_code().await?;
            println!("{}", referral_link(&config.bot_username, &code.referral_code));
        }
        ReferralAction::Apply { code } => {
            let response = client
                .apply_referral_code(&code)
                .await
                .with_context(|| format!("could not apply referral code {code}"))?;
            host.haptic(Haptic::Bonus);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}

async fn settings(client: &Client, action: SettingsAction) -> Result<()> {
    let mut current = client.settings().await?;
    if let SettingsAction::Set { key, value } = action {
        current
            .set(&key, &value)
            .with_context(|| format!("invalid value for {key}"))?;
        current = client.update_settings(&current).await?;
    }
    println!("{}", serde_json::to_string_pretty(&current)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    };
    use tapfarm_types::api::{CooldownStatus, TapResponse, TapUpdate, UserResponse};

    #[derive(Default)]
    struct CountingBackend {
        taps: AtomicU64,
        boosts: AtomicU64,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn tap(&self) -> tapfarm_client::Result<TapResponse> {
            let taps = self.taps.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TapResponse {
                user: TapUpdate {
                    compute: taps * 10,
                    total_taps: taps,
                    compute_power: 10,
                    cooldown_end_time: None,
                },
            })
        }

        async fn boost(&self) -> tapfarm_client::Result<UserResponse> {
            self.boosts.fetch_add(1, Ordering::SeqCst);
            Ok(UserResponse {
                user: User::default(),
            })
        }

        async fn upgrade(&self) -> tapfarm_client::Result<UserResponse> {
            Ok(UserResponse {
                user: User::default(),
            })
        }

        async fn cooldown_status(&self) -> tapfarm_client::Result<CooldownStatus> {
            Ok(CooldownStatus {
                cooling: false,
                cooldown_end_time: None,
            })
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        haptics: Mutex<Vec<Haptic>>,
    }

    impl RecordingHost {
        fn count(&self, haptic: Haptic) -> usize {
            self.haptics
                .lock()
                .unwrap()
                .iter()
                .filter(|played| **played == haptic)
                .count()
        }
    }

    impl WebAppHost for RecordingHost {
        fn is_available(&self) -> bool {
            true
        }

        fn init_data(&self) -> Option<String> {
            None
        }

        fn haptic(&self, haptic: Haptic) {
            self.haptics.lock().unwrap().push(haptic);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_loop_waits_out_cooldown() {
        let backend = Arc::new(CountingBackend::default());
        let controller = Controller::new(backend.clone(), None);
        let host = RecordingHost::default();

        let started = tokio::time::Instant::now();
        let sent = drive_taps(&controller, &host, 502, Duration::ZERO, false)
            .await
            .unwrap();

        assert_eq!(sent, 502);
        assert_eq!(backend.taps.load(Ordering::SeqCst), 502);
        assert_eq!(backend.boosts.load(Ordering::SeqCst), 0);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(host.count(Haptic::Tap), 502);
        assert_eq!(host.count(Haptic::Cooldown), 1);

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.phase, Phase::Active);
        assert_eq!(snapshot.tap.tap_count, 2);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_loop_boosts_once_threshold_reached() {
        let backend = Arc::new(CountingBackend::default());
        let controller = Controller::new(backend.clone(), None);
        let host = RecordingHost::default();

        let sent = drive_taps(&controller, &host, 300, Duration::ZERO, true)
            .await
            .unwrap();

        assert_eq!(sent, 300);
        assert!(backend.boosts.load(Ordering::SeqCst) >= 1);
        assert!(host.count(Haptic::Bonus) >= 1);
        controller.shutdown().await;
    }
}
