//! Telegram WebApp identity adapter.
//!
//! The host hands the app an opaque, signed `initData` query string. The
//! adapter extracts profile fields from it and forwards the blob unmodified to
//! the backend, which owns the trust decision. Local signature verification is
//! available as an opt-in second check (see [Verification]).

use crate::{session::Session, Client, Config, Error, Result};
use chrono::{DateTime, Datelike, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::{collections::BTreeMap, time::Duration};
use tapfarm_types::api::{AuthRequest, TelegramProfile, User};
use tracing::{debug, info, trace, warn};
use url::form_urlencoded;

type HmacSha256 = Hmac<Sha256>;

/// Key used to derive the signing secret from the bot token.
const WEB_APP_DATA_KEY: &[u8] = b"WebAppData";

pub const ENV_INIT_DATA: &str = "TAPFARM_INIT_DATA";

/// Vibration patterns (milliseconds, alternating on/off).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Haptic {
    Tap,
    Cooldown,
    Claim,
    Bonus,
    Quest,
}

impl Haptic {
    pub fn pattern(&self) -> &'static [u64] {
        match self {
            Haptic::Tap => &[50],
            Haptic::Cooldown => &[100, 30, 100],
            Haptic::Claim => &[50, 50, 50],
            Haptic::Bonus => &[100, 50, 100, 50, 100],
            Haptic::Quest => &[50, 100, 50, 100],
        }
    }
}

/// The environment hosting the mini-app.
pub trait WebAppHost: Send + Sync {
    fn is_available(&self) -> bool;

    /// Signals the host that the app finished loading.
    fn ready(&self) {}

    /// Raw signed init data, exactly as the host supplied it.
    fn init_data(&self) -> Option<String>;

    fn close(&self) {}

    fn haptic(&self, _haptic: Haptic) {}
}

/// Host backed by init data handed to the process (flag or environment).
#[derive(Clone, Debug, Default)]
pub struct StaticHost {
    init_data: Option<String>,
}

impl StaticHost {
    pub fn new(init_data: Option<String>) -> Self {
        Self { init_data }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var(ENV_INIT_DATA).ok())
    }
}

impl WebAppHost for StaticHost {
    fn is_available(&self) -> bool {
        self.init_data.is_some()
    }

    fn init_data(&self) -> Option<String> {
        self.init_data.clone()
    }

    fn haptic(&self, haptic: Haptic) {
        trace!(?haptic, pattern = ?haptic.pattern(), "haptic feedback");
    }
}

/// The `user` object embedded in init data.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct WebAppUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
    #[serde(default)]
    pub photo_url: Option<String>,
    /// Account creation time in unix seconds, when the host provides it.
    #[serde(default)]
    pub date: Option<i64>,
}

/// Parsed WebApp init data.
#[derive(Clone, Debug)]
pub struct InitData {
    fields: BTreeMap<String, String>,
    hash: String,
    user: Option<WebAppUser>,
    auth_date: Option<DateTime<Utc>>,
}

impl InitData {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::MissingInitData);
        }

        let mut fields = BTreeMap::new();
        let mut hash = None;
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            if key == "hash" {
                hash = Some(value.into_owned());
                continue;
            }
            let key = key.into_owned();
            if fields.contains_key(&key) {
                return Err(Error::InvalidInitData(format!("duplicate field {key}")));
            }
            fields.insert(key, value.into_owned());
        }
        let hash = hash.ok_or_else(|| Error::InvalidInitData("missing hash".into()))?;

        let user = fields
            .get("user")
            .map(|json| serde_json::from_str::<WebAppUser>(json))
            .transpose()
            .map_err(|e| Error::InvalidInitData(format!("user: {e}")))?;
        let auth_date = fields
            .get("auth_date")
            .map(|secs| {
                secs.parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .ok_or_else(|| Error::InvalidInitData(format!("auth_date: {secs}")))
            })
            .transpose()?;

        Ok(Self {
            fields,
            hash,
            user,
            auth_date,
        })
    }

    pub fn user(&self) -> Option<&WebAppUser> {
        self.user.as_ref()
    }

    pub fn auth_date(&self) -> Option<DateTime<Utc>> {
        self.auth_date
    }

    pub fn query_id(&self) -> Option<&str> {
        self.fields.get("query_id").map(String::as_str)
    }

    /// Referral code passed through the bot deep link, if any.
    pub fn start_param(&self) -> Option<&str> {
        self.fields.get("start_param").map(String::as_str)
    }

    /// Every field except `hash`, sorted by key, as `key=value` lines.
    pub fn data_check_string(&self) -> String {
        self.fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Checks the host signature against `bot_token` and, when `max_age` is
    /// set, that `auth_date` is recent enough.
    pub fn verify(&self, bot_token: &str, max_age: Option<Duration>, now: DateTime<Utc>) -> Result<()> {
        let expected = hex::decode(&self.hash).map_err(|_| Error::InvalidSignature)?;
        let mut mac = signer(bot_token)?;
        mac.update(self.data_check_string().as_bytes());
        mac.verify_slice(&expected)
            .map_err(|_| Error::InvalidSignature)?;

        if let Some(max) = max_age {
            let issued = self
                .auth_date
                .ok_or_else(|| Error::InvalidInitData("missing auth_date".into()))?;
            let age = (now - issued).to_std().unwrap_or_default();
            if age > max {
                return Err(Error::StaleInitData { age, max });
            }
        }
        Ok(())
    }

    /// Profile fields forwarded alongside the handshake.
    pub fn profile(&self, now: DateTime<Utc>) -> Result<TelegramProfile> {
        let user = self
            .user
            .as_ref()
            .ok_or_else(|| Error::InvalidInitData("missing user".into()))?;
        let name = user
            .username
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| user.first_name.clone());
        let account_age = user
            .date
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|created| account_age(created, now));
        Ok(TelegramProfile {
            id: user.id,
            name,
            avatar_url: user.photo_url.clone(),
            account_age,
            is_premium: user.is_premium,
        })
    }
}

fn signer(bot_token: &str) -> Result<HmacSha256> {
    let mut secret = HmacSha256::new_from_slice(WEB_APP_DATA_KEY)
        .map_err(|e| Error::InvalidInitData(e.to_string()))?;
    secret.update(bot_token.as_bytes());
    let secret = secret.finalize().into_bytes();
    HmacSha256::new_from_slice(&secret).map_err(|e| Error::InvalidInitData(e.to_string()))
}

/// Hex signature of a data check string under `bot_token`.
pub fn sign(bot_token: &str, data_check_string: &str) -> Result<String> {
    let mut mac = signer(bot_token)?;
    mac.update(data_check_string.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Coarse account age: whole years, else whole months, else days.
pub fn account_age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let plural = |count: i64, unit: &str| {
        if count == 1 {
            format!("1 {unit}")
        } else {
            format!("{count} {unit}s")
        }
    };
    let before_anniversary = (now.month(), now.day()) < (created.month(), created.day());
    let years = (now.year() - created.year()) as i64 - i64::from(before_anniversary);
    if years > 0 {
        return plural(years, "year");
    }
    let months = (now.year() - created.year()) as i64 * 12 + now.month() as i64
        - created.month() as i64
        - i64::from(now.day() < created.day());
    if months > 0 {
        return plural(months, "month");
    }
    plural((now - created).num_days().max(0), "day")
}

/// Whether the handshake checks the signature before contacting the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Verification {
    /// Forward the blob and let the server decide.
    Forward,
    /// Reject locally when the signature or freshness check fails.
    Local {
        bot_token: String,
        max_age: Option<Duration>,
    },
}

impl Verification {
    pub fn from_config(config: &Config) -> Result<Self> {
        if !config.verify_init_data {
            return Ok(Self::Forward);
        }
        let bot_token = config.bot_token.clone().ok_or(Error::MissingBotToken)?;
        Ok(Self::Local {
            bot_token,
            max_age: config.init_data_max_age(),
        })
    }
}

/// Result of a successful handshake.
#[derive(Debug)]
pub struct Login {
    pub session: Session,
    pub user: User,
}

/// Runs the identity handshake and installs the resulting session.
pub struct Authenticator<'a> {
    client: &'a Client,
    verification: Verification,
}

impl<'a> Authenticator<'a> {
    pub fn new(client: &'a Client, verification: Verification) -> Self {
        Self {
            client,
            verification,
        }
    }

    pub async fn login(&self, host: &dyn WebAppHost) -> Result<Login> {
        if !host.is_available() {
            warn!("Telegram WebApp host not available");
            return Err(Error::NotInTelegram);
        }
        host.ready();

        let raw = host
            .init_data()
            .filter(|data| !data.trim().is_empty())
            .ok_or(Error::MissingInitData)?;
        let init_data = InitData::parse(&raw)?;
        let now = Utc::now();
        match &self.verification {
            Verification::Forward => debug!("forwarding init data for server-side verification"),
            Verification::Local { bot_token, max_age } => {
                init_data.verify(bot_token, *max_age, now).map_err(|err| {
                    warn!(error = %err, "init data rejected locally");
                    err
                })?;
                debug!("init data verified locally");
            }
        }

        let profile = init_data.profile(now)?;
        let response = self
            .client
            .authenticate_telegram(&AuthRequest {
                init_data: raw,
                user: profile,
            })
            .await?;
        let session = Session::new(response.user.id.clone(), response.token);
        self.client.store().attach(&session)?;
        info!(user_id = ?session.user_id, "authenticated");
        Ok(Login {
            session,
            user: response.user,
        })
    }
}
