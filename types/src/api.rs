//! JSON records exchanged with the REST backend.
//!
//! The backend speaks camelCase and is loose about which fields it returns,
//! so most fields are optional and unknown fields are preserved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Identifier of a user or record.
///
/// The backend emits both numeric (Telegram) and string (database) ids.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Id(n.to_string()),
            Raw::Text(s) => Id(s),
        })
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id(value.to_string())
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id(value.to_string())
    }
}

/// Cached view of the server-owned user aggregate.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_taps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute_power: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referral_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_premium: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! overwrite {
    ($self:ident, $other:ident, $($field:ident),+) => {
        $(
            if $other.$field.is_some() {
                $self.$field = $other.$field;
            }
        )+
    };
}

impl User {
    /// Shallow merge: every field present in `other` replaces ours.
    pub fn merge(&mut self, other: User) {
        overwrite!(
            self,
            other,
            id,
            username,
            first_name,
            avatar_url,
            xp,
            compute,
            total_taps,
            compute_power,
            level,
            gpu_level,
            referral_code,
            is_premium
        );
        self.extra.extend(other.extra);
    }

    /// Applies the authoritative counters returned by a tap.
    pub fn apply_tap(&mut self, update: &TapUpdate) {
        self.compute = Some(update.compute);
        self.total_taps = Some(update.total_taps);
        self.compute_power = Some(update.compute_power);
    }

    /// Name shown to the player: username, else first name.
    pub fn display_name(&self) -> Option<&str> {
        self.username.as_deref().or(self.first_name.as_deref())
    }
}

/// Counters returned by the tap endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapUpdate {
    pub compute: u64,
    pub total_taps: u64,
    pub compute_power: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_end_time: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapResponse {
    pub user: TapUpdate,
}

/// Full user aggregate returned by boost, upgrade and profile updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    pub user: User,
}

/// Profile fields extracted from the Telegram host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramProfile {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_age: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
}

/// Identity handshake body. `init_data` is forwarded unmodified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub init_data: String,
    pub user: TelegramProfile,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quest {
    pub id: Id,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "xp")]
    pub xp_reward: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub claimed: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: Id,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "xp")]
    pub xp_reward: u64,
    #[serde(default)]
    pub progress: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<u64>,
    #[serde(default)]
    pub unlocked: bool,
    #[serde(default)]
    pub claimed: bool,
}

/// Result of claiming a quest or achievement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimResponse {
    #[serde(default)]
    pub xp_gained: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

/// Ranking window of a leaderboard.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaderboardPeriod {
    #[default]
    Daily,
    Weekly,
    Monthly,
    AllTime,
}

impl LeaderboardPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::AllTime => "all-time",
        }
    }
}

impl fmt::Display for LeaderboardPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaderboardPeriod {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "all-time" | "alltime" => Ok(Self::AllTime),
            other => Err(ParseError {
                kind: "leaderboard period",
                value: other.to_string(),
            }),
        }
    }
}

/// Population a leaderboard ranks against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderboardScope {
    #[default]
    Global,
    Friends,
}

impl LeaderboardScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Friends => "friends",
        }
    }
}

impl fmt::Display for LeaderboardScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeaderboardScope {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Self::Global),
            "friends" => Ok(Self::Friends),
            other => Err(ParseError {
                kind: "leaderboard scope",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Id>,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub xp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardPosition {
    pub position: Option<u32>,
}

/// `{ "data": .. }` wrapper used by the leaderboard endpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Referral {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default)]
    pub xp: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralStats {
    pub referral_code: String,
    #[serde(default, rename = "referralXP", alias = "referralXp")]
    pub referral_xp: u64,
    #[serde(default)]
    pub top_referrals: Vec<Referral>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralCode {
    pub referral_code: String,
}

/// User preferences. Unknown keys round-trip through `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haptics: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Sets a single preference from its textual form.
    ///
    /// Known boolean keys must parse as booleans; anything else is stored
    /// verbatim (as JSON when it parses, otherwise as a string).
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ParseError> {
        let flag = || {
            value.parse::<bool>().map_err(|_| ParseError {
                kind: "boolean",
                value: value.to_string(),
            })
        };
        match key {
            "notifications" => self.notifications = Some(flag()?),
            "haptics" => self.haptics = Some(flag()?),
            "sound" => self.sound = Some(flag()?),
            "language" => self.language = Some(value.to_string()),
            other => {
                let parsed = serde_json::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                self.extra.insert(other.to_string(), parsed);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyClaim {
    #[serde(default)]
    pub xp_gained: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_claim_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownStatus {
    #[serde(default, alias = "isCooling")]
    pub cooling: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_end_time: Option<DateTime<Utc>>,
}

impl CooldownStatus {
    /// Time left until the cooldown ends, if one is active at `now`.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        let end = self.cooldown_end_time?;
        (end - now).to_std().ok().filter(|left| !left.is_zero())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyPoints {
    #[serde(default)]
    pub points: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileDashboard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Error payload of a rejected request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn into_message(self) -> Option<String> {
        self.message.or(self.error)
    }
}
