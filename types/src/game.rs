//! Fixed gameplay constants shared by the controller and presentation layers.
//!
//! None of these values are negotiated with the server. They are the local
//! contract for the tap loop until a handshake supplies overrides.

use std::time::Duration;

/// Number of taps after which the fan overheats and enters cooling.
pub const TAP_COOLDOWN_THRESHOLD: u64 = 500;

/// Maximum displayed fan speed.
pub const MAX_FAN_SPEED: u32 = 100;

/// Maximum displayed rotations per minute.
pub const MAX_RPM: u32 = 100_000;

/// Displayed rpm gained per accepted tap.
pub const RPM_PER_TAP: u32 = 200;

/// Displayed fan speed gained per accepted tap.
pub const FAN_SPEED_PER_TAP: u32 = 2;

/// Minimum displayed rpm required before a boost may be requested.
pub const BOOST_RPM_THRESHOLD: u32 = 50_000;

/// Taps credited locally by a successful boost.
pub const BOOST_TAP_BONUS: u64 = 100;

/// How long a boost keeps the fan at maximum.
pub const BOOST_WINDOW: Duration = Duration::from_millis(3_000);

/// Fan speed shed when a boost ends (floored at zero).
pub const BOOST_FAN_DECAY: u32 = 50;

/// Rpm shed when a boost ends (floored at zero).
pub const BOOST_RPM_DECAY: u32 = 50_000;

/// Cooling duration used when the server does not supply a cooldown end.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(5_000);

/// How long a floating XP indicator stays visible.
pub const XP_POPUP_WINDOW: Duration = Duration::from_millis(1_000);

/// Boost multiplier progression. The last term is the cap.
pub const BOOST_SEQUENCE: [u32; 10] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34];

/// Index into [BOOST_SEQUENCE] of the count a fresh session starts with.
pub const INITIAL_BOOST_INDEX: usize = 1;

/// Returns the boost term at `index`, clamped to the final term.
pub fn boost_term(index: usize) -> u32 {
    BOOST_SEQUENCE[index.min(BOOST_SEQUENCE.len() - 1)]
}

/// Referral payout tiers as (label, basis points of the referee's earnings).
pub const REFERRAL_TIERS: [(&str, u32); 3] =
    [("Primary", 1_000), ("Secondary", 500), ("Tertiary", 250)];

/// Builds the deep link a user shares to refer friends to the bot.
pub fn referral_link(bot_username: &str, code: &str) -> String {
    format!("https://t.me/{bot_username}?start={code}")
}
