//! Synchronous tap/boost/cooldown state.
//!
//! Transitions never perform I/O or sleep. Anything time-based is returned
//! as an [Effect] for the caller to schedule.

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{f64::consts::TAU, time::Duration};
use tapfarm_types::{
    api::{CooldownStatus, TapUpdate, User},
    game::{
        boost_term, BOOST_FAN_DECAY, BOOST_RPM_DECAY, BOOST_RPM_THRESHOLD, BOOST_SEQUENCE,
        BOOST_TAP_BONUS, BOOST_WINDOW, DEFAULT_COOLDOWN, FAN_SPEED_PER_TAP, INITIAL_BOOST_INDEX,
        MAX_FAN_SPEED, MAX_RPM, RPM_PER_TAP, TAP_COOLDOWN_THRESHOLD, XP_POPUP_WINDOW,
    },
};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
    Cooling,
}

/// Why an operation was refused without contacting the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    Cooling,
    AlreadyBoosting,
    BelowBoostThreshold { rpm: u32 },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TapState {
    pub tap_count: u64,
    pub rpm: u32,
    pub fan_speed: u32,
    pub cooling: bool,
    pub cooldown_ends_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoostState {
    pub active: bool,
    /// A boost request is in flight.
    pub pending: bool,
    index: usize,
}

impl Default for BoostState {
    fn default() -> Self {
        Self {
            active: false,
            pending: false,
            index: INITIAL_BOOST_INDEX,
        }
    }
}

impl BoostState {
    pub fn boost_count(&self) -> u32 {
        boost_term(self.index)
    }

    /// Rpm at which a boost becomes available.
    pub fn available_at(&self) -> u32 {
        BOOST_RPM_THRESHOLD
    }

    fn advance(&mut self) {
        self.index = (self.index + 1).min(BOOST_SEQUENCE.len() - 1);
    }
}

/// Floating XP indicator, positioned in percent of the tap area.
#[derive(Clone, Debug, PartialEq)]
pub struct XpPopup {
    pub id: u64,
    pub xp: u64,
    pub top: f64,
    pub left: f64,
}

/// Timer work requested by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Effect {
    EndCooldown(Duration),
    EndBoost(Duration),
    ExpirePopup { id: u64, after: Duration },
}

/// Point-in-time view of the controller, suitable for rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub phase: Phase,
    pub tap: TapState,
    pub boosting: bool,
    pub boost_count: u32,
    pub popups: Vec<XpPopup>,
    pub user: Option<User>,
}

pub struct Machine {
    tap: TapState,
    boost: BoostState,
    user: Option<User>,
    popups: Vec<XpPopup>,
    next_popup: u64,
    rng: StdRng,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Machine {
    pub fn new(user: Option<User>) -> Self {
        Self::with_rng(user, StdRng::from_entropy())
    }

    pub fn with_rng(user: Option<User>, rng: StdRng) -> Self {
        Self {
            tap: TapState::default(),
            boost: BoostState::default(),
            user,
            popups: Vec::new(),
            next_popup: 0,
            rng,
        }
    }

    pub fn phase(&self) -> Phase {
        if self.tap.cooling {
            Phase::Cooling
        } else if self.tap.tap_count > 0 {
            Phase::Active
        } else {
            Phase::Idle
        }
    }

    pub fn tap_state(&self) -> &TapState {
        &self.tap
    }

    pub fn boost_state(&self) -> &BoostState {
        &self.boost
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn popups(&self) -> &[XpPopup] {
        &self.popups
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase(),
            tap: self.tap.clone(),
            boosting: self.boost.active,
            boost_count: self.boost.boost_count(),
            popups: self.popups.clone(),
            user: self.user.clone(),
        }
    }

    pub fn check_tap(&self) -> Result<(), SkipReason> {
        if self.tap.cooling {
            return Err(SkipReason::Cooling);
        }
        Ok(())
    }

    pub fn check_boost(&self) -> Result<(), SkipReason> {
        if self.tap.cooling {
            return Err(SkipReason::Cooling);
        }
        if self.boost.active || self.boost.pending {
            return Err(SkipReason::AlreadyBoosting);
        }
        if self.tap.rpm < BOOST_RPM_THRESHOLD {
            return Err(SkipReason::BelowBoostThreshold { rpm: self.tap.rpm });
        }
        Ok(())
    }

    /// Checks the boost preconditions and reserves the single in-flight slot.
    /// Must be paired with [Machine::apply_boost] or [Machine::abort_boost].
    pub fn begin_boost(&mut self) -> Result<(), SkipReason> {
        self.check_boost()?;
        self.boost.pending = true;
        Ok(())
    }

    /// Releases the slot taken by [Machine::begin_boost] after a failure.
    pub fn abort_boost(&mut self) {
        self.boost.pending = false;
    }

    fn user_mut(&mut self) -> &mut User {
        self.user.get_or_insert_with(User::default)
    }

    /// Applies a successful tap response.
    ///
    /// Server counters always overwrite the cache. Local counters only move
    /// when the response lands outside a cooling phase.
    pub fn apply_tap(&mut self, update: &TapUpdate, now: DateTime<Utc>) -> Vec<Effect> {
        self.user_mut().apply_tap(update);
        let server_end = update.cooldown_end_time.filter(|end| *end > now);

        let mut effects = Vec::new();
        if self.tap.cooling {
            // Reconcile with a later server deadline; never shorten ours.
            if let Some(end) = server_end {
                if self.tap.cooldown_ends_at.map_or(true, |ours| end > ours) {
                    effects.push(self.start_cooling(Some(end), now));
                }
            }
            return effects;
        }

        self.tap.tap_count += 1;
        self.tap.rpm = (self.tap.rpm + RPM_PER_TAP).min(MAX_RPM);
        self.tap.fan_speed = (self.tap.fan_speed + FAN_SPEED_PER_TAP).min(MAX_FAN_SPEED);
        effects.push(self.push_popup(update.compute_power));

        if server_end.is_some() {
            effects.push(self.start_cooling(server_end, now));
        } else if self.tap.tap_count >= TAP_COOLDOWN_THRESHOLD {
            effects.push(self.start_cooling(None, now));
        }
        effects
    }

    fn push_popup(&mut self, xp: u64) -> Effect {
        let angle = self.rng.gen::<f64>() * TAU;
        let radius = 20.0 + self.rng.gen::<f64>() * 20.0;
        let id = self.next_popup;
        self.next_popup += 1;
        self.popups.push(XpPopup {
            id,
            xp,
            top: 50.0 + angle.sin() * radius,
            left: 50.0 + angle.cos() * radius,
        });
        Effect::ExpirePopup {
            id,
            after: XP_POPUP_WINDOW,
        }
    }

    /// Enters cooling: counters reset and the exit is scheduled for the
    /// server deadline, or [DEFAULT_COOLDOWN] without one.
    pub fn start_cooling(&mut self, server_end: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Effect {
        let (ends_at, delay) = match server_end {
            Some(end) => (end, (end - now).to_std().unwrap_or_default()),
            None => (
                now + chrono::Duration::milliseconds(DEFAULT_COOLDOWN.as_millis() as i64),
                DEFAULT_COOLDOWN,
            ),
        };
        self.tap.tap_count = 0;
        self.tap.fan_speed = 0;
        self.tap.rpm = 0;
        self.tap.cooling = true;
        self.tap.cooldown_ends_at = Some(ends_at);
        info!(?delay, server = server_end.is_some(), "cooling started");
        Effect::EndCooldown(delay)
    }

    pub fn finish_cooling(&mut self) {
        if !self.tap.cooling {
            return;
        }
        self.tap.cooling = false;
        self.tap.cooldown_ends_at = None;
        info!("cooling finished");
    }

    /// Applies a successful boost response.
    pub fn apply_boost(&mut self, user: User) -> Vec<Effect> {
        self.boost.pending = false;
        self.user_mut().merge(user);
        if self.tap.cooling {
            debug!("boost response arrived while cooling, overlay skipped");
            return Vec::new();
        }
        if self.boost.active {
            debug!("boost response arrived while boosting, overlay kept");
            return Vec::new();
        }
        self.boost.active = true;
        self.boost.advance();
        self.tap.fan_speed = MAX_FAN_SPEED;
        self.tap.rpm = MAX_RPM;
        self.tap.tap_count += BOOST_TAP_BONUS;
        info!(boost_count = self.boost.boost_count(), "boost started");
        vec![Effect::EndBoost(BOOST_WINDOW)]
    }

    pub fn finish_boost(&mut self) {
        self.boost.active = false;
        self.tap.fan_speed = self.tap.fan_speed.saturating_sub(BOOST_FAN_DECAY);
        self.tap.rpm = self.tap.rpm.saturating_sub(BOOST_RPM_DECAY);
        info!(
            fan_speed = self.tap.fan_speed,
            rpm = self.tap.rpm,
            "boost finished"
        );
    }

    pub fn expire_popup(&mut self, id: u64) {
        self.popups.retain(|popup| popup.id != id);
    }

    /// Reconciles with the server's view of the cooldown. Only an active
    /// server cooldown changes local state.
    pub fn apply_cooldown_status(
        &mut self,
        status: &CooldownStatus,
        now: DateTime<Utc>,
    ) -> Vec<Effect> {
        let remaining = status.remaining(now);
        if !status.cooling && remaining.is_none() {
            return Vec::new();
        }
        let server_end = status.cooldown_end_time.filter(|_| remaining.is_some());
        match (self.tap.cooling, server_end) {
            (false, end) => vec![self.start_cooling(end, now)],
            (true, Some(end)) if self.tap.cooldown_ends_at.map_or(true, |ours| end > ours) => {
                vec![self.start_cooling(Some(end), now)]
            }
            _ => Vec::new(),
        }
    }

    /// Merges a server user aggregate into the cache.
    pub fn apply_user(&mut self, user: User) {
        self.user_mut().merge(user);
    }
}
