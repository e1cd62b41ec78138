//! Tap/Boost/Cooldown controller.
//!
//! [Controller] serializes state changes through one lock, talks to the
//! server through a [Backend], and drives the phase timers. Every change is
//! published as a [Snapshot] on a watch channel.

mod machine;

pub use machine::{
    BoostState, Effect, Machine, Phase, SkipReason, Snapshot, TapState, XpPopup,
};

use crate::{
    timers::{Ticket, TimerKind, Timers},
    Backend, Result,
};
use chrono::Utc;
use std::sync::{Arc, Weak};
use tapfarm_types::api::User;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

/// Result of a controller operation that reached a decision.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The server accepted the request and the new state was published.
    Applied(Snapshot),
    /// A local precondition failed. No request was sent.
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }
}

struct Inner {
    machine: Machine,
    timers: Timers,
}

struct Shared {
    inner: Mutex<Inner>,
    updates: watch::Sender<Snapshot>,
}

impl Shared {
    fn publish(&self, inner: &Inner) -> Snapshot {
        let snapshot = inner.machine.snapshot();
        self.updates.send_replace(snapshot.clone());
        snapshot
    }

    fn schedule(self: &Arc<Self>, inner: &mut Inner, effects: Vec<Effect>) {
        for effect in effects {
            let (kind, delay) = match effect {
                Effect::EndCooldown(delay) => (TimerKind::Cooldown, delay),
                Effect::EndBoost(delay) => (TimerKind::BoostRevert, delay),
                Effect::ExpirePopup { id, after } => (TimerKind::Popup(id), after),
            };
            let shared = Arc::downgrade(self);
            inner
                .timers
                .schedule(kind, delay, move |ticket| Self::fire(shared, ticket));
        }
    }

    async fn fire(shared: Weak<Self>, ticket: Ticket) {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock().await;
        if !inner.timers.complete(ticket) {
            return;
        }
        match ticket.kind {
            TimerKind::Cooldown => inner.machine.finish_cooling(),
            TimerKind::BoostRevert => inner.machine.finish_boost(),
            TimerKind::Popup(id) => inner.machine.expire_popup(id),
        }
        shared.publish(&inner);
    }
}

pub struct Controller<B: Backend> {
    backend: Arc<B>,
    shared: Arc<Shared>,
}

impl<B: Backend> Clone for Controller<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> Controller<B> {
    pub fn new(backend: Arc<B>, user: Option<User>) -> Self {
        Self::with_machine(backend, Machine::new(user))
    }

    pub fn with_machine(backend: Arc<B>, machine: Machine) -> Self {
        let (updates, _) = watch::channel(machine.snapshot());
        Self {
            backend,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    machine,
                    timers: Timers::new(),
                }),
                updates,
            }),
        }
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Snapshot {
        self.shared.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.updates.subscribe()
    }

    /// Registers one tap with the server.
    pub async fn tap(&self) -> Result<Outcome> {
        if let Err(reason) = self.shared.inner.lock().await.machine.check_tap() {
            debug!(?reason, "tap skipped");
            return Ok(Outcome::Skipped(reason));
        }

        let response = self.backend.tap().await.inspect_err(|err| {
            warn!(?err, "tap failed");
        })?;

        let mut inner = self.shared.inner.lock().await;
        let effects = inner.machine.apply_tap(&response.user, Utc::now());
        self.shared.schedule(&mut inner, effects);
        Ok(Outcome::Applied(self.shared.publish(&inner)))
    }

    /// Starts a boost once the rotor is spinning fast enough.
    pub async fn boost(&self) -> Result<Outcome> {
        if let Err(reason) = self.shared.inner.lock().await.machine.begin_boost() {
            debug!(?reason, "boost skipped");
            return Ok(Outcome::Skipped(reason));
        }

        let response = match self.backend.boost().await {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, "boost failed");
                self.shared.inner.lock().await.machine.abort_boost();
                return Err(err);
            }
        };

        let mut inner = self.shared.inner.lock().await;
        let effects = inner.machine.apply_boost(response.user);
        self.shared.schedule(&mut inner, effects);
        Ok(Outcome::Applied(self.shared.publish(&inner)))
    }

    /// Buys the next upgrade. Allowed in any phase.
    pub async fn upgrade(&self) -> Result<Outcome> {
        let response = self.backend.upgrade().await.inspect_err(|err| {
            warn!(?err, "upgrade failed");
        })?;

        let mut inner = self.shared.inner.lock().await;
        inner.machine.apply_user(response.user);
        Ok(Outcome::Applied(self.shared.publish(&inner)))
    }

    /// Pulls the server cooldown state, entering or extending cooling if the
    /// server reports one.
    pub async fn sync(&self) -> Result<Snapshot> {
        let status = self.backend.cooldown_status().await.inspect_err(|err| {
            warn!(?err, "cooldown status failed");
        })?;

        let mut inner = self.shared.inner.lock().await;
        let effects = inner.machine.apply_cooldown_status(&status, Utc::now());
        self.shared.schedule(&mut inner, effects);
        Ok(self.shared.publish(&inner))
    }

    /// Cancels every pending timer. State stays as last published.
    pub async fn shutdown(&self) {
        let mut inner = self.shared.inner.lock().await;
        inner.timers.cancel_all();
        debug!("controller shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockBackend;
    use std::time::Duration;
    use tapfarm_types::{
        api::CooldownStatus,
        game::{MAX_FAN_SPEED, MAX_RPM, TAP_COOLDOWN_THRESHOLD},
    };
    use tokio::time::sleep;

    fn controller() -> (Arc<MockBackend>, Controller<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        (backend.clone(), Controller::new(backend, None))
    }

    async fn tap_times(controller: &Controller<MockBackend>, times: u64) {
        for _ in 0..times {
            assert!(controller.tap().await.unwrap().is_applied());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_updates_state_and_popup_expires() {
        let (_, controller) = controller();
        let mut updates = controller.subscribe();

        let Outcome::Applied(snapshot) = controller.tap().await.unwrap() else {
            panic!("tap skipped");
        };
        assert_eq!(snapshot.phase, Phase::Active);
        assert_eq!(snapshot.tap.tap_count, 1);
        assert_eq!(snapshot.tap.rpm, 200);
        assert_eq!(snapshot.tap.fan_speed, 2);
        assert_eq!(snapshot.popups.len(), 1);
        assert_eq!(snapshot.popups[0].xp, 10);
        let user = snapshot.user.unwrap();
        assert_eq!(user.total_taps, Some(1));
        assert_eq!(user.compute, Some(10));

        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().tap.tap_count, 1);

        sleep(Duration::from_millis(1_001)).await;
        assert!(controller.snapshot().popups.is_empty());
        assert!(updates.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_cools_down_for_default_window() {
        let (backend, controller) = controller();
        tap_times(&controller, TAP_COOLDOWN_THRESHOLD).await;

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.phase, Phase::Cooling);
        assert_eq!(snapshot.tap.tap_count, 0);
        assert_eq!(snapshot.tap.rpm, 0);
        assert_eq!(snapshot.tap.fan_speed, 0);

        // Taps while cooling never reach the server
        assert_eq!(
            controller.tap().await.unwrap(),
            Outcome::Skipped(SkipReason::Cooling)
        );
        assert_eq!(backend.taps(), TAP_COOLDOWN_THRESHOLD);

        sleep(Duration::from_millis(4_999)).await;
        assert_eq!(controller.snapshot().phase, Phase::Cooling);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(controller.snapshot().phase, Phase::Idle);
        assert!(controller.tap().await.unwrap().is_applied());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_cooldown_end_overrides_default() {
        let (backend, controller) = controller();
        backend.set_cooldown_end(Some(Utc::now() + chrono::Duration::seconds(10)));
        controller.tap().await.unwrap();
        backend.set_cooldown_end(None);
        assert_eq!(controller.snapshot().phase, Phase::Cooling);

        sleep(Duration::from_millis(6_000)).await;
        assert_eq!(controller.snapshot().phase, Phase::Cooling);

        sleep(Duration::from_millis(4_100)).await;
        assert_eq!(controller.snapshot().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tap_leaves_state_untouched() {
        let (backend, controller) = controller();
        tap_times(&controller, 3).await;
        let before = controller.snapshot();

        backend.set_failing(true);
        let err = controller.tap().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(controller.snapshot(), before);

        backend.set_failing(false);
        tap_times(&controller, 1).await;
        assert_eq!(controller.snapshot().tap.tap_count, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_responses() {
        let (backend, controller) = controller();
        backend.push_tap_delay(Duration::from_millis(200));
        backend.push_tap_delay(Duration::ZERO);

        let (first, second) = futures::join!(controller.tap(), controller.tap());
        assert!(first.unwrap().is_applied());
        assert!(second.unwrap().is_applied());

        // Both taps counted locally, cached user reflects the last response
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.tap.tap_count, 2);
        assert_eq!(snapshot.user.unwrap().total_taps, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boost_lifecycle() {
        let (backend, controller) = controller();
        assert_eq!(
            controller.boost().await.unwrap(),
            Outcome::Skipped(SkipReason::BelowBoostThreshold { rpm: 0 })
        );
        assert_eq!(backend.boosts(), 0);

        tap_times(&controller, 250).await;
        let Outcome::Applied(snapshot) = controller.boost().await.unwrap() else {
            panic!("boost skipped");
        };
        assert!(snapshot.boosting);
        assert_eq!(snapshot.tap.fan_speed, MAX_FAN_SPEED);
        assert_eq!(snapshot.tap.rpm, MAX_RPM);
        assert_eq!(snapshot.tap.tap_count, 350);
        assert_eq!(snapshot.boost_count, 1);
        assert_eq!(snapshot.user.unwrap().xp, Some(1_000));

        assert_eq!(
            controller.boost().await.unwrap(),
            Outcome::Skipped(SkipReason::AlreadyBoosting)
        );
        assert_eq!(backend.boosts(), 1);

        sleep(Duration::from_millis(2_999)).await;
        assert!(controller.snapshot().boosting);

        sleep(Duration::from_millis(2)).await;
        let snapshot = controller.snapshot();
        assert!(!snapshot.boosting);
        assert_eq!(snapshot.tap.fan_speed, 50);
        assert_eq!(snapshot.tap.rpm, 50_000);

        // Still at the threshold, so the next boost advances the sequence
        controller.boost().await.unwrap();
        assert_eq!(controller.snapshot().boost_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_boosts_send_one_request() {
        let (backend, controller) = controller();
        tap_times(&controller, 250).await;
        backend.set_boost_delay(Duration::from_millis(50));

        let (first, second) = futures::join!(controller.boost(), controller.boost());
        assert!(first.unwrap().is_applied());
        assert_eq!(
            second.unwrap(),
            Outcome::Skipped(SkipReason::AlreadyBoosting)
        );

        assert_eq!(backend.boosts(), 1);
        let snapshot = controller.snapshot();
        assert!(snapshot.boosting);
        assert_eq!(snapshot.boost_count, 1);
        assert_eq!(snapshot.tap.tap_count, 350);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_boost_does_not_start_overlay() {
        let (backend, controller) = controller();
        tap_times(&controller, 250).await;
        backend.set_failing(true);
        assert!(controller.boost().await.is_err());
        let snapshot = controller.snapshot();
        assert!(!snapshot.boosting);
        assert_eq!(snapshot.boost_count, 1);
        assert_eq!(snapshot.tap.tap_count, 250);

        // The in-flight slot is released, so a retry goes out
        backend.set_failing(false);
        assert!(controller.boost().await.unwrap().is_applied());
        assert_eq!(backend.boosts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_merges_user() {
        let (_, controller) = controller();
        tap_times(&controller, 2).await;
        controller.upgrade().await.unwrap();
        let user = controller.snapshot().user.unwrap();
        assert_eq!(user.gpu_level, Some(2));
        assert_eq!(user.compute_power, Some(20));
        assert_eq!(user.total_taps, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_enters_server_cooldown() {
        let (backend, controller) = controller();
        backend.set_cooldown_status(CooldownStatus {
            cooling: true,
            cooldown_end_time: Some(Utc::now() + chrono::Duration::seconds(3)),
        });
        assert_eq!(controller.sync().await.unwrap().phase, Phase::Cooling);

        sleep(Duration::from_millis(3_100)).await;
        assert_eq!(controller.snapshot().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_timers() {
        let (_, controller) = controller();
        tap_times(&controller, TAP_COOLDOWN_THRESHOLD).await;
        controller.shutdown().await;

        sleep(Duration::from_secs(10)).await;
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.phase, Phase::Cooling);
        assert!(!snapshot.popups.is_empty());
    }
}
