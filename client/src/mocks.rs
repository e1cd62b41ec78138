//! Test doubles: an in-process REST server and an in-memory [Backend].

use crate::{session::TokenStore, Backend, Client, Error, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tapfarm_types::api::{
    AuthRequest, CooldownStatus, TapResponse, TapUpdate, User, UserResponse,
};

#[derive(Default)]
struct ServerState {
    taps: AtomicU64,
    daily_claims: AtomicUsize,
}

pub(crate) struct TestServer {
    base_url: String,
    state: Arc<ServerState>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub const TOKEN: &'static str = "token-1";

    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let router = Router::new()
            .route("/auth/telegram", post(auth))
            .route("/api/tap", post(tap))
            .route("/api/boost", post(boost))
            .route("/api/quests", get(quests))
            .route("/api/quests/:id/complete", post(complete_quest))
            .route("/api/users/claim-daily-xp", post(claim_daily))
            .route("/api/leaderboard/:period", get(leaderboard))
            .route("/api/leaderboard/position/:period", get(position))
            .route("/api/settings", get(settings).put(update_settings))
            .with_state(state.clone());

        // Start server on random port
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let actual_addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{actual_addr}"),
            state,
            handle,
        }
    }

    pub fn client(&self, store: Arc<dyn TokenStore>) -> Client {
        Client::with_urls(
            &format!("{}/api/", self.base_url),
            &format!("{}/auth/", self.base_url),
            store,
        )
        .unwrap()
    }

    pub fn daily_claims(&self) -> usize {
        self.state.daily_claims.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", TestServer::TOKEN);
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "unauthorized" })),
    )
        .into_response()
}

async fn auth(headers: HeaderMap, Json(body): Json<AuthRequest>) -> Response {
    let forwarded = headers
        .get("telegram-data")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if body.init_data.is_empty() || forwarded != body.init_data {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid init data" })),
        )
            .into_response();
    }
    Json(json!({
        "user": { "id": body.user.id, "username": body.user.name },
        "token": TestServer::TOKEN,
    }))
    .into_response()
}

async fn tap(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let taps = state.taps.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "user": {
            "compute": taps * 2,
            "totalTaps": taps,
            "computePower": 2,
            "cooldownEndTime": null
        }
    }))
    .into_response()
}

async fn boost(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "user": { "xp": 10, "level": 2 } })).into_response()
}

async fn quests(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!([
        { "id": "q1", "title": "Join channel", "xpReward": 50 },
        { "id": "q2", "title": "Share link", "xp": 20, "completed": true, "claimed": true }
    ]))
    .into_response()
}

async fn complete_quest(headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    if id == "q2" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "already claimed" })),
        )
            .into_response();
    }
    Json(json!({ "xpGained": 50 })).into_response()
}

async fn claim_daily(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    state.daily_claims.fetch_add(1, Ordering::SeqCst);
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn leaderboard(
    headers: HeaderMap,
    Path(period): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    let scope = query.get("type").cloned().unwrap_or_default();
    Json(json!({
        "data": [{ "rank": 1, "username": format!("{period}/{scope}"), "xp": 10 }]
    }))
    .into_response()
}

async fn position(headers: HeaderMap, Path(_period): Path<String>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "data": { "position": 3 } })).into_response()
}

async fn settings(headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "haptics": true, "language": "en" })).into_response()
}

async fn update_settings(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }
    Json(body).into_response()
}

/// In-memory [Backend] with scriptable failures, delays and cooldowns.
#[derive(Default)]
pub(crate) struct MockBackend {
    taps: AtomicU64,
    boosts: AtomicUsize,
    fail: AtomicBool,
    cooldown_end: Mutex<Option<DateTime<Utc>>>,
    cooldown_status: Mutex<Option<CooldownStatus>>,
    tap_delays: Mutex<VecDeque<Duration>>,
    boost_delay: Mutex<Option<Duration>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Cooldown end returned with every subsequent tap.
    pub fn set_cooldown_end(&self, end: Option<DateTime<Utc>>) {
        *self.cooldown_end.lock().unwrap() = end;
    }

    pub fn set_cooldown_status(&self, status: CooldownStatus) {
        *self.cooldown_status.lock().unwrap() = Some(status);
    }

    /// Delays applied to the next taps, in call order.
    pub fn push_tap_delay(&self, delay: Duration) {
        self.tap_delays.lock().unwrap().push_back(delay);
    }

    /// Delay applied to every subsequent boost.
    pub fn set_boost_delay(&self, delay: Duration) {
        *self.boost_delay.lock().unwrap() = Some(delay);
    }

    pub fn taps(&self) -> u64 {
        self.taps.load(Ordering::SeqCst)
    }

    pub fn boosts(&self) -> usize {
        self.boosts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Failed {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                message: "offline".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn tap(&self) -> Result<TapResponse> {
        self.check()?;
        let taps = self.taps.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.tap_delays.lock().unwrap().pop_front();
        let cooldown_end_time = *self.cooldown_end.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(TapResponse {
            user: TapUpdate {
                compute: taps * 10,
                total_taps: taps,
                compute_power: 10,
                cooldown_end_time,
            },
        })
    }

    async fn boost(&self) -> Result<UserResponse> {
        self.check()?;
        let boosts = self.boosts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = *self.boost_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(UserResponse {
            user: User {
                xp: Some(boosts as u64 * 1_000),
                ..Default::default()
            },
        })
    }

    async fn upgrade(&self) -> Result<UserResponse> {
        self.check()?;
        Ok(UserResponse {
            user: User {
                gpu_level: Some(2),
                compute_power: Some(20),
                ..Default::default()
            },
        })
    }

    async fn cooldown_status(&self) -> Result<CooldownStatus> {
        self.check()?;
        Ok(self
            .cooldown_status
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(CooldownStatus {
                cooling: false,
                cooldown_end_time: None,
            }))
    }
}
