use crate::{config::base_url, session::TokenStore, Config, Error, Result};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tapfarm_types::api::{
    Achievement, AuthRequest, AuthResponse, ClaimResponse, CooldownStatus, DailyClaim, DailyPoints,
    Envelope, ErrorBody, Id, LeaderboardEntry, LeaderboardPeriod, LeaderboardPosition,
    LeaderboardScope, ProfileDashboard, Quest, ReferralCode, ReferralStats, Settings,
    TapResponse, TelegramProfile, User, UserResponse,
};
use tracing::{debug, warn};
use url::Url;

/// Header carrying the raw Telegram init data on the handshake.
pub const TELEGRAM_DATA_HEADER: &str = "Telegram-Data";

/// Server calls the tap controller depends on.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn tap(&self) -> Result<TapResponse>;
    async fn boost(&self) -> Result<UserResponse>;
    async fn upgrade(&self) -> Result<UserResponse>;
    async fn cooldown_status(&self) -> Result<CooldownStatus>;
}

/// Authenticated REST client.
///
/// Every request carries the bearer token found in the [TokenStore] at send
/// time. Failures are logged and returned; nothing is retried.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: Url,
    auth_base: Url,
    store: Arc<dyn TokenStore>,
}

impl Client {
    pub fn new(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_url()?,
            auth_base: config.auth_url()?,
            store,
        })
    }

    /// Builds a client against explicit base URLs with reqwest defaults.
    pub fn with_urls(api_base: &str, auth_base: &str, store: Arc<dyn TokenStore>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            api_base: base_url(api_base)?,
            auth_base: base_url(auth_base)?,
            store,
        })
    }

    pub fn store(&self) -> &Arc<dyn TokenStore> {
        &self.store
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.load().is_some()
    }

    /// Drops the session token.
    pub fn logout(&self) -> Result<()> {
        self.store.clear()
    }

    fn url(base: &Url, segments: &[&str]) -> Result<Url> {
        let mut url = base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::InvalidScheme(base.scheme().to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        Self::url(&self.api_base, segments)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.store.load() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &'static str,
    ) -> Result<T> {
        let response = request.send().await.map_err(|err| {
            warn!(operation, error = %err, "request failed");
            Error::from(err)
        })?;
        let response = self.ensure_success(response, operation).await?;
        let body = response.json::<T>().await.map_err(|err| {
            warn!(operation, error = %err, "failed to decode response");
            Error::from(err)
        })?;
        debug!(operation, "request succeeded");
        Ok(body)
    }

    /// Maps non-2xx responses to errors. A 401 also invalidates the session.
    async fn ensure_success(&self, response: Response, operation: &'static str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            warn!(operation, "session rejected by server, clearing token");
            if let Err(err) = self.store.clear() {
                warn!(operation, error = %err, "failed to clear session token");
            }
            return Err(Error::Unauthorized);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .and_then(ErrorBody::into_message)
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        warn!(operation, %status, reason = %message, "request rejected");
        Err(Error::Failed { status, message })
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], operation: &'static str) -> Result<T> {
        let url = self.endpoint(segments)?;
        self.send(self.authorize(self.http.get(url)), operation).await
    }

    async fn post<T: DeserializeOwned>(&self, segments: &[&str], operation: &'static str) -> Result<T> {
        let url = self.endpoint(segments)?;
        self.send(self.authorize(self.http.post(url)), operation).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
        operation: &'static str,
    ) -> Result<T> {
        let url = self.endpoint(segments)?;
        self.send(self.authorize(self.http.post(url).json(body)), operation)
            .await
    }

    async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
        operation: &'static str,
    ) -> Result<T> {
        let url = self.endpoint(segments)?;
        self.send(self.authorize(self.http.put(url).json(body)), operation)
            .await
    }

    /// Identity handshake. The init data blob is forwarded unmodified in
    /// both the body and the `Telegram-Data` header; the server verifies it.
    pub async fn authenticate_telegram(&self, request: &AuthRequest) -> Result<AuthResponse> {
        let url = Self::url(&self.auth_base, &["telegram"])?;
        let builder = self
            .http
            .post(url)
            .header(TELEGRAM_DATA_HEADER, request.init_data.as_str())
            .json(request);
        self.send(builder, "telegram auth").await
    }

    pub async fn create_profile(&self, profile: &TelegramProfile) -> Result<UserResponse> {
        self.post_json(&["users", "create"], profile, "create profile")
            .await
    }

    /// Replaces profile fields; returns the updated user.
    pub async fn update_profile(&self, user: &User) -> Result<User> {
        self.put_json(&["profile"], user, "update profile").await
    }

    pub async fn profile_dashboard(&self) -> Result<ProfileDashboard> {
        self.get(&["profile-dashboard"], "profile dashboard").await
    }

    pub async fn update_profile_dashboard(&self, update: &Value) -> Result<ProfileDashboard> {
        self.put_json(&["profile-dashboard", "update"], update, "update profile dashboard")
            .await
    }

    pub async fn tap(&self) -> Result<TapResponse> {
        self.post(&["tap"], "tap").await
    }

    pub async fn boost(&self) -> Result<UserResponse> {
        self.post(&["boost"], "boost").await
    }

    pub async fn upgrade(&self) -> Result<UserResponse> {
        self.post(&["upgrade"], "upgrade").await
    }

    pub async fn upgrade_gpu(&self) -> Result<UserResponse> {
        self.post(&["users", "upgrade-gpu"], "upgrade gpu").await
    }

    pub async fn cooldown_status(&self) -> Result<CooldownStatus> {
        self.get(&["users", "cooldown-status"], "cooldown status")
            .await
    }

    pub async fn claim_daily_xp(&self) -> Result<DailyClaim> {
        self.post(&["users", "claim-daily-xp"], "claim daily xp")
            .await
    }

    pub async fn daily_points(&self) -> Result<DailyPoints> {
        self.get(&["users", "daily-points"], "daily points").await
    }

    pub async fn generate_referral_code(&self) -> Result<ReferralCode> {
        self.post(&["referral", "generate-code"], "generate referral code")
            .await
    }

    pub async fn apply_referral_code(&self, code: &str) -> Result<Value> {
        self.post_json(
            &["referral", "apply-code"],
            &json!({ "referralCode": code }),
            "apply referral code",
        )
        .await
    }

    pub async fn referral_stats(&self) -> Result<ReferralStats> {
        self.get(&["referral", "stats"], "referral stats").await
    }

    pub async fn quests(&self) -> Result<Vec<Quest>> {
        self.get(&["quests"], "quests").await
    }

    pub async fn complete_quest(&self, id: &Id) -> Result<ClaimResponse> {
        self.post(&["quests", &id.0, "complete"], "complete quest")
            .await
    }

    pub async fn achievements(&self) -> Result<Vec<Achievement>> {
        self.get(&["achievements"], "achievements").await
    }

    pub async fn claim_achievement(&self, id: &Id) -> Result<ClaimResponse> {
        self.post(&["achievements", "claim", &id.0], "claim achievement")
            .await
    }

    pub async fn leaderboard(
        &self,
        period: LeaderboardPeriod,
        scope: LeaderboardScope,
    ) -> Result<Vec<LeaderboardEntry>> {
        let mut url = self.endpoint(&["leaderboard", period.as_str()])?;
        url.query_pairs_mut().append_pair("type", scope.as_str());
        let envelope: Envelope<Vec<LeaderboardEntry>> = self
            .send(self.authorize(self.http.get(url)), "leaderboard")
            .await?;
        Ok(envelope.data)
    }

    /// The caller's rank, if ranked.
    pub async fn leaderboard_position(&self, period: LeaderboardPeriod) -> Result<Option<u32>> {
        let envelope: Envelope<LeaderboardPosition> = self
            .get(&["leaderboard", "position", period.as_str()], "leaderboard position")
            .await?;
        Ok(envelope.data.position)
    }

    pub async fn settings(&self) -> Result<Settings> {
        self.get(&["settings"], "settings").await
    }

    pub async fn update_settings(&self, settings: &Settings) -> Result<Settings> {
        self.put_json(&["settings"], settings, "update settings")
            .await
    }
}

#[async_trait]
impl Backend for Client {
    async fn tap(&self) -> Result<TapResponse> {
        Client::tap(self).await
    }

    async fn boost(&self) -> Result<UserResponse> {
        Client::boost(self).await
    }

    async fn upgrade(&self) -> Result<UserResponse> {
        Client::upgrade(self).await
    }

    async fn cooldown_status(&self) -> Result<CooldownStatus> {
        Client::cooldown_status(self).await
    }
}
