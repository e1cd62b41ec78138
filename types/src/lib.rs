pub mod api;
pub mod game;

pub use api::{
    Achievement, AuthRequest, AuthResponse, ClaimResponse, CooldownStatus, DailyClaim,
    DailyPoints, ErrorBody, LeaderboardEntry, LeaderboardPeriod, LeaderboardPosition,
    LeaderboardScope, ProfileDashboard, Quest, ReferralCode, ReferralStats, Settings, TapResponse,
    TapUpdate, TelegramProfile, User, UserResponse,
};
