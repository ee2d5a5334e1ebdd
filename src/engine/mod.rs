// Live trivia engine: pure rules plus the service that drives them.

pub mod achievements;
pub mod config;
pub mod hub;
pub mod leaderboard;
pub mod lifecycle;
pub mod live;
pub mod registration;
pub mod scoring;
pub mod territory;
