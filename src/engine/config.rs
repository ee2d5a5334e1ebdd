// Scoring, timing and validation constants for the live engine.

// Answer timing (milliseconds)
pub const FAST_RESPONSE_WINDOW_MS: i64 = 3_000;
pub const SPEED_BONUS_MAX_PERCENT: i64 = 50;
pub const SPEED_DEMON_THRESHOLD_MS: i64 = 3_000;
/// Server-side slack added to every answer window to absorb network latency.
pub const ANSWER_GRACE_MS: i64 = 500;

// Question limits
pub const DEFAULT_POINTS: i64 = 100;
pub const MIN_POINTS: i64 = 1;
pub const MAX_POINTS: i64 = 10_000;
pub const MIN_TIME_LIMIT_SECS: i64 = 5;
pub const MAX_TIME_LIMIT_SECS: i64 = 300;
pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 6;
pub const MAX_PROMPT_LENGTH: usize = 500;

// Registration
pub const NAME_MIN_CHARS: usize = 2;
pub const NAME_MAX_CHARS: usize = 20;
pub const MAX_FIELD_VALUE_CHARS: usize = 200;
pub const MAX_CUSTOM_FIELD_ID_CHARS: usize = 32;

// Team battle
pub const MIN_TEAMS: usize = 2;
pub const MAX_TEAMS: usize = 8;
pub const DEFAULT_MAP_ROWS: i64 = 5;
pub const DEFAULT_MAP_COLS: i64 = 5;
pub const MAX_MAP_SIDE: i64 = 12;

// Achievement thresholds
pub const STREAK_THRESHOLDS: [(i64, &str); 3] =
    [(3, "streak_3"), (5, "streak_5"), (10, "streak_10")];
pub const TERRITORY_CLAIMED_COUNT: i64 = 1;
pub const TERRITORY_MASTER_COUNT: i64 = 5;

// Session PIN
pub const PIN_LENGTH: usize = 6;
pub const PIN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const PIN_GENERATION_ATTEMPTS: usize = 16;
