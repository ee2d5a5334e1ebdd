// In-memory rate limiter for join and authoring endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Different rate limit types with their constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitType {
    /// Join attempts against one session, keyed by session id.
    JoinAttempts,
    /// Sessions created by one admin, keyed by user id.
    SessionCreates,
}

impl RateLimitType {
    /// Maximum number of events allowed in the window.
    pub fn max_count(&self) -> usize {
        match self {
            RateLimitType::JoinAttempts => 600,
            RateLimitType::SessionCreates => 60,
        }
    }

    /// Time window for the rate limit.
    pub fn window(&self) -> Duration {
        match self {
            RateLimitType::JoinAttempts => Duration::from_secs(60),
            RateLimitType::SessionCreates => Duration::from_secs(3600),
        }
    }
}

impl std::fmt::Display for RateLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RateLimitType::JoinAttempts => write!(f, "join attempts per minute"),
            RateLimitType::SessionCreates => write!(f, "sessions per hour"),
        }
    }
}

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone)]
pub struct RateLimitError {
    pub limit_type: RateLimitType,
    pub max: usize,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Rate limit exceeded: max {} {}",
            self.max, self.limit_type
        )
    }
}

/// Key for the rate limit map: (subject id, limit_type).
type LimitKey = (i64, RateLimitType);

/// Thread-safe in-memory rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<LimitKey, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<LimitKey, Vec<Instant>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one event for `subject` if it is within the limit.
    /// In local mode, rate limiting is always bypassed.
    pub fn check_limit(
        &self,
        subject: i64,
        limit_type: RateLimitType,
    ) -> Result<(), RateLimitError> {
        if crate::config::is_local_mode() {
            return Ok(());
        }
        let mut map = self.entries();
        let window = limit_type.window();
        let max = limit_type.max_count();
        let now = Instant::now();

        let entries = map.entry((subject, limit_type)).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            return Err(RateLimitError { limit_type, max });
        }

        entries.push(now);
        Ok(())
    }

    /// Current count inside the window (for diagnostics).
    pub fn current_count(&self, subject: i64, limit_type: RateLimitType) -> usize {
        let mut map = self.entries();
        let window = limit_type.window();
        let now = Instant::now();

        match map.get_mut(&(subject, limit_type)) {
            Some(entries) => {
                entries.retain(|t| now.duration_since(*t) < window);
                entries.len()
            }
            None => 0,
        }
    }

    /// Drop all windows for a subject, e.g. once a session is deleted.
    pub fn forget(&self, subject: i64, limit_type: RateLimitType) {
        self.entries().remove(&(subject, limit_type));
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
