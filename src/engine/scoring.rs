// Answer resolver: correctness, time bonus and streak for one submitted answer.
//
// Eligibility is decided on the server clock only. The client-reported
// elapsed time feeds the speed bonus and nothing else.

use serde::{Deserialize, Serialize};

use super::config::{ANSWER_GRACE_MS, FAST_RESPONSE_WINDOW_MS, SPEED_BONUS_MAX_PERCENT};
use crate::error::GameError;

/// The parts of a question that scoring needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionRules {
    pub correct_index: usize,
    pub option_count: usize,
    pub points: i64,
    pub time_limit_ms: Option<i64>,
}

/// When the question was shown and the answer arrived, both on the server clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnswerTiming {
    pub shown_at_ms: i64,
    pub received_at_ms: i64,
    pub client_elapsed_ms: Option<i64>,
}

impl AnswerTiming {
    pub fn server_elapsed_ms(&self) -> i64 {
        (self.received_at_ms - self.shown_at_ms).max(0)
    }

    /// Client elapsed clamped into `[0, server elapsed]`; server elapsed if absent.
    pub fn response_ms(&self) -> i64 {
        let server = self.server_elapsed_ms();
        match self.client_elapsed_ms {
            Some(client) => client.clamp(0, server),
            None => server,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Correct,
    Incorrect,
    Expired,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Correct => "correct",
            Verdict::Incorrect => "incorrect",
            Verdict::Expired => "expired",
        }
    }

    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(Verdict::Correct),
            "incorrect" => Some(Verdict::Incorrect),
            "expired" => Some(Verdict::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub verdict: Verdict,
    pub points_awarded: i64,
    pub response_ms: i64,
}

/// Result of a scored answer as reported to the player.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoringOutcome {
    pub correct: bool,
    pub points_awarded: i64,
    pub new_streak: i64,
    pub new_score: i64,
    /// Achievements unlocked by this answer.
    pub achievements: Vec<String>,
}

/// Whether `timing` falls after the question's deadline (plus grace).
pub fn window_closed(time_limit_ms: Option<i64>, shown_at_ms: i64, now_ms: i64) -> bool {
    match time_limit_ms {
        Some(limit) => now_ms > shown_at_ms + limit + ANSWER_GRACE_MS,
        None => false,
    }
}

/// Linear bonus of up to `SPEED_BONUS_MAX_PERCENT` of the base points for
/// answers inside the fast-response window.
pub fn speed_bonus(points: i64, response_ms: i64) -> i64 {
    if response_ms >= FAST_RESPONSE_WINDOW_MS {
        return 0;
    }
    let remaining = FAST_RESPONSE_WINDOW_MS - response_ms.max(0);
    points * SPEED_BONUS_MAX_PERCENT * remaining / (100 * FAST_RESPONSE_WINDOW_MS)
}

pub fn next_streak(previous: i64, verdict: Verdict) -> i64 {
    match verdict {
        Verdict::Correct => previous + 1,
        Verdict::Incorrect | Verdict::Expired => 0,
    }
}

/// Score one answer. A late answer resolves to `Verdict::Expired` so the
/// caller can record it before reporting `AnswerWindowClosed`.
pub fn resolve(
    rules: &QuestionRules,
    selected: usize,
    timing: &AnswerTiming,
    speed_bonus_enabled: bool,
) -> Result<Resolution, GameError> {
    if selected >= rules.option_count {
        return Err(GameError::validation(
            "option_index",
            format!("must be below {}", rules.option_count),
        ));
    }
    let response_ms = timing.response_ms();

    if window_closed(rules.time_limit_ms, timing.shown_at_ms, timing.received_at_ms) {
        return Ok(Resolution {
            verdict: Verdict::Expired,
            points_awarded: 0,
            response_ms,
        });
    }

    if selected != rules.correct_index {
        return Ok(Resolution {
            verdict: Verdict::Incorrect,
            points_awarded: 0,
            response_ms,
        });
    }

    let bonus = if speed_bonus_enabled {
        speed_bonus(rules.points, response_ms)
    } else {
        0
    };
    Ok(Resolution {
        verdict: Verdict::Correct,
        points_awarded: rules.points + bonus,
        response_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> QuestionRules {
        QuestionRules {
            correct_index: 1,
            option_count: 4,
            points: 100,
            time_limit_ms: Some(10_000),
        }
    }

    fn at(elapsed: i64) -> AnswerTiming {
        AnswerTiming {
            shown_at_ms: 1_000,
            received_at_ms: 1_000 + elapsed,
            client_elapsed_ms: None,
        }
    }

    #[test]
    fn test_correct_answer_with_speed_bonus() {
        let r = resolve(&rules(), 1, &at(2_000), true).unwrap();
        assert_eq!(r.verdict, Verdict::Correct);
        // 100 * 50% * (3000 - 2000) / 3000 = 16
        assert_eq!(r.points_awarded, 116);
        assert_eq!(r.response_ms, 2_000);
    }

    #[test]
    fn test_correct_answer_without_bonus() {
        let r = resolve(&rules(), 1, &at(2_000), false).unwrap();
        assert_eq!(r.points_awarded, 100);
        let slow = resolve(&rules(), 1, &at(5_000), true).unwrap();
        assert_eq!(slow.points_awarded, 100);
    }

    #[test]
    fn test_speed_bonus_curve() {
        assert_eq!(speed_bonus(100, 0), 50);
        assert_eq!(speed_bonus(100, 1_500), 25);
        assert_eq!(speed_bonus(100, 2_999), 0);
        assert_eq!(speed_bonus(100, 3_000), 0);
        assert_eq!(speed_bonus(300, 0), 150);
    }

    #[test]
    fn test_incorrect_answer_scores_zero() {
        let r = resolve(&rules(), 0, &at(1_000), true).unwrap();
        assert_eq!(r.verdict, Verdict::Incorrect);
        assert_eq!(r.points_awarded, 0);
    }

    #[test]
    fn test_late_answer_expires_even_if_correct() {
        let r = resolve(&rules(), 1, &at(10_000 + ANSWER_GRACE_MS + 1), true).unwrap();
        assert_eq!(r.verdict, Verdict::Expired);
        assert_eq!(r.points_awarded, 0);

        let within_grace = resolve(&rules(), 1, &at(10_000 + ANSWER_GRACE_MS), true).unwrap();
        assert_eq!(within_grace.verdict, Verdict::Correct);
    }

    #[test]
    fn test_no_time_limit_never_expires() {
        let mut untimed = rules();
        untimed.time_limit_ms = None;
        let r = resolve(&untimed, 1, &at(3_600_000), true).unwrap();
        assert_eq!(r.verdict, Verdict::Correct);
    }

    #[test]
    fn test_option_out_of_range() {
        let err = resolve(&rules(), 4, &at(100), true).unwrap_err();
        assert!(matches!(err, GameError::ValidationFailed { ref field, .. } if field == "option_index"));
    }

    #[test]
    fn test_client_elapsed_is_clamped_to_server_elapsed() {
        let mut timing = at(2_000);
        timing.client_elapsed_ms = Some(500);
        assert_eq!(timing.response_ms(), 500);
        timing.client_elapsed_ms = Some(9_000);
        assert_eq!(timing.response_ms(), 2_000);
        timing.client_elapsed_ms = Some(-50);
        assert_eq!(timing.response_ms(), 0);
    }

    #[test]
    fn test_client_time_never_reopens_window() {
        let mut timing = at(20_000);
        timing.client_elapsed_ms = Some(1_000);
        let r = resolve(&rules(), 1, &timing, true).unwrap();
        assert_eq!(r.verdict, Verdict::Expired);
    }

    #[test]
    fn test_streak_updates() {
        assert_eq!(next_streak(2, Verdict::Correct), 3);
        assert_eq!(next_streak(7, Verdict::Incorrect), 0);
        assert_eq!(next_streak(7, Verdict::Expired), 0);
    }
}
