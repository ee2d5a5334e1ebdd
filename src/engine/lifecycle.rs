// Session lifecycle state machine: draft -> ready -> live -> completed.
//
// Pure transition rules. The store applies each step as a compare-and-set on
// the session row, so two admins racing to launch or end a session cannot
// both succeed.

use serde::{Deserialize, Serialize};

use super::config::MIN_TEAMS;
use crate::error::GameError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Draft,
    Ready,
    Live,
    Completed,
}

impl SessionStatus {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "ready" => Some(Self::Ready),
            "live" => Some(Self::Live),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Live => "live",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    TeamBattle,
    Individual,
}

impl SessionType {
    pub fn from_str_name(s: &str) -> Option<Self> {
        match s {
            "team_battle" => Some(Self::TeamBattle),
            "individual" => Some(Self::Individual),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TeamBattle => "team_battle",
            Self::Individual => "individual",
        }
    }
}

/// Per-session tunables, stored as JSON on the session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSettings {
    #[serde(default = "default_speed_bonus")]
    pub speed_bonus: bool,
    /// Whole-session deadline, counted from launch.
    #[serde(default)]
    pub max_duration_secs: Option<i64>,
}

fn default_speed_bonus() -> bool {
    true
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            speed_bonus: true,
            max_duration_secs: None,
        }
    }
}

/// Admin-initiated status changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    MarkReady,
    BackToDraft,
    Launch,
    End,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::MarkReady => "mark_ready",
            Transition::BackToDraft => "back_to_draft",
            Transition::Launch => "launch",
            Transition::End => "end",
        }
    }
}

/// Actions gated by the session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Join,
    SubmitAnswer,
    ClaimTerritory,
    Edit,
    Delete,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Join => "join",
            Operation::SubmitAnswer => "submit_answer",
            Operation::ClaimTerritory => "claim_territory",
            Operation::Edit => "edit",
            Operation::Delete => "delete",
        }
    }

    pub fn allowed_in(&self, status: SessionStatus) -> bool {
        use SessionStatus::*;
        match self {
            Operation::Join => matches!(status, Ready | Live),
            Operation::SubmitAnswer | Operation::ClaimTerritory => status == Live,
            Operation::Edit => matches!(status, Draft | Ready),
            Operation::Delete => status != Live,
        }
    }
}

/// Fail with `InvalidSessionState` unless `op` is legal in `status`.
pub fn require(status: SessionStatus, op: Operation) -> Result<(), GameError> {
    if op.allowed_in(status) {
        Ok(())
    } else {
        Err(GameError::invalid_state(op.name(), status))
    }
}

/// The compare-and-set steps `(expected, next)` that carry out `transition`
/// from `current`. Launching from draft passes through ready so that no
/// recorded transition ever skips a state.
pub fn plan(
    current: SessionStatus,
    transition: Transition,
) -> Result<Vec<(SessionStatus, SessionStatus)>, GameError> {
    use SessionStatus::*;
    let steps = match (transition, current) {
        (Transition::MarkReady, Draft) => vec![(Draft, Ready)],
        (Transition::BackToDraft, Ready) => vec![(Ready, Draft)],
        (Transition::Launch, Draft) => vec![(Draft, Ready), (Ready, Live)],
        (Transition::Launch, Ready) => vec![(Ready, Live)],
        (Transition::End, Live) => vec![(Live, Completed)],
        _ => return Err(GameError::invalid_state(transition.name(), current)),
    };
    Ok(steps)
}

/// Whether `to` directly follows `from` in the lifecycle.
pub fn is_single_step(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Draft, Ready) | (Ready, Draft) | (Ready, Live) | (Live, Completed)
    )
}

/// Structural preconditions for going live.
pub fn check_launch(
    kind: SessionType,
    question_count: usize,
    team_count: usize,
) -> Result<(), GameError> {
    if question_count == 0 {
        return Err(GameError::validation(
            "questions",
            "at least one question is required to launch",
        ));
    }
    if kind == SessionType::TeamBattle && team_count < MIN_TEAMS {
        return Err(GameError::validation(
            "teams",
            format!("team battles need at least {MIN_TEAMS} teams"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionStatus::*;

    #[test]
    fn test_status_round_trip_names() {
        for s in [Draft, Ready, Live, Completed] {
            assert_eq!(SessionStatus::from_str_name(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::from_str_name("paused"), None);
    }

    #[test]
    fn test_plan_edits_between_draft_and_ready() {
        assert_eq!(plan(Draft, Transition::MarkReady).unwrap(), vec![(Draft, Ready)]);
        assert_eq!(plan(Ready, Transition::BackToDraft).unwrap(), vec![(Ready, Draft)]);
        assert!(plan(Live, Transition::BackToDraft).is_err());
        assert!(plan(Completed, Transition::MarkReady).is_err());
    }

    #[test]
    fn test_launch_from_draft_passes_through_ready() {
        let steps = plan(Draft, Transition::Launch).unwrap();
        assert_eq!(steps, vec![(Draft, Ready), (Ready, Live)]);
        for (from, to) in steps {
            assert!(is_single_step(from, to));
        }
    }

    #[test]
    fn test_end_only_from_live() {
        assert_eq!(plan(Live, Transition::End).unwrap(), vec![(Live, Completed)]);
        for s in [Draft, Ready, Completed] {
            let err = plan(s, Transition::End).unwrap_err();
            assert!(matches!(err, GameError::InvalidSessionState { .. }));
        }
    }

    #[test]
    fn test_no_backward_moves_from_live_or_completed() {
        for t in [
            Transition::MarkReady,
            Transition::BackToDraft,
            Transition::Launch,
        ] {
            assert!(plan(Live, t).is_err());
            assert!(plan(Completed, t).is_err());
        }
        assert!(!is_single_step(Live, Ready));
        assert!(!is_single_step(Completed, Live));
        assert!(!is_single_step(Draft, Live));
    }

    #[test]
    fn test_operation_gating() {
        assert!(require(Ready, Operation::Join).is_ok());
        assert!(require(Live, Operation::Join).is_ok());
        assert!(require(Draft, Operation::Join).is_err());
        assert!(require(Completed, Operation::Join).is_err());

        assert!(require(Live, Operation::SubmitAnswer).is_ok());
        assert!(require(Ready, Operation::SubmitAnswer).is_err());
        assert!(require(Ready, Operation::ClaimTerritory).is_err());

        assert!(require(Draft, Operation::Edit).is_ok());
        assert!(require(Live, Operation::Edit).is_err());
        assert!(require(Live, Operation::Delete).is_err());
        assert!(require(Completed, Operation::Delete).is_ok());
    }

    #[test]
    fn test_launch_preconditions() {
        assert!(check_launch(SessionType::Individual, 1, 0).is_ok());
        assert!(check_launch(SessionType::Individual, 0, 0).is_err());
        assert!(check_launch(SessionType::TeamBattle, 3, 1).is_err());
        assert!(check_launch(SessionType::TeamBattle, 3, 2).is_ok());
    }
}
