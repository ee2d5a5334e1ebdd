// Achievement evaluator. Rules are monotonic: a badge is unlocked at most
// once per player and never revoked. The store's insert-if-absent decides
// which of the returned ids were actually new.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::config::{
    SPEED_DEMON_THRESHOLD_MS, STREAK_THRESHOLDS, TERRITORY_CLAIMED_COUNT, TERRITORY_MASTER_COUNT,
};
use super::leaderboard::LeaderboardEntry;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Achievement {
    FirstAnswer,
    Streak3,
    Streak5,
    Streak10,
    TerritoryClaimed,
    TerritoryMaster,
    SpeedDemon,
    PerfectRound,
    Mvp,
}

impl Achievement {
    pub fn id(&self) -> &'static str {
        match self {
            Achievement::FirstAnswer => "first_answer",
            Achievement::Streak3 => "streak_3",
            Achievement::Streak5 => "streak_5",
            Achievement::Streak10 => "streak_10",
            Achievement::TerritoryClaimed => "territory_claimed",
            Achievement::TerritoryMaster => "territory_master",
            Achievement::SpeedDemon => "speed_demon",
            Achievement::PerfectRound => "perfect_round",
            Achievement::Mvp => "mvp",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "first_answer" => Some(Achievement::FirstAnswer),
            "streak_3" => Some(Achievement::Streak3),
            "streak_5" => Some(Achievement::Streak5),
            "streak_10" => Some(Achievement::Streak10),
            "territory_claimed" => Some(Achievement::TerritoryClaimed),
            "territory_master" => Some(Achievement::TerritoryMaster),
            "speed_demon" => Some(Achievement::SpeedDemon),
            "perfect_round" => Some(Achievement::PerfectRound),
            "mvp" => Some(Achievement::Mvp),
            _ => None,
        }
    }
}

/// The most recent scored answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastAnswer {
    pub correct: bool,
    pub response_ms: i64,
}

/// Cumulative player state after an event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    pub streak: i64,
    pub territories: i64,
    pub answered: i64,
    pub correct_answers: i64,
    pub total_questions: i64,
    pub last_answer: Option<LastAnswer>,
}

/// Per-event rules (everything except `mvp`). Returns badges the player
/// qualifies for and does not hold yet, in a stable order.
pub fn evaluate(progress: &Progress, unlocked: &HashSet<String>) -> Vec<Achievement> {
    let mut earned = Vec::new();

    if progress.correct_answers >= 1 {
        earned.push(Achievement::FirstAnswer);
    }
    for (threshold, id) in STREAK_THRESHOLDS {
        if progress.streak >= threshold {
            if let Some(a) = Achievement::from_id(id) {
                earned.push(a);
            }
        }
    }
    if progress.territories >= TERRITORY_CLAIMED_COUNT {
        earned.push(Achievement::TerritoryClaimed);
    }
    if progress.territories >= TERRITORY_MASTER_COUNT {
        earned.push(Achievement::TerritoryMaster);
    }
    if let Some(last) = progress.last_answer {
        if last.correct && last.response_ms < SPEED_DEMON_THRESHOLD_MS {
            earned.push(Achievement::SpeedDemon);
        }
    }
    if progress.total_questions > 0 && progress.correct_answers == progress.total_questions {
        earned.push(Achievement::PerfectRound);
    }

    earned.retain(|a| !unlocked.contains(a.id()));
    earned
}

/// Player holding the top score when the session completes. Nobody wins
/// with a score of zero.
pub fn mvp(final_board: &[LeaderboardEntry]) -> Option<i64> {
    final_board
        .iter()
        .find(|e| e.rank == 1)
        .filter(|e| e.score > 0)
        .map(|e| e.player_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::leaderboard::{rank, Standing};

    fn ids(list: &[Achievement]) -> Vec<&'static str> {
        list.iter().map(|a| a.id()).collect()
    }

    #[test]
    fn test_first_fast_correct_answer() {
        let progress = Progress {
            streak: 1,
            answered: 1,
            correct_answers: 1,
            total_questions: 3,
            last_answer: Some(LastAnswer {
                correct: true,
                response_ms: 2_000,
            }),
            ..Default::default()
        };
        let earned = evaluate(&progress, &HashSet::new());
        assert_eq!(ids(&earned), vec!["first_answer", "speed_demon"]);
    }

    #[test]
    fn test_incorrect_answer_earns_nothing() {
        let progress = Progress {
            answered: 1,
            total_questions: 1,
            last_answer: Some(LastAnswer {
                correct: false,
                response_ms: 500,
            }),
            ..Default::default()
        };
        assert!(evaluate(&progress, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_streaks_accumulate_and_are_not_repeated() {
        let mut unlocked: HashSet<String> = HashSet::new();
        let mut delivered = Vec::new();
        for streak in 1..=12 {
            let progress = Progress {
                streak,
                answered: streak,
                correct_answers: streak,
                total_questions: 20,
                last_answer: Some(LastAnswer {
                    correct: true,
                    response_ms: 10_000,
                }),
                ..Default::default()
            };
            for a in evaluate(&progress, &unlocked) {
                unlocked.insert(a.id().to_string());
                delivered.push(a.id());
            }
        }
        assert_eq!(delivered, vec!["first_answer", "streak_3", "streak_5", "streak_10"]);
    }

    #[test]
    fn test_territory_badges() {
        let mut progress = Progress {
            territories: 1,
            ..Default::default()
        };
        assert_eq!(ids(&evaluate(&progress, &HashSet::new())), vec!["territory_claimed"]);
        progress.territories = 5;
        let unlocked: HashSet<String> = ["territory_claimed".to_string()].into();
        assert_eq!(ids(&evaluate(&progress, &unlocked)), vec!["territory_master"]);
    }

    #[test]
    fn test_perfect_round() {
        let progress = Progress {
            streak: 2,
            answered: 2,
            correct_answers: 2,
            total_questions: 2,
            last_answer: Some(LastAnswer {
                correct: true,
                response_ms: 8_000,
            }),
            ..Default::default()
        };
        let earned = evaluate(&progress, &HashSet::new());
        assert!(earned.contains(&Achievement::PerfectRound));
    }

    #[test]
    fn test_mvp_requires_positive_score() {
        let s = |id, score| Standing {
            player_id: id,
            name: String::new(),
            team_id: None,
            score,
            score_reached_ms: 0,
            join_order: id,
            territories: 0,
            previous_rank: None,
        };
        assert_eq!(mvp(&rank(&[s(1, 10), s(2, 40)])), Some(2));
        assert_eq!(mvp(&rank(&[s(1, 0), s(2, 0)])), None);
        assert_eq!(mvp(&[]), None);
    }

    #[test]
    fn test_ids_round_trip() {
        for a in [
            Achievement::FirstAnswer,
            Achievement::Streak10,
            Achievement::TerritoryMaster,
            Achievement::Mvp,
        ] {
            assert_eq!(Achievement::from_id(a.id()), Some(a));
        }
    }
}
