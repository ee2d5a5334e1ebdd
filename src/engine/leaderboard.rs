// Leaderboard ranker: ordered standings with rank deltas.
//
// Pure and idempotent. Ordering is score descending, then earliest time to
// reach that score, then join order.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Ranking input for one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub player_id: i64,
    pub name: String,
    pub team_id: Option<i64>,
    pub score: i64,
    /// Elapsed ms from launch at which the current score was reached.
    pub score_reached_ms: i64,
    pub join_order: i64,
    pub territories: i64,
    /// Rank from the last published leaderboard, if any.
    pub previous_rank: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RankDelta {
    NewEntrant,
    Up,
    Down,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub player_id: i64,
    pub name: String,
    pub team_id: Option<i64>,
    pub score: i64,
    pub territories: i64,
    pub rank: i64,
    pub previous_rank: Option<i64>,
    pub delta: RankDelta,
}

fn compare(a: &Standing, b: &Standing) -> Ordering {
    b.score
        .cmp(&a.score)
        .then(a.score_reached_ms.cmp(&b.score_reached_ms))
        .then(a.join_order.cmp(&b.join_order))
}

fn delta(previous: Option<i64>, rank: i64) -> RankDelta {
    match previous {
        None => RankDelta::NewEntrant,
        Some(p) if rank < p => RankDelta::Up,
        Some(p) if rank > p => RankDelta::Down,
        Some(_) => RankDelta::Unchanged,
    }
}

/// Rank every player. Ranks are 1-based positions.
pub fn rank(players: &[Standing]) -> Vec<LeaderboardEntry> {
    let mut sorted: Vec<&Standing> = players.iter().collect();
    sorted.sort_by(|a, b| compare(a, b));
    sorted
        .into_iter()
        .enumerate()
        .map(|(i, s)| {
            let rank = i as i64 + 1;
            LeaderboardEntry {
                player_id: s.player_id,
                name: s.name.clone(),
                team_id: s.team_id,
                score: s.score,
                territories: s.territories,
                rank,
                previous_rank: s.previous_rank,
                delta: delta(s.previous_rank, rank),
            }
        })
        .collect()
}

/// Aggregate standing of one team in a team battle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamStanding {
    pub team_id: i64,
    pub name: String,
    pub score: i64,
    pub territories: i64,
    pub members: i64,
    pub rank: i64,
}

/// Teams ordered by territories held, then total score, then team id.
pub fn team_standings(teams: &[(i64, String)], entries: &[LeaderboardEntry]) -> Vec<TeamStanding> {
    let mut totals: HashMap<i64, (i64, i64, i64)> = HashMap::new();
    for e in entries {
        if let Some(team) = e.team_id {
            let t = totals.entry(team).or_default();
            t.0 += e.score;
            t.1 += e.territories;
            t.2 += 1;
        }
    }
    let mut standings: Vec<TeamStanding> = teams
        .iter()
        .map(|(id, name)| {
            let (score, territories, members) = totals.get(id).copied().unwrap_or_default();
            TeamStanding {
                team_id: *id,
                name: name.clone(),
                score,
                territories,
                members,
                rank: 0,
            }
        })
        .collect();
    standings.sort_by(|a, b| {
        b.territories
            .cmp(&a.territories)
            .then(b.score.cmp(&a.score))
            .then(a.team_id.cmp(&b.team_id))
    });
    for (i, s) in standings.iter_mut().enumerate() {
        s.rank = i as i64 + 1;
    }
    standings
}
