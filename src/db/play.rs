// Player-side store operations: joins, question views, answers, territory
// claims and achievements.

use serde::Serialize;

use super::Database;
use crate::engine::registration::TeamLoad;
use crate::engine::scoring::Verdict;
use crate::engine::territory::{ClaimCredit, Coordinate};
use crate::error::is_unique_violation;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Player {
    pub id: i64,
    pub session_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub organization: Option<String>,
    /// JSON object of custom field values.
    #[serde(skip)]
    pub custom: String,
    pub team_id: Option<i64>,
    pub score: i64,
    pub streak: i64,
    pub score_reached_ms: i64,
    pub last_rank: Option<i64>,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Answer {
    pub id: i64,
    pub player_id: i64,
    pub question_id: i64,
    pub selected_index: Option<i64>,
    pub outcome: String,
    pub points: i64,
    pub response_ms: i64,
    pub claimed_territory_id: Option<i64>,
    pub answered_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Territory {
    pub id: i64,
    pub session_id: i64,
    pub map_row: i64,
    pub map_col: i64,
    pub label: String,
    pub owner_team_id: Option<i64>,
    pub owner_player_id: Option<i64>,
    pub claimed_at_ms: Option<i64>,
}

impl Territory {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            row: self.map_row,
            col: self.map_col,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPlayer<'a> {
    pub name: &'a str,
    pub email: Option<&'a str>,
    pub organization: Option<&'a str>,
    pub custom: String,
    pub team_id: Option<i64>,
    pub token_hash: &'a str,
}

/// A resolved answer to be written with its score update.
#[derive(Debug, Clone, Copy)]
pub struct AnswerRecord {
    pub player_id: i64,
    pub question_id: i64,
    pub selected_index: Option<i64>,
    pub verdict: Verdict,
    pub points: i64,
    pub response_ms: i64,
    pub answered_at_ms: i64,
    /// Elapsed time since launch, used as the leaderboard tie-breaker.
    pub elapsed_since_launch_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerCommit {
    Scored { score: i64, streak: i64 },
    Duplicate,
    SessionClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimRecord {
    pub session_id: i64,
    pub territory_id: i64,
    pub player_id: i64,
    pub team_id: i64,
    pub question_id: i64,
    pub claimed_at_ms: i64,
}

#[derive(Debug, Clone)]
pub enum ClaimCommit {
    Claimed(Territory),
    /// The territory was taken, missing, or the session is no longer live.
    Rejected,
    /// The funding answer was spent by a concurrent claim.
    CreditSpent,
}

/// Where one player stands on a given question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct ViewProgress {
    pub player_id: i64,
    pub answered: bool,
    pub shown_at_ms: Option<i64>,
}

const PLAYER_COLUMNS: &str = "id, session_id, name, email, organization, custom, team_id, score, streak, score_reached_ms, last_rank, joined_at";
const ANSWER_COLUMNS: &str = "id, player_id, question_id, selected_index, outcome, points, response_ms, claimed_territory_id, answered_at_ms";
const TERRITORY_COLUMNS: &str =
    "id, session_id, map_row, map_col, label, owner_team_id, owner_player_id, claimed_at_ms";

impl Database {
    // ── Players ───────────────────────────────────────────────────────

    /// Insert a player if the session is still joinable. `None` when it is
    /// not; a name clash surfaces as a UNIQUE violation.
    pub async fn insert_player(
        &self,
        session_id: i64,
        new: &NewPlayer<'_>,
    ) -> Result<Option<Player>, sqlx::Error> {
        let sql = format!(
            "INSERT INTO players (session_id, name, email, organization, custom, team_id, token_hash) \
             SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ? AND status IN ('ready', 'live')) \
             RETURNING {PLAYER_COLUMNS}"
        );
        sqlx::query_as::<_, Player>(&sql)
            .bind(session_id)
            .bind(new.name)
            .bind(new.email)
            .bind(new.organization)
            .bind(&new.custom)
            .bind(new.team_id)
            .bind(new.token_hash)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_player(&self, id: i64) -> Result<Option<Player>, sqlx::Error> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE id = ?");
        sqlx::query_as::<_, Player>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_player_by_token_hash(&self, token_hash: &str) -> Result<Option<Player>, sqlx::Error> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE token_hash = ?");
        sqlx::query_as::<_, Player>(&sql)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_players(&self, session_id: i64) -> Result<Vec<Player>, sqlx::Error> {
        let sql = format!("SELECT {PLAYER_COLUMNS} FROM players WHERE session_id = ? ORDER BY id");
        sqlx::query_as::<_, Player>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn count_players(&self, session_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM players WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Head-count per team, including empty teams.
    pub async fn team_loads(&self, session_id: i64) -> Result<Vec<TeamLoad>, sqlx::Error> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT t.id, COUNT(p.id) FROM teams t LEFT JOIN players p ON p.team_id = t.id \
             WHERE t.session_id = ? GROUP BY t.id ORDER BY t.id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(team_id, players)| TeamLoad { team_id, players })
            .collect())
    }

    // ── Question views ────────────────────────────────────────────────

    /// Record the first time a player saw a question and return that time.
    /// Re-fetching the question never restarts its clock.
    pub async fn record_view(
        &self,
        player_id: i64,
        question_id: i64,
        now_ms: i64,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query("INSERT OR IGNORE INTO question_views (player_id, question_id, shown_at_ms) VALUES (?, ?, ?)")
            .bind(player_id)
            .bind(question_id)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        sqlx::query_scalar("SELECT shown_at_ms FROM question_views WHERE player_id = ? AND question_id = ?")
            .bind(player_id)
            .bind(question_id)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_view(&self, player_id: i64, question_id: i64) -> Result<Option<i64>, sqlx::Error> {
        sqlx::query_scalar("SELECT shown_at_ms FROM question_views WHERE player_id = ? AND question_id = ?")
            .bind(player_id)
            .bind(question_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Every player's progress on one question.
    pub async fn question_progress(
        &self,
        session_id: i64,
        question_id: i64,
    ) -> Result<Vec<ViewProgress>, sqlx::Error> {
        sqlx::query_as::<_, ViewProgress>(
            "SELECT p.id AS player_id, \
             EXISTS (SELECT 1 FROM answers a WHERE a.player_id = p.id AND a.question_id = ?) AS answered, \
             v.shown_at_ms \
             FROM players p \
             LEFT JOIN question_views v ON v.player_id = p.id AND v.question_id = ? \
             WHERE p.session_id = ? ORDER BY p.id",
        )
        .bind(question_id)
        .bind(question_id)
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
    }

    // ── Answers ───────────────────────────────────────────────────────

    /// Store an answer and apply its score and streak in one transaction.
    /// The insert is guarded on the session being live; the UNIQUE
    /// (player, question) key turns a second submission into `Duplicate`.
    pub async fn commit_answer(
        &self,
        session_id: i64,
        record: &AnswerRecord,
    ) -> Result<AnswerCommit, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO answers (player_id, question_id, selected_index, outcome, points, response_ms, answered_at_ms) \
             SELECT ?, ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ? AND status = 'live')",
        )
        .bind(record.player_id)
        .bind(record.question_id)
        .bind(record.selected_index)
        .bind(record.verdict.as_str())
        .bind(record.points)
        .bind(record.response_ms)
        .bind(record.answered_at_ms)
        .bind(session_id)
        .execute(&mut *tx)
        .await;

        let inserted = match inserted {
            Ok(r) => r,
            Err(e) if is_unique_violation(&e) => return Ok(AnswerCommit::Duplicate),
            Err(e) => return Err(e),
        };
        if inserted.rows_affected() == 0 {
            return Ok(AnswerCommit::SessionClosed);
        }

        let correct = record.verdict == Verdict::Correct;
        let (score, streak): (i64, i64) = sqlx::query_as(
            "UPDATE players SET \
             score = score + ?, \
             streak = CASE WHEN ? THEN streak + 1 ELSE 0 END, \
             score_reached_ms = CASE WHEN ? > 0 THEN ? ELSE score_reached_ms END \
             WHERE id = ? RETURNING score, streak",
        )
        .bind(record.points)
        .bind(correct)
        .bind(record.points)
        .bind(record.elapsed_since_launch_ms)
        .bind(record.player_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(AnswerCommit::Scored { score, streak })
    }

    pub async fn get_answer(&self, player_id: i64, question_id: i64) -> Result<Option<Answer>, sqlx::Error> {
        let sql = format!("SELECT {ANSWER_COLUMNS} FROM answers WHERE player_id = ? AND question_id = ?");
        sqlx::query_as::<_, Answer>(&sql)
            .bind(player_id)
            .bind(question_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_answers(&self, player_id: i64) -> Result<Vec<Answer>, sqlx::Error> {
        let sql = format!("SELECT {ANSWER_COLUMNS} FROM answers WHERE player_id = ? ORDER BY id");
        sqlx::query_as::<_, Answer>(&sql)
            .bind(player_id)
            .fetch_all(&self.pool)
            .await
    }

    /// (answered, correct) counts for one player.
    pub async fn answer_counts(&self, player_id: i64) -> Result<(i64, i64), sqlx::Error> {
        sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(outcome = 'correct'), 0) FROM answers WHERE player_id = ?",
        )
        .bind(player_id)
        .fetch_one(&self.pool)
        .await
    }

    /// Correct answers that have not paid for a claim yet, oldest first.
    pub async fn unspent_credits(&self, player_id: i64) -> Result<Vec<ClaimCredit>, sqlx::Error> {
        let rows: Vec<(i64, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT a.question_id, q.map_row, q.map_col FROM answers a \
             JOIN questions q ON q.id = a.question_id \
             WHERE a.player_id = ? AND a.outcome = 'correct' AND a.claimed_territory_id IS NULL \
             ORDER BY a.id",
        )
        .bind(player_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(question_id, row, col)| ClaimCredit {
                question_id,
                coordinate: match (row, col) {
                    (Some(row), Some(col)) => Some(Coordinate { row, col }),
                    _ => None,
                },
            })
            .collect())
    }

    // ── Territories ───────────────────────────────────────────────────

    pub async fn list_territories(&self, session_id: i64) -> Result<Vec<Territory>, sqlx::Error> {
        let sql = format!("SELECT {TERRITORY_COLUMNS} FROM territories WHERE session_id = ? ORDER BY map_row, map_col");
        sqlx::query_as::<_, Territory>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_territory(&self, session_id: i64, id: i64) -> Result<Option<Territory>, sqlx::Error> {
        let sql = format!("SELECT {TERRITORY_COLUMNS} FROM territories WHERE session_id = ? AND id = ?");
        sqlx::query_as::<_, Territory>(&sql)
            .bind(session_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn territories_held(&self, player_id: i64) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar("SELECT COUNT(*) FROM territories WHERE owner_player_id = ?")
            .bind(player_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Take an unclaimed territory and spend the funding answer atomically.
    /// Exactly one of any number of concurrent claims on a cell succeeds.
    pub async fn claim_territory(&self, claim: &ClaimRecord) -> Result<ClaimCommit, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "UPDATE territories SET owner_team_id = ?, owner_player_id = ?, claimed_at_ms = ? \
             WHERE id = ? AND session_id = ? AND owner_team_id IS NULL \
             AND EXISTS (SELECT 1 FROM sessions WHERE id = ? AND status = 'live') \
             RETURNING {TERRITORY_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, Territory>(&sql)
            .bind(claim.team_id)
            .bind(claim.player_id)
            .bind(claim.claimed_at_ms)
            .bind(claim.territory_id)
            .bind(claim.session_id)
            .bind(claim.session_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(territory) = claimed else {
            return Ok(ClaimCommit::Rejected);
        };

        let spent = sqlx::query(
            "UPDATE answers SET claimed_territory_id = ? \
             WHERE player_id = ? AND question_id = ? AND outcome = 'correct' AND claimed_territory_id IS NULL",
        )
        .bind(territory.id)
        .bind(claim.player_id)
        .bind(claim.question_id)
        .execute(&mut *tx)
        .await?;
        if spent.rows_affected() == 0 {
            return Ok(ClaimCommit::CreditSpent);
        }

        tx.commit().await?;
        Ok(ClaimCommit::Claimed(territory))
    }

    // ── Achievements ──────────────────────────────────────────────────

    pub async fn list_achievements(&self, player_id: i64) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar("SELECT achievement FROM player_achievements WHERE player_id = ? ORDER BY unlocked_at, achievement")
            .bind(player_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Insert-if-absent each achievement; returns only those that were new.
    pub async fn unlock_achievements(
        &self,
        player_id: i64,
        ids: &[&str],
    ) -> Result<Vec<String>, sqlx::Error> {
        let mut unlocked = Vec::new();
        for id in ids {
            let result = sqlx::query("INSERT OR IGNORE INTO player_achievements (player_id, achievement) VALUES (?, ?)")
                .bind(player_id)
                .bind(*id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 1 {
                unlocked.push(id.to_string());
            }
        }
        Ok(unlocked)
    }
}
