// Session store (SQLite via sqlx).
//
// Every write that depends on session state is a conditional statement on the
// session row, so the first writer wins and late writers match no rows.
// Transactions always open with their write so SQLite takes the write lock
// before anything is read.

mod play;

pub use play::{
    Answer, AnswerCommit, AnswerRecord, ClaimCommit, ClaimRecord, NewPlayer, Player, Territory,
    ViewProgress,
};

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::engine::config::MIN_TEAMS;
use crate::engine::lifecycle::{SessionSettings, SessionStatus, SessionType};
use crate::engine::registration::{default_fields, RegistrationField};
use crate::engine::scoring::QuestionRules;
use crate::engine::territory::Coordinate;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub display_name: Option<String>,
    pub role: String,
    pub created_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: String,
    pub kind: String,
    pub status: String,
    pub pin: String,
    pub settings: String,
    pub fields: String,
    pub map_rows: i64,
    pub map_cols: i64,
    pub launched_at_ms: Option<i64>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    /// Unknown values are treated as completed so nothing can mutate the row.
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_str_name(&self.status).unwrap_or(SessionStatus::Completed)
    }

    pub fn kind(&self) -> SessionType {
        SessionType::from_str_name(&self.kind).unwrap_or(SessionType::Individual)
    }

    pub fn settings(&self) -> SessionSettings {
        serde_json::from_str(&self.settings).unwrap_or_default()
    }

    pub fn fields(&self) -> Vec<RegistrationField> {
        serde_json::from_str(&self.fields).unwrap_or_else(|_| default_fields())
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Question {
    pub id: i64,
    pub session_id: i64,
    pub position: i64,
    pub prompt: String,
    pub options: String,
    pub correct_index: i64,
    pub time_limit_secs: Option<i64>,
    pub points: i64,
    pub map_row: Option<i64>,
    pub map_col: Option<i64>,
}

impl Question {
    pub fn options(&self) -> Vec<String> {
        serde_json::from_str(&self.options).unwrap_or_default()
    }

    pub fn coordinate(&self) -> Option<Coordinate> {
        match (self.map_row, self.map_col) {
            (Some(row), Some(col)) => Some(Coordinate { row, col }),
            _ => None,
        }
    }

    pub fn rules(&self) -> QuestionRules {
        QuestionRules {
            correct_index: self.correct_index.max(0) as usize,
            option_count: self.options().len(),
            points: self.points,
            time_limit_ms: self.time_limit_secs.map(|s| s * 1000),
        }
    }
}

/// A validated question ready to be stored.
#[derive(Debug, Clone)]
pub struct NewQuestion {
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_index: i64,
    pub time_limit_secs: Option<i64>,
    pub points: i64,
    pub coordinate: Option<Coordinate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Team {
    pub id: i64,
    pub session_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionHistory {
    pub id: i64,
    pub session_id: i64,
    pub from_status: Option<String>,
    pub to_status: String,
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
    pub created_at: String,
}

/// Everything needed to insert a session row.
#[derive(Debug, Clone)]
pub struct NewSession<'a> {
    pub owner_id: i64,
    pub name: &'a str,
    pub description: &'a str,
    pub kind: SessionType,
    pub pin: &'a str,
    pub settings: &'a SessionSettings,
    pub fields: &'a [RegistrationField],
    pub map_rows: i64,
    pub map_cols: i64,
}

/// Side effects computed from the final standings while a session completes.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub mvp_player_id: Option<i64>,
    pub snapshot: Option<Vec<u8>>,
}

/// A player's ranking inputs as read from the store.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StandingRow {
    pub player_id: i64,
    pub name: String,
    pub team_id: Option<i64>,
    pub score: i64,
    pub score_reached_ms: i64,
    pub last_rank: Option<i64>,
    pub territories: i64,
}

const SESSION_COLUMNS: &str = "id, owner_id, name, description, kind, status, pin, settings, fields, map_rows, map_cols, launched_at_ms, completed_at, created_at, updated_at";
const QUESTION_COLUMNS: &str =
    "id, session_id, position, prompt, options, correct_index, time_limit_secs, points, map_row, map_col";
const USER_COLUMNS: &str = "id, username, email, password_hash, display_name, role, created_at";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL UNIQUE,
        email TEXT NOT NULL UNIQUE,
        password_hash TEXT,
        display_name TEXT,
        role TEXT NOT NULL DEFAULT 'admin',
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL REFERENCES users(id),
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        kind TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        pin TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '{}',
        fields TEXT NOT NULL DEFAULT '[]',
        map_rows INTEGER NOT NULL DEFAULT 0,
        map_cols INTEGER NOT NULL DEFAULT 0,
        launched_at_ms INTEGER,
        completed_at TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    // PINs may be reused once a session has completed.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active_pin ON sessions(pin) WHERE status != 'completed'",
    r#"
    CREATE TABLE IF NOT EXISTS questions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        prompt TEXT NOT NULL,
        options TEXT NOT NULL,
        correct_index INTEGER NOT NULL,
        time_limit_secs INTEGER,
        points INTEGER NOT NULL,
        map_row INTEGER,
        map_col INTEGER,
        UNIQUE(session_id, position)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teams (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        name TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS players (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        email TEXT,
        organization TEXT,
        custom TEXT NOT NULL DEFAULT '{}',
        team_id INTEGER REFERENCES teams(id) ON DELETE SET NULL,
        token_hash TEXT NOT NULL UNIQUE,
        score INTEGER NOT NULL DEFAULT 0,
        streak INTEGER NOT NULL DEFAULT 0,
        score_reached_ms INTEGER NOT NULL DEFAULT 0,
        last_rank INTEGER,
        joined_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_players_session_name ON players(session_id, name COLLATE NOCASE)",
    r#"
    CREATE TABLE IF NOT EXISTS territories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        map_row INTEGER NOT NULL,
        map_col INTEGER NOT NULL,
        label TEXT NOT NULL,
        owner_team_id INTEGER REFERENCES teams(id) ON DELETE SET NULL,
        owner_player_id INTEGER REFERENCES players(id) ON DELETE SET NULL,
        claimed_at_ms INTEGER,
        UNIQUE(session_id, map_row, map_col)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS question_views (
        player_id INTEGER NOT NULL REFERENCES players(id) ON DELETE CASCADE,
        question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
        shown_at_ms INTEGER NOT NULL,
        PRIMARY KEY (player_id, question_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS answers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        player_id INTEGER NOT NULL REFERENCES players(id) ON DELETE CASCADE,
        question_id INTEGER NOT NULL REFERENCES questions(id) ON DELETE CASCADE,
        selected_index INTEGER,
        outcome TEXT NOT NULL,
        points INTEGER NOT NULL DEFAULT 0,
        response_ms INTEGER NOT NULL DEFAULT 0,
        claimed_territory_id INTEGER REFERENCES territories(id) ON DELETE SET NULL,
        answered_at_ms INTEGER NOT NULL,
        UNIQUE(player_id, question_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS player_achievements (
        player_id INTEGER NOT NULL REFERENCES players(id) ON DELETE CASCADE,
        achievement TEXT NOT NULL,
        unlocked_at TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (player_id, achievement)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        from_status TEXT,
        to_status TEXT NOT NULL,
        snapshot BLOB,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
];

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // Each in-memory connection is its own database, so keep exactly one alive.
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(options)
                .await?
        };
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), sqlx::Error> {
        for statement in MIGRATIONS {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ── Users ─────────────────────────────────────────────────────────

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        display_name: &str,
    ) -> Result<User, sqlx::Error> {
        let sql = format!(
            "INSERT INTO users (username, email, password_hash, display_name) VALUES (?, ?, ?, ?) RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .bind(email)
            .bind(password_hash)
            .bind(display_name)
            .fetch_one(&self.pool)
            .await
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, sqlx::Error> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?");
        sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await
    }

    /// Create the passwordless admin used in local mode, if missing.
    pub async fn ensure_local_user(&self, id: i64, username: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO users (id, username, email, display_name) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(username)
        .bind(format!("{username}@localhost"))
        .bind(username)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Sessions ──────────────────────────────────────────────────────

    /// Insert a draft session and its territory grid. A PIN clash with another
    /// non-completed session surfaces as a UNIQUE violation.
    pub async fn create_session(
        &self,
        new: &NewSession<'_>,
        cells: &[(Coordinate, String)],
    ) -> Result<Session, sqlx::Error> {
        let settings = serde_json::to_string(new.settings).unwrap_or_else(|_| "{}".to_string());
        let fields = serde_json::to_string(new.fields).unwrap_or_else(|_| "[]".to_string());

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO sessions (owner_id, name, description, kind, pin, settings, fields, map_rows, map_cols) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {SESSION_COLUMNS}"
        );
        let session = sqlx::query_as::<_, Session>(&sql)
            .bind(new.owner_id)
            .bind(new.name)
            .bind(new.description)
            .bind(new.kind.as_str())
            .bind(new.pin)
            .bind(&settings)
            .bind(&fields)
            .bind(new.map_rows)
            .bind(new.map_cols)
            .fetch_one(&mut *tx)
            .await?;
        insert_cells(&mut tx, session.id, cells).await?;
        append_history(&mut tx, session.id, None, SessionStatus::Draft, None).await?;
        tx.commit().await?;
        Ok(session)
    }

    pub async fn get_session(&self, id: i64) -> Result<Option<Session>, sqlx::Error> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        sqlx::query_as::<_, Session>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// The active session using `pin`, or else the most recent completed one.
    pub async fn get_session_by_pin(&self, pin: &str) -> Result<Option<Session>, sqlx::Error> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE pin = ? \
             ORDER BY status = 'completed', id DESC LIMIT 1"
        );
        sqlx::query_as::<_, Session>(&sql)
            .bind(pin)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn list_sessions(&self, owner_id: i64) -> Result<Vec<Session>, sqlx::Error> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE owner_id = ? ORDER BY id DESC");
        sqlx::query_as::<_, Session>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn list_live_sessions(&self) -> Result<Vec<Session>, sqlx::Error> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE status = 'live' ORDER BY id");
        sqlx::query_as::<_, Session>(&sql).fetch_all(&self.pool).await
    }

    /// Update name, description and settings. `None` if the session is not editable.
    pub async fn update_session_details(
        &self,
        id: i64,
        name: &str,
        description: &str,
        settings: &SessionSettings,
    ) -> Result<Option<Session>, sqlx::Error> {
        let settings = serde_json::to_string(settings).unwrap_or_else(|_| "{}".to_string());
        let result = sqlx::query(
            "UPDATE sessions SET name = ?, description = ?, settings = ?, updated_at = datetime('now') \
             WHERE id = ? AND status IN ('draft', 'ready')",
        )
        .bind(name)
        .bind(description)
        .bind(settings)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_session(id).await
    }

    pub async fn set_fields(
        &self,
        id: i64,
        fields: &[RegistrationField],
    ) -> Result<bool, sqlx::Error> {
        let fields = serde_json::to_string(fields).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "UPDATE sessions SET fields = ?, updated_at = datetime('now') \
             WHERE id = ? AND status IN ('draft', 'ready')",
        )
        .bind(fields)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a session that is not live. Children go with it.
    pub async fn delete_session(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ? AND status != 'live'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Questions, teams and map ──────────────────────────────────────

    pub async fn list_questions(&self, session_id: i64) -> Result<Vec<Question>, sqlx::Error> {
        let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE session_id = ? ORDER BY position");
        sqlx::query_as::<_, Question>(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
    }

    pub async fn get_question(&self, session_id: i64, id: i64) -> Result<Option<Question>, sqlx::Error> {
        let sql = format!("SELECT {QUESTION_COLUMNS} FROM questions WHERE session_id = ? AND id = ?");
        sqlx::query_as::<_, Question>(&sql)
            .bind(session_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Replace the whole question list. `None` if the session is not editable.
    pub async fn replace_questions(
        &self,
        session_id: i64,
        questions: &[NewQuestion],
    ) -> Result<Option<Vec<Question>>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        if !touch_editable(&mut tx, session_id).await? {
            return Ok(None);
        }
        sqlx::query("DELETE FROM questions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "INSERT INTO questions (session_id, position, prompt, options, correct_index, time_limit_secs, points, map_row, map_col) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {QUESTION_COLUMNS}"
        );
        let mut stored = Vec::with_capacity(questions.len());
        for (position, q) in questions.iter().enumerate() {
            let options = serde_json::to_string(&q.options).unwrap_or_else(|_| "[]".to_string());
            let row = sqlx::query_as::<_, Question>(&sql)
                .bind(session_id)
                .bind(position as i64)
                .bind(&q.prompt)
                .bind(options)
                .bind(q.correct_index)
                .bind(q.time_limit_secs)
                .bind(q.points)
                .bind(q.coordinate.map(|c| c.row))
                .bind(q.coordinate.map(|c| c.col))
                .fetch_one(&mut *tx)
                .await?;
            stored.push(row);
        }
        tx.commit().await?;
        Ok(Some(stored))
    }

    pub async fn list_teams(&self, session_id: i64) -> Result<Vec<Team>, sqlx::Error> {
        sqlx::query_as::<_, Team>("SELECT id, session_id, name FROM teams WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
    }

    /// Replace the team list. `None` if the session is not editable or
    /// players have already been assigned to the current teams.
    pub async fn replace_teams(
        &self,
        session_id: i64,
        names: &[String],
    ) -> Result<Option<Vec<Team>>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE sessions SET updated_at = datetime('now') \
             WHERE id = ? AND status IN ('draft', 'ready') \
             AND NOT EXISTS (SELECT 1 FROM players WHERE session_id = ?)",
        )
        .bind(session_id)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        sqlx::query("DELETE FROM teams WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let mut teams = Vec::with_capacity(names.len());
        for name in names {
            let team = sqlx::query_as::<_, Team>(
                "INSERT INTO teams (session_id, name) VALUES (?, ?) RETURNING id, session_id, name",
            )
            .bind(session_id)
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;
            teams.push(team);
        }
        tx.commit().await?;
        Ok(Some(teams))
    }

    /// Resize the territory map, discarding the old grid. `false` if the
    /// session is not editable.
    pub async fn set_map(
        &self,
        session_id: i64,
        rows: i64,
        cols: i64,
        cells: &[(Coordinate, String)],
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE sessions SET map_rows = ?, map_cols = ?, updated_at = datetime('now') \
             WHERE id = ? AND status IN ('draft', 'ready')",
        )
        .bind(rows)
        .bind(cols)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query("DELETE FROM territories WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        insert_cells(&mut tx, session_id, cells).await?;
        tx.commit().await?;
        Ok(true)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Compare-and-set one status step. `false` when the session was not in `from`.
    pub async fn transition_status(
        &self,
        id: i64,
        from: SessionStatus,
        to: SessionStatus,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        if !compare_and_set(&mut tx, id, from, to).await? {
            return Ok(false);
        }
        append_history(&mut tx, id, Some(from), to, None).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// ready -> live, clearing all per-game state from any earlier run.
    /// The launch requirements (a question, and enough teams for a team
    /// battle) are re-checked by the same statement; `false` when either the
    /// status or the content no longer allows it.
    pub async fn launch_session(&self, id: i64, launched_at_ms: i64) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE sessions SET status = 'live', launched_at_ms = ?, updated_at = datetime('now') \
             WHERE id = ? AND status = 'ready' \
             AND EXISTS (SELECT 1 FROM questions WHERE session_id = sessions.id) \
             AND (kind != 'team_battle' \
                  OR (SELECT COUNT(*) FROM teams WHERE session_id = sessions.id) >= ?)",
        )
        .bind(launched_at_ms)
        .bind(id)
        .bind(MIN_TEAMS as i64)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        for reset in [
            "UPDATE territories SET owner_team_id = NULL, owner_player_id = NULL, claimed_at_ms = NULL WHERE session_id = ?",
            "DELETE FROM answers WHERE player_id IN (SELECT id FROM players WHERE session_id = ?)",
            "DELETE FROM question_views WHERE player_id IN (SELECT id FROM players WHERE session_id = ?)",
            "DELETE FROM player_achievements WHERE player_id IN (SELECT id FROM players WHERE session_id = ?)",
            "UPDATE players SET score = 0, streak = 0, score_reached_ms = 0, last_rank = NULL WHERE session_id = ?",
        ] {
            sqlx::query(reset).bind(id).execute(&mut *tx).await?;
        }
        append_history(&mut tx, id, Some(SessionStatus::Ready), SessionStatus::Live, None).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// live -> completed. `finalize` runs inside the transaction on the
    /// frozen standings; its MVP award and snapshot commit with the status
    /// change or not at all. A `finalize` error rolls the completion back.
    pub async fn complete_session<F>(
        &self,
        id: i64,
        completed_at: &str,
        finalize: F,
    ) -> Result<bool, sqlx::Error>
    where
        F: FnOnce(&[StandingRow], &[Team]) -> Result<Completion, std::io::Error> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE sessions SET status = 'completed', completed_at = ?, updated_at = datetime('now') \
             WHERE id = ? AND status = 'live'",
        )
        .bind(completed_at)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let standings = fetch_standings(&mut tx, id).await?;
        let teams = sqlx::query_as::<_, Team>("SELECT id, session_id, name FROM teams WHERE session_id = ? ORDER BY id")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;
        let completion = finalize(&standings, &teams).map_err(sqlx::Error::Io)?;

        if let Some(player_id) = completion.mvp_player_id {
            sqlx::query("INSERT OR IGNORE INTO player_achievements (player_id, achievement) VALUES (?, 'mvp')")
                .bind(player_id)
                .execute(&mut *tx)
                .await?;
        }
        append_history(
            &mut tx,
            id,
            Some(SessionStatus::Live),
            SessionStatus::Completed,
            completion.snapshot,
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    // ── History ───────────────────────────────────────────────────────

    pub async fn list_session_history(&self, session_id: i64) -> Result<Vec<SessionHistory>, sqlx::Error> {
        sqlx::query_as::<_, SessionHistory>(
            "SELECT id, session_id, from_status, to_status, snapshot, created_at \
             FROM session_history WHERE session_id = ? ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Compressed final snapshot of the most recent completion.
    pub async fn latest_snapshot(&self, session_id: i64) -> Result<Option<Vec<u8>>, sqlx::Error> {
        let row: Option<(Option<Vec<u8>>,)> = sqlx::query_as(
            "SELECT snapshot FROM session_history \
             WHERE session_id = ? AND snapshot IS NOT NULL ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|(s,)| s))
    }

    // ── Standings ─────────────────────────────────────────────────────

    pub async fn standings(&self, session_id: i64) -> Result<Vec<StandingRow>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        fetch_standings(&mut conn, session_id).await
    }

    /// Persist the ranks of the last published leaderboard.
    pub async fn store_ranks(&self, ranks: &[(i64, i64)]) -> Result<(), sqlx::Error> {
        if ranks.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (player_id, rank) in ranks {
            sqlx::query("UPDATE players SET last_rank = ? WHERE id = ?")
                .bind(rank)
                .bind(player_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn touch_editable(conn: &mut SqliteConnection, session_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sessions SET updated_at = datetime('now') WHERE id = ? AND status IN ('draft', 'ready')",
    )
    .bind(session_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn compare_and_set(
    conn: &mut SqliteConnection,
    id: i64,
    from: SessionStatus,
    to: SessionStatus,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE sessions SET status = ?, updated_at = datetime('now') WHERE id = ? AND status = ?",
    )
    .bind(to.as_str())
    .bind(id)
    .bind(from.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn append_history(
    conn: &mut SqliteConnection,
    session_id: i64,
    from: Option<SessionStatus>,
    to: SessionStatus,
    snapshot: Option<Vec<u8>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO session_history (session_id, from_status, to_status, snapshot) VALUES (?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(snapshot)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_cells(
    conn: &mut SqliteConnection,
    session_id: i64,
    cells: &[(Coordinate, String)],
) -> Result<(), sqlx::Error> {
    for (coord, label) in cells {
        sqlx::query("INSERT INTO territories (session_id, map_row, map_col, label) VALUES (?, ?, ?, ?)")
            .bind(session_id)
            .bind(coord.row)
            .bind(coord.col)
            .bind(label)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn fetch_standings(
    conn: &mut SqliteConnection,
    session_id: i64,
) -> Result<Vec<StandingRow>, sqlx::Error> {
    sqlx::query_as::<_, StandingRow>(
        "SELECT p.id AS player_id, p.name, p.team_id, p.score, p.score_reached_ms, p.last_rank, \
         (SELECT COUNT(*) FROM territories t WHERE t.owner_player_id = p.id) AS territories \
         FROM players p WHERE p.session_id = ? ORDER BY p.id",
    )
    .bind(session_id)
    .fetch_all(conn)
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::territory::grid;

    pub(crate) async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    pub(crate) async fn seed_session(db: &Database, pin: &str, kind: SessionType) -> Session {
        db.ensure_local_user(1, "local").await.unwrap();
        let settings = SessionSettings::default();
        let fields = default_fields();
        let (rows, cols) = match kind {
            SessionType::TeamBattle => (2, 2),
            SessionType::Individual => (0, 0),
        };
        db.create_session(
            &NewSession {
                owner_id: 1,
                name: "Quiz night",
                description: "",
                kind,
                pin,
                settings: &settings,
                fields: &fields,
                map_rows: rows,
                map_cols: cols,
            },
            &grid(rows, cols),
        )
        .await
        .unwrap()
    }

    pub(crate) fn question(prompt: &str) -> NewQuestion {
        NewQuestion {
            prompt: prompt.to_string(),
            options: vec!["A".into(), "B".into(), "C".into()],
            correct_index: 1,
            time_limit_secs: Some(20),
            points: 100,
            coordinate: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch_session() {
        let db = test_db().await;
        let s = seed_session(&db, "ABC123", SessionType::Individual).await;
        assert_eq!(s.status(), SessionStatus::Draft);
        assert_eq!(s.kind(), SessionType::Individual);
        assert!(s.settings().speed_bonus);
        assert_eq!(s.fields().len(), 3);

        let by_pin = db.get_session_by_pin("ABC123").await.unwrap().unwrap();
        assert_eq!(by_pin.id, s.id);
        assert!(db.get_session_by_pin("ZZZ999").await.unwrap().is_none());
        assert_eq!(db.list_sessions(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_active_pin_is_unique_until_completed() {
        let db = test_db().await;
        let first = seed_session(&db, "PIN001", SessionType::Individual).await;

        let settings = SessionSettings::default();
        let fields = default_fields();
        let clash = db
            .create_session(
                &NewSession {
                    owner_id: 1,
                    name: "Other",
                    description: "",
                    kind: SessionType::Individual,
                    pin: "PIN001",
                    settings: &settings,
                    fields: &fields,
                    map_rows: 0,
                    map_cols: 0,
                },
                &[],
            )
            .await
            .unwrap_err();
        assert!(crate::error::is_unique_violation(&clash));

        db.replace_questions(first.id, &[question("Q1")]).await.unwrap();
        assert!(db.transition_status(first.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap());
        assert!(db.launch_session(first.id, 0).await.unwrap());
        assert!(db.complete_session(first.id, "now", |_, _| Ok(Completion::default())).await.unwrap());

        let reused = seed_session(&db, "PIN001", SessionType::Individual).await;
        let by_pin = db.get_session_by_pin("PIN001").await.unwrap().unwrap();
        assert_eq!(by_pin.id, reused.id);
    }

    #[tokio::test]
    async fn test_compare_and_set_transitions() {
        let db = test_db().await;
        let s = seed_session(&db, "CAS001", SessionType::Individual).await;
        db.replace_questions(s.id, &[question("Q1")]).await.unwrap();

        assert!(db.transition_status(s.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap());
        // Second attempt from the stale status matches nothing.
        assert!(!db.transition_status(s.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap());
        assert!(db.launch_session(s.id, 1_000).await.unwrap());
        assert!(!db.launch_session(s.id, 2_000).await.unwrap());

        let live = db.get_session(s.id).await.unwrap().unwrap();
        assert_eq!(live.status(), SessionStatus::Live);
        assert_eq!(live.launched_at_ms, Some(1_000));

        let history = db.list_session_history(s.id).await.unwrap();
        let steps: Vec<_> = history
            .iter()
            .map(|h| (h.from_status.clone(), h.to_status.clone()))
            .collect();
        assert_eq!(
            steps,
            vec![
                (None, "draft".to_string()),
                (Some("draft".to_string()), "ready".to_string()),
                (Some("ready".to_string()), "live".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_launch_rechecks_content_at_write_time() {
        let db = test_db().await;
        let s = seed_session(&db, "EMPTY1", SessionType::Individual).await;
        db.replace_questions(s.id, &[question("Q1")]).await.unwrap();
        db.transition_status(s.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap();

        // Questions removed after the launch checks were read.
        db.replace_questions(s.id, &[]).await.unwrap();
        assert!(!db.launch_session(s.id, 0).await.unwrap());
        let still = db.get_session(s.id).await.unwrap().unwrap();
        assert_eq!(still.status(), SessionStatus::Ready);
        assert_eq!(still.launched_at_ms, None);

        let team = seed_session(&db, "TEAM01", SessionType::TeamBattle).await;
        db.replace_questions(team.id, &[question("Q1")]).await.unwrap();
        db.replace_teams(team.id, &["Red".into()]).await.unwrap();
        db.transition_status(team.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap();
        assert!(!db.launch_session(team.id, 0).await.unwrap());

        db.replace_teams(team.id, &["Red".into(), "Blue".into()]).await.unwrap();
        assert!(db.launch_session(team.id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_finalize_rolls_back_completion() {
        let db = test_db().await;
        let s = seed_session(&db, "FIN001", SessionType::Individual).await;
        db.replace_questions(s.id, &[question("Q1")]).await.unwrap();
        db.transition_status(s.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap();
        assert!(db.launch_session(s.id, 0).await.unwrap());

        let err = db
            .complete_session(s.id, "now", |_, _| {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, sqlx::Error::Io(_)));

        let session = db.get_session(s.id).await.unwrap().unwrap();
        assert_eq!(session.status(), SessionStatus::Live);
        assert_eq!(session.completed_at, None);
        assert!(db.latest_snapshot(s.id).await.unwrap().is_none());
        assert_eq!(db.list_session_history(s.id).await.unwrap().len(), 3);

        assert!(db
            .complete_session(s.id, "now", |_, _| Ok(Completion {
                mvp_player_id: None,
                snapshot: Some(vec![1, 2, 3]),
            }))
            .await
            .unwrap());
        assert_eq!(db.latest_snapshot(s.id).await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_edits_rejected_once_live() {
        let db = test_db().await;
        let s = seed_session(&db, "EDIT01", SessionType::TeamBattle).await;

        assert!(db.replace_questions(s.id, &[question("Q1"), question("Q2")]).await.unwrap().is_some());
        let teams = db.replace_teams(s.id, &["Red".into(), "Blue".into()]).await.unwrap().unwrap();
        assert_eq!(teams.len(), 2);
        assert!(db.set_map(s.id, 3, 3, &grid(3, 3)).await.unwrap());

        db.transition_status(s.id, SessionStatus::Draft, SessionStatus::Ready).await.unwrap();
        db.launch_session(s.id, 0).await.unwrap();

        assert!(db.replace_questions(s.id, &[question("Q3")]).await.unwrap().is_none());
        assert!(db.replace_teams(s.id, &["Green".into()]).await.unwrap().is_none());
        assert!(!db.set_map(s.id, 2, 2, &grid(2, 2)).await.unwrap());
        assert!(!db.set_fields(s.id, &default_fields()).await.unwrap());
        assert!(db
            .update_session_details(s.id, "Renamed", "", &SessionSettings::default())
            .await
            .unwrap()
            .is_none());
        assert!(!db.delete_session(s.id).await.unwrap());
        assert_eq!(db.list_questions(s.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_question_rules_from_row() {
        let db = test_db().await;
        let s = seed_session(&db, "RULES1", SessionType::Individual).await;
        let stored = db.replace_questions(s.id, &[question("Q1")]).await.unwrap().unwrap();
        let rules = stored[0].rules();
        assert_eq!(rules.correct_index, 1);
        assert_eq!(rules.option_count, 3);
        assert_eq!(rules.time_limit_ms, Some(20_000));
        assert_eq!(stored[0].coordinate(), None);
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let db = test_db().await;
        let s = seed_session(&db, "DEL001", SessionType::TeamBattle).await;
        db.replace_questions(s.id, &[question("Q1")]).await.unwrap();
        assert!(db.delete_session(s.id).await.unwrap());
        assert!(db.get_session(s.id).await.unwrap().is_none());
        assert!(db.list_questions(s.id).await.unwrap().is_empty());
        assert!(db.list_territories(s.id).await.unwrap().is_empty());
    }
}
