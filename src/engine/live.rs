// Live session service: runs one inbound event end to end.
//
// validate -> conditional write in the store -> re-rank and evaluate
// achievements over a fresh read -> publish to observers. Nothing here holds
// a lock across events; the store's conditional writes arbitrate races.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::achievements::{self, LastAnswer, Progress};
use super::config::{
    DEFAULT_MAP_COLS, DEFAULT_MAP_ROWS, DEFAULT_POINTS, MAX_OPTIONS, MAX_POINTS, MAX_PROMPT_LENGTH,
    MAX_TEAMS, MAX_TIME_LIMIT_SECS, MIN_OPTIONS, MIN_POINTS, MIN_TIME_LIMIT_SECS,
    PIN_GENERATION_ATTEMPTS,
};
use super::hub::{SessionEvent, SessionHub};
use super::leaderboard::{self, LeaderboardEntry, Standing, TeamStanding};
use super::lifecycle::{
    check_launch, plan, require, Operation, SessionSettings, SessionStatus, SessionType, Transition,
};
use super::registration::{
    self, validate_field_config, JoinPayload, JoinRequest, RegistrationField, FIELD_NAME,
};
use super::scoring::{self, AnswerTiming, ScoringOutcome, Verdict};
use super::territory::{self, check_credit, diagnose_rejected_claim, Coordinate, TerritoryState};
use crate::db::{
    AnswerCommit, AnswerRecord, ClaimCommit, ClaimRecord, Completion, Database, NewPlayer,
    NewQuestion, NewSession, Player, Question, Session, SessionHistory, StandingRow, Team,
    Territory,
};
use crate::error::{is_unique_violation, GameError};
use crate::history::FinalSnapshot;
use crate::metrics;
use crate::pin::{generate_pin, normalize_pin};

const MAX_SESSION_NAME_CHARS: usize = 100;
const MAX_TEAM_NAME_CHARS: usize = 30;
const GENERATED_NAME_ATTEMPTS: usize = 5;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// SHA-256 of a player token; only the hash is stored.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn generated_name() -> String {
    format!("Player-{:04X}", rand::thread_rng().gen_range(0..0x10000))
}

// ── Requests ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SessionType,
    #[serde(default)]
    pub settings: SessionSettings,
    pub fields: Option<Vec<RegistrationField>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateSessionRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionInput {
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_index: i64,
    pub time_limit_secs: Option<i64>,
    pub points: Option<i64>,
    pub coordinate: Option<Coordinate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAnswer {
    pub question_id: i64,
    pub option_index: i64,
    pub client_elapsed_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub territory_id: i64,
    /// Which correct answer pays for the claim; the oldest usable one if omitted.
    #[serde(default)]
    pub question_id: Option<i64>,
}

// ── Views ────────────────────────────────────────────────────────────

/// Admin view of a question, including the answer key.
#[derive(Debug, Clone, Serialize)]
pub struct QuestionDetail {
    pub id: i64,
    pub position: i64,
    pub prompt: String,
    pub options: Vec<String>,
    pub correct_index: i64,
    pub time_limit_secs: Option<i64>,
    pub points: i64,
    pub coordinate: Option<Coordinate>,
}

impl From<&Question> for QuestionDetail {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            position: q.position,
            prompt: q.prompt.clone(),
            options: q.options(),
            correct_index: q.correct_index,
            time_limit_secs: q.time_limit_secs,
            points: q.points,
            coordinate: q.coordinate(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDetail {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SessionType,
    pub status: SessionStatus,
    pub pin: String,
    pub settings: SessionSettings,
    pub fields: Vec<RegistrationField>,
    pub questions: Vec<QuestionDetail>,
    pub teams: Vec<Team>,
    pub map_rows: i64,
    pub map_cols: i64,
    pub player_count: i64,
    pub launched_at_ms: Option<i64>,
    pub completed_at: Option<String>,
    pub created_at: String,
}

/// What a player sees before and while joining.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: i64,
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SessionType,
    pub status: SessionStatus,
    pub pin: String,
    pub fields: Vec<RegistrationField>,
    pub teams: Vec<Team>,
    pub question_count: usize,
    pub player_count: i64,
    pub map_rows: i64,
    pub map_cols: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedPlayer {
    /// Bearer token for all later player calls. Shown once.
    pub token: String,
    pub player: Player,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlayerState {
    pub player: Player,
    pub custom: BTreeMap<String, String>,
    pub session_status: SessionStatus,
    pub achievements: Vec<String>,
    pub answered: i64,
    pub correct: i64,
    pub territories: i64,
    pub unspent_claims: usize,
}

/// A question as delivered to a player. Never carries the answer key.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerQuestion {
    pub id: i64,
    pub position: i64,
    pub prompt: String,
    pub options: Vec<String>,
    pub time_limit_secs: Option<i64>,
    pub points: i64,
    pub coordinate: Option<Coordinate>,
    pub shown_at_ms: i64,
    pub deadline_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NextQuestion {
    pub finished: bool,
    pub answered: usize,
    pub total: usize,
    pub question: Option<PlayerQuestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub territory: Territory,
    pub territories_held: i64,
    pub achievements: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LeaderboardView {
    pub entries: Vec<LeaderboardEntry>,
    pub teams: Vec<TeamStanding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionResults {
    pub history: Vec<SessionHistory>,
    pub final_results: Option<FinalSnapshot>,
}

struct PlayerContext {
    player: Player,
    session: Session,
}

fn to_standings(rows: &[StandingRow]) -> Vec<Standing> {
    rows.iter()
        .map(|r| Standing {
            player_id: r.player_id,
            name: r.name.clone(),
            team_id: r.team_id,
            score: r.score,
            score_reached_ms: r.score_reached_ms,
            join_order: r.player_id,
            territories: r.territories,
            previous_rank: r.last_rank,
        })
        .collect()
}

fn team_pairs(teams: &[Team]) -> Vec<(i64, String)> {
    teams.iter().map(|t| (t.id, t.name.clone())).collect()
}

fn rfc3339_at(now_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(now_ms)
        .unwrap_or_else(chrono::Utc::now)
        .to_rfc3339()
}

/// Check one admin-supplied question against the session's shape.
pub fn validate_question(
    index: usize,
    input: &QuestionInput,
    kind: SessionType,
    map_rows: i64,
    map_cols: i64,
) -> Result<NewQuestion, GameError> {
    let field = format!("questions[{index}]");
    let prompt = input.prompt.trim();
    if prompt.is_empty() || prompt.chars().count() > MAX_PROMPT_LENGTH {
        return Err(GameError::validation(
            &field,
            format!("prompt must be 1-{MAX_PROMPT_LENGTH} characters"),
        ));
    }
    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&input.options.len()) {
        return Err(GameError::validation(
            &field,
            format!("needs {MIN_OPTIONS}-{MAX_OPTIONS} options"),
        ));
    }
    let options: Vec<String> = input.options.iter().map(|o| o.trim().to_string()).collect();
    if options.iter().any(String::is_empty) {
        return Err(GameError::validation(&field, "options must not be empty"));
    }
    if input.correct_index < 0 || input.correct_index as usize >= options.len() {
        return Err(GameError::validation(&field, "correct_index is out of range"));
    }
    if let Some(limit) = input.time_limit_secs {
        if !(MIN_TIME_LIMIT_SECS..=MAX_TIME_LIMIT_SECS).contains(&limit) {
            return Err(GameError::validation(
                &field,
                format!("time limit must be {MIN_TIME_LIMIT_SECS}-{MAX_TIME_LIMIT_SECS} seconds"),
            ));
        }
    }
    let points = input.points.unwrap_or(DEFAULT_POINTS);
    if !(MIN_POINTS..=MAX_POINTS).contains(&points) {
        return Err(GameError::validation(
            &field,
            format!("points must be {MIN_POINTS}-{MAX_POINTS}"),
        ));
    }
    if let Some(coord) = input.coordinate {
        if kind != SessionType::TeamBattle {
            return Err(GameError::validation(
                &field,
                "only team battles place questions on the map",
            ));
        }
        territory::validate_coordinate(map_rows, map_cols, coord)
            .map_err(|_| GameError::validation(&field, "coordinate is outside the map"))?;
    }
    Ok(NewQuestion {
        prompt: prompt.to_string(),
        options,
        correct_index: input.correct_index,
        time_limit_secs: input.time_limit_secs,
        points,
        coordinate: input.coordinate,
    })
}

fn validate_team_names(names: &[String]) -> Result<Vec<String>, GameError> {
    if names.len() > MAX_TEAMS {
        return Err(GameError::validation("teams", format!("at most {MAX_TEAMS} teams")));
    }
    let mut seen = HashSet::new();
    let mut cleaned = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_TEAM_NAME_CHARS {
            return Err(GameError::validation(
                "teams",
                format!("team names must be 1-{MAX_TEAM_NAME_CHARS} characters"),
            ));
        }
        if !seen.insert(name.to_lowercase()) {
            return Err(GameError::validation("teams", format!("duplicate team '{name}'")));
        }
        cleaned.push(name.to_string());
    }
    Ok(cleaned)
}

fn validate_session_basics(name: &str, settings: &SessionSettings) -> Result<String, GameError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_SESSION_NAME_CHARS {
        return Err(GameError::validation(
            "name",
            format!("must be 1-{MAX_SESSION_NAME_CHARS} characters"),
        ));
    }
    if settings.max_duration_secs.is_some_and(|s| s <= 0) {
        return Err(GameError::validation("settings", "max_duration_secs must be positive"));
    }
    Ok(name.to_string())
}

pub struct LiveService {
    db: Arc<Database>,
    hub: Arc<SessionHub>,
}

impl LiveService {
    pub fn new(db: Arc<Database>, hub: Arc<SessionHub>) -> Self {
        Self { db, hub }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    // ── Admin: authoring ──────────────────────────────────────────────

    pub async fn create_session(
        &self,
        owner_id: i64,
        req: CreateSessionRequest,
    ) -> Result<Session, GameError> {
        let name = validate_session_basics(&req.name, &req.settings)?;
        let fields = req.fields.unwrap_or_else(registration::default_fields);
        validate_field_config(&fields)?;
        let (rows, cols) = match req.kind {
            SessionType::TeamBattle => (DEFAULT_MAP_ROWS, DEFAULT_MAP_COLS),
            SessionType::Individual => (0, 0),
        };
        let cells = territory::grid(rows, cols);

        let mut last_err = None;
        for _ in 0..PIN_GENERATION_ATTEMPTS {
            let pin = generate_pin();
            let new = NewSession {
                owner_id,
                name: &name,
                description: req.description.trim(),
                kind: req.kind,
                pin: &pin,
                settings: &req.settings,
                fields: &fields,
                map_rows: rows,
                map_cols: cols,
            };
            match self.db.create_session(&new, &cells).await {
                Ok(session) => {
                    tracing::info!(session_id = session.id, pin = %session.pin, "Session created");
                    return Ok(session);
                }
                Err(e) if is_unique_violation(&e) => {
                    tracing::warn!("PIN {pin} already in use, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.map(GameError::from).unwrap_or(GameError::SessionNotFound))
    }

    /// Load a session and check that `owner_id` may administer it.
    pub async fn owned_session(&self, owner_id: i64, session_id: i64) -> Result<Session, GameError> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .ok_or(GameError::SessionNotFound)?;
        if session.owner_id != owner_id {
            return Err(GameError::Forbidden);
        }
        Ok(session)
    }

    pub async fn session_detail(&self, session: &Session) -> Result<SessionDetail, GameError> {
        let questions = self.db.list_questions(session.id).await?;
        let teams = self.db.list_teams(session.id).await?;
        let player_count = self.db.count_players(session.id).await?;
        Ok(SessionDetail {
            id: session.id,
            owner_id: session.owner_id,
            name: session.name.clone(),
            description: session.description.clone(),
            kind: session.kind(),
            status: session.status(),
            pin: session.pin.clone(),
            settings: session.settings(),
            fields: session.fields(),
            questions: questions.iter().map(QuestionDetail::from).collect(),
            teams,
            map_rows: session.map_rows,
            map_cols: session.map_cols,
            player_count,
            launched_at_ms: session.launched_at_ms,
            completed_at: session.completed_at.clone(),
            created_at: session.created_at.clone(),
        })
    }

    /// Turn a conditional edit that matched nothing into the right error.
    async fn edit_rejected(&self, session_id: i64) -> GameError {
        match self.db.get_session(session_id).await {
            Ok(Some(s)) => GameError::invalid_state(Operation::Edit.name(), s.status()),
            Ok(None) => GameError::SessionNotFound,
            Err(e) => e.into(),
        }
    }

    pub async fn update_session(
        &self,
        session: &Session,
        req: UpdateSessionRequest,
    ) -> Result<Session, GameError> {
        require(session.status(), Operation::Edit)?;
        let name = validate_session_basics(&req.name, &req.settings)?;
        match self
            .db
            .update_session_details(session.id, &name, req.description.trim(), &req.settings)
            .await?
        {
            Some(updated) => Ok(updated),
            None => Err(self.edit_rejected(session.id).await),
        }
    }

    pub async fn set_questions(
        &self,
        session: &Session,
        inputs: &[QuestionInput],
    ) -> Result<Vec<Question>, GameError> {
        require(session.status(), Operation::Edit)?;
        let questions = inputs
            .iter()
            .enumerate()
            .map(|(i, q)| validate_question(i, q, session.kind(), session.map_rows, session.map_cols))
            .collect::<Result<Vec<_>, _>>()?;
        match self.db.replace_questions(session.id, &questions).await? {
            Some(stored) => Ok(stored),
            None => Err(self.edit_rejected(session.id).await),
        }
    }

    pub async fn set_fields(
        &self,
        session: &Session,
        fields: &[RegistrationField],
    ) -> Result<Vec<RegistrationField>, GameError> {
        require(session.status(), Operation::Edit)?;
        validate_field_config(fields)?;
        if self.db.set_fields(session.id, fields).await? {
            Ok(fields.to_vec())
        } else {
            Err(self.edit_rejected(session.id).await)
        }
    }

    pub async fn set_teams(&self, session: &Session, names: &[String]) -> Result<Vec<Team>, GameError> {
        require(session.status(), Operation::Edit)?;
        if session.kind() != SessionType::TeamBattle {
            return Err(GameError::validation("teams", "only team battles have teams"));
        }
        let names = validate_team_names(names)?;
        if let Some(teams) = self.db.replace_teams(session.id, &names).await? {
            return Ok(teams);
        }
        if self.db.count_players(session.id).await? > 0 {
            return Err(GameError::validation(
                "teams",
                "teams cannot change after players have joined",
            ));
        }
        Err(self.edit_rejected(session.id).await)
    }

    pub async fn set_map(&self, session: &Session, rows: i64, cols: i64) -> Result<Vec<Territory>, GameError> {
        require(session.status(), Operation::Edit)?;
        if session.kind() != SessionType::TeamBattle {
            return Err(GameError::validation("map", "only team battles have a map"));
        }
        territory::validate_map(rows, cols)?;
        let questions = self.db.list_questions(session.id).await?;
        if questions
            .iter()
            .filter_map(Question::coordinate)
            .any(|c| territory::validate_coordinate(rows, cols, c).is_err())
        {
            return Err(GameError::validation(
                "map",
                "a question is placed outside the new map",
            ));
        }
        if !self
            .db
            .set_map(session.id, rows, cols, &territory::grid(rows, cols))
            .await?
        {
            return Err(self.edit_rejected(session.id).await);
        }
        Ok(self.db.list_territories(session.id).await?)
    }

    pub async fn delete_session(&self, session: &Session) -> Result<(), GameError> {
        require(session.status(), Operation::Delete)?;
        if self.db.delete_session(session.id).await? {
            self.hub.close(session.id);
            tracing::info!(session_id = session.id, "Session deleted");
            return Ok(());
        }
        match self.db.get_session(session.id).await? {
            Some(s) => Err(GameError::invalid_state(Operation::Delete.name(), s.status())),
            None => Err(GameError::SessionNotFound),
        }
    }

    pub async fn session_results(&self, session: &Session) -> Result<SessionResults, GameError> {
        let history = self.db.list_session_history(session.id).await?;
        let final_results = match self.db.latest_snapshot(session.id).await? {
            Some(data) => match FinalSnapshot::decompress(&data) {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::error!(session_id = session.id, "Corrupt final snapshot: {e}");
                    None
                }
            },
            None => None,
        };
        Ok(SessionResults {
            history,
            final_results,
        })
    }

    /// Standings frozen at completion; `None` until the session has completed.
    pub async fn final_standings(&self, session: &Session) -> Result<Option<LeaderboardView>, GameError> {
        if session.status() != SessionStatus::Completed {
            return Ok(None);
        }
        Ok(self
            .session_results(session)
            .await?
            .final_results
            .map(|snapshot| LeaderboardView {
                entries: snapshot.leaderboard,
                teams: snapshot.teams,
            }))
    }

    // ── Admin: lifecycle ──────────────────────────────────────────────

    pub async fn transition(&self, session_id: i64, transition: Transition) -> Result<Session, GameError> {
        self.transition_at(session_id, transition, now_ms()).await
    }

    /// Apply an admin transition as a series of compare-and-set steps.
    pub async fn transition_at(
        &self,
        session_id: i64,
        transition: Transition,
        now_ms: i64,
    ) -> Result<Session, GameError> {
        let session = self
            .db
            .get_session(session_id)
            .await?
            .ok_or(GameError::SessionNotFound)?;
        let steps = plan(session.status(), transition)?;

        if transition == Transition::Launch {
            let questions = self.db.list_questions(session_id).await?;
            let teams = self.db.list_teams(session_id).await?;
            check_launch(session.kind(), questions.len(), teams.len())?;
        }

        for (from, to) in steps {
            let applied = match (from, to) {
                (SessionStatus::Ready, SessionStatus::Live) => {
                    self.db.launch_session(session_id, now_ms).await?
                }
                (SessionStatus::Live, SessionStatus::Completed) => {
                    self.complete(session_id, now_ms).await?
                }
                _ => self.db.transition_status(session_id, from, to).await?,
            };
            if !applied {
                let current = self
                    .db
                    .get_session(session_id)
                    .await?
                    .ok_or(GameError::SessionNotFound)?;
                if to == SessionStatus::Live && current.status() == SessionStatus::Ready {
                    // Content was edited away between the checks and the write.
                    let questions = self.db.list_questions(session_id).await?;
                    let teams = self.db.list_teams(session_id).await?;
                    check_launch(current.kind(), questions.len(), teams.len())?;
                }
                // Lost a race with another transition.
                let current = current.status();
                tracing::warn!(session_id, %from, %to, %current, "Transition lost a race");
                return Err(GameError::invalid_state(transition.name(), current));
            }
            tracing::info!(session_id, %from, %to, "Session transition");
            self.hub.publish(&SessionEvent::Status {
                session_id,
                status: to,
            });
            match to {
                SessionStatus::Live => {
                    metrics::SESSIONS_LAUNCHED_TOTAL.inc();
                    metrics::LIVE_SESSIONS.inc();
                    self.publish_leaderboard(session_id).await?;
                }
                // Observers drain the final frames, then see the stream end.
                SessionStatus::Completed => self.hub.close(session_id),
                _ => {}
            }
        }

        self.db
            .get_session(session_id)
            .await?
            .ok_or(GameError::SessionNotFound)
    }

    /// live -> completed with the MVP award and the frozen final standings.
    async fn complete(&self, session_id: i64, now_ms: i64) -> Result<bool, GameError> {
        let completed_at = rfc3339_at(now_ms);
        let mut frozen: Option<FinalSnapshot> = None;
        let applied = self
            .db
            .complete_session(session_id, &completed_at, |rows, teams| {
                let entries = leaderboard::rank(&to_standings(rows));
                let teams = leaderboard::team_standings(&team_pairs(teams), &entries);
                let mvp_player_id = achievements::mvp(&entries);
                let snapshot = FinalSnapshot {
                    session_id,
                    completed_at: completed_at.clone(),
                    leaderboard: entries,
                    teams,
                    mvp_player_id,
                };
                let compressed = snapshot.compress()?;
                frozen = Some(snapshot);
                Ok(Completion {
                    mvp_player_id,
                    snapshot: Some(compressed),
                })
            })
            .await
            .inspect_err(|e| tracing::error!(session_id, "Failed to complete session: {e}"))?;
        if !applied {
            return Ok(false);
        }

        metrics::SESSIONS_COMPLETED_TOTAL.inc();
        metrics::LIVE_SESSIONS.dec();
        if let Some(snapshot) = frozen {
            if let Some(player_id) = snapshot.mvp_player_id {
                metrics::ACHIEVEMENTS_UNLOCKED_TOTAL
                    .with_label_values(&["mvp"])
                    .inc();
                self.hub.publish(&SessionEvent::Achievements {
                    session_id,
                    player_id,
                    unlocked: vec!["mvp".to_string()],
                });
            }
            self.hub.publish(&SessionEvent::Completed {
                session_id,
                mvp_player_id: snapshot.mvp_player_id,
                leaderboard: snapshot.leaderboard,
            });
        }
        Ok(true)
    }

    // ── Deadlines ─────────────────────────────────────────────────────

    /// Whether a live session has run its course at `now_ms`: its maximum
    /// duration has passed, or every player is done with the last question.
    pub async fn is_finished_at(&self, session: &Session, now_ms: i64) -> Result<bool, GameError> {
        if let (Some(max_secs), Some(launched)) =
            (session.settings().max_duration_secs, session.launched_at_ms)
        {
            if now_ms >= launched + max_secs * 1000 {
                return Ok(true);
            }
        }
        let questions = self.db.list_questions(session.id).await?;
        let Some(last) = questions.last() else {
            return Ok(false);
        };
        let progress = self.db.question_progress(session.id, last.id).await?;
        if progress.is_empty() {
            return Ok(false);
        }
        let limit = last.rules().time_limit_ms;
        Ok(progress.iter().all(|p| {
            p.answered
                || p.shown_at_ms
                    .is_some_and(|shown| scoring::window_closed(limit, shown, now_ms))
        }))
    }

    /// End the session if it is finished. Losing the race to another ender is fine.
    async fn finish_if_done_at(&self, session: &Session, now_ms: i64) -> Result<bool, GameError> {
        if !self.is_finished_at(session, now_ms).await? {
            return Ok(false);
        }
        match self.transition_at(session.id, Transition::End, now_ms).await {
            Ok(_) => {
                tracing::info!(session_id = session.id, "Session ended automatically");
                Ok(true)
            }
            Err(GameError::InvalidSessionState { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Sweep all live sessions and end the finished ones. Returns their ids.
    pub async fn check_deadlines_at(&self, now_ms: i64) -> Result<Vec<i64>, GameError> {
        let mut ended = Vec::new();
        for session in self.db.list_live_sessions().await? {
            if self.finish_if_done_at(&session, now_ms).await? {
                ended.push(session.id);
            }
        }
        Ok(ended)
    }

    // ── Players: joining ──────────────────────────────────────────────

    pub async fn session_by_pin(&self, pin: &str) -> Result<Session, GameError> {
        let pin = normalize_pin(pin).ok_or(GameError::SessionNotFound)?;
        self.db
            .get_session_by_pin(&pin)
            .await?
            .ok_or(GameError::SessionNotFound)
    }

    pub async fn session_summary(&self, pin: &str) -> Result<SessionSummary, GameError> {
        let session = self.session_by_pin(pin).await?;
        let questions = self.db.list_questions(session.id).await?;
        let teams = self.db.list_teams(session.id).await?;
        let player_count = self.db.count_players(session.id).await?;
        Ok(SessionSummary {
            id: session.id,
            name: session.name.clone(),
            description: session.description.clone(),
            kind: session.kind(),
            status: session.status(),
            pin: session.pin.clone(),
            fields: session.fields().into_iter().filter(|f| f.enabled).collect(),
            teams,
            question_count: questions.len(),
            player_count,
            map_rows: session.map_rows,
            map_cols: session.map_cols,
        })
    }

    async fn validate_for(&self, session: &Session, req: &JoinRequest) -> Result<JoinPayload, GameError> {
        let loads = match session.kind() {
            SessionType::TeamBattle => self.db.team_loads(session.id).await?,
            SessionType::Individual => Vec::new(),
        };
        registration::validate_join(session.status(), session.kind(), &session.fields(), &loads, req)
    }

    /// Dry-run the registration rules so clients can show field errors early.
    pub async fn validate_join(&self, pin: &str, req: &JoinRequest) -> Result<JoinPayload, GameError> {
        let session = self.session_by_pin(pin).await?;
        self.validate_for(&session, req).await
    }

    pub async fn join(&self, pin: &str, req: &JoinRequest) -> Result<JoinedPlayer, GameError> {
        let result = self.join_inner(pin, req).await;
        let outcome = if result.is_ok() { "joined" } else { "rejected" };
        metrics::JOINS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn join_inner(&self, pin: &str, req: &JoinRequest) -> Result<JoinedPlayer, GameError> {
        let session = self.session_by_pin(pin).await?;
        let payload = self.validate_for(&session, req).await?;
        let custom = serde_json::to_string(&payload.custom).unwrap_or_else(|_| "{}".to_string());
        let token = uuid::Uuid::new_v4().to_string();
        let token_hash = hash_token(&token);

        let attempts = if payload.name.is_some() { 1 } else { GENERATED_NAME_ATTEMPTS };
        let mut inserted = None;
        for _ in 0..attempts {
            let name = payload.name.clone().unwrap_or_else(generated_name);
            let new = NewPlayer {
                name: &name,
                email: payload.email.as_deref(),
                organization: payload.organization.as_deref(),
                custom: custom.clone(),
                team_id: payload.team_id,
                token_hash: &token_hash,
            };
            match self.db.insert_player(session.id, &new).await {
                Ok(Some(player)) => {
                    inserted = Some(player);
                    break;
                }
                Ok(None) => {
                    // The session left the joinable states after validation.
                    let status = self
                        .db
                        .get_session(session.id)
                        .await?
                        .map(|s| s.status())
                        .ok_or(GameError::SessionNotFound)?;
                    return Err(GameError::invalid_state(Operation::Join.name(), status));
                }
                Err(e) if is_unique_violation(&e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let player = inserted
            .ok_or_else(|| GameError::validation(FIELD_NAME, "is already taken in this session"))?;

        tracing::info!(session_id = session.id, player_id = player.id, "Player joined");
        self.hub.publish(&SessionEvent::PlayerJoined {
            session_id: session.id,
            player_id: player.id,
            name: player.name.clone(),
            team_id: player.team_id,
        });
        self.publish_leaderboard(session.id).await?;
        Ok(JoinedPlayer { token, player })
    }

    async fn context(&self, token: &str) -> Result<PlayerContext, GameError> {
        let player = self
            .db
            .get_player_by_token_hash(&hash_token(token))
            .await?
            .ok_or(GameError::PlayerNotFound)?;
        let session = self
            .db
            .get_session(player.session_id)
            .await?
            .ok_or(GameError::SessionNotFound)?;
        Ok(PlayerContext { player, session })
    }

    pub async fn player_state(&self, token: &str) -> Result<PlayerState, GameError> {
        let PlayerContext { player, session } = self.context(token).await?;
        let (answered, correct) = self.db.answer_counts(player.id).await?;
        let custom = serde_json::from_str(&player.custom).unwrap_or_default();
        Ok(PlayerState {
            achievements: self.db.list_achievements(player.id).await?,
            territories: self.db.territories_held(player.id).await?,
            unspent_claims: self.db.unspent_credits(player.id).await?.len(),
            session_status: session.status(),
            answered,
            correct,
            custom,
            player,
        })
    }

    // ── Players: questions and answers ────────────────────────────────

    pub async fn next_question(&self, token: &str) -> Result<NextQuestion, GameError> {
        self.next_question_at(token, now_ms()).await
    }

    /// Deliver the player's next unanswered question, starting its clock on
    /// first delivery. Questions whose window closed unanswered are recorded
    /// as expired and skipped.
    pub async fn next_question_at(&self, token: &str, now_ms: i64) -> Result<NextQuestion, GameError> {
        let PlayerContext { player, session } = self.context(token).await?;
        require(session.status(), Operation::SubmitAnswer)?;

        let questions = self.db.list_questions(session.id).await?;
        let mut done: HashSet<i64> = self
            .db
            .list_answers(player.id)
            .await?
            .iter()
            .map(|a| a.question_id)
            .collect();

        for question in &questions {
            if done.contains(&question.id) {
                continue;
            }
            let shown_at_ms = self.db.record_view(player.id, question.id, now_ms).await?;
            let limit_ms = question.rules().time_limit_ms;
            if scoring::window_closed(limit_ms, shown_at_ms, now_ms) {
                self.record_expired(&session, &player, question, shown_at_ms, now_ms)
                    .await?;
                done.insert(question.id);
                continue;
            }
            return Ok(NextQuestion {
                finished: false,
                answered: done.len(),
                total: questions.len(),
                question: Some(PlayerQuestion {
                    id: question.id,
                    position: question.position,
                    prompt: question.prompt.clone(),
                    options: question.options(),
                    time_limit_secs: question.time_limit_secs,
                    points: question.points,
                    coordinate: question.coordinate(),
                    shown_at_ms,
                    deadline_ms: limit_ms.map(|l| shown_at_ms + l),
                }),
            });
        }

        self.finish_if_done_at(&session, now_ms).await?;
        Ok(NextQuestion {
            finished: true,
            answered: done.len(),
            total: questions.len(),
            question: None,
        })
    }

    async fn record_expired(
        &self,
        session: &Session,
        player: &Player,
        question: &Question,
        shown_at_ms: i64,
        now_ms: i64,
    ) -> Result<(), GameError> {
        let record = AnswerRecord {
            player_id: player.id,
            question_id: question.id,
            selected_index: None,
            verdict: Verdict::Expired,
            points: 0,
            response_ms: now_ms - shown_at_ms,
            answered_at_ms: now_ms,
            elapsed_since_launch_ms: now_ms - session.launched_at_ms.unwrap_or(now_ms),
        };
        match self.db.commit_answer(session.id, &record).await? {
            AnswerCommit::Scored { .. } => {
                metrics::ANSWERS_TOTAL.with_label_values(&["expired"]).inc();
                Ok(())
            }
            // Already recorded by a concurrent request.
            AnswerCommit::Duplicate => Ok(()),
            AnswerCommit::SessionClosed => Err(GameError::invalid_state(
                Operation::SubmitAnswer.name(),
                SessionStatus::Completed,
            )),
        }
    }

    pub async fn submit_answer(&self, token: &str, req: &SubmitAnswer) -> Result<ScoringOutcome, GameError> {
        self.submit_answer_at(token, req, now_ms()).await
    }

    pub async fn submit_answer_at(
        &self,
        token: &str,
        req: &SubmitAnswer,
        now_ms: i64,
    ) -> Result<ScoringOutcome, GameError> {
        let started = Instant::now();
        let result = self.submit_answer_inner(token, req, now_ms).await;
        metrics::ANSWER_HANDLING_SECONDS.observe(started.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(o) if o.correct => "correct",
            Ok(_) => "incorrect",
            Err(GameError::AnswerWindowClosed) => "expired",
            Err(GameError::DuplicateAnswer) => "duplicate",
            Err(_) => "rejected",
        };
        metrics::ANSWERS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn submit_answer_inner(
        &self,
        token: &str,
        req: &SubmitAnswer,
        now_ms: i64,
    ) -> Result<ScoringOutcome, GameError> {
        let PlayerContext { player, session } = self.context(token).await?;
        require(session.status(), Operation::SubmitAnswer)?;

        let question = self
            .db
            .get_question(session.id, req.question_id)
            .await?
            .ok_or(GameError::QuestionNotFound)?;
        let selected = usize::try_from(req.option_index)
            .map_err(|_| GameError::validation("option_index", "must not be negative"))?;
        let shown_at_ms = self
            .db
            .get_view(player.id, question.id)
            .await?
            .ok_or_else(|| {
                GameError::validation("question_id", "question has not been delivered to this player")
            })?;

        let timing = AnswerTiming {
            shown_at_ms,
            received_at_ms: now_ms,
            client_elapsed_ms: req.client_elapsed_ms,
        };
        let resolution = scoring::resolve(
            &question.rules(),
            selected,
            &timing,
            session.settings().speed_bonus,
        )?;

        let record = AnswerRecord {
            player_id: player.id,
            question_id: question.id,
            selected_index: Some(req.option_index),
            verdict: resolution.verdict,
            points: resolution.points_awarded,
            response_ms: resolution.response_ms,
            answered_at_ms: now_ms,
            elapsed_since_launch_ms: now_ms - session.launched_at_ms.unwrap_or(now_ms),
        };
        let (new_score, new_streak) = match self.db.commit_answer(session.id, &record).await? {
            AnswerCommit::Scored { score, streak } => (score, streak),
            AnswerCommit::Duplicate => return Err(GameError::DuplicateAnswer),
            AnswerCommit::SessionClosed => {
                let status = self
                    .db
                    .get_session(session.id)
                    .await?
                    .map(|s| s.status())
                    .unwrap_or(SessionStatus::Completed);
                return Err(GameError::invalid_state(Operation::SubmitAnswer.name(), status));
            }
        };

        if resolution.verdict == Verdict::Expired {
            self.finish_if_done_at(&session, now_ms).await?;
            return Err(GameError::AnswerWindowClosed);
        }

        let correct = resolution.verdict == Verdict::Correct;
        let (answered, correct_answers) = self.db.answer_counts(player.id).await?;
        let progress = Progress {
            streak: new_streak,
            territories: self.db.territories_held(player.id).await?,
            answered,
            correct_answers,
            total_questions: self.db.list_questions(session.id).await?.len() as i64,
            last_answer: Some(LastAnswer {
                correct,
                response_ms: resolution.response_ms,
            }),
        };
        let unlocked = self.award_achievements(session.id, player.id, &progress).await?;

        self.publish_leaderboard(session.id).await?;
        self.finish_if_done_at(&session, now_ms).await?;

        Ok(ScoringOutcome {
            correct,
            points_awarded: resolution.points_awarded,
            new_streak,
            new_score,
            achievements: unlocked,
        })
    }

    /// Evaluate the per-event rules and persist what is new. Only badges
    /// whose insert took effect are returned and published.
    async fn award_achievements(
        &self,
        session_id: i64,
        player_id: i64,
        progress: &Progress,
    ) -> Result<Vec<String>, GameError> {
        let held: HashSet<String> = self.db.list_achievements(player_id).await?.into_iter().collect();
        let earned = achievements::evaluate(progress, &held);
        if earned.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = earned.iter().map(|a| a.id()).collect();
        let unlocked = self.db.unlock_achievements(player_id, &ids).await?;
        if !unlocked.is_empty() {
            for id in &unlocked {
                metrics::ACHIEVEMENTS_UNLOCKED_TOTAL
                    .with_label_values(&[id.as_str()])
                    .inc();
            }
            self.hub.publish(&SessionEvent::Achievements {
                session_id,
                player_id,
                unlocked: unlocked.clone(),
            });
        }
        Ok(unlocked)
    }

    // ── Players: territory ────────────────────────────────────────────

    pub async fn claim_territory(&self, token: &str, req: &ClaimRequest) -> Result<ClaimOutcome, GameError> {
        self.claim_territory_at(token, req, now_ms()).await
    }

    pub async fn claim_territory_at(
        &self,
        token: &str,
        req: &ClaimRequest,
        now_ms: i64,
    ) -> Result<ClaimOutcome, GameError> {
        let result = self.claim_inner(token, req, now_ms).await;
        let outcome = match &result {
            Ok(_) => "claimed",
            Err(GameError::TerritoryAlreadyClaimed) => "already_claimed",
            Err(_) => "rejected",
        };
        metrics::CLAIMS_TOTAL.with_label_values(&[outcome]).inc();
        result
    }

    async fn claim_inner(
        &self,
        token: &str,
        req: &ClaimRequest,
        now_ms: i64,
    ) -> Result<ClaimOutcome, GameError> {
        let PlayerContext { player, session } = self.context(token).await?;
        require(session.status(), Operation::ClaimTerritory)?;
        if session.kind() != SessionType::TeamBattle {
            return Err(GameError::invalid_state(
                Operation::ClaimTerritory.name(),
                session.status(),
            ));
        }
        let team_id = player
            .team_id
            .ok_or_else(|| GameError::validation("team", "player has no team"))?;

        let target = self
            .db
            .get_territory(session.id, req.territory_id)
            .await?
            .ok_or(GameError::TerritoryNotFound)?;
        if target.owner_team_id.is_some() {
            return Err(GameError::TerritoryAlreadyClaimed);
        }

        let credits = self.db.unspent_credits(player.id).await?;
        let credit = match req.question_id {
            Some(question_id) => {
                let credit = credits
                    .iter()
                    .find(|c| c.question_id == question_id)
                    .ok_or(GameError::ClaimNotEarned)?;
                check_credit(credit, target.coordinate())?;
                credit
            }
            None => credits
                .iter()
                .find(|c| check_credit(c, target.coordinate()).is_ok())
                .ok_or(GameError::ClaimNotEarned)?,
        };

        let record = ClaimRecord {
            session_id: session.id,
            territory_id: target.id,
            player_id: player.id,
            team_id,
            question_id: credit.question_id,
            claimed_at_ms: now_ms,
        };
        let territory = match self.db.claim_territory(&record).await? {
            ClaimCommit::Claimed(t) => t,
            ClaimCommit::CreditSpent => return Err(GameError::ClaimNotEarned),
            ClaimCommit::Rejected => {
                let status = self
                    .db
                    .get_session(session.id)
                    .await?
                    .map(|s| s.status())
                    .unwrap_or(SessionStatus::Completed);
                let current = self
                    .db
                    .get_territory(session.id, target.id)
                    .await?
                    .map(|t| TerritoryState {
                        owner_team_id: t.owner_team_id,
                    });
                tracing::warn!(session_id = session.id, territory_id = target.id, "Claim lost the race");
                return Err(diagnose_rejected_claim(status, current));
            }
        };

        tracing::info!(
            session_id = session.id,
            player_id = player.id,
            territory = %territory.label,
            "Territory claimed"
        );
        self.hub.publish(&SessionEvent::TerritoryClaimed {
            session_id: session.id,
            territory_id: territory.id,
            label: territory.label.clone(),
            team_id,
            player_id: player.id,
        });

        let territories_held = self.db.territories_held(player.id).await?;
        let (answered, correct_answers) = self.db.answer_counts(player.id).await?;
        let progress = Progress {
            streak: player.streak,
            territories: territories_held,
            answered,
            correct_answers,
            total_questions: self.db.list_questions(session.id).await?.len() as i64,
            last_answer: None,
        };
        let unlocked = self.award_achievements(session.id, player.id, &progress).await?;
        self.publish_leaderboard(session.id).await?;

        Ok(ClaimOutcome {
            territory,
            territories_held,
            achievements: unlocked,
        })
    }

    pub async fn territories(&self, pin: &str) -> Result<Vec<Territory>, GameError> {
        let session = self.session_by_pin(pin).await?;
        Ok(self.db.list_territories(session.id).await?)
    }

    // ── Leaderboard ───────────────────────────────────────────────────

    /// Current standings with deltas against the last published ranks.
    /// Read-only: polling never consumes a delta.
    pub async fn leaderboard(&self, session_id: i64) -> Result<LeaderboardView, GameError> {
        let rows = self.db.standings(session_id).await?;
        let teams = self.db.list_teams(session_id).await?;
        let entries = leaderboard::rank(&to_standings(&rows));
        let teams = leaderboard::team_standings(&team_pairs(&teams), &entries);
        Ok(LeaderboardView { entries, teams })
    }

    /// Re-rank, persist the ranks as the new baseline and push to observers.
    pub async fn publish_leaderboard(&self, session_id: i64) -> Result<LeaderboardView, GameError> {
        let view = self.leaderboard(session_id).await?;
        let ranks: Vec<(i64, i64)> = view.entries.iter().map(|e| (e.player_id, e.rank)).collect();
        self.db.store_ranks(&ranks).await?;
        self.hub.publish(&SessionEvent::Leaderboard {
            session_id,
            entries: view.entries.clone(),
            teams: view.teams.clone(),
        });
        Ok(view)
    }
}
