// Integration tests for the live session flow: authoring, lifecycle,
// joining, answer scoring, territory races and achievement delivery.

use std::sync::Arc;

use futures::future::join_all;

use trivia_backend::db::Database;
use trivia_backend::engine::hub::SessionHub;
use trivia_backend::engine::lifecycle::{SessionSettings, SessionStatus, SessionType, Transition};
use trivia_backend::engine::live::{
    ClaimRequest, CreateSessionRequest, JoinedPlayer, LiveService, QuestionInput, SubmitAnswer,
};
use trivia_backend::engine::registration::JoinRequest;
use trivia_backend::error::GameError;

const T0: i64 = 1_700_000_000_000;

async fn service() -> LiveService {
    let db = Database::new("sqlite::memory:").await.unwrap();
    db.ensure_local_user(1, "local").await.unwrap();
    LiveService::new(Arc::new(db), Arc::new(SessionHub::new()))
}

fn question(prompt: &str) -> QuestionInput {
    QuestionInput {
        prompt: prompt.to_string(),
        options: vec!["Wrong".into(), "Right".into(), "Also wrong".into()],
        correct_index: 1,
        time_limit_secs: Some(10),
        points: Some(100),
        coordinate: None,
    }
}

async fn create(live: &LiveService, kind: SessionType, settings: SessionSettings) -> i64 {
    live.create_session(
        1,
        CreateSessionRequest {
            name: "Friday quiz".into(),
            description: String::new(),
            kind,
            settings,
            fields: None,
        },
    )
    .await
    .unwrap()
    .id
}

/// An individual session with `n` questions, launched at `T0`.
async fn launched_individual(live: &LiveService, n: usize) -> (i64, String) {
    let id = create(live, SessionType::Individual, SessionSettings::default()).await;
    let session = live.db().get_session(id).await.unwrap().unwrap();
    let questions: Vec<QuestionInput> = (0..n).map(|i| question(&format!("Q{i}"))).collect();
    live.set_questions(&session, &questions).await.unwrap();
    live.transition_at(id, Transition::MarkReady, T0).await.unwrap();
    let session = live.transition_at(id, Transition::Launch, T0).await.unwrap();
    (id, session.pin)
}

async fn join(live: &LiveService, pin: &str, name: &str) -> JoinedPlayer {
    let req = JoinRequest {
        name: Some(name.to_string()),
        ..Default::default()
    };
    live.join(pin, &req).await.unwrap()
}

fn answer(question_id: i64, option_index: i64, client_elapsed_ms: i64) -> SubmitAnswer {
    SubmitAnswer {
        question_id,
        option_index,
        client_elapsed_ms: Some(client_elapsed_ms),
    }
}

#[tokio::test]
async fn test_fast_correct_answer_scores_bonus_and_badges() {
    let live = service().await;
    let (id, pin) = launched_individual(&live, 1).await;
    let a = join(&live, &pin, "Alice").await;
    let b = join(&live, &pin, "Bob").await;

    let qa = live.next_question_at(&a.token, T0 + 1_000).await.unwrap();
    let qb = live.next_question_at(&b.token, T0 + 1_000).await.unwrap();
    let qid = qa.question.unwrap().id;
    assert_eq!(qb.question.unwrap().id, qid);

    let outcome_a = live
        .submit_answer_at(&a.token, &answer(qid, 1, 2_000), T0 + 3_000)
        .await
        .unwrap();
    assert!(outcome_a.correct);
    assert_eq!(outcome_a.points_awarded, 116);
    assert_eq!(outcome_a.new_score, 116);
    assert_eq!(outcome_a.new_streak, 1);
    assert!(outcome_a.achievements.contains(&"first_answer".to_string()));
    assert!(outcome_a.achievements.contains(&"speed_demon".to_string()));

    let outcome_b = live
        .submit_answer_at(&b.token, &answer(qid, 0, 2_000), T0 + 3_000)
        .await
        .unwrap();
    assert!(!outcome_b.correct);
    assert_eq!(outcome_b.new_score, 0);
    assert_eq!(outcome_b.new_streak, 0);
    assert!(outcome_b.achievements.is_empty());

    // Everyone answered the last question, so the session ended itself.
    let session = live.db().get_session(id).await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Completed);

    let results = live.session_results(&session).await.unwrap();
    let final_results = results.final_results.unwrap();
    assert_eq!(final_results.mvp_player_id, Some(a.player.id));
    assert_eq!(final_results.leaderboard[0].player_id, a.player.id);

    let state_a = live.player_state(&a.token).await.unwrap();
    assert!(state_a.achievements.contains(&"mvp".to_string()));
    let state_b = live.player_state(&b.token).await.unwrap();
    assert!(state_b.achievements.is_empty());
}

#[tokio::test]
async fn test_speed_bonus_can_be_disabled() {
    let live = service().await;
    let settings = SessionSettings {
        speed_bonus: false,
        max_duration_secs: None,
    };
    let id = create(&live, SessionType::Individual, settings).await;
    let session = live.db().get_session(id).await.unwrap().unwrap();
    live.set_questions(&session, &[question("Q")]).await.unwrap();
    let session = live.transition_at(id, Transition::Launch, T0).await.unwrap();

    let a = join(&live, &session.pin, "Alice").await;
    let qid = live
        .next_question_at(&a.token, T0)
        .await
        .unwrap()
        .question
        .unwrap()
        .id;
    let outcome = live
        .submit_answer_at(&a.token, &answer(qid, 1, 500), T0 + 500)
        .await
        .unwrap();
    assert_eq!(outcome.points_awarded, 100);
}

#[tokio::test]
async fn test_duplicate_answer_changes_nothing() {
    let live = service().await;
    let (_, pin) = launched_individual(&live, 2).await;
    let a = join(&live, &pin, "Alice").await;

    let qid = live
        .next_question_at(&a.token, T0)
        .await
        .unwrap()
        .question
        .unwrap()
        .id;
    let first = live
        .submit_answer_at(&a.token, &answer(qid, 1, 4_000), T0 + 4_000)
        .await
        .unwrap();
    assert_eq!(first.new_score, 100);

    let again = live
        .submit_answer_at(&a.token, &answer(qid, 1, 100), T0 + 4_100)
        .await;
    assert!(matches!(again, Err(GameError::DuplicateAnswer)));

    let state = live.player_state(&a.token).await.unwrap();
    assert_eq!(state.player.score, 100);
    assert_eq!(state.player.streak, 1);
    assert_eq!(state.answered, 1);
}

#[tokio::test]
async fn test_late_answer_is_rejected_and_breaks_streak() {
    let live = service().await;
    let (_, pin) = launched_individual(&live, 3).await;
    let a = join(&live, &pin, "Alice").await;

    let q1 = live.next_question_at(&a.token, T0).await.unwrap().question.unwrap();
    live.submit_answer_at(&a.token, &answer(q1.id, 1, 1_000), T0 + 1_000)
        .await
        .unwrap();

    let q2 = live
        .next_question_at(&a.token, T0 + 2_000)
        .await
        .unwrap()
        .question
        .unwrap();
    assert_eq!(q2.deadline_ms, Some(T0 + 12_000));
    let late = live
        .submit_answer_at(&a.token, &answer(q2.id, 1, 1_000), T0 + 13_000)
        .await;
    assert!(matches!(late, Err(GameError::AnswerWindowClosed)));

    let state = live.player_state(&a.token).await.unwrap();
    assert_eq!(state.player.streak, 0);
    assert_eq!(state.answered, 2);
}

#[tokio::test]
async fn test_answer_requires_delivered_question() {
    let live = service().await;
    let (_, pin) = launched_individual(&live, 2).await;
    let a = join(&live, &pin, "Alice").await;
    let questions = live.db().list_questions(a.player.session_id).await.unwrap();

    let result = live
        .submit_answer_at(&a.token, &answer(questions[1].id, 1, 100), T0)
        .await;
    assert!(
        matches!(result, Err(GameError::ValidationFailed { ref field, .. }) if field == "question_id")
    );
}

#[tokio::test]
async fn test_simultaneous_claims_have_one_winner() {
    let live = service().await;
    let id = create(&live, SessionType::TeamBattle, SessionSettings::default()).await;
    let session = live.db().get_session(id).await.unwrap().unwrap();
    let teams = live
        .set_teams(&session, &["Red".to_string(), "Blue".to_string()])
        .await
        .unwrap();
    live.set_questions(&session, &[question("Q1"), question("Q2")])
        .await
        .unwrap();
    let session = live.transition_at(id, Transition::Launch, T0).await.unwrap();

    let mut players = Vec::new();
    for (name, team) in [("Red-1", teams[0].id), ("Blue-1", teams[1].id)] {
        let req = JoinRequest {
            name: Some(name.to_string()),
            team_id: Some(team),
            ..Default::default()
        };
        players.push(live.join(&session.pin, &req).await.unwrap());
    }

    for p in &players {
        let q = live.next_question_at(&p.token, T0).await.unwrap().question.unwrap();
        let outcome = live
            .submit_answer_at(&p.token, &answer(q.id, 1, 5_000), T0 + 5_000)
            .await
            .unwrap();
        assert_eq!(outcome.new_score, 100);
    }

    let target = live.territories(&session.pin).await.unwrap()[0].id;
    let claims = join_all(players.iter().map(|p| {
        let req = ClaimRequest {
            territory_id: target,
            question_id: None,
        };
        let live = &live;
        async move { live.claim_territory_at(&p.token, &req, T0 + 6_000).await }
    }))
    .await;

    let winners: Vec<_> = claims.iter().filter(|r| r.is_ok()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(
        claims
            .iter()
            .filter(|r| matches!(r, Err(GameError::TerritoryAlreadyClaimed)))
            .count(),
        1
    );

    let owned: Vec<_> = live
        .territories(&session.pin)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.owner_team_id.is_some())
        .collect();
    assert_eq!(owned.len(), 1);

    // The loser keeps their points and their unspent claim.
    for p in &players {
        let state = live.player_state(&p.token).await.unwrap();
        assert_eq!(state.player.score, 100);
        let expected_unspent = if state.territories == 1 { 0 } else { 1 };
        assert_eq!(state.unspent_claims, expected_unspent);
    }

    let winner = winners[0].as_ref().unwrap();
    assert_eq!(winner.territories_held, 1);
    assert!(winner.achievements.contains(&"territory_claimed".to_string()));
}

#[tokio::test]
async fn test_claim_without_correct_answer_is_refused() {
    let live = service().await;
    let id = create(&live, SessionType::TeamBattle, SessionSettings::default()).await;
    let session = live.db().get_session(id).await.unwrap().unwrap();
    live.set_teams(&session, &["Red".to_string(), "Blue".to_string()])
        .await
        .unwrap();
    live.set_questions(&session, &[question("Q1")]).await.unwrap();
    let session = live.transition_at(id, Transition::Launch, T0).await.unwrap();
    let p = join(&live, &session.pin, "Solo").await;

    let target = live.territories(&session.pin).await.unwrap()[0].id;
    let result = live
        .claim_territory_at(
            &p.token,
            &ClaimRequest {
                territory_id: target,
                question_id: None,
            },
            T0,
        )
        .await;
    assert!(matches!(result, Err(GameError::ClaimNotEarned)));
}

#[tokio::test]
async fn test_streak_badges_delivered_once_each() {
    let live = service().await;
    let (_, pin) = launched_individual(&live, 10).await;
    let a = join(&live, &pin, "Alice").await;

    let mut delivered: Vec<String> = Vec::new();
    let mut now = T0;
    for _ in 0..10 {
        let q = live.next_question_at(&a.token, now).await.unwrap().question.unwrap();
        now += 1_000;
        let outcome = live
            .submit_answer_at(&a.token, &answer(q.id, 1, 1_000), now)
            .await
            .unwrap();
        delivered.extend(outcome.achievements);
    }

    for badge in ["first_answer", "streak_3", "streak_5", "streak_10", "speed_demon", "perfect_round"] {
        assert_eq!(
            delivered.iter().filter(|d| d.as_str() == badge).count(),
            1,
            "{badge} delivered {delivered:?}"
        );
    }

    let state = live.player_state(&a.token).await.unwrap();
    assert_eq!(state.player.streak, 10);
    for badge in ["streak_3", "streak_5", "streak_10"] {
        assert!(state.achievements.contains(&badge.to_string()));
    }
}

#[tokio::test]
async fn test_lifecycle_order_and_history() {
    let live = service().await;
    let id = create(&live, SessionType::Individual, SessionSettings::default()).await;

    let err = live.transition_at(id, Transition::Launch, T0).await.unwrap_err();
    assert!(matches!(err, GameError::ValidationFailed { ref field, .. } if field == "questions"));

    let session = live.db().get_session(id).await.unwrap().unwrap();
    live.set_questions(&session, &[question("Q")]).await.unwrap();

    let err = live.transition_at(id, Transition::End, T0).await.unwrap_err();
    assert!(matches!(err, GameError::InvalidSessionState { .. }));

    live.transition_at(id, Transition::MarkReady, T0).await.unwrap();
    live.transition_at(id, Transition::BackToDraft, T0).await.unwrap();
    let session = live.transition_at(id, Transition::Launch, T0).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Live);

    let err = live
        .set_questions(&session, &[question("Too late")])
        .await
        .unwrap_err();
    assert!(matches!(err, GameError::InvalidSessionState { .. }));

    let session = live.transition_at(id, Transition::End, T0 + 1_000).await.unwrap();
    assert_eq!(session.status(), SessionStatus::Completed);
    assert!(live.transition_at(id, Transition::End, T0 + 2_000).await.is_err());
    assert!(live.transition_at(id, Transition::Launch, T0 + 2_000).await.is_err());

    let history = live.db().list_session_history(id).await.unwrap();
    let steps: Vec<(Option<&str>, &str)> = history
        .iter()
        .map(|h| (h.from_status.as_deref(), h.to_status.as_str()))
        .collect();
    assert_eq!(
        steps,
        vec![
            (None, "draft"),
            (Some("draft"), "ready"),
            (Some("ready"), "draft"),
            (Some("draft"), "ready"),
            (Some("ready"), "live"),
            (Some("live"), "completed"),
        ]
    );
}

#[tokio::test]
async fn test_join_only_while_ready_or_live() {
    let live = service().await;
    let id = create(&live, SessionType::Individual, SessionSettings::default()).await;
    let session = live.db().get_session(id).await.unwrap().unwrap();
    let req = JoinRequest {
        name: Some("Early".into()),
        ..Default::default()
    };
    assert!(matches!(
        live.join(&session.pin, &req).await,
        Err(GameError::InvalidSessionState { .. })
    ));

    live.set_questions(&session, &[question("Q")]).await.unwrap();
    live.transition_at(id, Transition::MarkReady, T0).await.unwrap();
    let joined = live.join(&session.pin.to_lowercase(), &req).await.unwrap();
    assert_eq!(joined.player.name, "Early");

    let clash = JoinRequest {
        name: Some("EARLY".into()),
        ..Default::default()
    };
    assert!(matches!(
        live.join(&session.pin, &clash).await,
        Err(GameError::ValidationFailed { ref field, .. }) if field == "name"
    ));

    let missing = JoinRequest::default();
    assert!(matches!(
        live.join(&session.pin, &missing).await,
        Err(GameError::ValidationFailed { ref field, .. }) if field == "name"
    ));
}

#[tokio::test]
async fn test_session_ends_when_last_window_closes() {
    let live = service().await;
    let (id, pin) = launched_individual(&live, 1).await;
    let a = join(&live, &pin, "Idle").await;
    live.next_question_at(&a.token, T0).await.unwrap();

    assert!(live.check_deadlines_at(T0 + 5_000).await.unwrap().is_empty());
    assert_eq!(live.check_deadlines_at(T0 + 11_000).await.unwrap(), vec![id]);

    let session = live.db().get_session(id).await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Completed);
    // Nobody scored, so nobody is MVP.
    let results = live.session_results(&session).await.unwrap();
    assert_eq!(results.final_results.unwrap().mvp_player_id, None);
}

#[tokio::test]
async fn test_session_ends_at_max_duration() {
    let live = service().await;
    let settings = SessionSettings {
        speed_bonus: true,
        max_duration_secs: Some(60),
    };
    let id = create(&live, SessionType::Individual, settings).await;
    let session = live.db().get_session(id).await.unwrap().unwrap();
    live.set_questions(&session, &[question("Q1"), question("Q2")])
        .await
        .unwrap();
    live.transition_at(id, Transition::Launch, T0).await.unwrap();

    assert!(live.check_deadlines_at(T0 + 59_000).await.unwrap().is_empty());
    assert_eq!(live.check_deadlines_at(T0 + 60_000).await.unwrap(), vec![id]);
    // A second sweep finds nothing left to end.
    assert!(live.check_deadlines_at(T0 + 61_000).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_observers_receive_events() {
    let live = service().await;
    let id = create(&live, SessionType::Individual, SessionSettings::default()).await;
    let (mut rx, _) = live.hub().subscribe(id).unwrap();

    let session = live.db().get_session(id).await.unwrap().unwrap();
    live.set_questions(&session, &[question("Q")]).await.unwrap();
    let session = live.transition_at(id, Transition::Launch, T0).await.unwrap();
    join(&live, &session.pin, "Watcher").await;

    let mut kinds = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        kinds.push(value["type"].as_str().unwrap().to_string());
    }
    assert_eq!(
        kinds,
        vec!["status", "status", "leaderboard", "player_joined", "leaderboard"]
    );
}

#[tokio::test]
async fn test_completed_session_serves_frozen_standings() {
    let live = service().await;
    let (id, pin) = launched_individual(&live, 1).await;
    let a = join(&live, &pin, "Alice").await;
    let b = join(&live, &pin, "Bob").await;

    let session = live.db().get_session(id).await.unwrap().unwrap();
    assert!(live.final_standings(&session).await.unwrap().is_none());

    let qid = live.next_question_at(&a.token, T0).await.unwrap().question.unwrap().id;
    live.next_question_at(&b.token, T0).await.unwrap();
    live.submit_answer_at(&b.token, &answer(qid, 0, 1_000), T0 + 1_000).await.unwrap();
    live.submit_answer_at(&a.token, &answer(qid, 1, 1_000), T0 + 1_000).await.unwrap();

    let session = live.db().get_session(id).await.unwrap().unwrap();
    assert_eq!(session.status(), SessionStatus::Completed);
    let frozen = live.final_standings(&session).await.unwrap().unwrap();
    let results = live.session_results(&session).await.unwrap().final_results.unwrap();
    assert_eq!(frozen.entries, results.leaderboard);
    assert_eq!(frozen.entries[0].player_id, a.player.id);
    assert_eq!(frozen.entries[1].player_id, b.player.id);

    // The event stream is finished for good; late observers get nothing to wait on.
    assert!(live.hub().subscribe(id).is_none());
}
