// Per-session event fan-out to WebSocket observers.
//
// One broadcast channel per session, created on first use and closed for good
// when the session ends. Only channels and the latest leaderboard frame live
// here; all game state is in the store.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use super::leaderboard::{LeaderboardEntry, TeamStanding};
use super::lifecycle::SessionStatus;

const CHANNEL_CAPACITY: usize = 256;

/// Events pushed to everyone watching a session.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Status {
        session_id: i64,
        status: SessionStatus,
    },
    PlayerJoined {
        session_id: i64,
        player_id: i64,
        name: String,
        team_id: Option<i64>,
    },
    Leaderboard {
        session_id: i64,
        entries: Vec<LeaderboardEntry>,
        teams: Vec<TeamStanding>,
    },
    TerritoryClaimed {
        session_id: i64,
        territory_id: i64,
        label: String,
        team_id: i64,
        player_id: i64,
    },
    Achievements {
        session_id: i64,
        player_id: i64,
        unlocked: Vec<String>,
    },
    Completed {
        session_id: i64,
        mvp_player_id: Option<i64>,
        leaderboard: Vec<LeaderboardEntry>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> i64 {
        match self {
            SessionEvent::Status { session_id, .. }
            | SessionEvent::PlayerJoined { session_id, .. }
            | SessionEvent::Leaderboard { session_id, .. }
            | SessionEvent::TerritoryClaimed { session_id, .. }
            | SessionEvent::Achievements { session_id, .. }
            | SessionEvent::Completed { session_id, .. } => *session_id,
        }
    }
}

struct Channel {
    tx: broadcast::Sender<String>,
    /// Last leaderboard frame, replayed to late subscribers.
    latest_leaderboard: Option<String>,
}

impl Channel {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            latest_leaderboard: None,
        }
    }
}

#[derive(Default)]
struct Channels {
    open: HashMap<i64, Channel>,
    /// Sessions that completed or were deleted; never reopened.
    closed: HashSet<i64>,
}

#[derive(Default)]
pub struct SessionHub {
    channels: Mutex<Channels>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe to a session's events. Also returns the latest leaderboard
    /// frame so a new observer can render standings immediately. `None` once
    /// the session's channel has been closed.
    pub fn subscribe(&self, session_id: i64) -> Option<(broadcast::Receiver<String>, Option<String>)> {
        let mut channels = self.channels();
        if channels.closed.contains(&session_id) {
            return None;
        }
        let channel = channels.open.entry(session_id).or_insert_with(Channel::new);
        Some((channel.tx.subscribe(), channel.latest_leaderboard.clone()))
    }

    /// Serialize once and send to every subscriber. Returns how many received it.
    pub fn publish(&self, event: &SessionEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize session event: {e}");
                return 0;
            }
        };
        let mut channels = self.channels();
        if channels.closed.contains(&event.session_id()) {
            return 0;
        }
        let channel = channels
            .open
            .entry(event.session_id())
            .or_insert_with(Channel::new);
        if matches!(event, SessionEvent::Leaderboard { .. }) {
            channel.latest_leaderboard = Some(json.clone());
        }
        // No receivers is not an error.
        channel.tx.send(json).unwrap_or(0)
    }

    /// Drop a session's channel; subscribers drain what is buffered, then see it closed.
    pub fn close(&self, session_id: i64) {
        let mut channels = self.channels();
        channels.open.remove(&session_id);
        channels.closed.insert(session_id);
    }

    pub fn observer_count(&self, session_id: i64) -> usize {
        self.channels()
            .open
            .get(&session_id)
            .map(|c| c.tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(session_id: i64) -> SessionEvent {
        SessionEvent::Status {
            session_id,
            status: SessionStatus::Live,
        }
    }

    #[test]
    fn test_events_are_tagged() {
        let json = serde_json::to_value(status(3)).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["status"], "live");
        assert_eq!(json["session_id"], 3);
    }

    #[tokio::test]
    async fn test_publish_reaches_only_that_session() {
        let hub = SessionHub::new();
        let (mut rx1, _) = hub.subscribe(1).unwrap();
        let (mut rx2, _) = hub.subscribe(2).unwrap();

        assert_eq!(hub.publish(&status(1)), 1);
        let msg = rx1.recv().await.unwrap();
        assert!(msg.contains("\"session_id\":1"));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_latest_leaderboard() {
        let hub = SessionHub::new();
        hub.publish(&SessionEvent::Leaderboard {
            session_id: 9,
            entries: vec![],
            teams: vec![],
        });
        let (_rx, latest) = hub.subscribe(9).unwrap();
        assert!(latest.unwrap().contains("leaderboard"));
        assert_eq!(hub.observer_count(9), 1);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let hub = SessionHub::new();
        let (mut rx, _) = hub.subscribe(4).unwrap();
        hub.publish(&status(4));
        hub.close(4);
        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert_eq!(hub.observer_count(4), 0);
    }

    #[test]
    fn test_closed_session_stays_closed() {
        let hub = SessionHub::new();
        hub.publish(&status(5));
        hub.close(5);

        assert!(hub.subscribe(5).is_none());
        assert_eq!(hub.publish(&status(5)), 0);
        assert_eq!(hub.observer_count(5), 0);
        // Other sessions are unaffected.
        assert!(hub.subscribe(6).is_some());
    }
}
