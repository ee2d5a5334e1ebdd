// Frozen results: the final leaderboard of a completed session, compressed
// for storage in the session history.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::engine::leaderboard::{LeaderboardEntry, TeamStanding};

/// Everything needed to report results after the session is over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalSnapshot {
    pub session_id: i64,
    pub completed_at: String,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub teams: Vec<TeamStanding>,
    pub mvp_player_id: Option<i64>,
}

impl FinalSnapshot {
    /// Serialize and gzip the snapshot.
    pub fn compress(&self) -> Result<Vec<u8>, std::io::Error> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&json)?;
        encoder.finish()
    }

    pub fn decompress(data: &[u8]) -> Result<Self, std::io::Error> {
        let mut decoder = GzDecoder::new(data);
        let mut json = String::new();
        decoder.read_to_string(&mut json)?;
        Ok(serde_json::from_str(&json)?)
    }
}
