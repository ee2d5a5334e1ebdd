// Territory allocator rules for team battles.
//
// The single-writer guarantee lives in the store: a claim is one conditional
// UPDATE that only matches an unclaimed territory of a live session. The
// helpers here build the map, check that a correct answer can fund a claim,
// and explain why a conditional write matched nothing.

use serde::{Deserialize, Serialize};

use super::config::MAX_MAP_SIDE;
use super::lifecycle::{require, Operation, SessionStatus};
use crate::error::GameError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub row: i64,
    pub col: i64,
}

/// Spreadsheet-style label: row letter, 1-based column number ("B3").
pub fn cell_label(row: i64, col: i64) -> String {
    let letter = (b'A' + row as u8) as char;
    format!("{letter}{}", col + 1)
}

pub fn validate_map(rows: i64, cols: i64) -> Result<(), GameError> {
    if !(1..=MAX_MAP_SIDE).contains(&rows) || !(1..=MAX_MAP_SIDE).contains(&cols) {
        return Err(GameError::validation(
            "map",
            format!("rows and cols must be between 1 and {MAX_MAP_SIDE}"),
        ));
    }
    Ok(())
}

/// All cells of a `rows` x `cols` map in row-major order.
pub fn grid(rows: i64, cols: i64) -> Vec<(Coordinate, String)> {
    let mut cells = Vec::with_capacity((rows * cols).max(0) as usize);
    for row in 0..rows {
        for col in 0..cols {
            cells.push((Coordinate { row, col }, cell_label(row, col)));
        }
    }
    cells
}

pub fn validate_coordinate(rows: i64, cols: i64, coord: Coordinate) -> Result<(), GameError> {
    if coord.row < 0 || coord.row >= rows || coord.col < 0 || coord.col >= cols {
        return Err(GameError::validation(
            "territory",
            format!("coordinate ({}, {}) is outside the {rows}x{cols} map", coord.row, coord.col),
        ));
    }
    Ok(())
}

/// A correct answer that may pay for one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimCredit {
    pub question_id: i64,
    /// Questions pinned to a map cell only fund a claim on that cell.
    pub coordinate: Option<Coordinate>,
}

pub fn check_credit(credit: &ClaimCredit, target: Coordinate) -> Result<(), GameError> {
    match credit.coordinate {
        Some(pinned) if pinned != target => Err(GameError::ClaimNotEarned),
        _ => Ok(()),
    }
}

/// Snapshot of a territory row read after a claim lost the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerritoryState {
    pub owner_team_id: Option<i64>,
}

/// Explain why the conditional claim write matched no row. Session state is
/// checked first so a claim against a finished game reports the game state.
pub fn diagnose_rejected_claim(
    status: SessionStatus,
    territory: Option<TerritoryState>,
) -> GameError {
    if let Err(e) = require(status, Operation::ClaimTerritory) {
        return e;
    }
    match territory {
        None => GameError::TerritoryNotFound,
        Some(_) => GameError::TerritoryAlreadyClaimed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_labels() {
        assert_eq!(cell_label(0, 0), "A1");
        assert_eq!(cell_label(1, 2), "B3");
        assert_eq!(cell_label(4, 4), "E5");
    }

    #[test]
    fn test_grid_is_row_major() {
        let cells = grid(2, 3);
        assert_eq!(cells.len(), 6);
        assert_eq!(cells[0].1, "A1");
        assert_eq!(cells[2].1, "A3");
        assert_eq!(cells[3].0, Coordinate { row: 1, col: 0 });
    }

    #[test]
    fn test_map_bounds() {
        assert!(validate_map(5, 5).is_ok());
        assert!(validate_map(0, 5).is_err());
        assert!(validate_map(5, MAX_MAP_SIDE + 1).is_err());
        assert!(validate_coordinate(5, 5, Coordinate { row: 4, col: 4 }).is_ok());
        assert!(validate_coordinate(5, 5, Coordinate { row: 5, col: 0 }).is_err());
        assert!(validate_coordinate(5, 5, Coordinate { row: 0, col: -1 }).is_err());
    }

    #[test]
    fn test_pinned_credit_only_funds_its_cell() {
        let pinned = ClaimCredit {
            question_id: 1,
            coordinate: Some(Coordinate { row: 1, col: 1 }),
        };
        assert!(check_credit(&pinned, Coordinate { row: 1, col: 1 }).is_ok());
        assert!(matches!(
            check_credit(&pinned, Coordinate { row: 0, col: 1 }),
            Err(GameError::ClaimNotEarned)
        ));

        let free = ClaimCredit {
            question_id: 2,
            coordinate: None,
        };
        assert!(check_credit(&free, Coordinate { row: 3, col: 0 }).is_ok());
    }

    #[test]
    fn test_diagnose_rejected_claim() {
        let claimed = Some(TerritoryState {
            owner_team_id: Some(2),
        });
        assert!(matches!(
            diagnose_rejected_claim(SessionStatus::Live, claimed),
            GameError::TerritoryAlreadyClaimed
        ));
        assert!(matches!(
            diagnose_rejected_claim(SessionStatus::Live, None),
            GameError::TerritoryNotFound
        ));
        assert!(matches!(
            diagnose_rejected_claim(SessionStatus::Completed, claimed),
            GameError::InvalidSessionState { .. }
        ));
    }
}
