//! Wire contract types shared with the front end.
//!
//! These four shapes are the entire boundary with external collaborators.
//! Field names are canonical; the JSON front end serializes them as-is.

use serde::{Deserialize, Serialize};

/// Applies one named engine configuration option.
///
/// `id` addresses either a live session or an engine target. Option names
/// and values are opaque strings; only the target engine judges them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionUpdate {
    pub id: String,
    pub name: String,
    pub value: String,
}

/// One candidate line of play with its evaluation.
///
/// Exactly one of `score` / `mate` is meaningful: `mate == 0` means "not a
/// mate" and `score` holds the centipawn evaluation; `mate != 0` is a
/// signed mate distance (positive = side to move mates in N) and `score`
/// is inert. Both fields are always present in the wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variation {
    pub moves: Vec<String>,
    pub score: i32,
    pub mate: i32,
}

impl Variation {
    /// Ordering key, ascending = strongest first.
    ///
    /// Mate-for (shorter first) ranks above any finite score, finite
    /// scores rank by descending centipawns, and mate-against ranks last
    /// (longer mates, being harder to convert, above shorter ones).
    pub fn strength_key(&self) -> (u8, i64) {
        if self.mate > 0 {
            (0, i64::from(self.mate))
        } else if self.mate < 0 {
            (2, i64::from(self.mate))
        } else {
            (1, -i64::from(self.score))
        }
    }
}

/// A request to analyze one position.
///
/// `starting_fen` plus `moves` fully determines the position. Chess
/// legality is the caller's responsibility; this core only rejects input
/// malformed enough to corrupt the line protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRequest {
    pub id: String,
    pub starting_fen: String,
    pub moves: Vec<String>,
    pub multipv: i32,
}

/// Terminal result of one analysis.
///
/// `variations` is ordered by descending strength and never longer than
/// the requested `multipv`; `best_move` equals the first move of
/// `variations[0]` when variations are non-empty. `ponder_move` is empty
/// when the engine offered none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveResponse {
    pub id: String,
    pub best_move: String,
    pub ponder_move: String,
    pub variations: Vec<Variation>,
}
