//! Outgoing command encoding.
//!
//! Each function produces one complete protocol line without the trailing
//! newline; the process handle owns framing and flushing.

use crate::STARTPOS_FEN;

/// Bounds for one search. All fields optional; an empty limit encodes
/// `go infinite` and relies on an explicit `stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchLimit {
    pub depth: Option<u32>,
    pub movetime_ms: Option<u64>,
    pub nodes: Option<u64>,
}

impl SearchLimit {
    pub fn depth(depth: u32) -> Self {
        Self {
            depth: Some(depth),
            ..Self::default()
        }
    }

    pub fn movetime_ms(ms: u64) -> Self {
        Self {
            movetime_ms: Some(ms),
            ..Self::default()
        }
    }
}

/// `setoption name <name> value <value>`.
pub fn encode_set_option(name: &str, value: &str) -> String {
    format!("setoption name {} value {}", name.trim(), value.trim())
}

/// Prerequisite option line for a multi-PV search. Callers send this only
/// when the requested count differs from the engine's current setting.
pub fn encode_multipv(multipv: u32) -> String {
    encode_set_option("MultiPV", &multipv.to_string())
}

/// `position fen <fen> [moves ...]`, with the `startpos` shortcut when the
/// FEN is the standard initial position.
pub fn encode_position(starting_fen: &str, moves: &[String]) -> String {
    let fen = starting_fen.trim();
    let mut line = if fen == STARTPOS_FEN {
        "position startpos".to_string()
    } else {
        format!("position fen {fen}")
    };
    if !moves.is_empty() {
        line.push_str(" moves");
        for mv in moves {
            line.push(' ');
            line.push_str(mv);
        }
    }
    line
}

/// `go` line for the given limit.
pub fn encode_go(limit: &SearchLimit) -> String {
    let mut line = String::from("go");
    if let Some(depth) = limit.depth {
        line.push_str(&format!(" depth {depth}"));
    }
    if let Some(ms) = limit.movetime_ms {
        line.push_str(&format!(" movetime {ms}"));
    }
    if let Some(nodes) = limit.nodes {
        line.push_str(&format!(" nodes {nodes}"));
    }
    if line == "go" {
        line.push_str(" infinite");
    }
    line
}
