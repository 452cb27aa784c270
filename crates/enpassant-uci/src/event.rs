//! Incoming line decoding.
//!
//! Decoding never fails fatally: engines are free to emit vendor-specific
//! diagnostic lines, so anything unknown becomes `Unrecognized` and is the
//! caller's to log and drop.

/// One decoded engine output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UciEvent {
    /// `uciok` - handshake complete, option declarations are done.
    UciOk,
    /// `readyok` - the engine reached a safe point.
    ReadyOk,
    /// `id name ...` / `id author ...`.
    Id { field: String, value: String },
    /// `option name <name> type ...` - the engine acknowledges supporting
    /// this option. Collected during the handshake.
    OptionDecl { name: String },
    /// `info ... [multipv N] ... score {cp|mate} X ... pv ...`.
    Info(InfoLine),
    /// `bestmove <move> [ponder <move>]`.
    BestMove {
        best_move: String,
        ponder: Option<String>,
    },
    /// Anything else, kept verbatim for logging.
    Unrecognized(String),
}

/// Parsed fields of one `info` line. Absent tokens stay `None`; `multipv`
/// defaults to 1 since single-PV engines omit the token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoLine {
    pub multipv: u32,
    pub depth: Option<u32>,
    pub seldepth: Option<u32>,
    pub nodes: Option<u64>,
    pub time_ms: Option<u64>,
    pub nps: Option<u64>,
    pub score_cp: Option<i32>,
    pub score_mate: Option<i32>,
    pub pv: Vec<String>,
}

impl InfoLine {
    /// True when the line carries a line of play worth recording.
    pub fn has_pv(&self) -> bool {
        !self.pv.is_empty() && (self.score_cp.is_some() || self.score_mate.is_some())
    }
}

/// Decode one raw output line into an event.
pub fn decode_line(line: &str) -> UciEvent {
    let line = line.trim();
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some("uciok") => UciEvent::UciOk,
        Some("readyok") => UciEvent::ReadyOk,
        Some("id") => match tokens.next() {
            Some(field @ ("name" | "author")) => UciEvent::Id {
                field: field.to_string(),
                value: tokens.collect::<Vec<_>>().join(" "),
            },
            _ => UciEvent::Unrecognized(line.to_string()),
        },
        Some("option") => match parse_option_name(line) {
            Some(name) => UciEvent::OptionDecl { name },
            None => UciEvent::Unrecognized(line.to_string()),
        },
        Some("info") => UciEvent::Info(parse_info(line)),
        Some("bestmove") => {
            let best_move = match tokens.next() {
                Some(mv) => mv.to_string(),
                None => return UciEvent::Unrecognized(line.to_string()),
            };
            let ponder = match (tokens.next(), tokens.next()) {
                (Some("ponder"), Some(mv)) => Some(mv.to_string()),
                _ => None,
            };
            UciEvent::BestMove { best_move, ponder }
        }
        _ => UciEvent::Unrecognized(line.to_string()),
    }
}

/// Extract the option name from an `option name <name> type ...` line.
pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok == "name" {
            let mut parts = Vec::new();
            while let Some(next) = tokens.peek() {
                if *next == "type" {
                    break;
                }
                parts.push(tokens.next().unwrap_or_default().to_string());
            }
            if !parts.is_empty() {
                return Some(parts.join(" "));
            }
        }
    }
    None
}

fn parse_info(line: &str) -> InfoLine {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut info = InfoLine {
        multipv: 1,
        ..InfoLine::default()
    };
    let mut i = 1;
    while i < tokens.len() {
        match tokens[i] {
            "multipv" => {
                if i + 1 < tokens.len() {
                    info.multipv = tokens[i + 1].parse().unwrap_or(1);
                    i += 1;
                }
            }
            "depth" => {
                if i + 1 < tokens.len() {
                    info.depth = tokens[i + 1].parse().ok();
                    i += 1;
                }
            }
            "seldepth" => {
                if i + 1 < tokens.len() {
                    info.seldepth = tokens[i + 1].parse().ok();
                    i += 1;
                }
            }
            "nodes" => {
                if i + 1 < tokens.len() {
                    info.nodes = tokens[i + 1].parse().ok();
                    i += 1;
                }
            }
            "time" => {
                if i + 1 < tokens.len() {
                    info.time_ms = tokens[i + 1].parse().ok();
                    i += 1;
                }
            }
            "nps" => {
                if i + 1 < tokens.len() {
                    info.nps = tokens[i + 1].parse().ok();
                    i += 1;
                }
            }
            "score" => {
                if i + 2 < tokens.len() {
                    match tokens[i + 1] {
                        "cp" => {
                            info.score_cp = tokens[i + 2].parse().ok();
                            info.score_mate = None;
                            i += 2;
                        }
                        "mate" => {
                            info.score_mate = tokens[i + 2].parse().ok();
                            info.score_cp = None;
                            i += 2;
                        }
                        _ => {}
                    }
                }
            }
            "pv" => {
                info.pv = tokens[i + 1..].iter().map(|s| s.to_string()).collect();
                break;
            }
            _ => {}
        }
        i += 1;
    }
    info
}
