//! Per-request session state.
//!
//! A session accumulates the engine's evolving multi-PV picture between
//! submission and its terminal result. Updates are last-writer-wins per
//! PV index, and a later update for an index never regresses reported
//! depth, so the snapshot a caller observes is monotonically refining.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use enpassant_uci::{InfoLine, MoveRequest, MoveResponse, SearchLimit, Variation};

use crate::error::AnalysisError;

/// Lifecycle of one analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for an engine slot.
    Queued,
    /// Bound to an engine, search outstanding.
    Running,
}

/// Streamed refinement or terminal notification for one session.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// Current best-known variations, strongest first.
    Variations(Vec<Variation>),
    Completed(MoveResponse),
    Cancelled,
    Failed(String),
}

/// Terminal outcome delivered to the blocked caller.
pub type TerminalResult = Result<MoveResponse, AnalysisError>;

struct PvSlot {
    variation: Variation,
    depth: u32,
}

/// One in-flight analysis request's tracked state.
pub struct Session {
    pub request: MoveRequest,
    pub limit: SearchLimit,
    pub state: SessionState,
    /// Set by `cancel`; a bound worker polls it and stops its engine.
    pub stop: Arc<AtomicBool>,
    /// Options addressed to this session, applied at its next safe point
    /// (just before its search starts).
    pub pending_options: Vec<(String, String)>,
    pvs: BTreeMap<u32, PvSlot>,
    pub result_tx: Sender<TerminalResult>,
    pub update_tx: Option<Sender<SessionUpdate>>,
}

impl Session {
    pub fn new(
        request: MoveRequest,
        limit: SearchLimit,
        result_tx: Sender<TerminalResult>,
        update_tx: Option<Sender<SessionUpdate>>,
    ) -> Self {
        Self {
            request,
            limit,
            state: SessionState::Queued,
            stop: Arc::new(AtomicBool::new(false)),
            pending_options: Vec::new(),
            pvs: BTreeMap::new(),
            result_tx,
            update_tx,
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_cancel(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Merge one `info` line. Returns true when the session's picture
    /// changed (i.e. a streaming update is worth sending).
    pub fn apply_info(&mut self, info: &InfoLine) -> bool {
        if !info.has_pv() {
            return false;
        }
        let index = info.multipv;
        if index == 0 || index > self.request.multipv.max(1) as u32 {
            return false;
        }
        let depth = info.depth.unwrap_or(0);
        if let Some(existing) = self.pvs.get(&index) {
            if depth < existing.depth {
                return false;
            }
        }
        let variation = Variation {
            moves: info.pv.clone(),
            score: info.score_cp.unwrap_or(0),
            mate: info.score_mate.unwrap_or(0),
        };
        self.pvs.insert(index, PvSlot { variation, depth });
        true
    }

    /// Best-known variations, ordered by descending strength, capped at
    /// the requested multipv.
    pub fn snapshot_variations(&self) -> Vec<Variation> {
        let mut vars: Vec<Variation> = self.pvs.values().map(|s| s.variation.clone()).collect();
        vars.sort_by_key(Variation::strength_key);
        vars.truncate(self.request.multipv.max(1) as usize);
        vars
    }

    /// Snapshot the terminal response.
    ///
    /// The engine's definitive choice leads the variation list even when a
    /// transient line on another PV index (one the engine later abandoned
    /// without refreshing) would outrank the final first PV by raw
    /// strength. Pinning happens before the multipv cap so the winning
    /// line can never be truncated away by such a leftover.
    pub fn into_response(self, best_move: String, ponder_move: Option<String>) -> MoveResponse {
        let mut variations: Vec<Variation> =
            self.pvs.values().map(|s| s.variation.clone()).collect();
        variations.sort_by_key(Variation::strength_key);
        if let Some(pos) = variations
            .iter()
            .position(|v| v.moves.first() == Some(&best_move))
        {
            if pos != 0 {
                let pinned = variations.remove(pos);
                variations.insert(0, pinned);
            }
        }
        variations.truncate(self.request.multipv.max(1) as usize);
        MoveResponse {
            id: self.request.id,
            best_move,
            ponder_move: ponder_move.unwrap_or_default(),
            variations,
        }
    }
}
