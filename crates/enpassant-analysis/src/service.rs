//! Orchestrator: the only externally callable surface.
//!
//! Translates the wire contracts into session table and pool operations.
//! `request_move` blocks its logical caller until the session reaches a
//! terminal state without ever blocking other sessions, which proceed on
//! their own pool slots.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError};
use enpassant_uci::{MoveRequest, MoveResponse, OptionUpdate};
use log::{debug, info};

use crate::config::ServiceConfig;
use crate::error::AnalysisError;
use crate::pool::{EnginePool, Job};
use crate::session::SessionUpdate;
use crate::table::{CancelKind, SessionTable};

/// Engine targets accepted by `apply_option` besides live session ids:
/// `engine` / `*` broadcast to every slot, `engine-<i>` addresses one.
const GLOBAL_TARGETS: [&str; 2] = ["engine", "*"];

pub struct AnalysisService {
    cfg: ServiceConfig,
    table: Arc<SessionTable>,
    pool: EnginePool,
}

impl AnalysisService {
    /// Start the engine pool and take requests.
    pub fn new(cfg: ServiceConfig) -> Result<Self, AnalysisError> {
        let table = Arc::new(SessionTable::new());
        let pool = EnginePool::new(&cfg, Arc::clone(&table))?;
        Ok(Self { cfg, table, pool })
    }

    /// Analyze one position and block until its terminal result.
    pub fn request_move(&self, request: MoveRequest) -> Result<MoveResponse, AnalysisError> {
        validate_request(&request)?;
        let id = request.id.clone();
        let (result_tx, result_rx) = bounded(1);
        self.table
            .create(request, self.cfg.limits.search_limit(), result_tx, None)?;
        self.submit_or_unwind(&id)?;
        self.await_result(&id, result_rx)
    }

    /// Analyze one position, streaming intermediate variation refinements.
    ///
    /// The returned channel yields `Variations` updates in non-decreasing
    /// refinement order per PV index, then exactly one terminal update.
    /// The caller is responsible for its own deadline; `cancel` closes the
    /// stream with a `Cancelled` terminal.
    pub fn request_move_streaming(
        &self,
        request: MoveRequest,
    ) -> Result<Receiver<SessionUpdate>, AnalysisError> {
        validate_request(&request)?;
        let id = request.id.clone();
        // The blocking-result channel goes unwatched; the stream carries
        // the terminal too.
        let (result_tx, _result_rx) = bounded(1);
        let (update_tx, update_rx) = unbounded();
        self.table.create(
            request,
            self.cfg.limits.search_limit(),
            result_tx,
            Some(update_tx),
        )?;
        self.submit_or_unwind(&id)?;
        Ok(update_rx)
    }

    /// Apply a named engine option to a live session or an engine target.
    pub fn apply_option(&self, update: OptionUpdate) -> Result<(), AnalysisError> {
        if update.name.trim().is_empty() {
            return Err(AnalysisError::Validation("empty option name".to_string()));
        }
        let target = update.id.trim();
        if self.table.is_active(target) {
            debug!("option '{}' attached to session '{target}'", update.name);
            return self.table.push_option(target, update.name, update.value);
        }
        if GLOBAL_TARGETS.contains(&target) {
            debug!("option '{}' broadcast to all engines", update.name);
            self.pool.broadcast_option(&update.name, &update.value);
            return Ok(());
        }
        if let Some(slot) = target
            .strip_prefix("engine-")
            .and_then(|s| s.parse::<usize>().ok())
        {
            return self.pool.option_to_slot(slot, update.name, update.value);
        }
        Err(AnalysisError::UnknownTarget(update.id))
    }

    /// Cancel a queued or running session.
    pub fn cancel(&self, id: &str) -> Result<(), AnalysisError> {
        match self.table.cancel(id)? {
            CancelKind::WasQueued => debug!("session '{id}' cancelled while queued"),
            CancelKind::WasRunning => debug!("session '{id}' cancelled; engine stopping"),
        }
        Ok(())
    }

    pub fn slots(&self) -> usize {
        self.pool.slots()
    }

    /// Stop taking work, join the engine workers, and fail any sessions
    /// still registered so no caller stays blocked.
    pub fn shutdown(&mut self) {
        info!("analysis service shutting down");
        self.pool.shutdown();
        self.table.fail_all_shutdown();
    }

    fn submit_or_unwind(&self, id: &str) -> Result<(), AnalysisError> {
        if let Err(err) = self.pool.submit(Job { id: id.to_string() }) {
            // Admission failures are side-effect free: the session must
            // not survive them or its id would stay burned.
            self.table.remove_unsubmitted(id);
            return Err(err);
        }
        Ok(())
    }

    fn await_result(
        &self,
        id: &str,
        result_rx: Receiver<Result<MoveResponse, AnalysisError>>,
    ) -> Result<MoveResponse, AnalysisError> {
        match result_rx.recv_timeout(self.request_timeout()) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // Best effort: stop the engine and reconcile the session.
                let _ = self.table.cancel(id);
                Err(AnalysisError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::EngineFailure(format!(
                "session '{id}' lost without a terminal result"
            ))),
        }
    }

    fn request_timeout(&self) -> Duration {
        self.cfg.limits.request_timeout()
    }
}

impl Drop for AnalysisService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reject requests malformed enough to corrupt the line protocol before
/// any engine is touched. Chess legality stays the caller's problem.
fn validate_request(request: &MoveRequest) -> Result<(), AnalysisError> {
    if request.id.trim().is_empty() {
        return Err(AnalysisError::Validation("empty session id".to_string()));
    }
    if request.multipv < 1 {
        return Err(AnalysisError::Validation(format!(
            "multipv must be >= 1, got {}",
            request.multipv
        )));
    }
    if request.multipv > 500 {
        return Err(AnalysisError::Validation(format!(
            "multipv {} exceeds engine limits",
            request.multipv
        )));
    }
    let fen = request.starting_fen.trim();
    if fen.is_empty() {
        return Err(AnalysisError::Validation("empty starting_fen".to_string()));
    }
    if fen.chars().any(|c| c.is_control()) {
        return Err(AnalysisError::Validation(
            "starting_fen contains control characters".to_string(),
        ));
    }
    let board = fen.split_whitespace().next().unwrap_or("");
    if board.matches('/').count() != 7 {
        return Err(AnalysisError::Validation(format!(
            "starting_fen board field malformed: '{board}'"
        )));
    }
    for mv in &request.moves {
        let ok = !mv.is_empty()
            && mv.len() <= 8
            && mv.chars().all(|c| c.is_ascii_alphanumeric());
        if !ok {
            return Err(AnalysisError::Validation(format!("malformed move token '{mv}'")));
        }
    }
    Ok(())
}
