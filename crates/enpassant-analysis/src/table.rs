//! Concurrency-safe registry of active sessions keyed by caller id.
//!
//! The table exclusively owns every session for its lifetime; workers and
//! the orchestrator only reach sessions through these atomic operations.
//! A session is removed the moment its terminal result has been handed to
//! the caller, which is what frees its id for reuse.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crossbeam_channel::Sender;
use enpassant_uci::{InfoLine, MoveRequest, MoveResponse, SearchLimit};
use log::debug;
use parking_lot::Mutex;

use crate::error::AnalysisError;
use crate::session::{Session, SessionState, SessionUpdate, TerminalResult};

/// What a worker finds when it dequeues a session's job.
pub enum BindOutcome {
    /// Bind succeeded; drive the search with these parameters.
    Proceed {
        request: MoveRequest,
        limit: SearchLimit,
        stop: Arc<AtomicBool>,
        options: Vec<(String, String)>,
    },
    /// The session was cancelled (and removed) while queued; skip it
    /// without any engine interaction.
    Gone,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// Removed from the wait queue; terminal already delivered.
    WasQueued,
    /// Stop flag raised; the bound worker delivers the terminal after the
    /// engine acknowledges with its bestmove.
    WasRunning,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Fails while a prior session with the same
    /// id is still active.
    pub fn create(
        &self,
        request: MoveRequest,
        limit: SearchLimit,
        result_tx: Sender<TerminalResult>,
        update_tx: Option<Sender<SessionUpdate>>,
    ) -> Result<(), AnalysisError> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&request.id) {
            return Err(AnalysisError::AlreadyExists(request.id));
        }
        let id = request.id.clone();
        sessions.insert(id, Session::new(request, limit, result_tx, update_tx));
        Ok(())
    }

    /// Remove a session that was never handed to the pool (admission
    /// failure); no terminal is delivered since the caller gets the
    /// submission error synchronously.
    pub fn remove_unsubmitted(&self, id: &str) {
        self.sessions.lock().remove(id);
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Transition `Queued -> Running` and hand the worker what it needs.
    pub fn bind(&self, id: &str) -> BindOutcome {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(session) => {
                session.state = SessionState::Running;
                BindOutcome::Proceed {
                    request: session.request.clone(),
                    limit: session.limit,
                    stop: Arc::clone(&session.stop),
                    options: std::mem::take(&mut session.pending_options),
                }
            }
            None => BindOutcome::Gone,
        }
    }

    /// Merge new variation data and push a streaming refinement if the
    /// picture changed. A closed stream is the streaming caller's
    /// cancellation signal: it raises the stop flag so the bound worker
    /// stops the engine instead of searching to its limit.
    pub fn record_info(&self, id: &str, info: &InfoLine) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(id) {
            if session.apply_info(info) {
                if let Some(update_tx) = &session.update_tx {
                    if update_tx
                        .send(SessionUpdate::Variations(session.snapshot_variations()))
                        .is_err()
                    {
                        debug!("stream receiver for '{id}' gone, cancelling session");
                        session.request_cancel();
                    }
                }
            }
        }
    }

    /// Terminal: engine reported a definitive best move. Snapshots the
    /// response, delivers it, and removes the session.
    pub fn complete(
        &self,
        id: &str,
        best_move: String,
        ponder_move: Option<String>,
    ) -> Option<MoveResponse> {
        let session = self.sessions.lock().remove(id)?;
        let result_tx = session.result_tx.clone();
        let update_tx = session.update_tx.clone();
        let response = session.into_response(best_move, ponder_move);
        if let Some(update_tx) = update_tx {
            let _ = update_tx.send(SessionUpdate::Completed(response.clone()));
        }
        let _ = result_tx.send(Ok(response.clone()));
        Some(response)
    }

    /// Terminal: engine/process fault scoped to this session.
    pub fn fail(&self, id: &str, error: AnalysisError) {
        let Some(session) = self.sessions.lock().remove(id) else {
            return;
        };
        debug!("session {id} failed: {error}");
        if let Some(update_tx) = &session.update_tx {
            let _ = update_tx.send(SessionUpdate::Failed(error.to_string()));
        }
        let _ = session.result_tx.send(Err(error));
    }

    /// Terminal: the session was cancelled while running and its engine
    /// has acknowledged (or the search otherwise wound down).
    pub fn finish_cancelled(&self, id: &str) {
        let Some(session) = self.sessions.lock().remove(id) else {
            return;
        };
        if let Some(update_tx) = &session.update_tx {
            let _ = update_tx.send(SessionUpdate::Cancelled);
        }
        let _ = session.result_tx.send(Err(AnalysisError::Cancelled));
    }

    /// Cancel a session. Queued sessions are removed immediately with no
    /// engine interaction; running sessions get their stop flag raised and
    /// the bound worker finishes the cancellation.
    pub fn cancel(&self, id: &str) -> Result<CancelKind, AnalysisError> {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get(id) else {
            return Err(AnalysisError::NotFound(id.to_string()));
        };
        match session.state {
            SessionState::Queued => {
                let session = sessions
                    .remove(id)
                    .unwrap_or_else(|| unreachable!("session checked above"));
                drop(sessions);
                if let Some(update_tx) = &session.update_tx {
                    let _ = update_tx.send(SessionUpdate::Cancelled);
                }
                let _ = session.result_tx.send(Err(AnalysisError::Cancelled));
                Ok(CancelKind::WasQueued)
            }
            SessionState::Running => {
                session.request_cancel();
                Ok(CancelKind::WasRunning)
            }
        }
    }

    /// Attach an option update to a live session; it is applied at the
    /// session's next safe point (before its search starts).
    pub fn push_option(&self, id: &str, name: String, value: String) -> Result<(), AnalysisError> {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(id) {
            Some(session) => {
                session.pending_options.push((name, value));
                Ok(())
            }
            None => Err(AnalysisError::NotFound(id.to_string())),
        }
    }

    /// Fail every remaining session; used on service shutdown so no
    /// caller is left blocked.
    pub fn fail_all_shutdown(&self) {
        let drained: Vec<Session> = {
            let mut sessions = self.sessions.lock();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            if let Some(update_tx) = &session.update_tx {
                let _ = update_tx.send(SessionUpdate::Failed("service shutting down".to_string()));
            }
            let _ = session.result_tx.send(Err(AnalysisError::Shutdown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use enpassant_uci::STARTPOS_FEN;

    fn request(id: &str) -> MoveRequest {
        MoveRequest {
            id: id.to_string(),
            starting_fen: STARTPOS_FEN.to_string(),
            moves: vec![],
            multipv: 1,
        }
    }

    fn info_cp(cp: i32, pv: &[&str]) -> InfoLine {
        InfoLine {
            multipv: 1,
            depth: Some(10),
            score_cp: Some(cp),
            pv: pv.iter().map(|s| s.to_string()).collect(),
            ..InfoLine::default()
        }
    }

    #[test]
    fn duplicate_id_rejected_until_terminal() {
        let table = SessionTable::new();
        let (tx1, _rx1) = bounded(1);
        let (tx2, _rx2) = bounded(1);
        table
            .create(request("s1"), SearchLimit::depth(5), tx1, None)
            .unwrap();
        let err = table
            .create(request("s1"), SearchLimit::depth(5), tx2, None)
            .unwrap_err();
        assert!(matches!(err, AnalysisError::AlreadyExists(_)));

        table.complete("s1", "e2e4".to_string(), None).unwrap();
        let (tx3, _rx3) = bounded(1);
        table
            .create(request("s1"), SearchLimit::depth(5), tx3, None)
            .unwrap();
    }

    #[test]
    fn cancel_queued_delivers_terminal_and_frees_id() {
        let table = SessionTable::new();
        let (tx, rx) = bounded(1);
        table
            .create(request("s1"), SearchLimit::depth(5), tx, None)
            .unwrap();
        assert_eq!(table.cancel("s1").unwrap(), CancelKind::WasQueued);
        assert!(matches!(rx.try_recv().unwrap(), Err(AnalysisError::Cancelled)));
        assert!(matches!(table.bind("s1"), BindOutcome::Gone));
        assert!(matches!(
            table.cancel("s1").unwrap_err(),
            AnalysisError::NotFound(_)
        ));
    }

    #[test]
    fn cancel_running_raises_stop_flag() {
        let table = SessionTable::new();
        let (tx, rx) = bounded(1);
        table
            .create(request("s1"), SearchLimit::depth(5), tx, None)
            .unwrap();
        let BindOutcome::Proceed { stop, .. } = table.bind("s1") else {
            panic!("expected bind to proceed");
        };
        assert_eq!(table.cancel("s1").unwrap(), CancelKind::WasRunning);
        assert!(stop.load(std::sync::atomic::Ordering::Acquire));
        table.finish_cancelled("s1");
        assert!(matches!(rx.try_recv().unwrap(), Err(AnalysisError::Cancelled)));
    }

    #[test]
    fn complete_snapshots_accumulated_variations() {
        let table = SessionTable::new();
        let (tx, rx) = bounded(1);
        table
            .create(request("s1"), SearchLimit::depth(5), tx, None)
            .unwrap();
        table.bind("s1");
        table.record_info("s1", &info_cp(20, &["e2e4", "e7e5"]));
        let resp = table
            .complete("s1", "e2e4".to_string(), Some("e7e5".to_string()))
            .unwrap();
        assert_eq!(resp.best_move, "e2e4");
        assert_eq!(resp.variations.len(), 1);
        assert_eq!(resp.best_move, resp.variations[0].moves[0]);
        assert_eq!(rx.try_recv().unwrap().unwrap(), resp);
    }

    #[test]
    fn fail_removes_and_reports() {
        let table = SessionTable::new();
        let (tx, rx) = bounded(1);
        table
            .create(request("s1"), SearchLimit::depth(5), tx, None)
            .unwrap();
        table.bind("s1");
        table.fail("s1", AnalysisError::EngineFailure("boom".to_string()));
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(AnalysisError::EngineFailure(_))
        ));
        assert!(!table.is_active("s1"));
    }

    #[test]
    fn dropped_stream_receiver_cancels_the_session() {
        let table = SessionTable::new();
        let (tx, _rx) = bounded(1);
        let (update_tx, update_rx) = crossbeam_channel::unbounded();
        table
            .create(request("s1"), SearchLimit::depth(5), tx, Some(update_tx))
            .unwrap();
        let BindOutcome::Proceed { stop, .. } = table.bind("s1") else {
            panic!("expected bind to proceed");
        };
        drop(update_rx);
        table.record_info("s1", &info_cp(10, &["e2e4"]));
        assert!(stop.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn streaming_updates_flow_through_update_channel() {
        let table = SessionTable::new();
        let (tx, _rx) = bounded(1);
        let (update_tx, update_rx) = crossbeam_channel::unbounded();
        table
            .create(request("s1"), SearchLimit::depth(5), tx, Some(update_tx))
            .unwrap();
        table.bind("s1");
        table.record_info("s1", &info_cp(15, &["e2e4"]));
        table.record_info("s1", &info_cp(25, &["d2d4"]));
        table.complete("s1", "d2d4".to_string(), None).unwrap();

        let updates: Vec<SessionUpdate> = update_rx.try_iter().collect();
        assert_eq!(updates.len(), 3);
        assert!(matches!(updates[0], SessionUpdate::Variations(_)));
        assert!(matches!(updates[2], SessionUpdate::Completed(_)));
    }
}
