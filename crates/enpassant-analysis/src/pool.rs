//! Engine pool and scheduler.
//!
//! A fixed number of worker threads each own one engine process. Sessions
//! wait in a bounded channel and are served strictly first-in-first-out;
//! the channel is the only admission control, so saturation is a plain
//! `try_send` failure. Option updates addressed to engines travel on
//! per-worker side channels and are applied at safe points between
//! searches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use enpassant_uci::{MoveRequest, SearchLimit, UciEvent};
use log::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::engine::EngineProcess;
use crate::error::AnalysisError;
use crate::table::{BindOutcome, SessionTable};

/// How long a worker parks in `recv` before re-checking its option
/// channel.
const IDLE_POLL: Duration = Duration::from_millis(100);
/// Event poll slice while a search is outstanding; bounds stop-flag
/// reaction latency.
const SEARCH_POLL: Duration = Duration::from_millis(25);
/// Admission grace: covers the instant where an idle worker is between
/// `recv` calls, so a zero-capacity queue still hands off to a free slot.
const ADMISSION_GRACE: Duration = Duration::from_millis(50);

/// A queued unit of work. The session table owns everything else.
pub struct Job {
    pub id: String,
}

pub struct EnginePool {
    job_tx: Option<Sender<Job>>,
    option_txs: Vec<Sender<(String, String)>>,
    workers: Vec<JoinHandle<()>>,
}

impl EnginePool {
    /// Spawn all engine slots up front so a bad executable surfaces as
    /// `EngineStart` at construction rather than on the first request.
    pub fn new(cfg: &ServiceConfig, table: Arc<SessionTable>) -> Result<Self, AnalysisError> {
        let slots = cfg.pool.slots.max(1);
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(cfg.pool.queue_capacity);
        let mut option_txs = Vec::with_capacity(slots);
        let mut workers = Vec::with_capacity(slots);
        for slot in 0..slots {
            let label = format!("engine-{slot}");
            let engine = EngineProcess::spawn(&cfg.engine, label.clone())?;
            let (option_tx, option_rx) = crossbeam_channel::unbounded();
            option_txs.push(option_tx);
            let worker = Worker {
                engine,
                table: Arc::clone(&table),
                job_rx: job_rx.clone(),
                option_rx,
                stall_timeout: cfg.limits.stall_timeout(),
                retry_once: cfg.pool.retry_once,
            };
            workers.push(
                std::thread::Builder::new()
                    .name(label)
                    .spawn(move || worker.run())
                    .map_err(|e| AnalysisError::EngineStart(format!("worker spawn: {e}")))?,
            );
        }
        info!("engine pool up: {slots} slot(s), queue capacity {}", cfg.pool.queue_capacity);
        Ok(Self {
            job_tx: Some(job_tx),
            option_txs,
            workers,
        })
    }

    pub fn slots(&self) -> usize {
        self.workers.len()
    }

    /// Admit a session: immediately to a free slot, into the wait queue if
    /// there is room, else `PoolSaturated`.
    pub fn submit(&self, job: Job) -> Result<(), AnalysisError> {
        let Some(job_tx) = &self.job_tx else {
            return Err(AnalysisError::Shutdown);
        };
        match job_tx.send_timeout(job, ADMISSION_GRACE) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::SendTimeoutError::Timeout(_)) => {
                Err(AnalysisError::PoolSaturated)
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => {
                Err(AnalysisError::Shutdown)
            }
        }
    }

    /// Queue an option for one engine slot.
    pub fn option_to_slot(
        &self,
        slot: usize,
        name: String,
        value: String,
    ) -> Result<(), AnalysisError> {
        match self.option_txs.get(slot) {
            Some(tx) => {
                let _ = tx.send((name, value));
                Ok(())
            }
            None => Err(AnalysisError::UnknownTarget(format!("engine-{slot}"))),
        }
    }

    /// Queue an option for every engine slot.
    pub fn broadcast_option(&self, name: &str, value: &str) {
        for tx in &self.option_txs {
            let _ = tx.send((name.to_string(), value.to_string()));
        }
    }

    /// Close the queue and join the workers; queued sessions that were
    /// never bound stay in the table for the caller to reconcile.
    pub fn shutdown(&mut self) {
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("engine worker panicked during shutdown");
            }
        }
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outcome of driving one search exchange to its terminal event.
enum SearchEnd {
    /// Engine reported its definitive best move.
    BestMove {
        best_move: String,
        ponder: Option<String>,
    },
    /// No output for the stall timeout; protocol considered desynchronized.
    Stalled,
}

struct Worker {
    engine: EngineProcess,
    table: Arc<SessionTable>,
    job_rx: Receiver<Job>,
    option_rx: Receiver<(String, String)>,
    stall_timeout: Duration,
    retry_once: bool,
}

impl Worker {
    fn run(mut self) {
        loop {
            self.apply_engine_options();
            match self.job_rx.recv_timeout(IDLE_POLL) {
                Ok(job) => self.handle_job(job),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("{}: worker exiting", self.engine.label);
        // Engine drops here, which sends quit.
    }

    /// Drain dynamically pushed engine options at a safe point.
    fn apply_engine_options(&mut self) {
        let mut applied = false;
        while let Ok((name, value)) = self.option_rx.try_recv() {
            if let Err(e) = self.engine.set_option_if_available(&name, &value) {
                warn!("{}: option '{name}' not applied: {e}", self.engine.label);
                return;
            }
            applied = true;
        }
        if applied {
            if let Err(e) = self.engine.sync_ready() {
                warn!("{}: readyok after options failed: {e}", self.engine.label);
            }
        }
    }

    fn handle_job(&mut self, job: Job) {
        let BindOutcome::Proceed {
            request,
            limit,
            stop,
            options,
        } = self.table.bind(&job.id)
        else {
            // Cancelled while queued; skipped without touching the engine.
            debug!("{}: session '{}' gone before binding", self.engine.label, job.id);
            return;
        };

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.run_search(&request, &limit, &stop, &options) {
                Ok(SearchEnd::BestMove { best_move, ponder }) => {
                    if stop.load(Ordering::Acquire) {
                        self.table.finish_cancelled(&request.id);
                    } else {
                        self.table.complete(&request.id, best_move, ponder);
                    }
                    return;
                }
                Ok(SearchEnd::Stalled) => {
                    warn!(
                        "{}: no output for {:?} on session '{}', restarting",
                        self.engine.label, self.stall_timeout, request.id
                    );
                    if !self.recover(&request.id, attempts, &stop) {
                        return;
                    }
                }
                Err(err) => {
                    warn!(
                        "{}: engine fault on session '{}': {err}",
                        self.engine.label, request.id
                    );
                    if !self.recover(&request.id, attempts, &stop) {
                        return;
                    }
                }
            }
        }
    }

    /// Restart the crashed/stalled engine and decide whether the session
    /// gets its single transparent retry. Returns true to retry.
    fn recover(&mut self, id: &str, attempts: u32, stop: &Arc<AtomicBool>) -> bool {
        if let Err(e) = self.engine.restart() {
            self.table.fail(id, e);
            return false;
        }
        if stop.load(Ordering::Acquire) {
            // The caller asked for cancellation; the engine loss is moot.
            self.table.finish_cancelled(id);
            return false;
        }
        if self.retry_once && attempts == 1 {
            info!("{}: retrying session '{id}' once after restart", self.engine.label);
            return true;
        }
        self.table.fail(
            id,
            AnalysisError::EngineFailure(format!(
                "{}: engine lost mid-analysis",
                self.engine.label
            )),
        );
        false
    }

    /// Drive one full search exchange for a bound session.
    fn run_search(
        &mut self,
        request: &MoveRequest,
        limit: &SearchLimit,
        stop: &Arc<AtomicBool>,
        options: &[(String, String)],
    ) -> Result<SearchEnd, AnalysisError> {
        if self.engine.has_exited() {
            self.engine.restart()?;
        }
        for (name, value) in options {
            self.engine.set_option_if_available(name, value)?;
        }
        self.engine.ensure_multipv(request.multipv.max(1) as u32)?;
        self.engine
            .start_search(&request.starting_fen, &request.moves, limit)?;

        let mut stop_sent = false;
        let mut stall_deadline = Instant::now() + self.stall_timeout;
        loop {
            if stop.load(Ordering::Acquire) && !stop_sent {
                self.engine.send_stop()?;
                stop_sent = true;
            }
            match self.engine.recv_event(SEARCH_POLL) {
                Ok(UciEvent::Info(info)) => {
                    self.table.record_info(&request.id, &info);
                    stall_deadline = Instant::now() + self.stall_timeout;
                }
                Ok(UciEvent::BestMove { best_move, ponder }) => {
                    self.engine.finish_search();
                    return Ok(SearchEnd::BestMove { best_move, ponder });
                }
                Ok(UciEvent::Unrecognized(raw)) => {
                    debug!("{}: ignoring engine line: {raw}", self.engine.label);
                }
                Ok(other) => {
                    debug!("{}: unexpected mid-search event: {other:?}", self.engine.label);
                }
                Err(AnalysisError::Timeout) => {
                    if Instant::now() >= stall_deadline {
                        return Ok(SearchEnd::Stalled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
