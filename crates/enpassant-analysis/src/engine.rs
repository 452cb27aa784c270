//! Engine process handle: owns one spawned UCI engine and its raw I/O.
//!
//! The line protocol is an inherently stateful, sequential handshake, so
//! the handle tracks an explicit state machine (`Uninitialized -> Ready ->
//! Searching -> Ready`) and rejects out-of-order commands instead of
//! letting them desynchronize the engine.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use enpassant_uci::{decode_line, encode_go, encode_multipv, encode_position, encode_set_option, SearchLimit, UciEvent};
use log::{debug, warn};

use crate::config::EngineConfig;
use crate::error::AnalysisError;

const QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Protocol position of the engine as this handle last observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Process spawned, handshake not yet complete.
    Uninitialized,
    /// Between searches; safe point for `setoption` and `position`.
    Ready,
    /// A `go` is outstanding and no `bestmove` has arrived.
    Searching,
}

/// One spawned engine process with line-in/line-out communication.
pub struct EngineProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    state: ProtocolState,
    /// Option names the engine declared during the handshake.
    opt_names: HashSet<String>,
    /// MultiPV value currently set on the engine, so the prerequisite
    /// option line is only sent when the requested count changes.
    current_multipv: u32,
    cfg: EngineConfig,
    pub label: String,
}

impl EngineProcess {
    /// Spawn the engine, perform the `uci`/`uciok` handshake, apply the
    /// configured options, and block until `readyok`.
    pub fn spawn(cfg: &EngineConfig, label: impl Into<String>) -> Result<Self, AnalysisError> {
        let label = label.into();
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AnalysisError::EngineStart(format!("failed to spawn {}: {e}", cfg.path.display()))
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AnalysisError::EngineStart("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AnalysisError::EngineStart("no stdout".to_string()))?;
        let (tx, rx) = crossbeam_channel::unbounded::<String>();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut proc = Self {
            child,
            stdin: BufWriter::new(stdin),
            rx,
            state: ProtocolState::Uninitialized,
            opt_names: HashSet::new(),
            current_multipv: 1,
            cfg: cfg.clone(),
            label,
        };
        proc.initialize()?;
        Ok(proc)
    }

    fn initialize(&mut self) -> Result<(), AnalysisError> {
        let deadline = Instant::now() + self.cfg.ready_timeout();
        self.write_line("uci")?;
        loop {
            let event = self
                .recv_raw_until(deadline)
                .map_err(|e| start_error(&self.label, e))?;
            match event {
                UciEvent::OptionDecl { name } => {
                    self.opt_names.insert(name);
                }
                UciEvent::UciOk => break,
                UciEvent::Id { field, value } => {
                    debug!("{}: id {field} {value}", self.label);
                }
                other => {
                    debug!("{}: pre-handshake line ignored: {other:?}", self.label);
                }
            }
        }
        let initial = self.cfg.options.clone();
        for (name, value) in &initial {
            self.set_option_if_available(name, value)?;
        }
        self.state = ProtocolState::Ready;
        // ucinewgame first, then isready, so the first position command
        // never races the engine's internal reset.
        self.write_line("ucinewgame")?;
        self.sync_ready().map_err(|e| start_error(&self.label, e))?;
        Ok(())
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    /// True if the process has exited on its own.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Send `setoption` if the engine declared the option (or declared
    /// nothing, in which case we trust the caller). Requires a safe point.
    pub fn set_option_if_available(&mut self, name: &str, value: &str) -> Result<(), AnalysisError> {
        self.guard_not_searching("setoption")?;
        if self.opt_names.is_empty() || self.opt_names.contains(name) {
            self.write_line(&encode_set_option(name, value))?;
        } else {
            debug!("{}: skipping undeclared option '{name}'", self.label);
        }
        Ok(())
    }

    /// Set MultiPV only when the requested count differs from the
    /// engine's current setting.
    pub fn ensure_multipv(&mut self, multipv: u32) -> Result<(), AnalysisError> {
        if multipv == self.current_multipv {
            return Ok(());
        }
        self.guard_not_searching("setoption MultiPV")?;
        self.write_line(&encode_multipv(multipv))?;
        self.current_multipv = multipv;
        Ok(())
    }

    /// Establish the position and start searching under `limit`.
    ///
    /// Any stale output from a previous exchange is drained first so a
    /// leftover `bestmove` can never be attributed to this search.
    pub fn start_search(
        &mut self,
        starting_fen: &str,
        moves: &[String],
        limit: &SearchLimit,
    ) -> Result<(), AnalysisError> {
        self.guard_not_searching("go")?;
        self.drain_stale();
        self.write_line(&encode_position(starting_fen, moves))?;
        self.write_line(&encode_go(limit))?;
        self.state = ProtocolState::Searching;
        Ok(())
    }

    /// Ask the engine to wind down the current search; the terminal
    /// `bestmove` still arrives through `recv_event`.
    pub fn send_stop(&mut self) -> Result<(), AnalysisError> {
        if self.state == ProtocolState::Searching {
            self.write_line("stop")?;
        }
        Ok(())
    }

    /// Record that the outstanding search produced its `bestmove`.
    pub fn finish_search(&mut self) {
        self.state = ProtocolState::Ready;
    }

    /// Receive and decode the next output line.
    ///
    /// `Err(Timeout)` means no line arrived in time; `Err(EngineIo)` means
    /// the process closed its output (crash or premature exit).
    pub fn recv_event(&self, timeout: Duration) -> Result<UciEvent, AnalysisError> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Ok(decode_line(&line)),
            Err(RecvTimeoutError::Timeout) => Err(AnalysisError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(AnalysisError::EngineIo(format!(
                "{}: engine exited unexpectedly",
                self.label
            ))),
        }
    }

    /// `isready`/`readyok` synchronization at a safe point.
    pub fn sync_ready(&mut self) -> Result<(), AnalysisError> {
        self.guard_not_searching("isready")?;
        self.write_line("isready")?;
        let deadline = Instant::now() + self.cfg.ready_timeout();
        loop {
            if let UciEvent::ReadyOk = self.recv_raw_until(deadline)? {
                return Ok(());
            }
        }
    }

    /// Stop the process and start a fresh one with the same configuration.
    /// Used after a detected crash or protocol desynchronization.
    pub fn restart(&mut self) -> Result<(), AnalysisError> {
        warn!("{}: restarting engine process", self.label);
        let cfg = self.cfg.clone();
        let label = self.label.clone();
        self.shutdown();
        *self = Self::spawn(&cfg, label)?;
        Ok(())
    }

    /// Send `quit`, wait briefly, then force-terminate. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.write_line("quit");
        let deadline = Instant::now() + self.cfg.quit_grace();
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(QUIT_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn write_line(&mut self, msg: &str) -> Result<(), AnalysisError> {
        debug!("{} <- {msg}", self.label);
        let io = |e: std::io::Error| AnalysisError::EngineIo(format!("{}: {e}", self.label));
        self.stdin.write_all(msg.as_bytes()).map_err(io)?;
        self.stdin.write_all(b"\n").map_err(io)?;
        self.stdin.flush().map_err(io)?;
        Ok(())
    }

    fn recv_raw_until(&self, deadline: Instant) -> Result<UciEvent, AnalysisError> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(AnalysisError::Timeout)?;
        self.recv_event(remaining)
    }

    fn drain_stale(&mut self) {
        while let Ok(line) = self.rx.try_recv() {
            debug!("{}: discarding stale line: {line}", self.label);
        }
    }

    fn guard_not_searching(&self, what: &str) -> Result<(), AnalysisError> {
        if self.state == ProtocolState::Searching {
            debug_assert!(false, "'{what}' sent while a search is outstanding");
            return Err(AnalysisError::EngineFailure(format!(
                "{}: '{what}' sent while a search is outstanding",
                self.label
            )));
        }
        Ok(())
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// During the spawn handshake, a lost or silent engine is a start
/// failure; outside it, `Timeout` and `EngineIo` pass through unchanged.
fn start_error(label: &str, err: AnalysisError) -> AnalysisError {
    match err {
        AnalysisError::Timeout => {
            AnalysisError::EngineStart(format!("{label}: engine handshake timed out"))
        }
        AnalysisError::EngineIo(msg) => AnalysisError::EngineStart(msg),
        other => other,
    }
}
