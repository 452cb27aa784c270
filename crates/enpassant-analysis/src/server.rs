//! JSON-lines-over-TCP front end.
//!
//! Each connection carries newline-delimited JSON requests tagged by an
//! `op` field and receives one JSON response line per request, wrapped in
//! the bot's historical `code`/`message` envelope. One thread per
//! connection; the service itself fans sessions out across the pool.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use enpassant_uci::{MoveRequest, MoveResponse, OptionUpdate};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::service::AnalysisService;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientRequest {
    Move {
        #[serde(flatten)]
        request: MoveRequest,
    },
    Option {
        #[serde(flatten)]
        update: OptionUpdate,
    },
    Cancel {
        id: String,
    },
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    code: u16,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
    // A flattened `None` serializes no fields at all.
    #[serde(flatten)]
    response: Option<MoveResponse>,
}

impl ResponseEnvelope {
    fn ok(response: Option<MoveResponse>) -> Self {
        Self {
            code: 200,
            message: "OK".to_string(),
            error: None,
            response,
        }
    }

    fn error(err: &AnalysisError) -> Self {
        Self {
            code: status_code(err),
            message: err.to_string(),
            error: Some(err.kind()),
            response: None,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            code: 400,
            message,
            error: Some("validation"),
            response: None,
        }
    }
}

fn status_code(err: &AnalysisError) -> u16 {
    match err {
        AnalysisError::Validation(_) => 400,
        AnalysisError::NotFound(_) | AnalysisError::UnknownTarget(_) => 404,
        AnalysisError::AlreadyExists(_) => 409,
        AnalysisError::Cancelled => 410,
        AnalysisError::PoolSaturated => 503,
        AnalysisError::Timeout => 504,
        AnalysisError::EngineStart(_)
        | AnalysisError::EngineIo(_)
        | AnalysisError::EngineFailure(_)
        | AnalysisError::Shutdown => 500,
    }
}

/// Accept connections until `shutdown` is raised.
pub fn run(
    listener: TcpListener,
    service: Arc<AnalysisService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("failed to set listener nonblocking")?;
    info!("listening on {}", listener.local_addr()?);
    while !shutdown.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("connection from {peer}");
                let service = Arc::clone(&service);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, service) {
                        debug!("connection {peer} closed: {e}");
                    }
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, service: Arc<AnalysisService>) -> Result<()> {
    stream.set_nodelay(true).ok();
    let reader = BufReader::new(stream.try_clone().context("clone stream")?);
    let mut writer = BufWriter::new(stream);
    for line in reader.lines() {
        let line = line.context("read request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope = dispatch(&service, &line);
        serde_json::to_writer(&mut writer, &envelope).context("write response")?;
        writer.write_all(b"\n").context("write newline")?;
        writer.flush().context("flush response")?;
    }
    Ok(())
}

fn dispatch(service: &AnalysisService, line: &str) -> ResponseEnvelope {
    let request: ClientRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => return ResponseEnvelope::bad_request(format!("malformed request: {e}")),
    };
    match request {
        ClientRequest::Move { request } => match service.request_move(request) {
            Ok(response) => ResponseEnvelope::ok(Some(response)),
            Err(err) => ResponseEnvelope::error(&err),
        },
        ClientRequest::Option { update } => match service.apply_option(update) {
            Ok(()) => ResponseEnvelope::ok(None),
            Err(err) => ResponseEnvelope::error(&err),
        },
        ClientRequest::Cancel { id } => match service.cancel(&id) {
            Ok(()) => ResponseEnvelope::ok(None),
            Err(err) => ResponseEnvelope::error(&err),
        },
    }
}
