//! Engine analysis orchestration service.
//!
//! Sits between a chat-bot front end and one or more UCI engine
//! processes: accepts concurrent analysis requests keyed by opaque
//! session ids, drives each engine's line protocol through an explicit
//! state machine, multiplexes sessions across a fixed pool of engine
//! slots, and returns structured multi-variation results.
//!
//! The crate boundary is two operations (`AnalysisService::apply_option`
//! and `AnalysisService::request_move`, plus the streaming flavor of the
//! latter) over four wire shapes re-exported from `enpassant_uci`.

pub mod config;
pub mod engine;
pub mod error;
pub mod pool;
pub mod server;
pub mod service;
pub mod session;
pub mod table;

pub use config::{EngineConfig, LimitsConfig, PoolConfig, ServiceConfig};
pub use enpassant_uci::{MoveRequest, MoveResponse, OptionUpdate, SearchLimit, Variation};
pub use error::AnalysisError;
pub use service::AnalysisService;
pub use session::SessionUpdate;
