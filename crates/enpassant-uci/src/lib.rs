//! UCI protocol codec and wire contracts.
//!
//! This crate is pure: it translates between the engine's line-based text
//! protocol and typed values in both directions, and defines the four wire
//! shapes exchanged with external collaborators (`OptionUpdate`,
//! `MoveRequest`, `MoveResponse`, `Variation`). It never touches a process
//! or a socket; that is the service crate's job.
//!
//! Score semantics: `score` is centipawns from the side-to-move's
//! perspective exactly as the engine reports it, and `mate` is a signed
//! mate distance (positive = side to move mates). This crate does not
//! renormalize perspective; callers that need white-relative scores must
//! flip the sign themselves.

pub mod command;
pub mod event;
pub mod wire;

pub use command::{encode_go, encode_multipv, encode_position, encode_set_option, SearchLimit};
pub use event::{decode_line, InfoLine, UciEvent};
pub use wire::{MoveRequest, MoveResponse, OptionUpdate, Variation};

/// FEN of the standard initial position, used for the `startpos` shortcut.
pub const STARTPOS_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
