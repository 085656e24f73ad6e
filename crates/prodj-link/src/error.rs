//! Error types for the link core.
//!
//! Decode-level rejects are cheap `Option`s in `prodj-protocol`; task-level
//! functions here return `anyhow::Result`, and the small set of errors that
//! change observable behavior (§7) are a hand-rolled enum so callers can
//! match on them instead of string-sniffing an `anyhow::Error`.

use std::fmt;

#[derive(Debug)]
pub enum CoreError {
    SocketBind { port: u16, source: std::io::Error },
    DeviceNumberConflict { attempts: u8 },
    MidiSinkError(String),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::SocketBind { port, source } => {
                write!(f, "failed to bind UDP socket on port {port}: {source}")
            }
            CoreError::DeviceNumberConflict { attempts } => {
                write!(f, "device number unresolvable after {attempts} attempts")
            }
            CoreError::MidiSinkError(msg) => write!(f, "MIDI sink error: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

/// Mirrors spec.md §6 exit codes without scattering `process::exit` through
/// library code — `main.rs` is the only place that reads this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Normal,
    InterfaceUnusable,
    DeviceNumberUnresolvable,
}

impl RunOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::Normal => 0,
            RunOutcome::InterfaceUnusable => 2,
            RunOutcome::DeviceNumberUnresolvable => 3,
        }
    }
}

/// Command-API specific errors, returned to the caller with no side effects
/// (spec.md §7: "PreconditionNotMet ... returned to caller, no side effects").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    PreconditionNotMet(&'static str),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::PreconditionNotMet(what) => {
                write!(f, "precondition not met: {what}")
            }
        }
    }
}

impl std::error::Error for CommandError {}
