//! Wire codec and shared domain model for the ProDJ Link core.
//!
//! This crate has no networking and no async runtime dependency: it only
//! knows how to turn bytes into typed packets and back, and defines the
//! plain data types (`Device`, `PlayerState`, `MasterRole`, `BpmSource`)
//! the core builds its model from.

pub mod model;
pub mod packets;

/// Fixed UDP ports used by the link, per the wire spec.
pub const PORT_DISCOVERY: u16 = 50000;
pub const PORT_BEAT_STATUS: u16 = 50001;
pub const PORT_STATUS_UNICAST: u16 = 50002;

/// Device numbers 1..=4 are reserved for players (CDJs).
pub const PLAYER_DEVICE_NUMBERS: std::ops::RangeInclusive<u8> = 1..=4;
