//! CLI configuration (spec.md §6 "CLI surface relevant to the core").
//!
//! No persisted configuration file: unlike the teacher's `HostConfig`
//! TOML-file setup (midi-host's dual-controller failover has knobs that
//! genuinely warrant a file), the whole of this core's runtime
//! configuration is four CLI flags, so `clap::Parser` alone is enough —
//! no `toml`/config-file dependency is carried.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "prodj-link", about = "Pioneer ProDJ Link network peer")]
pub struct Config {
    /// Name of the network interface to bind (e.g. "eth0").
    #[arg(long)]
    pub iface: String,

    /// Requested device number (1..4). Defaults to the lowest free slot.
    #[arg(long)]
    pub device_number: Option<u8>,

    /// Tracing level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Name of the MIDI output port to open.
    #[arg(long, default_value = "ProDJ Link Clock")]
    pub midi_port: String,
}
