//! Shared domain types describing devices and player state on the link.

/// Monotonic microsecond timestamp from an injected clock capability
/// (`prodj_link::clock::Clock`), never `std::time::Instant` directly — this
/// is what makes registry eviction and beat-phase scheduling deterministic
/// under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn saturating_diff_micros(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Coarse classification of a device by its announced device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cdj,
    Djm,
    Rekordbox,
    Unknown,
}

impl DeviceKind {
    pub fn from_device_number(n: u8) -> Self {
        match n {
            1..=4 => DeviceKind::Cdj,
            0x11..=0x20 => DeviceKind::Djm,
            0x21 => DeviceKind::Rekordbox,
            _ => DeviceKind::Unknown,
        }
    }
}

/// A peer known to the registry.
#[derive(Debug, Clone)]
pub struct Device {
    pub device_number: u8,
    pub kind: DeviceKind,
    pub name: String,
    pub mac: [u8; 6],
    pub ip: [u8; 4],
    pub last_seen: Timestamp,
}

/// Media slot a loaded track is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Sd,
    Usb,
    Cd,
    RekordboxCollection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackRef {
    pub source_device: u8,
    pub slot: Slot,
    pub track_id: u32,
}

/// Per-player reconstructed state, owned exclusively by the tracker.
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub bpm_centi: u16,
    /// Signed fractional pitch, e.g. -0.08 .. +0.08 for an 8% slider.
    pub pitch: f64,
    pub beat_in_bar: u8,
    pub beat_counter: u32,
    pub playing: bool,
    pub cued: bool,
    pub on_air: bool,
    pub master: bool,
    pub sync: bool,
    pub track_ref: Option<TrackRef>,
    pub playhead_ms: u32,
    pub last_status_ts: Option<Timestamp>,
    pub last_beat_ts: Option<Timestamp>,
    /// ms offsets to beats +1..+7 ahead, from the most recent beat packet.
    pub next_beat_offsets_ms: [u16; 7],
}

impl Default for PlayerState {
    fn default() -> Self {
        PlayerState {
            bpm_centi: 0,
            pitch: 1.0,
            beat_in_bar: 1,
            beat_counter: 0,
            playing: false,
            cued: false,
            on_air: false,
            master: false,
            sync: false,
            track_ref: None,
            playhead_ms: 0,
            last_status_ts: None,
            last_beat_ts: None,
            next_beat_offsets_ms: [0; 7],
        }
    }
}

impl PlayerState {
    /// `bpm_centi` combined with `pitch` to produce the BPM actually heard.
    pub fn effective_bpm_centi(&self) -> u16 {
        (self.bpm_centi as f64 * self.pitch).round() as u16
    }
}

/// Master-handoff bookkeeping, owned by the negotiator.
#[derive(Debug, Clone, Default)]
pub struct MasterRole {
    pub current_master: Option<u8>,
    pub pending_yield_from: Option<u8>,
    pub pending_claim_by: Option<u8>,
    pub claim_countdown: u8,
}

/// Selectable BPM source for the Beat Clock.
#[derive(Debug, Clone)]
pub enum BpmSource {
    FollowNetworkMaster,
    Pin(u8),
    Manual(u16),
    Tap { taps: Vec<Timestamp> },
}

impl BpmSource {
    pub const MAX_TAPS: usize = 8;
}
