//! Bit-exact encoders/decoders for ProDJ Link wire packets.
//!
//! Every packet begins with the 10-byte magic `MAGIC`, followed by a 1-byte
//! type field, a 20-byte zero-padded name field, and a 1-byte device number.
//! Type-specific fields follow. All multi-byte integers are big-endian.

use crate::model::{Slot, TrackRef};

pub const MAGIC: [u8; 10] = [
    0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6D, 0x4A, 0x4F, 0x4C,
];
const NAME_LEN: usize = 20;
const HEADER_LEN: usize = MAGIC.len() + 1 + NAME_LEN + 1;

/// BPM sentinel meaning "no tempo reported"; the tracker retains the
/// previous value when it sees this.
pub const BPM_NO_TEMPO: u16 = 0xFFFF;

/// Pitch center: wire value corresponding to +0% pitch.
pub const PITCH_CENTER: u32 = 0x0010_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    BadMagic,
    Truncated,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::BadMagic => write!(f, "not a ProDJ Link packet (bad magic)"),
            DecodeError::Truncated => write!(f, "truncated packet"),
        }
    }
}

impl std::error::Error for DecodeError {}

fn write_header(buf: &mut Vec<u8>, type_id: u8, name: &str, device_number: u8) {
    buf.extend_from_slice(&MAGIC);
    buf.push(type_id);
    let mut name_bytes = [0u8; NAME_LEN];
    let src = name.as_bytes();
    let n = src.len().min(NAME_LEN);
    name_bytes[..n].copy_from_slice(&src[..n]);
    buf.extend_from_slice(&name_bytes);
    buf.push(device_number);
}

/// Validate magic + minimum header length, and split off type/name/device.
fn read_header(data: &[u8]) -> Result<(u8, String, u8, &[u8]), DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    if data[..MAGIC.len()] != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let type_id = data[MAGIC.len()];
    let name_start = MAGIC.len() + 1;
    let name_end = name_start + NAME_LEN;
    let name_raw = &data[name_start..name_end];
    let nul = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
    let name = String::from_utf8_lossy(&name_raw[..nul]).into_owned();
    let device_number = data[name_end];
    let rest = &data[name_end + 1..];
    Ok((type_id, name, device_number, rest))
}

macro_rules! require_len {
    ($slice:expr, $n:expr) => {
        if $slice.len() < $n {
            return None;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRequestPacket {
    pub device_number: u8,
    pub name: String,
}

impl IdRequestPacket {
    pub const TYPE: u8 = 0x00;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, &self.name, self.device_number);
    }

    pub fn deserialize(name: String, device_number: u8, _rest: &[u8]) -> Option<Self> {
        Some(IdRequestPacket { device_number, name })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdResponsePacket {
    pub device_number: u8,
    pub name: String,
}

impl IdResponsePacket {
    pub const TYPE: u8 = 0x02;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, &self.name, self.device_number);
    }

    pub fn deserialize(name: String, device_number: u8, _rest: &[u8]) -> Option<Self> {
        Some(IdResponsePacket { device_number, name })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivePacket {
    pub device_number: u8,
    pub name: String,
    pub mac: [u8; 6],
    pub ip: [u8; 4],
}

impl KeepalivePacket {
    pub const TYPE: u8 = 0x06;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, &self.name, self.device_number);
        buf.extend_from_slice(&self.mac);
        buf.extend_from_slice(&self.ip);
    }

    pub fn deserialize(name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 10);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&rest[0..6]);
        let mut ip = [0u8; 4];
        ip.copy_from_slice(&rest[6..10]);
        Some(KeepalivePacket { device_number, name, mac, ip })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatPacket {
    pub device_number: u8,
    pub name: String,
    pub bpm_centi: u16,
    pub beat_in_bar: u8,
    pub pitch_raw: u32,
    pub next_beat_offsets_ms: [u16; 7],
}

impl BeatPacket {
    pub const TYPE: u8 = 0x0A;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, &self.name, self.device_number);
        buf.extend_from_slice(&self.bpm_centi.to_be_bytes());
        buf.push(self.beat_in_bar);
        buf.extend_from_slice(&self.pitch_raw.to_be_bytes());
        for offset in &self.next_beat_offsets_ms {
            buf.extend_from_slice(&offset.to_be_bytes());
        }
    }

    pub fn deserialize(name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 2 + 1 + 4 + 7 * 2);
        let bpm_centi = u16::from_be_bytes([rest[0], rest[1]]);
        let beat_in_bar = rest[2];
        if !(1..=4).contains(&beat_in_bar) {
            return None;
        }
        let pitch_raw = u32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]);
        let mut next_beat_offsets_ms = [0u16; 7];
        for i in 0..7 {
            let o = 7 + i * 2;
            next_beat_offsets_ms[i] = u16::from_be_bytes([rest[o], rest[o + 1]]);
        }
        Some(BeatPacket {
            device_number,
            name,
            bpm_centi,
            beat_in_bar,
            pitch_raw,
            next_beat_offsets_ms,
        })
    }

    /// Fractional speed relative to `PITCH_CENTER`, e.g. `0.08` for +8%.
    pub fn pitch_factor(&self) -> f64 {
        (self.pitch_raw as f64 - PITCH_CENTER as f64) / PITCH_CENTER as f64 + 1.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixerStatusPacket {
    pub device_number: u8,
    pub master: bool,
    pub handoff_control: u8,
}

impl MixerStatusPacket {
    pub const TYPE: u8 = 0x10;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, "", self.device_number);
        buf.push(if self.master { 1 } else { 0 });
        buf.push(self.handoff_control);
    }

    pub fn deserialize(_name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 2);
        Some(MixerStatusPacket {
            device_number,
            master: rest[0] != 0,
            handoff_control: rest[1],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterClaimPacket {
    pub device_number: u8,
    pub stage: u8,
}

impl MasterClaimPacket {
    pub const TYPE: u8 = 0x26;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, "", self.device_number);
        buf.push(self.stage);
    }

    pub fn deserialize(_name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 1);
        Some(MasterClaimPacket { device_number, stage: rest[0] })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldRequestPacket {
    pub device_number: u8,
    pub requester: u8,
}

impl YieldRequestPacket {
    pub const TYPE: u8 = 0x29;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, "", self.device_number);
        buf.push(self.requester);
    }

    pub fn deserialize(_name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 1);
        Some(YieldRequestPacket { device_number, requester: rest[0] })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YieldResponsePacket {
    pub device_number: u8,
    pub ack: bool,
}

impl YieldResponsePacket {
    pub const TYPE: u8 = 0x2A;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, "", self.device_number);
        buf.push(if self.ack { 1 } else { 0 });
    }

    pub fn deserialize(_name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 1);
        Some(YieldResponsePacket { device_number, ack: rest[0] != 0 })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdjStatusPacket {
    pub device_number: u8,
    pub name: String,
    pub bpm_centi: u16,
    pub pitch_raw: u32,
    pub beat_in_bar: u8,
    pub beat_counter: u32,
    pub playing: bool,
    pub cued: bool,
    pub on_air: bool,
    pub master: bool,
    pub sync: bool,
    pub track_ref: Option<TrackRef>,
    pub playhead_ms: u32,
}

impl CdjStatusPacket {
    pub const TYPE: u8 = 0x05;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, &self.name, self.device_number);
        buf.extend_from_slice(&self.bpm_centi.to_be_bytes());
        buf.extend_from_slice(&self.pitch_raw.to_be_bytes());
        buf.push(self.beat_in_bar);
        buf.extend_from_slice(&self.beat_counter.to_be_bytes());
        let mut flags = 0u8;
        if self.playing {
            flags |= 0b0000_0001;
        }
        if self.cued {
            flags |= 0b0000_0010;
        }
        if self.on_air {
            flags |= 0b0000_0100;
        }
        if self.master {
            flags |= 0b0000_1000;
        }
        if self.sync {
            flags |= 0b0001_0000;
        }
        buf.push(flags);
        match self.track_ref {
            Some(t) => {
                buf.push(1);
                buf.push(t.source_device);
                buf.push(slot_to_u8(t.slot));
                buf.extend_from_slice(&t.track_id.to_be_bytes());
            }
            None => {
                buf.push(0);
                buf.extend_from_slice(&[0u8; 6]);
            }
        }
        buf.extend_from_slice(&self.playhead_ms.to_be_bytes());
    }

    pub fn deserialize(name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 2 + 4 + 1 + 4 + 1 + 7 + 4);
        let bpm_centi = u16::from_be_bytes([rest[0], rest[1]]);
        let pitch_raw = u32::from_be_bytes([rest[2], rest[3], rest[4], rest[5]]);
        let beat_in_bar = rest[6];
        if beat_in_bar != 0 && !(1..=4).contains(&beat_in_bar) {
            return None;
        }
        let beat_counter = u32::from_be_bytes([rest[7], rest[8], rest[9], rest[10]]);
        let flags = rest[11];
        let track_present = rest[12];
        let track_ref = if track_present != 0 {
            Some(TrackRef {
                source_device: rest[13],
                slot: slot_from_u8(rest[14])?,
                track_id: u32::from_be_bytes([rest[15], rest[16], rest[17], rest[18]]),
            })
        } else {
            None
        };
        let playhead_ms = u32::from_be_bytes([rest[19], rest[20], rest[21], rest[22]]);
        Some(CdjStatusPacket {
            device_number,
            name,
            bpm_centi,
            pitch_raw,
            beat_in_bar,
            beat_counter,
            playing: flags & 0b0000_0001 != 0,
            cued: flags & 0b0000_0010 != 0,
            on_air: flags & 0b0000_0100 != 0,
            master: flags & 0b0000_1000 != 0,
            sync: flags & 0b0001_0000 != 0,
            track_ref,
            playhead_ms,
        })
    }
}

fn slot_to_u8(slot: Slot) -> u8 {
    match slot {
        Slot::Sd => 0,
        Slot::Usb => 1,
        Slot::Cd => 2,
        Slot::RekordboxCollection => 3,
    }
}

fn slot_from_u8(v: u8) -> Option<Slot> {
    match v {
        0 => Some(Slot::Sd),
        1 => Some(Slot::Usb),
        2 => Some(Slot::Cd),
        3 => Some(Slot::RekordboxCollection),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadTrackPacket {
    pub device_number: u8,
    pub target_device: u8,
    pub source_device: u8,
    pub slot: Slot,
    pub track_id: u32,
}

impl LoadTrackPacket {
    pub const TYPE: u8 = 0x19;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, "", self.device_number);
        buf.push(self.target_device);
        buf.push(self.source_device);
        buf.push(slot_to_u8(self.slot));
        buf.extend_from_slice(&self.track_id.to_be_bytes());
    }

    pub fn deserialize(_name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 3 + 4);
        Some(LoadTrackPacket {
            device_number,
            target_device: rest[0],
            source_device: rest[1],
            slot: slot_from_u8(rest[2])?,
            track_id: u32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaderStartPacket {
    pub device_number: u8,
    pub target_device: u8,
    pub start: bool,
}

impl FaderStartPacket {
    pub const TYPE: u8 = 0x02;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        write_header(buf, Self::TYPE, "", self.device_number);
        buf.push(self.target_device);
        buf.push(if self.start { 1 } else { 0 });
    }

    pub fn deserialize(_name: String, device_number: u8, rest: &[u8]) -> Option<Self> {
        require_len!(rest, 2);
        Some(FaderStartPacket {
            device_number,
            target_device: rest[0],
            start: rest[1] != 0,
        })
    }
}

/// Closed set of packet kinds the core understands, plus a catch-all for
/// anything wire-valid but not recognized.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    IdRequest(IdRequestPacket),
    IdResponse(IdResponsePacket),
    Keepalive(KeepalivePacket),
    Beat(BeatPacket),
    MixerStatus(MixerStatusPacket),
    MasterClaim(MasterClaimPacket),
    YieldRequest(YieldRequestPacket),
    YieldResponse(YieldResponsePacket),
    CdjStatus(CdjStatusPacket),
    LoadTrack(LoadTrackPacket),
    FaderStart(FaderStartPacket),
    Unrecognized { type_id: u8, payload: Vec<u8> },
}

/// Decode a datagram. `port` disambiguates type byte `0x02`, which the wire
/// format reuses for both "ID response" on port 50000 and "fader start" on
/// port 50001 — the two never appear on the same socket.
pub fn decode_on_port(data: &[u8], port: u16) -> Result<Packet, DecodeError> {
    let (type_id, name, device_number, rest) = read_header(data)?;
    let packet = match (type_id, port) {
        (IdRequestPacket::TYPE, _) => {
            IdRequestPacket::deserialize(name, device_number, rest).map(Packet::IdRequest)
        }
        (0x02, 50000) => {
            IdResponsePacket::deserialize(name, device_number, rest).map(Packet::IdResponse)
        }
        (0x02, _) => {
            FaderStartPacket::deserialize(name, device_number, rest).map(Packet::FaderStart)
        }
        (KeepalivePacket::TYPE, _) => {
            KeepalivePacket::deserialize(name, device_number, rest).map(Packet::Keepalive)
        }
        (BeatPacket::TYPE, _) => {
            BeatPacket::deserialize(name, device_number, rest).map(Packet::Beat)
        }
        (MixerStatusPacket::TYPE, _) => {
            MixerStatusPacket::deserialize(name, device_number, rest).map(Packet::MixerStatus)
        }
        (MasterClaimPacket::TYPE, _) => {
            MasterClaimPacket::deserialize(name, device_number, rest).map(Packet::MasterClaim)
        }
        (YieldRequestPacket::TYPE, _) => {
            YieldRequestPacket::deserialize(name, device_number, rest).map(Packet::YieldRequest)
        }
        (YieldResponsePacket::TYPE, _) => {
            YieldResponsePacket::deserialize(name, device_number, rest).map(Packet::YieldResponse)
        }
        (CdjStatusPacket::TYPE, _) => {
            CdjStatusPacket::deserialize(name, device_number, rest).map(Packet::CdjStatus)
        }
        (LoadTrackPacket::TYPE, _) => {
            LoadTrackPacket::deserialize(name, device_number, rest).map(Packet::LoadTrack)
        }
        _ => None,
    };
    Ok(packet.unwrap_or(Packet::Unrecognized {
        type_id,
        payload: rest.to_vec(),
    }))
}
