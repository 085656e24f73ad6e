//! Link core (spec.md §5): the single-owner task over the registry, tracker,
//! and negotiator. Never touches a socket or the MIDI sink directly — it
//! consumes decoded packets and local commands, and produces `NetworkCommand`
//! values for the caller to actually send, the same separation the negotiator
//! already uses. State is published to readers as an immutable `Snapshot`
//! through a `tokio::sync::watch::Sender`, grounded in the teacher's
//! `HostRole` publication in `main.rs`/`failover.rs`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::info;

use prodj_protocol::model::{BpmSource, Device, MasterRole, PlayerState, Slot, Timestamp};
use prodj_protocol::packets::{
    BeatPacket, CdjStatusPacket, FaderStartPacket, IdRequestPacket, KeepalivePacket,
    LoadTrackPacket, MasterClaimPacket, MixerStatusPacket, Packet, PITCH_CENTER, YieldRequestPacket,
    YieldResponsePacket,
};

use crate::beatclock::{self, BeatClock};
use crate::error::CommandError;
use crate::events::{Event, EventBus};
use crate::negotiator::{MasterNegotiator, NegotiatorAction};
use crate::registry::{DeviceRegistry, UpsertOutcome};
use crate::tracker::PlayerStateTracker;

/// Read-mostly view handed to the `snapshot()` observer API (spec.md §6).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub local_device_number: u8,
    pub devices: Vec<Device>,
    pub players: HashMap<u8, PlayerState>,
    pub master: MasterRole,
    pub effective_bpm_centi: u16,
    pub clock_stale: bool,
}

/// What the link core asks the caller to actually transmit. Kept data-only
/// so the core stays socket-free and unit-testable.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkCommand {
    BroadcastDiscovery(IdRequestPacket),
    BroadcastKeepalive(KeepalivePacket),
    BroadcastBeat(BeatPacket),
    BroadcastStatus(CdjStatusPacket),
    BroadcastMasterClaim(MasterClaimPacket),
    UnicastYieldRequest { target_ip: Ipv4Addr, packet: YieldRequestPacket },
    UnicastYieldResponse { target_ip: Ipv4Addr, packet: YieldResponsePacket },
    UnicastLoadTrack { target_ip: Ipv4Addr, packet: LoadTrackPacket },
    UnicastFaderStart { target_ip: Ipv4Addr, packet: FaderStartPacket },
}

/// External command surface (spec.md §4.8's Command API), dispatched into
/// `LinkCore` through `lib.rs`'s select loop — the same data-only shape
/// `NetworkCommand` uses for the outbound direction.
#[derive(Debug, Clone)]
pub enum Command {
    RequestMaster,
    LoadTrack { target_device: u8, source_device: u8, slot: Slot, track_id: u32 },
    FaderStart { device: u8, start: bool },
    SelectBpmSource(BpmSource),
    TapTempo,
}

/// Rate limits for the local peer's own emitters (spec.md §4.2).
const KEEPALIVE_INTERVAL_MICROS: u64 = 1_500_000;
const STATUS_INTERVAL_MICROS: u64 = 200_000;

pub struct LinkCore {
    local_device_number: u8,
    local_name: String,
    local_mac: [u8; 6],
    local_ip: [u8; 4],
    registry: DeviceRegistry,
    tracker: PlayerStateTracker,
    negotiator: MasterNegotiator,
    beat_clock: BeatClock,
    events: Arc<EventBus>,
    last_keepalive: Option<Timestamp>,
    last_status: Option<Timestamp>,
    last_beat_emit: Option<Timestamp>,
    local_beat_in_bar: u8,
    local_beat_counter: u32,
}

impl LinkCore {
    pub fn new(
        local_device_number: u8,
        local_name: String,
        local_mac: [u8; 6],
        local_ip: [u8; 4],
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            local_name,
            local_mac,
            local_ip,
            registry: DeviceRegistry::new(),
            tracker: PlayerStateTracker::new(),
            negotiator: MasterNegotiator::new(local_device_number),
            beat_clock: BeatClock::new(BpmSource::FollowNetworkMaster),
            local_device_number,
            events,
            last_keepalive: None,
            last_status: None,
            last_beat_emit: None,
            local_beat_in_bar: 1,
            local_beat_counter: 0,
        }
    }

    pub fn local_device_number(&self) -> u8 {
        self.local_device_number
    }

    /// Publishes `Event::ClockSourceChanged` if staleness flipped across the
    /// given beat-clock mutation (spec.md §4.8).
    fn note_staleness_transition(&mut self, was_stale: bool) {
        let is_stale = self.beat_clock.is_stale();
        if was_stale != is_stale {
            self.events.publish(Event::ClockSourceChanged { stale: is_stale });
        }
    }

    /// Handle a decoded inbound packet. `from` is used to resolve the IP a
    /// unicast reply should target.
    pub fn handle_packet(
        &mut self,
        packet: &Packet,
        from: SocketAddr,
        now_micros: u64,
        now: prodj_protocol::model::Timestamp,
    ) -> Vec<NetworkCommand> {
        let mut out = Vec::new();
        match packet {
            Packet::Keepalive(ka) => {
                if ka.device_number == self.local_device_number {
                    return out;
                }
                let outcome = self.registry.upsert(ka.device_number, &ka.name, ka.mac, ka.ip, now);
                if outcome == UpsertOutcome::Inserted {
                    info!(device = ka.device_number, name = %ka.name, "device found");
                    self.events.publish(Event::DeviceFound { device_number: ka.device_number });
                } else if outcome == UpsertOutcome::Conflicting {
                    tracing::warn!(device = ka.device_number, "conflicting MAC on device number");
                }
            }
            Packet::CdjStatus(status) => {
                if status.device_number == self.local_device_number {
                    return out;
                }
                if status.track_ref.is_some() {
                    self.maybe_upsert_from_status(status, now);
                }
                let changed = self.negotiator.observe_master_flag(status.device_number, status.master);
                if changed {
                    self.events.publish(Event::MasterChanged { new_master: self.negotiator.role().current_master });
                }
                let is_master = self.negotiator.role().current_master == Some(status.device_number);
                if self.beat_clock.accepts(status.device_number, is_master) {
                    let was_stale = self.beat_clock.is_stale();
                    self.beat_clock.on_status(now, status.bpm_centi_or_previous());
                    self.note_staleness_transition(was_stale);
                }
                for event in self.tracker.apply_status(status, now_micros) {
                    self.events.publish(event);
                }
            }
            Packet::Beat(beat) => {
                if beat.device_number == self.local_device_number {
                    return out;
                }
                let is_master = Some(beat.device_number) == self.negotiator.role().current_master;
                if self.beat_clock.accepts(beat.device_number, is_master) {
                    let was_stale = self.beat_clock.is_stale();
                    self.beat_clock.on_beat(now, beat.effective_bpm_centi());
                    self.note_staleness_transition(was_stale);
                }
                for event in self.tracker.apply_beat(beat, now_micros) {
                    self.events.publish(event);
                }
            }
            Packet::MixerStatus(MixerStatusPacket { device_number, master, .. }) => {
                let changed = self.negotiator.observe_master_flag(*device_number, *master);
                if changed {
                    self.events.publish(Event::MasterChanged { new_master: self.negotiator.role().current_master });
                }
            }
            Packet::YieldRequest(YieldRequestPacket { requester, .. }) => {
                for action in self.negotiator.on_yield_request(*requester) {
                    out.push(self.resolve_negotiator_action(action, from.ip()));
                }
            }
            Packet::YieldResponse(YieldResponsePacket { ack, .. }) => {
                self.negotiator.on_yield_response(*ack);
            }
            Packet::MasterClaim(_) | Packet::IdRequest(_) | Packet::IdResponse(_)
            | Packet::LoadTrack(_) | Packet::FaderStart(_) | Packet::Unrecognized { .. } => {}
        }
        out
    }

    fn maybe_upsert_from_status(&mut self, status: &CdjStatusPacket, now: prodj_protocol::model::Timestamp) {
        if self.registry.get(status.device_number).is_none() {
            // First-seen via status, not keepalive: MAC/IP aren't in this
            // packet, so register a placeholder the next keepalive fills in.
            let _ = self.registry.upsert(status.device_number, &status.name, [0; 6], [0; 4], now);
        }
    }

    fn resolve_negotiator_action(&self, action: NegotiatorAction, fallback_ip: std::net::IpAddr) -> NetworkCommand {
        let ip_for = |device_number: u8| -> Ipv4Addr {
            self.registry
                .get(device_number)
                .map(|d| Ipv4Addr::from(d.ip))
                .unwrap_or(match fallback_ip {
                    std::net::IpAddr::V4(v4) => v4,
                    std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                })
        };
        match action {
            NegotiatorAction::BroadcastMasterClaim { stage } => {
                NetworkCommand::BroadcastMasterClaim(MasterClaimPacket {
                    device_number: self.local_device_number,
                    stage,
                })
            }
            NegotiatorAction::UnicastYieldRequest { target } => NetworkCommand::UnicastYieldRequest {
                target_ip: ip_for(target),
                packet: YieldRequestPacket { device_number: self.local_device_number, requester: self.local_device_number },
            },
            NegotiatorAction::UnicastYieldResponse { target } => NetworkCommand::UnicastYieldResponse {
                target_ip: ip_for(target),
                packet: YieldResponsePacket { device_number: self.local_device_number, ack: true },
            },
        }
    }

    /// Periodic housekeeping plus the local peer's own rate-limited emitters
    /// (spec.md §4.2): eviction scan, negotiator timers, staleness, keepalive
    /// every 1500ms, status every 200ms, and — while we hold master — beat
    /// packets paced to the currently produced BPM.
    pub fn tick(&mut self, now: Timestamp) -> Vec<NetworkCommand> {
        let mut out = Vec::new();
        for device_number in self.registry.evict_stale(now) {
            info!(device = device_number, "device lost");
            self.events.publish(Event::DeviceLost { device_number });
            self.tracker.remove(device_number);
        }
        let was_stale = self.beat_clock.is_stale();
        self.beat_clock.refresh_staleness(now);
        self.note_staleness_transition(was_stale);

        for action in self.negotiator.tick(now) {
            out.push(self.resolve_negotiator_action(action, std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        }

        if self.last_keepalive.map_or(true, |t| now.saturating_diff_micros(t) >= KEEPALIVE_INTERVAL_MICROS) {
            self.last_keepalive = Some(now);
            out.push(NetworkCommand::BroadcastKeepalive(KeepalivePacket {
                device_number: self.local_device_number,
                name: self.local_name.clone(),
                mac: self.local_mac,
                ip: self.local_ip,
            }));
        }

        if self.last_status.map_or(true, |t| now.saturating_diff_micros(t) >= STATUS_INTERVAL_MICROS) {
            self.last_status = Some(now);
            out.push(NetworkCommand::BroadcastStatus(self.build_status_packet()));
        }

        if self.negotiator.role().current_master == Some(self.local_device_number) {
            let interval = beatclock::beat_interval_micros_for(self.beat_clock.effective_bpm_centi());
            if self.last_beat_emit.map_or(true, |t| now.saturating_diff_micros(t) >= interval) {
                self.last_beat_emit = Some(now);
                self.local_beat_counter += 1;
                self.local_beat_in_bar = if self.local_beat_in_bar >= 4 { 1 } else { self.local_beat_in_bar + 1 };
                out.push(NetworkCommand::BroadcastBeat(self.build_beat_packet()));
            }
        } else {
            self.last_beat_emit = None;
        }

        out
    }

    fn build_status_packet(&self) -> CdjStatusPacket {
        CdjStatusPacket {
            device_number: self.local_device_number,
            name: self.local_name.clone(),
            bpm_centi: self.beat_clock.effective_bpm_centi(),
            pitch_raw: PITCH_CENTER,
            beat_in_bar: self.local_beat_in_bar,
            beat_counter: self.local_beat_counter,
            playing: self.negotiator.role().current_master == Some(self.local_device_number),
            cued: false,
            on_air: true,
            master: self.negotiator.role().current_master == Some(self.local_device_number),
            sync: false,
            track_ref: None,
            playhead_ms: 0,
        }
    }

    fn build_beat_packet(&self) -> BeatPacket {
        BeatPacket {
            device_number: self.local_device_number,
            name: self.local_name.clone(),
            bpm_centi: self.beat_clock.effective_bpm_centi(),
            beat_in_bar: self.local_beat_in_bar,
            pitch_raw: PITCH_CENTER,
            next_beat_offsets_ms: [0; 7],
        }
    }

    /// Switch the BPM source driving the local beat clock (spec.md §4.6).
    pub fn select_bpm_source(&mut self, source: BpmSource, now: Timestamp) {
        let was_stale = self.beat_clock.is_stale();
        self.beat_clock.select_source(source, now);
        self.note_staleness_transition(was_stale);
    }

    /// Register a tap-tempo press; only has an effect when `Tap` is selected.
    pub fn tap_tempo(&mut self, now: Timestamp) {
        let was_stale = self.beat_clock.is_stale();
        self.beat_clock.tap(now);
        self.note_staleness_transition(was_stale);
    }

    pub fn request_master(&mut self, now: prodj_protocol::model::Timestamp) -> Vec<NetworkCommand> {
        self.negotiator
            .request_master(now)
            .into_iter()
            .map(|a| self.resolve_negotiator_action(a, std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED)))
            .collect()
    }

    pub fn load_track(
        &self,
        target_device: u8,
        source_device: u8,
        slot: Slot,
        track_id: u32,
    ) -> Result<NetworkCommand, CommandError> {
        if !self.registry.has_mixer() {
            return Err(CommandError::PreconditionNotMet("load_track requires a mixer in the registry"));
        }
        let target_ip = self
            .registry
            .get(target_device)
            .map(|d| Ipv4Addr::from(d.ip))
            .ok_or(CommandError::PreconditionNotMet("target device not present in registry"))?;
        Ok(NetworkCommand::UnicastLoadTrack {
            target_ip,
            packet: LoadTrackPacket {
                device_number: self.local_device_number,
                target_device,
                source_device,
                slot,
                track_id,
            },
        })
    }

    pub fn fader_start(&self, device: u8, start: bool) -> Result<NetworkCommand, CommandError> {
        if !self.registry.has_mixer() {
            return Err(CommandError::PreconditionNotMet("fader_start requires a mixer in the registry"));
        }
        let target_ip = self
            .registry
            .get(device)
            .map(|d| Ipv4Addr::from(d.ip))
            .ok_or(CommandError::PreconditionNotMet("target device not present in registry"))?;
        Ok(NetworkCommand::UnicastFaderStart {
            target_ip,
            packet: FaderStartPacket { device_number: self.local_device_number, target_device: device, start },
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            local_device_number: self.local_device_number,
            devices: self.registry.iter().cloned().collect(),
            players: self.tracker.iter().map(|(k, v)| (*k, v.clone())).collect(),
            master: self.negotiator.role().clone(),
            effective_bpm_centi: self.beat_clock.effective_bpm_centi(),
            clock_stale: self.beat_clock.is_stale(),
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// What the MIDI clock generator task needs to keep ticking.
    pub fn clock_snapshot(&self) -> crate::midiclock::ClockSnapshot {
        crate::midiclock::ClockSnapshot {
            effective_bpm_centi: self.beat_clock.effective_bpm_centi(),
            anchor: self.beat_clock.anchor(),
            stale: self.beat_clock.is_stale(),
            running: self.beat_clock.has_anchor(),
        }
    }
}

trait BpmCentiFallback {
    fn bpm_centi_or_previous(&self) -> u16;
    fn effective_bpm_centi(&self) -> u16;
}

impl BpmCentiFallback for CdjStatusPacket {
    fn bpm_centi_or_previous(&self) -> u16 {
        self.bpm_centi
    }
    fn effective_bpm_centi(&self) -> u16 {
        self.bpm_centi
    }
}

impl BpmCentiFallback for BeatPacket {
    fn bpm_centi_or_previous(&self) -> u16 {
        self.bpm_centi
    }
    fn effective_bpm_centi(&self) -> u16 {
        (self.bpm_centi as f64 * self.pitch_factor()).round() as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive(device_number: u8, name: &str) -> Packet {
        Packet::Keepalive(KeepalivePacket {
            device_number,
            name: name.into(),
            mac: [device_number, 0, 0, 0, 0, device_number],
            ip: [10, 0, 0, device_number],
        })
    }

    fn addr() -> SocketAddr {
        "10.0.0.9:50000".parse().unwrap()
    }

    #[test]
    fn discovery_scenario_device_found_then_lost() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);

        core.handle_packet(&keepalive(2, "CDJ-2"), addr(), 0, Timestamp(0));
        assert!(core.snapshot().devices.iter().any(|d| d.device_number == 2));
        assert!(matches!(rx.try_recv().unwrap(), Event::DeviceFound { device_number: 2 }));

        core.tick(Timestamp(5_100_000));
        assert!(!core.snapshot().devices.iter().any(|d| d.device_number == 2));
    }

    #[test]
    fn load_track_fails_without_mixer_present() {
        let events = Arc::new(EventBus::default());
        let core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        let result = core.load_track(2, 2, Slot::Usb, 1);
        assert!(matches!(result, Err(CommandError::PreconditionNotMet(_))));
    }

    #[test]
    fn load_track_succeeds_once_mixer_and_target_known() {
        let events = Arc::new(EventBus::default());
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        core.handle_packet(
            &Packet::Keepalive(KeepalivePacket {
                device_number: 0x11,
                name: "DJM-900".into(),
                mac: [0x11; 6],
                ip: [10, 0, 0, 11],
            }),
            addr(),
            0,
            Timestamp(0),
        );
        core.handle_packet(&keepalive(2, "CDJ-2"), addr(), 0, Timestamp(0));

        let cmd = core.load_track(2, 2, Slot::Usb, 42).unwrap();
        assert!(matches!(cmd, NetworkCommand::UnicastLoadTrack { .. }));
    }

    #[test]
    fn master_flag_observed_from_status_updates_snapshot() {
        let events = Arc::new(EventBus::default());
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        let status = CdjStatusPacket {
            device_number: 2,
            name: "CDJ-2".into(),
            bpm_centi: 12800,
            pitch_raw: PITCH_CENTER,
            beat_in_bar: 1,
            beat_counter: 0,
            playing: true,
            cued: false,
            on_air: true,
            master: true,
            sync: true,
            track_ref: None,
            playhead_ms: 0,
        };
        core.handle_packet(&Packet::CdjStatus(status), addr(), 0, Timestamp(0));
        assert_eq!(core.snapshot().master.current_master, Some(2));
    }

    #[test]
    fn tick_emits_keepalive_and_status_even_when_not_master() {
        let events = Arc::new(EventBus::default());
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);

        let cmds = core.tick(Timestamp(0));
        assert!(cmds.iter().any(|c| matches!(c, NetworkCommand::BroadcastKeepalive(_))));
        assert!(cmds.iter().any(|c| matches!(c, NetworkCommand::BroadcastStatus(_))));
        assert!(!cmds.iter().any(|c| matches!(c, NetworkCommand::BroadcastBeat(_))));
    }

    #[test]
    fn tick_emits_beat_once_local_peer_holds_master() {
        let events = Arc::new(EventBus::default());
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        core.select_bpm_source(BpmSource::Manual(12_000), Timestamp(0));
        core.request_master(Timestamp(0));
        // Drain the master-claim handshake stages.
        for t in [0u64, 300_000, 600_000, 900_000] {
            core.tick(Timestamp(t));
        }
        assert_eq!(core.snapshot().master.current_master, Some(1));

        let cmds = core.tick(Timestamp(1_200_000));
        assert!(cmds.iter().any(|c| matches!(c, NetworkCommand::BroadcastBeat(_))));
    }

    #[test]
    fn pin_source_only_accepts_the_pinned_device() {
        let events = Arc::new(EventBus::default());
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        core.select_bpm_source(BpmSource::Pin(3), Timestamp(0));

        let status_from = |device_number: u8| {
            Packet::CdjStatus(CdjStatusPacket {
                device_number,
                name: "CDJ".into(),
                bpm_centi: 13_000,
                pitch_raw: PITCH_CENTER,
                beat_in_bar: 1,
                beat_counter: 0,
                playing: true,
                cued: false,
                on_air: true,
                master: false,
                sync: false,
                track_ref: None,
                playhead_ms: 0,
            })
        };

        core.handle_packet(&status_from(2), addr(), 0, Timestamp(0));
        assert_eq!(core.snapshot().effective_bpm_centi, 0);

        core.handle_packet(&status_from(3), addr(), 0, Timestamp(0));
        assert_eq!(core.snapshot().effective_bpm_centi, 13_000);
    }

    #[test]
    fn tap_tempo_source_ignores_network_bpm_and_responds_to_taps() {
        let events = Arc::new(EventBus::default());
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        core.select_bpm_source(BpmSource::Tap { taps: Vec::new() }, Timestamp(0));

        let status = Packet::CdjStatus(CdjStatusPacket {
            device_number: 2,
            name: "CDJ".into(),
            bpm_centi: 13_000,
            pitch_raw: PITCH_CENTER,
            beat_in_bar: 1,
            beat_counter: 0,
            playing: true,
            cued: false,
            on_air: true,
            master: true,
            sync: false,
            track_ref: None,
            playhead_ms: 0,
        });
        core.handle_packet(&status, addr(), 0, Timestamp(0));
        assert_eq!(core.snapshot().effective_bpm_centi, 0);

        for t in [0u64, 500_000, 1_000_000] {
            core.tap_tempo(Timestamp(t));
        }
        assert_eq!(core.snapshot().effective_bpm_centi, 12_000);
    }

    #[test]
    fn clock_source_changed_published_on_staleness_transition() {
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let mut core = LinkCore::new(1, "prodj-link".into(), [1, 0, 0, 0, 0, 1], [10, 0, 0, 1], events);
        core.select_bpm_source(BpmSource::Manual(12_000), Timestamp(0));

        core.tick(Timestamp(3_000_000));
        let mut saw_stale = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::ClockSourceChanged { stale: true }) {
                saw_stale = true;
            }
        }
        assert!(saw_stale);
    }
}
