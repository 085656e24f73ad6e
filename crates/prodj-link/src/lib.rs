//! ProDJ Link core: a Pioneer ProDJ Link network peer limited to the
//! link-layer (discovery, master handoff, player state, beat-locked MIDI
//! clock). No library/UI layer; see spec.md §1 for the full scope note.

pub mod beatclock;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod handshake;
pub mod iface;
pub mod link;
pub mod midiclock;
pub mod negotiator;
pub mod net;
pub mod registry;
pub mod tracker;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use prodj_protocol::packets::{IdRequestPacket, Packet};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{CoreError, RunOutcome};
use crate::events::EventBus;
use crate::handshake::{HandshakeOutcome, SelfAssignment};
use crate::link::{Command, LinkCore, NetworkCommand};
use crate::midiclock::{BeatNoteConfig, GeneratorMetrics};
use crate::net::{InboundDatagram, LinkSockets};

/// Default bound for the external command channel (spec.md §4.8's Command
/// API); commands are user-paced (button presses, CLI calls), never a
/// high-rate stream, so a small bound is enough to never block a caller.
pub const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Convenience constructor for the channel `run()` expects — callers that
/// embed `prodj-link` hand the sender to whatever issues commands (a UI, an
/// RPC handler) and pass the receiver into `run()`.
pub fn command_channel() -> (tokio::sync::mpsc::Sender<Command>, tokio::sync::mpsc::Receiver<Command>) {
    tokio::sync::mpsc::channel(COMMAND_QUEUE_CAPACITY)
}

/// Entry point the binary calls. Never calls `std::process::exit` itself —
/// `main.rs` maps the returned outcome to an exit code. `commands` is the
/// external Command API surface (spec.md §4.8): drop the sender half if
/// nothing issues commands.
pub async fn run(config: Config, commands: tokio::sync::mpsc::Receiver<Command>) -> RunOutcome {
    match run_inner(config, commands).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("fatal error: {e:#}");
            RunOutcome::InterfaceUnusable
        }
    }
}

async fn run_inner(config: Config, mut commands: tokio::sync::mpsc::Receiver<Command>) -> anyhow::Result<RunOutcome> {
    let iface_ip = match iface::resolve_iface(&config.iface) {
        Ok(ip) => ip,
        Err(e) => {
            error!(iface = %config.iface, error = %e, "interface unusable");
            return Ok(RunOutcome::InterfaceUnusable);
        }
    };

    let sockets = match LinkSockets::bind(iface_ip) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(iface = %config.iface, error = %e, "failed to bind link sockets");
            return Ok(RunOutcome::InterfaceUnusable);
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = Arc::new(EventBus::default());

    let local_device_number = match run_handshake(&sockets, clock.as_ref(), config.device_number).await? {
        Some(n) => n,
        None => return Ok(RunOutcome::DeviceNumberUnresolvable),
    };
    info!(device_number = local_device_number, iface = %config.iface, "assigned device number");

    let local_name = format!("prodj-link-{local_device_number}");
    let local_mac = [0u8; 6];
    let local_ip = iface_ip.octets();
    let mut core = LinkCore::new(local_device_number, local_name, local_mac, local_ip, Arc::clone(&events));

    let (clock_tx, clock_rx) = tokio::sync::watch::channel(core.clock_snapshot());
    let (inbound_tx, mut inbound_rx) = tokio::sync::mpsc::channel::<InboundDatagram>(256);

    let recv_discovery = spawn_recv_loop(Arc::clone(&sockets), RecvSocket::Discovery, inbound_tx.clone());
    let recv_beat_status = spawn_recv_loop(Arc::clone(&sockets), RecvSocket::BeatStatus, inbound_tx.clone());
    let recv_status_unicast = spawn_recv_loop(Arc::clone(&sockets), RecvSocket::StatusUnicast, inbound_tx.clone());

    let metrics = Arc::new(GeneratorMetrics::default());
    let midi_sink = prodj_midi::create_sink();
    let mut midi_handle = tokio::spawn(midiclock::run(
        midi_sink,
        config.midi_port.clone(),
        BeatNoteConfig::default(),
        clock_rx,
        Arc::clone(&clock),
        Arc::clone(&events),
        Arc::clone(&metrics),
    ));

    let mut housekeeping = tokio::time::interval(Duration::from_millis(50));
    let mut midi_done = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
            Some(datagram) = inbound_rx.recv() => {
                match datagram.packet {
                    Ok(packet) => {
                        let now = clock.now();
                        let commands = core.handle_packet(&packet, datagram.from, now.0, now);
                        send_commands(&sockets, commands).await;
                        let _ = clock_tx.send(core.clock_snapshot());
                    }
                    Err(e) => {
                        warn!(port = datagram.port, %e, "decode error, dropping datagram");
                    }
                }
            }
            _ = housekeeping.tick() => {
                let now = clock.now();
                let commands = core.tick(now);
                send_commands(&sockets, commands).await;
                let _ = clock_tx.send(core.clock_snapshot());
            }
            Some(command) = commands.recv() => {
                let now = clock.now();
                let outbound = dispatch_command(&mut core, command, now);
                send_commands(&sockets, outbound).await;
                let _ = clock_tx.send(core.clock_snapshot());
            }
            result = &mut midi_handle, if !midi_done => {
                midi_done = true;
                match result {
                    Ok(Ok(())) => info!("MIDI clock generator task exited"),
                    Ok(Err(e)) => error!(%e, "MIDI clock generator task failed"),
                    Err(e) => error!(%e, "MIDI clock generator task panicked"),
                }
            }
        }
    }

    recv_discovery.abort();
    recv_beat_status.abort();
    recv_status_unicast.abort();
    if !midi_done {
        midi_handle.abort();
    }

    Ok(RunOutcome::Normal)
}

/// Translate an external `Command` into the `NetworkCommand`s to transmit,
/// if any (spec.md §4.8). Precondition failures are logged, not fatal.
fn dispatch_command(core: &mut LinkCore, command: Command, now: prodj_protocol::model::Timestamp) -> Vec<NetworkCommand> {
    match command {
        Command::RequestMaster => core.request_master(now),
        Command::LoadTrack { target_device, source_device, slot, track_id } => {
            match core.load_track(target_device, source_device, slot, track_id) {
                Ok(cmd) => vec![cmd],
                Err(e) => {
                    warn!(%e, "load_track rejected");
                    Vec::new()
                }
            }
        }
        Command::FaderStart { device, start } => match core.fader_start(device, start) {
            Ok(cmd) => vec![cmd],
            Err(e) => {
                warn!(%e, "fader_start rejected");
                Vec::new()
            }
        },
        Command::SelectBpmSource(source) => {
            core.select_bpm_source(source, now);
            Vec::new()
        }
        Command::TapTempo => {
            core.tap_tempo(now);
            Vec::new()
        }
    }
}

enum RecvSocket {
    Discovery,
    BeatStatus,
    StatusUnicast,
}

fn spawn_recv_loop(
    sockets: Arc<LinkSockets>,
    which: RecvSocket,
    tx: tokio::sync::mpsc::Sender<InboundDatagram>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let result = match which {
            RecvSocket::Discovery => net::recv_loop(&sockets.discovery, prodj_protocol::PORT_DISCOVERY, tx).await,
            RecvSocket::BeatStatus => net::recv_loop(&sockets.beat_status, prodj_protocol::PORT_BEAT_STATUS, tx).await,
            RecvSocket::StatusUnicast => {
                net::recv_loop(&sockets.status_unicast, prodj_protocol::PORT_STATUS_UNICAST, tx).await
            }
        };
        if let Err(e) = result {
            error!(%e, "receive loop exited");
        }
    })
}

async fn send_commands(sockets: &LinkSockets, commands: Vec<NetworkCommand>) {
    for command in commands {
        let result = match command {
            NetworkCommand::BroadcastDiscovery(pkt) => {
                let mut buf = Vec::new();
                pkt.serialize(&mut buf);
                sockets.send_broadcast_discovery(&buf).await
            }
            NetworkCommand::BroadcastKeepalive(pkt) => {
                let mut buf = Vec::new();
                pkt.serialize(&mut buf);
                sockets.send_broadcast_discovery(&buf).await
            }
            NetworkCommand::BroadcastBeat(pkt) => {
                let mut buf = Vec::new();
                pkt.serialize(&mut buf);
                sockets.send_broadcast_beat_status(&buf).await
            }
            NetworkCommand::BroadcastStatus(pkt) => {
                let mut buf = Vec::new();
                pkt.serialize(&mut buf);
                sockets.send_broadcast_status(&buf).await
            }
            NetworkCommand::BroadcastMasterClaim(pkt) => {
                let mut buf = Vec::new();
                pkt.serialize(&mut buf);
                sockets.send_broadcast_beat_status(&buf).await
            }
            NetworkCommand::UnicastYieldRequest { target_ip, packet } => {
                let mut buf = Vec::new();
                packet.serialize(&mut buf);
                sockets.send_unicast_status(&buf, target_ip).await
            }
            NetworkCommand::UnicastYieldResponse { target_ip, packet } => {
                let mut buf = Vec::new();
                packet.serialize(&mut buf);
                sockets.send_unicast_status(&buf, target_ip).await
            }
            NetworkCommand::UnicastLoadTrack { target_ip, packet } => {
                let mut buf = Vec::new();
                packet.serialize(&mut buf);
                sockets.send_unicast_status(&buf, target_ip).await
            }
            NetworkCommand::UnicastFaderStart { target_ip, packet } => {
                let mut buf = Vec::new();
                packet.serialize(&mut buf);
                sockets.send_unicast_beat_status(&buf, target_ip).await
            }
        };
        if let Err(e) = result {
            warn!(%e, "send failed, dropping packet (protocol is lossy by design)");
        }
    }
}

/// Self-assignment at startup (spec.md §4.3). Broadcasts ID-requests on the
/// discovery socket and listens for peers echoing the candidate number;
/// retries with the next free number up to `handshake::MAX_ATTEMPTS` times.
async fn run_handshake(
    sockets: &LinkSockets,
    clock: &dyn Clock,
    requested: Option<u8>,
) -> anyhow::Result<Option<u8>> {
    let mut candidate = requested.unwrap_or(1);
    let mut hs = SelfAssignment::new(candidate);
    let deadline_poll = Duration::from_millis(20);

    loop {
        let now = clock.now();
        if let Some(n) = hs.next_broadcast(now) {
            let pkt = IdRequestPacket { device_number: n, name: format!("prodj-link-{n}") };
            let mut buf = Vec::new();
            pkt.serialize(&mut buf);
            let _ = sockets.send_broadcast_discovery(&buf).await;
        }

        if let Ok(Ok((len, _from))) =
            tokio::time::timeout(deadline_poll, peek_discovery(sockets)).await
        {
            let mut buf = vec![0u8; len];
            if let Ok((n, _)) = sockets.discovery.try_recv_from(&mut buf) {
                if let Ok(Packet::IdRequest(req)) =
                    prodj_protocol::packets::decode_on_port(&buf[..n], prodj_protocol::PORT_DISCOVERY)
                {
                    hs.on_conflict_observed(req.device_number);
                } else if let Ok(Packet::Keepalive(ka)) =
                    prodj_protocol::packets::decode_on_port(&buf[..n], prodj_protocol::PORT_DISCOVERY)
                {
                    hs.on_conflict_observed(ka.device_number);
                }
            }
        }

        match hs.outcome() {
            HandshakeOutcome::Committed(n) => return Ok(Some(n)),
            HandshakeOutcome::Conflicted => {
                candidate = if candidate >= 4 { 1 } else { candidate + 1 };
                match hs.retry_with(candidate) {
                    HandshakeOutcome::Exhausted => {
                        error!("{}", CoreError::DeviceNumberConflict { attempts: handshake::MAX_ATTEMPTS });
                        return Ok(None);
                    }
                    _ => continue,
                }
            }
            HandshakeOutcome::InProgress => continue,
            HandshakeOutcome::Exhausted => {
                error!("{}", CoreError::DeviceNumberConflict { attempts: handshake::MAX_ATTEMPTS });
                return Ok(None);
            }
        }
    }
}

async fn peek_discovery(sockets: &LinkSockets) -> std::io::Result<(usize, std::net::SocketAddr)> {
    let mut probe = [0u8; 2048];
    sockets.discovery.peek_from(&mut probe).await
}
