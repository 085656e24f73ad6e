//! Network I/O (spec.md §4.2).
//!
//! Three UDP sockets, one per ProDJ Link port, grounded in the teacher's
//! `broadcaster::create_multicast_socket` construction (`socket2` for the
//! broadcast/reuse options `tokio::net::UdpSocket` doesn't expose, then
//! handed to Tokio). The discovery and beat/status ports are broadcast, not
//! multicast, so the socket options differ from the teacher's.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use prodj_protocol::packets::{DecodeError, Packet};
use prodj_protocol::{PORT_BEAT_STATUS, PORT_DISCOVERY, PORT_STATUS_UNICAST};

use crate::error::CoreError;

fn bind_udp(port: u16, broadcast: bool, iface: Ipv4Addr) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    let addr = SocketAddrV4::new(iface, port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Owns the three sockets the link speaks over. S0 (discovery, broadcast),
/// S1 (beat/status, broadcast), S2 (status unicast, point-to-point).
pub struct LinkSockets {
    pub discovery: UdpSocket,
    pub beat_status: UdpSocket,
    pub status_unicast: UdpSocket,
    broadcast_addr: Ipv4Addr,
}

impl LinkSockets {
    /// `iface` is the IPv4 address of the network interface to bind and the
    /// address whose /24 broadcast form is used for outbound sends — the
    /// real protocol only ever operates on a single attached subnet. Status
    /// (port 50002) carries both our own broadcast CDJ status (spec.md §4.1
    /// table) and point-to-point yield/load-track commands, so broadcast is
    /// enabled on it too, same as discovery and beat/status.
    pub fn bind(iface: Ipv4Addr) -> anyhow::Result<Self> {
        let discovery = UdpSocket::from_std(
            bind_udp(PORT_DISCOVERY, true, iface)
                .map_err(|source| CoreError::SocketBind { port: PORT_DISCOVERY, source })?,
        )?;
        let beat_status = UdpSocket::from_std(
            bind_udp(PORT_BEAT_STATUS, true, iface)
                .map_err(|source| CoreError::SocketBind { port: PORT_BEAT_STATUS, source })?,
        )?;
        let status_unicast = UdpSocket::from_std(
            bind_udp(PORT_STATUS_UNICAST, true, iface)
                .map_err(|source| CoreError::SocketBind { port: PORT_STATUS_UNICAST, source })?,
        )?;

        let octets = iface.octets();
        let broadcast_addr = Ipv4Addr::new(octets[0], octets[1], octets[2], 255);

        debug!(%iface, %broadcast_addr, "link sockets bound");
        Ok(Self { discovery, beat_status, status_unicast, broadcast_addr })
    }

    pub async fn send_broadcast_discovery(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.discovery.send_to(buf, SocketAddrV4::new(self.broadcast_addr, PORT_DISCOVERY)).await
    }

    pub async fn send_broadcast_beat_status(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.beat_status.send_to(buf, SocketAddrV4::new(self.broadcast_addr, PORT_BEAT_STATUS)).await
    }

    pub async fn send_unicast_status(&self, buf: &[u8], target: Ipv4Addr) -> std::io::Result<usize> {
        self.status_unicast.send_to(buf, SocketAddrV4::new(target, PORT_STATUS_UNICAST)).await
    }

    /// Our own CDJ status, broadcast on 50002 (spec.md §4.2's 200ms cadence).
    pub async fn send_broadcast_status(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.status_unicast.send_to(buf, SocketAddrV4::new(self.broadcast_addr, PORT_STATUS_UNICAST)).await
    }

    /// Fader-start (type 0x02) goes out on the beat/status port, 50001 —
    /// unlike the other unicast status-path commands, which stay on 50002.
    pub async fn send_unicast_beat_status(&self, buf: &[u8], target: Ipv4Addr) -> std::io::Result<usize> {
        self.beat_status.send_to(buf, SocketAddrV4::new(target, PORT_BEAT_STATUS)).await
    }

    /// Fan out a command addressed to a specific device number's IP; the
    /// caller resolves `target` through the device registry first.
    pub async fn send_unicast_discovery(&self, buf: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        self.discovery.send_to(buf, target).await
    }
}

/// Inbound message tagged with the socket (hence port) it arrived on, since
/// `decode_on_port` needs that to disambiguate type `0x02`.
#[derive(Debug)]
pub struct InboundDatagram {
    pub port: u16,
    pub from: SocketAddr,
    pub packet: Result<Packet, DecodeError>,
}

/// Receive loop for one socket; pushes decoded datagrams to `tx` until the
/// socket errors or the channel closes.
pub async fn recv_loop(
    socket: &UdpSocket,
    port: u16,
    tx: tokio::sync::mpsc::Sender<InboundDatagram>,
) -> anyhow::Result<()> {
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let packet = prodj_protocol::packets::decode_on_port(&buf[..len], port);
        if let Err(ref e) = packet {
            debug!(%from, port, error = %e, "dropped unparseable datagram");
        }
        if tx.send(InboundDatagram { port, from, packet }).await.is_err() {
            warn!(port, "inbound channel closed, stopping receive loop");
            return Ok(());
        }
    }
}
