//! Interface name resolution for `--iface` (spec.md §6).
//!
//! The teacher always binds `Ipv4Addr::UNSPECIFIED` and never needs to turn
//! an interface name into an address; this core's wire format requires
//! broadcasting on the interface's own subnet, so the name has to resolve
//! to a concrete IPv4 address first. Grounded in the interface-enumeration
//! crate other network-peer repos in the pack use for the same purpose.

use std::net::Ipv4Addr;

use anyhow::{anyhow, Context};

pub fn resolve_iface(name: &str) -> anyhow::Result<Ipv4Addr> {
    let interfaces = get_if_addrs::get_if_addrs().context("failed to enumerate network interfaces")?;
    interfaces
        .into_iter()
        .find(|i| i.name == name)
        .and_then(|i| match i.addr {
            get_if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            get_if_addrs::IfAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("no IPv4 address found for interface {name:?}"))
}
