//! Device Registry (spec.md §4.3).
//!
//! Owned exclusively by the link core task. Shaped after the teacher
//! client's `discovery::DiscoveredHost` list — upsert-by-key, periodic
//! liveness scan, removal-triggered notification — adapted from mDNS
//! service records to ProDJ Link keepalive/status packets.

use std::collections::HashMap;

use prodj_protocol::model::{Device, DeviceKind, Timestamp};

pub const LIVENESS_TIMEOUT_MICROS: u64 = 5_000_000;
pub const LIVENESS_SCAN_INTERVAL_MICROS: u64 = 250_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// A different MAC announced an already-claimed device number.
    Conflicting,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<u8, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: HashMap::new() }
    }

    pub fn get(&self, device_number: u8) -> Option<&Device> {
        self.devices.get(&device_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn has_mixer(&self) -> bool {
        self.devices.values().any(|d| d.kind == DeviceKind::Djm)
    }

    /// Upsert on inbound keepalive or first-seen status packet.
    pub fn upsert(
        &mut self,
        device_number: u8,
        name: &str,
        mac: [u8; 6],
        ip: [u8; 4],
        now: Timestamp,
    ) -> UpsertOutcome {
        if let Some(existing) = self.devices.get_mut(&device_number) {
            if existing.mac != mac {
                return UpsertOutcome::Conflicting;
            }
            existing.last_seen = now;
            existing.name = name.to_string();
            existing.ip = ip;
            return UpsertOutcome::Updated;
        }

        self.devices.insert(
            device_number,
            Device {
                device_number,
                kind: DeviceKind::from_device_number(device_number),
                name: name.to_string(),
                mac,
                ip,
                last_seen: now,
            },
        );
        UpsertOutcome::Inserted
    }

    /// Scan every 250 ms; returns device numbers evicted this pass.
    pub fn evict_stale(&mut self, now: Timestamp) -> Vec<u8> {
        let stale: Vec<u8> = self
            .devices
            .values()
            .filter(|d| now.saturating_diff_micros(d.last_seen) > LIVENESS_TIMEOUT_MICROS)
            .map(|d| d.device_number)
            .collect();
        for device_number in &stale {
            self.devices.remove(device_number);
        }
        stale
    }

    /// Pick the lowest free player device number in 1..=4, for the
    /// self-assignment handshake in §4.3.
    pub fn lowest_free_player_number(&self) -> Option<u8> {
        (1..=4).find(|n| !self.devices.contains_key(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(n: u8) -> [u8; 6] {
        [n, 0, 0, 0, 0, n]
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let mut reg = DeviceRegistry::new();
        assert_eq!(
            reg.upsert(2, "CDJ-2", mac(2), [10, 0, 0, 2], Timestamp(0)),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            reg.upsert(2, "CDJ-2", mac(2), [10, 0, 0, 2], Timestamp(1_000)),
            UpsertOutcome::Updated
        );
        assert_eq!(reg.get(2).unwrap().last_seen, Timestamp(1_000));
    }

    #[test]
    fn conflicting_mac_is_rejected_not_inserted() {
        let mut reg = DeviceRegistry::new();
        reg.upsert(2, "CDJ-2", mac(2), [10, 0, 0, 2], Timestamp(0));
        let outcome = reg.upsert(2, "CDJ-2-impostor", mac(99), [10, 0, 0, 99], Timestamp(1));
        assert_eq!(outcome, UpsertOutcome::Conflicting);
        assert_eq!(reg.get(2).unwrap().mac, mac(2));
    }

    #[test]
    fn discovery_scenario_insert_then_eviction_after_5_1s() {
        let mut reg = DeviceRegistry::new();
        reg.upsert(2, "CDJ-2", mac(2), [10, 0, 0, 2], Timestamp(0));
        assert!(reg.get(2).is_some());

        let evicted = reg.evict_stale(Timestamp(5_100_000));
        assert_eq!(evicted, vec![2]);
        assert!(reg.get(2).is_none());
    }

    #[test]
    fn not_evicted_before_5s_timeout() {
        let mut reg = DeviceRegistry::new();
        reg.upsert(2, "CDJ-2", mac(2), [10, 0, 0, 2], Timestamp(0));
        let evicted = reg.evict_stale(Timestamp(4_999_999));
        assert!(evicted.is_empty());
        assert!(reg.get(2).is_some());
    }

    #[test]
    fn lowest_free_player_number_skips_taken_slots() {
        let mut reg = DeviceRegistry::new();
        reg.upsert(1, "CDJ-1", mac(1), [10, 0, 0, 1], Timestamp(0));
        reg.upsert(2, "CDJ-2", mac(2), [10, 0, 0, 2], Timestamp(0));
        assert_eq!(reg.lowest_free_player_number(), Some(3));
    }

    #[test]
    fn has_mixer_detects_djm_range() {
        let mut reg = DeviceRegistry::new();
        assert!(!reg.has_mixer());
        reg.upsert(0x11, "DJM-900", mac(0x11), [10, 0, 0, 11], Timestamp(0));
        assert!(reg.has_mixer());
    }
}
