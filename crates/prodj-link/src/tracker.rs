//! Player State Tracker (spec.md §4.5).
//!
//! Grounded in the teacher's `MidiState::process_message` last-writer-wins
//! per-field update, adapted to the beat_counter monotonic-except-track-load
//! rule and the BPM "no tempo" sentinel.

use std::collections::HashMap;

use prodj_protocol::model::PlayerState;
use prodj_protocol::packets::{BeatPacket, CdjStatusPacket, BPM_NO_TEMPO};

use crate::events::Event;

#[derive(Debug, Default)]
pub struct PlayerStateTracker {
    states: HashMap<u8, PlayerState>,
}

impl PlayerStateTracker {
    pub fn new() -> Self {
        Self { states: HashMap::new() }
    }

    pub fn get(&self, device_number: u8) -> Option<&PlayerState> {
        self.states.get(&device_number)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u8, &PlayerState)> {
        self.states.iter()
    }

    pub fn remove(&mut self, device_number: u8) {
        self.states.remove(&device_number);
    }

    /// Apply a CDJ status packet. Returns the events this transition emits.
    pub fn apply_status(&mut self, pkt: &CdjStatusPacket, now_micros: u64) -> Vec<Event> {
        let mut events = Vec::new();
        let state = self.states.entry(pkt.device_number).or_default();

        let was_playing = state.playing;
        let was_cued = state.cued;
        let prev_track_ref = state.track_ref;

        if pkt.bpm_centi != BPM_NO_TEMPO {
            state.bpm_centi = pkt.bpm_centi;
        }
        state.pitch = pitch_factor_from_raw(pkt.pitch_raw);
        if pkt.beat_in_bar != 0 {
            state.beat_in_bar = pkt.beat_in_bar;
        }
        state.playing = pkt.playing;
        state.cued = pkt.cued;
        state.on_air = pkt.on_air;
        state.master = pkt.master;
        state.sync = pkt.sync;
        state.playhead_ms = pkt.playhead_ms;
        state.last_status_ts = Some(prodj_protocol::model::Timestamp(now_micros));

        if pkt.track_ref != prev_track_ref {
            state.track_ref = pkt.track_ref;
            state.beat_counter = 0;
            if let Some(track_ref) = pkt.track_ref {
                events.push(Event::TrackLoaded { device_number: pkt.device_number, track_ref });
            }
        } else if pkt.beat_counter > state.beat_counter {
            state.beat_counter = pkt.beat_counter;
        }

        if !was_playing && state.playing {
            events.push(Event::Play { device_number: pkt.device_number });
        }
        if !was_cued && state.cued {
            events.push(Event::Cue { device_number: pkt.device_number });
        }

        events.push(Event::PlayerUpdate { device_number: pkt.device_number });
        events
    }

    /// Apply an inbound beat packet (§4.5 "Beat packet handling").
    pub fn apply_beat(&mut self, pkt: &BeatPacket, now_micros: u64) -> Vec<Event> {
        let state = self.states.entry(pkt.device_number).or_default();
        state.beat_in_bar = pkt.beat_in_bar;
        state.last_beat_ts = Some(prodj_protocol::model::Timestamp(now_micros));
        state.beat_counter = state.beat_counter.wrapping_add(1);
        if pkt.bpm_centi != BPM_NO_TEMPO {
            state.bpm_centi = pkt.bpm_centi;
        }
        state.pitch = pkt.pitch_factor();
        state.next_beat_offsets_ms = pkt.next_beat_offsets_ms;

        vec![Event::Beat { device_number: pkt.device_number }]
    }
}

fn pitch_factor_from_raw(pitch_raw: u32) -> f64 {
    (pitch_raw as f64 - prodj_protocol::packets::PITCH_CENTER as f64)
        / prodj_protocol::packets::PITCH_CENTER as f64
        + 1.0
}
