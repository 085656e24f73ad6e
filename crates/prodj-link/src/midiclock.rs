//! MIDI Clock Generator (spec.md §4.7).
//!
//! Runs in its own dedicated timing task, grounded in the teacher's
//! `broadcaster::run_heartbeat` dedicated-interval-task pattern and the
//! `midi-device::VirtualMidiDevice` sink boundary (here `prodj_midi::MidiSink`).
//! Reads the latest BPM/anchor through a lock-free `watch` snapshot the link
//! core publishes; owns only its own generator state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use prodj_midi::MidiSink;
use prodj_protocol::model::Timestamp;

use crate::beatclock::tick_interval_micros_for;
use crate::clock::Clock;
use crate::error::CoreError;
use crate::events::{Event, EventBus};

const MIDI_CLOCK_BYTE: u8 = 0xF8;
const MIDI_START_BYTE: u8 = 0xFA;
const MIDI_STOP_BYTE: u8 = 0xFC;
const MIDI_CONTINUE_BYTE: u8 = 0xFB;

/// What the link core publishes for the generator to read.
#[derive(Debug, Clone, Copy)]
pub struct ClockSnapshot {
    pub effective_bpm_centi: u16,
    pub anchor: Timestamp,
    pub stale: bool,
    pub running: bool,
}

impl Default for ClockSnapshot {
    fn default() -> Self {
        ClockSnapshot { effective_bpm_centi: 0, anchor: Timestamp::ZERO, stale: false, running: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BeatNoteConfig {
    pub enabled: bool,
    pub note: u8,
    pub channel: u8,
}

impl Default for BeatNoteConfig {
    fn default() -> Self {
        Self { enabled: false, note: 36, channel: 0 }
    }
}

/// Counters exposed to the observer API.
#[derive(Debug, Default)]
pub struct GeneratorMetrics {
    underrun_count: AtomicU32,
}

impl GeneratorMetrics {
    pub fn underrun_count(&self) -> u32 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    fn record_underrun(&self) -> u32 {
        self.underrun_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn note_on(channel: u8, note: u8) -> [u8; 3] {
    [0x90 | (channel & 0x0F), note, 100]
}

fn note_off(channel: u8, note: u8) -> [u8; 3] {
    [0x80 | (channel & 0x0F), note, 0]
}

/// Dedicated timing task: emits start, 24-PPQN clock ticks, and stop.
/// `n` advances per schedule point; a new anchor from the link core resets
/// `n` back to 1 (spec.md §4.6's "monotonic schedule t_n = t_last_beat + n
/// * tick_interval").
pub async fn run(
    mut sink: Box<dyn MidiSink>,
    midi_port: String,
    note_config: BeatNoteConfig,
    mut snapshot_rx: watch::Receiver<ClockSnapshot>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    metrics: Arc<GeneratorMetrics>,
) -> anyhow::Result<()> {
    sink.open(&midi_port)?;

    let mut started = false;
    let mut n: u64 = 1;
    let mut current_anchor = Timestamp::ZERO;
    let mut beat_tick_counter: u64 = 0;

    loop {
        let snapshot = *snapshot_rx.borrow();

        if snapshot.running && !started {
            sink.send(&[MIDI_START_BYTE])?;
            started = true;
            n = 1;
            current_anchor = snapshot.anchor;
            info!("MIDI clock generator started");
        } else if !snapshot.running && started {
            sink.send(&[MIDI_STOP_BYTE])?;
            started = false;
            info!("MIDI clock generator stopped");
        }

        if snapshot.anchor != current_anchor {
            current_anchor = snapshot.anchor;
            n = 1;
        }

        if !started || snapshot.effective_bpm_centi == 0 {
            if snapshot_rx.changed().await.is_err() {
                return Ok(());
            }
            continue;
        }

        let interval = tick_interval_micros_for(snapshot.effective_bpm_centi);
        let scheduled = Timestamp(current_anchor.0 + n * interval);
        let now = clock.now();
        let wait_micros = scheduled.0.saturating_sub(now.0);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_micros(wait_micros)) => {
                let actual_now = clock.now();
                let late_by = actual_now.0.saturating_sub(scheduled.0);
                if late_by > interval {
                    let count = metrics.record_underrun();
                    warn!(ticks_late = count, "MIDI clock underrun");
                    events.publish(Event::MidiUnderrun { ticks_late: count });
                }

                if let Err(e) = sink.send(&[MIDI_CLOCK_BYTE]) {
                    let err = CoreError::MidiSinkError(e.to_string());
                    error!("{err}");
                    events.publish(Event::MidiSinkError { message: err.to_string() });
                    return Err(err.into());
                }
                debug!(n, interval_us = interval, "emitted MIDI clock tick");

                beat_tick_counter += 1;
                if note_config.enabled && beat_tick_counter % 24 == 0 {
                    let _ = sink.send(&note_on(note_config.channel, note_config.note));
                    let _ = sink.send(&note_off(note_config.channel, note_config.note));
                }

                n += 1;
            }
            changed = snapshot_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

pub async fn continue_clock(sink: &mut dyn MidiSink) -> anyhow::Result<()> {
    sink.send(&[MIDI_CONTINUE_BYTE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn note_on_off_bytes_use_configured_channel_and_note() {
        assert_eq!(note_on(2, 36), [0x92, 36, 100]);
        assert_eq!(note_off(2, 36), [0x82, 36, 0]);
    }

    #[test]
    fn metrics_underrun_counter_increments() {
        let metrics = GeneratorMetrics::default();
        assert_eq!(metrics.underrun_count(), 0);
        assert_eq!(metrics.record_underrun(), 1);
        assert_eq!(metrics.record_underrun(), 2);
        assert_eq!(metrics.underrun_count(), 2);
    }
}
