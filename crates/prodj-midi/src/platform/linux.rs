//! Linux ALSA sequencer MIDI sink.
//!
//! Opens a single output port; apps (DAWs, clock-driven hardware bridges)
//! subscribe to it to receive clock/start/stop and note events.

use alsa::seq::{EventType, PortCap, PortInfo, PortType, Seq};
use std::ffi::CString;
use tracing::{debug, info};

use crate::MidiSink;

pub struct AlsaMidiSink {
    name: String,
    seq_handle: Option<Seq>,
    port: i32,
}

impl AlsaMidiSink {
    pub fn new() -> Self {
        Self { name: String::new(), seq_handle: None, port: -1 }
    }
}

impl MidiSink for AlsaMidiSink {
    fn open(&mut self, port_name: &str) -> anyhow::Result<()> {
        self.name = port_name.to_string();

        let seq_handle =
            Seq::open(None, None, true).map_err(|e| anyhow::anyhow!("ALSA open failed: {e}"))?;

        let client_name = CString::new(self.name.as_str())?;
        seq_handle
            .set_client_name(&client_name)
            .map_err(|e| anyhow::anyhow!("set_client_name failed: {e}"))?;

        let mut port_info = PortInfo::empty().map_err(|e| anyhow::anyhow!("{e}"))?;
        let port_cname = CString::new(self.name.as_str())?;
        port_info.set_name(&port_cname);
        port_info.set_capability(PortCap::READ | PortCap::SUBS_READ);
        port_info.set_type(PortType::MIDI_GENERIC | PortType::APPLICATION);
        seq_handle
            .create_port(&port_info)
            .map_err(|e| anyhow::anyhow!("create_port failed: {e}"))?;
        self.port = port_info.get_port();

        info!(port = %self.name, "ALSA MIDI clock sink opened");
        self.seq_handle = Some(seq_handle);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let seq = self
            .seq_handle
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("sink not open"))?;

        // Realtime/system bytes (clock, start, stop) are single-byte and map
        // directly onto ALSA's raw MIDI event passthrough; note on/off use
        // structured events like the teacher's virtual device bridge does.
        if data.len() == 1 {
            send_raw_byte(seq, self.port, data[0])?;
        } else {
            for chunk in data.chunks(3) {
                send_raw_bytes(seq, self.port, chunk)?;
            }
        }
        debug!(bytes = ?data, "sent MIDI clock bytes");
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.seq_handle = None;
        self.port = -1;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        &self.name
    }
}

fn send_raw_byte(seq: &Seq, port: i32, byte: u8) -> anyhow::Result<()> {
    let mut ev = alsa::seq::Event::new(
        match byte {
            0xF8 => EventType::Clock,
            0xFA => EventType::Start,
            0xFC => EventType::Stop,
            0xFB => EventType::Continue,
            _ => EventType::SysEx,
        },
        &alsa::seq::EvNote {
            channel: 0,
            note: 0,
            velocity: 0,
            off_velocity: 0,
            duration: 0,
        },
    );
    ev.set_source(port);
    ev.set_subs();
    ev.set_direct();
    seq.event_output_direct(&mut ev)
        .map_err(|e| anyhow::anyhow!("event_output_direct failed: {e}"))?;
    Ok(())
}

fn send_raw_bytes(seq: &Seq, port: i32, data: &[u8]) -> anyhow::Result<()> {
    if data.len() < 2 {
        return Ok(());
    }
    let status = data[0] & 0xF0;
    let channel = data[0] & 0x0F;
    let note = data.get(1).copied().unwrap_or(0);
    let velocity = data.get(2).copied().unwrap_or(0);
    let event_type = match status {
        0x90 => EventType::Noteon,
        0x80 => EventType::Noteoff,
        _ => EventType::Noteon,
    };
    let mut ev = alsa::seq::Event::new(
        event_type,
        &alsa::seq::EvNote { channel, note, velocity, off_velocity: 0, duration: 0 },
    );
    ev.set_source(port);
    ev.set_subs();
    ev.set_direct();
    seq.event_output_direct(&mut ev)
        .map_err(|e| anyhow::anyhow!("event_output_direct failed: {e}"))?;
    Ok(())
}
