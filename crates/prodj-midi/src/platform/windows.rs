//! Windows MIDI sink via the WinRT `Windows.Devices.Midi` APIs.
//!
//! Device enumeration and port binding on WinRT is asynchronous and is done
//! once at startup by the binary; this sink only wraps the bound port for
//! the hot send path.

use tracing::{info, warn};
use windows::Devices::Midi::IMidiOutPort;

use crate::MidiSink;

pub struct WindowsMidiSink {
    name: String,
    port: Option<IMidiOutPort>,
}

unsafe impl Send for WindowsMidiSink {}

impl WindowsMidiSink {
    pub fn new() -> Self {
        Self { name: String::new(), port: None }
    }

    /// Bind an already-enumerated output port (set up by the binary's WinRT
    /// device watcher before the generator starts).
    pub fn bind(&mut self, port: IMidiOutPort) {
        self.port = Some(port);
    }
}

impl MidiSink for WindowsMidiSink {
    fn open(&mut self, port_name: &str) -> anyhow::Result<()> {
        self.name = port_name.to_string();
        if self.port.is_none() {
            warn!(port = %port_name, "Windows MIDI sink has no bound port yet");
        }
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        match &self.port {
            Some(port) => {
                let buffer = windows::Storage::Streams::Buffer::Create(data.len() as u32)
                    .map_err(|e| anyhow::anyhow!("buffer alloc failed: {e}"))?;
                port.SendBuffer(&buffer)
                    .map_err(|e| anyhow::anyhow!("SendBuffer failed: {e}"))?;
                Ok(())
            }
            None => {
                info!("Windows MIDI sink not bound; dropping clock byte(s)");
                Ok(())
            }
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.port = None;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        &self.name
    }
}
