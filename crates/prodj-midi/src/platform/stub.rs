//! Fallback MIDI sink for unsupported platforms and for tests.

use tracing::warn;

use crate::MidiSink;

pub struct StubMidiSink {
    name: String,
    opened: bool,
    sent: Vec<Vec<u8>>,
}

impl StubMidiSink {
    pub fn new() -> Self {
        Self { name: String::new(), opened: false, sent: Vec::new() }
    }

    /// Bytes passed to `send` so far; used by tests to assert clock cadence.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }
}

impl MidiSink for StubMidiSink {
    fn open(&mut self, port_name: &str) -> anyhow::Result<()> {
        self.name = port_name.to_string();
        self.opened = true;
        warn!(port = %port_name, "MIDI sink not supported on this platform");
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.sent.push(data.to_vec());
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.opened = false;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        &self.name
    }
}
