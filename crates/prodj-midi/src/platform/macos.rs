//! macOS CoreMIDI sink.

use coremidi::{Client, VirtualSource};
use tracing::info;

use crate::MidiSink;

pub struct CoreMidiSink {
    name: String,
    client: Option<Client>,
    virtual_source: Option<VirtualSource>,
}

impl CoreMidiSink {
    pub fn new() -> Self {
        Self { name: String::new(), client: None, virtual_source: None }
    }
}

impl MidiSink for CoreMidiSink {
    fn open(&mut self, port_name: &str) -> anyhow::Result<()> {
        self.name = port_name.to_string();
        let client = Client::new(&format!("prodj-link {port_name}"))
            .map_err(|_| anyhow::anyhow!("CoreMIDI client creation failed"))?;
        let source = client
            .virtual_source(port_name)
            .map_err(|_| anyhow::anyhow!("CoreMIDI virtual source creation failed"))?;
        info!(port = %port_name, "CoreMIDI clock sink opened");
        self.client = Some(client);
        self.virtual_source = Some(source);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let source = self
            .virtual_source
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("sink not open"))?;
        let packets = coremidi::PacketBuffer::new(0, data);
        source
            .received(&packets)
            .map_err(|_| anyhow::anyhow!("CoreMIDI send failed"))?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.virtual_source = None;
        self.client = None;
        Ok(())
    }

    fn sink_name(&self) -> &str {
        &self.name
    }
}
