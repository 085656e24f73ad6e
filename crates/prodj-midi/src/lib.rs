//! MIDI sink abstraction and platform-specific implementations.
//!
//! The MIDI Clock Generator writes standard MIDI bytes (clock, start, stop,
//! optional note events) through the `MidiSink` trait. Two conformant
//! providers are selected at construction by `create_sink`; the generator
//! never sees which one it got.

pub mod platform;

/// Trait for platform-specific MIDI output ports.
pub trait MidiSink: Send {
    /// Open (or re-open) the named output port.
    fn open(&mut self, port_name: &str) -> anyhow::Result<()>;

    /// Write raw MIDI bytes (clock ticks, start/stop, note on/off).
    fn send(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Close the port. Safe to call even if never opened.
    fn close(&mut self) -> anyhow::Result<()>;

    /// Name of the port as it appears to other applications.
    fn sink_name(&self) -> &str;
}

/// Create a platform-appropriate MIDI sink. The generator calls `open`
/// with the configured `--midi-port` name before its first tick.
pub fn create_sink() -> Box<dyn MidiSink> {
    #[cfg(target_os = "linux")]
    {
        Box::new(platform::linux::AlsaMidiSink::new())
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(platform::macos::CoreMidiSink::new())
    }

    #[cfg(target_os = "windows")]
    {
        Box::new(platform::windows::WindowsMidiSink::new())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Box::new(platform::stub::StubMidiSink::new())
    }
}
