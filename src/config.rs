use std::fmt;
use std::time::Duration;

use crate::api::Api;
use crate::errors::Error;
use crate::message::{MidiMessage, Ump};
use crate::port::PortInfo;
use crate::segment::ChunkingParameters;
use crate::timestamp::{TimestampFn, TimestampMode};
use crate::Ignore;

pub type Midi1Callback = Box<dyn FnMut(MidiMessage) + Send>;
pub type UmpCallback = Box<dyn FnMut(Ump) + Send>;
pub type ErrorCallback = Box<dyn FnMut(&Error) + Send>;
pub type WarningCallback = Box<dyn FnMut(&str) + Send>;
pub type PortCallback = Box<dyn FnMut(&PortInfo) + Send>;

/// The message callback decides which protocol an input speaks: a MIDI 1
/// callback selects byte-stream backends, a UMP callback packet backends.
pub enum InputCallback {
    Midi1(Midi1Callback),
    Ump(UmpCallback),
}

impl InputCallback {
    pub(crate) fn is_ump(&self) -> bool {
        matches!(self, InputCallback::Ump(_))
    }
}

/// Configuration common to every MIDI input, regardless of backend.
pub struct InputConfig {
    pub callback: InputCallback,
    /// Used in [`TimestampMode::Custom`]; receives the best available
    /// absolute timestamp and returns the value to deliver.
    pub get_timestamp: Option<TimestampFn>,
    pub on_error: Option<ErrorCallback>,
    pub on_warning: Option<WarningCallback>,
    /// Message classes to filter out. By default nothing is ignored.
    pub ignore: Ignore,
    pub timestamps: TimestampMode,
}

impl InputConfig {
    /// MIDI 1.0 input configuration delivering byte messages.
    pub fn new<F>(on_message: F) -> InputConfig
    where
        F: FnMut(MidiMessage) + Send + 'static,
    {
        InputConfig {
            callback: InputCallback::Midi1(Box::new(on_message)),
            get_timestamp: None,
            on_error: None,
            on_warning: None,
            ignore: Ignore::None,
            timestamps: TimestampMode::default(),
        }
    }

    /// MIDI 2.0 input configuration delivering UMP packets.
    pub fn new_ump<F>(on_message: F) -> InputConfig
    where
        F: FnMut(Ump) + Send + 'static,
    {
        InputConfig {
            callback: InputCallback::Ump(Box::new(on_message)),
            get_timestamp: None,
            on_error: None,
            on_warning: None,
            ignore: Ignore::None,
            timestamps: TimestampMode::default(),
        }
    }

    pub fn ignoring(mut self, ignore: Ignore) -> InputConfig {
        self.ignore = ignore;
        self
    }

    pub fn with_timestamps(mut self, mode: TimestampMode) -> InputConfig {
        self.timestamps = mode;
        self
    }

    pub fn with_timestamp_fn<F>(mut self, f: F) -> InputConfig
    where
        F: FnMut(i64) -> i64 + Send + 'static,
    {
        self.get_timestamp = Some(Box::new(f));
        self.timestamps = TimestampMode::Custom;
        self
    }

    pub fn on_error<F>(mut self, f: F) -> InputConfig
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_warning<F>(mut self, f: F) -> InputConfig
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_warning = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for InputConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InputConfig")
            .field("protocol", &if self.callback.is_ump() { "ump" } else { "midi1" })
            .field("ignore", &self.ignore)
            .field("timestamps", &self.timestamps)
            .finish()
    }
}

/// Configuration common to every MIDI output.
pub struct OutputConfig {
    pub on_error: Option<ErrorCallback>,
    pub on_warning: Option<WarningCallback>,
    /// When set, large writes through transports with bounded buffers are
    /// split and paced according to this policy.
    pub chunking: Option<ChunkingParameters>,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig { on_error: None, on_warning: None, chunking: None }
    }
}

impl OutputConfig {
    pub fn new() -> OutputConfig {
        OutputConfig::default()
    }

    pub fn with_chunking(mut self, interval: Duration, size: usize) -> OutputConfig {
        let mut params = ChunkingParameters::with_chunk_size(size);
        params.interval = interval;
        self.chunking = Some(params);
        self
    }

    pub fn on_error<F>(mut self, f: F) -> OutputConfig
    where
        F: FnMut(&Error) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_warning<F>(mut self, f: F) -> OutputConfig
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.on_warning = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for OutputConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OutputConfig").field("chunking", &self.chunking).finish()
    }
}

/// Configuration of an [`crate::Observer`].
pub struct ObserverConfig {
    pub on_input_added: Option<PortCallback>,
    pub on_input_removed: Option<PortCallback>,
    pub on_output_added: Option<PortCallback>,
    pub on_output_removed: Option<PortCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_warning: Option<WarningCallback>,
    /// Report endpoints backed by physical devices.
    pub track_hardware: bool,
    /// Report software (virtual) endpoints.
    pub track_virtual: bool,
    /// Report endpoints whose nature the transport cannot classify.
    pub track_any: bool,
}

impl Default for ObserverConfig {
    fn default() -> ObserverConfig {
        ObserverConfig {
            on_input_added: None,
            on_input_removed: None,
            on_output_added: None,
            on_output_removed: None,
            on_error: None,
            on_warning: None,
            track_hardware: true,
            track_virtual: true,
            track_any: true,
        }
    }
}

impl ObserverConfig {
    pub fn new() -> ObserverConfig {
        ObserverConfig::default()
    }

    pub fn on_input_added<F>(mut self, f: F) -> ObserverConfig
    where
        F: FnMut(&PortInfo) + Send + 'static,
    {
        self.on_input_added = Some(Box::new(f));
        self
    }

    pub fn on_input_removed<F>(mut self, f: F) -> ObserverConfig
    where
        F: FnMut(&PortInfo) + Send + 'static,
    {
        self.on_input_removed = Some(Box::new(f));
        self
    }

    pub fn on_output_added<F>(mut self, f: F) -> ObserverConfig
    where
        F: FnMut(&PortInfo) + Send + 'static,
    {
        self.on_output_added = Some(Box::new(f));
        self
    }

    pub fn on_output_removed<F>(mut self, f: F) -> ObserverConfig
    where
        F: FnMut(&PortInfo) + Send + 'static,
    {
        self.on_output_removed = Some(Box::new(f));
        self
    }

    pub(crate) fn wants_notifications(&self) -> bool {
        self.on_input_added.is_some()
            || self.on_input_removed.is_some()
            || self.on_output_added.is_some()
            || self.on_output_removed.is_some()
    }

    pub(crate) fn tracks(&self, kind: crate::port::TransportKind) -> bool {
        use crate::port::TransportKind::*;
        match kind {
            Hardware => self.track_hardware,
            Software => self.track_virtual,
            Unknown => self.track_any,
        }
    }
}

impl fmt::Debug for ObserverConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ObserverConfig")
            .field("track_hardware", &self.track_hardware)
            .field("track_virtual", &self.track_virtual)
            .field("track_any", &self.track_any)
            .finish()
    }
}

/// ALSA sequencer backend settings.
#[derive(Clone)]
pub struct AlsaSeqConfig {
    /// Name the client registers under on the sequencer graph.
    pub client_name: String,
    /// When set, input connections are multiplexed over this process-wide
    /// client instead of opening one client and reader thread each.
    #[cfg(target_os = "linux")]
    pub context: Option<std::sync::Arc<crate::backend::SharedSeqContext>>,
}

impl Default for AlsaSeqConfig {
    fn default() -> AlsaSeqConfig {
        AlsaSeqConfig {
            client_name: "unimidi".to_string(),
            #[cfg(target_os = "linux")]
            context: None,
        }
    }
}

impl fmt::Debug for AlsaSeqConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut s = f.debug_struct("AlsaSeqConfig");
        s.field("client_name", &self.client_name);
        #[cfg(target_os = "linux")]
        s.field("shared_context", &self.context.is_some());
        s.finish()
    }
}

/// ALSA rawmidi backend settings.
#[derive(Debug, Clone, Default)]
pub struct AlsaRawConfig {}

/// JACK backend settings.
#[derive(Debug, Clone)]
pub struct JackConfig {
    pub client_name: String,
}

impl Default for JackConfig {
    fn default() -> JackConfig {
        JackConfig { client_name: "unimidi".to_string() }
    }
}

/// CoreMIDI backend settings.
#[derive(Debug, Clone)]
pub struct CoreMidiConfig {
    pub client_name: String,
}

impl Default for CoreMidiConfig {
    fn default() -> CoreMidiConfig {
        CoreMidiConfig { client_name: "unimidi".to_string() }
    }
}

/// Windows Multimedia backend settings.
#[derive(Debug, Clone, Default)]
pub struct WinMmConfig {}

/// Web MIDI backend settings.
#[derive(Debug, Clone, Default)]
pub struct WebMidiConfig {}

/// OSC-over-UDP network backend settings, shared by the MIDI 1 and UMP
/// flavors.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Local address inputs bind to.
    pub accept: String,
    /// Remote host outputs send to.
    pub host: String,
    pub port: u16,
}

impl Default for NetConfig {
    fn default() -> NetConfig {
        NetConfig { accept: "0.0.0.0".to_string(), host: "127.0.0.1".to_string(), port: 5004 }
    }
}

/// Selects a specific backend, optionally with its settings. Passing a
/// bare [`Api`] uses that backend with default settings.
#[derive(Debug)]
pub enum ApiConfig {
    Api(Api),
    AlsaSeq(AlsaSeqConfig),
    AlsaRaw(AlsaRawConfig),
    Jack(JackConfig),
    CoreMidi(CoreMidiConfig),
    WinMm(WinMmConfig),
    WebMidi(WebMidiConfig),
    Network(NetConfig),
    NetworkUmp(NetConfig),
    Dummy,
}

impl ApiConfig {
    pub fn api(&self) -> Api {
        match self {
            ApiConfig::Api(api) => *api,
            ApiConfig::AlsaSeq(_) => Api::AlsaSeq,
            ApiConfig::AlsaRaw(_) => Api::AlsaRaw,
            ApiConfig::Jack(_) => Api::JackMidi,
            ApiConfig::CoreMidi(_) => Api::CoreMidi,
            ApiConfig::WinMm(_) => Api::WindowsMm,
            ApiConfig::WebMidi(_) => Api::WebMidi,
            ApiConfig::Network(_) => Api::Network,
            ApiConfig::NetworkUmp(_) => Api::NetworkUmp,
            ApiConfig::Dummy => Api::Dummy,
        }
    }
}
