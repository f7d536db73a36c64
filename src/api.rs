/// Identifies one MIDI transport. This is a closed set: every backend,
/// implemented or not on the current platform, has exactly one tag here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Api {
    CoreMidi,
    AlsaSeq,
    AlsaRaw,
    JackMidi,
    WindowsMm,
    WindowsUwp,
    WebMidi,
    PipeWire,
    AlsaRawUmp,
    AlsaSeqUmp,
    CoreMidiUmp,
    WindowsMidiServices,
    Network,
    NetworkUmp,
    AndroidAmidi,
    Keyboard,
    Kdmapi,
    JackUmp,
    PipeWireUmp,
    Dummy,
}

impl Api {
    /// Stable machine name, lowercase snake_case.
    pub fn name(&self) -> &'static str {
        match self {
            Api::CoreMidi => "coremidi",
            Api::AlsaSeq => "alsa_seq",
            Api::AlsaRaw => "alsa_raw",
            Api::JackMidi => "jack_midi",
            Api::WindowsMm => "windows_mm",
            Api::WindowsUwp => "windows_uwp",
            Api::WebMidi => "webmidi",
            Api::PipeWire => "pipewire",
            Api::AlsaRawUmp => "alsa_raw_ump",
            Api::AlsaSeqUmp => "alsa_seq_ump",
            Api::CoreMidiUmp => "coremidi_ump",
            Api::WindowsMidiServices => "windows_midi_services",
            Api::Network => "network",
            Api::NetworkUmp => "network_ump",
            Api::AndroidAmidi => "android_amidi",
            Api::Keyboard => "keyboard",
            Api::Kdmapi => "kdmapi",
            Api::JackUmp => "jack_ump",
            Api::PipeWireUmp => "pipewire_ump",
            Api::Dummy => "dummy",
        }
    }

    /// Human-readable name for UI purposes.
    pub fn display_name(&self) -> &'static str {
        match self {
            Api::CoreMidi => "CoreMIDI",
            Api::AlsaSeq => "ALSA (sequencer)",
            Api::AlsaRaw => "ALSA (raw)",
            Api::JackMidi => "JACK",
            Api::WindowsMm => "Windows Multimedia",
            Api::WindowsUwp => "Windows UWP",
            Api::WebMidi => "Web MIDI",
            Api::PipeWire => "PipeWire",
            Api::AlsaRawUmp => "ALSA (raw, UMP)",
            Api::AlsaSeqUmp => "ALSA (sequencer, UMP)",
            Api::CoreMidiUmp => "CoreMIDI (UMP)",
            Api::WindowsMidiServices => "Windows MIDI Services",
            Api::Network => "Network (OSC)",
            Api::NetworkUmp => "Network (OSC, UMP)",
            Api::AndroidAmidi => "Android AMidi",
            Api::Keyboard => "Computer keyboard",
            Api::Kdmapi => "KDMAPI",
            Api::JackUmp => "JACK (UMP)",
            Api::PipeWireUmp => "PipeWire (UMP)",
            Api::Dummy => "Dummy",
        }
    }

    /// Reverse of [`Api::name`].
    pub fn from_name(name: &str) -> Option<Api> {
        Api::all().iter().copied().find(|api| api.name() == name)
    }

    /// Whether a backend for this API is compiled into the library on the
    /// current platform.
    pub fn available(&self) -> bool {
        match self {
            Api::Network | Api::NetworkUmp | Api::Dummy => true,
            #[cfg(target_os = "linux")]
            Api::AlsaSeq | Api::AlsaRaw => true,
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            Api::CoreMidi => true,
            #[cfg(target_os = "windows")]
            Api::WindowsMm => true,
            #[cfg(target_arch = "wasm32")]
            Api::WebMidi => true,
            #[cfg(all(feature = "jack", not(target_os = "windows")))]
            Api::JackMidi => true,
            _ => false,
        }
    }

    pub fn all() -> &'static [Api] {
        &[
            Api::CoreMidi,
            Api::AlsaSeq,
            Api::AlsaRaw,
            Api::JackMidi,
            Api::WindowsMm,
            Api::WindowsUwp,
            Api::WebMidi,
            Api::PipeWire,
            Api::AlsaRawUmp,
            Api::AlsaSeqUmp,
            Api::CoreMidiUmp,
            Api::WindowsMidiServices,
            Api::Network,
            Api::NetworkUmp,
            Api::AndroidAmidi,
            Api::Keyboard,
            Api::Kdmapi,
            Api::JackUmp,
            Api::PipeWireUmp,
            Api::Dummy,
        ]
    }

    /// Byte-stream (MIDI 1) backends in the order default construction
    /// tries them. The dummy terminates the list and always succeeds.
    /// The network transport is not tried by default (it binds a socket)
    /// and must be requested explicitly.
    pub(crate) fn midi1_priority() -> &'static [Api] {
        &[
            Api::CoreMidi,
            Api::AlsaSeq,
            Api::AlsaRaw,
            Api::WindowsMm,
            Api::WebMidi,
            Api::JackMidi,
            Api::Dummy,
        ]
    }

    /// UMP backends in default construction order.
    pub(crate) fn ump_priority() -> &'static [Api] {
        &[Api::Dummy]
    }

    /// All APIs with a usable backend on this platform.
    pub fn available_apis() -> Vec<Api> {
        Api::all().iter().copied().filter(Api::available).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for api in Api::all() {
            assert_eq!(Api::from_name(api.name()), Some(*api));
        }
    }

    #[test]
    fn machine_names_are_snake_case() {
        for api in Api::all() {
            assert!(api
                .name()
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        }
    }

    #[test]
    fn dummy_is_always_available() {
        assert!(Api::Dummy.available());
        assert!(Api::available_apis().contains(&Api::Dummy));
    }
}
