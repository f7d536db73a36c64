//! Backend contract and dispatch.
//!
//! Each transport lives in its own module and provides up to three
//! concrete types (input, output, observer) implementing the traits
//! below. Dispatch is a plain match over [`Api`]/[`ApiConfig`]; default
//! construction walks the platform priority list until a backend's
//! client initializes.

use crate::api::Api;
use crate::config::{ApiConfig, ErrorCallback, InputConfig, ObserverConfig, OutputConfig, WarningCallback};
use crate::errors::Error;
use crate::port::{InputPort, OutputPort};
use crate::timestamp::{monotonic_ns, Timestamp};

mod dummy;
mod net;

#[cfg(target_os = "linux")]
mod alsa_seq;
#[cfg(target_os = "linux")]
mod alsa_raw;

#[cfg(all(feature = "jack", not(target_os = "windows")))]
mod jack;

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod coremidi;

#[cfg(target_os = "windows")]
mod winmm;

#[cfg(target_arch = "wasm32")]
mod webmidi;

#[cfg(target_os = "linux")]
pub use self::alsa_seq::SharedSeqContext;

/// Backends hop threads everywhere except on wasm, where the runtime is
/// single-threaded and the browser types are not `Send`.
#[cfg(not(target_arch = "wasm32"))]
pub(crate) trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send> MaybeSend for T {}
#[cfg(target_arch = "wasm32")]
pub(crate) trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T> MaybeSend for T {}

/// A backend's receiving half. Implementations decode the transport's
/// native deliveries through the input state machine and invoke the
/// user callback from whatever thread the transport dictates.
pub(crate) trait InputBackend: MaybeSend {
    fn api(&self) -> Api;

    fn open_port(&mut self, port: &InputPort, local_name: &str) -> Result<(), Error>;

    fn open_virtual_port(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend has no virtual ports"))
    }

    fn close_port(&mut self) -> Result<(), Error>;

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend cannot rename ports"))
    }

    /// Current value of the clock the backend timestamps input with, for
    /// correlating delivered timestamps with the caller's own reads.
    fn absolute_timestamp(&self) -> Timestamp {
        monotonic_ns()
    }
}

/// A backend's sending half.
pub(crate) trait OutputBackend: MaybeSend {
    fn api(&self) -> Api;

    fn open_port(&mut self, port: &OutputPort, local_name: &str) -> Result<(), Error>;

    fn open_virtual_port(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend has no virtual ports"))
    }

    fn close_port(&mut self) -> Result<(), Error>;

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend cannot rename ports"))
    }

    fn send_message(&mut self, _message: &[u8]) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend does not carry MIDI 1 byte messages"))
    }

    fn send_ump(&mut self, _words: &[u32]) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend does not carry UMP packets"))
    }

    fn schedule_message(&mut self, _timestamp: Timestamp, _message: &[u8]) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend cannot schedule output"))
    }

    fn schedule_ump(&mut self, _timestamp: Timestamp, _words: &[u32]) -> Result<(), Error> {
        Err(Error::operation_not_supported("this backend cannot schedule output"))
    }
}

/// Endpoint enumeration and hotplug.
pub(crate) trait ObserverBackend: MaybeSend {
    fn api(&self) -> Api;
    fn input_ports(&self) -> Vec<InputPort>;
    fn output_ports(&self) -> Vec<OutputPort>;
}

/// Routes an error to the configured callback, or to the log when none
/// was supplied. The error is still returned as a value by the caller.
pub(crate) fn report_error(callback: &mut Option<ErrorCallback>, err: &Error) {
    match callback {
        Some(f) => f(err),
        None => log::error!("{}", err),
    }
}

pub(crate) fn report_warning(callback: &mut Option<WarningCallback>, message: &str) {
    match callback {
        Some(f) => f(message),
        None => log::warn!("{}", message),
    }
}

/// On failure, constructors hand the (callback-carrying) configuration
/// back so the next backend in the priority list can be tried.
pub(crate) type InputResult = Result<Box<dyn InputBackend>, (Error, InputConfig)>;
pub(crate) type OutputResult = Result<Box<dyn OutputBackend>, (Error, OutputConfig)>;
pub(crate) type ObserverResult = Result<Box<dyn ObserverBackend>, (Error, ObserverConfig)>;

fn unavailable_input(config: InputConfig) -> InputResult {
    Err((Error::operation_not_supported("no backend compiled for this API"), config))
}

fn unavailable_output(config: OutputConfig) -> OutputResult {
    Err((Error::operation_not_supported("no backend compiled for this API"), config))
}

fn unavailable_observer(config: ObserverConfig) -> ObserverResult {
    Err((Error::operation_not_supported("no backend compiled for this API"), config))
}

pub(crate) fn input_for_api(api: Api, config: InputConfig) -> InputResult {
    match api {
        Api::Dummy => dummy::DummyInput::new(config).map(|b| Box::new(b) as _),
        Api::Network => net::NetInput::new(config, Default::default()).map(|b| Box::new(b) as _),
        Api::NetworkUmp => {
            net::NetUmpInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        Api::AlsaSeq => {
            alsa_seq::AlsaSeqInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        Api::AlsaRaw => {
            alsa_raw::AlsaRawInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(all(feature = "jack", not(target_os = "windows")))]
        Api::JackMidi => {
            jack::JackInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        Api::CoreMidi => {
            coremidi::CoreMidiInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "windows")]
        Api::WindowsMm => {
            winmm::WinMmInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_arch = "wasm32")]
        Api::WebMidi => {
            webmidi::WebMidiInput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        _ => unavailable_input(config),
    }
}

pub(crate) fn input_with_config(config: InputConfig, api_config: ApiConfig) -> InputResult {
    match api_config {
        ApiConfig::Api(api) => input_for_api(api, config),
        ApiConfig::Dummy => dummy::DummyInput::new(config).map(|b| Box::new(b) as _),
        ApiConfig::Network(net) => net::NetInput::new(config, net).map(|b| Box::new(b) as _),
        ApiConfig::NetworkUmp(net) => {
            net::NetUmpInput::new(config, net).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        ApiConfig::AlsaSeq(c) => alsa_seq::AlsaSeqInput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(target_os = "linux")]
        ApiConfig::AlsaRaw(c) => alsa_raw::AlsaRawInput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(all(feature = "jack", not(target_os = "windows")))]
        ApiConfig::Jack(c) => jack::JackInput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        ApiConfig::CoreMidi(c) => {
            coremidi::CoreMidiInput::new(config, c).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "windows")]
        ApiConfig::WinMm(c) => winmm::WinMmInput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(target_arch = "wasm32")]
        ApiConfig::WebMidi(c) => webmidi::WebMidiInput::new(config, c).map(|b| Box::new(b) as _),
        _ => unavailable_input(config),
    }
}

pub(crate) fn output_for_api(api: Api, config: OutputConfig) -> OutputResult {
    match api {
        Api::Dummy => dummy::DummyOutput::new(config).map(|b| Box::new(b) as _),
        Api::Network => net::NetOutput::new(config, Default::default()).map(|b| Box::new(b) as _),
        Api::NetworkUmp => {
            net::NetUmpOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        Api::AlsaSeq => {
            alsa_seq::AlsaSeqOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        Api::AlsaRaw => {
            alsa_raw::AlsaRawOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(all(feature = "jack", not(target_os = "windows")))]
        Api::JackMidi => {
            jack::JackOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        Api::CoreMidi => {
            coremidi::CoreMidiOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "windows")]
        Api::WindowsMm => {
            winmm::WinMmOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_arch = "wasm32")]
        Api::WebMidi => {
            webmidi::WebMidiOutput::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        _ => unavailable_output(config),
    }
}

pub(crate) fn output_with_config(config: OutputConfig, api_config: ApiConfig) -> OutputResult {
    match api_config {
        ApiConfig::Api(api) => output_for_api(api, config),
        ApiConfig::Dummy => dummy::DummyOutput::new(config).map(|b| Box::new(b) as _),
        ApiConfig::Network(net) => net::NetOutput::new(config, net).map(|b| Box::new(b) as _),
        ApiConfig::NetworkUmp(net) => {
            net::NetUmpOutput::new(config, net).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        ApiConfig::AlsaSeq(c) => alsa_seq::AlsaSeqOutput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(target_os = "linux")]
        ApiConfig::AlsaRaw(c) => alsa_raw::AlsaRawOutput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(all(feature = "jack", not(target_os = "windows")))]
        ApiConfig::Jack(c) => jack::JackOutput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        ApiConfig::CoreMidi(c) => {
            coremidi::CoreMidiOutput::new(config, c).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "windows")]
        ApiConfig::WinMm(c) => winmm::WinMmOutput::new(config, c).map(|b| Box::new(b) as _),
        #[cfg(target_arch = "wasm32")]
        ApiConfig::WebMidi(c) => webmidi::WebMidiOutput::new(config, c).map(|b| Box::new(b) as _),
        _ => unavailable_output(config),
    }
}

pub(crate) fn observer_for_api(api: Api, config: ObserverConfig) -> ObserverResult {
    match api {
        Api::Dummy => dummy::DummyObserver::new(config).map(|b| Box::new(b) as _),
        Api::Network | Api::NetworkUmp => {
            net::NetObserver::new(config, api).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        Api::AlsaSeq => {
            alsa_seq::AlsaSeqObserver::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "linux")]
        Api::AlsaRaw => {
            alsa_raw::AlsaRawObserver::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(all(feature = "jack", not(target_os = "windows")))]
        Api::JackMidi => {
            jack::JackObserver::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        Api::CoreMidi => {
            coremidi::CoreMidiObserver::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_os = "windows")]
        Api::WindowsMm => {
            winmm::WinMmObserver::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        #[cfg(target_arch = "wasm32")]
        Api::WebMidi => {
            webmidi::WebMidiObserver::new(config, Default::default()).map(|b| Box::new(b) as _)
        }
        _ => unavailable_observer(config),
    }
}

pub(crate) fn observer_with_config(config: ObserverConfig, api_config: ApiConfig) -> ObserverResult {
    match api_config {
        ApiConfig::Api(api) => observer_for_api(api, config),
        other => observer_for_api(other.api(), config),
    }
}

/// Walks the priority list for the callback's protocol and returns the
/// first backend whose client comes up.
pub(crate) fn default_input(mut config: InputConfig) -> Result<Box<dyn InputBackend>, Error> {
    let priority = if config.callback.is_ump() {
        Api::ump_priority()
    } else {
        Api::midi1_priority()
    };
    let mut last_error = None;
    for api in priority.iter().filter(|api| api.available()) {
        match input_for_api(*api, config) {
            Ok(backend) => return Ok(backend),
            Err((err, returned)) => {
                log::debug!("input backend {} unavailable: {}", api.name(), err);
                last_error = Some(err);
                config = returned;
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::operation_not_supported("no input backend available")))
}

pub(crate) fn default_output(mut config: OutputConfig) -> Result<Box<dyn OutputBackend>, Error> {
    let mut last_error = None;
    for api in Api::midi1_priority().iter().filter(|api| api.available()) {
        match output_for_api(*api, config) {
            Ok(backend) => return Ok(backend),
            Err((err, returned)) => {
                log::debug!("output backend {} unavailable: {}", api.name(), err);
                last_error = Some(err);
                config = returned;
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::operation_not_supported("no output backend available")))
}

pub(crate) fn default_observer(mut config: ObserverConfig) -> Result<Box<dyn ObserverBackend>, Error> {
    let mut last_error = None;
    for api in Api::midi1_priority().iter().filter(|api| api.available()) {
        match observer_for_api(*api, config) {
            Ok(backend) => return Ok(backend),
            Err((err, returned)) => {
                log::debug!("observer backend {} unavailable: {}", api.name(), err);
                last_error = Some(err);
                config = returned;
            }
        }
    }
    Err(last_error.unwrap_or_else(|| Error::operation_not_supported("no observer backend available")))
}
