use std::fmt;
use std::fmt::{Debug, Formatter};

use crate::api::Api;
use crate::backend::{self, InputBackend, ObserverBackend, OutputBackend};
use crate::config::{ApiConfig, InputConfig, ObserverConfig, OutputConfig};
use crate::errors::Error;
use crate::port::{InputPort, OutputPort};
use crate::timestamp::Timestamp;

/// Connection state shared by inputs and outputs. The facade owns the
/// state machine so every backend gets identical open/close semantics:
///
/// ```text
/// client-open --open_port--> port-open (connected)
///      |                          |
///      +--open_virtual_port--> port-open (not connected)
///      ^                          |
///      +--------close_port--------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortState {
    open: bool,
    connected: bool,
}

impl PortState {
    const CLOSED: PortState = PortState { open: false, connected: false };

    fn check_can_open(&self) -> Result<(), Error> {
        if self.open {
            Err(Error::invalid_argument("a port is already open on this connection"))
        } else {
            Ok(())
        }
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.open {
            Ok(())
        } else {
            Err(Error::not_connected("no port is open on this connection"))
        }
    }
}

/// A realtime MIDI input connection.
///
/// Construction initializes the backend client; [`MidiIn::open_port`]
/// or [`MidiIn::open_virtual_port`] then starts message delivery to the
/// callback given in the [`InputConfig`]. The callback runs on whatever
/// thread the backend uses for I/O and must therefore be `Send`;
/// closing the port (or dropping the connection) stops and joins that
/// thread before returning.
pub struct MidiIn {
    imp: Box<dyn InputBackend>,
    state: PortState,
}

impl MidiIn {
    /// Opens a client on the first available backend for the protocol
    /// selected by the configuration's callback flavor.
    pub fn new(config: InputConfig) -> Result<MidiIn, Error> {
        Ok(MidiIn { imp: backend::default_input(config)?, state: PortState::CLOSED })
    }

    /// Opens a client on the specific backend selected by `api_config`.
    pub fn with_api(config: InputConfig, api_config: ApiConfig) -> Result<MidiIn, Error> {
        let imp = backend::input_with_config(config, api_config).map_err(|(e, _)| e)?;
        Ok(MidiIn { imp, state: PortState::CLOSED })
    }

    /// The API of the backend actually in use.
    pub fn current_api(&self) -> Api {
        self.imp.api()
    }

    /// Connects to `port` and starts delivering its messages.
    /// `local_name` names our end of the connection where the transport
    /// has such a notion.
    pub fn open_port(&mut self, port: &InputPort, local_name: &str) -> Result<(), Error> {
        self.state.check_can_open()?;
        self.imp.open_port(port, local_name)?;
        self.state = PortState { open: true, connected: true };
        Ok(())
    }

    /// Creates a virtual endpoint other applications can connect to.
    /// Fails with operation-not-supported on transports without that
    /// notion (e.g. Windows MM).
    pub fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.state.check_can_open()?;
        self.imp.open_virtual_port(name)?;
        self.state = PortState { open: true, connected: false };
        Ok(())
    }

    /// Stops delivery and returns to the client-open state. The backend
    /// joins its I/O thread before this returns.
    pub fn close_port(&mut self) -> Result<(), Error> {
        self.state.check_open()?;
        let result = self.imp.close_port();
        self.state = PortState::CLOSED;
        result
    }

    /// Renames the open port. May fail with operation-not-supported.
    pub fn set_port_name(&mut self, name: &str) -> Result<(), Error> {
        self.state.check_open()?;
        self.imp.set_port_name(name)
    }

    pub fn is_port_open(&self) -> bool {
        self.state.open
    }

    /// True for connections made with [`MidiIn::open_port`]; never true
    /// for virtual ports.
    pub fn is_port_connected(&self) -> bool {
        self.state.connected
    }

    /// Current value of the clock used for `Absolute` timestamps, for
    /// correlating message timestamps with the caller's own clock.
    pub fn absolute_timestamp(&self) -> Timestamp {
        self.imp.absolute_timestamp()
    }
}

impl Debug for MidiIn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiIn")
            .field("api", &self.imp.api())
            .field("port_open", &self.state.open)
            .field("connected", &self.state.connected)
            .finish()
    }
}

/// A realtime MIDI output connection.
pub struct MidiOut {
    imp: Box<dyn OutputBackend>,
    state: PortState,
}

impl MidiOut {
    /// Opens a client on the first available backend.
    pub fn new(config: OutputConfig) -> Result<MidiOut, Error> {
        Ok(MidiOut { imp: backend::default_output(config)?, state: PortState::CLOSED })
    }

    pub fn with_api(config: OutputConfig, api_config: ApiConfig) -> Result<MidiOut, Error> {
        let imp = backend::output_with_config(config, api_config).map_err(|(e, _)| e)?;
        Ok(MidiOut { imp, state: PortState::CLOSED })
    }

    pub fn current_api(&self) -> Api {
        self.imp.api()
    }

    pub fn open_port(&mut self, port: &OutputPort, local_name: &str) -> Result<(), Error> {
        self.state.check_can_open()?;
        self.imp.open_port(port, local_name)?;
        self.state = PortState { open: true, connected: true };
        Ok(())
    }

    pub fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.state.check_can_open()?;
        self.imp.open_virtual_port(name)?;
        self.state = PortState { open: true, connected: false };
        Ok(())
    }

    pub fn close_port(&mut self) -> Result<(), Error> {
        self.state.check_open()?;
        let result = self.imp.close_port();
        self.state = PortState::CLOSED;
        result
    }

    pub fn set_port_name(&mut self, name: &str) -> Result<(), Error> {
        self.state.check_open()?;
        self.imp.set_port_name(name)
    }

    pub fn is_port_open(&self) -> bool {
        self.state.open
    }

    pub fn is_port_connected(&self) -> bool {
        self.state.connected
    }

    /// Sends one complete MIDI 1.0 message immediately. Each message is
    /// written atomically with respect to concurrent senders.
    pub fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        self.state.check_open()?;
        if message.is_empty() {
            return Err(Error::invalid_argument("message must not be empty"));
        }
        self.imp.send_message(message)
    }

    /// Sends one or more whole UMP packets immediately.
    pub fn send_ump(&mut self, words: &[u32]) -> Result<(), Error> {
        self.state.check_open()?;
        if words.is_empty() {
            return Err(Error::invalid_argument("packet must not be empty"));
        }
        self.imp.send_ump(words)
    }

    /// Asks the backend to emit the message at `timestamp`; supported
    /// only where the transport has timed output.
    pub fn schedule_message(&mut self, timestamp: Timestamp, message: &[u8]) -> Result<(), Error> {
        self.state.check_open()?;
        if message.is_empty() {
            return Err(Error::invalid_argument("message must not be empty"));
        }
        self.imp.schedule_message(timestamp, message)
    }

    pub fn schedule_ump(&mut self, timestamp: Timestamp, words: &[u32]) -> Result<(), Error> {
        self.state.check_open()?;
        if words.is_empty() {
            return Err(Error::invalid_argument("packet must not be empty"));
        }
        self.imp.schedule_ump(timestamp, words)
    }
}

impl Debug for MidiOut {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiOut")
            .field("api", &self.imp.api())
            .field("port_open", &self.state.open)
            .field("connected", &self.state.connected)
            .finish()
    }
}

/// Enumerates MIDI endpoints and reports their arrival and departure
/// through the callbacks of the [`ObserverConfig`].
pub struct Observer {
    imp: Box<dyn ObserverBackend>,
}

impl Observer {
    pub fn new(config: ObserverConfig) -> Result<Observer, Error> {
        Ok(Observer { imp: backend::default_observer(config)? })
    }

    pub fn with_api(config: ObserverConfig, api_config: ApiConfig) -> Result<Observer, Error> {
        let imp = backend::observer_with_config(config, api_config).map_err(|(e, _)| e)?;
        Ok(Observer { imp })
    }

    pub fn current_api(&self) -> Api {
        self.imp.api()
    }

    /// Snapshot of the ports messages can currently be received from.
    pub fn get_input_ports(&self) -> Vec<InputPort> {
        self.imp.input_ports()
    }

    /// Snapshot of the ports messages can currently be sent to.
    pub fn get_output_ports(&self) -> Vec<OutputPort> {
        self.imp.output_ports()
    }
}

impl Debug for Observer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer").field("api", &self.imp.api()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    fn dummy_in() -> MidiIn {
        MidiIn::with_api(InputConfig::new(|_| {}), ApiConfig::Dummy).unwrap()
    }

    fn dummy_out() -> MidiOut {
        MidiOut::with_api(OutputConfig::new(), ApiConfig::Dummy).unwrap()
    }

    #[test]
    #[cfg(not(target_arch = "wasm32"))]
    fn facades_are_send() {
        // The threading story on wasm is different; everywhere else the
        // facades must be movable across threads.
        fn is_send<T: Send>() {}
        is_send::<MidiIn>();
        is_send::<MidiOut>();
        is_send::<Observer>();
    }

    #[test]
    fn default_construction_always_finds_a_backend() {
        let input = MidiIn::new(InputConfig::new(|_| {})).unwrap();
        assert!(input.current_api().available());
        let output = MidiOut::new(OutputConfig::new()).unwrap();
        assert!(output.current_api().available());
    }

    #[test]
    fn open_twice_is_refused() {
        let mut input = dummy_in();
        input.open_virtual_port("one").unwrap();
        let err = input.open_virtual_port("two").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidArgument);
        assert!(input.is_port_open());
    }

    #[test]
    fn send_requires_an_open_port() {
        let mut output = dummy_out();
        let err = output.send_message(&[0x91, 0x3C, 0x64]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotConnected);
        output.open_virtual_port("v").unwrap();
        output.send_message(&[0x91, 0x3C, 0x64]).unwrap();
    }

    #[test]
    fn close_returns_to_client_open() {
        let mut output = dummy_out();
        output.open_virtual_port("v").unwrap();
        output.close_port().unwrap();
        assert!(!output.is_port_open());
        let err = output.close_port().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::NotConnected);
        output.open_virtual_port("again").unwrap();
        assert!(output.is_port_open());
    }

    #[test]
    fn virtual_ports_are_not_connected() {
        let mut input = dummy_in();
        input.open_virtual_port("v").unwrap();
        assert!(input.is_port_open());
        assert!(!input.is_port_connected());
    }

    #[test]
    fn empty_sends_are_invalid() {
        let mut output = dummy_out();
        output.open_virtual_port("v").unwrap();
        assert_eq!(
            output.send_message(&[]).unwrap_err().category(),
            ErrorCategory::InvalidArgument
        );
        assert_eq!(output.send_ump(&[]).unwrap_err().category(), ErrorCategory::InvalidArgument);
    }

    #[test]
    fn observer_over_dummy_is_empty() {
        let observer = Observer::with_api(ObserverConfig::new(), ApiConfig::Dummy).unwrap();
        assert_eq!(observer.current_api(), Api::Dummy);
        assert!(observer.get_input_ports().is_empty());
        assert!(observer.get_output_ports().is_empty());
    }

    #[test]
    fn unavailable_api_reports_operation_not_supported() {
        let err =
            MidiIn::with_api(InputConfig::new(|_| {}), ApiConfig::Api(Api::Kdmapi)).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::OperationNotSupported);
    }
}
