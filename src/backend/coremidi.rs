//! CoreMIDI backend (macOS and iOS). One CoreMIDI client per
//! connection; input arrives as packet lists on a CoreMIDI-owned thread
//! and is pushed through the stream decoder; virtual endpoints are
//! fully supported.

use std::sync::{Arc, Mutex};

use coremidi::{
    Client, Destination, Destinations, InputPort, OutputPort as CmOutputPort, PacketBuffer,
    Source, Sources, VirtualDestination, VirtualSource,
};

use crate::api::Api;
use crate::backend::{InputBackend, ObserverBackend, OutputBackend};
use crate::config::{CoreMidiConfig, InputCallback, InputConfig, ObserverConfig, OutputConfig};
use crate::decoder::MidiStreamDecoder;
use crate::errors::{Error, ErrorCategory, ErrorDomain};
use crate::port::{InputPort as Port, OutputPort, PortInfo, TransportKind};
use crate::timestamp::TimestampInfo;

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: false };

fn os_err(status: i32, context: &'static str) -> Error {
    Error::with_code(ErrorCategory::Io, ErrorDomain::CoreMidi, status, context)
}

mod host_time {
    //! Mach host time arrives in timebase ticks; scale it to nanoseconds
    //! once with the constant ratio the kernel reports.

    #[repr(C)]
    struct TimebaseInfo {
        numer: u32,
        denom: u32,
    }

    extern "C" {
        fn mach_timebase_info(info: *mut TimebaseInfo) -> i32;
    }

    pub fn to_nanos(host_time: u64) -> i64 {
        use std::sync::OnceLock;
        static RATIO: OnceLock<(u64, u64)> = OnceLock::new();
        let (numer, denom) = *RATIO.get_or_init(|| {
            let mut info = TimebaseInfo { numer: 1, denom: 1 };
            unsafe { mach_timebase_info(&mut info) };
            (info.numer.max(1) as u64, info.denom.max(1) as u64)
        });
        (host_time as u128 * numer as u128 / denom as u128) as i64
    }
}

fn source_port_info(source: &Source, index: usize) -> PortInfo {
    let name = source.name().unwrap_or_default();
    let display_name = source.display_name().unwrap_or_else(|| name.clone());
    PortInfo {
        api: Some(Api::CoreMidi),
        client: 0,
        port: source.unique_id().unwrap_or(index as u32) as u64,
        manufacturer: String::new(),
        device_name: String::new(),
        port_name: name,
        display_name,
        kind: TransportKind::Unknown,
    }
}

fn destination_port_info(destination: &Destination, index: usize) -> PortInfo {
    let name = destination.name().unwrap_or_default();
    let display_name = destination.display_name().unwrap_or_else(|| name.clone());
    PortInfo {
        api: Some(Api::CoreMidi),
        client: 0,
        port: destination.unique_id().unwrap_or(index as u32) as u64,
        manufacturer: String::new(),
        device_name: String::new(),
        port_name: name,
        display_name,
        kind: TransportKind::Unknown,
    }
}

fn find_source(handle: u64) -> Option<Source> {
    Sources
        .into_iter()
        .find(|s| s.unique_id().map(|id| id as u64 == handle).unwrap_or(false))
}

fn find_destination(handle: u64) -> Option<Destination> {
    Destinations
        .into_iter()
        .find(|d| d.unique_id().map(|id| id as u64 == handle).unwrap_or(false))
}

enum InputEndpoint {
    Connected { port: InputPort, source: Source },
    Virtual(#[allow(dead_code)] VirtualDestination),
}

pub struct CoreMidiInput {
    client: Client,
    // Shared with the CoreMIDI dispatch thread; close drops the
    // endpoint first so the lock is uncontended afterwards.
    decoder: Arc<Mutex<MidiStreamDecoder>>,
    endpoint: Option<InputEndpoint>,
}

impl CoreMidiInput {
    pub fn new(config: InputConfig, api: CoreMidiConfig) -> Result<CoreMidiInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("coremidi: the packet-list transport speaks MIDI 1"),
                config,
            ));
        }
        let client = match Client::new(&api.client_name) {
            Ok(c) => c,
            Err(status) => return Err((os_err(status, "coremidi: cannot create client"), config)),
        };
        let InputConfig { callback, get_timestamp, on_error: _, on_warning: _, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder = Arc::new(Mutex::new(MidiStreamDecoder::new(
            cb,
            ignore,
            timestamps,
            get_timestamp,
            TIMESTAMPS,
        )));
        Ok(CoreMidiInput { client, decoder, endpoint: None })
    }

    fn packet_handler(
        decoder: Arc<Mutex<MidiStreamDecoder>>,
    ) -> impl FnMut(&coremidi::PacketList) + Send + 'static {
        move |packet_list| {
            let mut decoder = match decoder.lock() {
                Ok(d) => d,
                Err(_) => return,
            };
            for packet in packet_list.iter() {
                let ts = host_time::to_nanos(packet.timestamp());
                decoder.add_bytes(packet.data(), Some(ts), 0);
            }
        }
    }
}

impl InputBackend for CoreMidiInput {
    fn api(&self) -> Api {
        Api::CoreMidi
    }

    fn open_port(&mut self, port: &Port, local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::CoreMidi) {
            return Err(Error::invalid_argument("coremidi: port belongs to another API"));
        }
        let source = find_source(port.port)
            .ok_or_else(|| Error::address_not_available("coremidi: source endpoint is gone"))?;
        let input_port = self
            .client
            .input_port(local_name, Self::packet_handler(self.decoder.clone()))
            .map_err(|status| os_err(status, "coremidi: cannot create input port"))?;
        input_port
            .connect_source(&source)
            .map_err(|status| os_err(status, "coremidi: cannot connect source"))?;
        self.endpoint = Some(InputEndpoint::Connected { port: input_port, source });
        Ok(())
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        let destination = self
            .client
            .virtual_destination(name, Self::packet_handler(self.decoder.clone()))
            .map_err(|status| os_err(status, "coremidi: cannot create virtual destination"))?;
        self.endpoint = Some(InputEndpoint::Virtual(destination));
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let Some(InputEndpoint::Connected { port, source }) = &self.endpoint {
            let _ = port.disconnect_source(source);
        }
        // Dropping the endpoint disposes the CoreMIDI port; CoreMIDI
        // guarantees no callback runs past disposal.
        self.endpoint = None;
        Ok(())
    }
}

enum OutputEndpoint {
    Connected { port: CmOutputPort, destination: Destination },
    Virtual(VirtualSource),
}

pub struct CoreMidiOutput {
    client: Client,
    endpoint: Option<OutputEndpoint>,
}

impl CoreMidiOutput {
    pub fn new(config: OutputConfig, api: CoreMidiConfig) -> Result<CoreMidiOutput, (Error, OutputConfig)> {
        let client = match Client::new(&api.client_name) {
            Ok(c) => c,
            Err(status) => return Err((os_err(status, "coremidi: cannot create client"), config)),
        };
        Ok(CoreMidiOutput { client, endpoint: None })
    }
}

impl OutputBackend for CoreMidiOutput {
    fn api(&self) -> Api {
        Api::CoreMidi
    }

    fn open_port(&mut self, port: &OutputPort, local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::CoreMidi) {
            return Err(Error::invalid_argument("coremidi: port belongs to another API"));
        }
        let destination = find_destination(port.port)
            .ok_or_else(|| Error::address_not_available("coremidi: destination endpoint is gone"))?;
        let out_port = self
            .client
            .output_port(local_name)
            .map_err(|status| os_err(status, "coremidi: cannot create output port"))?;
        self.endpoint = Some(OutputEndpoint::Connected { port: out_port, destination });
        Ok(())
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        let source = self
            .client
            .virtual_source(name)
            .map_err(|status| os_err(status, "coremidi: cannot create virtual source"))?;
        self.endpoint = Some(OutputEndpoint::Virtual(source));
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        self.endpoint = None;
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let buffer = PacketBuffer::new(0, message);
        match &self.endpoint {
            Some(OutputEndpoint::Connected { port, destination }) => port
                .send(destination, &buffer)
                .map_err(|status| os_err(status, "coremidi: send failed")),
            Some(OutputEndpoint::Virtual(source)) => source
                .received(&buffer)
                .map_err(|status| os_err(status, "coremidi: send failed")),
            None => Err(Error::not_connected("coremidi: no open port")),
        }
    }
}

pub struct CoreMidiObserver {
    #[allow(dead_code)]
    client: Client,
}

impl CoreMidiObserver {
    pub fn new(
        config: ObserverConfig,
        api: CoreMidiConfig,
    ) -> Result<CoreMidiObserver, (Error, ObserverConfig)> {
        match Client::new(&api.client_name) {
            Ok(client) => Ok(CoreMidiObserver { client }),
            Err(status) => Err((os_err(status, "coremidi: cannot create client"), config)),
        }
    }
}

impl ObserverBackend for CoreMidiObserver {
    fn api(&self) -> Api {
        Api::CoreMidi
    }

    fn input_ports(&self) -> Vec<Port> {
        Sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| Port(source_port_info(&source, index)))
            .collect()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        Destinations
            .into_iter()
            .enumerate()
            .map(|(index, destination)| OutputPort(destination_port_info(&destination, index)))
            .collect()
    }
}
