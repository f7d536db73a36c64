//! Network transport: MIDI over OSC-formatted UDP datagrams.
//!
//! A MIDI 1 stream travels as OSC messages whose address pattern is the
//! local port name and whose arguments are `m` (4-byte MIDI payload:
//! port byte + up to three MIDI bytes). The UMP flavor uses `M`
//! arguments, one per packet, with the words serialized big-endian.
//! OSC bundles are recognized but refused; bundle timetags are not
//! interpreted as scheduling hints.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::api::Api;
use crate::backend::{report_warning, InputBackend, ObserverBackend, OutputBackend};
use crate::config::{
    ErrorCallback, InputCallback, InputConfig, NetConfig, ObserverConfig, OutputConfig,
    WarningCallback,
};
use crate::decoder::{MidiStreamDecoder, UmpStreamDecoder};
use crate::errors::Error;
use crate::message::{fixed_message_length, Ump};
use crate::port::{InputPort, OutputPort};
use crate::timestamp::TimestampInfo;

/// Largest UDP payload we will emit or accept.
const MAX_DATAGRAM: usize = 65507;
/// Poll granularity of the receive loop; close joins within this bound.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: false, absolute_is_monotonic: false, has_samples: false };

// --- OSC codec -----------------------------------------------------------

fn padded_len(unpadded: usize) -> usize {
    // OSC strings carry at least one NUL and are padded to four bytes.
    (unpadded + 4) & !3
}

/// Validates the packet frame and returns (argument count, argument
/// bytes) when the address matches `address` and all typetags equal
/// `typetag`.
fn parse_header<'a>(data: &'a [u8], address: &str, typetag: u8) -> Result<(usize, &'a [u8]), Error> {
    match data.first() {
        None => return Err(Error::bad_message("osc: empty datagram")),
        Some(b'#') => {
            return Err(Error::operation_not_supported("osc: bundles are not supported"))
        }
        Some(b'/') => {}
        Some(_) => return Err(Error::bad_message("osc: not an osc message")),
    }
    let addr_len = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::bad_message("osc: unterminated address"))?;
    if &data[..addr_len] != address.as_bytes() {
        return Err(Error::address_not_available("osc: datagram for another port"));
    }
    let tags_at = padded_len(addr_len);
    if tags_at >= data.len() || data[tags_at] != b',' {
        return Err(Error::bad_message("osc: missing typetags"));
    }
    let tags = &data[tags_at + 1..];
    let tags_len = tags
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::bad_message("osc: unterminated typetags"))?;
    let tags = &tags[..tags_len];
    if tags.iter().any(|&t| t != typetag) {
        return Err(Error::bad_message("osc: unexpected argument type"));
    }
    let args_at = tags_at + padded_len(1 + tags_len);
    if args_at > data.len() {
        return Err(Error::bad_message("osc: truncated packet"));
    }
    Ok((tags_len, &data[args_at..]))
}

/// Extracts every `m`-tagged MIDI 1 payload, handing the significant
/// bytes of each (length derived from the status byte) to `on_message`.
fn parse_packet_midi1(
    data: &[u8],
    address: &str,
    mut on_message: impl FnMut(&[u8]),
) -> Result<(), Error> {
    let (count, args) = parse_header(data, address, b'm')?;
    if args.len() != count * 4 {
        return Err(Error::bad_message("osc: midi argument size mismatch"));
    }
    for group in args.chunks_exact(4) {
        // group[0] is the OSC "port id" byte, unused here.
        let bytes = &group[1..4];
        let len = fixed_message_length(bytes[0]).unwrap_or(3).min(3);
        on_message(&bytes[..len]);
    }
    Ok(())
}

/// Extracts every `M`-tagged UMP argument as a whole packet.
fn parse_packet_ump(
    data: &[u8],
    address: &str,
    mut on_packet: impl FnMut(&[u32]),
) -> Result<(), Error> {
    let (count, args) = parse_header(data, address, b'M')?;
    if args.len() % 4 != 0 {
        return Err(Error::bad_message("osc: unaligned ump payload"));
    }
    let words: Vec<u32> = args
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let mut consumed = 0;
    let mut accounted = 0;
    while consumed < words.len() && accounted < count {
        let n = Ump::word_count(words[consumed]);
        if consumed + n > words.len() {
            return Err(Error::bad_message("osc: truncated ump packet"));
        }
        on_packet(&words[consumed..consumed + n]);
        consumed += n;
        accounted += 1;
    }
    if accounted != count {
        return Err(Error::bad_message("osc: ump argument count mismatch"));
    }
    Ok(())
}

fn push_padded_string(out: &mut Vec<u8>, s: &[u8]) {
    out.extend_from_slice(s);
    let pad = padded_len(s.len()) - s.len();
    out.extend(std::iter::repeat(0).take(pad));
}

fn build_header(address: &str, typetag: u8, count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(padded_len(address.len()) + padded_len(1 + count));
    push_padded_string(&mut out, address.as_bytes());
    let mut tags = Vec::with_capacity(1 + count);
    tags.push(b',');
    tags.extend(std::iter::repeat(typetag).take(count));
    push_padded_string(&mut out, &tags);
    out
}

fn build_packet_midi1(address: &str, message: &[u8]) -> Result<Vec<u8>, Error> {
    if message.is_empty() {
        return Err(Error::invalid_argument("osc: empty message"));
    }
    if message.len() > 3 {
        // The `m` typetag carries at most three MIDI bytes; SysEx needs
        // the UMP flavor of this transport.
        return Err(Error::message_size("osc: message does not fit a midi argument"));
    }
    let mut out = build_header(address, b'm', 1);
    let mut group = [0u8; 4];
    group[1..1 + message.len()].copy_from_slice(message);
    out.extend_from_slice(&group);
    if out.len() > MAX_DATAGRAM {
        return Err(Error::message_size("osc: datagram too large"));
    }
    Ok(out)
}

fn build_packet_ump(address: &str, words: &[u32]) -> Result<Vec<u8>, Error> {
    let mut count = 0;
    let mut i = 0;
    while i < words.len() {
        let n = Ump::word_count(words[i]);
        if i + n > words.len() {
            return Err(Error::bad_message("osc: truncated ump packet"));
        }
        i += n;
        count += 1;
    }
    if count == 0 {
        return Err(Error::invalid_argument("osc: empty packet"));
    }
    let mut out = build_header(address, b'M', count);
    for word in words {
        out.extend_from_slice(&word.to_be_bytes());
    }
    if out.len() > MAX_DATAGRAM {
        return Err(Error::message_size("osc: datagram too large"));
    }
    Ok(out)
}

// --- Input ---------------------------------------------------------------

enum Decoder {
    Midi1(MidiStreamDecoder),
    Ump(UmpStreamDecoder),
}

struct Receiver {
    socket: UdpSocket,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Decoder>>,
    decoder: Option<Decoder>,
    port_name: String,
    on_warning: Option<WarningCallback>,
}

/// Binds the input socket before any callback is consumed, so a failed
/// bind can hand the configuration back untouched.
fn bind_input_socket(net: &NetConfig) -> Result<UdpSocket, Error> {
    let socket = UdpSocket::bind((net.accept.as_str(), net.port)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            Error::address_in_use("net: cannot bind input socket")
        } else {
            Error::address_not_available("net: cannot bind input socket")
        }
    })?;
    socket
        .set_read_timeout(Some(RECV_TIMEOUT))
        .map_err(|_| Error::io("net: cannot configure input socket"))?;
    Ok(socket)
}

impl Receiver {
    fn new(socket: UdpSocket, decoder: Decoder, on_warning: Option<WarningCallback>) -> Receiver {
        Receiver {
            socket,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
            decoder: Some(decoder),
            port_name: String::new(),
            on_warning,
        }
    }

    fn start(&mut self, port_name: &str) -> Result<(), Error> {
        let mut decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::invalid_argument("net: port already open"))?;
        self.port_name = port_name.to_string();
        self.stop.store(false, Ordering::Relaxed);

        let socket = self
            .socket
            .try_clone()
            .map_err(|_| Error::io("net: cannot clone input socket"))?;
        let stop = self.stop.clone();
        let address = self.port_name.clone();

        let builder = std::thread::Builder::new().name(format!("unimidi net input ({port_name})"));
        let thread = builder
            .spawn(move || {
                let mut buf = [0u8; 65535];
                while !stop.load(Ordering::Relaxed) {
                    let received = match socket.recv_from(&mut buf) {
                        Ok((n, _)) => n,
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue
                        }
                        Err(e) => {
                            log::error!("net input receive failed: {e}");
                            continue;
                        }
                    };
                    if received == 0 || received > MAX_DATAGRAM {
                        continue;
                    }
                    let data = &buf[..received];
                    let result = match &mut decoder {
                        Decoder::Midi1(d) => parse_packet_midi1(data, &address, |bytes| {
                            d.add_bytes(bytes, None, 0)
                        }),
                        Decoder::Ump(d) => parse_packet_ump(data, &address, |words| {
                            d.add_words(words, None, 0)
                        }),
                    };
                    if let Err(err) = result {
                        log::debug!("net input dropped a datagram: {err}");
                    }
                }
                decoder
            })
            .map_err(|_| Error::io("net: cannot spawn input thread"))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            match thread.join() {
                Ok(decoder) => self.decoder = Some(decoder),
                Err(_) => {
                    report_warning(&mut self.on_warning, "net: input thread panicked");
                    return Err(Error::io("net: input thread panicked"));
                }
            }
        }
        Ok(())
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

pub struct NetInput {
    receiver: Receiver,
}

impl NetInput {
    pub fn new(config: InputConfig, net: NetConfig) -> Result<NetInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("net: byte-stream transport opened with a UMP callback"),
                config,
            ));
        }
        let socket = match bind_input_socket(&net) {
            Ok(socket) => socket,
            Err(e) => return Err((e, config)),
        };
        let InputConfig { callback, get_timestamp, on_error: _, on_warning, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder =
            Decoder::Midi1(MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS));
        Ok(NetInput { receiver: Receiver::new(socket, decoder, on_warning) })
    }
}

impl InputBackend for NetInput {
    fn api(&self) -> Api {
        Api::Network
    }

    fn open_port(&mut self, _port: &InputPort, local_name: &str) -> Result<(), Error> {
        // The datagram socket is the endpoint; the local name is the OSC
        // address other peers send to.
        self.receiver.start(local_name)
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.receiver.start(name)
    }

    fn close_port(&mut self) -> Result<(), Error> {
        self.receiver.shutdown()
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::operation_not_supported("net: the address cannot change while bound"))
    }
}

pub struct NetUmpInput {
    receiver: Receiver,
}

impl NetUmpInput {
    pub fn new(config: InputConfig, net: NetConfig) -> Result<NetUmpInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Ump(_)) {
            return Err((
                Error::invalid_argument("net: UMP transport opened with a byte callback"),
                config,
            ));
        }
        let socket = match bind_input_socket(&net) {
            Ok(socket) => socket,
            Err(e) => return Err((e, config)),
        };
        let InputConfig { callback, get_timestamp, on_error: _, on_warning, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Ump(cb) => cb,
            InputCallback::Midi1(_) => unreachable!(),
        };
        let decoder =
            Decoder::Ump(UmpStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS));
        Ok(NetUmpInput { receiver: Receiver::new(socket, decoder, on_warning) })
    }
}

impl InputBackend for NetUmpInput {
    fn api(&self) -> Api {
        Api::NetworkUmp
    }

    fn open_port(&mut self, _port: &InputPort, local_name: &str) -> Result<(), Error> {
        self.receiver.start(local_name)
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.receiver.start(name)
    }

    fn close_port(&mut self) -> Result<(), Error> {
        self.receiver.shutdown()
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        Err(Error::operation_not_supported("net: the address cannot change while bound"))
    }
}

// --- Output --------------------------------------------------------------

struct Sender {
    socket: UdpSocket,
    host: String,
    port: u16,
    address: String,
}

impl Sender {
    fn new(net: &NetConfig) -> Result<Sender, Error> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|_| Error::address_not_available("net: cannot create output socket"))?;
        Ok(Sender { socket, host: net.host.clone(), port: net.port, address: String::new() })
    }

    fn send(&self, packet: &[u8]) -> Result<(), Error> {
        self.socket
            .send_to(packet, (self.host.as_str(), self.port))
            .map_err(|_| Error::io("net: datagram send failed"))?;
        Ok(())
    }
}

pub struct NetOutput {
    sender: Sender,
    #[allow(dead_code)]
    on_error: Option<ErrorCallback>,
}

impl NetOutput {
    pub fn new(config: OutputConfig, net: NetConfig) -> Result<NetOutput, (Error, OutputConfig)> {
        match Sender::new(&net) {
            Ok(sender) => Ok(NetOutput { sender, on_error: config.on_error }),
            Err(e) => Err((e, config)),
        }
    }
}

impl OutputBackend for NetOutput {
    fn api(&self) -> Api {
        Api::Network
    }

    fn open_port(&mut self, _port: &OutputPort, local_name: &str) -> Result<(), Error> {
        self.sender.address = local_name.to_string();
        Ok(())
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.sender.address = name.to_string();
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let packet = build_packet_midi1(&self.sender.address, message)?;
        self.sender.send(&packet)
    }
}

pub struct NetUmpOutput {
    sender: Sender,
    #[allow(dead_code)]
    on_error: Option<ErrorCallback>,
}

impl NetUmpOutput {
    pub fn new(config: OutputConfig, net: NetConfig) -> Result<NetUmpOutput, (Error, OutputConfig)> {
        match Sender::new(&net) {
            Ok(sender) => Ok(NetUmpOutput { sender, on_error: config.on_error }),
            Err(e) => Err((e, config)),
        }
    }
}

impl OutputBackend for NetUmpOutput {
    fn api(&self) -> Api {
        Api::NetworkUmp
    }

    fn open_port(&mut self, _port: &OutputPort, local_name: &str) -> Result<(), Error> {
        self.sender.address = local_name.to_string();
        Ok(())
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.sender.address = name.to_string();
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn send_ump(&mut self, words: &[u32]) -> Result<(), Error> {
        let packet = build_packet_ump(&self.sender.address, words)?;
        self.sender.send(&packet)
    }
}

// --- Observer ------------------------------------------------------------

/// The network has no endpoint directory: peers appear when datagrams
/// arrive. Enumeration is therefore empty and hotplug never fires.
pub struct NetObserver {
    api: Api,
}

impl NetObserver {
    pub fn new(mut config: ObserverConfig, api: Api) -> Result<NetObserver, (Error, ObserverConfig)> {
        if config.wants_notifications() {
            report_warning(
                &mut config.on_warning,
                "net: hotplug callbacks configured but this transport cannot notify",
            );
        }
        Ok(NetObserver { api })
    }
}

impl ObserverBackend for NetObserver {
    fn api(&self) -> Api {
        self.api
    }

    fn input_ports(&self) -> Vec<InputPort> {
        Vec::new()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use std::sync::{Arc, Mutex};

    #[test]
    fn midi1_packet_round_trips() {
        let packet = build_packet_midi1("/midi", &[0x91, 0x3C, 0x64]).unwrap();
        assert_eq!(packet.len() % 4, 0);
        let mut seen = Vec::new();
        parse_packet_midi1(&packet, "/midi", |m| seen.push(m.to_vec())).unwrap();
        assert_eq!(seen, vec![vec![0x91, 0x3C, 0x64]]);
    }

    #[test]
    fn short_messages_do_not_grow_trailing_zeros() {
        let packet = build_packet_midi1("/midi", &[0xC0, 0x05]).unwrap();
        let mut seen = Vec::new();
        parse_packet_midi1(&packet, "/midi", |m| seen.push(m.to_vec())).unwrap();
        assert_eq!(seen, vec![vec![0xC0, 0x05]]);

        let packet = build_packet_midi1("/midi", &[0xF8]).unwrap();
        let mut seen = Vec::new();
        parse_packet_midi1(&packet, "/midi", |m| seen.push(m.to_vec())).unwrap();
        assert_eq!(seen, vec![vec![0xF8]]);
    }

    #[test]
    fn ump_packet_round_trips() {
        let words = [0x40B32300u32, 0xC8000000, 0x10F80000];
        let packet = build_packet_ump("/ump", &words).unwrap();
        let mut seen: Vec<Vec<u32>> = Vec::new();
        parse_packet_ump(&packet, "/ump", |w| seen.push(w.to_vec())).unwrap();
        assert_eq!(seen, vec![vec![0x40B32300, 0xC8000000], vec![0x10F80000]]);
    }

    #[test]
    fn address_mismatch_is_rejected() {
        let packet = build_packet_midi1("/midi", &[0xF8]).unwrap();
        let err = parse_packet_midi1(&packet, "/other", |_| {}).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::AddressNotAvailable);
    }

    #[test]
    fn bundles_are_refused() {
        let err = parse_packet_midi1(b"#bundle\0rest", "/midi", |_| {}).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::OperationNotSupported);
    }

    #[test]
    fn garbage_is_a_bad_message() {
        let err = parse_packet_midi1(b"xyz", "/midi", |_| {}).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::BadMessage);
    }

    #[test]
    fn sysex_does_not_fit_the_midi1_flavor() {
        let err = build_packet_midi1("/midi", &[0xF0, 1, 2, 3, 0xF7]).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::MessageSize);
    }

    #[test]
    fn input_to_output_over_loopback() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let config = InputConfig::new(move |msg| sink.lock().unwrap().push(msg.bytes));

        let net = NetConfig { accept: "127.0.0.1".into(), host: "127.0.0.1".into(), port: 0 };
        let mut input = NetInput::new(config, net).map_err(|(e, _)| e).unwrap();
        let local_port = input.receiver.socket.local_addr().unwrap().port();
        input.open_virtual_port("/loop").unwrap();

        let out_net =
            NetConfig { accept: "127.0.0.1".into(), host: "127.0.0.1".into(), port: local_port };
        let mut output = NetOutput::new(OutputConfig::new(), out_net).map_err(|(e, _)| e).unwrap();
        output.open_virtual_port("/loop").unwrap();
        output.send_message(&[0x91, 0x3C, 0x64]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("datagram never arrived");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        input.close_port().unwrap();
        assert_eq!(received.lock().unwrap()[0], vec![0x91, 0x3C, 0x64]);
    }

    #[test]
    fn ump_loopback() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let config = InputConfig::new_ump(move |ump| sink.lock().unwrap().push(ump.words().to_vec()));

        let net = NetConfig { accept: "127.0.0.1".into(), host: "127.0.0.1".into(), port: 0 };
        let mut input = NetUmpInput::new(config, net).map_err(|(e, _)| e).unwrap();
        let local_port = input.receiver.socket.local_addr().unwrap().port();
        input.open_virtual_port("/ump").unwrap();

        let out_net =
            NetConfig { accept: "127.0.0.1".into(), host: "127.0.0.1".into(), port: local_port };
        let mut output =
            NetUmpOutput::new(OutputConfig::new(), out_net).map_err(|(e, _)| e).unwrap();
        output.open_virtual_port("/ump").unwrap();
        output.send_ump(&[0x40B32300, 0xC8000000]).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            if std::time::Instant::now() > deadline {
                panic!("datagram never arrived");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        input.close_port().unwrap();
        assert_eq!(received.lock().unwrap()[0], vec![0x40B32300, 0xC8000000]);
    }
}
