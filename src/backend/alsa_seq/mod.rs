//! ALSA sequencer backend. Each connection owns its own sequencer
//! client; inputs read events on a dedicated thread woken through a
//! self-pipe, so closing can interrupt the poll and join deterministically.
//! A process-wide client shared between connections is available through
//! [`SharedSeqContext`].

use std::ffi::CString;
use std::mem;
use std::thread::{Builder, JoinHandle};

use alsa::seq::{
    Addr, ClientIter, EventType, MidiEvent, PortCap, PortInfo as SeqPortInfo, PortIter,
    PortSubscribe, PortType, QueueTempo,
};
use alsa::{Direction, PollDescriptors, Seq};

use crate::api::Api;
use crate::backend::{report_warning, InputBackend, ObserverBackend, OutputBackend};
use crate::config::{
    AlsaSeqConfig, InputCallback, InputConfig, ObserverConfig, OutputConfig, WarningCallback,
};
use crate::decoder::MidiStreamDecoder;
use crate::errors::Error;
use crate::port::{InputPort, OutputPort, PortInfo, TransportKind};
use crate::timestamp::TimestampInfo;

mod shared;
pub use shared::SharedSeqContext;

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: false };

const INITIAL_CODER_BUFFER_SIZE: u32 = 32;

/// The sequencer address space is two small integers; the portable
/// 64-bit handle packs them as `client << 32 | port`.
pub(crate) fn pack_addr(client: i32, port: i32) -> u64 {
    ((client as u32 as u64) << 32) | (port as u32 as u64)
}

pub(crate) fn unpack_addr(handle: u64) -> Addr {
    Addr { client: (handle >> 32) as u32 as i32, port: handle as u32 as i32 }
}

/// Kernel clients live below 64 on the sequencer graph; user-space
/// clients start at 128.
fn client_kind(client: i32) -> TransportKind {
    if client < 64 {
        TransportKind::Hardware
    } else {
        TransportKind::Software
    }
}

fn open_seq(client_name: &str, direction: Option<Direction>) -> Result<Seq, Error> {
    let seq = Seq::open(None, direction, true)?;
    let c_name = CString::new(client_name)
        .map_err(|_| Error::invalid_argument("alsa_seq: client name contains a nul byte"))?;
    seq.set_client_name(&c_name)?;
    Ok(seq)
}

fn port_info_from(seq: &Seq, own_client: i32, pinfo: &SeqPortInfo) -> PortInfo {
    let client = pinfo.get_client();
    let client_name = seq
        .get_any_client_info(client)
        .ok()
        .and_then(|c| c.get_name().ok().map(str::to_string))
        .unwrap_or_default();
    let port_name = pinfo.get_name().map(str::to_string).unwrap_or_default();
    let display_name = if client_name.is_empty() {
        port_name.clone()
    } else {
        format!("{}:{}", client_name, port_name)
    };
    PortInfo {
        api: Some(Api::AlsaSeq),
        client: own_client as u64,
        port: pack_addr(client, pinfo.get_port()),
        manufacturer: String::new(),
        device_name: client_name,
        port_name,
        display_name,
        kind: client_kind(client),
    }
}

/// Walks every readable (or writable) port on the sequencer graph.
fn enumerate(seq: &Seq, capability: PortCap) -> Vec<PortInfo> {
    let own_client = seq.client_id().unwrap_or(-1);
    let mut ports = Vec::new();
    for cinfo in ClientIter::new(seq) {
        let client = cinfo.get_client();
        if client == 0 || client == own_client {
            continue;
        }
        for pinfo in PortIter::new(seq, client) {
            if !pinfo.get_type().intersects(PortType::MIDI_GENERIC | PortType::SYNTH) {
                continue;
            }
            if !pinfo.get_capability().contains(capability) {
                continue;
            }
            ports.push(port_info_from(seq, own_client, &pinfo));
        }
    }
    ports
}

/// Self-pipe used to interrupt a poll-based reader thread.
pub(super) struct Trigger {
    pub(super) read_fd: i32,
    write_fd: i32,
}

impl Trigger {
    pub(super) fn new() -> Result<Trigger, Error> {
        let mut fds = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(Error::io("alsa_seq: cannot create wakeup pipe"));
        }
        Ok(Trigger { read_fd: fds[0], write_fd: fds[1] })
    }

    pub(super) fn wake(&self) {
        let stop = true;
        unsafe {
            libc::write(self.write_fd, &stop as *const bool as *const _, mem::size_of::<bool>())
        };
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

pub(super) fn poll(fds: &mut [libc::pollfd], timeout: i32) -> i32 {
    unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) }
}

struct HandlerData {
    seq: Seq,
    decoder: MidiStreamDecoder,
    trigger_read_fd: i32,
    queue_id: i32,
}

/// Reader loop: polls the sequencer descriptors plus the wakeup pipe,
/// decodes events back into raw bytes and feeds the stream decoder.
fn handle_input(mut data: HandlerData) -> HandlerData {
    let mut buffer = [0u8; 16];
    let mut coder = match MidiEvent::new(0) {
        Ok(c) => c,
        Err(_) => return data,
    };
    let _ = coder.enable_running_status(false);

    let mut poll_fds;
    {
        let poll_source = (&data.seq, Some(Direction::Capture));
        let count = poll_source.count() + 1;
        poll_fds = vec![libc::pollfd { fd: 0, events: 0, revents: 0 }; count];
        if poll_source.fill(&mut poll_fds[1..]).is_err() {
            return data;
        }
    }
    poll_fds[0].fd = data.trigger_read_fd;
    poll_fds[0].events = libc::POLLIN;

    {
        let mut seq_input = data.seq.input();
        let mut keep_going = true;
        while keep_going {
            if let Ok(0) = seq_input.event_input_pending(true) {
                // Nothing buffered: wait on the descriptors.
                if poll(&mut poll_fds, -1) >= 0 && poll_fds[0].revents & libc::POLLIN != 0 {
                    let mut terminate = false;
                    let _ = unsafe {
                        libc::read(
                            poll_fds[0].fd,
                            &mut terminate as *mut bool as *mut _,
                            mem::size_of::<bool>(),
                        )
                    };
                    keep_going = false;
                }
                continue;
            }

            let mut ev = match seq_input.event_input() {
                Ok(ev) => ev,
                Err(ref e) if e.errno() == libc::ENOSPC => {
                    log::error!("alsa_seq: input buffer overrun, events were lost");
                    continue;
                }
                Err(_) => continue,
            };

            let timestamp = ev.get_time().map(|t| t.as_nanos() as i64);

            if ev.get_type() == EventType::Sysex {
                // SysEx arrives pre-decoded, possibly fragmented; the
                // stream decoder reassembles across fragments.
                if let Some(fragment) = ev.get_ext() {
                    data.decoder.add_bytes(fragment, timestamp, 0);
                }
                continue;
            }

            match coder.decode(&mut buffer, &mut ev) {
                Ok(bytes) if bytes > 0 => {
                    data.decoder.add_bytes(&buffer[..bytes], timestamp, 0);
                }
                _ => {} // not a MIDI event (subscription notices etc.)
            }
        }
    }
    data
}

enum InputClient {
    /// The connection owns a sequencer client and a reader thread.
    Own { seq: Option<Seq>, decoder: Option<MidiStreamDecoder> },
    /// Events are multiplexed over a process-wide client; the decoder
    /// lives on the context's process thread while a port is open.
    Shared {
        context: std::sync::Arc<SharedSeqContext>,
        registration: Option<u64>,
        decoder: Option<Box<MidiStreamDecoder>>,
    },
}

pub struct AlsaSeqInput {
    client: InputClient,
    on_warning: Option<WarningCallback>,
    thread: Option<JoinHandle<HandlerData>>,
    trigger: Option<Trigger>,
    subscription: Option<PortSubscribe>,
    vport: i32,
    queue_id: i32,
}

impl AlsaSeqInput {
    pub fn new(config: InputConfig, api: AlsaSeqConfig) -> Result<AlsaSeqInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("alsa_seq: the sequencer speaks MIDI 1 byte streams"),
                config,
            ));
        }
        let own_seq = if api.context.is_none() {
            match open_seq(&api.client_name, None) {
                Ok(seq) => Some(seq),
                Err(e) => return Err((e, config)),
            }
        } else {
            None
        };
        let InputConfig { callback, get_timestamp, on_error: _, on_warning, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder = MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS);
        let client = match api.context {
            Some(context) => InputClient::Shared {
                context,
                registration: None,
                decoder: Some(Box::new(decoder)),
            },
            None => InputClient::Own { seq: own_seq, decoder: Some(decoder) },
        };
        Ok(AlsaSeqInput {
            client,
            on_warning,
            thread: None,
            trigger: None,
            subscription: None,
            vport: -1,
            queue_id: -1,
        })
    }

    fn init_queue(seq: &Seq) -> i32 {
        // An input queue is needed to get timestamped events.
        let queue_id = match seq.alloc_named_queue(c"unimidi queue") {
            Ok(q) => q,
            Err(_) => return -1,
        };
        if let Ok(tempo) = QueueTempo::empty() {
            tempo.set_tempo(600_000); // mm = 100
            tempo.set_ppq(240);
            let _ = seq.set_queue_tempo(queue_id, &tempo);
        }
        let _ = seq.drain_output();
        queue_id
    }

    fn create_port(seq: &Seq, name: &str, queue_id: i32) -> Result<i32, Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::invalid_argument("alsa_seq: port name contains a nul byte"))?;
        let mut pinfo = SeqPortInfo::empty()?;
        pinfo.set_capability(PortCap::WRITE | PortCap::SUBS_WRITE);
        pinfo.set_type(PortType::MIDI_GENERIC | PortType::APPLICATION);
        pinfo.set_midi_channels(16);
        if queue_id >= 0 {
            pinfo.set_timestamping(true);
            pinfo.set_timestamp_real(true);
            pinfo.set_timestamp_queue(queue_id);
        }
        pinfo.set_name(&c_name);
        seq.create_port(&pinfo)?;
        Ok(pinfo.get_port())
    }

    /// Creates the local port, optionally subscribes it to `source`, and
    /// starts the reader thread.
    fn start(&mut self, source: Option<Addr>, port_name: &str) -> Result<(), Error> {
        if !matches!(&self.client, InputClient::Own { seq: Some(_), decoder: Some(_) }) {
            return Err(Error::invalid_argument("alsa_seq: port already open"));
        }
        let (seq, decoder) = match &mut self.client {
            InputClient::Own { seq, decoder } => (seq.take().unwrap(), decoder.take().unwrap()),
            InputClient::Shared { .. } => unreachable!("shared clients do not start threads"),
        };

        let trigger = match Trigger::new() {
            Ok(t) => t,
            Err(e) => {
                self.give_back(seq, Some(decoder));
                return Err(e);
            }
        };
        let queue_id = Self::init_queue(&seq);
        let vport = match Self::create_port(&seq, port_name, queue_id) {
            Ok(p) => p,
            Err(e) => {
                self.give_back(seq, Some(decoder));
                return Err(e);
            }
        };
        let subscription = match source {
            Some(sender) => {
                let sub = PortSubscribe::empty()?;
                sub.set_sender(sender);
                sub.set_dest(Addr { client: seq.client_id()?, port: vport });
                if seq.subscribe_port(&sub).is_err() {
                    let _ = seq.delete_port(vport);
                    self.give_back(seq, Some(decoder));
                    return Err(Error::address_not_available(
                        "alsa_seq: cannot subscribe to the source port",
                    ));
                }
                Some(sub)
            }
            None => None,
        };

        // Start the input queue.
        if queue_id >= 0 {
            let _ = seq.control_queue(queue_id, EventType::Start, 0, None);
            let _ = seq.drain_output();
        }

        let handler = HandlerData { seq, decoder, trigger_read_fd: trigger.read_fd, queue_id };
        let builder = Builder::new().name(format!("unimidi alsa_seq input ({port_name})"));
        match builder.spawn(move || handle_input(handler)) {
            Ok(thread) => {
                self.thread = Some(thread);
                self.trigger = Some(trigger);
                self.subscription = subscription;
                self.vport = vport;
                self.queue_id = queue_id;
                Ok(())
            }
            Err(_) => Err(Error::io("alsa_seq: cannot spawn the input thread")),
        }
    }

    fn give_back(&mut self, seq: Seq, decoder: Option<MidiStreamDecoder>) {
        if let InputClient::Own { seq: slot, decoder: dslot } = &mut self.client {
            *slot = Some(seq);
            if let Some(d) = decoder {
                *dslot = Some(d);
            }
        }
    }
}

impl InputBackend for AlsaSeqInput {
    fn api(&self) -> Api {
        Api::AlsaSeq
    }

    fn open_port(&mut self, port: &InputPort, local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::AlsaSeq) {
            return Err(Error::invalid_argument("alsa_seq: port belongs to another API"));
        }
        let source = unpack_addr(port.port);
        match &mut self.client {
            InputClient::Shared { context, registration, decoder } => {
                let pending = decoder
                    .take()
                    .ok_or_else(|| Error::invalid_argument("alsa_seq: port already open"))?;
                let id = context.connect(source, pending)?;
                *registration = Some(id);
                Ok(())
            }
            InputClient::Own { .. } => self.start(Some(source), local_name),
        }
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        match &mut self.client {
            InputClient::Shared { .. } => Err(Error::operation_not_supported(
                "alsa_seq: virtual ports are not available through a shared context",
            )),
            InputClient::Own { .. } => self.start(None, name),
        }
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let InputClient::Shared { context, registration, decoder } = &mut self.client {
            if let Some(id) = registration.take() {
                *decoder = Some(context.disconnect(id)?);
            }
            return Ok(());
        }

        if let Some(trigger) = &self.trigger {
            trigger.wake();
        }
        let thread = match self.thread.take() {
            Some(t) => t,
            None => return Ok(()),
        };
        let handler = thread
            .join()
            .map_err(|_| Error::io("alsa_seq: input thread panicked"))?;
        self.trigger = None;

        if let Some(sub) = self.subscription.take() {
            let _ = handler.seq.unsubscribe_port(sub.get_sender(), sub.get_dest());
        }
        if handler.queue_id >= 0 {
            let _ = handler.seq.control_queue(handler.queue_id, EventType::Stop, 0, None);
            let _ = handler.seq.drain_output();
            let _ = handler.seq.free_queue(handler.queue_id);
        }
        let _ = handler.seq.delete_port(self.vport);
        self.vport = -1;
        self.queue_id = -1;
        self.give_back(handler.seq, Some(handler.decoder));
        Ok(())
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        report_warning(&mut self.on_warning, "alsa_seq: renaming an open port is not supported");
        Err(Error::operation_not_supported("alsa_seq: renaming an open port is not supported"))
    }
}

impl Drop for AlsaSeqInput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

pub struct AlsaSeqOutput {
    seq: Option<Seq>,
    vport: i32,
    subscription: Option<PortSubscribe>,
    coder: MidiEvent,
    coder_buffer_size: u32,
    on_warning: Option<WarningCallback>,
}

unsafe impl Send for AlsaSeqOutput {}

impl AlsaSeqOutput {
    pub fn new(config: OutputConfig, api: AlsaSeqConfig) -> Result<AlsaSeqOutput, (Error, OutputConfig)> {
        let seq = match open_seq(&api.client_name, Some(Direction::Playback)) {
            Ok(s) => s,
            Err(e) => return Err((e, config)),
        };
        let coder = match MidiEvent::new(INITIAL_CODER_BUFFER_SIZE) {
            Ok(c) => c,
            Err(e) => return Err((e.into(), config)),
        };
        Ok(AlsaSeqOutput {
            seq: Some(seq),
            vport: -1,
            subscription: None,
            coder,
            coder_buffer_size: INITIAL_CODER_BUFFER_SIZE,
            on_warning: config.on_warning,
        })
    }

    fn seq(&self) -> &Seq {
        self.seq.as_ref().expect("client is open")
    }

    fn create_port(&self, name: &str) -> Result<i32, Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::invalid_argument("alsa_seq: port name contains a nul byte"))?;
        Ok(self.seq().create_simple_port(&c_name, PortCap::READ | PortCap::SUBS_READ, PortType::MIDI_GENERIC | PortType::APPLICATION)?)
    }
}

impl OutputBackend for AlsaSeqOutput {
    fn api(&self) -> Api {
        Api::AlsaSeq
    }

    fn open_port(&mut self, port: &OutputPort, local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::AlsaSeq) {
            return Err(Error::invalid_argument("alsa_seq: port belongs to another API"));
        }
        let dest = unpack_addr(port.port);
        let vport = self.create_port(local_name)?;
        let sub = PortSubscribe::empty()?;
        sub.set_sender(Addr { client: self.seq().client_id()?, port: vport });
        sub.set_dest(dest);
        sub.set_time_update(true);
        sub.set_time_real(true);
        if self.seq().subscribe_port(&sub).is_err() {
            let _ = self.seq().delete_port(vport);
            return Err(Error::address_not_available(
                "alsa_seq: cannot subscribe to the destination port",
            ));
        }
        self.vport = vport;
        self.subscription = Some(sub);
        Ok(())
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.vport = self.create_port(name)?;
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let Some(sub) = self.subscription.take() {
            let _ = self.seq().unsubscribe_port(sub.get_sender(), sub.get_dest());
        }
        if self.vport >= 0 {
            let _ = self.seq().delete_port(self.vport);
            self.vport = -1;
        }
        Ok(())
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        report_warning(&mut self.on_warning, "alsa_seq: renaming an open port is not supported");
        Err(Error::operation_not_supported("alsa_seq: renaming an open port is not supported"))
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        if message.len() as u32 > self.coder_buffer_size {
            self.coder
                .resize_buffer(message.len() as u32)
                .map_err(|_| Error::message_size("alsa_seq: cannot grow the event encoder"))?;
            self.coder_buffer_size = message.len() as u32;
        }
        let seq = self.seq.as_ref().expect("client is open");
        let mut ev = match self.coder.encode(message) {
            Ok((_, Some(ev))) => ev,
            _ => return Err(Error::bad_message("alsa_seq: the encoder rejected the message")),
        };
        ev.set_source(self.vport);
        ev.set_subs();
        ev.set_direct();
        seq.event_output(&mut ev)?;
        let _ = seq.drain_output();
        Ok(())
    }
}

impl Drop for AlsaSeqOutput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

/// Hotplug observer: subscribes a private port to the system announce
/// port (`System:1`) and rebuilds its view when clients or ports come
/// and go.
pub struct AlsaSeqObserver {
    seq: Option<Seq>,
    thread: Option<JoinHandle<()>>,
    trigger: Option<Trigger>,
}

const ANNOUNCE: Addr = Addr { client: 0, port: 1 };

impl AlsaSeqObserver {
    pub fn new(
        config: ObserverConfig,
        api: AlsaSeqConfig,
    ) -> Result<AlsaSeqObserver, (Error, ObserverConfig)> {
        let seq = match open_seq(&api.client_name, None) {
            Ok(s) => s,
            Err(e) => return Err((e, config)),
        };
        // A second client feeds the notification thread so snapshot
        // queries never contend with it.
        let (thread, trigger) = if config.wants_notifications() {
            match Self::spawn_watcher(&api.client_name, config) {
                Ok(pair) => pair,
                Err(pair) => return Err(pair),
            }
        } else {
            (None, None)
        };
        Ok(AlsaSeqObserver { seq: Some(seq), thread, trigger })
    }

    #[allow(clippy::type_complexity)]
    fn spawn_watcher(
        client_name: &str,
        mut config: ObserverConfig,
    ) -> Result<(Option<JoinHandle<()>>, Option<Trigger>), (Error, ObserverConfig)> {
        let prepared: Result<(Seq, Trigger), Error> = (|| {
            let seq = open_seq(&format!("{client_name} monitor"), None)?;
            let vport = seq.create_simple_port(
                c"unimidi announce monitor",
                PortCap::WRITE | PortCap::SUBS_WRITE,
                PortType::MIDI_GENERIC | PortType::APPLICATION,
            )?;
            let sub = PortSubscribe::empty()?;
            sub.set_sender(ANNOUNCE);
            sub.set_dest(Addr { client: seq.client_id()?, port: vport });
            seq.subscribe_port(&sub)?;
            let trigger = Trigger::new()?;
            Ok((seq, trigger))
        })();
        let (seq, trigger) = match prepared {
            Ok(pair) => pair,
            Err(e) => return Err((e, config)),
        };
        let trigger_read_fd = trigger.read_fd;
        let builder = Builder::new().name("unimidi alsa_seq observer".to_string());
        let thread = builder
            .spawn(move || watch_announce(seq, trigger_read_fd, &mut config))
            .map_err(|_| {
                (Error::io("alsa_seq: cannot spawn the observer thread"), ObserverConfig::new())
            })?;
        Ok((Some(thread), Some(trigger)))
    }
}

/// Dispatches announce events to the observer callbacks. Known ports
/// are tracked so removals can report which lists they were on.
fn watch_announce(seq: Seq, trigger_read_fd: i32, config: &mut ObserverConfig) {
    use std::collections::HashMap;

    let mut known: HashMap<u64, (bool, bool, PortInfo)> = HashMap::new();
    let own_client = seq.client_id().unwrap_or(-1);
    for info in enumerate(&seq, PortCap::READ | PortCap::SUBS_READ) {
        known.entry(info.port).or_insert((false, false, info)).0 = true;
    }
    for info in enumerate(&seq, PortCap::WRITE | PortCap::SUBS_WRITE) {
        known.entry(info.port).or_insert((false, false, info)).1 = true;
    }

    let mut poll_fds;
    {
        let poll_source = (&seq, Some(Direction::Capture));
        let count = poll_source.count() + 1;
        poll_fds = vec![libc::pollfd { fd: 0, events: 0, revents: 0 }; count];
        if poll_source.fill(&mut poll_fds[1..]).is_err() {
            return;
        }
    }
    poll_fds[0].fd = trigger_read_fd;
    poll_fds[0].events = libc::POLLIN;

    let mut seq_input = seq.input();
    loop {
        if let Ok(0) = seq_input.event_input_pending(true) {
            if poll(&mut poll_fds, -1) >= 0 && poll_fds[0].revents & libc::POLLIN != 0 {
                return;
            }
            continue;
        }
        let ev = match seq_input.event_input() {
            Ok(ev) => ev,
            Err(_) => continue,
        };
        let addr: Addr = match ev.get_data() {
            Some(a) => a,
            None => continue,
        };
        if addr.client == 0 || addr.client == own_client {
            continue;
        }
        match ev.get_type() {
            EventType::PortStart | EventType::PortChange => {
                let pinfo = match seq.get_any_port_info(addr) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if !pinfo.get_type().intersects(PortType::MIDI_GENERIC | PortType::SYNTH) {
                    continue;
                }
                let info = port_info_from(&seq, own_client, &pinfo);
                if !config.tracks(info.kind) {
                    continue;
                }
                let caps = pinfo.get_capability();
                let is_input = caps.contains(PortCap::READ | PortCap::SUBS_READ);
                let is_output = caps.contains(PortCap::WRITE | PortCap::SUBS_WRITE);
                let entry =
                    known.entry(info.port).or_insert((false, false, info.clone()));
                if is_input && !entry.0 {
                    entry.0 = true;
                    if let Some(cb) = config.on_input_added.as_mut() {
                        cb(&info);
                    }
                }
                if is_output && !entry.1 {
                    entry.1 = true;
                    if let Some(cb) = config.on_output_added.as_mut() {
                        cb(&info);
                    }
                }
            }
            EventType::PortExit => {
                let handle = pack_addr(addr.client, addr.port);
                if let Some((was_input, was_output, info)) = known.remove(&handle) {
                    if was_input {
                        if let Some(cb) = config.on_input_removed.as_mut() {
                            cb(&info);
                        }
                    }
                    if was_output {
                        if let Some(cb) = config.on_output_removed.as_mut() {
                            cb(&info);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

impl ObserverBackend for AlsaSeqObserver {
    fn api(&self) -> Api {
        Api::AlsaSeq
    }

    fn input_ports(&self) -> Vec<InputPort> {
        let seq = self.seq.as_ref().expect("client is open");
        enumerate(seq, PortCap::READ | PortCap::SUBS_READ).into_iter().map(InputPort).collect()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        let seq = self.seq.as_ref().expect("client is open");
        enumerate(seq, PortCap::WRITE | PortCap::SUBS_WRITE).into_iter().map(OutputPort).collect()
    }
}

impl Drop for AlsaSeqObserver {
    fn drop(&mut self) {
        if let Some(trigger) = &self.trigger {
            trigger.wake();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_packing_round_trips() {
        for (client, port) in [(0, 0), (20, 0), (128, 7), (130, 255)] {
            let addr = unpack_addr(pack_addr(client, port));
            assert_eq!(addr.client, client);
            assert_eq!(addr.port, port);
        }
    }

    #[test]
    fn kernel_clients_look_like_hardware() {
        assert_eq!(client_kind(20), TransportKind::Hardware);
        assert_eq!(client_kind(129), TransportKind::Software);
    }
}
