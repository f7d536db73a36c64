//! ALSA rawmidi backend: talks straight to `hw:card,device,sub` byte
//! devices, bypassing the sequencer. Input runs a reader thread woken
//! through a self-pipe; output optionally paces large SysEx transfers
//! through the chunking policy because the kernel ring buffer is small.

use std::ffi::CString;
use std::io::{Read, Write};
use std::mem;
use std::thread::{Builder, JoinHandle};

use alsa::card;
use alsa::ctl::Ctl;
use alsa::device_name::HintIter;
use alsa::rawmidi::Rawmidi;
use alsa::{Direction, PollDescriptors};

use crate::api::Api;
use crate::backend::{report_warning, InputBackend, ObserverBackend, OutputBackend};
use crate::config::{
    AlsaRawConfig, InputCallback, InputConfig, ObserverConfig, OutputConfig, WarningCallback,
};
use crate::decoder::MidiStreamDecoder;
use crate::errors::Error;
use crate::port::{InputPort, OutputPort, PortInfo, TransportKind};
use crate::segment::{write_chunked, ChunkingParameters};
use crate::timestamp::{monotonic_ns, TimestampInfo};

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: false, absolute_is_monotonic: false, has_samples: false };

/// A rawmidi endpoint is addressed by card/device/subdevice; the
/// portable handle packs the triple into the low 48 bits.
pub(crate) fn pack_device(card: u16, device: u16, sub: u16) -> u64 {
    ((card as u64) << 32) | ((device as u64) << 16) | sub as u64
}

pub(crate) fn unpack_device(handle: u64) -> (u16, u16, u16) {
    (((handle >> 32) & 0xFFFF) as u16, ((handle >> 16) & 0xFFFF) as u16, (handle & 0xFFFF) as u16)
}

fn device_string(handle: u64) -> String {
    let (card, device, sub) = unpack_device(handle);
    format!("hw:{card},{device},{sub}")
}

/// Resolves the `CARD=` token of a device hint to a card index.
fn card_index_by_id(id: &str) -> Option<u16> {
    for card in card::Iter::new().flatten() {
        if let Ok(ctl) = Ctl::from_card(&card, false) {
            if let Ok(info) = ctl.card_info() {
                if info.get_id().map(|i| i == id).unwrap_or(false) {
                    return u16::try_from(card.get_index()).ok();
                }
            }
        }
    }
    None
}

/// Parses a rawmidi hint name (`hw:1,0,0` or `hw:CARD=Foo,DEV=0,SUB=0`)
/// into the packed handle.
fn parse_hint_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("hw:")?;
    let mut card: Option<u16> = None;
    let mut device: u16 = 0;
    let mut sub: u16 = 0;
    for (index, part) in rest.split(',').enumerate() {
        if let Some(id) = part.strip_prefix("CARD=") {
            card = id.parse().ok().or_else(|| card_index_by_id(id));
        } else if let Some(dev) = part.strip_prefix("DEV=") {
            device = dev.parse().ok()?;
        } else if let Some(s) = part.strip_prefix("SUB=") {
            sub = s.parse().ok()?;
        } else {
            let value = part.parse().ok()?;
            match index {
                0 => card = Some(value),
                1 => device = value,
                2 => sub = value,
                _ => return None,
            }
        }
    }
    Some(pack_device(card?, device, sub))
}

/// Lists rawmidi endpoints for one direction via the device name hints.
fn enumerate(direction: Direction) -> Vec<PortInfo> {
    let iface = CString::new("rawmidi").unwrap();
    let hints = match HintIter::new(None, &iface) {
        Ok(h) => h,
        Err(_) => return Vec::new(),
    };
    let mut ports = Vec::new();
    for hint in hints {
        let name = match &hint.name {
            Some(n) => n.clone(),
            None => continue,
        };
        if let Some(dir) = hint.direction {
            if dir != direction {
                continue;
            }
        }
        let handle = match parse_hint_name(&name) {
            Some(h) => h,
            None => continue,
        };
        let desc = hint.desc.clone().unwrap_or_default();
        let mut lines = desc.lines();
        let device_name = lines.next().unwrap_or("").to_string();
        let port_name = lines.next().unwrap_or(&device_name).to_string();
        ports.push(PortInfo {
            api: Some(Api::AlsaRaw),
            client: 0,
            port: handle,
            manufacturer: String::new(),
            device_name,
            port_name,
            display_name: name,
            kind: TransportKind::Hardware,
        });
    }
    ports
}

fn open_device(handle: u64, direction: Direction, nonblock: bool) -> Result<Rawmidi, Error> {
    Rawmidi::new(&device_string(handle), direction, nonblock).map_err(|e| {
        let err: Error = e.into();
        if err.category() == crate::errors::ErrorCategory::Io {
            // A stale handle most often means the device got unplugged.
            Error::address_not_available("alsa_raw: cannot open device")
        } else {
            err
        }
    })
}

struct Trigger {
    read_fd: i32,
    write_fd: i32,
}

impl Trigger {
    fn new() -> Result<Trigger, Error> {
        let mut fds = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
            return Err(Error::io("alsa_raw: cannot create wakeup pipe"));
        }
        Ok(Trigger { read_fd: fds[0], write_fd: fds[1] })
    }

    fn wake(&self) {
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

struct HandlerData {
    rawmidi: Rawmidi,
    decoder: MidiStreamDecoder,
    trigger_read_fd: i32,
}

fn handle_input(mut data: HandlerData) -> MidiStreamDecoder {
    let mut poll_fds;
    {
        let count = data.rawmidi.count() + 1;
        poll_fds = vec![libc::pollfd { fd: 0, events: 0, revents: 0 }; count];
        if data.rawmidi.fill(&mut poll_fds[1..]).is_err() {
            return data.decoder;
        }
    }
    poll_fds[0].fd = data.trigger_read_fd;
    poll_fds[0].events = libc::POLLIN;

    let mut buffer = [0u8; 256];
    loop {
        if unsafe { libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, -1) } < 0 {
            break;
        }
        if poll_fds[0].revents & libc::POLLIN != 0 {
            let mut terminate = false;
            let _ = unsafe {
                libc::read(
                    poll_fds[0].fd,
                    &mut terminate as *mut bool as *mut _,
                    mem::size_of::<bool>(),
                )
            };
            break;
        }
        loop {
            match data.rawmidi.io().read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    // One steady-clock reading per chunk; the decoder
                    // derives message timestamps from it.
                    data.decoder.add_bytes(&buffer[..n], Some(monotonic_ns()), 0);
                    if n < buffer.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
    data.decoder
}

pub struct AlsaRawInput {
    decoder: Option<MidiStreamDecoder>,
    thread: Option<JoinHandle<MidiStreamDecoder>>,
    trigger: Option<Trigger>,
    on_warning: Option<WarningCallback>,
}

impl AlsaRawInput {
    pub fn new(config: InputConfig, _api: AlsaRawConfig) -> Result<AlsaRawInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("alsa_raw: rawmidi devices speak MIDI 1 byte streams"),
                config,
            ));
        }
        let InputConfig { callback, get_timestamp, on_error: _, on_warning, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder = MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS);
        Ok(AlsaRawInput { decoder: Some(decoder), thread: None, trigger: None, on_warning })
    }
}

impl InputBackend for AlsaRawInput {
    fn api(&self) -> Api {
        Api::AlsaRaw
    }

    fn open_port(&mut self, port: &InputPort, _local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::AlsaRaw) {
            return Err(Error::invalid_argument("alsa_raw: port belongs to another API"));
        }
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::invalid_argument("alsa_raw: port already open"))?;
        let rawmidi = match open_device(port.port, Direction::Capture, true) {
            Ok(r) => r,
            Err(e) => {
                self.decoder = Some(decoder);
                return Err(e);
            }
        };
        let trigger = match Trigger::new() {
            Ok(t) => t,
            Err(e) => {
                self.decoder = Some(decoder);
                return Err(e);
            }
        };
        let handler = HandlerData { rawmidi, decoder, trigger_read_fd: trigger.read_fd };
        let builder = Builder::new().name("unimidi alsa_raw input".to_string());
        match builder.spawn(move || handle_input(handler)) {
            Ok(thread) => {
                self.thread = Some(thread);
                self.trigger = Some(trigger);
                Ok(())
            }
            Err(_) => Err(Error::io("alsa_raw: cannot spawn the input thread")),
        }
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let Some(trigger) = &self.trigger {
            trigger.wake();
        }
        if let Some(thread) = self.thread.take() {
            let decoder =
                thread.join().map_err(|_| Error::io("alsa_raw: input thread panicked"))?;
            self.decoder = Some(decoder);
        }
        self.trigger = None;
        Ok(())
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        report_warning(&mut self.on_warning, "alsa_raw: devices cannot be renamed");
        Err(Error::operation_not_supported("alsa_raw: devices cannot be renamed"))
    }
}

impl Drop for AlsaRawInput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

pub struct AlsaRawOutput {
    rawmidi: Option<Rawmidi>,
    chunking: Option<ChunkingParameters>,
    on_warning: Option<WarningCallback>,
}

impl AlsaRawOutput {
    pub fn new(config: OutputConfig, _api: AlsaRawConfig) -> Result<AlsaRawOutput, (Error, OutputConfig)> {
        Ok(AlsaRawOutput {
            rawmidi: None,
            chunking: config.chunking,
            on_warning: config.on_warning,
        })
    }
}

impl OutputBackend for AlsaRawOutput {
    fn api(&self) -> Api {
        Api::AlsaRaw
    }

    fn open_port(&mut self, port: &OutputPort, _local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::AlsaRaw) {
            return Err(Error::invalid_argument("alsa_raw: port belongs to another API"));
        }
        if self.rawmidi.is_some() {
            return Err(Error::invalid_argument("alsa_raw: port already open"));
        }
        self.rawmidi = Some(open_device(port.port, Direction::Playback, false)?);
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        self.rawmidi = None;
        Ok(())
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        report_warning(&mut self.on_warning, "alsa_raw: devices cannot be renamed");
        Err(Error::operation_not_supported("alsa_raw: devices cannot be renamed"))
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let rawmidi = self
            .rawmidi
            .as_mut()
            .ok_or_else(|| Error::not_connected("alsa_raw: no open device"))?;
        match &mut self.chunking {
            None => {
                rawmidi
                    .io()
                    .write_all(message)
                    .map_err(|_| Error::io("alsa_raw: device write failed"))?;
                Ok(())
            }
            Some(params) => {
                // The binding does not expose the ring's free space, so
                // drain waits are driven by the policy alone.
                let chunk = params.size;
                let mut io = rawmidi.io();
                write_chunked(message, params, || chunk, |slice| {
                    io.write_all(slice).map_err(|_| Error::io("alsa_raw: device write failed"))
                })
            }
        }
    }
}

/// Enumeration-only observer: rawmidi has no native hotplug source
/// (that is udev's job), so only snapshots are served.
pub struct AlsaRawObserver;

impl AlsaRawObserver {
    pub fn new(
        mut config: ObserverConfig,
        _api: AlsaRawConfig,
    ) -> Result<AlsaRawObserver, (Error, ObserverConfig)> {
        if config.wants_notifications() {
            report_warning(
                &mut config.on_warning,
                "alsa_raw: hotplug callbacks configured but this backend only enumerates",
            );
        }
        Ok(AlsaRawObserver)
    }
}

impl ObserverBackend for AlsaRawObserver {
    fn api(&self) -> Api {
        Api::AlsaRaw
    }

    fn input_ports(&self) -> Vec<InputPort> {
        enumerate(Direction::Capture).into_iter().map(InputPort).collect()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        enumerate(Direction::Playback).into_iter().map(OutputPort).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_handles_round_trip() {
        for (card, device, sub) in [(0, 0, 0), (1, 0, 3), (28, 7, 1), (65535, 65535, 65535)] {
            assert_eq!(unpack_device(pack_device(card, device, sub)), (card, device, sub));
        }
    }

    #[test]
    fn numeric_hint_names_parse() {
        assert_eq!(parse_hint_name("hw:1,0,0"), Some(pack_device(1, 0, 0)));
        assert_eq!(parse_hint_name("hw:2,3"), Some(pack_device(2, 3, 0)));
        assert_eq!(parse_hint_name("hw:CARD=4,DEV=1"), Some(pack_device(4, 1, 0)));
        assert_eq!(parse_hint_name("default"), None);
    }

    #[test]
    fn device_string_matches_alsa_convention() {
        assert_eq!(device_string(pack_device(1, 0, 2)), "hw:1,0,2");
    }
}
