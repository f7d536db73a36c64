//! JACK backend. Every connection opens its own JACK client; input is
//! decoded inside the process callback (which makes `AudioFrame`
//! timestamps meaningful), output goes through a pair of lock-free
//! ringbuffers drained by the process callback, exactly one message per
//! reserve.

use jack_sys::{
    jack_activate, jack_client_close, jack_client_open, jack_client_t, jack_connect,
    jack_deactivate, jack_frames_to_time, jack_free, jack_get_ports, jack_last_frame_time,
    jack_midi_clear_buffer, jack_midi_event_get, jack_midi_event_reserve, jack_midi_event_t,
    jack_midi_get_event_count, jack_nframes_t, jack_port_by_name, jack_port_name,
    jack_port_register, jack_port_t, jack_port_unregister, jack_ringbuffer_create,
    jack_ringbuffer_free, jack_ringbuffer_read, jack_ringbuffer_read_space,
    jack_ringbuffer_t, jack_ringbuffer_write, jack_ringbuffer_write_space,
    jack_set_process_callback,
};
use libc::{c_char, c_void};

use std::ffi::{CStr, CString};
use std::hash::{Hash, Hasher};
use std::mem;
use std::ptr;
use std::slice;

use crate::api::Api;
use crate::backend::{InputBackend, ObserverBackend, OutputBackend};
use crate::config::{InputCallback, InputConfig, JackConfig, ObserverConfig, OutputConfig};
use crate::decoder::MidiStreamDecoder;
use crate::errors::{Error, ErrorDomain};
use crate::port::{InputPort, OutputPort, PortInfo, TransportKind};
use crate::timestamp::TimestampInfo;

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: true };

// Options and port flags from <jack/types.h>; jack-sys is generated
// bindings and spells these inconveniently.
const JACK_NO_START_SERVER: u32 = 0x01;

bitflags::bitflags! {
    #[derive(Clone, Copy)]
    struct PortFlags: u64 {
        const IS_INPUT = 0x1;
        const IS_OUTPUT = 0x2;
        const IS_PHYSICAL = 0x4;
    }
}

const MIDI_TYPE: &CStr = c"8 bit raw midi";
const OUTPUT_RINGBUFFER_SIZE: usize = 16384;

/// Handles are keyed on the (stable, unique) full port name.
fn handle_for_name(name: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

/// Thin owner of a `jack_client_t`.
struct Client {
    ptr: *mut jack_client_t,
}

unsafe impl Send for Client {}

impl Client {
    fn open(name: &str) -> Result<Client, Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::invalid_argument("jack: client name contains a nul byte"))?;
        let mut status = 0;
        let ptr = unsafe { jack_client_open(c_name.as_ptr(), JACK_NO_START_SERVER, &mut status) };
        if ptr.is_null() {
            return Err(Error::with_code(
                crate::errors::ErrorCategory::NotConnected,
                ErrorDomain::Jack,
                status as i32,
                "jack: cannot open client (is the server running?)",
            ));
        }
        Ok(Client { ptr })
    }

    fn register_port(&self, name: &str, flags: PortFlags) -> Result<*mut jack_port_t, Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::invalid_argument("jack: port name contains a nul byte"))?;
        let port = unsafe {
            jack_port_register(self.ptr, c_name.as_ptr(), MIDI_TYPE.as_ptr(), flags.bits(), 0)
        };
        if port.is_null() {
            Err(Error::io("jack: cannot register port"))
        } else {
            Ok(port)
        }
    }

    /// Lists the full names of all MIDI ports matching `flags`.
    fn midi_port_names(&self, flags: PortFlags) -> Vec<String> {
        let mut names = Vec::new();
        let list = unsafe {
            jack_get_ports(self.ptr, ptr::null(), MIDI_TYPE.as_ptr(), flags.bits())
        };
        if list.is_null() {
            return names;
        }
        let mut entry = list;
        unsafe {
            while !(*entry).is_null() {
                names.push(CStr::from_ptr(*entry).to_string_lossy().into_owned());
                entry = entry.offset(1);
            }
            jack_free(list as *mut c_void);
        }
        names
    }

    fn port_is_physical(&self, name: &str) -> bool {
        let c_name = match CString::new(name) {
            Ok(n) => n,
            Err(_) => return false,
        };
        let port = unsafe { jack_port_by_name(self.ptr, c_name.as_ptr()) };
        if port.is_null() {
            return false;
        }
        let flags = unsafe { jack_sys::jack_port_flags(port) } as u64;
        PortFlags::from_bits_truncate(flags).contains(PortFlags::IS_PHYSICAL)
    }

    fn connect_ports(&self, source: &str, destination: &str) -> Result<(), Error> {
        let c_src = CString::new(source)
            .map_err(|_| Error::invalid_argument("jack: port name contains a nul byte"))?;
        let c_dst = CString::new(destination)
            .map_err(|_| Error::invalid_argument("jack: port name contains a nul byte"))?;
        let rc = unsafe { jack_connect(self.ptr, c_src.as_ptr(), c_dst.as_ptr()) };
        // EEXIST means the wires were already up, which is fine.
        if rc != 0 && rc != libc::EEXIST {
            return Err(Error::with_code(
                crate::errors::ErrorCategory::AddressNotAvailable,
                ErrorDomain::Jack,
                rc,
                "jack: cannot connect ports",
            ));
        }
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        unsafe { jack_client_close(self.ptr) };
    }
}

struct InputHandlerData {
    port: *mut jack_port_t,
    client: *mut jack_client_t,
    decoder: MidiStreamDecoder,
}

unsafe impl Send for InputHandlerData {}

extern "C" fn handle_input(nframes: jack_nframes_t, arg: *mut c_void) -> i32 {
    let data = unsafe { &mut *(arg as *mut InputHandlerData) };
    if data.port.is_null() {
        return 0;
    }
    unsafe {
        let buffer = jack_sys::jack_port_get_buffer(data.port, nframes);
        let count = jack_midi_get_event_count(buffer);
        let cycle_start = jack_last_frame_time(data.client);
        let mut event: jack_midi_event_t = mem::zeroed();
        for index in 0..count {
            if jack_midi_event_get(&mut event, buffer, index) != 0 {
                continue;
            }
            let bytes = slice::from_raw_parts(event.buffer, event.size);
            let absolute_us = jack_frames_to_time(data.client, cycle_start + event.time);
            data.decoder.add_bytes(bytes, Some(absolute_us as i64 * 1_000), event.time as i64);
        }
    }
    0
}

pub struct JackInput {
    client: Option<Client>,
    handler: Option<Box<InputHandlerData>>,
    port_open: bool,
}

impl JackInput {
    pub fn new(config: InputConfig, api: JackConfig) -> Result<JackInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("jack: the MIDI transport speaks byte streams"),
                config,
            ));
        }
        let client = match Client::open(&api.client_name) {
            Ok(c) => c,
            Err(e) => return Err((e, config)),
        };
        let InputConfig { callback, get_timestamp, on_error: _, on_warning: _, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder = MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS);
        let handler =
            Box::new(InputHandlerData { port: ptr::null_mut(), client: client.ptr, decoder });
        Ok(JackInput { client: Some(client), handler: Some(handler), port_open: false })
    }

    fn activate(&mut self, local_name: &str, source: Option<&str>) -> Result<(), Error> {
        let client = self.client.as_ref().expect("client is open");
        let handler = self.handler.as_mut().expect("handler exists while closed");
        let handler_ptr: *mut InputHandlerData = &mut **handler;

        unsafe {
            jack_set_process_callback(client.ptr, Some(handle_input), handler_ptr as *mut c_void);
            if jack_activate(client.ptr) != 0 {
                return Err(Error::io("jack: cannot activate client"));
            }
        }
        let port = match client.register_port(local_name, PortFlags::IS_INPUT) {
            Ok(p) => p,
            Err(e) => {
                unsafe { jack_deactivate(client.ptr) };
                return Err(e);
            }
        };
        if let Some(source) = source {
            let our_name =
                unsafe { CStr::from_ptr(jack_port_name(port)).to_string_lossy().into_owned() };
            if let Err(e) = client.connect_ports(source, &our_name) {
                unsafe {
                    jack_deactivate(client.ptr);
                    jack_port_unregister(client.ptr, port);
                }
                return Err(e);
            }
        }
        handler.port = port;
        self.port_open = true;
        Ok(())
    }
}

impl InputBackend for JackInput {
    fn api(&self) -> Api {
        Api::JackMidi
    }

    fn open_port(&mut self, port: &InputPort, local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::JackMidi) {
            return Err(Error::invalid_argument("jack: port belongs to another API"));
        }
        let source = port.port_name.clone();
        self.activate(local_name, Some(&source))
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.activate(name, None)
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if !self.port_open {
            return Ok(());
        }
        let client = self.client.as_ref().expect("client is open");
        let handler = self.handler.as_mut().expect("handler exists");
        unsafe {
            // Deactivation blocks until the process callback has
            // returned, after which the handler is ours again.
            jack_deactivate(client.ptr);
            if !handler.port.is_null() {
                jack_port_unregister(client.ptr, handler.port);
                handler.port = ptr::null_mut();
            }
        }
        self.port_open = false;
        Ok(())
    }
}

impl Drop for JackInput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

struct OutputHandlerData {
    port: *mut jack_port_t,
    size_buffer: *mut jack_ringbuffer_t,
    message_buffer: *mut jack_ringbuffer_t,
}

unsafe impl Send for OutputHandlerData {}

extern "C" fn handle_output(nframes: jack_nframes_t, arg: *mut c_void) -> i32 {
    let data = unsafe { &mut *(arg as *mut OutputHandlerData) };
    if data.port.is_null() {
        return 0;
    }
    unsafe {
        let buffer = jack_sys::jack_port_get_buffer(data.port, nframes);
        jack_midi_clear_buffer(buffer);

        while jack_ringbuffer_read_space(data.size_buffer) >= mem::size_of::<usize>() {
            let mut size: usize = 0;
            jack_ringbuffer_read(
                data.size_buffer,
                &mut size as *mut usize as *mut c_char,
                mem::size_of::<usize>(),
            );
            let slot = jack_midi_event_reserve(buffer, 0, size);
            if slot.is_null() {
                // The cycle buffer is full; drop the message to keep the
                // two rings in sync.
                let mut sink = [0u8; 4];
                let mut remaining = size;
                while remaining > 0 {
                    let step = remaining.min(sink.len());
                    jack_ringbuffer_read(
                        data.message_buffer,
                        sink.as_mut_ptr() as *mut c_char,
                        step,
                    );
                    remaining -= step;
                }
                continue;
            }
            jack_ringbuffer_read(data.message_buffer, slot as *mut c_char, size);
        }
    }
    0
}

pub struct JackOutput {
    client: Option<Client>,
    handler: Option<Box<OutputHandlerData>>,
    port_open: bool,
}

impl JackOutput {
    pub fn new(config: OutputConfig, api: JackConfig) -> Result<JackOutput, (Error, OutputConfig)> {
        let client = match Client::open(&api.client_name) {
            Ok(c) => c,
            Err(e) => return Err((e, config)),
        };
        let (size_buffer, message_buffer) = unsafe {
            (
                jack_ringbuffer_create(OUTPUT_RINGBUFFER_SIZE),
                jack_ringbuffer_create(OUTPUT_RINGBUFFER_SIZE),
            )
        };
        if size_buffer.is_null() || message_buffer.is_null() {
            return Err((Error::new(
                crate::errors::ErrorCategory::NotEnoughMemory,
                "jack: cannot allocate output ringbuffers",
            ), config));
        }
        let handler = Box::new(OutputHandlerData {
            port: ptr::null_mut(),
            size_buffer,
            message_buffer,
        });
        Ok(JackOutput { client: Some(client), handler: Some(handler), port_open: false })
    }

    fn activate(&mut self, local_name: &str, destination: Option<&str>) -> Result<(), Error> {
        let client = self.client.as_ref().expect("client is open");
        let handler = self.handler.as_mut().expect("handler exists");
        let handler_ptr: *mut OutputHandlerData = &mut **handler;

        unsafe {
            jack_set_process_callback(client.ptr, Some(handle_output), handler_ptr as *mut c_void);
            if jack_activate(client.ptr) != 0 {
                return Err(Error::io("jack: cannot activate client"));
            }
        }
        let port = match client.register_port(local_name, PortFlags::IS_OUTPUT) {
            Ok(p) => p,
            Err(e) => {
                unsafe { jack_deactivate(client.ptr) };
                return Err(e);
            }
        };
        if let Some(destination) = destination {
            let our_name =
                unsafe { CStr::from_ptr(jack_port_name(port)).to_string_lossy().into_owned() };
            if let Err(e) = client.connect_ports(&our_name, destination) {
                unsafe {
                    jack_deactivate(client.ptr);
                    jack_port_unregister(client.ptr, port);
                }
                return Err(e);
            }
        }
        handler.port = port;
        self.port_open = true;
        Ok(())
    }
}

impl OutputBackend for JackOutput {
    fn api(&self) -> Api {
        Api::JackMidi
    }

    fn open_port(&mut self, port: &OutputPort, local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::JackMidi) {
            return Err(Error::invalid_argument("jack: port belongs to another API"));
        }
        let destination = port.port_name.clone();
        self.activate(local_name, Some(&destination))
    }

    fn open_virtual_port(&mut self, name: &str) -> Result<(), Error> {
        self.activate(name, None)
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if !self.port_open {
            return Ok(());
        }
        let client = self.client.as_ref().expect("client is open");
        let handler = self.handler.as_mut().expect("handler exists");
        unsafe {
            jack_deactivate(client.ptr);
            if !handler.port.is_null() {
                jack_port_unregister(client.ptr, handler.port);
                handler.port = ptr::null_mut();
            }
        }
        self.port_open = false;
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let handler = self.handler.as_mut().expect("handler exists");
        let size = message.len();
        unsafe {
            if jack_ringbuffer_write_space(handler.message_buffer) < size
                || jack_ringbuffer_write_space(handler.size_buffer) < mem::size_of::<usize>()
            {
                return Err(Error::message_size("jack: output ringbuffer is full"));
            }
            jack_ringbuffer_write(
                handler.message_buffer,
                message.as_ptr() as *const c_char,
                size,
            );
            jack_ringbuffer_write(
                handler.size_buffer,
                &size as *const usize as *const c_char,
                mem::size_of::<usize>(),
            );
        }
        Ok(())
    }
}

impl Drop for JackOutput {
    fn drop(&mut self) {
        let _ = self.close_port();
        if let Some(handler) = self.handler.take() {
            unsafe {
                jack_ringbuffer_free(handler.size_buffer);
                jack_ringbuffer_free(handler.message_buffer);
            }
        }
    }
}

/// Snapshot enumeration over a passive client. JACK's own port
/// registration callbacks need an active client; hooking them up is
/// left to the graph application, so this observer only enumerates.
pub struct JackObserver {
    client: Client,
}

impl JackObserver {
    pub fn new(config: ObserverConfig, api: JackConfig) -> Result<JackObserver, (Error, ObserverConfig)> {
        let client = match Client::open(&format!("{} observer", api.client_name)) {
            Ok(c) => c,
            Err(e) => return Err((e, config)),
        };
        Ok(JackObserver { client })
    }

    fn ports(&self, flags: PortFlags) -> Vec<PortInfo> {
        self.client
            .midi_port_names(flags)
            .into_iter()
            .map(|name| {
                let kind = if self.client.port_is_physical(&name) {
                    TransportKind::Hardware
                } else {
                    TransportKind::Software
                };
                PortInfo {
                    api: Some(Api::JackMidi),
                    client: 0,
                    port: handle_for_name(&name),
                    manufacturer: String::new(),
                    device_name: name.split(':').next().unwrap_or("").to_string(),
                    port_name: name.clone(),
                    display_name: name,
                    kind,
                }
            })
            .collect()
    }
}

impl ObserverBackend for JackObserver {
    fn api(&self) -> Api {
        Api::JackMidi
    }

    /// Ports we can read from are JACK *output* ports.
    fn input_ports(&self) -> Vec<InputPort> {
        self.ports(PortFlags::IS_OUTPUT).into_iter().map(InputPort).collect()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        self.ports(PortFlags::IS_INPUT).into_iter().map(OutputPort).collect()
    }
}
