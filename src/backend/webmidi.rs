//! Web MIDI backend (wasm32 in a browser).
//!
//! Reference:
//! * [W3C Editor's Draft](https://webaudio.github.io/web-midi-api/)
//! * [MDN web docs](https://developer.mozilla.org/en-US/docs/Web/API/MIDIAccess)
//!
//! Access is requested once per page through a thread-local singleton;
//! everything here runs on the browser's main thread.

use js_sys::{Map, Promise, Uint8Array};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{MidiAccess, MidiMessageEvent, MidiOptions};

use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::api::Api;
use crate::backend::{InputBackend, ObserverBackend, OutputBackend};
use crate::config::{InputCallback, InputConfig, ObserverConfig, OutputConfig, WebMidiConfig};
use crate::decoder::MidiStreamDecoder;
use crate::errors::Error;
use crate::port::{InputPort, OutputPort, PortInfo, TransportKind};
use crate::timestamp::TimestampInfo;

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: false };

thread_local! {
    static STATIC: RefCell<Static> = RefCell::new(Static::new());
}

struct Static {
    access: Option<MidiAccess>,
    request: Option<Promise>,

    on_ok: Closure<dyn FnMut(JsValue)>,
    on_err: Closure<dyn FnMut(JsValue)>,
}

impl Static {
    fn new() -> Self {
        let mut s = Self {
            access: None,
            request: None,
            on_ok: Closure::wrap(Box::new(|access| {
                STATIC.with(|s| {
                    let mut s = s.borrow_mut();
                    let access: MidiAccess = access.dyn_into().unwrap();
                    s.request = None;
                    s.access = Some(access);
                });
            })),
            on_err: Closure::wrap(Box::new(|_error| {
                STATIC.with(|s| {
                    s.borrow_mut().request = None;
                });
            })),
        };
        // Requesting sysex=true is compatible with more devices and
        // matches how browsers prompt for permission.
        s.request_midi_access(true);
        s
    }

    fn request_midi_access(&mut self, sysex: bool) {
        if self.access.is_some() || self.request.is_some() {
            return;
        }
        let window = match web_sys::window() {
            Some(w) => w,
            None => return,
        };
        match window
            .navigator()
            .request_midi_access_with_options(MidiOptions::new().sysex(sysex))
        {
            Ok(p) => {
                self.request = Some(p.then2(&self.on_ok, &self.on_err));
            }
            Err(_) => {} // not a browser, or Web MIDI unavailable
        }
    }
}

/// Port identifiers are browser-assigned strings; the portable handle is
/// their hash.
fn handle_for_id(id: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

fn with_access<R>(f: impl FnOnce(&MidiAccess) -> R) -> Option<R> {
    STATIC.with(|s| s.borrow().access.as_ref().map(f))
}

fn find_input(handle: u64) -> Option<web_sys::MidiInput> {
    with_access(|access| {
        let inputs: Map = access.inputs().unchecked_into();
        let mut found = None;
        inputs.for_each(&mut |value, _| {
            let input: web_sys::MidiInput = value.dyn_into().unwrap();
            if handle_for_id(&input.id()) == handle {
                found = Some(input);
            }
        });
        found
    })
    .flatten()
}

fn find_output(handle: u64) -> Option<web_sys::MidiOutput> {
    with_access(|access| {
        let outputs: Map = access.outputs().unchecked_into();
        let mut found = None;
        outputs.for_each(&mut |value, _| {
            let output: web_sys::MidiOutput = value.dyn_into().unwrap();
            if handle_for_id(&output.id()) == handle {
                found = Some(output);
            }
        });
        found
    })
    .flatten()
}

fn browser_port_info(id: String, name: Option<String>) -> PortInfo {
    let name = name.unwrap_or_else(|| id.clone());
    PortInfo {
        api: Some(Api::WebMidi),
        client: 0,
        port: handle_for_id(&id),
        manufacturer: String::new(),
        device_name: String::new(),
        port_name: name.clone(),
        display_name: name,
        kind: TransportKind::Unknown,
    }
}

pub struct WebMidiInput {
    decoder: Option<Rc<RefCell<MidiStreamDecoder>>>,
    connection: Option<(web_sys::MidiInput, Closure<dyn FnMut(MidiMessageEvent)>)>,
}

impl WebMidiInput {
    pub fn new(config: InputConfig, _api: WebMidiConfig) -> Result<WebMidiInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("webmidi: the browser API speaks MIDI 1 byte streams"),
                config,
            ));
        }
        STATIC.with(|_| {});
        let InputConfig { callback, get_timestamp, on_error: _, on_warning: _, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder = MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS);
        Ok(WebMidiInput { decoder: Some(Rc::new(RefCell::new(decoder))), connection: None })
    }
}

impl InputBackend for WebMidiInput {
    fn api(&self) -> Api {
        Api::WebMidi
    }

    fn open_port(&mut self, port: &InputPort, _local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::WebMidi) {
            return Err(Error::invalid_argument("webmidi: port belongs to another API"));
        }
        let input = find_input(port.port).ok_or_else(|| {
            Error::address_not_available("webmidi: no such input (was access granted?)")
        })?;
        let decoder = self
            .decoder
            .clone()
            .ok_or_else(|| Error::invalid_argument("webmidi: port already open"))?;
        let _ = input.open(); // asynchronous

        let closure = Closure::wrap(Box::new(move |event: MidiMessageEvent| {
            // DOMHighResTimeStamp is milliseconds with fractions.
            let nanos = (event.time_stamp() * 1_000_000.0) as i64;
            if let Some(buffer) = event.data().ok() {
                decoder.borrow_mut().add_bytes(&buffer, Some(nanos), 0);
            }
        }) as Box<dyn FnMut(MidiMessageEvent)>);
        input.set_onmidimessage(Some(closure.as_ref().unchecked_ref()));
        self.connection = Some((input, closure));
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let Some((input, _closure)) = self.connection.take() {
            input.set_onmidimessage(None);
            let _ = input.close(); // asynchronous
        }
        Ok(())
    }
}

pub struct WebMidiOutput {
    output: Option<web_sys::MidiOutput>,
}

impl WebMidiOutput {
    pub fn new(_config: OutputConfig, _api: WebMidiConfig) -> Result<WebMidiOutput, (Error, OutputConfig)> {
        STATIC.with(|_| {});
        Ok(WebMidiOutput { output: None })
    }
}

impl OutputBackend for WebMidiOutput {
    fn api(&self) -> Api {
        Api::WebMidi
    }

    fn open_port(&mut self, port: &OutputPort, _local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::WebMidi) {
            return Err(Error::invalid_argument("webmidi: port belongs to another API"));
        }
        let output = find_output(port.port).ok_or_else(|| {
            Error::address_not_available("webmidi: no such output (was access granted?)")
        })?;
        let _ = output.open(); // asynchronous
        self.output = Some(output);
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let Some(output) = self.output.take() {
            let _ = output.close(); // asynchronous
        }
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let output =
            self.output.as_ref().ok_or_else(|| Error::not_connected("webmidi: no open port"))?;
        output
            .send(unsafe { Uint8Array::view(message) }.as_ref())
            .map_err(|_| Error::io("webmidi: JavaScript exception while sending"))
    }
}

pub struct WebMidiObserver;

impl WebMidiObserver {
    pub fn new(
        _config: ObserverConfig,
        _api: WebMidiConfig,
    ) -> Result<WebMidiObserver, (Error, ObserverConfig)> {
        STATIC.with(|_| {});
        Ok(WebMidiObserver)
    }
}

impl ObserverBackend for WebMidiObserver {
    fn api(&self) -> Api {
        Api::WebMidi
    }

    fn input_ports(&self) -> Vec<InputPort> {
        with_access(|access| {
            let mut v = Vec::new();
            let inputs: Map = access.inputs().unchecked_into();
            inputs.for_each(&mut |value, _| {
                let input: web_sys::MidiInput = value.dyn_into().unwrap();
                v.push(InputPort(browser_port_info(input.id(), input.name())));
            });
            v
        })
        .unwrap_or_default()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        with_access(|access| {
            let mut v = Vec::new();
            let outputs: Map = access.outputs().unchecked_into();
            outputs.for_each(&mut |value, _| {
                let output: web_sys::MidiOutput = value.dyn_into().unwrap();
                v.push(OutputPort(browser_port_info(output.id(), output.name())));
            });
            v
        })
        .unwrap_or_default()
    }
}
