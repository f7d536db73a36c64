//! Windows Multimedia backend. Devices are addressed by index; SysEx
//! input goes through a rotating set of pre-registered buffers; there is
//! no notion of virtual ports on this transport.

use std::mem;
use std::ptr;
use std::slice;

use parking_lot::Mutex;
use windows::Win32::Media::Audio::{
    midiInAddBuffer, midiInClose, midiInGetDevCapsW, midiInGetNumDevs, midiInOpen,
    midiInPrepareHeader, midiInReset, midiInStart, midiInStop, midiInUnprepareHeader,
    midiOutClose, midiOutGetDevCapsW, midiOutGetNumDevs, midiOutLongMsg, midiOutOpen,
    midiOutPrepareHeader, midiOutReset, midiOutShortMsg, midiOutUnprepareHeader,
    CALLBACK_FUNCTION, CALLBACK_NULL, HMIDIIN, HMIDIOUT, MIDIHDR, MIDIINCAPSW, MIDIOUTCAPSW,
    MIM_DATA, MIM_LONGDATA,
};

use crate::api::Api;
use crate::backend::{InputBackend, ObserverBackend, OutputBackend};
use crate::config::{InputCallback, InputConfig, ObserverConfig, OutputConfig, WinMmConfig};
use crate::decoder::MidiStreamDecoder;
use crate::errors::{Error, ErrorCategory, ErrorDomain};
use crate::message::fixed_message_length;
use crate::port::{InputPort, OutputPort, PortInfo, TransportKind};
use crate::timestamp::TimestampInfo;

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: false };

const SYSEX_BUFFER_SIZE: usize = 1024;
const SYSEX_BUFFER_COUNT: usize = 4;
const MMSYSERR_NOERROR: u32 = 0;
const MMSYSERR_BADDEVICEID: u32 = 2;
const MIDIERR_NOTREADY: u32 = 67;
const MIDIERR_STILLPLAYING: u32 = 65;

fn mm_err(code: u32, context: &'static str) -> Error {
    Error::with_code(ErrorCategory::Io, ErrorDomain::WinMm, code as i32, context)
}

fn from_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}

fn input_device_name(index: u32) -> Option<String> {
    let mut caps: MIDIINCAPSW = unsafe { mem::zeroed() };
    let result =
        unsafe { midiInGetDevCapsW(index as usize, &mut caps, mem::size_of::<MIDIINCAPSW>() as u32) };
    (result == MMSYSERR_NOERROR).then(|| from_wide(&caps.szPname))
}

fn output_device_name(index: u32) -> Option<String> {
    let mut caps: MIDIOUTCAPSW = unsafe { mem::zeroed() };
    let result = unsafe {
        midiOutGetDevCapsW(index as usize, &mut caps, mem::size_of::<MIDIOUTCAPSW>() as u32)
    };
    (result == MMSYSERR_NOERROR).then(|| from_wide(&caps.szPname))
}

fn port_info(api_index: u32, name: String) -> PortInfo {
    PortInfo {
        api: Some(Api::WindowsMm),
        client: 0,
        // The device index is the only identity WinMM has.
        port: api_index as u64,
        manufacturer: String::new(),
        device_name: name.clone(),
        port_name: name.clone(),
        display_name: name,
        kind: TransportKind::Unknown,
    }
}

struct HandlerData {
    decoder: MidiStreamDecoder,
    sysex_headers: [*mut MIDIHDR; SYSEX_BUFFER_COUNT],
    in_handle: Option<Mutex<HMIDIIN>>,
}

unsafe impl Send for HandlerData {}

/// Callback invoked by WinMM on its own thread. `dwparam2` is
/// milliseconds since `midiInStart`.
extern "system" fn handle_input(
    _hmidiin: HMIDIIN,
    wmsg: u32,
    dwinstance: usize,
    dwparam1: usize,
    dwparam2: usize,
) {
    let data = unsafe { &mut *(dwinstance as *mut HandlerData) };
    let timestamp = Some(dwparam2 as i64 * 1_000_000);
    match wmsg {
        MIM_DATA => {
            let packet = (dwparam1 as u32).to_le_bytes();
            let status = packet[0];
            let len = fixed_message_length(status).unwrap_or(3).min(3);
            data.decoder.add_bytes(&packet[..len], timestamp, 0);
        }
        MIM_LONGDATA => {
            let header = dwparam1 as *mut MIDIHDR;
            let recorded = unsafe { (*header).dwBytesRecorded } as usize;
            if recorded > 0 {
                let bytes =
                    unsafe { slice::from_raw_parts((*header).lpData.0 as *const u8, recorded) };
                data.decoder.add_bytes(bytes, timestamp, 0);
            }
            // Hand the buffer back unless the device is closing.
            if let Some(handle) = &data.in_handle {
                let handle = handle.lock();
                unsafe {
                    midiInAddBuffer(*handle, header, mem::size_of::<MIDIHDR>() as u32);
                }
            }
        }
        _ => {}
    }
}

pub struct WinMmInput {
    handler: Option<Box<HandlerData>>,
}

impl WinMmInput {
    pub fn new(config: InputConfig, _api: WinMmConfig) -> Result<WinMmInput, (Error, InputConfig)> {
        if !matches!(config.callback, InputCallback::Midi1(_)) {
            return Err((
                Error::invalid_argument("winmm: the multimedia API speaks MIDI 1 byte streams"),
                config,
            ));
        }
        let InputConfig { callback, get_timestamp, on_error: _, on_warning: _, ignore, timestamps } =
            config;
        let cb = match callback {
            InputCallback::Midi1(cb) => cb,
            InputCallback::Ump(_) => unreachable!(),
        };
        let decoder = MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS);
        Ok(WinMmInput {
            handler: Some(Box::new(HandlerData {
                decoder,
                sysex_headers: [ptr::null_mut(); SYSEX_BUFFER_COUNT],
                in_handle: None,
            })),
        })
    }
}

impl InputBackend for WinMmInput {
    fn api(&self) -> Api {
        Api::WindowsMm
    }

    fn open_port(&mut self, port: &InputPort, _local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::WindowsMm) {
            return Err(Error::invalid_argument("winmm: port belongs to another API"));
        }
        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| Error::invalid_argument("winmm: port already open"))?;
        if handler.in_handle.is_some() {
            return Err(Error::invalid_argument("winmm: port already open"));
        }
        let handler_ptr: *mut HandlerData = &mut **handler;

        let mut in_handle = HMIDIIN::default();
        let result = unsafe {
            midiInOpen(
                &mut in_handle,
                port.port as u32,
                handle_input as usize,
                handler_ptr as usize,
                CALLBACK_FUNCTION,
            )
        };
        if result == MMSYSERR_BADDEVICEID {
            return Err(Error::address_not_available("winmm: no such input device"));
        } else if result != MMSYSERR_NOERROR {
            return Err(mm_err(result, "winmm: cannot open input device"));
        }

        // Register the rotating SysEx buffers.
        for slot in handler.sysex_headers.iter_mut() {
            let buffer = vec![0u8; SYSEX_BUFFER_SIZE].into_boxed_slice();
            let header = Box::into_raw(Box::new(MIDIHDR {
                lpData: windows::core::PSTR(Box::into_raw(buffer) as *mut u8),
                dwBufferLength: SYSEX_BUFFER_SIZE as u32,
                ..unsafe { mem::zeroed() }
            }));
            let result =
                unsafe { midiInPrepareHeader(in_handle, header, mem::size_of::<MIDIHDR>() as u32) };
            if result != MMSYSERR_NOERROR {
                unsafe { midiInClose(in_handle) };
                return Err(mm_err(result, "winmm: cannot prepare sysex buffer"));
            }
            let result =
                unsafe { midiInAddBuffer(in_handle, header, mem::size_of::<MIDIHDR>() as u32) };
            if result != MMSYSERR_NOERROR {
                unsafe { midiInClose(in_handle) };
                return Err(mm_err(result, "winmm: cannot register sysex buffer"));
            }
            *slot = header;
        }

        handler.in_handle = Some(Mutex::new(in_handle));
        let result = unsafe { midiInStart(in_handle) };
        if result != MMSYSERR_NOERROR {
            unsafe { midiInClose(in_handle) };
            handler.in_handle = None;
            return Err(mm_err(result, "winmm: cannot start input"));
        }
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        let handler = match self.handler.as_mut() {
            Some(h) => h,
            None => return Ok(()),
        };
        let in_handle = match handler.in_handle.take() {
            Some(h) => h,
            None => return Ok(()),
        };
        // Holding the lock here blocks out a concurrently running
        // MIM_LONGDATA callback until it has returned.
        let in_handle = in_handle.lock();
        unsafe {
            midiInReset(*in_handle);
            midiInStop(*in_handle);
        }
        for header in handler.sysex_headers.iter_mut() {
            if header.is_null() {
                continue;
            }
            unsafe {
                midiInUnprepareHeader(*in_handle, *header, mem::size_of::<MIDIHDR>() as u32);
                let boxed = Box::from_raw(*header);
                drop(Box::from_raw(slice::from_raw_parts_mut(
                    boxed.lpData.0,
                    SYSEX_BUFFER_SIZE,
                )));
            }
            *header = ptr::null_mut();
        }
        unsafe { midiInClose(*in_handle) };
        Ok(())
    }
}

impl Drop for WinMmInput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

pub struct WinMmOutput {
    out_handle: Option<HMIDIOUT>,
}

unsafe impl Send for WinMmOutput {}

impl WinMmOutput {
    pub fn new(_config: OutputConfig, _api: WinMmConfig) -> Result<WinMmOutput, (Error, OutputConfig)> {
        Ok(WinMmOutput { out_handle: None })
    }
}

impl OutputBackend for WinMmOutput {
    fn api(&self) -> Api {
        Api::WindowsMm
    }

    fn open_port(&mut self, port: &OutputPort, _local_name: &str) -> Result<(), Error> {
        if port.api.is_some() && port.api != Some(Api::WindowsMm) {
            return Err(Error::invalid_argument("winmm: port belongs to another API"));
        }
        let mut out_handle = HMIDIOUT::default();
        let result = unsafe {
            midiOutOpen(&mut out_handle, port.port as u32, 0, 0, CALLBACK_NULL)
        };
        if result == MMSYSERR_BADDEVICEID {
            return Err(Error::address_not_available("winmm: no such output device"));
        } else if result != MMSYSERR_NOERROR {
            return Err(mm_err(result, "winmm: cannot open output device"));
        }
        self.out_handle = Some(out_handle);
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        if let Some(handle) = self.out_handle.take() {
            unsafe {
                midiOutReset(handle);
                midiOutClose(handle);
            }
        }
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        let handle = self
            .out_handle
            .ok_or_else(|| Error::not_connected("winmm: no open device"))?;

        if message[0] == 0xF0 {
            // SysEx goes through a prepared header.
            let mut buffer = message.to_vec();
            let mut header = MIDIHDR {
                lpData: windows::core::PSTR(buffer.as_mut_ptr()),
                dwBufferLength: buffer.len() as u32,
                ..unsafe { mem::zeroed() }
            };
            let result = unsafe {
                midiOutPrepareHeader(handle, &mut header, mem::size_of::<MIDIHDR>() as u32)
            };
            if result != MMSYSERR_NOERROR {
                return Err(mm_err(result, "winmm: cannot prepare sysex send"));
            }
            loop {
                let result = unsafe {
                    midiOutLongMsg(handle, &mut header, mem::size_of::<MIDIHDR>() as u32)
                };
                if result == MIDIERR_NOTREADY {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                if result != MMSYSERR_NOERROR {
                    return Err(mm_err(result, "winmm: sysex send failed"));
                }
                break;
            }
            loop {
                let result = unsafe {
                    midiOutUnprepareHeader(handle, &mut header, mem::size_of::<MIDIHDR>() as u32)
                };
                if result == MIDIERR_STILLPLAYING {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                break;
            }
            Ok(())
        } else {
            if message.len() > 3 {
                return Err(Error::message_size(
                    "winmm: non-sysex messages carry at most three bytes",
                ));
            }
            let mut packet = [0u8; 4];
            packet[..message.len()].copy_from_slice(message);
            let word = u32::from_le_bytes(packet);
            loop {
                let result = unsafe { midiOutShortMsg(handle, word) };
                if result == MIDIERR_NOTREADY {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    continue;
                }
                if result != MMSYSERR_NOERROR {
                    return Err(mm_err(result, "winmm: send failed"));
                }
                return Ok(());
            }
        }
    }
}

impl Drop for WinMmOutput {
    fn drop(&mut self) {
        let _ = self.close_port();
    }
}

/// Device-index enumeration. WinMM has no hotplug notification of its
/// own (that arrived with UWP and Windows MIDI Services).
pub struct WinMmObserver;

impl WinMmObserver {
    pub fn new(
        mut config: ObserverConfig,
        _api: WinMmConfig,
    ) -> Result<WinMmObserver, (Error, ObserverConfig)> {
        if config.wants_notifications() {
            crate::backend::report_warning(
                &mut config.on_warning,
                "winmm: hotplug callbacks configured but this backend only enumerates",
            );
        }
        Ok(WinMmObserver)
    }
}

impl ObserverBackend for WinMmObserver {
    fn api(&self) -> Api {
        Api::WindowsMm
    }

    fn input_ports(&self) -> Vec<InputPort> {
        let count = unsafe { midiInGetNumDevs() };
        (0..count)
            .filter_map(|i| input_device_name(i).map(|name| InputPort(port_info(i, name))))
            .collect()
    }

    fn output_ports(&self) -> Vec<OutputPort> {
        let count = unsafe { midiOutGetNumDevs() };
        (0..count)
            .filter_map(|i| output_device_name(i).map(|name| OutputPort(port_info(i, name))))
            .collect()
    }
}
