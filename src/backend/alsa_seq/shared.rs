//! Process-wide sequencer client shared between connections.
//!
//! One process thread owns the client and multiplexes every registered
//! connection over it. Registration and teardown travel through a
//! bounded SPSC queue drained between poll cycles; the process thread is
//! the only mutator of the registration table and holds no lock while
//! invoking user callbacks.

use std::collections::HashMap;
use std::ffi::CString;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread::JoinHandle;

use alsa::seq::{Addr, EventType, MidiEvent, PortCap, PortSubscribe, PortType};
use alsa::{Direction, PollDescriptors, Seq};

use super::{poll, Trigger};
use crate::decoder::MidiStreamDecoder;
use crate::errors::Error;
use crate::spsc;

/// Commands clients hand to the process thread.
enum Command {
    Connect { id: u64, source: Addr, decoder: Box<MidiStreamDecoder> },
    Disconnect { id: u64, reply: mpsc::Sender<Box<MidiStreamDecoder>> },
    Terminate,
}

/// How many registration commands may be in flight at once.
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// A single sequencer client shared by any number of input connections.
///
/// Create one with [`SharedSeqContext::new`] and hand clones of the
/// `Arc` to [`crate::AlsaSeqConfig::context`]; inputs opened with it are
/// all serviced by this context's process thread instead of spawning
/// their own.
pub struct SharedSeqContext {
    commands: Mutex<spsc::Producer<Command>>,
    trigger: Trigger,
    thread: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl SharedSeqContext {
    pub fn new(client_name: &str) -> Result<std::sync::Arc<SharedSeqContext>, Error> {
        let seq = Seq::open(None, None, true)?;
        let c_name = CString::new(client_name)
            .map_err(|_| Error::invalid_argument("alsa_seq: client name contains a nul byte"))?;
        seq.set_client_name(&c_name)?;

        // One local port receives every subscribed source.
        let vport = seq.create_simple_port(
            c"unimidi shared input",
            PortCap::WRITE | PortCap::SUBS_WRITE,
            PortType::MIDI_GENERIC | PortType::APPLICATION,
        )?;

        let (tx, rx) = spsc::channel(COMMAND_QUEUE_CAPACITY);
        let trigger = Trigger::new()?;
        let trigger_read_fd = trigger.read_fd;

        let builder = std::thread::Builder::new().name("unimidi alsa_seq shared".to_string());
        let thread = builder
            .spawn(move || process_loop(seq, vport, rx, trigger_read_fd))
            .map_err(|_| Error::io("alsa_seq: cannot spawn the shared process thread"))?;

        Ok(std::sync::Arc::new(SharedSeqContext {
            commands: Mutex::new(tx),
            trigger,
            thread: Mutex::new(Some(thread)),
            next_id: AtomicU64::new(1),
        }))
    }

    fn push(&self, command: Command) -> Result<(), Error> {
        let mut producer = self
            .commands
            .lock()
            .map_err(|_| Error::io("alsa_seq: shared context is poisoned"))?;
        producer.push(command).map_err(|_| {
            Error::new(
                crate::errors::ErrorCategory::NotEnoughMemory,
                "alsa_seq: shared context command queue is full",
            )
        })?;
        self.trigger.wake();
        Ok(())
    }

    /// Subscribes `source` and starts feeding `decoder` from the process
    /// thread. Returns the registration handle for `disconnect`.
    pub(crate) fn connect(&self, source: Addr, decoder: Box<MidiStreamDecoder>) -> Result<u64, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.push(Command::Connect { id, source, decoder })?;
        Ok(id)
    }

    /// Unsubscribes the registration and returns its decoder once the
    /// process thread has stopped using it; blocks until any in-flight
    /// callback has returned.
    pub(crate) fn disconnect(&self, id: u64) -> Result<Box<MidiStreamDecoder>, Error> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.push(Command::Disconnect { id, reply: reply_tx })?;
        reply_rx
            .recv_timeout(std::time::Duration::from_secs(2))
            .map_err(|_| Error::not_connected("alsa_seq: shared context is gone"))
    }
}

impl Drop for SharedSeqContext {
    fn drop(&mut self) {
        if let Ok(mut producer) = self.commands.lock() {
            let _ = producer.push(Command::Terminate);
        }
        self.trigger.wake();
        if let Ok(mut thread) = self.thread.lock() {
            if let Some(handle) = thread.take() {
                let _ = handle.join();
            }
        }
    }
}

struct Registration {
    source: Addr,
    decoder: Box<MidiStreamDecoder>,
}

fn process_loop(
    seq: Seq,
    vport: i32,
    mut commands: spsc::Consumer<Command>,
    trigger_read_fd: i32,
) {
    let mut registrations: HashMap<u64, Registration> = HashMap::new();
    let mut buffer = [0u8; 16];
    let mut coder = match MidiEvent::new(0) {
        Ok(c) => c,
        Err(_) => return,
    };
    let _ = coder.enable_running_status(false);

    let own_client = seq.client_id().unwrap_or(-1);
    let dest = Addr { client: own_client, port: vport };

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
        // Cycle boundary: apply pending registrations before touching
        // the event stream again.
        while let Some(command) = commands.pop() {
            match command {
                Command::Connect { id, source, decoder } => {
                    match PortSubscribe::empty() {
                        Ok(sub) => {
                            sub.set_sender(source);
                            sub.set_dest(dest);
                            if seq.subscribe_port(&sub).is_err() {
                                log::error!(
                                    "alsa_seq shared: cannot subscribe {}:{}",
                                    source.client,
                                    source.port
                                );
                                continue;
                            }
                        }
                        Err(_) => continue,
                    }
                    registrations.insert(id, Registration { source, decoder });
                }
                Command::Disconnect { id, reply } => {
                    if let Some(registration) = registrations.remove(&id) {
                        let _ = seq.unsubscribe_port(registration.source, dest);
                        let _ = reply.send(registration.decoder);
                    }
                }
                Command::Terminate => return,
            }
        }

        let pending = match seq_input.event_input_pending(true) {
            Ok(n) => n,
            Err(_) => 0,
        };
        if pending == 0 {
            if poll(&mut poll_fds, -1) >= 0 && poll_fds[0].revents & libc::POLLIN != 0 {
                let mut token = false;
                let _ = unsafe {
                    libc::read(
                        poll_fds[0].fd,
                        &mut token as *mut bool as *mut _,
                        mem::size_of::<bool>(),
                    )
                };
                // Woken to drain commands; Terminate exits above.
            }
            continue;
        }

        let mut ev = match seq_input.event_input() {
            Ok(ev) => ev,
            Err(_) => continue,
        };
        let source = ev.get_source();
        let timestamp = ev.get_time().map(|t| t.as_nanos() as i64);

        let registration = registrations
            .values_mut()
            .find(|r| r.source.client == source.client && r.source.port == source.port);
        let registration = match registration {
            Some(r) => r,
            None => continue,
        };

        if ev.get_type() == EventType::Sysex {
            if let Some(fragment) = ev.get_ext() {
                registration.decoder.add_bytes(fragment, timestamp, 0);
            }
            continue;
        }
        if let Ok(bytes) = coder.decode(&mut buffer, &mut ev) {
            if bytes > 0 {
                registration.decoder.add_bytes(&buffer[..bytes], timestamp, 0);
            }
        }
    }
}
