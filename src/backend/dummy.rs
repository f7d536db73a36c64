//! The dummy backend: always available, never delivers or transmits
//! anything. It terminates the priority list so construction with a
//! neutral configuration cannot fail, and serves as the stand-in on
//! platforms without a real transport.

use crate::api::Api;
use crate::backend::{InputBackend, ObserverBackend, OutputBackend};
use crate::config::{InputCallback, InputConfig, ObserverConfig, OutputConfig};
use crate::decoder::{MidiStreamDecoder, UmpStreamDecoder};
use crate::errors::Error;
use crate::port::{InputPort, OutputPort};
use crate::timestamp::TimestampInfo;

const TIMESTAMPS: TimestampInfo =
    TimestampInfo { has_absolute: false, absolute_is_monotonic: false, has_samples: false };

enum Decoder {
    Midi1(MidiStreamDecoder),
    Ump(UmpStreamDecoder),
}

pub struct DummyInput {
    // Keeps the user callback and decoder state alive for the lifetime
    // of the connection even though no data ever arrives.
    #[allow(dead_code)]
    decoder: Decoder,
}

impl DummyInput {
    pub fn new(config: InputConfig) -> Result<DummyInput, (Error, InputConfig)> {
        let InputConfig { callback, get_timestamp, ignore, timestamps, .. } = config;
        let decoder = match callback {
            InputCallback::Midi1(cb) => {
                Decoder::Midi1(MidiStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS))
            }
            InputCallback::Ump(cb) => {
                Decoder::Ump(UmpStreamDecoder::new(cb, ignore, timestamps, get_timestamp, TIMESTAMPS))
            }
        };
        Ok(DummyInput { decoder })
    }

    /// Test hook: pretends the transport delivered `bytes`.
    #[cfg(test)]
    pub(crate) fn feed_bytes(&mut self, bytes: &[u8]) {
        if let Decoder::Midi1(d) = &mut self.decoder {
            d.add_bytes(bytes, None, 0);
        }
    }

    #[cfg(test)]
    pub(crate) fn feed_words(&mut self, words: &[u32]) {
        if let Decoder::Ump(d) = &mut self.decoder {
            d.add_words(words, None, 0);
        }
    }
}

impl InputBackend for DummyInput {
    fn api(&self) -> Api {
        Api::Dummy
    }

    fn open_port(&mut self, _port: &InputPort, _local_name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn open_virtual_port(&mut self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        Ok(())
    }
}

pub struct DummyOutput;

impl DummyOutput {
    pub fn new(_config: OutputConfig) -> Result<DummyOutput, (Error, OutputConfig)> {
        Ok(DummyOutput)
    }
}

impl OutputBackend for DummyOutput {
    fn api(&self) -> Api {
        Api::Dummy
    }

    fn open_port(&mut self, _port: &OutputPort, _local_name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn open_virtual_port(&mut self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn close_port(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn set_port_name(&mut self, _name: &str) -> Result<(), Error> {
        Ok(())
    }

    fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        if message.is_empty() {
            return Err(Error::invalid_argument("message must not be empty"));
        }
        Ok(())
    }

    fn send_ump(&mut self, words: &[u32]) -> Result<(), Error> {
        if words.is_empty() {
            return Err(Error::invalid_argument("packet must not be empty"));
        }
        Ok(())
    }

    fn schedule_message(&mut self, _timestamp: i64, message: &[u8]) -> Result<(), Error> {
        self.send_message(message)
    }

    fn schedule_ump(&mut self, _timestamp: i64, words: &[u32]) -> Result<(), Error> {
        self.send_ump(words)
    }
}

pub struct DummyObserver;

impl DummyObserver {
    pub fn new(_config: ObserverConfig) -> Result<DummyObserver, (Error, ObserverConfig)> {
        Ok(DummyObserver)
    }
}

impl ObserverBackend for DummyObserver {
    fn api(&self) -> Api {
        Api::Dummy
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
    use std::sync::{Arc, Mutex};

    #[test]
    fn dummy_input_decodes_fed_bytes() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let config = InputConfig::new(move |msg| sink.lock().unwrap().push(msg));
        let mut input = DummyInput::new(config).map_err(|(e, _)| e).unwrap();
        input.feed_bytes(&[0x91, 0x3C, 0x64]);
        assert_eq!(received.lock().unwrap()[0].bytes, [0x91, 0x3C, 0x64]);
    }

    #[test]
    fn dummy_input_decodes_fed_words() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let config = InputConfig::new_ump(move |ump| sink.lock().unwrap().push(ump));
        let mut input = DummyInput::new(config).map_err(|(e, _)| e).unwrap();
        input.feed_words(&[0x40B32300, 0xC8000000]);
        assert_eq!(received.lock().unwrap()[0].words(), [0x40B32300, 0xC8000000]);
    }
}
