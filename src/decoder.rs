use crate::config::{Midi1Callback, UmpCallback};
use crate::message::{fixed_message_length, MidiMessage, Ump};
use crate::timestamp::{Timestamp, TimestampFn, TimestampInfo, TimestampMode, Timestamper};
use crate::Ignore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    Idle,
    /// Collecting the data bytes of a channel voice or system common
    /// message of known length.
    InMessage,
    /// Between 0xF0 and 0xF7, possibly across many slices.
    InSysex,
}

/// Turns raw byte deliveries from a backend into complete MIDI 1.0
/// messages handed to the user callback.
///
/// Slices may split messages at arbitrary points, carry several messages
/// at once, and interleave system realtime bytes anywhere, including
/// inside another message. One backend timestamp is accepted per slice;
/// the delivered timestamps are derived from it according to the
/// configured [`TimestampMode`].
pub struct MidiStreamDecoder {
    state: DecoderState,
    running_status: u8,
    pending: Vec<u8>,
    expected: usize,
    /// The message being collected is parsed but not delivered
    /// (filtered MTC quarter frames still consume their data byte).
    suppress: bool,
    sysex: Vec<u8>,
    sysex_timestamp: Timestamp,
    ignore: Ignore,
    timestamper: Timestamper,
    callback: Midi1Callback,
}

impl MidiStreamDecoder {
    pub fn new(
        callback: Midi1Callback,
        ignore: Ignore,
        mode: TimestampMode,
        custom: Option<TimestampFn>,
        info: TimestampInfo,
    ) -> MidiStreamDecoder {
        MidiStreamDecoder {
            state: DecoderState::Idle,
            running_status: 0,
            pending: Vec::with_capacity(4),
            expected: 0,
            suppress: false,
            sysex: Vec::with_capacity(64),
            sysex_timestamp: 0,
            ignore,
            timestamper: Timestamper::new(mode, info, custom),
            callback,
        }
    }

    /// Feeds one slice of raw bytes. `absolute` is the backend's native
    /// timestamp for the first byte of the slice, if the backend has one;
    /// `samples` the audio frame offset for audio-driven backends.
    pub fn add_bytes(&mut self, bytes: &[u8], absolute: Option<Timestamp>, samples: Timestamp) {
        for &byte in bytes {
            self.add_byte(byte, absolute, samples);
        }
    }

    fn add_byte(&mut self, byte: u8, absolute: Option<Timestamp>, samples: Timestamp) {
        // System realtime can appear anywhere, even inside another
        // message, without disturbing its reassembly.
        if byte >= 0xF8 {
            if !self.filtered_realtime(byte) {
                let ts = self.timestamper.resolve(absolute, samples);
                (self.callback)(MidiMessage::new(vec![byte], ts));
            }
            return;
        }

        match self.state {
            DecoderState::Idle => {
                if byte & 0x80 != 0 {
                    self.begin_status(byte, absolute, samples);
                } else if self.running_status != 0 {
                    // Running status: the data byte re-triggers the last
                    // channel voice status.
                    self.pending.clear();
                    self.pending.push(self.running_status);
                    self.pending.push(byte);
                    self.expected = fixed_message_length(self.running_status).unwrap_or(1);
                    self.suppress = false;
                    if self.pending.len() >= self.expected {
                        self.finish_message(absolute, samples);
                    } else {
                        self.state = DecoderState::InMessage;
                    }
                }
                // A data byte with no status in effect is dropped.
            }
            DecoderState::InMessage => {
                if byte & 0x80 != 0 {
                    // A new status aborts the incomplete message.
                    self.pending.clear();
                    self.state = DecoderState::Idle;
                    self.begin_status(byte, absolute, samples);
                } else {
                    self.pending.push(byte);
                    if self.pending.len() >= self.expected {
                        self.finish_message(absolute, samples);
                    }
                }
            }
            DecoderState::InSysex => {
                if byte == 0xF7 {
                    self.sysex.push(0xF7);
                    self.state = DecoderState::Idle;
                    if !self.ignore.contains(Ignore::Sysex) {
                        let msg = std::mem::take(&mut self.sysex);
                        (self.callback)(MidiMessage::new(msg, self.sysex_timestamp));
                    } else {
                        self.sysex.clear();
                    }
                } else if byte & 0x80 != 0 {
                    // Terminator was lost; drop the fragment and resync.
                    self.sysex.clear();
                    self.state = DecoderState::Idle;
                    self.begin_status(byte, absolute, samples);
                } else if !self.ignore.contains(Ignore::Sysex) {
                    self.sysex.push(byte);
                }
            }
        }
    }

    fn begin_status(&mut self, status: u8, absolute: Option<Timestamp>, samples: Timestamp) {
        match status {
            0x80..=0xEF => {
                self.running_status = status;
                self.expected = fixed_message_length(status).unwrap_or(1);
                self.suppress = false;
                self.pending.clear();
                self.pending.push(status);
                self.state = DecoderState::InMessage;
            }
            0xF0 => {
                self.running_status = 0;
                self.sysex.clear();
                self.sysex.push(0xF0);
                self.state = DecoderState::InSysex;
                if !self.ignore.contains(Ignore::Sysex) {
                    // The reassembled message carries the timestamp of its
                    // first fragment.
                    self.sysex_timestamp = self.timestamper.resolve(absolute, samples);
                }
            }
            0xF1 | 0xF2 | 0xF3 => {
                self.running_status = 0;
                self.expected = fixed_message_length(status).unwrap_or(1);
                self.suppress = status == 0xF1 && self.ignore.contains(Ignore::Time);
                self.pending.clear();
                self.pending.push(status);
                self.state = DecoderState::InMessage;
            }
            0xF6 => {
                self.running_status = 0;
                self.pending.clear();
                self.pending.push(status);
                self.suppress = false;
                self.finish_message(absolute, samples);
            }
            // F4, F5 are reserved; F7 outside a SysEx is stray.
            _ => {
                self.running_status = 0;
            }
        }
    }

    fn finish_message(&mut self, absolute: Option<Timestamp>, samples: Timestamp) {
        self.state = DecoderState::Idle;
        if self.suppress {
            self.pending.clear();
            return;
        }
        let ts = self.timestamper.resolve(absolute, samples);
        let bytes = std::mem::take(&mut self.pending);
        (self.callback)(MidiMessage::new(bytes, ts));
    }

    fn filtered_realtime(&self, byte: u8) -> bool {
        match byte {
            0xF8 | 0xF9 => self.ignore.contains(Ignore::Time),
            0xFE => self.ignore.contains(Ignore::ActiveSense),
            _ => false,
        }
    }
}

/// Word-stream counterpart of [`MidiStreamDecoder`] for UMP backends.
/// An incomplete trailing packet stays buffered until the next slice.
pub struct UmpStreamDecoder {
    buffer: Vec<u32>,
    ignore: Ignore,
    timestamper: Timestamper,
    callback: UmpCallback,
}

impl UmpStreamDecoder {
    pub fn new(
        callback: UmpCallback,
        ignore: Ignore,
        mode: TimestampMode,
        custom: Option<TimestampFn>,
        info: TimestampInfo,
    ) -> UmpStreamDecoder {
        UmpStreamDecoder {
            buffer: Vec::with_capacity(8),
            ignore,
            timestamper: Timestamper::new(mode, info, custom),
            callback,
        }
    }

    pub fn add_words(&mut self, words: &[u32], absolute: Option<Timestamp>, samples: Timestamp) {
        self.buffer.extend_from_slice(words);
        let mut consumed = 0;
        while consumed < self.buffer.len() {
            let count = Ump::word_count(self.buffer[consumed]);
            if consumed + count > self.buffer.len() {
                break;
            }
            let packet = &self.buffer[consumed..consumed + count];
            if !self.filtered(packet) {
                let ts = self.timestamper.resolve(absolute, samples);
                if let Some(ump) = Ump::new(packet, ts) {
                    (self.callback)(ump);
                }
            }
            consumed += count;
        }
        self.buffer.drain(..consumed);
    }

    fn filtered(&self, packet: &[u32]) -> bool {
        match packet[0] >> 28 {
            // 64/128-bit data packets carry SysEx payloads.
            0x3 | 0x5 => self.ignore.contains(Ignore::Sysex),
            0x1 => {
                let status = ((packet[0] >> 16) & 0xFF) as u8;
                match status {
                    0xF1 | 0xF8 | 0xF9 => self.ignore.contains(Ignore::Time),
                    0xFE => self.ignore.contains(Ignore::ActiveSense),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting_decoder(
        ignore: Ignore,
        mode: TimestampMode,
        info: TimestampInfo,
    ) -> (MidiStreamDecoder, Arc<Mutex<Vec<MidiMessage>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let decoder = MidiStreamDecoder::new(
            Box::new(move |msg| sink.lock().unwrap().push(msg)),
            ignore,
            mode,
            None,
            info,
        );
        (decoder, received)
    }

    const NATIVE: TimestampInfo =
        TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: false };

    #[test]
    fn note_on_with_zero_timestamp_mode() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x91, 0x3C, 0x64], Some(1234), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0x91, 0x3C, 0x64]);
        assert_eq!(out[0].timestamp, 0);
    }

    #[test]
    fn message_split_across_three_slices() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x91], Some(1), 0);
        d.add_bytes(&[0x3C], Some(2), 0);
        d.add_bytes(&[0x64], Some(3), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0x91, 0x3C, 0x64]);
    }

    #[test]
    fn sysex_split_across_two_slices() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0xF0, 0x01, 0x02, 0x03], Some(1), 0);
        d.add_bytes(&[0x04, 0x05, 0xF7], Some(2), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0xF0, 0x01, 0x02, 0x03, 0x04, 0x05, 0xF7]);
    }

    #[test]
    fn realtime_interleaved_in_channel_message_is_delivered_first() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x91, 0x3C, 0xF8, 0x64], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bytes, [0xF8]);
        assert_eq!(out[1].bytes, [0x91, 0x3C, 0x64]);
    }

    #[test]
    fn realtime_interleaved_in_sysex_keeps_reassembly_intact() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0xF0, 0x01, 0xF8, 0x02, 0xF7], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bytes, [0xF8]);
        assert_eq!(out[1].bytes, [0xF0, 0x01, 0x02, 0xF7]);
    }

    #[test]
    fn running_status_yields_two_note_ons() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x90, 0x3C, 0x40, 0x3E, 0x41], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bytes, [0x90, 0x3C, 0x40]);
        assert_eq!(out[1].bytes, [0x90, 0x3E, 0x41]);
        assert_eq!(out[1].channel(), Some(0));
    }

    #[test]
    fn ignore_filters_drop_matching_messages() {
        let (mut d, out) =
            collecting_decoder(Ignore::SysexAndTime, TimestampMode::None, NATIVE);
        d.add_bytes(&[0xF8, 0xF0, 0x01, 0xF7, 0xF1, 0x04, 0x91, 0x3C, 0x64], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0x91, 0x3C, 0x64]);
    }

    #[test]
    fn active_sensing_filter() {
        let (mut d, out) = collecting_decoder(Ignore::ActiveSense, TimestampMode::None, NATIVE);
        d.add_bytes(&[0xFE, 0xF8], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0xF8]);
    }

    #[test]
    fn relative_timestamps_sum_to_absolute_span() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::Relative, NATIVE);
        d.add_bytes(&[0xF8], Some(100), 0);
        d.add_bytes(&[0xF8], Some(250), 0);
        d.add_bytes(&[0xF8], Some(1000), 0);
        let out = out.lock().unwrap();
        assert_eq!(out[0].timestamp, 0);
        assert!(out.iter().all(|m| m.timestamp >= 0));
        assert_eq!(out.iter().map(|m| m.timestamp).sum::<i64>(), 900);
    }

    #[test]
    fn absolute_timestamps_pass_through() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::Absolute, NATIVE);
        d.add_bytes(&[0x91, 0x3C, 0x64], Some(5555), 0);
        assert_eq!(out.lock().unwrap()[0].timestamp, 5555);
    }

    #[test]
    fn stray_data_bytes_are_dropped() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x40, 0x41, 0x91, 0x3C, 0x64], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0x91, 0x3C, 0x64]);
    }

    #[test]
    fn new_status_aborts_incomplete_message() {
        let (mut d, out) = collecting_decoder(Ignore::None, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x91, 0x3C, 0x92, 0x40, 0x50], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bytes, [0x92, 0x40, 0x50]);
    }

    #[test]
    fn mtc_data_byte_consumed_even_when_filtered() {
        // The 0x04 after 0xF1 must not be taken for a running status data
        // byte once MTC is filtered out.
        let (mut d, out) = collecting_decoder(Ignore::Time, TimestampMode::None, NATIVE);
        d.add_bytes(&[0x90, 0x3C, 0x40, 0xF1, 0x04, 0x91, 0x3E, 0x41], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bytes, [0x90, 0x3C, 0x40]);
        assert_eq!(out[1].bytes, [0x91, 0x3E, 0x41]);
    }

    fn collecting_ump_decoder(
        ignore: Ignore,
    ) -> (UmpStreamDecoder, Arc<Mutex<Vec<Ump>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let decoder = UmpStreamDecoder::new(
            Box::new(move |ump| sink.lock().unwrap().push(ump)),
            ignore,
            TimestampMode::None,
            None,
            NATIVE,
        );
        (decoder, received)
    }

    #[test]
    fn ump_packets_split_across_slices() {
        let (mut d, out) = collecting_ump_decoder(Ignore::None);
        d.add_words(&[0x40B32300], Some(1), 0);
        d.add_words(&[0xC8000000, 0x10F10400], Some(2), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].words(), [0x40B32300, 0xC8000000]);
        assert_eq!(out[1].words(), [0x10F10400]);
    }

    #[test]
    fn ump_system_filtering() {
        let (mut d, out) = collecting_ump_decoder(Ignore::Time);
        d.add_words(&[0x10F80000, 0x10F10400, 0x10FA0000], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].status_byte(), 0xFA);
    }

    #[test]
    fn ump_sysex_filtering() {
        let (mut d, out) = collecting_ump_decoder(Ignore::Sysex);
        d.add_words(&[0x30050102, 0x03040500, 0x20903C40], Some(1), 0);
        let out = out.lock().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message_type(), 2);
    }
}
