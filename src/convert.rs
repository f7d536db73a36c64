//! Bidirectional, bit-exact conversion between MIDI 1.0 byte streams and
//! MIDI 2.0 Universal MIDI Packets.
//!
//! Value scaling follows the UMP translation rules used on the wire:
//! 7-bit velocities widen to 16 bits (`v << 9`), 7-bit controller data to
//! 32 bits (`v << 25`), 14-bit pitch bend to 32 bits (`v << 18`); the
//! reverse direction truncates. SysEx payloads bridge through 64-bit
//! Data (SysEx7) packets, split into Start/Continue/End groups of at most
//! six data bytes.

use crate::errors::Error;
use crate::message::{fixed_message_length, Ump};
use crate::timestamp::Timestamp;

const UMP_SYSEX7_COMPLETE: u32 = 0x0;
const UMP_SYSEX7_START: u32 = 0x1;
const UMP_SYSEX7_CONTINUE: u32 = 0x2;
const UMP_SYSEX7_END: u32 = 0x3;

/// Streaming MIDI 1.0 → UMP converter.
///
/// Input slices must contain whole messages (running status resolved,
/// SysEx complete); backends feed this from the output of the input
/// state machine, where that already holds.
pub struct Midi1ToUmp {
    group: u8,
}

impl Default for Midi1ToUmp {
    fn default() -> Self {
        Midi1ToUmp::new()
    }
}

impl Midi1ToUmp {
    pub fn new() -> Midi1ToUmp {
        Midi1ToUmp { group: 0 }
    }

    /// All emitted packets carry `group` (0-15) in their group nibble.
    pub fn with_group(group: u8) -> Midi1ToUmp {
        Midi1ToUmp { group: group & 0xF }
    }

    /// Converts every message in `bytes`, invoking `sink` once per UMP
    /// with its words and the passed-through timestamp. Malformed or
    /// truncated input aborts with a bad-message error before `sink`
    /// sees any part of the offending message.
    pub fn convert<F>(&mut self, bytes: &[u8], timestamp: Timestamp, mut sink: F) -> Result<(), Error>
    where
        F: FnMut(&[u32], Timestamp) -> Result<(), Error>,
    {
        let group = (self.group as u32) << 24;
        let mut i = 0;
        while i < bytes.len() {
            let status = bytes[i];
            if status < 0x80 {
                return Err(Error::bad_message("midi1 to ump: data byte without status"));
            }
            if status == 0xF0 {
                let end = bytes[i..]
                    .iter()
                    .position(|&b| b == 0xF7)
                    .ok_or_else(|| Error::bad_message("midi1 to ump: unterminated sysex"))?;
                self.convert_sysex(&bytes[i + 1..i + end], timestamp, &mut sink)?;
                i += end + 1;
                continue;
            }
            let len = fixed_message_length(status)
                .ok_or_else(|| Error::bad_message("midi1 to ump: reserved status byte"))?;
            if i + len > bytes.len() {
                return Err(Error::bad_message("midi1 to ump: truncated message"));
            }
            let d1 = if len > 1 { bytes[i + 1] as u32 } else { 0 };
            let d2 = if len > 2 { bytes[i + 2] as u32 } else { 0 };
            if status >= 0xF1 {
                // System common and realtime: one System (type 1) word.
                let word = 0x1000_0000 | group | ((status as u32) << 16) | (d1 << 8) | d2;
                sink(&[word], timestamp)?;
            } else {
                // Channel voice: one MIDI 2.0 channel voice (type 4) pair.
                let head = 0x4000_0000 | group | ((status as u32) << 16);
                let words = match status & 0xF0 {
                    0x80 | 0x90 => [head | (d1 << 8), (d2 << 9) << 16],
                    0xA0 => [head | (d1 << 8), d2 << 25],
                    0xB0 => [head | (d1 << 8), d2 << 25],
                    0xC0 => [head, d1 << 24],
                    0xD0 => [head, d1 << 25],
                    0xE0 => [head, (d1 | (d2 << 7)) << 18],
                    _ => unreachable!(),
                };
                sink(&words, timestamp)?;
            }
            i += len;
        }
        Ok(())
    }

    fn convert_sysex<F>(&mut self, data: &[u8], timestamp: Timestamp, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(&[u32], Timestamp) -> Result<(), Error>,
    {
        let group = (self.group as u32) << 24;
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(6).collect()
        };
        let last = chunks.len() - 1;
        for (index, chunk) in chunks.iter().enumerate() {
            let status = if chunks.len() == 1 {
                UMP_SYSEX7_COMPLETE
            } else if index == 0 {
                UMP_SYSEX7_START
            } else if index == last {
                UMP_SYSEX7_END
            } else {
                UMP_SYSEX7_CONTINUE
            };
            let mut b = [0u32; 6];
            for (slot, &byte) in b.iter_mut().zip(chunk.iter()) {
                *slot = byte as u32;
            }
            let words = [
                0x3000_0000
                    | group
                    | (status << 20)
                    | ((chunk.len() as u32) << 16)
                    | (b[0] << 8)
                    | b[1],
                (b[2] << 24) | (b[3] << 16) | (b[4] << 8) | b[5],
            ];
            sink(&words, timestamp)?;
        }
        Ok(())
    }
}

/// Streaming UMP → MIDI 1.0 converter.
///
/// UMP traffic that MIDI 1.0 cannot express (utility, Flex Data, Stream,
/// MIDI 2.0-only channel voice statuses) is dropped silently; SysEx7
/// Start/Continue/End sequences are reassembled into one `F0 … F7`
/// byte message.
pub struct UmpToMidi1 {
    sysex: Vec<u8>,
    in_sysex: bool,
}

impl Default for UmpToMidi1 {
    fn default() -> Self {
        UmpToMidi1::new()
    }
}

impl UmpToMidi1 {
    pub fn new() -> UmpToMidi1 {
        UmpToMidi1 { sysex: Vec::with_capacity(64), in_sysex: false }
    }

    /// Converts every whole packet in `words`. A slice ending in the
    /// middle of a packet is a bad-message error.
    pub fn convert<F>(&mut self, words: &[u32], timestamp: Timestamp, mut sink: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], Timestamp) -> Result<(), Error>,
    {
        let mut i = 0;
        while i < words.len() {
            let count = Ump::word_count(words[i]);
            if i + count > words.len() {
                return Err(Error::bad_message("ump to midi1: truncated packet"));
            }
            self.convert_packet(&words[i..i + count], timestamp, &mut sink)?;
            i += count;
        }
        Ok(())
    }

    fn convert_packet<F>(&mut self, packet: &[u32], timestamp: Timestamp, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(&[u8], Timestamp) -> Result<(), Error>,
    {
        let w0 = packet[0];
        match w0 >> 28 {
            0x1 => {
                let status = ((w0 >> 16) & 0xFF) as u8;
                let d1 = ((w0 >> 8) & 0x7F) as u8;
                let d2 = (w0 & 0x7F) as u8;
                match fixed_message_length(status) {
                    Some(1) => sink(&[status], timestamp),
                    Some(2) => sink(&[status, d1], timestamp),
                    Some(3) => sink(&[status, d1, d2], timestamp),
                    _ => Ok(()),
                }
            }
            0x2 => {
                // MIDI 1.0 channel voice carried in UMP: bytes verbatim.
                let status = ((w0 >> 16) & 0xFF) as u8;
                let d1 = ((w0 >> 8) & 0x7F) as u8;
                let d2 = (w0 & 0x7F) as u8;
                match fixed_message_length(status) {
                    Some(2) => sink(&[status, d1], timestamp),
                    Some(3) => sink(&[status, d1, d2], timestamp),
                    _ => Ok(()),
                }
            }
            0x3 => self.convert_sysex7(packet, timestamp, sink),
            0x4 => {
                let w1 = packet[1];
                let opcode = ((w0 >> 20) & 0xF) as u8;
                let channel = ((w0 >> 16) & 0xF) as u8;
                let d1 = ((w0 >> 8) & 0x7F) as u8;
                match opcode {
                    0x8 | 0x9 => {
                        let velocity = ((w1 >> 25) & 0x7F) as u8;
                        sink(&[(opcode << 4) | channel, d1, velocity], timestamp)
                    }
                    0xA => sink(&[0xA0 | channel, d1, ((w1 >> 25) & 0x7F) as u8], timestamp),
                    0xB => sink(&[0xB0 | channel, d1, ((w1 >> 25) & 0x7F) as u8], timestamp),
                    0xC => sink(&[0xC0 | channel, ((w1 >> 24) & 0x7F) as u8], timestamp),
                    0xD => sink(&[0xD0 | channel, ((w1 >> 25) & 0x7F) as u8], timestamp),
                    0xE => {
                        let bend = (w1 >> 18) & 0x3FFF;
                        sink(
                            &[0xE0 | channel, (bend & 0x7F) as u8, ((bend >> 7) & 0x7F) as u8],
                            timestamp,
                        )
                    }
                    // Registered/assignable controllers, per-note messages
                    // and the rest have no MIDI 1.0 counterpart.
                    _ => Ok(()),
                }
            }
            // Utility, 96/128-bit data, Flex Data, Stream: nothing to say
            // in MIDI 1.0.
            _ => Ok(()),
        }
    }

    fn convert_sysex7<F>(&mut self, packet: &[u32], timestamp: Timestamp, sink: &mut F) -> Result<(), Error>
    where
        F: FnMut(&[u8], Timestamp) -> Result<(), Error>,
    {
        let w0 = packet[0];
        let w1 = packet[1];
        let status = (w0 >> 20) & 0xF;
        let len = (((w0 >> 16) & 0xF) as usize).min(6);
        let raw = [
            ((w0 >> 8) & 0x7F) as u8,
            (w0 & 0x7F) as u8,
            ((w1 >> 24) & 0x7F) as u8,
            ((w1 >> 16) & 0x7F) as u8,
            ((w1 >> 8) & 0x7F) as u8,
            (w1 & 0x7F) as u8,
        ];
        let data = &raw[..len];
        match status {
            UMP_SYSEX7_COMPLETE => {
                let mut msg = Vec::with_capacity(len + 2);
                msg.push(0xF0);
                msg.extend_from_slice(data);
                msg.push(0xF7);
                self.in_sysex = false;
                sink(&msg, timestamp)
            }
            UMP_SYSEX7_START => {
                self.sysex.clear();
                self.sysex.push(0xF0);
                self.sysex.extend_from_slice(data);
                self.in_sysex = true;
                Ok(())
            }
            UMP_SYSEX7_CONTINUE if self.in_sysex => {
                self.sysex.extend_from_slice(data);
                Ok(())
            }
            UMP_SYSEX7_END if self.in_sysex => {
                self.sysex.extend_from_slice(data);
                self.sysex.push(0xF7);
                self.in_sysex = false;
                let msg = std::mem::take(&mut self.sysex);
                sink(&msg, timestamp)
            }
            // Continue/End without a Start: nothing to reassemble.
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_ump(bytes: &[u8]) -> Vec<u32> {
        let mut words = Vec::new();
        Midi1ToUmp::new()
            .convert(bytes, 0, |w, _| {
                words.extend_from_slice(w);
                Ok(())
            })
            .unwrap();
        words
    }

    fn to_midi1(words: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        UmpToMidi1::new()
            .convert(words, 0, |b, _| {
                bytes.extend_from_slice(b);
                Ok(())
            })
            .unwrap();
        bytes
    }

    fn roundtrip(bytes: &[u8]) {
        assert_eq!(to_midi1(&to_ump(bytes)), bytes, "roundtrip failed for {bytes:02X?}");
    }

    #[test]
    fn control_change_matches_fixture() {
        // cc on channel 3, controller 0x23, value 100: the value widens
        // to 100 << 25 in the second word.
        assert_eq!(to_ump(&[0xB3, 0x23, 0x64]), [0x40B32300, 100 << 25]);
    }

    #[test]
    fn mtc_quarter_frames_match_fixture() {
        let data = [0x04, 0x10, 0x23, 0x30, 0x42, 0x50, 0x61, 0x70];
        let mut bytes = Vec::new();
        for d in data {
            bytes.extend_from_slice(&[0xF1, d]);
        }
        let words = to_ump(&bytes);
        let expected: Vec<u32> = data.iter().map(|&d| 0x10F1_0000 | ((d as u32) << 8)).collect();
        assert_eq!(words, expected);
        for w in &words {
            assert_eq!(w >> 28, 0x1);
            assert_eq!((w >> 16) & 0xFF, 0xF1);
        }
    }

    #[test]
    fn long_sysex_splits_into_start_and_end_packets() {
        let bytes = [0xF0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xF7];
        let words = to_ump(&bytes);
        assert_eq!(words.len(), 4);
        assert_eq!((words[0] >> 20) & 0xF, UMP_SYSEX7_START);
        assert_eq!((words[0] >> 16) & 0xF, 6);
        assert_eq!((words[2] >> 20) & 0xF, UMP_SYSEX7_END);
        assert_eq!((words[2] >> 16) & 0xF, 2);
        assert_eq!(to_midi1(&words), bytes);
    }

    #[test]
    fn short_sysex_fits_one_complete_packet() {
        let bytes = [0xF0, 0x7E, 0x00, 0x01, 0x02, 0xF7];
        let words = to_ump(&bytes);
        assert_eq!(words.len(), 2);
        assert_eq!((words[0] >> 20) & 0xF, UMP_SYSEX7_COMPLETE);
        assert_eq!(to_midi1(&words), bytes);
    }

    #[test]
    fn roundtrip_corpus() {
        // single-byte realtime
        for status in [0xF8u8, 0xFA, 0xFB, 0xFC, 0xFE, 0xFF] {
            roundtrip(&[status]);
        }
        // system common
        roundtrip(&[0xF6]);
        roundtrip(&[0xF1, 0x20]);
        roundtrip(&[0xF2, 0x00, 0x01]);
        roundtrip(&[0xF3, 0x05]);
        // three-byte channel voice on every channel
        for channel in 0..16u8 {
            roundtrip(&[0x80 | channel, 0x3C, 0x00]);
            roundtrip(&[0x90 | channel, 0x3C, 0x64]);
            roundtrip(&[0xA0 | channel, 0x3C, 0x7F]);
            roundtrip(&[0xB0 | channel, 0x07, 0x64]);
            roundtrip(&[0xE0 | channel, 0x00, 0x40]);
        }
        // two-byte channel voice
        roundtrip(&[0xC3, 0x0A]);
        roundtrip(&[0xD4, 0x40]);
        // sysex, short and long
        roundtrip(&[0xF0, 0x7E, 0x00, 0x01, 0x02, 0xF7]);
        let mut long = vec![0xF0];
        long.extend((0..48).map(|i| (i & 0x7F) as u8));
        long.push(0xF7);
        roundtrip(&long);
    }

    #[test]
    fn note_on_velocity_zero_survives() {
        let words = to_ump(&[0x90, 0x3C, 0x00]);
        assert_eq!(to_midi1(&words), [0x90, 0x3C, 0x00]);
    }

    #[test]
    fn data_byte_without_status_is_an_error() {
        let mut called = false;
        let err = Midi1ToUmp::new().convert(&[0x42], 0, |_, _| {
            called = true;
            Ok(())
        });
        assert!(err.is_err());
        assert!(!called);
    }

    #[test]
    fn truncated_channel_message_is_an_error() {
        assert!(Midi1ToUmp::new().convert(&[0x9C], 0, |_, _| Ok(())).is_err());
    }

    #[test]
    fn truncated_ump_is_an_error() {
        let mut called = false;
        let err = UmpToMidi1::new().convert(&[0xFFFF_FFFF], 0, |_, _| {
            called = true;
            Ok(())
        });
        assert!(err.is_err());
        assert!(!called);
    }

    #[test]
    fn ump_only_packets_are_dropped_silently() {
        // utility NOOP, a Flex Data packet and a Stream packet
        let words = [
            0x0000_0000,
            0xD000_0000, 0, 0, 0,
            0xF000_0000, 0, 0, 0,
        ];
        assert_eq!(to_midi1(&words), Vec::<u8>::new());
    }

    #[test]
    fn midi1_in_ump_converts_to_bytes() {
        assert_eq!(to_midi1(&[0x2091_3C64]), [0x91, 0x3C, 0x64]);
    }

    #[test]
    fn group_nibble_is_stamped() {
        let mut words = Vec::new();
        Midi1ToUmp::with_group(5)
            .convert(&[0xF8], 0, |w, _| {
                words.extend_from_slice(w);
                Ok(())
            })
            .unwrap();
        assert_eq!(words, [0x15F8_0000]);
    }
}
