use std::io;

use super::{write_variable_length, TrackEvent};
use crate::message::{MetaEventType, MidiMessage};

/// Standard MIDI File writer.
///
/// Events are organized per track with delta-time ticks. The emitted
/// file is Format 0 for a single track and Format 1 otherwise. Every
/// event carries its full status byte (running status is not used), and
/// each track is terminated with an end-of-track meta event whether or
/// not one was added.
pub struct Writer {
    pub ticks_per_quarter_note: u16,
    tracks: Vec<Vec<TrackEvent>>,
}

impl Writer {
    pub fn new(ticks_per_quarter_note: u16) -> Writer {
        Writer { ticks_per_quarter_note, tracks: Vec::new() }
    }

    /// Appends `message` to `track` at delta time `tick`, growing the
    /// track list as needed.
    pub fn add_event(&mut self, tick: u32, track: usize, message: MidiMessage) {
        while self.tracks.len() <= track {
            self.tracks.push(Vec::new());
        }
        self.tracks[track].push(TrackEvent { tick, track, message });
    }

    /// Adds an empty track at the end.
    pub fn add_track(&mut self) {
        self.tracks.push(Vec::new());
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Serializes the file into `out`.
    pub fn write<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(b"MThd")?;
        out.write_all(&6u32.to_be_bytes())?;
        let format: u16 = if self.tracks.len() == 1 { 0 } else { 1 };
        out.write_all(&format.to_be_bytes())?;
        out.write_all(&(self.tracks.len() as u16).to_be_bytes())?;
        out.write_all(&self.ticks_per_quarter_note.to_be_bytes())?;

        let mut body = Vec::new();
        for track in &self.tracks {
            body.clear();
            body.reserve(track.len() * 4);

            for event in track {
                let message = &event.message;
                if message.is_empty() {
                    continue;
                }
                // End-of-track events are suppressed; a single one is
                // appended after all track data below.
                if message.meta_event_type() == Some(MetaEventType::EndOfTrack) {
                    continue;
                }
                write_variable_length(event.tick, &mut body);

                let status = message.bytes[0];
                if status == 0xF0 || status == 0xF7 {
                    // SysEx events store their payload length explicitly;
                    // the message carries the raw MIDI bytes and the
                    // length is inserted here.
                    body.push(status);
                    write_variable_length(message.bytes.len() as u32 - 1, &mut body);
                    body.extend_from_slice(&message.bytes[1..]);
                } else {
                    body.extend_from_slice(&message.bytes);
                }
            }

            let len = body.len();
            let ends_already =
                len >= 3 && body[len - 3] == 0xFF && body[len - 2] == 0x2F;
            if !ends_already {
                body.push(0x00); // delta
                body.extend_from_slice(&[0xFF, 0x2F, 0x00]);
            }

            out.write_all(b"MTrk")?;
            out.write_all(&(body.len() as u32).to_be_bytes())?;
            out.write_all(&body)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smf::{ParseResult, Reader};

    fn write_to_bytes(writer: &Writer) -> Vec<u8> {
        let mut out = Vec::new();
        writer.write(&mut out).unwrap();
        out
    }

    #[test]
    fn single_track_is_format_0() {
        let mut writer = Writer::new(480);
        writer.add_event(0, 0, MidiMessage::note_on(0, 60, 100));
        let bytes = write_to_bytes(&writer);
        assert_eq!(&bytes[0..4], b"MThd");
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 0);
    }

    #[test]
    fn multiple_tracks_are_format_1() {
        let mut writer = Writer::new(480);
        writer.add_event(0, 0, MidiMessage::meta_tempo(500_000));
        writer.add_event(0, 1, MidiMessage::note_on(0, 60, 100));
        let bytes = write_to_bytes(&writer);
        assert_eq!(u16::from_be_bytes([bytes[8], bytes[9]]), 1);
        assert_eq!(u16::from_be_bytes([bytes[10], bytes[11]]), 2);
    }

    #[test]
    fn end_of_track_is_synthesized_once() {
        let mut writer = Writer::new(96);
        writer.add_event(0, 0, MidiMessage::note_on(0, 60, 100));
        writer.add_event(10, 0, MidiMessage::meta_end_of_track());
        let bytes = write_to_bytes(&writer);

        let mut reader = Reader::new(false);
        assert_eq!(reader.parse(&bytes), ParseResult::Validated);
        let track = &reader.tracks[0];
        assert_eq!(track.len(), 2);
        assert_eq!(track[1].message.bytes, [0xFF, 0x2F, 0x00]);
        // The caller's end-of-track was dropped, so its delta is not
        // preserved; the synthesized one sits at delta 0.
        assert_eq!(track[1].tick, 0);
    }

    #[test]
    fn written_files_read_back_equivalent() {
        let mut writer = Writer::new(480);
        writer.add_event(0, 0, MidiMessage::meta_tempo(600_000));
        writer.add_event(0, 0, MidiMessage::meta_time_signature(6, 8));
        writer.add_event(0, 1, MidiMessage::note_on(2, 60, 100));
        writer.add_event(240, 1, MidiMessage::note_off(2, 60, 0));
        writer.add_event(
            0,
            2,
            MidiMessage::new(vec![0xF0, 0x7E, 0x01, 0x02, 0x03, 0xF7], 0),
        );
        writer.add_event(480, 2, MidiMessage::pitch_bend(0, 0x2000));
        let bytes = write_to_bytes(&writer);

        let mut reader = Reader::new(false);
        assert_eq!(reader.parse(&bytes), ParseResult::Validated);
        assert_eq!(reader.tracks.len(), 3);
        assert_eq!(reader.starting_tempo, 100.0);

        assert_eq!(reader.tracks[1][0].tick, 0);
        assert_eq!(reader.tracks[1][0].message.bytes, [0x92, 0x3C, 0x64]);
        assert_eq!(reader.tracks[1][1].tick, 240);
        assert_eq!(reader.tracks[1][1].message.bytes, [0x82, 0x3C, 0x00]);

        assert_eq!(reader.tracks[2][0].message.bytes, [0xF0, 0x7E, 0x01, 0x02, 0x03, 0xF7]);
        assert_eq!(reader.tracks[2][1].tick, 480);

        // writing what was read yields an equivalent structure again
        let mut rewriter = Writer::new(480);
        for track in &reader.tracks {
            for event in track {
                rewriter.add_event(event.tick, event.track, event.message.clone());
            }
        }
        let bytes2 = write_to_bytes(&rewriter);
        assert_eq!(bytes, bytes2);
    }

    #[test]
    fn empty_writer_emits_zero_tracks() {
        let writer = Writer::new(480);
        let bytes = write_to_bytes(&writer);
        assert_eq!(u16::from_be_bytes([bytes[10], bytes[11]]), 0);
        let mut reader = Reader::new(false);
        // zero tracks parse as an empty, rule-clean file
        assert_eq!(reader.parse(&bytes), ParseResult::Validated);
    }
}
