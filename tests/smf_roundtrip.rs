//! Write a multi-track file to disk, read it back, and compare the
//! track structure; plus the degraded-input classifications.

use std::io::Write;

use unimidi::smf::{ParseResult, Reader, Writer};
use unimidi::MidiMessage;

fn build_writer() -> Writer {
    let mut writer = Writer::new(480);
    // conductor track
    writer.add_event(0, 0, MidiMessage::meta_tempo(500_000));
    writer.add_event(0, 0, MidiMessage::meta_time_signature(4, 4));
    writer.add_event(0, 0, MidiMessage::meta_track_name("conductor"));
    // one bar of music
    writer.add_event(0, 1, MidiMessage::program_change(0, 5));
    writer.add_event(0, 1, MidiMessage::note_on(0, 60, 100));
    writer.add_event(480, 1, MidiMessage::note_off(0, 60, 64));
    writer.add_event(0, 1, MidiMessage::note_on(0, 64, 100));
    writer.add_event(480, 1, MidiMessage::note_off(0, 64, 64));
    // a sysex track
    writer.add_event(0, 2, MidiMessage::new(vec![0xF0, 0x7E, 0x7F, 0x09, 0x01, 0xF7], 0));
    writer
}

#[test]
fn file_round_trip_preserves_track_structure() {
    let writer = build_writer();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut bytes = Vec::new();
    writer.write(&mut bytes).unwrap();
    file.write_all(&bytes).unwrap();

    let data = std::fs::read(file.path()).unwrap();
    let mut reader = Reader::new(false);
    assert_eq!(reader.parse(&data), ParseResult::Validated);
    assert_eq!(reader.ticks_per_beat, 480.0);
    assert_eq!(reader.starting_tempo, 120.0);
    assert_eq!(reader.tracks.len(), 3);

    // deltas preserved
    let music = &reader.tracks[1];
    assert_eq!(music[0].message.bytes, [0xC0, 0x05]);
    assert_eq!(music[1].tick, 0);
    assert_eq!(music[2].tick, 480);
    assert_eq!(music[2].message.bytes, [0x80, 0x3C, 0x40]);

    // a synthesized end-of-track terminates every track
    for track in &reader.tracks {
        let last = track.last().unwrap();
        assert_eq!(last.message.bytes, [0xFF, 0x2F, 0x00]);
    }

    // writing what was read produces the same bytes again
    let mut rewriter = Writer::new(480);
    for track in &reader.tracks {
        for event in track {
            rewriter.add_event(event.tick, event.track, event.message.clone());
        }
    }
    let mut bytes2 = Vec::new();
    rewriter.write(&mut bytes2).unwrap();
    assert_eq!(bytes, bytes2);
}

#[test]
fn end_time_agrees_between_timing_modes() {
    let writer = build_writer();
    let mut bytes = Vec::new();
    writer.write(&mut bytes).unwrap();

    let mut relative = Reader::new(false);
    relative.parse(&bytes);
    let mut absolute = Reader::new(true);
    absolute.parse(&bytes);

    assert_eq!(relative.get_end_time(), 960.0);
    assert_eq!(absolute.get_end_time(), 960.0);
}

#[test]
fn invalid_inputs_never_validate() {
    let corpus: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"not midi at all".to_vec(),
        b"MThd\x00\x00\x00\x07\x00\x00\x00\x01\x01\xE0".to_vec(), // header length 7
        b"MThd\x00\x00\x00\x06\x00\x09\x00\x01\x01\xE0".to_vec(), // format 9
    ];
    for data in corpus {
        let mut reader = Reader::new(false);
        assert_ne!(reader.parse(&data), ParseResult::Validated, "accepted {data:02X?}");
    }
}

#[test]
fn truncation_is_detected_not_crashed() {
    let writer = build_writer();
    let mut bytes = Vec::new();
    writer.write(&mut bytes).unwrap();

    // chop the file anywhere after the header: never Validated, never a
    // panic
    for cut in 14..bytes.len() - 1 {
        let mut reader = Reader::new(false);
        let result = reader.parse(&bytes[..cut]);
        assert_ne!(result, ParseResult::Validated, "cut at {cut}");
    }
}
