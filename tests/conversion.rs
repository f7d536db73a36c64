//! Conversion laws exercised through the public API: everything MIDI 1
//! can express survives the trip through UMP byte-for-byte.

use unimidi::{Midi1ToUmp, UmpToMidi1};

fn to_ump(bytes: &[u8]) -> Vec<u32> {
    let mut words = Vec::new();
    Midi1ToUmp::new()
        .convert(bytes, 0, |w, _| {
            words.extend_from_slice(w);
            Ok(())
        })
        .expect("conversion to UMP failed");
    words
}

fn to_midi1(words: &[u32]) -> Vec<u8> {
    let mut bytes = Vec::new();
    UmpToMidi1::new()
        .convert(words, 0, |b, _| {
            bytes.extend_from_slice(b);
            Ok(())
        })
        .expect("conversion to MIDI 1 failed");
    bytes
}

#[test]
fn roundtrip_law() {
    let mut corpus: Vec<Vec<u8>> = Vec::new();
    // all single-byte system realtime
    for status in [0xF8u8, 0xF9, 0xFA, 0xFB, 0xFC, 0xFE, 0xFF] {
        corpus.push(vec![status]);
    }
    // all three-byte channel voice messages across the channel range
    for channel in 0u8..16 {
        corpus.push(vec![0x80 | channel, 0x3C, 0x40]);
        corpus.push(vec![0x90 | channel, 0x3C, 0x64]);
        corpus.push(vec![0xA0 | channel, 0x21, 0x7F]);
        corpus.push(vec![0xB0 | channel, 0x07, 0x00]);
        corpus.push(vec![0xE0 | channel, 0x7F, 0x7F]);
    }
    // short sysex of length 6
    corpus.push(vec![0xF0, 0x7E, 0x00, 0x01, 0x02, 0xF7]);
    // long sysex of length 50
    let mut long = vec![0xF0];
    long.extend((0..48u8).map(|i| i & 0x7F));
    long.push(0xF7);
    assert_eq!(long.len(), 50);
    corpus.push(long);

    for message in corpus {
        let words = to_ump(&message);
        assert_eq!(to_midi1(&words), message, "roundtrip failed for {message:02X?}");
    }
}

#[test]
fn control_change_word_image() {
    assert_eq!(to_ump(&[0xB3, 0x23, 0x64]), vec![0x40B32300, 100u32 << 25]);
}

#[test]
fn mtc_quarter_frame_sequence() {
    let pieces = [0x04u8, 0x10, 0x23, 0x30, 0x42, 0x50, 0x61, 0x70];
    let mut stream = Vec::new();
    for d in pieces {
        stream.extend_from_slice(&[0xF1, d]);
    }
    let words = to_ump(&stream);
    assert_eq!(words.len(), 8);
    for (word, d) in words.iter().zip(pieces) {
        assert_eq!(word >> 28, 0x1, "type nibble");
        assert_eq!((word >> 16) & 0xFF, 0xF1, "status byte");
        assert_eq!((word >> 8) & 0xFF, d as u32, "data byte");
    }
}

#[test]
fn ten_byte_sysex_bridges_as_start_plus_end() {
    let message = [0xF0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xF7];
    let words = to_ump(&message);
    // two packets of two words each
    assert_eq!(words.len(), 4);
    assert_eq!((words[0] >> 20) & 0xF, 0x1, "first packet is Start");
    assert_eq!((words[0] >> 16) & 0xF, 6, "Start carries six data bytes");
    assert_eq!((words[2] >> 20) & 0xF, 0x3, "second packet is End");
    assert_eq!((words[2] >> 16) & 0xF, 2, "End carries the remaining two");
    assert_eq!(to_midi1(&words), message);
}
