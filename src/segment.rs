//! Output-side segmentation: pacing large SysEx transfers through
//! transports with small ring buffers, and packing UMP streams into
//! bounded event lists.

use std::fmt;
use std::time::Duration;

use crate::errors::Error;
use crate::message::Ump;

/// Nominal MIDI 1.0 wire rate: one byte every 320 microseconds.
const BYTE_DRAIN_US: u64 = 320;

/// Policy for splitting an outbound byte stream into transport-sized
/// chunks with application-controlled pacing.
pub struct ChunkingParameters {
    /// Delay requested between two consecutive chunks.
    pub interval: Duration,
    /// Upper bound on the size of a single write.
    pub size: usize,
    /// Called whenever the transfer has to pause, with the suggested wait
    /// duration and the number of bytes already written. Returning `false`
    /// aborts the transfer.
    pub wait: Box<dyn FnMut(Duration, usize) -> bool + Send>,
}

impl ChunkingParameters {
    /// Default policy: sleep the requested durations, never abort.
    pub fn with_chunk_size(size: usize) -> ChunkingParameters {
        ChunkingParameters {
            interval: Duration::from_millis(1),
            size,
            wait: Box::new(|d, _| {
                std::thread::sleep(d);
                true
            }),
        }
    }
}

impl fmt::Debug for ChunkingParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ChunkingParameters")
            .field("interval", &self.interval)
            .field("size", &self.size)
            .finish()
    }
}

/// Writes `data` through `write` in chunks no larger than the policy
/// size, waiting for the transport to report room between chunks.
///
/// `available` reports how many bytes the transport can currently accept;
/// while it is short of one chunk, the policy wait function is invoked
/// with an estimate of the drain time. A chunk boundary falling inside a
/// SysEx prefers to break just after a terminating `0xF7`.
pub fn write_chunked<A, W>(
    data: &[u8],
    params: &mut ChunkingParameters,
    mut available: A,
    mut write: W,
) -> Result<(), Error>
where
    A: FnMut() -> usize,
    W: FnMut(&[u8]) -> Result<(), Error>,
{
    if data.is_empty() {
        return Ok(());
    }
    let chunk_size = params.size.max(1).min(data.len());

    write(&data[..chunk_size])?;
    let mut written = chunk_size;

    while written < data.len() {
        loop {
            let avail = available();
            if avail >= chunk_size {
                break;
            }
            let drain = Duration::from_micros((chunk_size - avail) as u64 * BYTE_DRAIN_US);
            if !(params.wait)(drain, written) {
                return Err(Error::io("chunked send aborted by wait callback"));
            }
        }
        if !(params.wait)(params.interval, written) {
            return Err(Error::io("chunked send aborted by wait callback"));
        }

        let remaining = &data[written..];
        let mut len = remaining.len();
        // Prefer to end the chunk at a SysEx terminator.
        if let Some(end) = remaining.iter().position(|&b| b == 0xF7) {
            len = end + 1;
        }
        if len > chunk_size {
            len = chunk_size;
        }
        write(&remaining[..len])?;
        written += len;
    }
    Ok(())
}

/// Packs a UMP word stream into event lists of at most `max_list_bytes`
/// bytes, never splitting a packet. `flush` receives each full list; an
/// error from it aborts the segmentation.
pub fn segment_ump<F>(words: &[u32], max_list_bytes: usize, mut flush: F) -> Result<(), Error>
where
    F: FnMut(&[u32]) -> Result<(), Error>,
{
    let max_words = max_list_bytes / 4;
    if max_words == 0 {
        return Err(Error::invalid_argument("ump segmentation: list size below one word"));
    }

    let mut start = 0;
    let mut i = 0;
    while i < words.len() {
        let count = Ump::word_count(words[i]);
        if i + count > words.len() {
            return Err(Error::message_size("ump segmentation: truncated trailing packet"));
        }
        if count > max_words {
            return Err(Error::message_size("ump segmentation: packet larger than event list"));
        }
        if i + count - start > max_words {
            flush(&words[start..i])?;
            start = i;
        }
        i += count;
    }
    if start < i {
        flush(&words[start..i])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    fn long_sysex(len: usize) -> Vec<u8> {
        let mut data = vec![0xF0];
        data.extend((0..len - 2).map(|i| (i % 128) as u8));
        data.push(0xF7);
        data
    }

    #[test]
    fn kilobyte_sysex_in_200_byte_chunks() {
        let data = long_sysex(1024);
        let mut params = ChunkingParameters {
            interval: Duration::ZERO,
            size: 200,
            wait: Box::new(|_, _| true),
        };
        let mut writes: Vec<Vec<u8>> = Vec::new();
        write_chunked(&data, &mut params, || 200, |chunk| {
            writes.push(chunk.to_vec());
            Ok(())
        })
        .unwrap();

        assert!(writes.len() >= 6);
        assert!(writes.iter().all(|w| w.len() <= 200));
        let joined: Vec<u8> = writes.concat();
        assert_eq!(joined, data);
    }

    #[test]
    fn wait_refusal_aborts_with_io_error() {
        let data = long_sysex(600);
        let mut calls = 0;
        let mut params = ChunkingParameters {
            interval: Duration::ZERO,
            size: 100,
            wait: Box::new(move |_, _| {
                calls += 1;
                calls < 3
            }),
        };
        let mut writes = 0;
        let err = write_chunked(&data, &mut params, || 100, |_| {
            writes += 1;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Io);
        assert!(writes < 6, "no writes may follow the aborted wait");
    }

    #[test]
    fn wait_reports_bytes_written_so_far() {
        use std::sync::{Arc, Mutex};
        let data = long_sysex(300);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let mut params = ChunkingParameters {
            interval: Duration::ZERO,
            size: 100,
            wait: Box::new(move |_, written| {
                sink.lock().unwrap().push(written);
                true
            }),
        };
        write_chunked(&data, &mut params, || 100, |_| Ok(())).unwrap();
        assert_eq!(*reported.lock().unwrap(), [100, 200]);
    }

    #[test]
    fn chunk_prefers_sysex_boundary() {
        // Two short SysEx messages in one buffer: the second write must
        // stop right after the first terminator it sees.
        let mut data = long_sysex(8);
        data.extend_from_slice(&long_sysex(8));
        let mut params = ChunkingParameters {
            interval: Duration::ZERO,
            size: 6,
            wait: Box::new(|_, _| true),
        };
        let mut writes: Vec<Vec<u8>> = Vec::new();
        write_chunked(&data, &mut params, || 6, |chunk| {
            writes.push(chunk.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(writes[1].last(), Some(&0xF7));
        assert_eq!(writes.concat(), data);
    }

    #[test]
    fn ump_lists_respect_byte_limit() {
        // five 2-word packets into lists of at most 16 bytes (4 words)
        let words: Vec<u32> = (0..5).flat_map(|_| [0x40B32300u32, 0xC8000000]).collect();
        let mut lists: Vec<Vec<u32>> = Vec::new();
        segment_ump(&words, 16, |list| {
            lists.push(list.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(lists.len(), 3);
        assert!(lists.iter().all(|l| l.len() * 4 <= 16));
        let joined: Vec<u32> = lists.concat();
        assert_eq!(joined, words);
    }

    #[test]
    fn ump_packets_are_never_split() {
        // one single-word packet then a 4-word packet, 8-byte lists
        let words = [0x10F80000u32, 0x5000_0000, 1, 2, 3];
        let mut lists: Vec<Vec<u32>> = Vec::new();
        let err = segment_ump(&words, 8, |list| {
            lists.push(list.to_vec());
            Ok(())
        });
        // the 4-word packet cannot fit any 8-byte list
        assert!(err.is_err());
    }

    #[test]
    fn ump_flush_error_aborts() {
        let words = [0x10F80000u32, 0x10F90000, 0x10FA0000];
        let err = segment_ump(&words, 4, |_| Err(Error::io("event list refused")));
        assert_eq!(err.unwrap_err().category(), ErrorCategory::Io);
    }
}
