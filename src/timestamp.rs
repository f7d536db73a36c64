use std::sync::OnceLock;
use std::time::Instant;

/// Timestamp in nanoseconds. The zero reference depends on the
/// [`TimestampMode`] the stream was opened with.
pub type Timestamp = i64;

/// How timestamps attached to incoming messages are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampMode {
    /// No timestamping at all, every timestamp is zero.
    None,
    /// Nanoseconds since the previous message on the same stream
    /// (zero for the first one).
    Relative,
    /// Whatever native reference the host API provides (ALSA queue time,
    /// JACK frame time converted, mach host time...). Closest to the real
    /// arrival time of the event. Falls back to [`TimestampMode::SystemMonotonic`]
    /// when the backend has no native timestamping.
    #[default]
    Absolute,
    /// A steady-clock reading taken inside the library when the data
    /// arrives. Less precise than `Absolute` but directly comparable
    /// across streams and with the caller's own clock reads.
    SystemMonotonic,
    /// Sample offset inside the current audio buffer. Only meaningful for
    /// audio-callback-driven backends (JACK, PipeWire); zero elsewhere.
    AudioFrame,
    /// The user-supplied timestamping function is called with the best
    /// available `Absolute` value as input.
    Custom,
}

/// What timing information a given backend can natively produce.
/// Each backend declares one of these as a constant.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampInfo {
    pub has_absolute: bool,
    pub absolute_is_monotonic: bool,
    pub has_samples: bool,
}

/// Custom timestamping function: receives the reference timestamp in
/// nanoseconds and returns the value to deliver.
pub type TimestampFn = Box<dyn FnMut(Timestamp) -> Timestamp + Send>;

/// Steady-clock reading in nanoseconds since an arbitrary but fixed
/// process-wide origin.
pub fn monotonic_ns() -> Timestamp {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(epoch).as_nanos() as Timestamp
}

/// Reconciles a backend's native timing capabilities with the mode the
/// caller asked for. One per input stream; [`Timestamper::resolve`] is
/// called once per delivered message.
pub(crate) struct Timestamper {
    mode: TimestampMode,
    info: TimestampInfo,
    custom: Option<TimestampFn>,
    started: bool,
    last: Timestamp,
}

impl Timestamper {
    pub fn new(mode: TimestampMode, info: TimestampInfo, custom: Option<TimestampFn>) -> Timestamper {
        Timestamper { mode, info, custom, started: false, last: 0 }
    }

    /// `absolute` is the backend's native timestamp for the current slice
    /// if it has one; `samples` the frame offset for audio backends.
    pub fn resolve(&mut self, absolute: Option<Timestamp>, samples: Timestamp) -> Timestamp {
        let reference = || match absolute {
            Some(ts) if self.info.has_absolute => ts,
            _ => monotonic_ns(),
        };
        match self.mode {
            TimestampMode::None => 0,
            TimestampMode::Relative => {
                let now = reference();
                let delta = if self.started { now - self.last } else { 0 };
                self.started = true;
                self.last = now;
                delta
            }
            TimestampMode::Absolute | TimestampMode::SystemMonotonic => {
                if self.mode == TimestampMode::Absolute {
                    reference()
                } else {
                    monotonic_ns()
                }
            }
            TimestampMode::AudioFrame => {
                if self.info.has_samples {
                    samples
                } else {
                    0
                }
            }
            TimestampMode::Custom => {
                let reference = reference();
                match self.custom.as_mut() {
                    Some(f) => f(reference),
                    None => reference,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NATIVE: TimestampInfo =
        TimestampInfo { has_absolute: true, absolute_is_monotonic: true, has_samples: false };
    const BARE: TimestampInfo =
        TimestampInfo { has_absolute: false, absolute_is_monotonic: false, has_samples: false };

    #[test]
    fn none_mode_is_always_zero() {
        let mut t = Timestamper::new(TimestampMode::None, NATIVE, None);
        assert_eq!(t.resolve(Some(123), 0), 0);
        assert_eq!(t.resolve(Some(456), 0), 0);
    }

    #[test]
    fn relative_starts_at_zero_and_sums_to_span() {
        let mut t = Timestamper::new(TimestampMode::Relative, NATIVE, None);
        let stamps = [1_000, 1_500, 4_000, 4_000, 9_000];
        let deltas: Vec<i64> = stamps.iter().map(|&ts| t.resolve(Some(ts), 0)).collect();
        assert_eq!(deltas[0], 0);
        assert!(deltas.iter().all(|&d| d >= 0));
        assert_eq!(deltas.iter().sum::<i64>(), stamps[4] - stamps[0]);
    }

    #[test]
    fn absolute_passes_native_timestamps_through() {
        let mut t = Timestamper::new(TimestampMode::Absolute, NATIVE, None);
        assert_eq!(t.resolve(Some(777), 0), 777);
    }

    #[test]
    fn absolute_falls_back_to_monotonic() {
        let mut t = Timestamper::new(TimestampMode::Absolute, BARE, None);
        let a = t.resolve(Some(777), 0);
        let b = t.resolve(Some(778), 0);
        assert!(a > 0 && b >= a, "expected steady clock readings, got {a} then {b}");
    }

    #[test]
    fn monotonic_mode_is_nondecreasing() {
        let mut t = Timestamper::new(TimestampMode::SystemMonotonic, NATIVE, None);
        let mut prev = t.resolve(Some(0), 0);
        for _ in 0..100 {
            let next = t.resolve(Some(0), 0);
            assert!(next >= prev);
            prev = next;
        }
    }

    #[test]
    fn audio_frame_uses_samples_only_when_declared() {
        let with = TimestampInfo { has_samples: true, ..BARE };
        let mut t = Timestamper::new(TimestampMode::AudioFrame, with, None);
        assert_eq!(t.resolve(None, 64), 64);
        let mut t = Timestamper::new(TimestampMode::AudioFrame, BARE, None);
        assert_eq!(t.resolve(None, 64), 0);
    }

    #[test]
    fn custom_receives_the_absolute_reference() {
        let mut t = Timestamper::new(
            TimestampMode::Custom,
            NATIVE,
            Some(Box::new(|ts| ts * 2)),
        );
        assert_eq!(t.resolve(Some(21), 0), 42);
    }
}
