//! Bit-to-pulse encoding for clockless LED protocols.
//!
//! A clockless protocol encodes each bit as one high/low pulse. The three durations of a
//! [`TimingSpec`] describe both pulses at once:
//!
//! ```text
//!         t1      t2      t3
//! ONE   ‾‾‾‾‾‾‾‾‾‾‾‾‾‾‾|_______
//! ZERO  ‾‾‾‾‾‾‾|_______________
//! ```
//!
//! # Example
//!
//! ```
//! use pulse_lanes::waveform::{TimingSpec, WaveformTable};
//!
//! // WS2812 at 80 MHz: 400 ns / 400 ns / 450 ns.
//! let timing = TimingSpec::from_nanos(400, 400, 450, 80_000_000);
//! let table = WaveformTable::build(timing);
//! assert_eq!(table.one.high.duration, 64);
//! assert_eq!(table.zero.low.duration, 68);
//! assert_eq!(table.one.total(), table.zero.total());
//! ```

/// Output level of one pulse segment.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub enum Level {
    /// Line driven low.
    #[default]
    Low,
    /// Line driven high.
    High,
}

/// One (level, duration) half of a pulse. Durations are in device-cycle ticks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct Segment {
    /// Output level for this segment.
    pub level: Level,
    /// Length of the segment in device-cycle ticks.
    pub duration: u16,
}

impl Segment {
    /// Creates a segment.
    #[must_use]
    pub const fn new(level: Level, duration: u16) -> Self {
        Self { level, duration }
    }
}

/// A single encoded pulse: a high segment followed by a low segment.
///
/// A segment with duration 0 marks the end of a transmission; the peripheral halts when it
/// reaches one.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct Waveform {
    /// Leading segment (high for encoded bits).
    pub high: Segment,
    /// Trailing segment (always low).
    pub low: Segment,
}

impl Waveform {
    /// Padding pulse written after a job runs out of data. Doubles as the end marker.
    pub const ZERO_PULSE: Self = Self {
        high: Segment::new(Level::Low, 0),
        low: Segment::new(Level::Low, 0),
    };

    /// Creates a high-then-low pulse.
    #[must_use]
    pub const fn new(high_ticks: u16, low_ticks: u16) -> Self {
        Self {
            high: Segment::new(Level::High, high_ticks),
            low: Segment::new(Level::Low, low_ticks),
        }
    }

    /// An all-low pulse lasting `ticks`, used when the latch cannot be folded into the
    /// previous pulse. Below 2 ticks one segment is empty and the pulse ends transmission.
    #[must_use]
    pub const fn latch(ticks: u16) -> Self {
        let first = ticks / 2;
        Self {
            high: Segment::new(Level::Low, first),
            low: Segment::new(Level::Low, ticks.saturating_sub(first)),
        }
    }

    /// The same pulse with its low segment replaced by `ticks`.
    #[must_use]
    pub const fn with_low_duration(self, ticks: u16) -> Self {
        Self {
            high: self.high,
            low: Segment::new(Level::Low, ticks),
        }
    }

    /// Total pulse length in ticks.
    #[must_use]
    pub const fn total(&self) -> u32 {
        (self.high.duration as u32).saturating_add(self.low.duration as u32)
    }

    /// Whether the peripheral stops when it reaches this pulse.
    #[must_use]
    pub const fn is_end_marker(&self) -> bool {
        self.high.duration == 0 || self.low.duration == 0
    }
}

/// Three duration segments (T1, T2, T3) in device-cycle ticks.
///
/// ONE is high for `t1 + t2` and low for `t3`; ZERO is high for `t1` and low for `t2 + t3`.
/// Values are not validated; nonsensical timings simply produce unusable waveforms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct TimingSpec {
    /// High time shared by both bit values.
    pub t1: u16,
    /// Extra high time of a ONE (extra low time of a ZERO).
    pub t2: u16,
    /// Low time shared by both bit values.
    pub t3: u16,
}

impl TimingSpec {
    /// Creates a timing from tick counts.
    #[must_use]
    pub const fn new(t1: u16, t2: u16, t3: u16) -> Self {
        Self { t1, t2, t3 }
    }

    /// Converts datasheet nanoseconds into ticks of a `clock_hz` peripheral clock.
    ///
    /// Results saturate at `u16::MAX`.
    #[must_use]
    pub const fn from_nanos(t1_ns: u32, t2_ns: u32, t3_ns: u32, clock_hz: u32) -> Self {
        Self {
            t1: nanos_to_ticks(t1_ns, clock_hz),
            t2: nanos_to_ticks(t2_ns, clock_hz),
            t3: nanos_to_ticks(t3_ns, clock_hz),
        }
    }

    /// Length of one encoded bit in ticks.
    #[must_use]
    pub const fn bit_ticks(&self) -> u32 {
        (self.t1 as u32)
            .saturating_add(self.t2 as u32)
            .saturating_add(self.t3 as u32)
    }
}

/// WS2812/WS2812B timing at 800 kHz, in nanoseconds (T1, T2, T3).
pub const WS2812_NANOS: (u32, u32, u32) = (250, 625, 375);

/// SK6812 timing at 800 kHz, in nanoseconds (T1, T2, T3).
pub const SK6812_NANOS: (u32, u32, u32) = (300, 600, 300);

/// WS2811 timing at 400 kHz, in nanoseconds (T1, T2, T3).
pub const WS2811_400KHZ_NANOS: (u32, u32, u32) = (500, 700, 1300);

const fn nanos_to_ticks(nanos: u32, clock_hz: u32) -> u16 {
    let ticks = (nanos as u64).saturating_mul(clock_hz as u64) / 1_000_000_000;
    if ticks > u16::MAX as u64 {
        u16::MAX
    } else {
        ticks as u16
    }
}

/// The two canonical waveforms for one [`TimingSpec`].
///
/// Built once and shared read-only by every job that uses the same timing.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct WaveformTable {
    /// Waveform for a 0 bit.
    pub zero: Waveform,
    /// Waveform for a 1 bit.
    pub one: Waveform,
}

impl WaveformTable {
    /// Precomputes ZERO and ONE. Sums saturate instead of wrapping.
    #[must_use]
    pub const fn build(timing: TimingSpec) -> Self {
        Self {
            zero: Waveform::new(timing.t1, timing.t2.saturating_add(timing.t3)),
            one: Waveform::new(timing.t1.saturating_add(timing.t2), timing.t3),
        }
    }

    /// Waveform for `bit`.
    #[must_use]
    pub const fn encode(&self, bit: bool) -> Waveform {
        if bit { self.one } else { self.zero }
    }

    /// Recovers the bit a pulse was encoded from, by its high duration.
    ///
    /// Returns `None` for pulses that match neither waveform (padding, latch pulses).
    #[must_use]
    pub fn decode(&self, pulse: &Waveform) -> Option<bool> {
        if pulse.high.level != Level::High {
            return None;
        }
        if pulse.high.duration == self.one.high.duration {
            Some(true)
        } else if pulse.high.duration == self.zero.high.duration {
            Some(false)
        } else {
            None
        }
    }
}
