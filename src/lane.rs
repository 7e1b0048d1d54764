//! Physical transmission lanes and the strips that run on them.

use embassy_time::{Duration, Instant};

use crate::job::JobIndex;
use crate::waveform::{Level, TimingSpec, Waveform, WaveformTable};

/// Index of a hardware lane (channel) of the pulse peripheral.
pub type LaneId = usize;

/// One-time peripheral settings for a lane.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct LaneConfig {
    /// Divider from the peripheral source clock to the tick used by pulse durations.
    pub clock_divider: u8,
    /// Level the pin rests at between transmissions.
    pub idle_level: Level,
}

impl LaneConfig {
    /// Default lane configuration: undivided clock, line idles low.
    pub const DEFAULT: Self = Self {
        clock_divider: 1,
        idle_level: Level::Low,
    };
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// One logical LED strip: its data pin and protocol timing.
///
/// Lanes are pooled, so the pin is routed to whichever lane the strip's job is assigned.
/// The waveform table is computed once here and shared by every job for this strip.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct Strip {
    pin: u8,
    timing: TimingSpec,
    table: WaveformTable,
}

impl Strip {
    /// Creates a strip on GPIO `pin` using `timing`.
    #[must_use]
    pub const fn new(pin: u8, timing: TimingSpec) -> Self {
        Self {
            pin,
            timing,
            table: WaveformTable::build(timing),
        }
    }

    /// GPIO pin carrying the strip's data.
    #[must_use]
    pub const fn pin(&self) -> u8 {
        self.pin
    }

    /// Protocol timing.
    #[must_use]
    pub const fn timing(&self) -> TimingSpec {
        self.timing
    }

    /// Precomputed ZERO/ONE waveforms.
    #[must_use]
    pub const fn table(&self) -> &WaveformTable {
        &self.table
    }
}

/// Which half of the lane buffer the write cursor is in.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub enum Half {
    /// Slots `0..SLOTS / 2`.
    #[default]
    First,
    /// Slots `SLOTS / 2..SLOTS`.
    Second,
}

impl Half {
    /// 0 for the first half, 1 for the second.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::First => 0,
            Self::Second => 1,
        }
    }

    const fn flip(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

/// Engine-side bookkeeping for one hardware lane.
///
/// The slot memory itself belongs to the peripheral; the lane tracks where the next refill
/// goes and which job it is feeding.
pub(crate) struct Lane<const SLOTS: usize> {
    pub(crate) id: LaneId,
    pub(crate) configured: bool,
    cursor: usize,
    half: Half,
    pub(crate) job: Option<JobIndex>,
    pub(crate) table: WaveformTable,
    pub(crate) pin: u8,
    pub(crate) expected_refill: Duration,
    pub(crate) last_refill: Instant,
    last_written: Option<(usize, Waveform)>,
}

impl<const SLOTS: usize> Lane<SLOTS> {
    pub(crate) const HALF: usize = SLOTS / 2;

    pub(crate) fn new(id: LaneId) -> Self {
        Self {
            id,
            configured: false,
            cursor: 0,
            half: Half::First,
            job: None,
            table: WaveformTable::default(),
            pin: 0,
            expected_refill: Duration::from_ticks(0),
            last_refill: Instant::from_ticks(0),
            last_written: None,
        }
    }

    /// Binds a job to this lane and rewinds the buffer cursor.
    pub(crate) fn assign(
        &mut self,
        job: JobIndex,
        strip: &Strip,
        clock_hz: u32,
        now: Instant,
    ) {
        self.job = Some(job);
        self.table = *strip.table();
        self.pin = strip.pin();
        self.cursor = 0;
        self.half = Half::First;
        self.last_written = None;
        self.expected_refill = half_duration(strip.timing(), Self::HALF, clock_hz);
        self.last_refill = now;
    }

    pub(crate) fn release(&mut self) -> Option<JobIndex> {
        self.last_written = None;
        self.job.take()
    }

    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn half(&self) -> Half {
        self.half
    }

    pub(crate) fn last_written(&self) -> Option<(usize, Waveform)> {
        self.last_written
    }

    pub(crate) fn record_write(&mut self, slot: usize, pulse: Waveform) {
        self.last_written = Some((slot, pulse));
    }

    /// Moves the cursor one slot forward, wrapping at `SLOTS` and flipping halves.
    pub(crate) fn advance(&mut self) {
        let next = self.cursor.saturating_add(1);
        self.cursor = if next >= SLOTS { 0 } else { next };
        if self.cursor == 0 || self.cursor == Self::HALF {
            self.half = self.half.flip();
        }
    }
}

/// Time the hardware needs to drain `slots` pulses of `timing`.
pub(crate) fn half_duration(timing: TimingSpec, slots: usize, clock_hz: u32) -> Duration {
    let ticks = u64::from(timing.bit_ticks()).saturating_mul(slots as u64);
    ticks_to_duration(ticks, clock_hz)
}

/// Converts device ticks at `clock_hz` into an embassy [`Duration`], rounding up.
#[must_use]
pub fn ticks_to_duration(ticks: u64, clock_hz: u32) -> Duration {
    if clock_hz == 0 {
        return Duration::from_ticks(0);
    }
    let nanos = ticks.saturating_mul(1_000_000_000) / u64::from(clock_hz);
    Duration::from_nanos(nanos)
}
