//! A simulated multi-lane pulse peripheral for host tests and demos.
//!
//! The simulation runs on virtual time. Each transmitting lane reads its ring buffer one half
//! at a time; [`SimulatedPeripheral::step`] advances the clock to the earliest half boundary
//! across all lanes and reports what the hardware would raise there. Dispatch the returned
//! event to the batch's [`InterruptContext`](crate::engine::InterruptContext) yourself, or
//! let [`SimulatedPeripheral::drive`] do it alongside [`Batch::run`](crate::engine::Batch::run).
//!
//! Every transmission is recorded as a [`Frame`] so tests can decode exactly what went out on
//! the wire.
//!
//! ```
//! use embassy_futures::block_on;
//! use embassy_futures::select::{Either, select};
//! use embassy_time::Duration;
//! use pulse_lanes::engine::{Engine, EngineConfig};
//! use pulse_lanes::lane::{LaneConfig, Strip};
//! use pulse_lanes::sim::SimulatedPeripheral;
//! use pulse_lanes::source::SliceSource;
//! use pulse_lanes::waveform::TimingSpec;
//!
//! let data = [0xA5_u8, 0x0F];
//! let mut source = SliceSource::new(&data);
//! let sim: SimulatedPeripheral<2, 16> = SimulatedPeripheral::new(1_000_000_000);
//! let strip = Strip::new(7, TimingSpec::new(400, 400, 450));
//! let engine: Engine<_, 2, 16, 4> =
//!     Engine::new(&sim, EngineConfig::new(1_000_000_000).with_latch_micros(60))?;
//! engine.configure_lane(0, LaneConfig::default())?;
//!
//! let batch = engine.begin_batch()?;
//! batch.submit_job(&strip, &mut source, data.len())?;
//! let interrupts = batch.interrupts();
//! let report = block_on(async {
//!     match select(
//!         batch.run(Duration::from_secs(1)),
//!         sim.drive(|event| interrupts.dispatch(event)),
//!     )
//!     .await
//!     {
//!         Either::First(report) => report,
//!         Either::Second(()) => unreachable!(),
//!     }
//! })?;
//!
//! assert_eq!(report.jobs, 1);
//! assert_eq!(sim.frames()[0].bytes(strip.table()), data);
//! # Ok::<(), pulse_lanes::Error>(())
//! ```

use core::cell::RefCell;
use std::vec::Vec;

use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};

use crate::lane::{LaneConfig, LaneId, ticks_to_duration};
use crate::sink::{LaneEvent, PulseSink};
use crate::waveform::{Level, Waveform, WaveformTable};

/// One transmission on one lane, from `start` to its end marker (or a forced stop).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    /// Lane that transmitted.
    pub lane: LaneId,
    /// Pin attached to the lane when transmission started.
    pub pin: Option<u8>,
    /// Pulses put on the wire, excluding the end marker.
    pub pulses: Vec<Waveform>,
    /// Virtual time the lane started.
    pub started_at: Instant,
    /// Virtual time the lane stopped.
    pub ended_at: Instant,
    /// `false` if the lane was stopped before reaching an end marker.
    pub completed: bool,
}

impl Frame {
    /// Bits decoded with `table`, up to the first pulse that is not a data bit.
    #[must_use]
    pub fn bits(&self, table: &WaveformTable) -> Vec<bool> {
        self.pulses
            .iter()
            .map_while(|pulse| table.decode(pulse))
            .collect()
    }

    /// Whole bytes decoded with `table`, most significant bit first. Trailing bits that do
    /// not fill a byte are dropped.
    #[must_use]
    pub fn bytes(&self, table: &WaveformTable) -> Vec<u8> {
        self.bits(table)
            .chunks_exact(8)
            .map(|chunk| {
                chunk
                    .iter()
                    .fold(0_u8, |byte, &bit| (byte << 1) | u8::from(bit))
            })
            .collect()
    }

    /// Low time after the last high segment, in ticks.
    #[must_use]
    pub fn trailing_low_ticks(&self) -> u32 {
        let mut total = 0_u32;
        for pulse in self.pulses.iter().rev() {
            if pulse.high.level == Level::High {
                return total.saturating_add(u32::from(pulse.low.duration));
            }
            total = total.saturating_add(pulse.total());
        }
        total
    }
}

/// Lane activity in the order it happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SimEvent {
    /// The lane started transmitting.
    Started {
        /// Lane.
        lane: LaneId,
        /// Pin attached at start.
        pin: Option<u8>,
        /// Virtual time.
        at: Instant,
    },
    /// The lane reached an end marker.
    Finished {
        /// Lane.
        lane: LaneId,
        /// Pin attached at the end.
        pin: Option<u8>,
        /// Virtual time.
        at: Instant,
    },
    /// The lane was stopped mid-transmission.
    Stopped {
        /// Lane.
        lane: LaneId,
        /// Virtual time.
        at: Instant,
    },
}

struct Transmission {
    // Half the hardware is currently reading (0 or 1).
    reading: usize,
    boundary: Instant,
    frame: Frame,
}

struct SimLane<const SLOTS: usize> {
    config: Option<LaneConfig>,
    pin: Option<u8>,
    slots: [Waveform; SLOTS],
    threshold: Option<usize>,
    transmission: Option<Transmission>,
}

impl<const SLOTS: usize> SimLane<SLOTS> {
    const HALF: usize = SLOTS / 2;

    fn new() -> Self {
        Self {
            config: None,
            pin: None,
            slots: [Waveform::ZERO_PULSE; SLOTS],
            threshold: None,
            transmission: None,
        }
    }

    /// Ticks the hardware spends in `half`, stopping early at an end marker.
    fn half_ticks(slots: &[Waveform; SLOTS], half: usize) -> u64 {
        slots
            .iter()
            .skip(half.saturating_mul(Self::HALF))
            .take(Self::HALF)
            .take_while(|pulse| !pulse.is_end_marker())
            .fold(0_u64, |sum, pulse| sum.saturating_add(u64::from(pulse.total())))
    }
}

struct SimState<const LANES: usize, const SLOTS: usize> {
    now: Instant,
    lanes: [SimLane<SLOTS>; LANES],
    frames: Vec<Frame>,
    events: Vec<SimEvent>,
    peak_transmitting: usize,
    owned_half_writes: usize,
}

impl<const LANES: usize, const SLOTS: usize> SimState<LANES, SLOTS> {
    fn transmitting(&self) -> usize {
        self.lanes
            .iter()
            .filter(|lane| lane.transmission.is_some())
            .count()
    }
}

/// Virtual-time stand-in for a `LANES`-lane peripheral with `SLOTS` slots per lane.
///
/// Implements [`PulseSink`] by shared reference, so a test can hand `&sim` to the engine and
/// keep stepping and inspecting it.
pub struct SimulatedPeripheral<const LANES: usize, const SLOTS: usize> {
    clock_hz: u32,
    builtin_threshold: bool,
    state: Mutex<CriticalSectionRawMutex, RefCell<SimState<LANES, SLOTS>>>,
}

impl<const LANES: usize, const SLOTS: usize> SimulatedPeripheral<LANES, SLOTS> {
    /// Creates an idle peripheral whose pulse ticks run at `clock_hz`.
    #[must_use]
    pub fn new(clock_hz: u32) -> Self {
        Self {
            clock_hz,
            builtin_threshold: false,
            state: Mutex::new(RefCell::new(SimState {
                now: Instant::from_ticks(0),
                lanes: core::array::from_fn(|_| SimLane::new()),
                frames: Vec::new(),
                events: Vec::new(),
                peak_transmitting: 0,
                owned_half_writes: 0,
            })),
        }
    }

    /// Raises threshold events on every half boundary, whether or not they were armed.
    #[must_use]
    pub fn with_builtin_threshold(mut self) -> Self {
        self.builtin_threshold = true;
        self
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.with_state(|state| state.now)
    }

    /// Moves the virtual clock forward, as if the interrupt handler were delayed.
    pub fn inject_latency(&self, latency: Duration) {
        self.with_state(|state| {
            state.now = state.now.checked_add(latency).unwrap_or(state.now);
        });
    }

    /// Advances to the next half boundary on any lane and returns the resulting event.
    ///
    /// Returns `None` when no lane is transmitting, or when the boundary raised nothing
    /// because no threshold was armed.
    pub fn step(&self) -> Option<LaneEvent> {
        let clock_hz = self.clock_hz;
        let builtin_threshold = self.builtin_threshold;
        self.with_state(|state| {
            let (lane_id, boundary) = state
                .lanes
                .iter()
                .enumerate()
                .filter_map(|(id, lane)| lane.transmission.as_ref().map(|tx| (id, tx.boundary)))
                .min_by_key(|&(_, boundary)| boundary)?;
            if boundary > state.now {
                state.now = boundary;
            }
            let now = state.now;

            let lane = state.lanes.get_mut(lane_id)?;
            let tx = lane.transmission.as_mut()?;
            let mut reached_end = false;
            for pulse in lane
                .slots
                .iter()
                .skip(tx.reading.saturating_mul(SimLane::<SLOTS>::HALF))
                .take(SimLane::<SLOTS>::HALF)
            {
                if pulse.is_end_marker() {
                    reached_end = true;
                    break;
                }
                tx.frame.pulses.push(*pulse);
            }

            if reached_end {
                let pin = lane.pin;
                let mut tx = lane.transmission.take()?;
                tx.frame.ended_at = now;
                tx.frame.completed = true;
                state.frames.push(tx.frame);
                state.events.push(SimEvent::Finished {
                    lane: lane_id,
                    pin,
                    at: now,
                });
                return Some(LaneEvent::TransmitDone(lane_id));
            }

            tx.reading = if tx.reading == 0 { 1 } else { 0 };
            let span = ticks_to_duration(SimLane::half_ticks(&lane.slots, tx.reading), clock_hz);
            tx.boundary = now.checked_add(span).unwrap_or(now);
            if builtin_threshold || lane.threshold.is_some() {
                Some(LaneEvent::Threshold(lane_id))
            } else {
                None
            }
        })
    }

    /// Steps forever, handing each event to `on_event`. Run it in `select` with
    /// [`Batch::run`](crate::engine::Batch::run).
    pub async fn drive(&self, mut on_event: impl FnMut(LaneEvent)) {
        loop {
            if let Some(event) = self.step() {
                on_event(event);
            }
            yield_now().await;
        }
    }

    /// Every frame transmitted so far, in completion order.
    #[must_use]
    pub fn frames(&self) -> Vec<Frame> {
        self.with_state(|state| state.frames.clone())
    }

    /// Frames transmitted on `pin`, in completion order.
    #[must_use]
    pub fn frames_on_pin(&self, pin: u8) -> Vec<Frame> {
        self.with_state(|state| {
            state
                .frames
                .iter()
                .filter(|frame| frame.pin == Some(pin))
                .cloned()
                .collect()
        })
    }

    /// Lane start and stop history.
    #[must_use]
    pub fn events(&self) -> Vec<SimEvent> {
        self.with_state(|state| state.events.clone())
    }

    /// Forgets recorded frames and events. Lane state and the clock are kept.
    pub fn clear_history(&self) {
        self.with_state(|state| {
            state.frames.clear();
            state.events.clear();
            state.peak_transmitting = 0;
        });
    }

    /// Lanes transmitting right now.
    #[must_use]
    pub fn transmitting(&self) -> usize {
        self.with_state(|state| state.transmitting())
    }

    /// Most lanes ever transmitting at once.
    #[must_use]
    pub fn peak_transmitting(&self) -> usize {
        self.with_state(|state| state.peak_transmitting)
    }

    /// Slot writes that landed in the half a lane was transmitting at the time.
    #[must_use]
    pub fn owned_half_writes(&self) -> usize {
        self.with_state(|state| state.owned_half_writes)
    }

    /// Current contents of `lane`'s ring buffer.
    #[must_use]
    pub fn slots(&self, lane: LaneId) -> Vec<Waveform> {
        self.with_state(|state| {
            state
                .lanes
                .get(lane)
                .map(|lane| lane.slots.to_vec())
                .unwrap_or_default()
        })
    }

    /// Configuration applied to `lane`, if any.
    #[must_use]
    pub fn lane_config(&self, lane: LaneId) -> Option<LaneConfig> {
        self.with_state(|state| state.lanes.get(lane).and_then(|lane| lane.config))
    }

    /// Pin currently attached to `lane`.
    #[must_use]
    pub fn attached_pin(&self, lane: LaneId) -> Option<u8> {
        self.with_state(|state| state.lanes.get(lane).and_then(|lane| lane.pin))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut SimState<LANES, SLOTS>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    fn with_lane(&self, lane: LaneId, f: impl FnOnce(&mut SimLane<SLOTS>, Instant)) {
        self.with_state(|state| {
            let now = state.now;
            if let Some(lane) = state.lanes.get_mut(lane) {
                f(lane, now);
            }
        });
    }
}

impl<const LANES: usize, const SLOTS: usize> PulseSink for &SimulatedPeripheral<LANES, SLOTS> {
    const MAX_LANES: usize = LANES;
    const MAX_SLOTS: usize = SLOTS;

    fn configure(&mut self, lane: LaneId, config: &LaneConfig) {
        self.with_lane(lane, |lane, _| lane.config = Some(*config));
    }

    fn attach(&mut self, lane: LaneId, pin: u8) {
        self.with_lane(lane, |lane, _| lane.pin = Some(pin));
    }

    fn detach(&mut self, lane: LaneId, pin: u8) {
        self.with_lane(lane, |lane, _| {
            if lane.pin == Some(pin) {
                lane.pin = None;
            }
        });
    }

    fn write_slot(&mut self, lane_id: LaneId, offset: usize, waveform: Waveform) {
        self.with_state(|state| {
            let Some(lane) = state.lanes.get_mut(lane_id) else {
                return;
            };
            if let Some(tx) = &lane.transmission
                && offset / SimLane::<SLOTS>::HALF.max(1) == tx.reading
            {
                state.owned_half_writes = state.owned_half_writes.saturating_add(1);
            }
            if let Some(slot) = lane.slots.get_mut(offset) {
                *slot = waveform;
            }
        });
    }

    fn arm_threshold(&mut self, lane: LaneId, half: usize) {
        self.with_lane(lane, |lane, _| lane.threshold = Some(half));
    }

    fn start(&mut self, lane_id: LaneId) {
        let clock_hz = self.clock_hz;
        self.with_state(|state| {
            let now = state.now;
            let Some(lane) = state.lanes.get_mut(lane_id) else {
                return;
            };
            let span = ticks_to_duration(SimLane::half_ticks(&lane.slots, 0), clock_hz);
            lane.transmission = Some(Transmission {
                reading: 0,
                boundary: now.checked_add(span).unwrap_or(now),
                frame: Frame {
                    lane: lane_id,
                    pin: lane.pin,
                    pulses: Vec::new(),
                    started_at: now,
                    ended_at: now,
                    completed: false,
                },
            });
            state.events.push(SimEvent::Started {
                lane: lane_id,
                pin: lane.pin,
                at: now,
            });
            state.peak_transmitting = state.peak_transmitting.max(state.transmitting());
        });
    }

    fn stop(&mut self, lane_id: LaneId) {
        self.with_state(|state| {
            let now = state.now;
            let Some(mut tx) = state
                .lanes
                .get_mut(lane_id)
                .and_then(|lane| lane.transmission.take())
            else {
                return;
            };
            tx.frame.ended_at = now;
            state.frames.push(tx.frame);
            state.events.push(SimEvent::Stopped { lane: lane_id, at: now });
        });
    }

    fn now(&self) -> Instant {
        SimulatedPeripheral::now(self)
    }

    fn idle_for(&mut self, duration: Duration) -> Duration {
        self.inject_latency(duration);
        Duration::from_ticks(0)
    }
}
