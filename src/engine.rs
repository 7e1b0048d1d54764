//! The multi-lane pulse engine: lane setup, batch scheduling and interrupt dispatch.
//!
//! An [`Engine`] owns a [`PulseSink`] with `LANES` lanes of `SLOTS` pulse slots each. Every
//! frame goes out as one [`Batch`]: open it with [`Engine::begin_batch`], submit up to
//! `MAX_JOBS` jobs, then [`Batch::run`] it. Every job streams one strip's bytes through a
//! lane, two half-buffers at a time. Jobs beyond the lane count wait in FIFO order and take
//! over lanes as earlier jobs finish.
//!
//! A batch borrows its byte sources only until it is dropped, so the next frame can be
//! rendered into the same buffers. Dropping a batch, or a [`Batch::run`] future, while lanes
//! are still transmitting stops those lanes and discards the batch.
//!
//! The caller side and the interrupt side ([`InterruptContext`]) share the engine state and
//! the batch's job table behind critical-section mutexes. The interrupt side never blocks:
//! every entry point does a bounded amount of work and returns.
//!
//! # Example
//!
//! ```no_run
//! # use pulse_lanes::Result;
//! use embassy_time::Duration;
//! use pulse_lanes::engine::{Engine, EngineConfig};
//! use pulse_lanes::lane::{LaneConfig, Strip};
//! use pulse_lanes::sink::PulseSink;
//! use pulse_lanes::source::SliceSource;
//! use pulse_lanes::waveform::{TimingSpec, WS2812_NANOS};
//!
//! async fn show<P: PulseSink>(sink: P, left: &mut [u8], right: &[u8]) -> Result<()> {
//!     const CLOCK_HZ: u32 = 80_000_000;
//!     let (t1, t2, t3) = WS2812_NANOS;
//!     let timing = TimingSpec::from_nanos(t1, t2, t3, CLOCK_HZ);
//!     let left_strip = Strip::new(4, timing);
//!     let right_strip = Strip::new(5, timing);
//!
//!     // 2 lanes, 64 slots per lane, up to 8 strips per batch.
//!     let engine: Engine<P, 2, 64, 8> = Engine::new(sink, EngineConfig::new(CLOCK_HZ))?;
//!     engine.configure_lane(0, LaneConfig::default())?;
//!     engine.configure_lane(1, LaneConfig::default())?;
//!
//!     for level in [0x10_u8, 0x20] {
//!         left.fill(level);
//!         let mut left_source = SliceSource::new(left);
//!         let mut right_source = SliceSource::new(right);
//!
//!         let batch = engine.begin_batch()?;
//!         // The interrupt handler calls `batch.interrupts().dispatch(event)`.
//!         batch.submit_job(&left_strip, &mut left_source, left.len())?;
//!         batch.submit_job(&right_strip, &mut right_source, right.len())?;
//!         let report = batch.run(Duration::from_millis(50)).await?;
//!         assert_eq!(report.jobs, 2);
//!     }
//!     Ok(())
//! }
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant, Timer};
use fixed::types::U32F32;
use heapless::Vec;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::completion::Completion;
use crate::filler;
use crate::job::{Job, JobHandle, JobIndex};
use crate::lane::{Lane, LaneConfig, LaneId, Strip};
use crate::scheduler::Scheduler;
use crate::sink::{LaneEvent, PulseSink};
use crate::source::ByteSource;
use crate::{Error, Result};

pub use crate::scheduler::BatchPhase;

// ============================================================================
// Configuration
// ============================================================================

/// Default peripheral tick rate (`80 MHz`).
pub const CLOCK_HZ_DEFAULT: u32 = 80_000_000;

/// Default latch (reset) time appended after the last bit (`300 µs`).
///
/// Older WS2812 parts latch after 50 µs; newer revisions need roughly 280 µs.
pub const LATCH_US_DEFAULT: u32 = 300;

/// Default bail-out factor (`1.5`): a refill later than this many expected refill intervals
/// truncates the job.
pub const BAIL_OUT_FACTOR_DEFAULT: U32F32 = U32F32::from_bits(3 << 31);

/// Default minimum gap between the end of one batch and the start of the next (`50 µs`).
pub const MIN_BATCH_GAP_DEFAULT: Duration = Duration::from_micros(50);

/// Shortest latch the engine accepts, in ticks. A latch pulse needs two non-empty segments.
pub const LATCH_TICKS_MIN: u32 = 2;

/// How the half-buffer threshold notification is set up.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub enum ThresholdMode {
    /// The engine arms the threshold with [`PulseSink::arm_threshold`] on every promotion.
    #[default]
    Armed,
    /// The peripheral's built-in sequencer raises threshold events on its own.
    Builtin,
}

/// Engine-wide settings. Lane count, slots per lane and job capacity are const generics of
/// [`Engine`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// Tick rate of pulse durations, after the lane clock divider.
    pub clock_hz: u32,
    /// Low time appended after the final bit of every job, in ticks.
    ///
    /// Must fit one pulse segment (`2..=u16::MAX`); [`Engine::new`] rejects anything else.
    pub latch_ticks: u32,
    /// Refills arriving later than `bail_out_factor × expected interval` truncate the job.
    pub bail_out_factor: U32F32,
    /// Minimum time between the end of one batch and the start of the next.
    pub min_batch_gap: Duration,
    /// Whether the engine arms threshold interrupts itself.
    pub threshold_mode: ThresholdMode,
}

impl EngineConfig {
    /// Defaults for a peripheral ticking at `clock_hz`.
    #[must_use]
    pub const fn new(clock_hz: u32) -> Self {
        Self {
            clock_hz,
            latch_ticks: micros_to_ticks(LATCH_US_DEFAULT, clock_hz),
            bail_out_factor: BAIL_OUT_FACTOR_DEFAULT,
            min_batch_gap: MIN_BATCH_GAP_DEFAULT,
            threshold_mode: ThresholdMode::Armed,
        }
    }

    /// Sets the latch time in microseconds.
    #[must_use]
    pub const fn with_latch_micros(mut self, micros: u32) -> Self {
        self.latch_ticks = micros_to_ticks(micros, self.clock_hz);
        self
    }

    /// Sets the bail-out factor.
    #[must_use]
    pub const fn with_bail_out_factor(mut self, factor: U32F32) -> Self {
        self.bail_out_factor = factor;
        self
    }

    /// Sets the minimum inter-batch gap.
    #[must_use]
    pub const fn with_min_batch_gap(mut self, gap: Duration) -> Self {
        self.min_batch_gap = gap;
        self
    }

    /// Sets the threshold mode.
    #[must_use]
    pub const fn with_threshold_mode(mut self, mode: ThresholdMode) -> Self {
        self.threshold_mode = mode;
        self
    }

    /// Latest acceptable refill delay for a lane whose halves drain in `expected`.
    #[must_use]
    pub fn bail_out_limit(&self, expected: Duration) -> Duration {
        let limit = self.bail_out_factor.saturating_mul_int(expected.as_ticks());
        Duration::from_ticks(limit.to_num::<u64>())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(CLOCK_HZ_DEFAULT)
    }
}

const fn micros_to_ticks(micros: u32, clock_hz: u32) -> u32 {
    let ticks = (micros as u64).saturating_mul(clock_hz as u64) / 1_000_000;
    if ticks > u32::MAX as u64 {
        u32::MAX
    } else {
        ticks as u32
    }
}

// ============================================================================
// Reports
// ============================================================================

/// What happened to one job during a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct JobOutcome {
    /// The job's handle.
    pub handle: JobHandle,
    /// Lane the job ran on.
    pub lane: Option<LaneId>,
    /// Position in the order jobs were started (0 = first).
    pub start_order: Option<usize>,
    /// Bits encoded into the lane buffer.
    pub bits_sent: usize,
    /// Whether the job was cut short by the refill bail-out.
    pub truncated: bool,
    /// Whether the lane reported the job's transmission as complete.
    pub done: bool,
}

/// Result of a completed batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchReport<const MAX_JOBS: usize> {
    /// Jobs in the batch.
    pub jobs: usize,
    /// Jobs truncated by the refill bail-out.
    pub truncated: usize,
    /// Per-job outcomes, indexed by [`JobHandle::index`].
    pub outcomes: Vec<JobOutcome, MAX_JOBS>,
}

impl<const MAX_JOBS: usize> BatchReport<MAX_JOBS> {
    /// Outcome of the job behind `handle`.
    #[must_use]
    pub fn outcome(&self, handle: JobHandle) -> Option<&JobOutcome> {
        self.outcomes.get(handle.index())
    }

    /// Handles in the order their jobs were started.
    #[must_use]
    pub fn start_sequence(&self) -> Vec<JobHandle, MAX_JOBS> {
        let mut started: Vec<JobOutcome, MAX_JOBS> = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.start_order.is_some())
            .copied()
            .collect();
        started.sort_unstable_by_key(|outcome| outcome.start_order);
        started.iter().map(|outcome| outcome.handle).collect()
    }
}

/// Running totals across batches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct EngineStats {
    /// Batches completed successfully.
    pub batches: u32,
    /// Times the completion signal fired.
    pub releases: u32,
    /// Jobs truncated by the refill bail-out.
    pub truncated_jobs: u32,
    /// Batches that hit their timeout.
    pub timeouts: u32,
}

// ============================================================================
// Shared state
// ============================================================================

struct EngineState<P, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize> {
    sink: P,
    lanes: [Lane<SLOTS>; LANES],
    scheduler: Scheduler<LANES, MAX_JOBS>,
    last_batch_end: Option<Instant>,
}

impl<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize>
    EngineState<P, LANES, SLOTS, MAX_JOBS>
{
    /// Puts `job_index` on `lane_id`: route the pin, prime both halves, arm, start.
    fn promote(
        &mut self,
        table: &mut JobTable<'_, MAX_JOBS>,
        lane_id: LaneId,
        job_index: JobIndex,
        config: &EngineConfig,
        latch_ticks: u16,
    ) {
        let Self { sink, lanes, .. } = self;
        let Some(lane) = lanes.get_mut(lane_id) else {
            return;
        };
        let start_order = table.next_start_order;
        let Some(job) = table.get_mut(job_index) else {
            return;
        };

        job.lane = Some(lane_id);
        job.start_order = Some(start_order);
        lane.assign(job_index, &job.strip, config.clock_hz, sink.now());
        sink.attach(lane_id, lane.pin);
        filler::prime(sink, lane, Some(job), latch_ticks);
        if config.threshold_mode == ThresholdMode::Armed {
            sink.arm_threshold(lane_id, Lane::<SLOTS>::HALF);
        }
        sink.start(lane_id);
        table.next_start_order = start_order.saturating_add(1);
        trace!(
            "EngineState::promote: job {} on lane {} (pin {})",
            job_index,
            lane_id,
            lane.pin
        );
    }

    /// Stops every busy lane.
    fn force_stop(&mut self) -> usize {
        let mut stopped = 0_usize;
        for lane in &mut self.lanes {
            if lane.release().is_some() {
                self.sink.stop(lane.id);
                self.sink.detach(lane.id, lane.pin);
                stopped = stopped.saturating_add(1);
            }
        }
        stopped
    }
}

/// Jobs of one open batch. Lives in the [`Batch`], so source borrows end with it.
struct JobTable<'b, const MAX_JOBS: usize> {
    jobs: [Option<Job<'b>>; MAX_JOBS],
    count: usize,
    next_start_order: usize,
}

impl<'b, const MAX_JOBS: usize> JobTable<'b, MAX_JOBS> {
    fn new() -> Self {
        Self {
            jobs: core::array::from_fn(|_| None),
            count: 0,
            next_start_order: 0,
        }
    }

    fn get_mut(&mut self, index: JobIndex) -> Option<&mut Job<'b>> {
        self.jobs.get_mut(index).and_then(Option::as_mut)
    }

    fn report(&self) -> BatchReport<MAX_JOBS> {
        let mut outcomes = Vec::new();
        let mut truncated = 0_usize;
        for (index, job) in self.jobs.iter().take(self.count).enumerate() {
            let Some(job) = job else {
                continue;
            };
            if job.truncated {
                truncated = truncated.saturating_add(1);
            }
            // At most MAX_JOBS entries.
            let _ = outcomes.push(JobOutcome {
                handle: JobHandle(index),
                lane: job.lane,
                start_order: job.start_order,
                bits_sent: job.bits_sent(),
                truncated: job.truncated,
                done: job.done,
            });
        }
        BatchReport {
            jobs: self.count,
            truncated,
            outcomes,
        }
    }

    fn clear(&mut self) {
        for job in &mut self.jobs {
            *job = None;
        }
        self.count = 0;
        self.next_start_order = 0;
    }
}

type JobLock<'b, const MAX_JOBS: usize> =
    Mutex<CriticalSectionRawMutex, RefCell<JobTable<'b, MAX_JOBS>>>;

// Started count in the high word, finished count in the low word.
fn pack_progress(started: usize, finished: usize) -> u64 {
    let word = |count: usize| u64::from(u32::try_from(count).unwrap_or(u32::MAX));
    word(started).wrapping_shl(32) | word(finished)
}

fn unpack_progress(packed: u64) -> (usize, usize) {
    let count = |word: u64| usize::try_from(word & u64::from(u32::MAX)).unwrap_or(usize::MAX);
    (count(packed.wrapping_shr(32)), count(packed))
}

// ============================================================================
// Engine
// ============================================================================

/// Multiplexes LED strip jobs onto the lanes of a [`PulseSink`].
///
/// - `LANES`: hardware lanes used (at most `P::MAX_LANES`).
/// - `SLOTS`: pulse slots per lane (even, at most `P::MAX_SLOTS`), refilled half at a time.
/// - `MAX_JOBS`: jobs accepted per batch.
///
/// See the [module documentation](mod@crate::engine) for an example.
pub struct Engine<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize> {
    state: Mutex<CriticalSectionRawMutex, RefCell<EngineState<P, LANES, SLOTS, MAX_JOBS>>>,
    completion: Completion,
    config: EngineConfig,
    latch_ticks: u16,
    progress: AtomicU64,
    batch_open: AtomicBool,
    batches: AtomicU32,
    truncated_jobs: AtomicU32,
    timeouts: AtomicU32,
}

impl<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize>
    Engine<P, LANES, SLOTS, MAX_JOBS>
{
    /// Creates an engine over `sink`.
    ///
    /// Fails if the peripheral has fewer than `LANES` lanes or `SLOTS` slots per lane, if
    /// `SLOTS` cannot be split into two non-empty halves, or if the latch does not fit one
    /// pulse segment at `config.clock_hz`.
    pub fn new(sink: P, config: EngineConfig) -> Result<Self> {
        if LANES > P::MAX_LANES {
            return Err(Error::LaneCapacity {
                requested: LANES,
                supported: P::MAX_LANES,
            });
        }
        if SLOTS > P::MAX_SLOTS {
            return Err(Error::SlotCapacity {
                requested: SLOTS,
                supported: P::MAX_SLOTS,
            });
        }
        if SLOTS < 2 || SLOTS % 2 != 0 {
            return Err(Error::InvalidSlotCount(SLOTS));
        }
        let Some(latch_ticks) = u16::try_from(config.latch_ticks)
            .ok()
            .filter(|ticks| u32::from(*ticks) >= LATCH_TICKS_MIN)
        else {
            warn!(
                "Engine::new: latch of {} ticks outside {}..={}",
                config.latch_ticks,
                LATCH_TICKS_MIN,
                u16::MAX
            );
            return Err(Error::InvalidLatch(config.latch_ticks));
        };

        info!(
            "Engine::new: {} lanes x {} slots, up to {} jobs per batch",
            LANES, SLOTS, MAX_JOBS
        );
        Ok(Self {
            state: Mutex::new(RefCell::new(EngineState {
                sink,
                lanes: core::array::from_fn(Lane::new),
                scheduler: Scheduler::new(),
                last_batch_end: None,
            })),
            completion: Completion::new(),
            config,
            latch_ticks,
            progress: AtomicU64::new(0),
            batch_open: AtomicBool::new(false),
            batches: AtomicU32::new(0),
            truncated_jobs: AtomicU32::new(0),
            timeouts: AtomicU32::new(0),
        })
    }

    /// Engine settings.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One-time setup of `lane_id`. Only configured lanes take part in batches.
    pub fn configure_lane(&self, lane_id: LaneId, lane_config: LaneConfig) -> Result<()> {
        self.with_state(|state| {
            if state.scheduler.phase() == BatchPhase::Draining {
                return Err(Error::BatchInFlight);
            }
            let lane = state
                .lanes
                .get_mut(lane_id)
                .ok_or(Error::LaneOutOfRange(lane_id))?;
            state.sink.configure(lane_id, &lane_config);
            lane.configured = true;
            info!(
                "Engine::configure_lane: lane {} (clock divider {})",
                lane_id, lane_config.clock_divider
            );
            Ok(())
        })
    }

    /// Opens the next batch. Sources submitted to it stay borrowed until it is dropped.
    ///
    /// Only one batch can be open at a time; a second call fails with
    /// [`Error::BatchInFlight`].
    pub fn begin_batch<'b>(&self) -> Result<Batch<'_, 'b, P, LANES, SLOTS, MAX_JOBS>> {
        if self.batch_open.swap(true, Ordering::SeqCst) {
            return Err(Error::BatchInFlight);
        }
        Ok(Batch {
            engine: self,
            jobs: Mutex::new(RefCell::new(JobTable::new())),
        })
    }

    /// Current batch phase.
    #[must_use]
    pub fn phase(&self) -> BatchPhase {
        self.with_state(|state| state.scheduler.phase())
    }

    /// Jobs started and finished in the current batch, read together.
    ///
    /// `started - finished` never exceeds `LANES`.
    #[must_use]
    pub fn progress(&self) -> (usize, usize) {
        unpack_progress(self.progress.load(Ordering::SeqCst))
    }

    /// Jobs started in the current batch.
    #[must_use]
    pub fn started(&self) -> usize {
        self.progress().0
    }

    /// Jobs finished in the current batch.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.progress().1
    }

    /// Jobs currently occupying a lane. Never exceeds `LANES`.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.with_state(|state| {
            state
                .scheduler
                .started()
                .saturating_sub(state.scheduler.finished())
        })
    }

    /// Running totals across batches.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            batches: self.batches.load(Ordering::SeqCst),
            releases: self.completion.releases(),
            truncated_jobs: self.truncated_jobs.load(Ordering::SeqCst),
            timeouts: self.timeouts.load(Ordering::SeqCst),
        }
    }

    /// Runs `f` on the sink, for example to inspect a simulated peripheral.
    pub fn with_sink<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        self.with_state(|state| f(&mut state.sink))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut EngineState<P, LANES, SLOTS, MAX_JOBS>) -> R) -> R {
        self.state.lock(|state| f(&mut state.borrow_mut()))
    }

    fn publish_progress(&self, scheduler: &Scheduler<LANES, MAX_JOBS>) {
        self.progress.store(
            pack_progress(scheduler.started(), scheduler.finished()),
            Ordering::SeqCst,
        );
    }

    /// Waits out what is left of the minimum gap since the previous batch, on the sink's clock.
    async fn wait_for_batch_gap(&self) {
        let remaining = self.with_state(|state| {
            let last = state.last_batch_end?;
            let elapsed = state.sink.now().checked_duration_since(last)?;
            let gap = self.config.min_batch_gap.checked_sub(elapsed)?;
            trace!(
                "Engine::wait_for_batch_gap: {} us left of the inter-batch gap",
                gap.as_micros()
            );
            Some(state.sink.idle_for(gap))
        });
        if let Some(remaining) = remaining
            && remaining.as_ticks() > 0
        {
            Timer::after(remaining).await;
        }
    }
}

// ============================================================================
// Batch
// ============================================================================

/// One frame's worth of jobs, opened with [`Engine::begin_batch`].
///
/// Byte sources are borrowed for `'b` and released when the batch is dropped. Dropping a
/// batch whose lanes are still transmitting stops them first.
pub struct Batch<'e, 'b, P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize>
{
    engine: &'e Engine<P, LANES, SLOTS, MAX_JOBS>,
    jobs: JobLock<'b, MAX_JOBS>,
}

impl<'e, 'b, P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize>
    Batch<'e, 'b, P, LANES, SLOTS, MAX_JOBS>
{
    /// The engine this batch runs on.
    #[must_use]
    pub const fn engine(&self) -> &'e Engine<P, LANES, SLOTS, MAX_JOBS> {
        self.engine
    }

    /// Queues `len` bytes from `source` for `strip`.
    pub fn submit_job(
        &self,
        strip: &Strip,
        source: &'b mut (dyn ByteSource + Send),
        len: usize,
    ) -> Result<JobHandle> {
        self.submit_bits(strip, source, len.saturating_mul(8))
    }

    /// Queues the first `bit_len` bits from `source` (most significant bit first) for `strip`.
    pub fn submit_bits(
        &self,
        strip: &Strip,
        source: &'b mut (dyn ByteSource + Send),
        bit_len: usize,
    ) -> Result<JobHandle> {
        self.engine.with_state(|state| {
            if matches!(
                state.scheduler.phase(),
                BatchPhase::Draining | BatchPhase::Done
            ) {
                return Err(Error::BatchInFlight);
            }
            let index = self.with_jobs(|table| {
                let index = table.count;
                let slot = table.jobs.get_mut(index).ok_or(Error::QueueFull)?;
                *slot = Some(Job::new(*strip, source, bit_len));
                table.count = index.saturating_add(1);
                Ok(index)
            })?;
            state.scheduler.note_submission();
            debug!(
                "Batch::submit_bits: job {} with {} bits on pin {}",
                index,
                bit_len,
                strip.pin()
            );
            Ok(JobHandle(index))
        })
    }

    /// Transmits every submitted job and waits until all of them finish or `timeout` elapses.
    ///
    /// Honors the configured minimum gap since the previous batch before starting. On timeout
    /// all lanes are stopped, the jobs are discarded and [`Error::Timeout`] is returned. If the
    /// returned future is dropped early, the lanes are stopped and the jobs discarded the same
    /// way. Either way the batch accepts new jobs afterwards.
    pub async fn run(&self, timeout: Duration) -> Result<BatchReport<MAX_JOBS>> {
        let engine = self.engine;
        engine.wait_for_batch_gap().await;
        self.kickoff()?;

        let mut guard = AbortOnDrop {
            batch: self,
            armed: true,
        };
        let waited = engine.completion.wait(timeout).await;
        guard.armed = false;
        match waited {
            Ok(()) => {}
            Err(_) if engine.completion.is_released() => {}
            Err(err) => {
                let stopped = self.abort();
                engine.timeouts.fetch_add(1, Ordering::SeqCst);
                warn!("Batch::run: timed out, force-stopped {} lanes", stopped);
                return Err(err);
            }
        }

        let report = engine.with_state(|state| {
            let report = self.with_jobs(|table| {
                let report = table.report();
                table.clear();
                report
            });
            state.scheduler.reset();
            state.last_batch_end = Some(state.sink.now());
            report
        });
        engine.batches.fetch_add(1, Ordering::SeqCst);
        if report.truncated > 0 {
            let truncated = u32::try_from(report.truncated).unwrap_or(u32::MAX);
            engine.truncated_jobs.fetch_add(truncated, Ordering::SeqCst);
            warn!(
                "Batch::run: {} of {} jobs truncated by late refills",
                report.truncated, report.jobs
            );
        }
        debug!("Batch::run: {} jobs complete", report.jobs);
        Ok(report)
    }

    /// Handle for the peripheral's interrupt handler while this batch is open.
    #[must_use]
    pub const fn interrupts(&self) -> InterruptContext<'_, 'b, P, LANES, SLOTS, MAX_JOBS> {
        InterruptContext {
            engine: self.engine,
            jobs: &self.jobs,
        }
    }

    fn with_jobs<R>(&self, f: impl FnOnce(&mut JobTable<'b, MAX_JOBS>) -> R) -> R {
        self.jobs.lock(|jobs| f(&mut jobs.borrow_mut()))
    }

    fn kickoff(&self) -> Result<()> {
        let engine = self.engine;
        let config = engine.config;
        let latch_ticks = engine.latch_ticks;
        let empty = engine.with_state(|state| {
            if matches!(
                state.scheduler.phase(),
                BatchPhase::Draining | BatchPhase::Done
            ) {
                return Err(Error::BatchInFlight);
            }
            self.with_jobs(|table| {
                let total = table.count;
                let configured = state
                    .lanes
                    .iter()
                    .filter(|lane| lane.configured)
                    .map(|lane| lane.id);
                if total > 0 && configured.clone().next().is_none() {
                    return Err(Error::NoLanesConfigured);
                }

                engine.completion.arm();
                state.scheduler.begin(configured, total);
                table.next_start_order = 0;
                for job_index in 0..total {
                    if let Some((lane_id, job_index)) = state.scheduler.submit(job_index) {
                        state.promote(table, lane_id, job_index, &config, latch_ticks);
                    }
                }
                engine.publish_progress(&state.scheduler);
                info!(
                    "Batch::run: {} jobs, {} started",
                    total,
                    state.scheduler.started()
                );
                Ok(total == 0)
            })
        })?;

        if empty {
            engine.completion.release();
        }
        Ok(())
    }

    /// Stops busy lanes and forgets the jobs. Returns how many lanes were stopped.
    fn abort(&self) -> usize {
        let stopped = self.engine.with_state(|state| {
            let stopped = state.force_stop();
            state.scheduler.reset();
            if stopped > 0 {
                state.last_batch_end = Some(state.sink.now());
            }
            stopped
        });
        self.with_jobs(JobTable::clear);
        stopped
    }
}

impl<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize> Drop
    for Batch<'_, '_, P, LANES, SLOTS, MAX_JOBS>
{
    fn drop(&mut self) {
        if self.engine.phase() != BatchPhase::Idle {
            let stopped = self.abort();
            debug!("Batch::drop: discarded open batch, stopped {} lanes", stopped);
        }
        self.engine.batch_open.store(false, Ordering::SeqCst);
    }
}

/// Settles a batch whose `run` future was dropped before the batch finished.
struct AbortOnDrop<
    'a,
    'e,
    'b,
    P: PulseSink,
    const LANES: usize,
    const SLOTS: usize,
    const MAX_JOBS: usize,
> {
    batch: &'a Batch<'e, 'b, P, LANES, SLOTS, MAX_JOBS>,
    armed: bool,
}

impl<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize> Drop
    for AbortOnDrop<'_, '_, '_, P, LANES, SLOTS, MAX_JOBS>
{
    fn drop(&mut self) {
        if self.armed {
            let stopped = self.batch.abort();
            warn!("Batch::run: cancelled, force-stopped {} lanes", stopped);
        }
    }
}

// ============================================================================
// Interrupt context
// ============================================================================

/// Interrupt-side entry points of an open [`Batch`].
///
/// Call these from the peripheral's interrupt handler (or a simulation of it). They never
/// block, never allocate, and touch only the signalled lane plus the scheduler queue.
pub struct InterruptContext<
    'a,
    'b,
    P: PulseSink,
    const LANES: usize,
    const SLOTS: usize,
    const MAX_JOBS: usize,
> {
    engine: &'a Engine<P, LANES, SLOTS, MAX_JOBS>,
    jobs: &'a JobLock<'b, MAX_JOBS>,
}

impl<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize> Clone
    for InterruptContext<'_, '_, P, LANES, SLOTS, MAX_JOBS>
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize> Copy
    for InterruptContext<'_, '_, P, LANES, SLOTS, MAX_JOBS>
{
}

impl<'b, P: PulseSink, const LANES: usize, const SLOTS: usize, const MAX_JOBS: usize>
    InterruptContext<'_, 'b, P, LANES, SLOTS, MAX_JOBS>
{
    /// Routes a lane event to its handler.
    pub fn dispatch(&self, event: LaneEvent) {
        match event {
            LaneEvent::Threshold(lane_id) => self.on_threshold(lane_id),
            LaneEvent::TransmitDone(lane_id) => self.on_transmit_done(lane_id),
        }
    }

    /// Half of `lane_id`'s buffer was consumed: refill that half.
    ///
    /// If the refill arrives later than the bail-out limit, the job is cut short and the
    /// refill writes its latch tail instead of more data.
    pub fn on_threshold(&self, lane_id: LaneId) {
        let config = self.engine.config;
        let latch_ticks = self.engine.latch_ticks;
        self.engine.with_state(|state| {
            let EngineState { sink, lanes, .. } = state;
            let Some(lane) = lanes.get_mut(lane_id) else {
                return;
            };
            let Some(job_index) = lane.job else {
                trace!("InterruptContext::on_threshold: lane {} idle", lane_id);
                return;
            };

            self.with_jobs(|table| {
                let mut job = table.get_mut(job_index);
                let now = sink.now();
                let elapsed = now
                    .checked_duration_since(lane.last_refill)
                    .unwrap_or(Duration::from_ticks(0));
                if let Some(job) = job.as_deref_mut()
                    && !job.is_exhausted()
                    && elapsed > config.bail_out_limit(lane.expected_refill)
                {
                    job.truncate();
                    trace!(
                        "InterruptContext::on_threshold: lane {} refill {} us late, truncating job {}",
                        lane_id,
                        elapsed.as_micros(),
                        job_index
                    );
                }
                lane.last_refill = now;

                filler::fill(sink, lane, job, Lane::<SLOTS>::HALF, latch_ticks);
            });
        });
    }

    /// `lane_id` stopped at an end marker: free it and start the next queued job on it.
    ///
    /// Releases the batch completion once every job has finished.
    pub fn on_transmit_done(&self, lane_id: LaneId) {
        let engine = self.engine;
        let config = engine.config;
        let latch_ticks = engine.latch_ticks;
        let complete = engine.with_state(|state| {
            let Some(lane) = state.lanes.get_mut(lane_id) else {
                return false;
            };
            let Some(job_index) = lane.release() else {
                trace!("InterruptContext::on_transmit_done: lane {} idle", lane_id);
                return false;
            };
            let pin = lane.pin;
            state.sink.stop(lane_id);
            state.sink.detach(lane_id, pin);

            self.with_jobs(|table| {
                if let Some(job) = table.get_mut(job_index) {
                    job.done = true;
                }
                if let Some(next) = state.scheduler.on_lane_freed(lane_id) {
                    state.promote(table, lane_id, next, &config, latch_ticks);
                }
            });
            engine.publish_progress(&state.scheduler);
            trace!(
                "InterruptContext::on_transmit_done: lane {} finished job {} ({}/{})",
                lane_id,
                job_index,
                state.scheduler.finished(),
                state.scheduler.total()
            );
            state.scheduler.is_complete()
        });

        if complete {
            engine.completion.release();
        }
    }

    fn with_jobs<R>(&self, f: impl FnOnce(&mut JobTable<'b, MAX_JOBS>) -> R) -> R {
        self.jobs.lock(|jobs| f(&mut jobs.borrow_mut()))
    }
}
