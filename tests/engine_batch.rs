#![allow(missing_docs)]
use embassy_futures::block_on;
use embassy_futures::select::{Either, select};
use embassy_time::{Duration, Timer};
use fixed::types::U32F32;
use pulse_lanes::engine::{Batch, BatchPhase, BatchReport, Engine, EngineConfig};
use pulse_lanes::lane::{LaneConfig, Strip};
use pulse_lanes::sim::{SimEvent, SimulatedPeripheral};
use pulse_lanes::source::{PixelSource, SliceSource};
use pulse_lanes::waveform::{Level, TimingSpec};
use pulse_lanes::{Error, Result};
use smart_leds::RGB8;

const CLOCK_HZ: u32 = 1_000_000_000;
const TIMING: TimingSpec = TimingSpec::new(400, 400, 450);
const TIMEOUT: Duration = Duration::from_secs(2);

fn config() -> EngineConfig {
    EngineConfig::new(CLOCK_HZ).with_latch_micros(60)
}

fn run<const L: usize, const S: usize, const J: usize>(
    batch: &Batch<'_, '_, &SimulatedPeripheral<L, S>, L, S, J>,
    sim: &SimulatedPeripheral<L, S>,
) -> Result<BatchReport<J>> {
    let engine = batch.engine();
    let interrupts = batch.interrupts();
    block_on(async {
        match select(
            batch.run(TIMEOUT),
            sim.drive(|event| {
                interrupts.dispatch(event);
                let (started, finished) = engine.progress();
                assert!(finished <= started && started - finished <= L);
                assert!(engine.in_flight() <= L);
                assert!(sim.transmitting() <= L);
            }),
        )
        .await
        {
            Either::First(report) => report,
            Either::Second(()) => unreachable!(),
        }
    })
}

fn configure_all<const L: usize, const S: usize, const J: usize>(
    engine: &Engine<&SimulatedPeripheral<L, S>, L, S, J>,
) {
    for lane in 0..L {
        engine
            .configure_lane(lane, LaneConfig::default())
            .expect("lane in range");
    }
}

#[test]
fn single_job_bits_reach_the_wire_unchanged() {
    let data = [0x00_u8, 0xFF, 0xA5];
    let mut source = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(3, TIMING);
    let engine: Engine<_, 1, 8, 4> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    let handle = batch
        .submit_job(&strip, &mut source, data.len())
        .expect("queue has room");
    let report = run(&batch, &sim).expect("batch completes");

    let frames = sim.frames();
    assert_eq!(frames.len(), 1);
    let frame = &frames[0];
    assert!(frame.completed);
    assert_eq!(frame.pin, Some(3));
    assert_eq!(frame.bytes(strip.table()), data);
    assert_eq!(frame.bits(strip.table()).len(), 24);
    assert!(frame.trailing_low_ticks() >= config().latch_ticks);

    let outcome = report.outcome(handle).expect("outcome recorded");
    assert_eq!(outcome.bits_sent, 24);
    assert_eq!(outcome.lane, Some(0));
    assert!(outcome.done);
    assert!(!outcome.truncated);
    assert_eq!(report.truncated, 0);
    assert_eq!(sim.owned_half_writes(), 0);
    assert_eq!(sim.attached_pin(0), None);
}

#[test]
fn one_bits_stay_high_for_t1_plus_t2() {
    let data = [0xFF_u8];
    let mut source = SliceSource::new(&data);
    // The byte fits inside the first half, so the latch folds into its last pulse.
    let sim: SimulatedPeripheral<1, 32> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(0, TIMING);
    let engine: Engine<_, 1, 32, 1> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);
    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut source, 1)
        .expect("queue has room");
    run(&batch, &sim).expect("batch completes");

    let frame = &sim.frames()[0];
    for pulse in &frame.pulses {
        assert_eq!(pulse.high.level, Level::High);
        assert_eq!(pulse.high.duration, 800);
    }
    assert_eq!(frame.pulses.len(), 8);
    assert_eq!(frame.pulses[0].low.duration, 450);
    assert_eq!(u32::from(frame.pulses[7].low.duration), config().latch_ticks);
}

#[test]
fn five_jobs_on_three_lanes_release_once() {
    let payloads: [[u8; 3]; 5] = [
        [0x01, 0x02, 0x03],
        [0x10, 0x20, 0x30],
        [0xAA, 0x55, 0xAA],
        [0xF0, 0x0F, 0xF0],
        [0xDE, 0xAD, 0xBE],
    ];
    let [p0, p1, p2, p3, p4] = &payloads;
    let mut sources = [
        SliceSource::new(p0),
        SliceSource::new(p1),
        SliceSource::new(p2),
        SliceSource::new(p3),
        SliceSource::new(p4),
    ];
    let sim: SimulatedPeripheral<3, 16> = SimulatedPeripheral::new(CLOCK_HZ);
    let strips: [Strip; 5] = core::array::from_fn(|index| Strip::new(10 + index as u8, TIMING));
    let engine: Engine<_, 3, 16, 8> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    for (strip, source) in strips.iter().zip(sources.iter_mut()) {
        batch.submit_job(strip, source, 3).expect("queue has room");
    }
    assert_eq!(engine.phase(), BatchPhase::Accumulating);
    let report = run(&batch, &sim).expect("batch completes");

    assert_eq!(report.jobs, 5);
    assert_eq!(engine.stats().releases, 1);
    assert_eq!(engine.stats().batches, 1);
    assert_eq!(engine.progress(), (5, 5));
    assert_eq!(engine.finished(), 5);
    assert_eq!(engine.phase(), BatchPhase::Idle);
    assert!(sim.peak_transmitting() <= 3);
    assert_eq!(sim.peak_transmitting(), 3);
    assert!(report.outcomes.iter().all(|outcome| outcome.done));

    for (strip, payload) in strips.iter().zip(&payloads) {
        let frames = sim.frames_on_pin(strip.pin());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].completed);
        assert_eq!(frames[0].bytes(strip.table()), payload);
    }
}

#[test]
fn queued_jobs_start_in_submission_order() {
    let data = [[0x11_u8; 4], [0x22; 4], [0x33; 4], [0x44; 4], [0x55; 4]];
    let [d0, d1, d2, d3, d4] = &data;
    let mut sources = [
        SliceSource::new(d0),
        SliceSource::new(d1),
        SliceSource::new(d2),
        SliceSource::new(d3),
        SliceSource::new(d4),
    ];
    let sim: SimulatedPeripheral<2, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strips: [Strip; 5] = core::array::from_fn(|index| Strip::new(20 + index as u8, TIMING));
    let engine: Engine<_, 2, 8, 5> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    let mut handles = Vec::new();
    for (strip, source) in strips.iter().zip(sources.iter_mut()) {
        handles.push(batch.submit_job(strip, source, 4).expect("queue has room"));
    }
    let report = run(&batch, &sim).expect("batch completes");

    assert_eq!(report.start_sequence().as_slice(), handles.as_slice());
    let started_pins: Vec<Option<u8>> = sim
        .events()
        .iter()
        .filter_map(|event| match event {
            SimEvent::Started { pin, .. } => Some(*pin),
            _ => None,
        })
        .collect();
    let expected: Vec<Option<u8>> = strips.iter().map(|strip| Some(strip.pin())).collect();
    assert_eq!(started_pins, expected);
}

#[test]
fn lanes_are_reused_for_queued_jobs() {
    let pixels = [RGB8::new(1, 2, 3), RGB8::new(4, 5, 6)];
    let mut first = PixelSource::new(&pixels);
    let mut second = PixelSource::new(&pixels);
    let mut third = PixelSource::new(&pixels);
    let byte_len = first.byte_len();
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strips = [
        Strip::new(1, TIMING),
        Strip::new(2, TIMING),
        Strip::new(3, TIMING),
    ];
    let engine: Engine<_, 1, 8, 3> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strips[0], &mut first, byte_len)
        .expect("queue has room");
    batch
        .submit_job(&strips[1], &mut second, byte_len)
        .expect("queue has room");
    batch
        .submit_job(&strips[2], &mut third, byte_len)
        .expect("queue has room");
    let report = run(&batch, &sim).expect("batch completes");

    assert!(report.outcomes.iter().all(|outcome| outcome.lane == Some(0)));
    assert_eq!(sim.peak_transmitting(), 1);
    for strip in &strips {
        let frames = sim.frames_on_pin(strip.pin());
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].bytes(strip.table()), [2, 1, 3, 5, 4, 6]);
    }
}

#[test]
fn empty_batch_completes_immediately() {
    let sim: SimulatedPeripheral<2, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let engine: Engine<_, 2, 8, 4> = Engine::new(&sim, config()).expect("valid engine");

    let batch = engine.begin_batch().expect("no batch open");
    let report = run(&batch, &sim).expect("empty batch completes");

    assert_eq!(report.jobs, 0);
    assert!(report.outcomes.is_empty());
    assert_eq!(engine.stats().releases, 1);
    assert!(sim.frames().is_empty());
    assert_eq!(engine.phase(), BatchPhase::Idle);
}

#[test]
fn only_one_batch_is_open_at_a_time() {
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let engine: Engine<_, 1, 8, 2> = Engine::new(&sim, config()).expect("valid engine");

    let batch = engine.begin_batch().expect("no batch open");
    assert_eq!(engine.begin_batch().err(), Some(Error::BatchInFlight));
    drop(batch);
    assert!(engine.begin_batch().is_ok());
}

#[test]
fn engine_rejects_more_lanes_than_hardware() {
    let sim: SimulatedPeripheral<2, 16> = SimulatedPeripheral::new(CLOCK_HZ);
    let result: Result<Engine<_, 4, 16, 4>> = Engine::new(&sim, config());
    assert_eq!(
        result.err(),
        Some(Error::LaneCapacity {
            requested: 4,
            supported: 2
        })
    );
}

#[test]
fn engine_rejects_more_slots_than_hardware() {
    let sim: SimulatedPeripheral<2, 16> = SimulatedPeripheral::new(CLOCK_HZ);
    let result: Result<Engine<_, 2, 32, 4>> = Engine::new(&sim, config());
    assert_eq!(
        result.err(),
        Some(Error::SlotCapacity {
            requested: 32,
            supported: 16
        })
    );
}

#[test]
fn engine_rejects_odd_slot_count() {
    let sim: SimulatedPeripheral<2, 15> = SimulatedPeripheral::new(CLOCK_HZ);
    let result: Result<Engine<_, 2, 15, 4>> = Engine::new(&sim, config());
    assert_eq!(result.err(), Some(Error::InvalidSlotCount(15)));
}

#[test]
fn engine_rejects_latch_that_does_not_fit_a_pulse() {
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);

    // 300 µs at 1 GHz is longer than one pulse segment can hold.
    let result: Result<Engine<_, 1, 8, 1>> = Engine::new(&sim, EngineConfig::new(CLOCK_HZ));
    assert_eq!(result.err(), Some(Error::InvalidLatch(300_000)));

    let result: Result<Engine<_, 1, 8, 1>> =
        Engine::new(&sim, config().with_latch_micros(0));
    assert_eq!(result.err(), Some(Error::InvalidLatch(0)));

    let mut one_tick = config();
    one_tick.latch_ticks = 1;
    let result: Result<Engine<_, 1, 8, 1>> = Engine::new(&sim, one_tick);
    assert_eq!(result.err(), Some(Error::InvalidLatch(1)));
}

#[test]
fn configure_lane_applies_settings_and_checks_range() {
    let sim: SimulatedPeripheral<2, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let engine: Engine<_, 2, 8, 4> = Engine::new(&sim, config()).expect("valid engine");
    let lane_config = LaneConfig {
        clock_divider: 4,
        idle_level: Level::Low,
    };

    engine
        .configure_lane(1, lane_config)
        .expect("lane in range");

    assert_eq!(sim.lane_config(1), Some(lane_config));
    assert_eq!(sim.lane_config(0), None);
    assert_eq!(
        engine.configure_lane(5, lane_config),
        Err(Error::LaneOutOfRange(5))
    );
}

#[test]
fn submit_fails_when_queue_full() {
    let data = [0x01_u8];
    let mut first = SliceSource::new(&data);
    let mut second = SliceSource::new(&data);
    let mut third = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(0, TIMING);
    let engine: Engine<_, 1, 8, 2> = Engine::new(&sim, config()).expect("valid engine");

    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut first, 1)
        .expect("queue has room");
    batch
        .submit_job(&strip, &mut second, 1)
        .expect("queue has room");
    assert_eq!(
        batch.submit_job(&strip, &mut third, 1),
        Err(Error::QueueFull)
    );
}

#[test]
fn batch_without_configured_lanes_fails() {
    let data = [0x01_u8];
    let mut source = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(0, TIMING);
    let engine: Engine<_, 1, 8, 2> = Engine::new(&sim, config()).expect("valid engine");
    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut source, 1)
        .expect("queue has room");

    assert_eq!(
        block_on(batch.run(TIMEOUT)).err(),
        Some(Error::NoLanesConfigured)
    );
}

#[test]
fn submit_while_draining_is_rejected() {
    let data = [0x0F_u8; 8];
    let mut source = SliceSource::new(&data);
    let mut late_source = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(0, TIMING);
    let engine: Engine<_, 1, 8, 4> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);
    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut source, data.len())
        .expect("queue has room");

    let interrupts = batch.interrupts();
    let mut late = Some(&mut late_source);
    let mut late_result = None;
    let mut phase_while_draining = None;
    let report = block_on(async {
        match select(
            batch.run(TIMEOUT),
            sim.drive(|event| {
                if let Some(source) = late.take() {
                    phase_while_draining = Some(engine.phase());
                    late_result = Some(batch.submit_job(&strip, source, 1));
                }
                interrupts.dispatch(event);
            }),
        )
        .await
        {
            Either::First(report) => report,
            Either::Second(()) => unreachable!(),
        }
    })
    .expect("batch completes");

    assert_eq!(phase_while_draining, Some(BatchPhase::Draining));
    assert_eq!(late_result, Some(Err(Error::BatchInFlight)));
    assert_eq!(report.jobs, 1);
}

#[test]
fn timeout_force_stops_lanes_and_batch_recovers() {
    let data = [0xC3_u8; 6];
    let mut stalled = SliceSource::new(&data);
    let mut retry = SliceSource::new(&data);
    let sim: SimulatedPeripheral<2, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(9, TIMING);
    let engine: Engine<_, 2, 8, 4> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut stalled, data.len())
        .expect("queue has room");
    // Nobody services interrupts, so the batch can never finish.
    let result = block_on(batch.run(Duration::from_millis(5)));

    assert_eq!(result.err(), Some(Error::Timeout));
    assert_eq!(engine.stats().timeouts, 1);
    assert_eq!(engine.phase(), BatchPhase::Idle);
    assert_eq!(sim.transmitting(), 0);
    assert_eq!(sim.attached_pin(0), None);
    let frames = sim.frames();
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].completed);

    sim.clear_history();
    batch
        .submit_job(&strip, &mut retry, data.len())
        .expect("batch accepts jobs after a timeout");
    let report = run(&batch, &sim).expect("batch completes");
    assert_eq!(report.jobs, 1);
    assert_eq!(sim.frames()[0].bytes(strip.table()), data);
}

#[test]
fn dropped_run_future_stops_lanes_and_discards_jobs() {
    let data = [0x3C_u8; 6];
    let mut first = SliceSource::new(&data);
    let mut second = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(4, TIMING);
    let engine: Engine<_, 1, 8, 2> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut first, data.len())
        .expect("queue has room");
    // Nobody services interrupts, so the outer timer wins and drops the run future.
    let raced = block_on(select(
        batch.run(TIMEOUT),
        Timer::after(Duration::from_millis(1)),
    ));

    assert!(matches!(raced, Either::Second(())));
    assert_eq!(engine.phase(), BatchPhase::Idle);
    assert_eq!(sim.transmitting(), 0);
    assert_eq!(sim.step(), None);
    let frames = sim.frames();
    assert_eq!(frames.len(), 1);
    assert!(!frames[0].completed);

    sim.clear_history();
    let handle = batch
        .submit_job(&strip, &mut second, data.len())
        .expect("batch accepts jobs after cancellation");
    let report = run(&batch, &sim).expect("batch completes");

    assert_eq!(handle.index(), 0);
    assert_eq!(report.jobs, 1);
    let frames = sim.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].bytes(strip.table()), data);
}

#[test]
fn dropping_an_unrun_batch_forgets_its_jobs() {
    let data = [0x81_u8; 6];
    let mut source = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(5, TIMING);
    let engine: Engine<_, 1, 8, 1> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut source, data.len())
        .expect("queue has room");
    assert_eq!(engine.phase(), BatchPhase::Accumulating);
    drop(batch);

    assert_eq!(engine.phase(), BatchPhase::Idle);
    let batch = engine.begin_batch().expect("previous batch was dropped");
    let report = run(&batch, &sim).expect("empty batch completes");
    assert_eq!(report.jobs, 0);
    assert!(sim.frames().is_empty());
}

#[test]
fn back_to_back_batches_keep_the_minimum_gap() {
    let data = [0x96_u8; 2];
    let mut first = SliceSource::new(&data);
    let mut second = SliceSource::new(&data);
    let sim: SimulatedPeripheral<1, 8> = SimulatedPeripheral::new(CLOCK_HZ);
    let strip = Strip::new(6, TIMING);
    let engine: Engine<_, 1, 8, 1> = Engine::new(&sim, config()).expect("valid engine");
    configure_all(&engine);

    let batch = engine.begin_batch().expect("no batch open");
    batch
        .submit_job(&strip, &mut first, data.len())
        .expect("queue has room");
    run(&batch, &sim).expect("first batch completes");
    batch
        .submit_job(&strip, &mut second, data.len())
        .expect("queue has room");
    run(&batch, &sim).expect("second batch completes");

    let events = sim.events();
    let first_end = events
        .iter()
        .find_map(|event| match event {
            SimEvent::Finished { at, .. } => Some(*at),
            _ => None,
        })
        .expect("first batch finished");
    let second_start = events
        .iter()
        .filter_map(|event| match event {
            SimEvent::Started { at, .. } => Some(*at),
            _ => None,
        })
        .nth(1)
        .expect("second batch started");
    let gap = second_start
        .checked_duration_since(first_end)
        .expect("second batch starts after the first ends");
    assert!(gap >= config().min_batch_gap);
}

#[test]
fn config_defaults_and_builders() {
    let default = EngineConfig::default();
    assert_eq!(default.clock_hz, 80_000_000);
    assert_eq!(default.latch_ticks, 24_000);
    assert_eq!(default.min_batch_gap, Duration::from_micros(50));

    assert_eq!(EngineConfig::new(CLOCK_HZ).latch_ticks, 300_000);
    assert_eq!(config().latch_ticks, 60_000);

    let doubled = config().with_bail_out_factor(U32F32::from_num(2));
    assert_eq!(
        doubled.bail_out_limit(Duration::from_micros(100)),
        Duration::from_micros(200)
    );
    assert_eq!(
        config().bail_out_limit(Duration::from_micros(100)),
        Duration::from_micros(150)
    );
}
