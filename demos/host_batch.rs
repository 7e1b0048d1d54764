//! Three 8-pixel strips share two simulated lanes for a few frames of a moving dot.
//!
//! Every frame is rendered into the same pixel buffers and sent as one batch. While a batch
//! runs, a scoped thread plays the interrupt handler: it steps the simulated peripheral and
//! dispatches every event to the batch while `main` waits on it.
//!
//! Run with `cargo run --features host --bin demo_host_batch`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use embassy_futures::block_on;
use embassy_time::Duration;
use log::{Level, LevelFilter, Log, Metadata, Record};
use pulse_lanes::Result;
use pulse_lanes::engine::{Engine, EngineConfig};
use pulse_lanes::lane::{LaneConfig, Strip};
use pulse_lanes::sim::SimulatedPeripheral;
use pulse_lanes::source::PixelSource;
use pulse_lanes::waveform::{TimingSpec, WS2812_NANOS};
use smart_leds::RGB8;
use static_cell::StaticCell;

const CLOCK_HZ: u32 = 80_000_000;
const LANES: usize = 2;
const SLOTS: usize = 64;
const STRIPS: usize = 3;
const PIXELS: usize = 8;
const FRAMES: usize = 4;

type DemoSim = SimulatedPeripheral<LANES, SLOTS>;
type DemoEngine = Engine<&'static DemoSim, LANES, SLOTS, STRIPS>;

static SIM: StaticCell<DemoSim> = StaticCell::new();
static ENGINE: StaticCell<DemoEngine> = StaticCell::new();

struct StdoutLogger;

impl Log for StdoutLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            println!("[{:<5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

fn main() {
    if let Err(err) = inner_main() {
        panic!("{err}");
    }
}

fn inner_main() -> Result<()> {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }

    let (t1, t2, t3) = WS2812_NANOS;
    let timing = TimingSpec::from_nanos(t1, t2, t3, CLOCK_HZ);
    let strips: [Strip; STRIPS] =
        core::array::from_fn(|index| Strip::new(index as u8 + 2, timing));

    let sim: &'static DemoSim = SIM.init(SimulatedPeripheral::new(CLOCK_HZ));
    let engine: &'static DemoEngine =
        ENGINE.init(Engine::new(sim, EngineConfig::new(CLOCK_HZ))?);
    for lane in 0..LANES {
        engine.configure_lane(lane, LaneConfig::default())?;
    }

    let mut pixels = [[RGB8::default(); PIXELS]; STRIPS];
    for frame in 0..FRAMES {
        render(&mut pixels, frame);
        let mut sources = pixels.each_ref().map(|strip| PixelSource::new(strip));

        let batch = engine.begin_batch()?;
        for (strip, source) in strips.iter().zip(sources.iter_mut()) {
            let byte_len = source.byte_len();
            batch.submit_job(strip, source, byte_len)?;
        }

        let interrupts = batch.interrupts();
        let stop = AtomicBool::new(false);
        let report = thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    match sim.step() {
                        Some(event) => interrupts.dispatch(event),
                        None => thread::yield_now(),
                    }
                }
            });
            let report = block_on(batch.run(Duration::from_millis(100)));
            stop.store(true, Ordering::Relaxed);
            report
        })?;
        println!(
            "frame {frame}: {} strips sent, {} truncated, lanes used {:?}",
            report.jobs,
            report.truncated,
            report
                .outcomes
                .iter()
                .map(|outcome| outcome.lane)
                .collect::<Vec<_>>()
        );
    }

    for strip in &strips {
        let frames = sim.frames_on_pin(strip.pin());
        println!(
            "pin {}: {} frames, last frame {:02X?}",
            strip.pin(),
            frames.len(),
            frames
                .last()
                .map(|frame| frame.bytes(strip.table()))
                .unwrap_or_default()
        );
    }
    println!("stats: {:?}", engine.stats());
    Ok(())
}

/// One dot per strip, moving one pixel per frame.
fn render(pixels: &mut [[RGB8; PIXELS]; STRIPS], frame: usize) {
    for (strip, row) in pixels.iter_mut().enumerate() {
        for (index, pixel) in row.iter_mut().enumerate() {
            *pixel = if index == (frame + strip) % PIXELS {
                RGB8::new(0, 0, 32)
            } else {
                RGB8::default()
            };
        }
    }
}
