//! The hardware capability the engine drives.
//!
//! A [`PulseSink`] is a pulse-generation peripheral with independent lanes, each owning a
//! small ring of pulse slots (for example an 8-lane, 64-slot-per-lane remote-control
//! transmitter). The engine only ever writes whole [`Waveform`]s into slots; how they map onto
//! peripheral memory words is up to the implementation.
//!
//! Every method except [`configure`](PulseSink::configure) can be called from interrupt
//! context and must return promptly without blocking.

use embassy_time::{Duration, Instant};

use crate::lane::{LaneConfig, LaneId};
use crate::waveform::Waveform;

/// Narrow interface to a multi-lane pulse peripheral.
pub trait PulseSink {
    /// Number of lanes the peripheral provides.
    const MAX_LANES: usize;
    /// Pulse slots available per lane.
    const MAX_SLOTS: usize;

    /// One-time setup of `lane` (clock divider, idle level).
    fn configure(&mut self, lane: LaneId, config: &LaneConfig);

    /// Routes `lane`'s output to GPIO `pin` and enables the output driver.
    fn attach(&mut self, lane: LaneId, pin: u8);

    /// Disables the output driver for `pin` and disconnects it from `lane`.
    fn detach(&mut self, lane: LaneId, pin: u8);

    /// Writes one pulse into slot `offset` of `lane`'s ring buffer.
    fn write_slot(&mut self, lane: LaneId, offset: usize, waveform: Waveform);

    /// Requests a threshold interrupt every time `half` slots of `lane` have been sent.
    fn arm_threshold(&mut self, lane: LaneId, half: usize);

    /// Starts transmitting `lane` from slot 0.
    fn start(&mut self, lane: LaneId);

    /// Stops `lane` immediately.
    fn stop(&mut self, lane: LaneId);

    /// Clock used to time refills. Simulated peripherals return their own virtual time.
    fn now(&self) -> Instant {
        Instant::now()
    }

    /// Lets `duration` pass on the [`now`](PulseSink::now) clock while every lane is idle.
    ///
    /// Returns the part the caller still has to wait out on the embassy timer. Sinks timed by
    /// the embassy clock return all of it; simulations advance their own clock instead.
    fn idle_for(&mut self, duration: Duration) -> Duration {
        duration
    }
}

/// Events a lane raises from interrupt context.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub enum LaneEvent {
    /// Half of the lane's buffer was consumed and may be refilled.
    Threshold(LaneId),
    /// The lane reached an end marker and stopped.
    TransmitDone(LaneId),
}
