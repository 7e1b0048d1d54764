//! Expands job bits into lane buffer slots.
//!
//! Runs both on the caller's side (priming a lane before it starts) and in interrupt context
//! (refilling the half the hardware just drained), so it never blocks and loops at most
//! `count` times.

use crate::job::Job;
use crate::lane::Lane;
use crate::sink::PulseSink;
use crate::waveform::Waveform;

/// Writes `count` pulses for `job` starting at the lane's cursor. Returns the number of slots
/// written (always `count`).
///
/// Once the job runs dry, the first empty slot folds the latch into the previous pulse and
/// every later slot becomes [`Waveform::ZERO_PULSE`], so the hardware halts on its own.
pub(crate) fn fill<P: PulseSink, const SLOTS: usize>(
    sink: &mut P,
    lane: &mut Lane<SLOTS>,
    mut job: Option<&mut Job<'_>>,
    count: usize,
    latch_ticks: u16,
) -> usize {
    let fill_start = lane.cursor();
    let mut written = 0;
    while written < count {
        let slot = lane.cursor();
        let bit = job.as_deref_mut().and_then(Job::next_bit);
        let pulse = match (bit, job.as_deref_mut()) {
            (Some(bit), _) => lane.table.encode(bit),
            (None, Some(job)) if !job.latched => {
                job.latched = true;
                latch(sink, lane, slot, written, latch_ticks)
            }
            (None, _) => Waveform::ZERO_PULSE,
        };

        sink.write_slot(lane.id, slot, pulse);
        lane.record_write(slot, pulse);
        lane.advance();
        written = written.saturating_add(1);
    }
    trace!(
        "filler::fill: lane {} slots {}..+{} (next fill in half {})",
        lane.id,
        fill_start,
        written,
        lane.half().index()
    );
    written
}

/// Fills both halves of a freshly assigned lane before it starts.
pub(crate) fn prime<P: PulseSink, const SLOTS: usize>(
    sink: &mut P,
    lane: &mut Lane<SLOTS>,
    mut job: Option<&mut Job<'_>>,
    latch_ticks: u16,
) {
    let half = Lane::<SLOTS>::HALF;
    fill(sink, lane, job.as_deref_mut(), half, latch_ticks);
    fill(sink, lane, job, half, latch_ticks);
}

/// Produces the pulse for the first slot after the data ran out.
///
/// When the previous pulse was written by this same fill it is still ours to change, so its
/// low segment is stretched to the latch duration and this slot becomes padding. Otherwise the
/// previous pulse sits in the half the hardware owns, and this slot carries an all-low latch
/// pulse instead.
fn latch<P: PulseSink, const SLOTS: usize>(
    sink: &mut P,
    lane: &Lane<SLOTS>,
    slot: usize,
    written_this_fill: usize,
    latch_ticks: u16,
) -> Waveform {
    match lane.last_written() {
        Some((previous_slot, previous)) if written_this_fill > 0 => {
            sink.write_slot(
                lane.id,
                previous_slot,
                previous.with_low_duration(latch_ticks),
            );
            Waveform::ZERO_PULSE
        }
        _ => {
            debug!(
                "filler::latch: lane {} latch at slot {} as standalone pulse",
                lane.id, slot
            );
            Waveform::latch(latch_ticks)
        }
    }
}
