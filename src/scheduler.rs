//! FIFO assignment of queued jobs to free lanes.

use heapless::{Deque, Vec};

use crate::job::JobIndex;
use crate::lane::LaneId;

/// Lifecycle of one batch ("show").
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub enum BatchPhase {
    /// No jobs submitted.
    #[default]
    Idle,
    /// Jobs submitted, nothing transmitting yet.
    Accumulating,
    /// Lanes assigned and interrupts running.
    Draining,
    /// Every job finished; waiting for the caller to collect the report.
    Done,
}

/// Assigns queued jobs to free lanes in submission order.
///
/// Pure bookkeeping: it decides *which* job goes on *which* lane, the engine performs the
/// promotion. Never allows more active jobs than lanes.
pub(crate) struct Scheduler<const LANES: usize, const MAX_JOBS: usize> {
    pending: Deque<JobIndex, MAX_JOBS>,
    free_lanes: Vec<LaneId, LANES>,
    started: usize,
    finished: usize,
    total: usize,
    phase: BatchPhase,
}

impl<const LANES: usize, const MAX_JOBS: usize> Scheduler<LANES, MAX_JOBS> {
    pub(crate) const fn new() -> Self {
        Self {
            pending: Deque::new(),
            free_lanes: Vec::new(),
            started: 0,
            finished: 0,
            total: 0,
            phase: BatchPhase::Idle,
        }
    }

    pub(crate) fn phase(&self) -> BatchPhase {
        self.phase
    }

    pub(crate) fn started(&self) -> usize {
        self.started
    }

    pub(crate) fn finished(&self) -> usize {
        self.finished
    }

    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn note_submission(&mut self) {
        if self.phase == BatchPhase::Idle {
            self.phase = BatchPhase::Accumulating;
        }
    }

    /// Enters the draining phase with `lanes` available and `total` jobs expected.
    pub(crate) fn begin(&mut self, lanes: impl IntoIterator<Item = LaneId>, total: usize) {
        self.pending.clear();
        self.free_lanes.clear();
        for lane in lanes {
            // Capacity equals LANES, and lane ids are unique and below LANES.
            let _ = self.free_lanes.push(lane);
        }
        // Hand lanes out lowest id first.
        self.free_lanes.reverse();
        self.started = 0;
        self.finished = 0;
        self.total = total;
        self.phase = if total == 0 {
            BatchPhase::Done
        } else {
            BatchPhase::Draining
        };
    }

    /// Queues `job`. Returns the lane it should be promoted onto right away, if one is free.
    pub(crate) fn submit(&mut self, job: JobIndex) -> Option<(LaneId, JobIndex)> {
        if self.pending.push_back(job).is_err() {
            return None;
        }
        if self.started.saturating_sub(self.finished) >= LANES {
            return None;
        }
        let lane = self.free_lanes.pop()?;
        self.promote(lane)
    }

    /// Records that `lane`'s job completed. Returns the next job for that lane, if any.
    pub(crate) fn on_lane_freed(&mut self, lane: LaneId) -> Option<JobIndex> {
        self.finished = self.finished.saturating_add(1);
        if self.finished >= self.total {
            self.phase = BatchPhase::Done;
        }
        match self.promote(lane) {
            Some((_, job)) => Some(job),
            None => {
                // Capacity equals LANES and a freed lane was taken from the pool.
                let _ = self.free_lanes.push(lane);
                None
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.finished >= self.total
    }

    /// Forgets the current batch.
    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.free_lanes.clear();
        self.started = 0;
        self.finished = 0;
        self.total = 0;
        self.phase = BatchPhase::Idle;
    }

    fn promote(&mut self, lane: LaneId) -> Option<(LaneId, JobIndex)> {
        let job = self.pending.pop_front()?;
        self.started = self.started.saturating_add(1);
        Some((lane, job))
    }
}
