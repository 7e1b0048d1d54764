//! Error type shared by the whole crate.

/// Errors reported by the pulse engine.
///
/// Timing underruns are not errors; they truncate the affected job and are reported once
/// per batch through [`BatchReport::truncated`](crate::engine::BatchReport::truncated).
#[derive(Clone, Copy, Debug, Eq, PartialEq, derive_more::Display, derive_more::Error)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub enum Error {
    /// More lanes were requested than the peripheral provides.
    #[display("requested {requested} lanes but the peripheral supports {supported}")]
    LaneCapacity {
        /// Lanes requested by the engine.
        requested: usize,
        /// Lanes the peripheral supports.
        supported: usize,
    },
    /// More pulse slots per lane were requested than the peripheral provides.
    #[display("requested {requested} slots per lane but the peripheral supports {supported}")]
    SlotCapacity {
        /// Slots requested by the engine.
        requested: usize,
        /// Slots the peripheral supports.
        supported: usize,
    },
    /// Slots per lane must be even and at least 2 so the buffer splits into two halves.
    #[display("{_0} slots per lane cannot be split into two equal halves")]
    InvalidSlotCount(#[error(not(source))] usize),
    /// The lane index is not below the engine's lane count.
    #[display("lane {_0} is out of range")]
    LaneOutOfRange(#[error(not(source))] usize),
    /// The latch does not fit one pulse segment (`2..=u16::MAX` ticks).
    #[display("latch of {_0} ticks does not fit a pulse segment")]
    InvalidLatch(#[error(not(source))] u32),
    /// A batch with jobs was started before any lane was configured.
    #[display("no lanes configured")]
    NoLanesConfigured,
    /// More jobs were submitted than the engine can hold in one batch.
    #[display("job queue is full")]
    QueueFull,
    /// A batch is already open or draining; finish or drop it first.
    #[display("a batch is already in flight")]
    BatchInFlight,
    /// The batch did not complete within the timeout; all lanes were force-stopped.
    #[display("batch timed out")]
    Timeout,
}

/// Result alias with [`Error`] as the default error type.
pub type Result<T, E = Error> = core::result::Result<T, E>;
