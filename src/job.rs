use crate::lane::{LaneId, Strip};
use crate::source::ByteSource;

/// Index of a job inside the engine's job table.
pub(crate) type JobIndex = usize;

/// Identifies a submitted job within the current batch.
///
/// Handles are assigned in submission order starting at 0 for every batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(all(feature = "defmt", not(feature = "log")), derive(defmt::Format))]
pub struct JobHandle(pub(crate) usize);

impl JobHandle {
    /// Submission index of this job within its batch.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Cursor over one strip's bytes while it is transmitted.
pub(crate) struct Job<'d> {
    source: &'d mut (dyn ByteSource + Send),
    pub(crate) strip: Strip,
    remaining_bits: usize,
    bits_sent: usize,
    current: u8,
    // Bits of `current` already encoded; 0 means the next bit needs a fresh byte.
    bit_cursor: u8,
    pub(crate) lane: Option<LaneId>,
    pub(crate) start_order: Option<usize>,
    pub(crate) done: bool,
    pub(crate) truncated: bool,
    pub(crate) latched: bool,
}

impl<'d> Job<'d> {
    pub(crate) fn new(
        strip: Strip,
        source: &'d mut (dyn ByteSource + Send),
        bit_len: usize,
    ) -> Self {
        Self {
            source,
            strip,
            remaining_bits: bit_len,
            bits_sent: 0,
            current: 0,
            bit_cursor: 0,
            lane: None,
            start_order: None,
            done: false,
            truncated: false,
            latched: false,
        }
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.remaining_bits == 0
    }

    pub(crate) fn bits_sent(&self) -> usize {
        self.bits_sent
    }

    /// Next bit to encode, most significant bit first.
    pub(crate) fn next_bit(&mut self) -> Option<bool> {
        if self.remaining_bits == 0 {
            return None;
        }
        if self.bit_cursor == 0 {
            if !self.source.has_next() {
                self.remaining_bits = 0;
                return None;
            }
            self.current = self.source.next_byte();
        }

        let bit = self.current & (0x80 >> self.bit_cursor) != 0;
        self.bit_cursor = self.bit_cursor.saturating_add(1);
        self.remaining_bits = self.remaining_bits.saturating_sub(1);
        self.bits_sent = self.bits_sent.saturating_add(1);

        if self.bit_cursor == 8 || self.remaining_bits == 0 {
            self.bit_cursor = 0;
            self.source.on_byte_consumed();
        }
        Some(bit)
    }

    /// Ends the job early; the remaining bits are never sent.
    pub(crate) fn truncate(&mut self) {
        if self.remaining_bits > 0 {
            self.remaining_bits = 0;
            self.truncated = true;
            if self.bit_cursor != 0 {
                self.bit_cursor = 0;
                self.source.on_byte_consumed();
            }
        }
    }
}
