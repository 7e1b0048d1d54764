//! Byte sources feeding jobs.
//!
//! The engine pulls bytes from a [`ByteSource`] strictly in order and exactly once per byte.
//! Colour correction, gamma and channel reordering happen upstream; a source only hands out
//! bytes that are ready for the wire.

use smart_leds::RGB8;

/// Sequential byte stream consumed by one job.
///
/// The engine calls, for every byte: [`has_next`](Self::has_next), then
/// [`next_byte`](Self::next_byte), then (after all of that byte's bits are encoded)
/// [`on_byte_consumed`](Self::on_byte_consumed). These calls may run in interrupt context,
/// so implementations must not block.
pub trait ByteSource {
    /// Whether another byte is available.
    fn has_next(&self) -> bool;

    /// Returns the byte at the cursor. Only called after `has_next` returned `true`.
    fn next_byte(&mut self) -> u8;

    /// Advances past the byte most recently returned by `next_byte`.
    fn on_byte_consumed(&mut self);
}

/// [`ByteSource`] over a caller-owned byte buffer.
#[derive(Clone, Debug)]
pub struct SliceSource<'a> {
    bytes: &'a [u8],
    index: usize,
}

impl<'a> SliceSource<'a> {
    /// Creates a source that yields `bytes` front to back.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, index: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.index)
    }
}

impl ByteSource for SliceSource<'_> {
    fn has_next(&self) -> bool {
        self.index < self.bytes.len()
    }

    fn next_byte(&mut self) -> u8 {
        self.bytes.get(self.index).copied().unwrap_or(0)
    }

    fn on_byte_consumed(&mut self) {
        self.index = self.index.saturating_add(1);
    }
}

/// [`ByteSource`] over already-corrected [`RGB8`] pixels, emitted in WS2812 wire order
/// (green, red, blue).
///
/// # Example
///
/// ```
/// use pulse_lanes::source::{ByteSource, PixelSource};
/// use smart_leds::RGB8;
///
/// let pixels = [RGB8::new(1, 2, 3)];
/// let mut source = PixelSource::new(&pixels);
/// let mut bytes = [0u8; 3];
/// for byte in &mut bytes {
///     *byte = source.next_byte();
///     source.on_byte_consumed();
/// }
/// assert_eq!(bytes, [2, 1, 3]);
/// assert!(!source.has_next());
/// ```
#[derive(Clone, Debug)]
pub struct PixelSource<'a> {
    pixels: &'a [RGB8],
    pixel_index: usize,
    channel: u8,
}

impl<'a> PixelSource<'a> {
    /// Creates a source over `pixels`.
    #[must_use]
    pub const fn new(pixels: &'a [RGB8]) -> Self {
        Self {
            pixels,
            pixel_index: 0,
            channel: 0,
        }
    }

    /// Number of bytes this source yields in total (three per pixel).
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.pixels.len().saturating_mul(3)
    }
}

impl ByteSource for PixelSource<'_> {
    fn has_next(&self) -> bool {
        self.pixel_index < self.pixels.len()
    }

    fn next_byte(&mut self) -> u8 {
        let Some(pixel) = self.pixels.get(self.pixel_index) else {
            return 0;
        };
        match self.channel {
            0 => pixel.g,
            1 => pixel.r,
            _ => pixel.b,
        }
    }

    fn on_byte_consumed(&mut self) {
        if self.channel >= 2 {
            self.channel = 0;
            self.pixel_index = self.pixel_index.saturating_add(1);
        } else {
            self.channel = self.channel.saturating_add(1);
        }
    }
}
