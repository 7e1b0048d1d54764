#![allow(missing_docs)]
use pulse_lanes::source::{ByteSource, PixelSource, SliceSource};
use smart_leds::RGB8;

fn drain(source: &mut impl ByteSource) -> Vec<u8> {
    let mut bytes = Vec::new();
    while source.has_next() {
        bytes.push(source.next_byte());
        source.on_byte_consumed();
    }
    bytes
}

#[test]
fn slice_source_yields_bytes_in_order() {
    let data = [0x01_u8, 0x80, 0xFF];
    let mut source = SliceSource::new(&data);

    assert_eq!(source.remaining(), 3);
    assert_eq!(drain(&mut source), data);
    assert_eq!(source.remaining(), 0);
}

#[test]
fn slice_source_repeats_byte_until_consumed() {
    let data = [0x42_u8, 0x24];
    let mut source = SliceSource::new(&data);

    assert_eq!(source.next_byte(), 0x42);
    assert_eq!(source.next_byte(), 0x42);
    source.on_byte_consumed();
    assert_eq!(source.next_byte(), 0x24);
    assert_eq!(source.remaining(), 1);
}

#[test]
fn empty_slice_source_has_nothing() {
    let mut source = SliceSource::new(&[]);

    assert!(!source.has_next());
    assert!(drain(&mut source).is_empty());
}

#[test]
fn pixel_source_emits_green_red_blue() {
    let pixels = [RGB8::new(0x11, 0x22, 0x33), RGB8::new(0xAA, 0xBB, 0xCC)];
    let mut source = PixelSource::new(&pixels);

    assert_eq!(source.byte_len(), 6);
    assert_eq!(drain(&mut source), [0x22, 0x11, 0x33, 0xBB, 0xAA, 0xCC]);
    assert!(!source.has_next());
}
