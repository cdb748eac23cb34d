//! Word-level conversions between device registers and signed values.
//!
//! A 32-bit quantity travels as two 16-bit registers, low word first.

/// Split `value` into `[low, high]` register words.
pub fn split_i32(value: i32) -> [u16; 2] {
    let bits = value as u32;
    [(bits & 0xFFFF) as u16, (bits >> 16) as u16]
}

/// Reassemble a low/high register pair into a signed 32-bit value.
pub fn combine_words(low: u16, high: u16) -> i32 {
    ((u32::from(high) << 16) | u32::from(low)) as i32
}

/// Two's-complement register word for a signed 16-bit value.
pub fn i16_word(value: i16) -> u16 {
    value as u16
}
