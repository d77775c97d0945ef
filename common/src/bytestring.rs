// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Helpers for the big-endian byte strings used to carry P4Runtime values.
//!
//! P4Runtime allows a value to be sent in its "canonical" form (no leading
//! zero bytes) or padded out to the width of the field.  The SDK always wants
//! values padded to exactly the field width.  Everything that moves a value
//! between those worlds goes through this module, so the width checks live in
//! one place.

use bytes::Bytes;
use bytes::BytesMut;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ByteStringError {
    /// The value has significant bits beyond the width of its field.
    #[error("value {value:02x?} does not fit in {bit_width} bits")]
    TooWide { value: Vec<u8>, bit_width: u32 },
    /// The value does not fit in the integer type it is being decoded into.
    #[error("value {value:02x?} does not fit in a {bits}-bit integer")]
    Overflow { value: Vec<u8>, bits: u32 },
}

pub type ByteStringResult<T> = Result<T, ByteStringError>;

/// The number of bytes needed to hold `bit_width` bits.
pub fn bytes_for_bits(bit_width: u32) -> usize {
    (bit_width as usize).div_ceil(8)
}

/// Strip leading zero bytes, keeping at least one byte for a zero value.
pub fn canonical(value: &[u8]) -> Bytes {
    match value.iter().position(|b| *b != 0) {
        Some(first) => Bytes::copy_from_slice(&value[first..]),
        None if value.is_empty() => Bytes::new(),
        None => Bytes::from_static(&[0]),
    }
}

/// Returns the number of significant bits in a big-endian value.
pub fn significant_bits(value: &[u8]) -> u32 {
    match value.iter().position(|b| *b != 0) {
        Some(first) => {
            let rest = (value.len() - first - 1) as u32;
            rest * 8 + (8 - value[first].leading_zeros())
        }
        None => 0,
    }
}

/// Pad (or trim leading zeros from) `value` so that it is exactly as wide as
/// a field of `bit_width` bits.  Fails if the value has significant bits
/// beyond that width.
pub fn padded(value: &[u8], bit_width: u32) -> ByteStringResult<Bytes> {
    if significant_bits(value) > bit_width {
        return Err(ByteStringError::TooWide {
            value: value.to_vec(),
            bit_width,
        });
    }
    let width = bytes_for_bits(bit_width);
    let canon = canonical(value);
    let significant = if canon.as_ref() == [0] { 0 } else { canon.len() };
    let mut out = BytesMut::zeroed(width - significant.min(width));
    out.extend_from_slice(&canon[canon.len() - significant..]);
    Ok(out.freeze())
}

/// A value of `bit_width` bits with every bit set.
pub fn all_ones(bit_width: u32) -> Bytes {
    let width = bytes_for_bits(bit_width);
    let mut out = BytesMut::from(&vec![0xffu8; width][..]);
    let spare = (width * 8) as u32 - bit_width;
    if width > 0 && spare > 0 {
        out[0] = 0xff >> spare;
    }
    out.freeze()
}

/// Returns true if every byte in `value` is zero.  The empty string counts as
/// zero.
pub fn is_zero(value: &[u8]) -> bool {
    value.iter().all(|b| *b == 0)
}

/// Encode an integer as a byte string exactly `bit_width` bits wide.
pub fn from_uint(value: u64, bit_width: u32) -> ByteStringResult<Bytes> {
    padded(&value.to_be_bytes(), bit_width)
}

/// Decode a big-endian byte string of any length into a `u64`.
pub fn to_u64(value: &[u8]) -> ByteStringResult<u64> {
    if significant_bits(value) > 64 {
        return Err(ByteStringError::Overflow {
            value: value.to_vec(),
            bits: 64,
        });
    }
    Ok(value.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Decode a big-endian byte string of any length into a `u32`.
pub fn to_u32(value: &[u8]) -> ByteStringResult<u32> {
    if significant_bits(value) > 32 {
        return Err(ByteStringError::Overflow {
            value: value.to_vec(),
            bits: 32,
        });
    }
    Ok(value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// A single value in one of the encodings the SDK understands.  Table data
/// fields are typed, and this is how a caller says which type it means.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Uint(u64),
    Bytes(Bytes),
    Bool(bool),
    Array(Vec<u32>),
}

impl FieldValue {
    /// Encode the value for a field `bit_width` bits wide.  Arrays have no
    /// single byte-string encoding and are rejected.
    pub fn encode(&self, bit_width: u32) -> ByteStringResult<Bytes> {
        match self {
            FieldValue::Uint(v) => from_uint(*v, bit_width),
            FieldValue::Bytes(b) => padded(b, bit_width),
            FieldValue::Bool(b) => from_uint(u64::from(*b), bit_width.max(1)),
            FieldValue::Array(a) => Err(ByteStringError::TooWide {
                value: a.iter().flat_map(|v| v.to_be_bytes()).collect(),
                bit_width,
            }),
        }
    }
}
