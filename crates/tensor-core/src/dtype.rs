// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Supported tensor element data types.

/// Enumerates the numeric types a [`crate::Tensor`] can hold.
///
/// The executor uses `DType` to decide memory layout and which unpack
/// kernel to dispatch. `I4`/`U4` are packed two elements per byte, with
/// the low nibble at the even element index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DType {
    /// 32-bit IEEE 754 floating point.
    F32,
    /// 16-bit IEEE 754 floating point.
    F16,
    /// 16-bit brain floating point.
    BF16,
    /// 64-bit signed integer (gather indices).
    I64,
    /// 64-bit unsigned integer.
    U64,
    /// 32-bit signed integer.
    I32,
    /// 32-bit unsigned integer.
    U32,
    /// 16-bit signed integer.
    I16,
    /// 16-bit unsigned integer.
    U16,
    /// 8-bit signed integer (quantised weights).
    I8,
    /// 8-bit unsigned integer (quantised weights).
    U8,
    /// 4-bit signed integer, packed two per byte.
    I4,
    /// 4-bit unsigned integer, packed two per byte.
    U4,
}

impl DType {
    /// Returns the size of a single element in bits.
    pub fn bit_width(self) -> usize {
        match self {
            DType::F32 | DType::I32 | DType::U32 => 32,
            DType::F16 | DType::BF16 | DType::I16 | DType::U16 => 16,
            DType::I64 | DType::U64 => 64,
            DType::I8 | DType::U8 => 8,
            DType::I4 | DType::U4 => 4,
        }
    }

    /// Returns the size of a single element in bytes.
    ///
    /// # Panics
    /// Panics for the sub-byte types `I4`/`U4`, which have no per-element
    /// byte size. Use [`bit_width`](DType::bit_width) there instead.
    pub fn size_bytes(self) -> usize {
        assert!(
            !self.is_sub_byte(),
            "size_bytes called on sub-byte type {self:?}"
        );
        self.bit_width() / 8
    }

    /// Returns `true` for the packed 4-bit types.
    pub fn is_sub_byte(self) -> bool {
        matches!(self, DType::I4 | DType::U4)
    }

    /// Returns `true` for the floating-point types.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }

    /// Returns a human-readable label for this data type.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::I64 => "i64",
            DType::U64 => "u64",
            DType::I32 => "i32",
            DType::U32 => "u32",
            DType::I16 => "i16",
            DType::U16 => "u16",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I4 => "i4",
            DType::U4 => "u4",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_widths() {
        assert_eq!(DType::F32.bit_width(), 32);
        assert_eq!(DType::BF16.bit_width(), 16);
        assert_eq!(DType::I8.bit_width(), 8);
        assert_eq!(DType::I4.bit_width(), 4);
    }

    #[test]
    fn test_size_bytes() {
        assert_eq!(DType::F32.size_bytes(), 4);
        assert_eq!(DType::F16.size_bytes(), 2);
        assert_eq!(DType::I64.size_bytes(), 8);
    }

    #[test]
    #[should_panic]
    fn test_size_bytes_sub_byte_panics() {
        let _ = DType::I4.size_bytes();
    }

    #[test]
    fn test_predicates() {
        assert!(DType::U4.is_sub_byte());
        assert!(!DType::U8.is_sub_byte());
        assert!(DType::BF16.is_float());
        assert!(!DType::I32.is_float());
    }
}
