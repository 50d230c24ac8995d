// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Weight dequantisation kernels.
//!
//! `unpack` converts element types; `unpack1` additionally multiplies by a
//! scale tensor; `unpack2` subtracts a zero-point before scaling. Scale and
//! zero-point tensors broadcast per row (`[R, 1]` against `[R, C]` data) or
//! as scalars.
//!
//! The kernels always write into the destination the subrequest exposes at
//! its input port — never into the packed source.

use super::nibble_get;
use crate::{DType, Tensor};

/// Element-type conversion without scaling.
pub fn unpack(from: &Tensor, to: &Tensor) {
    dequantize(from, None, None, to);
}

/// Conversion with a per-row or scalar scale: `out = from * scale`.
pub fn unpack1(from: &Tensor, scale: &Tensor, to: &Tensor) {
    dequantize(from, None, Some(scale), to);
}

/// Conversion with zero-point and scale: `out = (from - zerop) * scale`.
pub fn unpack2(from: &Tensor, zerop: &Tensor, scale: &Tensor, to: &Tensor) {
    dequantize(from, Some(zerop), Some(scale), to);
}

fn dequantize(from: &Tensor, zerop: Option<&Tensor>, scale: Option<&Tensor>, to: &Tensor) {
    assert_eq!(from.shape(), to.shape(), "unpack: shape mismatch");
    assert!(
        to.dtype() == DType::F16 || to.dtype() == DType::F32,
        "unpack: destination must be f16 or f32, got {}",
        to.dtype()
    );
    assert!(to.is_contiguous(), "unpack: destination must be contiguous");
    assert!(
        !from.shares_storage(to),
        "unpack: source and destination alias the same buffer"
    );

    let total = from.num_elements();
    let cols = from.shape().dims().last().copied().unwrap_or(1);
    let rows = if cols == 0 { 0 } else { total / cols };

    let src = from.to_bytes();
    let zerop_vals = zerop.map(|z| broadcast_values(z, rows, total, "zerop"));
    let scale_vals = scale.map(|s| broadcast_values(s, rows, total, "scale"));

    let read = element_reader(from.dtype());
    let mut dst = vec![0u8; to.size_bytes()];
    let write_f16 = to.dtype() == DType::F16;

    for i in 0..total {
        let mut v = read(&src, i);
        if let Some(b) = &zerop_vals {
            v -= b.at(i, cols);
        }
        if let Some(b) = &scale_vals {
            v *= b.at(i, cols);
        }
        if write_f16 {
            let bits = half::f16::from_f32(v).to_bits().to_le_bytes();
            dst[i * 2..i * 2 + 2].copy_from_slice(&bits);
        } else {
            dst[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }
    to.write_bytes(&dst);
}

/// Companion tensor values with their broadcast mode resolved.
struct Broadcast {
    values: Vec<f32>,
    mode: Mode,
}

enum Mode {
    Scalar,
    PerRow,
    PerElement,
}

impl Broadcast {
    fn at(&self, i: usize, cols: usize) -> f32 {
        match self.mode {
            Mode::Scalar => self.values[0],
            Mode::PerRow => self.values[i / cols],
            Mode::PerElement => self.values[i],
        }
    }
}

fn broadcast_values(t: &Tensor, rows: usize, total: usize, what: &str) -> Broadcast {
    let n = t.num_elements();
    let mode = if n == 1 {
        Mode::Scalar
    } else if n == rows {
        Mode::PerRow
    } else if n == total {
        Mode::PerElement
    } else {
        panic!("unpack: {what} has {n} elements; expected 1, {rows}, or {total}");
    };
    let src = t.to_bytes();
    let read = element_reader(t.dtype());
    let values = (0..n).map(|i| read(&src, i)).collect();
    Broadcast { values, mode }
}

/// Returns a flat-index element reader producing `f32` for a packed buffer.
fn element_reader(dtype: DType) -> fn(&[u8], usize) -> f32 {
    match dtype {
        DType::I4 => |b, i| {
            let v = nibble_get(b, i) as i8;
            (if v > 7 { v - 16 } else { v }) as f32
        },
        DType::U4 => |b, i| nibble_get(b, i) as f32,
        DType::I8 => |b, i| (b[i] as i8) as f32,
        DType::U8 => |b, i| b[i] as f32,
        DType::F16 => |b, i| {
            half::f16::from_bits(u16::from_le_bytes([b[i * 2], b[i * 2 + 1]])).to_f32()
        },
        DType::BF16 => |b, i| {
            half::bf16::from_bits(u16::from_le_bytes([b[i * 2], b[i * 2 + 1]])).to_f32()
        },
        DType::F32 => |b, i| {
            f32::from_le_bytes([b[i * 4], b[i * 4 + 1], b[i * 4 + 2], b[i * 4 + 3]])
        },
        other => panic!("unpack: unsupported source type {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{to_f32, Shape};

    fn i4_tensor(shape: Shape, nibbles: &[i8]) -> Tensor {
        let t = Tensor::zeros(shape, DType::I4);
        for (i, &v) in nibbles.iter().enumerate() {
            t.write_4b(i, (v & 0xF) as u8);
        }
        t
    }

    #[test]
    fn test_unpack_i8_to_f32() {
        let q = Tensor::from_bytes(Shape::vector(3), DType::I8, vec![1, 255, 3]).unwrap();
        let out = Tensor::zeros(Shape::vector(3), DType::F32);
        unpack(&q, &out);
        assert_eq!(out.as_f32_vec(), vec![1.0, -1.0, 3.0]);
    }

    #[test]
    fn test_unpack_i4_sign_extension() {
        let q = i4_tensor(Shape::vector(4), &[0, 7, -8, -1]);
        let out = Tensor::zeros(Shape::vector(4), DType::F32);
        unpack(&q, &out);
        assert_eq!(out.as_f32_vec(), vec![0.0, 7.0, -8.0, -1.0]);
    }

    #[test]
    fn test_unpack1_per_row_scale() {
        let q = Tensor::from_bytes(Shape::matrix(2, 2), DType::U8, vec![1, 2, 3, 4]).unwrap();
        let scale = Tensor::from_f32(Shape::matrix(2, 1), &[10.0, 100.0]).unwrap();
        let out = Tensor::zeros(Shape::matrix(2, 2), DType::F32);
        unpack1(&q, &scale, &out);
        assert_eq!(out.as_f32_vec(), vec![10.0, 20.0, 300.0, 400.0]);
    }

    #[test]
    fn test_unpack2_law() {
        // unpack2(q, z, s, dst); to_f32(dst) == (q - z) * s element-wise.
        let q = i4_tensor(Shape::matrix(2, 4), &[0, 1, 2, 3, 4, 5, 6, 7]);
        let zerop = Tensor::from_f32(Shape::matrix(2, 1), &[1.0, 3.0]).unwrap();
        let scale = Tensor::from_f32(Shape::matrix(2, 1), &[0.5, 2.0]).unwrap();

        let dst = Tensor::zeros(Shape::matrix(2, 4), DType::F16);
        unpack2(&q, &zerop, &scale, &dst);
        let dst_f32 = Tensor::zeros(Shape::matrix(2, 4), DType::F32);
        to_f32(&dst, &dst_f32);

        let expected: Vec<f32> = [
            (0.0 - 1.0) * 0.5,
            (1.0 - 1.0) * 0.5,
            (2.0 - 1.0) * 0.5,
            (3.0 - 1.0) * 0.5,
            (4.0 - 3.0) * 2.0,
            (5.0 - 3.0) * 2.0,
            (6.0 - 3.0) * 2.0,
            (7.0 - 3.0) * 2.0,
        ]
        .to_vec();
        for (got, want) in dst_f32.as_f32_vec().iter().zip(expected) {
            assert!((got - want).abs() < 1e-2, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_unpack_f16_passthrough_values() {
        let vals: Vec<half::f16> = [0.25f32, 1.5].iter().map(|&v| half::f16::from_f32(v)).collect();
        let q = Tensor::from_f16(Shape::vector(2), &vals).unwrap();
        let out = Tensor::zeros(Shape::vector(2), DType::F32);
        unpack(&q, &out);
        assert_eq!(out.as_f32_vec(), vec![0.25, 1.5]);
    }

    #[test]
    fn test_unpack1_scalar_scale() {
        let q = Tensor::from_bytes(Shape::vector(3), DType::U8, vec![1, 2, 3]).unwrap();
        let scale = Tensor::from_f32(Shape::vector(1), &[2.0]).unwrap();
        let out = Tensor::zeros(Shape::vector(3), DType::F32);
        unpack1(&q, &scale, &out);
        assert_eq!(out.as_f32_vec(), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    #[should_panic]
    fn test_bad_scale_length_panics() {
        let q = Tensor::from_bytes(Shape::matrix(2, 2), DType::U8, vec![0; 4]).unwrap();
        let scale = Tensor::from_f32(Shape::vector(3), &[1.0, 1.0, 1.0]).unwrap();
        let out = Tensor::zeros(Shape::matrix(2, 2), DType::F32);
        unpack1(&q, &scale, &out);
    }
}
