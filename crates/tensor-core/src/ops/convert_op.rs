// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Parallel element-wise upcast to `f32`.

use crate::{DType, Tensor};
use rayon::prelude::*;

/// Upcasts `input` to `f32` element-wise into `output`.
///
/// Supports any integer type, `bf16`, `f16`, and `f32` input. An `f32`
/// input degenerates to a plain copy (and to a no-op when `input` and
/// `output` alias the same buffer). Both tensors must be contiguous and
/// have the same shape.
///
/// # Panics
/// Panics on shape mismatch, non-contiguous tensors, or an unsupported
/// input dtype.
pub fn to_f32(input: &Tensor, output: &Tensor) {
    assert!(input.is_contiguous(), "to_f32: input must be contiguous");
    assert!(output.is_contiguous(), "to_f32: output must be contiguous");
    assert_eq!(input.shape(), output.shape(), "to_f32: shape mismatch");
    assert_eq!(output.dtype(), DType::F32, "to_f32: output must be f32");

    if input.dtype() == DType::F32 {
        if !input.shares_storage(output) {
            input.copy_to(output);
        }
        return;
    }
    assert!(
        !input.shares_storage(output),
        "to_f32: input and output alias the same buffer"
    );

    let src_guard = input.read_storage();
    let mut dst_guard = output.write_storage();
    let src = &src_guard[input.byte_offset()..input.byte_offset() + input.size_bytes()];
    let dst_off = output.byte_offset();
    let dst = &mut dst_guard[dst_off..dst_off + output.size_bytes()];

    match input.dtype() {
        DType::U8 => upcast::<1>(src, dst, |b| b[0] as f32),
        DType::I8 => upcast::<1>(src, dst, |b| (b[0] as i8) as f32),
        DType::U16 => upcast::<2>(src, dst, |b| u16::from_le_bytes(b) as f32),
        DType::I16 => upcast::<2>(src, dst, |b| i16::from_le_bytes(b) as f32),
        DType::U32 => upcast::<4>(src, dst, |b| u32::from_le_bytes(b) as f32),
        DType::I32 => upcast::<4>(src, dst, |b| i32::from_le_bytes(b) as f32),
        DType::U64 => upcast::<8>(src, dst, |b| u64::from_le_bytes(b) as f32),
        DType::I64 => upcast::<8>(src, dst, |b| i64::from_le_bytes(b) as f32),
        DType::F16 => upcast::<2>(src, dst, |b| {
            half::f16::from_bits(u16::from_le_bytes(b)).to_f32()
        }),
        DType::BF16 => upcast::<2>(src, dst, |b| {
            half::bf16::from_bits(u16::from_le_bytes(b)).to_f32()
        }),
        other => panic!("to_f32: unsupported input type {other}"),
    }
}

/// Splits the work across threads; each element is converted independently.
fn upcast<const N: usize>(src: &[u8], dst: &mut [u8], f: impl Fn([u8; N]) -> f32 + Sync) {
    src.par_chunks_exact(N)
        .zip(dst.par_chunks_exact_mut(4))
        .for_each(|(s, d)| {
            let v = f(s.try_into().expect("chunk width"));
            d.copy_from_slice(&v.to_le_bytes());
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Shape;

    #[test]
    fn test_i8_upcast() {
        let t = Tensor::from_bytes(
            Shape::vector(4),
            DType::I8,
            vec![0u8, 1, 255, 128], // 0, 1, -1, -128
        )
        .unwrap();
        let out = Tensor::zeros(Shape::vector(4), DType::F32);
        to_f32(&t, &out);
        assert_eq!(out.as_f32_vec(), vec![0.0, 1.0, -1.0, -128.0]);
    }

    #[test]
    fn test_f16_upcast() {
        let vals: Vec<half::f16> = [0.5f32, -2.0, 8.0]
            .iter()
            .map(|&v| half::f16::from_f32(v))
            .collect();
        let t = Tensor::from_f16(Shape::vector(3), &vals).unwrap();
        let out = Tensor::zeros(Shape::vector(3), DType::F32);
        to_f32(&t, &out);
        assert_eq!(out.as_f32_vec(), vec![0.5, -2.0, 8.0]);
    }

    #[test]
    fn test_f32_is_copy() {
        let t = Tensor::from_f32(Shape::vector(3), &[1.0, 2.0, 3.0]).unwrap();
        let out = Tensor::zeros(Shape::vector(3), DType::F32);
        to_f32(&t, &out);
        assert_eq!(out.as_f32_vec(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_idempotence() {
        // to_f32(to_f32(x)) == to_f32(x): a second pass over an f32 result
        // must leave it unchanged, including when it aliases itself.
        let vals: Vec<half::f16> = [1.25f32, -0.75, 3.5, 100.0]
            .iter()
            .map(|&v| half::f16::from_f32(v))
            .collect();
        let t = Tensor::from_f16(Shape::vector(4), &vals).unwrap();
        let once = Tensor::zeros(Shape::vector(4), DType::F32);
        to_f32(&t, &once);
        let twice = Tensor::zeros(Shape::vector(4), DType::F32);
        to_f32(&once, &twice);
        assert_eq!(once.as_f32_vec(), twice.as_f32_vec());

        // Self-aliasing pass is a no-op.
        to_f32(&once, &once);
        assert_eq!(once.as_f32_vec(), twice.as_f32_vec());
    }

    #[test]
    fn test_i64_upcast() {
        let t = Tensor::from_i64(Shape::vector(3), &[-5, 0, 1000]).unwrap();
        let out = Tensor::zeros(Shape::vector(3), DType::F32);
        to_f32(&t, &out);
        assert_eq!(out.as_f32_vec(), vec![-5.0, 0.0, 1000.0]);
    }

    #[test]
    #[should_panic]
    fn test_shape_mismatch_panics() {
        let t = Tensor::zeros(Shape::vector(3), DType::I8);
        let out = Tensor::zeros(Shape::vector(4), DType::F32);
        to_f32(&t, &out);
    }
}
