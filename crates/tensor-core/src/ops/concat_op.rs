// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Concatenation of 3-D tensors along the outer or innermost axis.

use crate::{Shape, Tensor};

/// Concatenates 3-D tensors along `axis`, which must be 0 or 2.
///
/// All inputs must share dtype and agree on every non-concatenated
/// dimension. Packed `i4`/`u4` tensors are supported via half-byte strides
/// on axis 0, and on axis 2 when every slice boundary is byte-aligned.
///
/// # Panics
/// Panics on unsupported axis, mixed dtypes, mismatched dimensions, or
/// non-contiguous inputs.
pub fn concat(ts: &[Tensor], axis: usize) -> Tensor {
    assert!(axis == 0 || axis == 2, "concat: axis must be 0 or 2");
    assert!(!ts.is_empty(), "concat: no inputs");

    let dtype = ts[0].dtype();
    let first_dims = ts[0].shape().dims().to_vec();
    assert_eq!(first_dims.len(), 3, "concat: only 3-D tensors are supported");

    let mut offsets = Vec::with_capacity(ts.len());
    let mut lens = Vec::with_capacity(ts.len());
    let mut new_dim = 0usize;
    for t in ts {
        assert_eq!(t.dtype(), dtype, "concat: mixed element types");
        assert!(t.is_contiguous(), "concat: strided tensors unsupported");
        let dims = t.shape().dims();
        assert_eq!(dims.len(), 3, "concat: only 3-D tensors are supported");
        for d in 0..3 {
            if d != axis {
                assert_eq!(dims[d], first_dims[d], "concat: dim {d} mismatch");
            }
        }
        offsets.push(new_dim);
        lens.push(dims[axis]);
        new_dim += dims[axis];
    }

    let mut out_dims = first_dims.clone();
    out_dims[axis] = new_dim;
    let out = Tensor::zeros(Shape::new(out_dims.clone()), dtype);

    let is_4bit = dtype.is_sub_byte();
    let elem_bytes = if is_4bit { 0 } else { dtype.size_bytes() };
    let mut dst = vec![0u8; out.size_bytes()];

    if axis == 0 {
        let mut dst_ptr = 0usize;
        for (t_idx, t) in ts.iter().enumerate() {
            let copy_elems = lens[t_idx] * out_dims[1] * out_dims[2];
            let copy_len = if is_4bit {
                copy_elems / 2
            } else {
                copy_elems * elem_bytes
            };
            let src = t.to_bytes();
            dst[dst_ptr..dst_ptr + copy_len].copy_from_slice(&src[..copy_len]);
            dst_ptr += copy_len;
        }
    } else {
        // axis == 2: interleave each input's rows into the widened rows.
        let rows = out_dims[0] * out_dims[1];
        for (t_idx, t) in ts.iter().enumerate() {
            let src = t.to_bytes();
            for r in 0..rows {
                let (r_off, c_off, copy_len, r_off_src) = if is_4bit {
                    (
                        new_dim * r / 2,
                        offsets[t_idx] / 2,
                        lens[t_idx] / 2,
                        lens[t_idx] * r / 2,
                    )
                } else {
                    (
                        new_dim * r * elem_bytes,
                        offsets[t_idx] * elem_bytes,
                        lens[t_idx] * elem_bytes,
                        lens[t_idx] * r * elem_bytes,
                    )
                };
                dst[r_off + c_off..r_off + c_off + copy_len]
                    .copy_from_slice(&src[r_off_src..r_off_src + copy_len]);
            }
        }
    }

    out.write_bytes(&dst);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;

    #[test]
    fn test_concat_axis0_f32() {
        let a = Tensor::from_f32(Shape::cube(1, 2, 2), &[0.0, 1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::from_f32(Shape::cube(2, 2, 2), &(4..12).map(|v| v as f32).collect::<Vec<_>>())
            .unwrap();
        let c = concat(&[a, b], 0);
        assert_eq!(c.shape(), &Shape::cube(3, 2, 2));
        assert_eq!(c.as_f32_vec(), (0..12).map(|v| v as f32).collect::<Vec<_>>());
    }

    #[test]
    fn test_concat_axis2_f32() {
        let a = Tensor::from_f32(Shape::cube(1, 2, 1), &[0.0, 10.0]).unwrap();
        let b = Tensor::from_f32(Shape::cube(1, 2, 2), &[1.0, 2.0, 11.0, 12.0]).unwrap();
        let c = concat(&[a, b], 2);
        assert_eq!(c.shape(), &Shape::cube(1, 2, 3));
        assert_eq!(c.as_f32_vec(), vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_concat_axis0_i4() {
        let a = Tensor::zeros(Shape::cube(1, 1, 4), DType::I4);
        let b = Tensor::zeros(Shape::cube(1, 1, 4), DType::I4);
        for i in 0..4 {
            a.write_4b(i, i as u8);
            b.write_4b(i, (i + 4) as u8);
        }
        let c = concat(&[a, b], 0);
        assert_eq!(c.shape(), &Shape::cube(2, 1, 4));
        for i in 0..8 {
            assert_eq!(c.read_4b(i), i as u8);
        }
    }

    #[test]
    fn test_split_concat_roundtrip() {
        // concat(split(t, axis), axis) == t, splitting via views.
        let t = Tensor::from_f32(
            Shape::cube(4, 2, 2),
            &(0..16).map(|v| v as f32).collect::<Vec<_>>(),
        )
        .unwrap();
        let halves: Vec<Tensor> = [(0, 2), (2, 2)]
            .iter()
            .map(|&(off, len)| {
                let v = t.view(0, off, len);
                Tensor::from_bytes(v.shape().clone(), v.dtype(), v.to_bytes()).unwrap()
            })
            .collect();
        let back = concat(&halves, 0);
        assert_eq!(back.as_f32_vec(), t.as_f32_vec());
    }

    #[test]
    fn test_split_concat_roundtrip_axis2() {
        let t = Tensor::from_f32(
            Shape::cube(2, 2, 4),
            &(0..16).map(|v| v as f32).collect::<Vec<_>>(),
        )
        .unwrap();
        let parts: Vec<Tensor> = [(0, 1), (1, 3)]
            .iter()
            .map(|&(off, len)| {
                let v = t.view(2, off, len);
                Tensor::from_bytes(v.shape().clone(), v.dtype(), v.to_bytes()).unwrap()
            })
            .collect();
        let back = concat(&parts, 2);
        assert_eq!(back.as_f32_vec(), t.as_f32_vec());
    }

    #[test]
    #[should_panic]
    fn test_concat_axis1_panics() {
        let a = Tensor::zeros(Shape::cube(1, 1, 1), DType::F32);
        let _ = concat(&[a], 1);
    }

    #[test]
    #[should_panic]
    fn test_concat_dim_mismatch_panics() {
        let a = Tensor::zeros(Shape::cube(1, 2, 2), DType::F32);
        let b = Tensor::zeros(Shape::cube(1, 3, 2), DType::F32);
        let _ = concat(&[a, b], 0);
    }
}
