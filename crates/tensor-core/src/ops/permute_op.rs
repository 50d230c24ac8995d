// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! 3-D transpose and axis permutation for packed and floating tensors.

use super::{nibble_get, nibble_set};
use crate::{DType, Shape, Tensor};

/// Transposes a 3-D `i4` tensor from `[A, B, C]` to `[C, A, B]`.
///
/// Equivalent to `permute(t, [2, 0, 1])`. Operates on the packed nibble
/// representation directly; writes preserve neighbouring nibbles.
///
/// # Panics
/// Panics if `t` is not a 3-D `i4` tensor.
pub fn transpose(t: &Tensor) -> Tensor {
    let dims = t.shape().dims();
    assert_eq!(dims.len(), 3, "transpose: only 3-D tensors are supported");
    assert_eq!(t.dtype(), DType::I4, "transpose: only i4 is supported");

    let (a, b, c) = (dims[0], dims[1], dims[2]);
    let out = Tensor::zeros(Shape::cube(c, a, b), t.dtype());

    let src = t.to_bytes();
    let mut dst = vec![0u8; out.size_bytes()];

    // Treat the input as [A*B, C] and emit its transpose [C, A*B].
    let in_rows = a * b;
    let in_cols = c;
    for i in 0..in_rows {
        for j in 0..in_cols {
            let value = nibble_get(&src, i * in_cols + j);
            nibble_set(&mut dst, j * in_rows + i, value);
        }
    }
    out.write_bytes(&dst);
    out
}

/// Permutes the axes of a 3-D tensor.
///
/// Supported permutations: `[2, 0, 1]` and `[0, 2, 1]` and `[1, 0, 2]` for
/// `i4`, and `[1, 2, 0]` for `f16`/`f32`.
///
/// # Panics
/// Panics for unsupported axis orders or element types.
pub fn permute(t: &Tensor, axes: &[usize; 3]) -> Tensor {
    let dims = t.shape().dims();
    assert_eq!(dims.len(), 3, "permute: only 3-D tensors are supported");

    match axes {
        [2, 0, 1] => transpose(t),
        [0, 2, 1] => {
            assert_eq!(t.dtype(), DType::I4, "permute [0,2,1]: only i4 is supported");
            let (a, b, c) = (dims[0], dims[1], dims[2]);
            let out = Tensor::zeros(Shape::cube(a, c, b), t.dtype());
            let src = t.to_bytes();
            let mut dst = vec![0u8; out.size_bytes()];
            for p in 0..a {
                for r in 0..b {
                    for col in 0..c {
                        let value = nibble_get(&src, (p * b + r) * c + col);
                        nibble_set(&mut dst, (p * c + col) * b + r, value);
                    }
                }
            }
            out.write_bytes(&dst);
            out
        }
        [1, 0, 2] => {
            assert_eq!(t.dtype(), DType::I4, "permute [1,0,2]: only i4 is supported");
            let (a, b, c) = (dims[0], dims[1], dims[2]);
            let out = Tensor::zeros(Shape::cube(b, a, c), t.dtype());
            let src = t.to_bytes();
            let mut dst = vec![0u8; out.size_bytes()];
            for p in 0..b {
                for r in 0..a {
                    for col in 0..c {
                        let value = nibble_get(&src, (r * b + p) * c + col);
                        nibble_set(&mut dst, (p * a + r) * c + col, value);
                    }
                }
            }
            out.write_bytes(&dst);
            out
        }
        [1, 2, 0] => {
            let elem = match t.dtype() {
                DType::F32 => 4,
                DType::F16 => 2,
                other => panic!("permute [1,2,0]: unsupported element type {other}"),
            };
            let (a, b, c) = (dims[0], dims[1], dims[2]);
            let out = Tensor::zeros(Shape::cube(b, c, a), t.dtype());
            let src = t.to_bytes();
            let mut dst = vec![0u8; out.size_bytes()];
            // dst[i, j, k] = src[k, i, j]
            for i in 0..b {
                for j in 0..c {
                    for k in 0..a {
                        let s = ((k * b + i) * c + j) * elem;
                        let d = ((i * c + j) * a + k) * elem;
                        dst[d..d + elem].copy_from_slice(&src[s..s + elem]);
                    }
                }
            }
            out.write_bytes(&dst);
            out
        }
        other => panic!("permute: axis order {other:?} is not supported"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an i4 tensor holding `0..n` (mod 16) in packed order.
    fn i4_iota(a: usize, b: usize, c: usize) -> Tensor {
        let t = Tensor::zeros(Shape::cube(a, b, c), DType::I4);
        for i in 0..a * b * c {
            t.write_4b(i, (i % 16) as u8);
        }
        t
    }

    #[test]
    fn test_transpose_shape() {
        let t = i4_iota(2, 3, 4);
        let u = transpose(&t);
        assert_eq!(u.shape(), &Shape::cube(4, 2, 3));
    }

    #[test]
    fn test_transpose_moves_elements() {
        let t = i4_iota(1, 2, 2); // [[[0, 1], [2, 3]]]
        let u = transpose(&t); // [2, 1, 2]: u[c][a][b] = t[a][b][c]
        assert_eq!(u.read_4b(0), 0); // u[0,0,0] = t[0,0,0]
        assert_eq!(u.read_4b(1), 2); // u[0,0,1] = t[0,1,0]
        assert_eq!(u.read_4b(2), 1); // u[1,0,0] = t[0,0,1]
        assert_eq!(u.read_4b(3), 3); // u[1,0,1] = t[0,1,1]
    }

    #[test]
    fn test_triple_transpose_is_identity() {
        let t = i4_iota(2, 4, 6);
        let u = transpose(&transpose(&transpose(&t)));
        assert_eq!(u.shape(), t.shape());
        assert_eq!(u.to_bytes(), t.to_bytes());
    }

    #[test]
    fn test_permute_021_then_back() {
        let t = i4_iota(2, 3, 4);
        let u = permute(&t, &[0, 2, 1]);
        assert_eq!(u.shape(), &Shape::cube(2, 4, 3));
        let v = permute(&u, &[0, 2, 1]);
        assert_eq!(v.to_bytes(), t.to_bytes());
    }

    #[test]
    fn test_permute_102_then_back() {
        let t = i4_iota(3, 2, 4);
        let u = permute(&t, &[1, 0, 2]);
        assert_eq!(u.shape(), &Shape::cube(2, 3, 4));
        let v = permute(&u, &[1, 0, 2]);
        assert_eq!(v.to_bytes(), t.to_bytes());
    }

    #[test]
    fn test_permute_120_f32() {
        let t = Tensor::from_f32(
            Shape::cube(2, 1, 2),
            &[0.0, 1.0, 10.0, 11.0],
        )
        .unwrap();
        let u = permute(&t, &[1, 2, 0]);
        assert_eq!(u.shape(), &Shape::cube(1, 2, 2));
        // u[i, j, k] = t[k, i, j]
        assert_eq!(u.as_f32_vec(), vec![0.0, 10.0, 1.0, 11.0]);
    }

    #[test]
    #[should_panic]
    fn test_unsupported_axes_panics() {
        let t = i4_iota(2, 2, 2);
        let _ = permute(&t, &[2, 1, 0]);
    }
}
