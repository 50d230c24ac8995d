// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Host-side row gather, used for embedding lookups into closure slots.

use crate::{DType, Tensor};

/// Gathers rows of `src` selected by `idx` into `dst`.
///
/// `src` is `[R, C]` with element type `f16` or `f32`; `idx` is `i64 [1, N]`;
/// `dst` is `[1, N, C]` with the same element type as `src`. Row `r` of
/// `dst[0]` is `src[idx[0, r]]`.
///
/// # Panics
/// Panics on any shape, dtype, or index-range violation.
pub fn gather(src: &Tensor, idx: &Tensor, dst: &Tensor) {
    assert_eq!(idx.dtype(), DType::I64, "gather: idx must be i64");
    assert!(
        src.dtype() == DType::F16 || src.dtype() == DType::F32,
        "gather: src must be f16 or f32, got {}",
        src.dtype()
    );
    assert_eq!(src.dtype(), dst.dtype(), "gather: src/dst dtype mismatch");

    let idx_dims = idx.shape().dims();
    assert_eq!(idx_dims.len(), 2, "gather: idx must be 2-D");
    assert_eq!(idx_dims[0], 1, "gather: idx must be [1, N]");

    let src_dims = src.shape().dims();
    assert_eq!(src_dims.len(), 2, "gather: src must be 2-D");

    let dst_dims = dst.shape().dims();
    assert_eq!(dst_dims.len(), 3, "gather: dst must be 3-D");
    assert_eq!(
        src_dims[1], dst_dims[2],
        "gather: src columns must match dst innermost dim"
    );
    assert!(src.is_contiguous() && dst.is_contiguous(), "gather: strided tensors unsupported");

    let rows = src_dims[0];
    let elem = src.dtype().size_bytes();
    let row_bytes = src_dims[1] * elem;

    let indices = idx.as_i64_vec();
    let src_buf = src.read_storage();
    let mut dst_buf = dst.write_storage();
    let src_base = src.byte_offset();
    let mut dst_ptr = dst.byte_offset();

    for &row in indices.iter().take(idx_dims[1]) {
        assert!(
            row >= 0 && (row as usize) < rows,
            "gather: index {row} out of range for {rows} rows"
        );
        let src_row = src_base + row as usize * row_bytes;
        dst_buf[dst_ptr..dst_ptr + row_bytes]
            .copy_from_slice(&src_buf[src_row..src_row + row_bytes]);
        dst_ptr += row_bytes;
    }
}
