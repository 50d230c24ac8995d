// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Core tensor type with shared storage and strided views.
//!
//! `Tensor` is a cheap-to-clone handle: clones alias the same underlying
//! buffer. This mirrors how the executor wires subgraphs together — a
//! producer's output tensor *is* the consumer's input tensor, and views
//! created by the spatial engine write through to the full-range buffer.
//!
//! # Memory Layout
//! Data is stored in row-major (C) order as a flat byte buffer, guarded by
//! an `RwLock`. Views carry a byte offset and per-dimension byte strides
//! into the parent buffer. Sub-byte (`I4`/`U4`) tensors are always dense;
//! strided views of them are not supported.

use crate::{DType, Shape, TensorError};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An n-dimensional tensor handle over shared, lock-guarded storage.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Vec<u8>>>,
    dtype: DType,
    shape: Shape,
    /// Byte stride per dimension. Empty for scalars and sub-byte tensors.
    strides: Vec<usize>,
    /// Byte offset of this view into the storage.
    offset: usize,
}

/// Row-major byte strides for a dense tensor.
fn dense_byte_strides(shape: &Shape, dtype: DType) -> Vec<usize> {
    if dtype.is_sub_byte() {
        return vec![];
    }
    let elem = dtype.size_bytes();
    shape.strides().into_iter().map(|s| s * elem).collect()
}

impl Tensor {
    /// Creates a new tensor filled with zeros.
    ///
    /// # Examples
    /// ```
    /// use tensor_core::{Tensor, Shape, DType};
    /// let t = Tensor::zeros(Shape::matrix(2, 3), DType::F32);
    /// assert_eq!(t.size_bytes(), 24); // 2 * 3 * 4 bytes
    /// ```
    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        let size = shape.size_bytes(dtype);
        let strides = dense_byte_strides(&shape, dtype);
        Self {
            storage: Arc::new(RwLock::new(vec![0u8; size])),
            dtype,
            shape,
            strides,
            offset: 0,
        }
    }

    /// Creates a tensor from raw bytes.
    ///
    /// Returns an error if the buffer size does not match
    /// `shape.size_bytes(dtype)`.
    pub fn from_bytes(shape: Shape, dtype: DType, data: Vec<u8>) -> Result<Self, TensorError> {
        let expected = shape.size_bytes(dtype);
        if data.len() != expected {
            return Err(TensorError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        let strides = dense_byte_strides(&shape, dtype);
        Ok(Self {
            storage: Arc::new(RwLock::new(data)),
            dtype,
            shape,
            strides,
            offset: 0,
        })
    }

    /// Creates an `F32` tensor from a slice of values.
    pub fn from_f32(shape: Shape, values: &[f32]) -> Result<Self, TensorError> {
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(shape, DType::F32, data)
    }

    /// Creates an `F16` tensor from a slice of values.
    pub fn from_f16(shape: Shape, values: &[half::f16]) -> Result<Self, TensorError> {
        let mut data = Vec::with_capacity(values.len() * 2);
        for v in values {
            data.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Self::from_bytes(shape, DType::F16, data)
    }

    /// Creates an `I64` tensor from a slice of values (gather indices).
    pub fn from_i64(shape: Shape, values: &[i64]) -> Result<Self, TensorError> {
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self::from_bytes(shape, DType::I64, data)
    }

    /// Returns the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the number of elements in this view.
    pub fn num_elements(&self) -> usize {
        self.shape.num_elements()
    }

    /// Returns the logical size of this view in bytes.
    pub fn size_bytes(&self) -> usize {
        self.shape.size_bytes(self.dtype)
    }

    /// Returns `true` if this tensor's elements are laid out densely.
    pub fn is_contiguous(&self) -> bool {
        self.strides == dense_byte_strides(&self.shape, self.dtype)
    }

    /// Returns an address usable as a cache key for the underlying buffer.
    pub fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.storage) as usize
    }

    /// Returns `true` if `self` and `other` alias the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    // ── Views ──────────────────────────────────────────────────

    /// Returns a strided view of length `len` at `offset` along `dim`.
    ///
    /// The view reads and writes in place through the parent buffer.
    /// Sub-byte element types are not supported by this entry point.
    pub fn view(&self, dim: usize, offset: usize, len: usize) -> Tensor {
        let rank = self.shape.rank();
        assert!(dim < rank, "view: dim {dim} out of range for rank {rank}");
        let mut from = vec![0usize; rank];
        let mut to = self.shape.dims().to_vec();
        from[dim] = offset;
        to[dim] = offset + len;
        self.view_bounds(&from, &to)
    }

    /// Returns a strided view with per-dimension lower/upper bounds.
    ///
    /// Sub-byte element types are not supported by this entry point.
    pub fn view_bounds(&self, from: &[usize], to: &[usize]) -> Tensor {
        assert!(
            !self.dtype.is_sub_byte(),
            "view: sub-byte tensors cannot be viewed"
        );
        let rank = self.shape.rank();
        assert_eq!(from.len(), rank, "view: `from` rank mismatch");
        assert_eq!(to.len(), rank, "view: `to` rank mismatch");

        let mut dims = Vec::with_capacity(rank);
        let mut offset = self.offset;
        for d in 0..rank {
            assert!(
                from[d] <= to[d] && to[d] <= self.shape.dims()[d],
                "view: bounds [{}, {}) out of range for dim {} of size {}",
                from[d],
                to[d],
                d,
                self.shape.dims()[d],
            );
            dims.push(to[d] - from[d]);
            offset += self.strides[d] * from[d];
        }

        Tensor {
            storage: Arc::clone(&self.storage),
            dtype: self.dtype,
            shape: Shape::new(dims),
            strides: self.strides.clone(),
            offset,
        }
    }

    // ── Data movement ──────────────────────────────────────────

    /// Copies this tensor's elements into `dst`.
    ///
    /// Both tensors must have the same shape and dtype and must not alias
    /// the same buffer. Either side may be a strided view.
    pub fn copy_to(&self, dst: &Tensor) {
        assert_eq!(self.shape, dst.shape, "copy_to: shape mismatch");
        assert_eq!(self.dtype, dst.dtype, "copy_to: dtype mismatch");
        assert!(
            !self.shares_storage(dst),
            "copy_to: source and destination alias the same buffer"
        );

        let src_buf = self.read_storage();
        let mut dst_buf = dst.write_storage();

        if self.dtype.is_sub_byte() {
            // Sub-byte tensors are always dense, so a block copy suffices.
            let n = self.size_bytes();
            dst_buf[dst.offset..dst.offset + n]
                .copy_from_slice(&src_buf[self.offset..self.offset + n]);
            return;
        }

        let row_bytes = self.row_bytes();
        let src_rows = self.row_byte_offsets();
        let dst_rows = dst.row_byte_offsets();
        for (so, do_) in src_rows.into_iter().zip(dst_rows) {
            dst_buf[do_..do_ + row_bytes].copy_from_slice(&src_buf[so..so + row_bytes]);
        }
    }

    /// Materialises this view's bytes into an owned vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let buf = self.read_storage();
        if self.dtype.is_sub_byte() || self.is_contiguous() {
            let n = self.size_bytes();
            return buf[self.offset..self.offset + n].to_vec();
        }
        let row_bytes = self.row_bytes();
        let mut out = Vec::with_capacity(self.size_bytes());
        for o in self.row_byte_offsets() {
            out.extend_from_slice(&buf[o..o + row_bytes]);
        }
        out
    }

    /// Overwrites this view's elements from a dense byte slice.
    pub fn write_bytes(&self, src: &[u8]) {
        assert_eq!(
            src.len(),
            self.size_bytes(),
            "write_bytes: buffer size mismatch"
        );
        let mut buf = self.write_storage();
        if self.dtype.is_sub_byte() || self.is_contiguous() {
            buf[self.offset..self.offset + src.len()].copy_from_slice(src);
            return;
        }
        let row_bytes = self.row_bytes();
        for (i, o) in self.row_byte_offsets().into_iter().enumerate() {
            buf[o..o + row_bytes].copy_from_slice(&src[i * row_bytes..(i + 1) * row_bytes]);
        }
    }

    /// Reads the elements as `f32` values.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::F32`.
    pub fn as_f32_vec(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DType::F32, "as_f32_vec on {} tensor", self.dtype);
        self.to_bytes()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Overwrites the elements from `f32` values.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::F32` or the length differs.
    pub fn write_f32(&self, values: &[f32]) {
        assert_eq!(self.dtype, DType::F32, "write_f32 on {} tensor", self.dtype);
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        self.write_bytes(&data);
    }

    /// Fills the tensor with a constant `f32` value.
    pub fn fill_f32(&self, value: f32) {
        let n = self.num_elements();
        self.write_f32(&vec![value; n]);
    }

    /// Overwrites the elements from `i64` values.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::I64` or the length differs.
    pub fn write_i64(&self, values: &[i64]) {
        assert_eq!(self.dtype, DType::I64, "write_i64 on {} tensor", self.dtype);
        let mut data = Vec::with_capacity(values.len() * 8);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        self.write_bytes(&data);
    }

    /// Reads the elements as `i64` values.
    ///
    /// # Panics
    /// Panics if `self.dtype() != DType::I64`.
    pub fn as_i64_vec(&self) -> Vec<i64> {
        assert_eq!(self.dtype, DType::I64, "as_i64_vec on {} tensor", self.dtype);
        self.to_bytes()
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    // ── 4-bit packed addressing ────────────────────────────────
    //
    // Two nibbles per byte, low nibble at the even element index.
    // Writes preserve the unaffected nibble exactly.

    /// Reads the nibble at flat element index `idx` of a packed 4-bit tensor.
    pub fn read_4b(&self, idx: usize) -> u8 {
        assert!(self.dtype.is_sub_byte(), "read_4b on {} tensor", self.dtype);
        let buf = self.read_storage();
        let byte = buf[self.offset + idx / 2];
        if idx % 2 == 0 {
            byte & 0xF
        } else {
            byte >> 4
        }
    }

    /// Writes the nibble at flat element index `idx` of a packed 4-bit tensor.
    pub fn write_4b(&self, idx: usize, value: u8) {
        assert!(self.dtype.is_sub_byte(), "write_4b on {} tensor", self.dtype);
        let mut buf = self.write_storage();
        let byte = &mut buf[self.offset + idx / 2];
        if idx % 2 == 0 {
            *byte = (*byte & 0xF0) | (value & 0xF);
        } else {
            *byte = ((value & 0xF) << 4) | (*byte & 0xF);
        }
    }

    // ── Crate-internal raw access for kernels ──────────────────

    pub(crate) fn read_storage(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.storage.read().expect("tensor storage lock poisoned")
    }

    pub(crate) fn write_storage(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.storage.write().expect("tensor storage lock poisoned")
    }

    pub(crate) fn byte_offset(&self) -> usize {
        self.offset
    }

    /// Byte length of one contiguous innermost run.
    pub(crate) fn row_bytes(&self) -> usize {
        let dims = self.shape.dims();
        match dims.last() {
            Some(&last) => last * self.dtype.size_bytes(),
            None => self.dtype.size_bytes(),
        }
    }

    /// Byte offsets of each contiguous innermost run, in row-major order.
    ///
    /// Assumes the innermost dimension is dense, which holds for all views
    /// produced by `view`/`view_bounds` over dense tensors.
    pub(crate) fn row_byte_offsets(&self) -> Vec<usize> {
        let dims = self.shape.dims();
        if dims.len() <= 1 {
            return vec![self.offset];
        }
        let outer_dims = &dims[..dims.len() - 1];
        let outer: usize = outer_dims.iter().product();
        let mut offsets = Vec::with_capacity(outer);
        let mut index = vec![0usize; outer_dims.len()];
        for _ in 0..outer {
            let mut o = self.offset;
            for (d, &i) in index.iter().enumerate() {
                o += i * self.strides[d];
            }
            offsets.push(o);
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < outer_dims[d] {
                    break;
                }
                index[d] = 0;
            }
        }
        offsets
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &format!("{}", self.shape))
            .field("dtype", &self.dtype)
            .field("contiguous", &self.is_contiguous())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let t = Tensor::zeros(Shape::matrix(2, 3), DType::F32);
        assert_eq!(t.size_bytes(), 24);
        assert_eq!(t.shape(), &Shape::matrix(2, 3));
        assert_eq!(t.dtype(), DType::F32);
        assert!(t.as_f32_vec().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_from_f32_roundtrip() {
        let data = vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        let t = Tensor::from_f32(Shape::matrix(2, 3), &data).unwrap();
        assert_eq!(t.as_f32_vec(), data);
    }

    #[test]
    fn test_from_bytes_size_mismatch() {
        let result = Tensor::from_bytes(Shape::matrix(2, 3), DType::F32, vec![0u8; 10]);
        assert!(result.is_err());
    }

    #[test]
    fn test_clone_aliases_storage() {
        let t = Tensor::from_f32(Shape::vector(4), &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let u = t.clone();
        assert!(t.shares_storage(&u));
        u.write_f32(&[9.0, 9.0, 9.0, 9.0]);
        assert_eq!(t.as_f32_vec(), vec![9.0; 4]);
    }

    #[test]
    fn test_view_reads_slice() {
        let t = Tensor::from_f32(
            Shape::matrix(2, 4),
            &[0.0, 1.0, 2.0, 3.0, 10.0, 11.0, 12.0, 13.0],
        )
        .unwrap();
        let v = t.view(1, 1, 2);
        assert_eq!(v.shape(), &Shape::matrix(2, 2));
        assert!(!v.is_contiguous());
        assert_eq!(v.as_f32_vec(), vec![1.0, 2.0, 11.0, 12.0]);
    }

    #[test]
    fn test_view_writes_through() {
        let t = Tensor::zeros(Shape::vector(6), DType::F32);
        let v = t.view(0, 2, 2);
        v.write_f32(&[7.0, 8.0]);
        assert_eq!(t.as_f32_vec(), vec![0.0, 0.0, 7.0, 8.0, 0.0, 0.0]);
    }

    #[test]
    fn test_view_bounds() {
        let t = Tensor::from_f32(
            Shape::matrix(3, 3),
            &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        )
        .unwrap();
        let v = t.view_bounds(&[1, 0], &[3, 2]);
        assert_eq!(v.shape(), &Shape::matrix(2, 2));
        assert_eq!(v.as_f32_vec(), vec![3.0, 4.0, 6.0, 7.0]);
    }

    #[test]
    #[should_panic]
    fn test_view_sub_byte_panics() {
        let t = Tensor::zeros(Shape::matrix(2, 4), DType::I4);
        let _ = t.view(0, 0, 1);
    }

    #[test]
    fn test_copy_to_strided() {
        let src = Tensor::from_f32(Shape::matrix(2, 4), &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0])
            .unwrap();
        let dst = Tensor::zeros(Shape::matrix(2, 4), DType::F32);
        src.view(1, 2, 2).copy_to(&dst.view(1, 0, 2));
        assert_eq!(dst.as_f32_vec(), vec![2.0, 3.0, 0.0, 0.0, 6.0, 7.0, 0.0, 0.0]);
    }

    #[test]
    fn test_nibble_read_write_preserves_neighbour() {
        let t = Tensor::zeros(Shape::vector(4), DType::U4);
        t.write_4b(0, 0xA);
        t.write_4b(1, 0x5);
        assert_eq!(t.read_4b(0), 0xA);
        assert_eq!(t.read_4b(1), 0x5);
        // Overwrite one nibble; the neighbour must be untouched.
        t.write_4b(0, 0x3);
        assert_eq!(t.read_4b(0), 0x3);
        assert_eq!(t.read_4b(1), 0x5);
    }

    #[test]
    fn test_fill_f32() {
        let t = Tensor::zeros(Shape::vector(5), DType::F32);
        t.fill_f32(3.25);
        assert!(t.as_f32_vec().iter().all(|&x| x == 3.25));
    }

    #[test]
    fn test_i64_roundtrip() {
        let t = Tensor::from_i64(Shape::matrix(1, 3), &[5, -2, 0]).unwrap();
        assert_eq!(t.as_i64_vec(), vec![5, -2, 0]);
        t.write_i64(&[7, 8, 9]);
        assert_eq!(t.as_i64_vec(), vec![7, 8, 9]);
    }

    #[test]
    fn test_storage_id_stability() {
        let t = Tensor::zeros(Shape::vector(2), DType::F32);
        let u = t.clone();
        let w = Tensor::zeros(Shape::vector(2), DType::F32);
        assert_eq!(t.storage_id(), u.storage_id());
        assert_ne!(t.storage_id(), w.storage_id());
    }
}
