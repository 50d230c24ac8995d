// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! # tensor-core
//!
//! Tensor types and host-side kernels for the partitioned inference executor.
//!
//! This crate provides:
//! - [`Tensor`] — a shared-storage, n-dimensional tensor handle. Clones are
//!   cheap and alias the same buffer, which is how producer subgraphs and
//!   consumer subgraphs communicate in place.
//! - [`Shape`] and [`DType`] — dimension and element-type descriptors,
//!   including the sub-byte `I4`/`U4` types used by quantised weights.
//! - Strided views (`Tensor::view`) that read and write through to the
//!   parent buffer.
//! - The kernel surface the executor schedules: `gather`, `to_f32`,
//!   `transpose`/`permute`, `concat`, and the `unpack`/`unpack1`/`unpack2`
//!   dequantisation family.
//!
//! # Design Goals
//! - Zero-copy views wherever possible.
//! - Kernel precondition violations are programmer errors and abort via
//!   assertions; they are never surfaced as recoverable errors.
//! - Clean error types via `thiserror` for fallible construction.

mod dtype;
mod error;
mod ops;
mod shape;
mod tensor;

pub use dtype::DType;
pub use error::TensorError;
pub use ops::{concat, gather, permute, to_f32, transpose, unpack, unpack1, unpack2};
pub use shape::Shape;
pub use tensor::Tensor;
