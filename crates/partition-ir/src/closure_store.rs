// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Closure tensor loading from SafeTensors files with memory-mapped I/O.
//!
//! [`ClosureStore`] provides two modes:
//!
//! 1. **File-backed** — opens `closures.safetensors` via mmap and extracts
//!    tensor data on demand. This is the production path.
//! 2. **Synthetic** — returns zero-filled tensors with the requested
//!    shapes, for tests and benchmarks without weight files.

use crate::IrError;
use std::path::{Path, PathBuf};
use tensor_core::{DType, Shape, Tensor};

/// Default SafeTensors filename.
const CLOSURES_FILE: &str = "closures.safetensors";

/// Loads closure tensors from a SafeTensors file on demand.
pub struct ClosureStore {
    /// Directory containing the SafeTensors file.
    dir: PathBuf,
    /// Memory-mapped SafeTensors file (opened once, reused).
    mmap: Option<memmap2::Mmap>,
}

impl ClosureStore {
    /// Creates a store for the given directory.
    ///
    /// If the SafeTensors file exists, it is memory-mapped immediately.
    /// If it does not exist, the store operates in synthetic mode.
    pub fn new(dir: PathBuf) -> Result<Self, IrError> {
        let path = dir.join(CLOSURES_FILE);

        let mmap = if path.exists() {
            let file = std::fs::File::open(&path).map_err(|e| IrError::ClosureLoad {
                name: CLOSURES_FILE.into(),
                detail: format!("cannot open '{}': {e}", path.display()),
            })?;
            let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| IrError::ClosureLoad {
                name: CLOSURES_FILE.into(),
                detail: format!("mmap failed: {e}"),
            })?;
            tracing::info!(
                "closure store: mmap'd {} ({:.2} MB)",
                path.display(),
                mmap.len() as f64 / (1024.0 * 1024.0),
            );
            Some(mmap)
        } else {
            tracing::warn!(
                "closure store: '{}' not found, using synthetic mode",
                path.display(),
            );
            None
        };

        Ok(Self { dir, mmap })
    }

    /// Creates a store in synthetic mode (no file needed).
    pub fn synthetic() -> Self {
        Self {
            dir: PathBuf::from("<synthetic>"),
            mmap: None,
        }
    }

    /// Returns `true` if operating in file-backed mode.
    pub fn is_file_backed(&self) -> bool {
        self.mmap.is_some()
    }

    /// Returns the store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads one closure tensor by name.
    ///
    /// In file-backed mode, reads the tensor bytes from the mmap'd file and
    /// checks them against the expected shape and dtype. In synthetic mode,
    /// returns a zero-filled tensor.
    pub fn load(&self, name: &str, shape: Shape, dtype: DType) -> Result<Tensor, IrError> {
        let Some(mmap) = &self.mmap else {
            return Ok(Tensor::zeros(shape, dtype));
        };

        let st = safetensors::SafeTensors::deserialize(mmap).map_err(|e| IrError::ClosureLoad {
            name: name.into(),
            detail: format!("SafeTensors parse error: {e}"),
        })?;
        let view = st.tensor(name).map_err(|e| IrError::ClosureLoad {
            name: name.into(),
            detail: format!("tensor not found: {e}"),
        })?;

        Tensor::from_bytes(shape, dtype, view.data().to_vec()).map_err(|e| IrError::ClosureLoad {
            name: name.into(),
            detail: format!("shape mismatch: {e}"),
        })
    }
}

impl std::fmt::Debug for ClosureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureStore")
            .field("dir", &self.dir)
            .field("file_backed", &self.is_file_backed())
            .finish()
    }
}
