// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Factory and policy contracts implemented by a device backend.

use crate::{BackendError, Subrequest};
use std::sync::Arc;
use tensor_core::Tensor;

/// The compile/create collaborator behind the executor.
///
/// One `Backend` serves one compiled model; subgraphs are addressed by
/// index. Creation reads the subgraph's device cursor, so a failover that
/// advanced the cursor is picked up by the next `create_subrequests` call.
pub trait Backend: Send + Sync {
    /// Creates `count` fresh subrequests for subgraph `sub_idx` on its
    /// currently selected device.
    ///
    /// Sets `recompiled` to `true` if creation itself had to fall through
    /// to another device (construction-time failover); the caller then
    /// logs the refined device distribution.
    fn create_subrequests(
        &self,
        sub_idx: usize,
        count: usize,
        recompiled: &mut bool,
    ) -> Result<Vec<Arc<dyn Subrequest>>, BackendError>;

    /// Advances through the device list until compilation succeeds for
    /// subgraph `real_idx`. Returns `false` when no device is left.
    fn compile_for_success(&self, real_idx: usize) -> bool;

    /// Whether tensors bound to subgraph `sub_idx` must be deep-copied
    /// because its device cannot retain caller memory.
    fn needs_copy(&self, sub_idx: usize) -> bool;

    /// Logs the current subgraph-to-device distribution.
    fn log_device_distribution(&self);
}

/// Read-only provider of device-resident constant tensors.
///
/// For closures that never change at runtime, the executor binds the
/// bank's tensor once at request construction and treats the underlying
/// memory as immutable from then on.
pub trait WeightsBank: Send + Sync {
    /// Returns the device-resident tensor for `closure` on `device`.
    fn get(&self, closure: &Tensor, device: &str) -> Tensor;
}
