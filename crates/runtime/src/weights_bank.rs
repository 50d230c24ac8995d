// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Device-aware weights bank.
//!
//! Closures with `update_required = false` are bound once per request and
//! never touched again, so their memory can be shared between requests.
//! [`DeviceWeightsBank`] returns the closure tensor itself for devices
//! that can retain caller memory, and a cached per-device copy otherwise.
//! Cache entries are keyed by `(buffer identity, device)` — two requests
//! asking for the same closure on the same device receive the same tensor.

use accel_backend::WeightsBank;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tensor_core::Tensor;

/// A caching weights bank.
pub struct DeviceWeightsBank {
    /// Devices whose memory must be populated by copy.
    copy_devices: HashSet<String>,
    /// `(storage id, device) -> device-resident tensor`.
    cache: Mutex<HashMap<(usize, String), Tensor>>,
}

impl DeviceWeightsBank {
    /// A bank where every device can retain caller memory directly.
    pub fn shared() -> Self {
        Self {
            copy_devices: HashSet::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// A bank that deep-copies closures for the listed devices.
    pub fn with_copy_devices(devices: impl IntoIterator<Item = String>) -> Self {
        Self {
            copy_devices: devices.into_iter().collect(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of device-resident copies currently cached.
    pub fn cached_count(&self) -> usize {
        self.cache.lock().expect("bank cache lock poisoned").len()
    }
}

impl WeightsBank for DeviceWeightsBank {
    fn get(&self, closure: &Tensor, device: &str) -> Tensor {
        if !self.copy_devices.contains(device) {
            return closure.clone();
        }
        let key = (closure.storage_id(), device.to_string());
        let mut cache = self.cache.lock().expect("bank cache lock poisoned");
        if let Some(t) = cache.get(&key) {
            return t.clone();
        }
        tracing::debug!(
            "weights bank: materialising {} tensor on '{device}'",
            closure.shape(),
        );
        let copy = Tensor::zeros(closure.shape().clone(), closure.dtype());
        closure.copy_to(&copy);
        cache.insert(key, copy.clone());
        copy
    }
}
