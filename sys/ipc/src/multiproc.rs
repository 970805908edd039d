// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processor name/id registry.
//!
//! Configured once at setup and immutable afterwards, so lookups need no
//! locking. The local processor's identity, the system-wide name table, and
//! the cluster base all come from configuration.

use std::sync::Arc;

use abi::{IpcError, IpcResult, ProcId, MAX_PROCESSORS};
use serde::{Deserialize, Serialize};

/// Configuration for the registry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiProcConfig {
    /// Processor names, indexed by processor id.
    pub names: Vec<String>,
    /// The local processor's id; must index `names`.
    pub self_id: ProcId,
    /// First processor id belonging to the local cluster. Cluster ids are
    /// processor ids re-based to this value; modules that keep per-peer
    /// tables (NameServer, Notify) size them by the cluster.
    pub base_cluster_id: u16,
}

/// The processor registry.
#[derive(Debug)]
pub struct MultiProc {
    names: Vec<String>,
    self_id: ProcId,
    base_cluster_id: u16,
}

impl MultiProc {
    pub fn setup(config: MultiProcConfig) -> IpcResult<Arc<Self>> {
        if config.names.is_empty() || config.names.len() > MAX_PROCESSORS {
            return Err(IpcError::InvalidArg);
        }
        if config.self_id.index() >= config.names.len() {
            return Err(IpcError::InvalidProcId);
        }
        if usize::from(config.base_cluster_id) > config.self_id.index() {
            return Err(IpcError::InvalidArg);
        }
        Ok(Arc::new(Self {
            names: config.names,
            self_id: config.self_id,
            base_cluster_id: config.base_cluster_id,
        }))
    }

    /// The local processor's id.
    pub fn self_id(&self) -> ProcId {
        self.self_id
    }

    pub fn num_processors(&self) -> u16 {
        self.names.len() as u16
    }

    pub fn get_id(&self, name: &str) -> IpcResult<ProcId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| ProcId(i as u16))
            .ok_or(IpcError::NotFound)
    }

    pub fn get_name(&self, id: ProcId) -> IpcResult<&str> {
        self.names
            .get(id.index())
            .map(String::as_str)
            .ok_or(IpcError::InvalidProcId)
    }

    /// Re-bases a processor id into the local cluster's dense index space.
    pub fn cluster_id(&self, id: ProcId) -> IpcResult<u16> {
        if id.index() >= self.names.len() || id.0 < self.base_cluster_id {
            return Err(IpcError::InvalidProcId);
        }
        Ok(id.0 - self.base_cluster_id)
    }

    /// Number of processors in the local cluster.
    pub fn num_procs_in_cluster(&self) -> u16 {
        self.num_processors() - self.base_cluster_id
    }

    /// True when `id` names a configured processor.
    pub fn is_valid(&self, id: ProcId) -> bool {
        id.index() < self.names.len()
    }
}
