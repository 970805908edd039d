// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Distributed name server.
//!
//! Maps textual names to small values (typically queue ids or shared-region
//! pointers). Each processor keeps local tables; lookups consult the local
//! table first and then walk the registered remote drivers, one per peer,
//! stopping at the first answer that is not `NotFound`.
//!
//! All table mutations run under the module mutex. Remote queries run
//! without holding it, so a slow peer never blocks local adds.

use std::sync::{Arc, Mutex, Weak};

use abi::{IpcError, IpcResult, ProcId};
use serde::{Deserialize, Serialize};

use crate::multiproc::MultiProc;

/// Capability interface of a remote name-server driver.
///
/// One implementation is registered per peer. `timeout_ms == 0` is a probe:
/// the driver must answer immediately (typically `NotFound`) rather than
/// waiting on its request/response protocol.
pub trait NameServerRemote: Send + Sync {
    fn get(
        &self,
        instance: &str,
        name: &str,
        value: &mut [u8],
        timeout_ms: u32,
    ) -> IpcResult<u32>;
}

/// Instance creation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NameServerParams {
    /// Bounded table size, or `None` to grow on demand.
    pub max_runtime_entries: Option<u32>,
    /// Longest accepted name, terminator included.
    pub max_name_len: usize,
    /// Widest accepted value. Values of at most 4 bytes are stored inline.
    pub max_value_len: usize,
    /// Reject duplicate names on `add`.
    pub check_existing: bool,
}

impl Default for NameServerParams {
    fn default() -> Self {
        Self {
            max_runtime_entries: None,
            max_name_len: 16,
            max_value_len: 4,
            check_existing: true,
        }
    }
}

/// Key returned by `add`, usable with `remove_entry`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NsKey(u32);

#[derive(Clone, Debug)]
enum Value {
    Inline(u32),
    Buf(Vec<u8>),
}

#[derive(Debug)]
struct TableEntry {
    name: String,
    value: Value,
    len: u32,
    key: u32,
}

#[derive(Debug)]
struct Table {
    entries: Vec<Option<TableEntry>>,
    free: Vec<usize>,
    next_key: u32,
}

struct ModuleState {
    instances: Vec<Arc<NameServerInst>>,
    remote: Vec<Option<Arc<dyn NameServerRemote>>>,
}

/// Module context: instance registry plus the per-peer driver table.
pub struct NameServerModule {
    multiproc: Arc<MultiProc>,
    state: Mutex<ModuleState>,
}

impl NameServerModule {
    pub fn setup(multiproc: Arc<MultiProc>) -> Arc<Self> {
        let n = usize::from(multiproc.num_processors());
        Arc::new(Self {
            multiproc,
            state: Mutex::new(ModuleState {
                instances: Vec::new(),
                remote: vec![None; n],
            }),
        })
    }

    pub fn multiproc(&self) -> &Arc<MultiProc> {
        &self.multiproc
    }

    /// Creates a named instance. Instance names are unique per module.
    pub fn create(
        self: &Arc<Self>,
        name: &str,
        params: NameServerParams,
    ) -> IpcResult<Arc<NameServerInst>> {
        if name.is_empty()
            || params.max_name_len == 0
            || params.max_value_len == 0
        {
            return Err(IpcError::InvalidArg);
        }
        let mut st = self.state.lock().unwrap();
        if st.instances.iter().any(|i| i.name == name) {
            return Err(IpcError::AlreadyExists);
        }
        let (entries, free) = match params.max_runtime_entries {
            Some(n) => {
                let n = n as usize;
                let mut entries = Vec::with_capacity(n);
                entries.resize_with(n, || None);
                (entries, (0..n).rev().collect())
            }
            None => (Vec::new(), Vec::new()),
        };
        let inst = Arc::new(NameServerInst {
            name: name.to_owned(),
            params,
            module: Arc::downgrade(self),
            table: Mutex::new(Table {
                entries,
                free,
                next_key: 0,
            }),
        });
        st.instances.push(inst.clone());
        Ok(inst)
    }

    /// Removes an instance from the registry; outstanding handles keep the
    /// local table alive but it is no longer discoverable.
    pub fn delete(&self, inst: &Arc<NameServerInst>) -> IpcResult<()> {
        let mut st = self.state.lock().unwrap();
        let before = st.instances.len();
        st.instances.retain(|i| !Arc::ptr_eq(i, inst));
        if st.instances.len() == before {
            return Err(IpcError::NotFound);
        }
        Ok(())
    }

    /// Finds an instance by name.
    pub fn get_handle(&self, name: &str) -> Option<Arc<NameServerInst>> {
        let st = self.state.lock().unwrap();
        st.instances.iter().find(|i| i.name == name).cloned()
    }

    /// Registers the remote driver for `proc_id`. Exactly one per peer.
    pub fn register_remote_driver(
        &self,
        driver: Arc<dyn NameServerRemote>,
        proc_id: ProcId,
    ) -> IpcResult<()> {
        if !self.multiproc.is_valid(proc_id) {
            return Err(IpcError::InvalidProcId);
        }
        let mut st = self.state.lock().unwrap();
        let slot = &mut st.remote[proc_id.index()];
        if slot.is_some() {
            return Err(IpcError::AlreadyExists);
        }
        *slot = Some(driver);
        Ok(())
    }

    pub fn unregister_remote_driver(&self, proc_id: ProcId) -> IpcResult<()> {
        if !self.multiproc.is_valid(proc_id) {
            return Err(IpcError::InvalidProcId);
        }
        let mut st = self.state.lock().unwrap();
        if st.remote[proc_id.index()].take().is_none() {
            return Err(IpcError::NotFound);
        }
        Ok(())
    }

    fn remote_for(&self, proc_id: ProcId) -> Option<Arc<dyn NameServerRemote>> {
        let st = self.state.lock().unwrap();
        st.remote.get(proc_id.index()).and_then(Clone::clone)
    }
}

/// One name table.
pub struct NameServerInst {
    name: String,
    params: NameServerParams,
    module: Weak<NameServerModule>,
    table: Mutex<Table>,
}

impl NameServerInst {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds `name -> value`. Fails `AlreadyExists` when `check_existing` is
    /// set and the name is present, `MaxReached` when a bounded table is
    /// full, `InvalidArg` when the name or value exceeds the configured
    /// limits.
    pub fn add(&self, name: &str, value: &[u8]) -> IpcResult<NsKey> {
        if value.len() > self.params.max_value_len
            || name.is_empty()
            || name.len() >= self.params.max_name_len
        {
            return Err(IpcError::InvalidArg);
        }

        let mut table = self.table.lock().unwrap();
        if self.params.check_existing && find(&table, name).is_some() {
            return Err(IpcError::AlreadyExists);
        }

        let stored = if self.params.max_value_len <= 4 {
            let mut word = [0u8; 4];
            word[..value.len()].copy_from_slice(value);
            Value::Inline(u32::from_le_bytes(word))
        } else {
            Value::Buf(value.to_vec())
        };

        let key = table.next_key;
        table.next_key = table.next_key.wrapping_add(1);
        let entry = TableEntry {
            name: name.to_owned(),
            value: stored,
            len: value.len() as u32,
            key,
        };

        if self.params.max_runtime_entries.is_some() {
            let Some(slot) = table.free.pop() else {
                return Err(IpcError::MaxReached);
            };
            table.entries[slot] = Some(entry);
        } else {
            table.entries.push(Some(entry));
        }
        Ok(NsKey(key))
    }

    pub fn add_u32(&self, name: &str, value: u32) -> IpcResult<NsKey> {
        self.add(name, &value.to_le_bytes())
    }

    /// Local-table-only lookup. Returns the stored length.
    pub fn get_local(&self, name: &str, value: &mut [u8]) -> IpcResult<u32> {
        let table = self.table.lock().unwrap();
        let Some(idx) = find(&table, name) else {
            return Err(IpcError::NotFound);
        };
        let entry = table.entries[idx].as_ref().ok_or(IpcError::Fail)?;
        match &entry.value {
            Value::Inline(word) => {
                let len = (entry.len as usize).min(4);
                if value.len() < len {
                    return Err(IpcError::InvalidArg);
                }
                value[..len].copy_from_slice(&word.to_le_bytes()[..len]);
            }
            Value::Buf(buf) => {
                if value.len() < buf.len() {
                    return Err(IpcError::InvalidArg);
                }
                value[..buf.len()].copy_from_slice(buf);
            }
        }
        Ok(entry.len)
    }

    pub fn get_local_u32(&self, name: &str) -> IpcResult<u32> {
        let mut buf = [0u8; 4];
        self.get_local(name, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Timeout handed to remote drivers by [`NameServerInst::get`]: a
    /// zero-timeout probe. `get` is not a blocking point; a slow or
    /// unresponsive peer must not stall the scan past it.
    const REMOTE_PROBE_TIMEOUT_MS: u32 = 0;

    /// Distributed lookup.
    ///
    /// With `proc_ids == None`, the local table is consulted first and then
    /// every peer with a registered driver. With an explicit list, the
    /// entries are tried in order (the local processor may appear anywhere
    /// in it). The search continues past a peer only on `NotFound`.
    ///
    /// Remote peers are queried with a zero-timeout probe, so this never
    /// waits on a driver's request/response protocol.
    pub fn get(
        &self,
        name: &str,
        value: &mut [u8],
        proc_ids: Option<&[ProcId]>,
    ) -> IpcResult<u32> {
        let module = self.module.upgrade().ok_or(IpcError::InvalidState)?;
        let self_id = module.multiproc.self_id();

        match proc_ids {
            None => {
                match self.get_local(name, value) {
                    Err(IpcError::NotFound) => {}
                    other => return other,
                }
                for i in 0..module.multiproc.num_processors() {
                    let peer = ProcId(i);
                    if peer == self_id {
                        continue;
                    }
                    let Some(driver) = module.remote_for(peer) else {
                        continue;
                    };
                    match driver.get(
                        &self.name,
                        name,
                        value,
                        Self::REMOTE_PROBE_TIMEOUT_MS,
                    ) {
                        Err(IpcError::NotFound) => continue,
                        other => return other,
                    }
                }
                Err(IpcError::NotFound)
            }
            Some(list) => {
                for &peer in list {
                    if !peer.is_valid() {
                        break;
                    }
                    let status = if peer == self_id {
                        self.get_local(name, value)
                    } else if let Some(driver) = module.remote_for(peer) {
                        driver.get(
                            &self.name,
                            name,
                            value,
                            Self::REMOTE_PROBE_TIMEOUT_MS,
                        )
                    } else {
                        Err(IpcError::NotFound)
                    };
                    match status {
                        Err(IpcError::NotFound) => continue,
                        other => return other,
                    }
                }
                Err(IpcError::NotFound)
            }
        }
    }

    pub fn get_u32(
        &self,
        name: &str,
        proc_ids: Option<&[ProcId]>,
    ) -> IpcResult<u32> {
        let mut buf = [0u8; 4];
        self.get(name, &mut buf, proc_ids)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Finds the longest stored name that is a prefix of `name`; returns the
    /// match length (0 when nothing matches) and the matched value. Only
    /// supported for u32-valued tables.
    pub fn match_name(&self, name: &str) -> IpcResult<(u32, u32)> {
        if self.params.max_value_len != 4 {
            return Err(IpcError::InvalidArg);
        }
        let table = self.table.lock().unwrap();
        let mut found_len = 0usize;
        let mut found_value = 0u32;
        for entry in table.entries.iter().flatten() {
            let len = entry.name.len();
            if len > found_len && name.starts_with(&entry.name) {
                if let Value::Inline(v) = entry.value {
                    found_len = len;
                    found_value = v;
                }
            }
        }
        Ok((found_len as u32, found_value))
    }

    /// Removes a name/value pair by name.
    pub fn remove(&self, name: &str) -> IpcResult<()> {
        let mut table = self.table.lock().unwrap();
        let Some(idx) = find(&table, name) else {
            return Err(IpcError::NotFound);
        };
        clear_slot(&mut table, idx, self.params.max_runtime_entries.is_some());
        Ok(())
    }

    /// Removes a pair by the key `add` returned.
    pub fn remove_entry(&self, key: NsKey) -> IpcResult<()> {
        let mut table = self.table.lock().unwrap();
        let Some(idx) = table
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.key == key.0))
        else {
            return Err(IpcError::NotFound);
        };
        clear_slot(&mut table, idx, self.params.max_runtime_entries.is_some());
        Ok(())
    }
}

fn find(table: &Table, name: &str) -> Option<usize> {
    table
        .entries
        .iter()
        .position(|e| e.as_ref().is_some_and(|e| e.name == name))
}

fn clear_slot(table: &mut Table, idx: usize, bounded: bool) {
    table.entries[idx] = None;
    if bounded {
        table.free.push(idx);
    } else {
        table.entries.remove(idx);
    }
}
