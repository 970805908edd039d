// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-processor gate.
//!
//! A `GateMp` serializes access to one shared-memory object across every
//! processor and thread in the system: at most one holder at a time,
//! system-wide. The shared containers enter the gate around every read or
//! mutation of shared state; together with the region cache discipline this
//! yields single-writer-release / multi-reader-acquire semantics.
//!
//! The gate is deliberately not re-entrant. Entering a gate you already hold
//! blocks, exactly like the plain mutex gate it models; the containers are
//! written so they never do.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

#[derive(Debug, Default)]
struct GateState {
    holder: Option<ThreadId>,
    /// Bumped on every successful enter; the key handed back must match at
    /// leave, catching out-of-order leave in debug builds.
    epoch: u32,
}

/// Key returned by [`GateMp::enter`], surrendered to [`GateMp::leave`].
#[derive(Debug)]
#[must_use = "a gate key must be returned via leave()"]
pub struct GateKey(u32);

#[derive(Debug)]
pub struct GateMp {
    state: Mutex<GateState>,
    cv: Condvar,
    name: Option<String>,
}

impl GateMp {
    pub fn new(name: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
            name: name.map(str::to_owned),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Acquires the gate, blocking while any holder (including this thread)
    /// has it.
    pub fn enter(&self) -> GateKey {
        let mut st = self.state.lock().unwrap();
        while st.holder.is_some() {
            st = self.cv.wait(st).unwrap();
        }
        st.holder = Some(std::thread::current().id());
        st.epoch = st.epoch.wrapping_add(1);
        GateKey(st.epoch)
    }

    /// Releases the gate.
    pub fn leave(&self, key: GateKey) {
        let mut st = self.state.lock().unwrap();
        debug_assert_eq!(st.holder, Some(std::thread::current().id()));
        debug_assert_eq!(st.epoch, key.0);
        st.holder = None;
        drop(st);
        self.cv.notify_one();
    }
}
