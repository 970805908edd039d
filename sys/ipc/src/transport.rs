// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Endpoint transport.
//!
//! An endpoint is an addressable `(processor, port)` pair; that identity is
//! the entire visible surface. The platform's socket family is an
//! implementation detail behind the [`Fabric`], which routes datagrams
//! between the processors registered on it, preserving FIFO order within
//! each `(sender, receiver)` pair.
//!
//! Receive endpoints are bound per `(owner, port, peer)` -- one per remote
//! processor for a given queue index. Send endpoints are established once
//! per peer at attach time by connecting to the peer's rendezvous port;
//! data is then addressed per queue index.
//!
//! [`WaitSet`] provides the readiness-union wait a blocking `get` needs:
//! one waiter parked on any number of receive endpoints plus the unblock
//! side-channel, with zero, finite, or forever timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use abi::{IpcError, IpcResult, ProcId};

/// Port peers connect to when establishing their send endpoint toward a
/// processor.
pub const RENDEZVOUS_PORT: u16 = 61;

/// Largest datagram the transport carries.
pub const MAX_MSG_SIZE: usize = 512;

/// One received datagram, with the sender's endpoint address.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub from_proc: ProcId,
    pub from_port: u16,
    pub payload: Vec<u8>,
}

struct WaitCore {
    m: Mutex<()>,
    cv: Condvar,
}

/// A readiness wait over producer-notified sources.
///
/// Sources (endpoint queues, unblock events) are attached once; each data
/// arrival nudges the set. [`WaitSet::wait`] re-runs the caller's readiness
/// check under the set's lock, so a producer can never slip between the
/// check and the park.
pub struct WaitSet {
    core: Arc<WaitCore>,
}

#[derive(Clone)]
pub(crate) struct WaitHandle(Arc<WaitCore>);

impl WaitHandle {
    fn notify(&self) {
        // Taking the lock orders the notify after any in-progress check.
        let _g = self.0.m.lock().unwrap();
        self.0.cv.notify_all();
    }
}

impl Default for WaitSet {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitSet {
    pub fn new() -> Self {
        Self {
            core: Arc::new(WaitCore {
                m: Mutex::new(()),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn handle(&self) -> WaitHandle {
        WaitHandle(self.core.clone())
    }

    /// Runs `check` until it yields a value or the timeout lapses. `None`
    /// timeout waits forever; a zero timeout polls (one final re-check at
    /// expiry, so a racing producer is still observed).
    pub fn wait<R>(
        &self,
        timeout: Option<Duration>,
        mut check: impl FnMut() -> Option<R>,
    ) -> Option<R> {
        let mut guard = self.core.m.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(r) = check() {
                return Some(r);
            }
            match deadline {
                None => {
                    guard = self.core.cv.wait(guard).unwrap();
                }
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return check();
                    }
                    let (g, _timed_out) = self
                        .core
                        .cv
                        .wait_timeout(guard, dl - now)
                        .unwrap();
                    guard = g;
                }
            }
        }
    }
}

/// The unblock side-channel: one posted token wakes exactly one wait,
/// whether or not data is pending.
pub struct UnblockEvent {
    tokens: Mutex<u32>,
    waiter: Mutex<Option<WaitHandle>>,
}

impl Default for UnblockEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl UnblockEvent {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(0),
            waiter: Mutex::new(None),
        }
    }

    pub fn attach_waiter(&self, ws: &WaitSet) {
        *self.waiter.lock().unwrap() = Some(ws.handle());
    }

    /// Posts one wake token.
    pub fn post(&self) {
        *self.tokens.lock().unwrap() += 1;
        let waiter = self.waiter.lock().unwrap().clone();
        if let Some(w) = waiter {
            w.notify();
        }
    }

    /// Consumes one token if any is pending.
    pub fn try_take(&self) -> bool {
        let mut t = self.tokens.lock().unwrap();
        if *t > 0 {
            *t -= 1;
            true
        } else {
            false
        }
    }
}

struct EndpointQueue {
    q: Mutex<VecDeque<Datagram>>,
    waiter: Mutex<Option<WaitHandle>>,
}

impl EndpointQueue {
    fn push(&self, dg: Datagram) {
        self.q.lock().unwrap().push_back(dg);
        let waiter = self.waiter.lock().unwrap().clone();
        if let Some(w) = waiter {
            w.notify();
        }
    }
}

type BindingKey = (u16, u16, u16); // (owner proc, port, peer proc)

struct FabricState {
    procs: Vec<ProcId>,
    bindings: HashMap<BindingKey, Arc<EndpointQueue>>,
}

/// The in-process datagram fabric connecting every processor context in a
/// test or simulation image.
pub struct Fabric {
    state: Mutex<FabricState>,
}

impl Fabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FabricState {
                procs: Vec::new(),
                bindings: HashMap::new(),
            }),
        })
    }

    /// Announces a processor on the fabric; connects to it succeed from
    /// now on.
    pub fn register_proc(&self, proc_id: ProcId) {
        let mut st = self.state.lock().unwrap();
        if !st.procs.contains(&proc_id) {
            st.procs.push(proc_id);
        }
    }

    pub fn unregister_proc(&self, proc_id: ProcId) {
        let mut st = self.state.lock().unwrap();
        st.procs.retain(|p| *p != proc_id);
    }

    /// Establishes a send endpoint from `src` toward `dst`, connecting at
    /// `port` (normally [`RENDEZVOUS_PORT`]). Fails `Resource` when the
    /// peer has not announced itself.
    pub fn connect(
        self: &Arc<Self>,
        src: ProcId,
        dst: ProcId,
        port: u16,
    ) -> IpcResult<TxEndpoint> {
        let st = self.state.lock().unwrap();
        if !st.procs.contains(&dst) {
            return Err(IpcError::Resource);
        }
        drop(st);
        Ok(TxEndpoint {
            fabric: self.clone(),
            src,
            src_port: port,
            dst,
        })
    }

    /// Binds the receive endpoint for `(owner, port)` toward one `peer`.
    pub fn bind(
        self: &Arc<Self>,
        owner: ProcId,
        port: u16,
        peer: ProcId,
    ) -> IpcResult<RxEndpoint> {
        let key = (owner.0, port, peer.0);
        let mut st = self.state.lock().unwrap();
        if st.bindings.contains_key(&key) {
            return Err(IpcError::AlreadyExists);
        }
        let q = Arc::new(EndpointQueue {
            q: Mutex::new(VecDeque::new()),
            waiter: Mutex::new(None),
        });
        st.bindings.insert(key, q.clone());
        Ok(RxEndpoint {
            fabric: self.clone(),
            key,
            queue: q,
        })
    }

    /// Routes one datagram. The destination must have a receive endpoint
    /// bound for this sender.
    pub fn send_to(
        &self,
        dst: (ProcId, u16),
        from: (ProcId, u16),
        payload: &[u8],
    ) -> IpcResult<()> {
        if payload.len() > MAX_MSG_SIZE {
            return Err(IpcError::InvalidArg);
        }
        let q = {
            let st = self.state.lock().unwrap();
            st.bindings
                .get(&(dst.0 .0, dst.1, from.0 .0))
                .cloned()
                .ok_or(IpcError::Fail)?
        };
        q.push(Datagram {
            from_proc: from.0,
            from_port: from.1,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn unbind(&self, key: BindingKey) {
        let mut st = self.state.lock().unwrap();
        st.bindings.remove(&key);
    }
}

/// Send endpoint established by [`Fabric::connect`].
pub struct TxEndpoint {
    fabric: Arc<Fabric>,
    src: ProcId,
    src_port: u16,
    dst: ProcId,
}

impl TxEndpoint {
    pub fn dst(&self) -> ProcId {
        self.dst
    }

    /// Writes one datagram to `(dst, dst_port)`.
    pub fn send(&self, dst_port: u16, payload: &[u8]) -> IpcResult<()> {
        self.fabric.send_to(
            (self.dst, dst_port),
            (self.src, self.src_port),
            payload,
        )
    }
}

/// Receive endpoint bound by [`Fabric::bind`]; unbinds on drop.
pub struct RxEndpoint {
    fabric: Arc<Fabric>,
    key: BindingKey,
    queue: Arc<EndpointQueue>,
}

impl RxEndpoint {
    pub fn attach_waiter(&self, ws: &WaitSet) {
        *self.queue.waiter.lock().unwrap() = Some(ws.handle());
    }

    pub fn has_data(&self) -> bool {
        !self.queue.q.lock().unwrap().is_empty()
    }

    pub fn try_recv(&self) -> Option<Datagram> {
        self.queue.q.lock().unwrap().pop_front()
    }
}

impl Drop for RxEndpoint {
    fn drop(&mut self) {
        self.fabric.unbind(self.key);
    }
}
