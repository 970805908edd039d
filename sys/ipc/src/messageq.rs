// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Named message queues over the endpoint transport.
//!
//! A queue is created by its reader, who receives a location-independent
//! 32-bit [`QueueId`]; writers look the id up by name and `put` to it from
//! any processor. Messages move by copy: `put` serializes the message
//! through the per-peer send endpoint established at `attach` time and
//! releases the sender's buffer.
//!
//! `get` is the one blocking point of the API. It waits on the union of
//! the queue's per-peer receive endpoints and a private unblock event;
//! `unblock` posts a token that wakes exactly one `get` with `Unblocked`,
//! deliberately leaving any pending messages undrained (the shutdown path
//! wants to ignore them).
//!
//! The per-peer send endpoint table is written only under the module's
//! writer lock (attach/detach); the `put` path reads it with the shared
//! lock and relies on a slot being either absent or valid until the
//! matching detach.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use abi::{
    IpcError, IpcResult, MessageHeader, Priority, ProcId, QueueId,
    HEADER_VERSION, INVALID_MSG_ID, MSG_HEADER_SIZE, STATIC_MSG,
};
use ringbuf::{ringbuf, ringbuf_entry};
use serde::{Deserialize, Serialize};
use zerocopy::FromBytes;

use crate::multiproc::MultiProc;
use crate::nameserver::{
    NameServerInst, NameServerModule, NameServerParams,
};
use crate::transport::{
    Fabric, RxEndpoint, TxEndpoint, UnblockEvent, WaitSet, RENDEZVOUS_PORT,
};

/// Timeout value meaning "wait forever".
pub const FOREVER: u32 = u32::MAX;

/// An owned message: the 32-byte wire header followed by payload, in one
/// buffer. Created through [`MessageQModule::alloc`] or
/// [`MessageQModule::static_msg_init`]; consumed by `put` or `free`.
pub struct Message {
    buf: Vec<u8>,
}

impl Message {
    fn from_buf(buf: Vec<u8>) -> IpcResult<Self> {
        if buf.len() < MSG_HEADER_SIZE {
            return Err(IpcError::InvalidArg);
        }
        Ok(Self { buf })
    }

    /// Rebuilds a message from received bytes: the size field is trimmed
    /// to the wire byte count, and a static-message heap id is rewritten
    /// so the receiver can free through the registry.
    fn from_wire(payload: Vec<u8>) -> IpcResult<Self> {
        let len = payload.len();
        if len < MSG_HEADER_SIZE {
            return Err(IpcError::InvalidMsg);
        }
        let mut msg = Self { buf: payload };
        let hdr = msg.header_mut();
        hdr.msg_size.set(len as u32);
        if hdr.heap_id.get() == STATIC_MSG {
            hdr.heap_id.set(0);
        }
        Ok(msg)
    }

    pub fn header(&self) -> &MessageHeader {
        MessageHeader::ref_from_prefix(&self.buf)
            .map(|(h, _)| h)
            .expect("message buffer shorter than header")
    }

    pub fn header_mut(&mut self) -> &mut MessageHeader {
        MessageHeader::mut_from_prefix(&mut self.buf)
            .map(|(h, _)| h)
            .expect("message buffer shorter than header")
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[MSG_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[MSG_HEADER_SIZE..]
    }

    pub fn msg_size(&self) -> u32 {
        self.header().msg_size.get()
    }

    pub fn msg_id(&self) -> u16 {
        self.header().msg_id.get()
    }

    pub fn set_msg_id(&mut self, id: u16) {
        self.header_mut().msg_id.set(id);
    }

    pub fn heap_id(&self) -> u16 {
        self.header().heap_id.get()
    }

    pub fn src_proc(&self) -> ProcId {
        ProcId(self.header().src_proc.get())
    }

    pub fn seq_num(&self) -> u16 {
        self.header().seq_num.get()
    }

    pub fn priority(&self) -> Priority {
        self.header().priority()
    }

    pub fn set_priority(&mut self, pri: Priority) {
        self.header_mut().set_priority(pri);
    }

    /// The queue a reply should go to, as stamped by
    /// [`MessageQ::set_reply_queue`] on the other side.
    pub fn reply_queue(&self) -> QueueId {
        let hdr = self.header();
        if hdr.reply_id.get() == ProcId::INVALID.0 {
            QueueId::INVALID
        } else {
            QueueId::new(ProcId(hdr.reply_proc.get()), hdr.reply_id.get())
        }
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("msg_id", &self.msg_id())
            .field("msg_size", &self.msg_size())
            .field("seq_num", &self.seq_num())
            .field("src_proc", &self.src_proc())
            .field("heap_id", &self.heap_id())
            .finish()
    }
}

/// Pluggable allocator behind a MessageQ heap id.
pub trait MessageHeap: Send + Sync {
    fn alloc(&self, size: usize) -> IpcResult<Vec<u8>>;
    fn free(&self, buf: Vec<u8>);
}

/// Process-heap allocator installed at heap id 0, matching the copy
/// transport's convention that id 0 is always usable.
struct ProcessHeap;

impl MessageHeap for ProcessHeap {
    fn alloc(&self, size: usize) -> IpcResult<Vec<u8>> {
        Ok(vec![0; size])
    }
    fn free(&self, buf: Vec<u8>) {
        drop(buf);
    }
}

/// Module configuration.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MessageQConfig {
    /// Size of the heap-id table.
    pub num_heaps: u16,
    /// Upper bound on simultaneously existing local queues.
    pub max_queues: u16,
}

impl Default for MessageQConfig {
    fn default() -> Self {
        Self {
            num_heaps: 8,
            max_queues: 64,
        }
    }
}

/// Instance creation parameters.
#[derive(Copy, Clone, Debug, Default, Serialize, Deserialize)]
pub struct MessageQParams {
    /// Request a specific queue index instead of the first free one.
    pub queue_index: Option<u16>,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Create { index: u16 },
    Delete { index: u16 },
    Attach { proc: u16 },
    Detach { proc: u16 },
    Put { dst_proc: u16, dst_index: u16 },
    PutFail { dst_proc: u16 },
    Got { seq: u16 },
    Unblocked,
    TimedOut,
}

ringbuf!(Trace, 64, Trace::None);

struct ModState {
    seq_num: u16,
    queues: Vec<bool>,
    heaps: Vec<Option<Arc<dyn MessageHeap>>>,
}

/// Module context: send-endpoint table, sequence counter, heap registry,
/// and the reserved name table.
pub struct MessageQModule {
    multiproc: Arc<MultiProc>,
    fabric: Arc<Fabric>,
    ns_module: Arc<NameServerModule>,
    ns: Arc<NameServerInst>,
    state: Mutex<ModState>,
    sock: RwLock<Vec<Option<Arc<TxEndpoint>>>>,
}

impl MessageQModule {
    /// Name of the reserved NameServer instance queue names live in.
    pub const NAMESERVER: &'static str = "MessageQ";

    pub fn setup(
        multiproc: Arc<MultiProc>,
        ns_module: &Arc<NameServerModule>,
        fabric: Arc<Fabric>,
        config: MessageQConfig,
    ) -> IpcResult<Arc<Self>> {
        if config.num_heaps == 0 || config.max_queues == 0 {
            return Err(IpcError::InvalidArg);
        }
        let ns = ns_module.create(
            Self::NAMESERVER,
            NameServerParams {
                max_value_len: 4,
                max_name_len: 32,
                ..Default::default()
            },
        )?;
        fabric.register_proc(multiproc.self_id());

        let mut heaps: Vec<Option<Arc<dyn MessageHeap>>> =
            vec![None; usize::from(config.num_heaps)];
        heaps[0] = Some(Arc::new(ProcessHeap));

        let n = usize::from(multiproc.num_processors());
        Ok(Arc::new(Self {
            multiproc,
            fabric,
            ns_module: ns_module.clone(),
            ns,
            state: Mutex::new(ModState {
                seq_num: 0,
                queues: vec![false; usize::from(config.max_queues)],
                heaps,
            }),
            sock: RwLock::new(vec![None; n]),
        }))
    }

    /// Tears the module down: withdraws the reserved name table and the
    /// fabric announcement. Queues and attachments must be gone already.
    pub fn destroy(self: Arc<Self>) -> IpcResult<()> {
        self.ns_module.delete(&self.ns)?;
        self.fabric.unregister_proc(self.multiproc.self_id());
        Ok(())
    }

    pub fn multiproc(&self) -> &Arc<MultiProc> {
        &self.multiproc
    }

    /// Establishes the send endpoint toward `remote_proc`. At most one per
    /// peer; a second attach reports `AlreadyExists`. A connect failure
    /// surfaces as `Resource` with nothing retained.
    pub fn attach(&self, remote_proc: ProcId) -> IpcResult<()> {
        if !self.multiproc.is_valid(remote_proc) {
            return Err(IpcError::InvalidProcId);
        }
        let mut sock = self.sock.write().unwrap();
        if sock[remote_proc.index()].is_some() {
            return Err(IpcError::AlreadyExists);
        }
        match self.fabric.connect(
            self.multiproc.self_id(),
            remote_proc,
            RENDEZVOUS_PORT,
        ) {
            Ok(tx) => {
                sock[remote_proc.index()] = Some(Arc::new(tx));
                ringbuf_entry!(Trace::Attach {
                    proc: remote_proc.0
                });
                Ok(())
            }
            Err(_) => Err(IpcError::Resource),
        }
    }

    /// Closes the send endpoint toward `remote_proc`.
    pub fn detach(&self, remote_proc: ProcId) -> IpcResult<()> {
        if !self.multiproc.is_valid(remote_proc) {
            return Err(IpcError::InvalidProcId);
        }
        let mut sock = self.sock.write().unwrap();
        sock[remote_proc.index()] = None;
        ringbuf_entry!(Trace::Detach {
            proc: remote_proc.0
        });
        Ok(())
    }

    /// Installs `heap` at `heap_id` for use by [`Self::alloc`].
    pub fn register_heap(
        &self,
        heap: Arc<dyn MessageHeap>,
        heap_id: u16,
    ) -> IpcResult<()> {
        let mut st = self.state.lock().unwrap();
        let slot = st
            .heaps
            .get_mut(usize::from(heap_id))
            .ok_or(IpcError::InvalidHeapId)?;
        if slot.is_some() {
            return Err(IpcError::AlreadyExists);
        }
        *slot = Some(heap);
        Ok(())
    }

    pub fn unregister_heap(&self, heap_id: u16) -> IpcResult<()> {
        let mut st = self.state.lock().unwrap();
        let slot = st
            .heaps
            .get_mut(usize::from(heap_id))
            .ok_or(IpcError::InvalidHeapId)?;
        if slot.take().is_none() {
            return Err(IpcError::UnregisteredHeapId);
        }
        Ok(())
    }

    /// Allocates and initializes a message of `size` bytes (header
    /// included) from the heap at `heap_id`.
    pub fn alloc(&self, heap_id: u16, size: u32) -> IpcResult<Message> {
        if heap_id == STATIC_MSG {
            return Err(IpcError::InvalidHeapId);
        }
        if (size as usize) < MSG_HEADER_SIZE {
            return Err(IpcError::InvalidArg);
        }
        let heap = {
            let st = self.state.lock().unwrap();
            st.heaps
                .get(usize::from(heap_id))
                .ok_or(IpcError::InvalidHeapId)?
                .clone()
                .ok_or(IpcError::UnregisteredHeapId)?
        };
        let mut msg = Message::from_buf(heap.alloc(size as usize)?)?;
        self.msg_init(&mut msg);
        let hdr = msg.header_mut();
        hdr.msg_size.set(size);
        hdr.heap_id.set(heap_id);
        Ok(msg)
    }

    /// Initializes caller-supplied storage as a message. The static heap
    /// id makes the registry refuse to free it.
    pub fn static_msg_init(&self, buf: Vec<u8>) -> IpcResult<Message> {
        let size = buf.len() as u32;
        let mut msg = Message::from_buf(buf)?;
        self.msg_init(&mut msg);
        let hdr = msg.header_mut();
        hdr.msg_size.set(size);
        hdr.heap_id.set(STATIC_MSG);
        Ok(msg)
    }

    /// Returns a message to the heap it came from.
    pub fn free(&self, msg: Message) -> IpcResult<()> {
        let heap_id = msg.heap_id();
        if heap_id == STATIC_MSG {
            return Err(IpcError::CannotFreeStaticMsg);
        }
        let heap = {
            let st = self.state.lock().unwrap();
            st.heaps
                .get(usize::from(heap_id))
                .ok_or(IpcError::InvalidHeapId)?
                .clone()
                .ok_or(IpcError::UnregisteredHeapId)?
        };
        heap.free(msg.buf);
        Ok(())
    }

    /// Stamps the fields every fresh message carries. `reserved0` is
    /// cleared to distinguish queue traffic from name-server traffic on
    /// the same line; the sequence number is taken under the module lock.
    fn msg_init(&self, msg: &mut Message) {
        let seq = {
            let mut st = self.state.lock().unwrap();
            let s = st.seq_num;
            st.seq_num = st.seq_num.wrapping_add(1);
            s
        };
        let self_id = self.multiproc.self_id();
        let hdr = msg.header_mut();
        hdr.reserved0.set(0);
        hdr.reserved1.set(0);
        hdr.flags.set(HEADER_VERSION | Priority::Normal as u16);
        hdr.msg_id.set(INVALID_MSG_ID);
        hdr.dst_id.set(ProcId::INVALID.0);
        hdr.dst_proc.set(ProcId::INVALID.0);
        hdr.reply_id.set(ProcId::INVALID.0);
        hdr.reply_proc.set(ProcId::INVALID.0);
        hdr.src_proc.set(self_id.0);
        hdr.seq_num.set(seq);
        hdr.reserved.set(0);
    }

    /// Creates a receive queue, optionally named.
    pub fn create(
        self: &Arc<Self>,
        name: Option<&str>,
        params: &MessageQParams,
    ) -> IpcResult<MessageQ> {
        let self_id = self.multiproc.self_id();

        // Reserve a queue index.
        let index = {
            let mut st = self.state.lock().unwrap();
            let index = match params.queue_index {
                Some(i) => {
                    let slot = st
                        .queues
                        .get(usize::from(i))
                        .ok_or(IpcError::InvalidArg)?;
                    if *slot {
                        return Err(IpcError::AlreadyExists);
                    }
                    i
                }
                None => st
                    .queues
                    .iter()
                    .position(|used| !used)
                    .ok_or(IpcError::MaxReached)?
                    as u16,
            };
            st.queues[usize::from(index)] = true;
            index
        };
        let queue = QueueId::new(self_id, index);

        let undo_index = |st: &Arc<Self>| {
            st.state.lock().unwrap().queues[usize::from(index)] = false;
        };

        // Publish the name before opening endpoints so a racing open sees
        // either nothing or a fully usable queue index.
        if let Some(name) = name {
            if let Err(e) = self.ns.add_u32(name, queue.0) {
                undo_index(self);
                return Err(e);
            }
        }

        // One receive endpoint per remote processor. Individual failures
        // are tolerated; a queue nobody can reach is rolled back whole.
        let n = usize::from(self.multiproc.num_processors());
        let mut rx: Vec<Option<RxEndpoint>> = Vec::with_capacity(n);
        for p in 0..n as u16 {
            let peer = ProcId(p);
            if peer == self_id {
                rx.push(None);
                continue;
            }
            rx.push(self.fabric.bind(self_id, index, peer).ok());
        }
        if rx.iter().all(Option::is_none) {
            if let Some(name) = name {
                let _ = self.ns.remove(name);
            }
            undo_index(self);
            return Err(IpcError::Fail);
        }

        let ws = WaitSet::new();
        for ep in rx.iter().flatten() {
            ep.attach_waiter(&ws);
        }
        let unblock = UnblockEvent::new();
        unblock.attach_waiter(&ws);

        ringbuf_entry!(Trace::Create { index });
        Ok(MessageQ {
            module: self.clone(),
            queue,
            name: name.map(str::to_owned),
            rx,
            unblock,
            ws,
        })
    }

    /// Resolves a queue name to its id, consulting local then remote name
    /// tables.
    pub fn open(&self, name: &str) -> IpcResult<QueueId> {
        match self.ns.get_u32(name, None) {
            Ok(v) => Ok(QueueId(v)),
            Err(IpcError::NotFound) => Err(IpcError::NotFound),
            Err(IpcError::Timeout) => Err(IpcError::Timeout),
            Err(_) => Err(IpcError::Fail),
        }
    }

    /// Invalidates an opened queue id. Nothing else to release on the
    /// copy transport.
    pub fn close(&self, queue_id: &mut QueueId) {
        *queue_id = QueueId::INVALID;
    }

    /// Sends `msg` to the queue named by `queue_id`. The message is
    /// consumed: on a copy transport the sender's buffer is released as
    /// part of the put.
    pub fn put(&self, queue_id: QueueId, mut msg: Message) -> IpcResult<()> {
        if !queue_id.is_valid() {
            return Err(IpcError::InvalidArg);
        }
        let dst_proc = queue_id.proc_id();
        let dst_index = queue_id.queue_index();
        if !self.multiproc.is_valid(dst_proc) {
            return Err(IpcError::InvalidProcId);
        }

        {
            let hdr = msg.header_mut();
            hdr.dst_id.set(dst_index);
            hdr.dst_proc.set(dst_proc.0);
        }

        // Lock-free against attach/detach holding the writer side: a slot
        // is either absent or valid until detached.
        let tx = {
            let sock = self.sock.read().unwrap();
            sock[dst_proc.index()].clone()
        };
        let Some(tx) = tx else {
            ringbuf_entry!(Trace::PutFail {
                dst_proc: dst_proc.0
            });
            return Err(IpcError::Fail);
        };

        let len = (msg.msg_size() as usize).min(msg.buf.len());
        let status = tx.send(dst_index, &msg.buf[..len]);

        // Copy transport: the sender's buffer is done either way.
        let _ = self.free(msg);

        match status {
            Ok(()) => {
                ringbuf_entry!(Trace::Put {
                    dst_proc: dst_proc.0,
                    dst_index,
                });
                Ok(())
            }
            Err(_) => {
                ringbuf_entry!(Trace::PutFail {
                    dst_proc: dst_proc.0
                });
                Err(IpcError::Fail)
            }
        }
    }

    /// Enables or disables tracing of one message.
    pub fn set_msg_trace(&self, msg: &mut Message, on: bool) {
        msg.header_mut().set_trace(on);
    }

    /// Shared memory required per transport instance: none, this is a
    /// copy transport.
    pub fn shared_mem_req(&self, _shared_addr: usize) -> usize {
        0
    }
}

/// A receive queue. Owned by the reader that created it.
pub struct MessageQ {
    module: Arc<MessageQModule>,
    queue: QueueId,
    name: Option<String>,
    /// Per-peer receive endpoints, indexed by processor id; `None` for
    /// self and for peers whose bind failed.
    rx: Vec<Option<RxEndpoint>>,
    unblock: UnblockEvent,
    ws: WaitSet,
}

enum GetEvent {
    Unblocked,
    Wire(Vec<u8>),
}

impl MessageQ {
    pub fn queue_id(&self) -> QueueId {
        self.queue
    }

    /// Blocks until a message arrives, the queue is unblocked, or the
    /// timeout lapses.
    ///
    /// `timeout` is in milliseconds; 0 polls, [`FOREVER`] never times
    /// out. An unblock wakes exactly one `get` with `Unblocked` and does
    /// not drain pending messages.
    pub fn get(&self, timeout: u32) -> IpcResult<Message> {
        let duration = match timeout {
            FOREVER => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        };

        let event = self.ws.wait(duration, || {
            if self.unblock.try_take() {
                return Some(GetEvent::Unblocked);
            }
            for ep in self.rx.iter().flatten() {
                if let Some(dg) = ep.try_recv() {
                    return Some(GetEvent::Wire(dg.payload));
                }
            }
            None
        });

        match event {
            None => {
                ringbuf_entry!(Trace::TimedOut);
                Err(IpcError::Timeout)
            }
            Some(GetEvent::Unblocked) => {
                ringbuf_entry!(Trace::Unblocked);
                Err(IpcError::Unblocked)
            }
            Some(GetEvent::Wire(payload)) => {
                let msg = Message::from_wire(payload)?;
                ringbuf_entry!(Trace::Got {
                    seq: msg.seq_num()
                });
                Ok(msg)
            }
        }
    }

    /// Count of queued messages.
    ///
    /// Unimplemented on this transport and kept only for interface
    /// parity; always returns -1.
    pub fn count(&self) -> i32 {
        -1
    }

    /// Wakes one blocked [`Self::get`] with `Unblocked`. Pending messages
    /// stay queued.
    pub fn unblock(&self) {
        self.unblock.post();
    }

    /// Stamps this queue into `msg` as the reply destination.
    pub fn set_reply_queue(&self, msg: &mut Message) {
        let hdr = msg.header_mut();
        hdr.reply_id.set(self.queue.queue_index());
        hdr.reply_proc.set(self.queue.proc_id().0);
    }

    /// Deletes the queue. Pending messages are dropped with the receive
    /// endpoints; the name, if any, is withdrawn.
    pub fn delete(self) -> IpcResult<()> {
        if let Some(name) = &self.name {
            let _ = self.module.ns.remove(name);
        }
        let index = self.queue.queue_index();
        self.module.state.lock().unwrap().queues[usize::from(index)] =
            false;
        ringbuf_entry!(Trace::Delete { index });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiproc::MultiProcConfig;

    fn host_module() -> Arc<MessageQModule> {
        let mp = MultiProc::setup(MultiProcConfig {
            names: vec!["HOST".into(), "IPU".into()],
            self_id: ProcId(0),
            base_cluster_id: 0,
        })
        .unwrap();
        let ns = NameServerModule::setup(mp.clone());
        let fabric = Fabric::new();
        fabric.register_proc(ProcId(1));
        MessageQModule::setup(mp, &ns, fabric, Default::default()).unwrap()
    }

    #[test]
    fn alloc_initializes_header() {
        let module = host_module();
        let msg = module.alloc(0, 64).unwrap();
        let hdr = msg.header();
        assert_eq!(hdr.reserved0.get(), 0);
        assert_eq!(hdr.msg_size.get(), 64);
        assert_eq!(hdr.msg_id.get(), INVALID_MSG_ID);
        assert_eq!(hdr.src_proc.get(), 0);
        assert_eq!(hdr.heap_id.get(), 0);
        assert_eq!(hdr.flags.get() & HEADER_VERSION, HEADER_VERSION);
        assert_eq!(msg.priority(), Priority::Normal);

        let msg2 = module.alloc(0, 64).unwrap();
        assert_eq!(msg2.seq_num(), msg.seq_num().wrapping_add(1));
    }

    #[test]
    fn alloc_rejects_bad_heaps() {
        let module = host_module();
        assert_eq!(
            module.alloc(STATIC_MSG, 64).err(),
            Some(IpcError::InvalidHeapId)
        );
        assert_eq!(
            module.alloc(500, 64).err(),
            Some(IpcError::InvalidHeapId)
        );
        assert_eq!(
            module.alloc(3, 64).err(),
            Some(IpcError::UnregisteredHeapId)
        );
        assert_eq!(module.alloc(0, 8).err(), Some(IpcError::InvalidArg));
    }

    #[test]
    fn static_messages_refuse_free() {
        let module = host_module();
        let msg = module.static_msg_init(vec![0; 64]).unwrap();
        assert_eq!(msg.heap_id(), STATIC_MSG);
        assert_eq!(
            module.free(msg).err(),
            Some(IpcError::CannotFreeStaticMsg)
        );
    }

    #[test]
    fn heap_registry() {
        let module = host_module();
        struct CountingHeap(std::sync::atomic::AtomicUsize);
        impl MessageHeap for CountingHeap {
            fn alloc(&self, size: usize) -> IpcResult<Vec<u8>> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(vec![0; size])
            }
            fn free(&self, _buf: Vec<u8>) {}
        }
        let heap = Arc::new(CountingHeap(Default::default()));
        module.register_heap(heap.clone(), 3).unwrap();
        assert_eq!(
            module
                .register_heap(heap.clone(), 3)
                .err(),
            Some(IpcError::AlreadyExists)
        );
        let msg = module.alloc(3, 64).unwrap();
        assert_eq!(msg.heap_id(), 3);
        assert_eq!(heap.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        module.free(msg).unwrap();
        module.unregister_heap(3).unwrap();
        assert_eq!(
            module.unregister_heap(3).err(),
            Some(IpcError::UnregisteredHeapId)
        );
    }

    #[test]
    fn attach_is_single_shot() {
        let module = host_module();
        module.attach(ProcId(1)).unwrap();
        assert_eq!(
            module.attach(ProcId(1)).err(),
            Some(IpcError::AlreadyExists)
        );
        module.detach(ProcId(1)).unwrap();
        module.attach(ProcId(1)).unwrap();
        assert_eq!(
            module.attach(ProcId(9)).err(),
            Some(IpcError::InvalidProcId)
        );
    }

    #[test]
    fn attach_to_absent_peer_is_resource() {
        let mp = MultiProc::setup(MultiProcConfig {
            names: vec!["HOST".into(), "IPU".into()],
            self_id: ProcId(0),
            base_cluster_id: 0,
        })
        .unwrap();
        let ns = NameServerModule::setup(mp.clone());
        let fabric = Fabric::new();
        let module =
            MessageQModule::setup(mp, &ns, fabric, Default::default())
                .unwrap();
        assert_eq!(
            module.attach(ProcId(1)).err(),
            Some(IpcError::Resource)
        );
    }

    #[test]
    fn create_open_delete() {
        let module = host_module();
        let q = module.create(Some("Q0"), &Default::default()).unwrap();
        assert_eq!(module.open("Q0").unwrap(), q.queue_id());
        assert_eq!(module.open("Qx").err(), Some(IpcError::NotFound));

        let mut id = q.queue_id();
        module.close(&mut id);
        assert_eq!(id, QueueId::INVALID);

        q.delete().unwrap();
        assert_eq!(module.open("Q0").err(), Some(IpcError::NotFound));
    }

    #[test]
    fn create_honors_requested_index() {
        let module = host_module();
        let q = module
            .create(
                None,
                &MessageQParams {
                    queue_index: Some(7),
                },
            )
            .unwrap();
        assert_eq!(q.queue_id().queue_index(), 7);
        assert_eq!(
            module
                .create(
                    None,
                    &MessageQParams {
                        queue_index: Some(7),
                    },
                )
                .err(),
            Some(IpcError::AlreadyExists)
        );
        q.delete().unwrap();
    }

    #[test]
    fn zero_timeout_get_reports_timeout() {
        let module = host_module();
        let q = module.create(Some("Q0"), &Default::default()).unwrap();
        match q.get(0) {
            Err(IpcError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
        assert_eq!(q.count(), -1);
        q.delete().unwrap();
    }

    #[test]
    fn unblock_wakes_without_draining() {
        let module = host_module();
        let q = Arc::new(
            module.create(Some("Q0"), &Default::default()).unwrap(),
        );
        let q2 = q.clone();
        let waiter = std::thread::spawn(move || q2.get(FOREVER));
        std::thread::sleep(Duration::from_millis(30));
        q.unblock();
        assert_eq!(waiter.join().unwrap().err(), Some(IpcError::Unblocked));
        // The token is consumed; a later poll sees an ordinary timeout.
        assert_eq!(q.get(0).err(), Some(IpcError::Timeout));
    }

    #[test]
    fn put_without_attach_fails() {
        let module = host_module();
        let msg = module.alloc(0, 64).unwrap();
        assert_eq!(
            module.put(QueueId::new(ProcId(1), 0), msg).err(),
            Some(IpcError::Fail)
        );
        let msg = module.alloc(0, 64).unwrap();
        assert_eq!(
            module.put(QueueId::INVALID, msg).err(),
            Some(IpcError::InvalidArg)
        );
    }
}
