// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote-procedure-call service demultiplexer.
//!
//! One channel publishes a named endpoint. Peers send management messages
//! to it: instance creation and teardown, channel information queries, and
//! function-signature queries. Function *calls* never pass through the
//! channel; each created service instance gets its own endpoint from the
//! service manager, and callers talk to that.
//!
//! Wire format: every message is a little-endian [`MsgHeader`] followed by
//! `msg_len` bytes of typed payload. Replies reuse the sender's scratch
//! shape; the reply length is the header plus the reply payload.

use std::sync::Arc;

use abi::{IpcError, IpcResult, ProcId};
use ipc::nameserver::NameServerInst;
use ipc::transport::{Datagram, Fabric, RxEndpoint, UnblockEvent, WaitSet};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use ringbuf::{ringbuf, ringbuf_entry};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

/// Longest channel name, terminator included.
pub const MAX_CHANNEL_NAMELEN: usize = 64;
/// Longest function name, terminator included.
pub const MAX_FUNC_NAMELEN: usize = 64;
/// Parameters a function signature can describe (`params[0]` is the
/// return value).
pub const MAX_NUM_PARAMS: usize = 10;
/// Longest instance name in a create request, terminator included.
pub const MAX_INST_NAMELEN: usize = 48;

/// Scratch buffer size for one management message.
pub const MSG_BUFFER_SIZE: usize = 512;

/// Message types the host may send the service (and the replies it gets
/// back). The numbering is historic wire ABI; do not renumber.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum MsgType {
    QueryChanInfo = 0,
    ChanInfo = 1,
    QueryFunction = 2,
    FunctionInfo = 3,
    DestroyInstance = 4,
    CallFunction = 5,
    CreateInstance = 6,
    InstanceDestroyed = 7,
    InstanceCreated = 8,
    FunctionReturn = 9,
    Error = 10,
}

/// Subtype tag of a [`QueryFunction`] request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum InfoType {
    FuncSignature = 1,
    NumCalls = 2,
    FuncPerformance = 3,
}

/// Error codes carried by an [`ErrorReply`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum RpcErrorType {
    None = 0,
    NotEnoughMemory = 1,
    InstanceDied = 2,
    ResourceUnavailable = 3,
    BadParameter = 4,
    NotSupported = 5,
}

/// The generic message header.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct MsgHeader {
    pub msg_type: U32<LittleEndian>,
    /// Length of the payload following the header, in bytes.
    pub msg_len: U32<LittleEndian>,
}

pub const MSG_HEADER_SIZE: usize = core::mem::size_of::<MsgHeader>();

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct CreateInstance {
    pub name: [u8; MAX_INST_NAMELEN],
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct InstanceHandle {
    pub endpoint_address: U32<LittleEndian>,
    pub status: U32<LittleEndian>,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ChannelInfo {
    pub num_funcs: U32<LittleEndian>,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ErrorReply {
    pub endpoint_address: U32<LittleEndian>,
    pub status: U32<LittleEndian>,
}

/// Direction of one described parameter, relative to the function.
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
#[repr(u32)]
pub enum Direction {
    In = 0,
    Out = 1,
    Bi = 2,
}

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct ParamSignature {
    pub direction: U32<LittleEndian>,
    pub param_type: U32<LittleEndian>,
    /// Basic array-bound sanity checking on pointer parameters.
    pub count: U32<LittleEndian>,
}

/// A function's published signature. `params[0]` describes the return
/// value.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct FuncSignature {
    pub name: [u8; MAX_FUNC_NAMELEN],
    pub num_param: U32<LittleEndian>,
    pub params: [ParamSignature; MAX_NUM_PARAMS + 1],
}

impl FuncSignature {
    pub fn named(name: &str) -> Self {
        let mut sig = Self::new_zeroed();
        let n = name.len().min(MAX_FUNC_NAMELEN - 1);
        sig.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        sig
    }
}

/// The information union of a [`QueryFunction`] exchange, sized by its
/// largest member (the signature).
pub const FUNC_INFO_SIZE: usize = core::mem::size_of::<FuncSignature>();

#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct QueryFunction {
    pub info_type: U32<LittleEndian>,
    pub func_index: U32<LittleEndian>,
    pub info: [u8; FUNC_INFO_SIZE],
}

/// Handler bound behind a function index on a service instance.
pub type RpcFunction = Arc<dyn Fn(&[u8]) -> i32 + Send + Sync>;

/// One published function: the handler plus its wire signature.
#[derive(Clone)]
pub struct FuncDeclaration {
    pub func: RpcFunction,
    pub signature: FuncSignature,
}

/// Factory and reaper for per-client service instances.
pub trait ServiceManager: Send + Sync {
    /// Creates an instance of the named service; returns its endpoint
    /// address, or a non-zero status on failure.
    fn create_service(&self, name: &str) -> Result<u32, u32>;
    /// Destroys the instance behind `endpoint`; returns the status.
    fn delete_service(&self, endpoint: u32) -> u32;
}

/// Channel creation parameters.
pub struct ChannelParams {
    pub channel_name: String,
    /// The peer processor this channel serves.
    pub dst_proc: ProcId,
    /// Port the channel's endpoint binds.
    pub port: u16,
    pub service_mgr: Arc<dyn ServiceManager>,
    /// Published functions; the fixed bootstrap entry is prepended.
    pub funcs: Vec<FuncDeclaration>,
    /// Invoked when a peer asks to destroy an instance.
    pub srv_del_notify: Option<Arc<dyn Fn() + Send + Sync>>,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Received { msg_type: u32, len: u32 },
    Created { status: u32, endpoint: u32 },
    Destroyed { endpoint: u32 },
    Unsupported { msg_type: u32 },
    ReplyDropped,
    Shutdown,
}

ringbuf!(Trace, 64, Trace::None);

/// A live RPC channel.
pub struct OmapRpc {
    fabric: Arc<Fabric>,
    self_proc: ProcId,
    port: u16,
    rx: RxEndpoint,
    ws: WaitSet,
    unblock: UnblockEvent,
    mgr: Arc<dyn ServiceManager>,
    funcs: Vec<FuncDeclaration>,
    srv_del_notify: Option<Arc<dyn Fn() + Send + Sync>>,
    name_reg: Option<(Arc<NameServerInst>, String)>,
}

/// The fixed bootstrap function occupying index 0 of every channel.
fn get_svr_mgr_handle(_args: &[u8]) -> i32 {
    0
}

impl OmapRpc {
    /// Creates a channel: binds the endpoint, optionally publishes the
    /// channel name -> port mapping, and installs the function table.
    pub fn create_channel(
        fabric: &Arc<Fabric>,
        self_proc: ProcId,
        params: ChannelParams,
        name_server: Option<&Arc<NameServerInst>>,
    ) -> IpcResult<Self> {
        if params.channel_name.len() >= MAX_CHANNEL_NAMELEN {
            return Err(IpcError::InvalidArg);
        }
        let rx = fabric.bind(self_proc, params.port, params.dst_proc)?;
        let ws = WaitSet::new();
        rx.attach_waiter(&ws);
        let unblock = UnblockEvent::new();
        unblock.attach_waiter(&ws);

        let name_reg = match name_server {
            Some(ns) => {
                ns.add_u32(&params.channel_name, u32::from(params.port))?;
                Some((ns.clone(), params.channel_name.clone()))
            }
            None => None,
        };

        let mut funcs = Vec::with_capacity(params.funcs.len() + 1);
        funcs.push(FuncDeclaration {
            func: Arc::new(get_svr_mgr_handle),
            signature: FuncSignature::named("GetSvrMgrHandle"),
        });
        funcs.extend(params.funcs);

        Ok(Self {
            fabric: fabric.clone(),
            self_proc,
            port: params.port,
            rx,
            ws,
            unblock,
            mgr: params.service_mgr,
            funcs,
            srv_del_notify: params.srv_del_notify,
            name_reg,
        })
    }

    pub fn num_funcs(&self) -> u32 {
        self.funcs.len() as u32
    }

    /// The handler installed at `index`, for instance servers dispatching
    /// `CallFunction` packets.
    pub fn func(&self, index: u32) -> Option<&FuncDeclaration> {
        self.funcs.get(index as usize)
    }

    /// Serves management messages until [`Self::shutdown`] is called.
    pub fn run(&self) {
        loop {
            enum Ev {
                Stop,
                Msg(Datagram),
            }
            let ev = self.ws.wait(None, || {
                if self.unblock.try_take() {
                    return Some(Ev::Stop);
                }
                self.rx.try_recv().map(Ev::Msg)
            });
            match ev {
                Some(Ev::Stop) | None => {
                    ringbuf_entry!(Trace::Shutdown);
                    return;
                }
                Some(Ev::Msg(dg)) => {
                    let reply = self.process(&dg.payload);
                    if self
                        .fabric
                        .send_to(
                            (dg.from_proc, dg.from_port),
                            (self.self_proc, self.port),
                            &reply,
                        )
                        .is_err()
                    {
                        ringbuf_entry!(Trace::ReplyDropped);
                    }
                }
            }
        }
    }

    /// Wakes [`Self::run`] out of its receive wait.
    pub fn shutdown(&self) {
        self.unblock.post();
    }

    /// Unpublishes the channel name and releases the endpoint.
    pub fn delete_channel(self) {
        if let Some((ns, name)) = &self.name_reg {
            let _ = ns.remove(name);
        }
    }

    /// Handles one management message, producing the reply datagram
    /// (header plus payload).
    pub fn process(&self, payload: &[u8]) -> Vec<u8> {
        let Ok((hdr, body)) = MsgHeader::ref_from_prefix(payload) else {
            return self.error_reply(RpcErrorType::BadParameter);
        };
        ringbuf_entry!(Trace::Received {
            msg_type: hdr.msg_type.get(),
            len: hdr.msg_len.get(),
        });

        match MsgType::from_u32(hdr.msg_type.get()) {
            Some(MsgType::CreateInstance) => {
                let Ok((create, _)) = CreateInstance::ref_from_prefix(body)
                else {
                    return self.error_reply(RpcErrorType::BadParameter);
                };
                let name = cstr_field(&create.name);
                let mut handle = InstanceHandle::new_zeroed();
                match self.mgr.create_service(name) {
                    Ok(endpoint) => {
                        handle.endpoint_address.set(endpoint);
                        handle.status.set(0);
                    }
                    Err(status) => handle.status.set(status),
                }
                ringbuf_entry!(Trace::Created {
                    status: handle.status.get(),
                    endpoint: handle.endpoint_address.get(),
                });
                reply(MsgType::InstanceCreated, handle.as_bytes())
            }
            Some(MsgType::DestroyInstance) => {
                let Ok((req, _)) = InstanceHandle::ref_from_prefix(body)
                else {
                    return self.error_reply(RpcErrorType::BadParameter);
                };
                if let Some(cb) = &self.srv_del_notify {
                    cb();
                }
                let endpoint = req.endpoint_address.get();
                let mut handle = InstanceHandle::new_zeroed();
                // The endpoint address is left alone in the reply.
                handle.endpoint_address.set(endpoint);
                handle.status.set(self.mgr.delete_service(endpoint));
                ringbuf_entry!(Trace::Destroyed { endpoint });
                reply(MsgType::InstanceDestroyed, handle.as_bytes())
            }
            Some(MsgType::QueryChanInfo) => {
                let mut info = ChannelInfo::new_zeroed();
                info.num_funcs.set(self.num_funcs());
                reply(MsgType::ChanInfo, info.as_bytes())
            }
            Some(MsgType::QueryFunction) => {
                let Ok((req, _)) = QueryFunction::ref_from_prefix(body)
                else {
                    return self.error_reply(RpcErrorType::BadParameter);
                };
                let mut out = *req;
                out.info = [0; FUNC_INFO_SIZE];
                match InfoType::from_u32(req.info_type.get()) {
                    Some(InfoType::FuncSignature) => {
                        if let Some(decl) =
                            self.funcs.get(req.func_index.get() as usize)
                        {
                            out.info.copy_from_slice(
                                decl.signature.as_bytes(),
                            );
                        }
                    }
                    // Counters are not maintained on this channel; the
                    // reply carries zeroes of the right shape.
                    Some(InfoType::NumCalls)
                    | Some(InfoType::FuncPerformance)
                    | None => {}
                }
                reply(MsgType::FunctionInfo, out.as_bytes())
            }
            _ => {
                ringbuf_entry!(Trace::Unsupported {
                    msg_type: hdr.msg_type.get()
                });
                self.error_reply(RpcErrorType::NotSupported)
            }
        }
    }

    fn error_reply(&self, status: RpcErrorType) -> Vec<u8> {
        let mut err = ErrorReply::new_zeroed();
        err.endpoint_address.set(u32::from(self.port));
        err.status.set(status as u32);
        reply(MsgType::Error, err.as_bytes())
    }
}

/// Builds a reply datagram: header stamped with `msg_type` and the
/// payload's length, then the payload.
fn reply(msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
    let mut hdr = MsgHeader::new_zeroed();
    hdr.msg_type.set(msg_type as u32);
    hdr.msg_len.set(payload.len() as u32);
    let mut out = Vec::with_capacity(MSG_HEADER_SIZE + payload.len());
    out.extend_from_slice(hdr.as_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a fixed-size NUL-padded name field.
fn cstr_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    core::str::from_utf8(&field[..end]).unwrap_or("")
}

/// Builds a management request datagram; the client-side counterpart of
/// [`OmapRpc::process`], used by hosts and tests.
pub fn request(msg_type: MsgType, payload: &[u8]) -> Vec<u8> {
    reply(msg_type, payload)
}
