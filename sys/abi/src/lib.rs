// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared ABI definitions for the IPC runtime.
//!
//! Everything in this crate is either wire-visible (the message header
//! travels between processors exactly as laid out here, little-endian) or
//! shared between the runtime core and the processor-management driver. The
//! types deliberately stay small and `Copy`; modules hold their own state.

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Maximum number of processors an image can be configured with. Processor
/// ids are dense small integers below the configured count.
pub const MAX_PROCESSORS: usize = 16;

/// Identifies one processor in the system.
///
/// The all-ones value is reserved as [`ProcId::INVALID`]; it doubles as the
/// sentinel half of an invalid [`QueueId`].
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct ProcId(pub u16);

impl ProcId {
    pub const INVALID: Self = Self(0xFFFF);

    /// Table index for this id.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Location-independent identifier of a message queue.
///
/// A `QueueId` packs the owning processor id into the upper 16 bits and the
/// per-processor queue index into the lower 16. Senders only ever see this
/// packed form; the transport unpacks it on `put`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct QueueId(pub u32);

impl QueueId {
    /// Sentinel carried in out-parameters after a failed open and written by
    /// close. Either half being `0xFFFF` marks the id invalid.
    pub const INVALID: Self = Self(0xFFFF_FFFF);

    pub const fn new(proc_id: ProcId, queue_index: u16) -> Self {
        Self((proc_id.0 as u32) << 16 | queue_index as u32)
    }

    pub fn proc_id(self) -> ProcId {
        ProcId((self.0 >> 16) as u16)
    }

    pub fn queue_index(self) -> u16 {
        self.0 as u16
    }

    pub fn is_valid(self) -> bool {
        self.proc_id() != ProcId::INVALID
            && self.queue_index() != ProcId::INVALID.0
    }
}

/// Number of bits of an [`SrPtr`] naming the shared region; the rest is the
/// byte offset within the region. Build-wide constant.
pub const REGION_ID_BITS: u32 = 4;

/// Maximum number of shared regions.
pub const MAX_REGIONS: usize = 1 << REGION_ID_BITS;

/// Bits of an [`SrPtr`] carrying the in-region offset.
pub const REGION_OFFSET_BITS: u32 = 32 - REGION_ID_BITS;

const REGION_OFFSET_MASK: u32 = (1 << REGION_OFFSET_BITS) - 1;

/// A shared-region pointer: `(region id, offset)` packed into 32 bits.
///
/// This is the only pointer representation that may be stored in shared
/// memory. Every processor with a mapping for the region can translate it to
/// a local pointer through its own region directory; raw virtual addresses
/// are never exchanged.
#[derive(
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct SrPtr(pub u32);

impl SrPtr {
    /// The null/invalid shared pointer. Also used as the list terminator in
    /// shared free lists.
    pub const INVALID: Self = Self(0xFFFF_FFFF);

    pub const fn new(region_id: u16, offset: u32) -> Self {
        Self((region_id as u32) << REGION_OFFSET_BITS
            | (offset & REGION_OFFSET_MASK))
    }

    pub fn region_id(self) -> u16 {
        (self.0 >> REGION_OFFSET_BITS) as u16
    }

    pub fn offset(self) -> u32 {
        self.0 & REGION_OFFSET_MASK
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// `self` advanced by `delta` bytes within the same region.
    pub fn add(self, delta: u32) -> Self {
        debug_assert!(self.is_valid());
        Self::new(self.region_id(), self.offset() + delta)
    }
}

impl core::fmt::Debug for SrPtr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(f, "SrPtr({}:{:#x})", self.region_id(), self.offset())
        } else {
            write!(f, "SrPtr(INVALID)")
        }
    }
}

/// Message priority, carried in the low two bits of the header flags.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(u16)]
pub enum Priority {
    Normal = 0,
    High = 1,
    Reserved = 2,
    Urgent = 3,
}

/// Mask of the priority bits within `MessageHeader::flags`.
pub const PRIORITY_MASK: u16 = 0x3;

/// Bit within `MessageHeader::flags` marking a traced message.
pub const TRACE_MASK: u16 = 0x1000;
pub const TRACE_SHIFT: u16 = 12;

/// Version stamp folded into `flags` by message initialization.
pub const HEADER_VERSION: u16 = 0x2000;

/// Heap id marking a message whose storage is owned by the caller. The heap
/// registry refuses to free such messages.
pub const STATIC_MSG: u16 = 0xFFFF;

/// Initial value of `msg_id`; applications overwrite it if they care.
pub const INVALID_MSG_ID: u16 = 0xFFFF;

/// The message header, sent verbatim on the wire ahead of the payload.
///
/// All integers are little-endian on every supported core. `reserved0` is
/// zeroed at init time; receivers use it to distinguish queue traffic from
/// name-server traffic sharing the same line. The two reserved words double
/// as list linkage on shared-memory transports and must be zero while a
/// message is not enqueued.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
    Unaligned,
)]
#[repr(C)]
pub struct MessageHeader {
    pub reserved0: U32<LittleEndian>,
    pub reserved1: U32<LittleEndian>,
    /// Total size of the message, header included. Never less than the
    /// header size; rewritten on receive to the actual wire byte count.
    pub msg_size: U32<LittleEndian>,
    /// Low 2 bits: priority. Bit 12: trace. Bits 13..: header version.
    pub flags: U16<LittleEndian>,
    pub msg_id: U16<LittleEndian>,
    pub dst_id: U16<LittleEndian>,
    pub dst_proc: U16<LittleEndian>,
    pub reply_id: U16<LittleEndian>,
    pub reply_proc: U16<LittleEndian>,
    pub src_proc: U16<LittleEndian>,
    pub heap_id: U16<LittleEndian>,
    /// Monotonic per-process sequence number, assigned under the module
    /// lock at init time.
    pub seq_num: U16<LittleEndian>,
    pub reserved: U16<LittleEndian>,
}

/// Size of the wire header in bytes.
pub const MSG_HEADER_SIZE: usize = core::mem::size_of::<MessageHeader>();

const_assert_eq!(MSG_HEADER_SIZE, 32);

impl MessageHeader {
    pub fn priority(&self) -> Priority {
        match self.flags.get() & PRIORITY_MASK {
            0 => Priority::Normal,
            1 => Priority::High,
            2 => Priority::Reserved,
            _ => Priority::Urgent,
        }
    }

    pub fn set_priority(&mut self, pri: Priority) {
        let flags = self.flags.get() & !PRIORITY_MASK;
        self.flags.set(flags | pri as u16);
    }

    pub fn trace_enabled(&self) -> bool {
        self.flags.get() & TRACE_MASK != 0
    }

    pub fn set_trace(&mut self, on: bool) {
        let flags = self.flags.get() & !TRACE_MASK;
        self.flags.set(flags | (u16::from(on) << TRACE_SHIFT));
    }
}

/// The closed set of error kinds surfaced by the runtime.
///
/// The numeric values are stable so that status codes can cross process and
/// language boundaries; `FromPrimitive` gives the reverse mapping.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum IpcError {
    AlreadySetup = 1,
    Fail = 2,
    InvalidArg = 3,
    Memory = 4,
    AlreadyExists = 5,
    NotFound = 6,
    Timeout = 7,
    InvalidState = 8,
    OsFailure = 9,
    Resource = 10,
    Restart = 11,
    InvalidMsg = 12,
    NotOwner = 13,
    RemoteActive = 14,
    InvalidHeapId = 15,
    InvalidProcId = 16,
    MaxReached = 17,
    UnregisteredHeapId = 18,
    CannotFreeStaticMsg = 19,
    /// A blocked `get` was woken by `unblock`; no message is returned.
    Unblocked = 20,
    ReservedEvent = 21,
    MmuConfig = 22,
    StoreEntry = 23,
    /// Exact-match allocation policy rejected the request.
    ExactFail = 24,
    /// The matching fixed-block bucket has no free blocks.
    NoBlocksLeft = 25,
}

impl IpcError {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl core::fmt::Display for IpcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for IpcError {}

/// Result alias used throughout the runtime.
pub type IpcResult<T> = Result<T, IpcError>;

/// How `attach` brings a co-processor up.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum BootMode {
    /// Host powers, loads, and starts the processor.
    Boot = 0,
    /// Firmware is already resident; host only starts the processor.
    NoLoad = 1,
    /// Processor is already running; host just attaches.
    NoBoot = 2,
}

/// Observable life-cycle states of a co-processor.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromPrimitive, Serialize, Deserialize,
)]
#[repr(u32)]
pub enum ProcState {
    Unknown = 0,
    Powered = 1,
    Reset = 2,
    Loaded = 3,
    Running = 4,
    Suspended = 5,
    MmuFault = 6,
    Error = 7,
    Watchdog = 8,
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;
    use zerocopy::{FromBytes as _, FromZeros as _, IntoBytes as _};

    #[test]
    fn queue_id_packing() {
        let q = QueueId::new(ProcId(2), 7);
        assert_eq!(q.0, 0x0002_0007);
        assert_eq!(q.proc_id(), ProcId(2));
        assert_eq!(q.queue_index(), 7);
        assert!(q.is_valid());
        assert!(!QueueId::INVALID.is_valid());
        assert_eq!(QueueId::INVALID.proc_id(), ProcId::INVALID);
    }

    #[test]
    fn srptr_packing() {
        let p = SrPtr::new(3, 0x40);
        assert_eq!(p.region_id(), 3);
        assert_eq!(p.offset(), 0x40);
        assert_eq!(p.add(0x20).offset(), 0x60);
        assert!(!SrPtr::INVALID.is_valid());
    }

    #[test]
    fn header_layout_is_wire_stable() {
        let mut hdr = MessageHeader::new_zeroed();
        hdr.msg_size.set(64);
        hdr.msg_id.set(0x1234);
        hdr.seq_num.set(3);

        let bytes = hdr.as_bytes();
        assert_eq!(bytes.len(), 32);
        // msg_size sits at offset 8, little-endian.
        assert_eq!(&bytes[8..12], &[64, 0, 0, 0]);
        // msg_id at offset 14.
        assert_eq!(&bytes[14..16], &[0x34, 0x12]);

        let back = MessageHeader::read_from_bytes(bytes).unwrap();
        assert_eq!(back, hdr);
    }

    #[test]
    fn flags_accessors() {
        let mut hdr = MessageHeader::new_zeroed();
        hdr.flags.set(HEADER_VERSION);
        hdr.set_priority(Priority::Urgent);
        assert_eq!(hdr.priority(), Priority::Urgent);
        assert!(!hdr.trace_enabled());
        hdr.set_trace(true);
        assert!(hdr.trace_enabled());
        assert_eq!(hdr.flags.get() & TRACE_MASK, TRACE_MASK);
        hdr.set_trace(false);
        assert!(!hdr.trace_enabled());
        // Version bits survive flag churn.
        assert_eq!(hdr.flags.get() & HEADER_VERSION, HEADER_VERSION);
    }

    #[test]
    fn error_codes_round_trip() {
        for code in 1..=25u32 {
            let e = IpcError::from_u32(code).unwrap();
            assert_eq!(e.code(), code);
        }
        assert!(IpcError::from_u32(0).is_none());
        assert!(IpcError::from_u32(26).is_none());
    }
}
