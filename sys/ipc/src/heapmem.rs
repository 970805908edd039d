// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-processor first-fit heap over one shared buffer.
//!
//! The heap works exclusively with memory and blocks whose address and size
//! are multiples of the minimum alignment (`max(header size, region cache
//! line)`). Maintaining that requirement throughout means there are never
//! odd alignments or odd block sizes to deal with:
//!
//! - the managed buffer is aligned to `min_align` and its adjusted size is a
//!   multiple of `min_align`;
//! - every free-list block is aligned to `min_align` and sized a multiple of
//!   `min_align`;
//! - every allocated block likewise.
//!
//! The free list is singly linked in address order through shared-region
//! pointers; a sentinel head lives in the attrs record. Every operation
//! enters the instance gate, and every shared header touch goes through the
//! region directory's load/store helpers so cache maintenance happens in
//! one place.

use std::mem::{offset_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;

use abi::{IpcError, IpcResult, SrPtr};
use serde::{Deserialize, Serialize};

use crate::gate::GateMp;
use crate::nameserver::{NameServerInst, NameServerModule, NameServerParams, NsKey};
use crate::sharedregion::SharedRegionDir;

/// Status word published in shared memory by the creator.
const HEAPMEM_CREATED: u32 = 0x0525_1995;

/// Free-block header. Every free block begins with one; `next` points at
/// the next free block in address order or is invalid at the tail.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct HeapHeader {
    next: SrPtr,
    size: u32,
}

/// Shared attrs record placed at the instance's shared address.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct HeapAttrs {
    status: u32,
    buf: SrPtr,
    buf_size: u32,
    /// Sentinel head of the free list; `size` is unused and stays 0.
    head: HeapHeader,
}

/// Creation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeapMemMpParams {
    pub name: Option<String>,
    pub region_id: u16,
    /// Place the instance at this shared address instead of carving it from
    /// the region heap.
    pub shared_addr: Option<SrPtr>,
    /// Size of the managed buffer, before alignment adjustment.
    pub shared_buf_size: u32,
}

impl Default for HeapMemMpParams {
    fn default() -> Self {
        Self {
            name: None,
            region_id: 0,
            shared_addr: None,
            shared_buf_size: 0,
        }
    }
}

/// Heap statistics reported by [`HeapMemMp::get_stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub total_size: u32,
    pub total_free_size: u32,
    pub largest_free_size: u32,
}

/// Memory carved from a region heap on behalf of a container instance,
/// returned at delete time.
pub(crate) struct OwnedBlock {
    pub heap: Arc<HeapMemMp>,
    pub addr: NonNull<u8>,
    pub size: u32,
}

// Safety: the block is exclusively owned by the container holding it; the
// pointer stays valid for the region's lifetime.
unsafe impl Send for OwnedBlock {}
unsafe impl Sync for OwnedBlock {}

/// A first-fit shared heap instance (creator or opener).
pub struct HeapMemMp {
    dir: Arc<SharedRegionDir>,
    gate: Arc<GateMp>,
    region_id: u16,
    min_align: u32,
    attrs: SrPtr,
    buf: SrPtr,
    buf_size: u32,
    is_creator: bool,
    owned: Option<OwnedBlock>,
    registered: Option<(Arc<NameServerInst>, NsKey)>,
}

impl HeapMemMp {
    /// Minimum alignment for a heap in `region_id`: the larger of the free
    /// header and the region's cache line.
    pub fn min_align_for(
        dir: &SharedRegionDir,
        region_id: u16,
    ) -> IpcResult<u32> {
        let line = dir.get_cache_line_size(region_id)? as u32;
        Ok(line.max(size_of::<HeapHeader>() as u32))
    }

    /// Shared memory needed to create an instance with `params`.
    pub fn shared_mem_req(
        dir: &SharedRegionDir,
        params: &HeapMemMpParams,
    ) -> IpcResult<u32> {
        let min_align = Self::min_align_for(dir, params.region_id)?;
        let attrs = round_up(size_of::<HeapAttrs>() as u32, min_align);
        Ok(attrs + round_down(params.shared_buf_size, min_align))
    }

    /// Creates an instance. Without `shared_addr`, the backing memory is
    /// carved from the region heap (and returned on `delete`).
    pub fn create(
        dir: &Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        params: &HeapMemMpParams,
    ) -> IpcResult<Arc<Self>> {
        if params.shared_buf_size == 0 {
            return Err(IpcError::InvalidArg);
        }
        let min_align = Self::min_align_for(dir, params.region_id)?;
        if round_down(params.shared_buf_size, min_align) == 0 {
            return Err(IpcError::InvalidArg);
        }

        let (attrs_sr, owned) = match params.shared_addr {
            Some(sa) => (sa, None),
            None => {
                let total = Self::shared_mem_req(dir, params)?;
                let region_heap = dir.get_heap(params.region_id)?;
                let addr = region_heap.alloc(total, min_align)?;
                let sa = dir.get_srptr(addr.as_ptr(), params.region_id)?;
                (
                    sa,
                    Some(OwnedBlock {
                        heap: region_heap,
                        addr,
                        size: total,
                    }),
                )
            }
        };

        let mut heap = Self::layout(
            dir.clone(),
            gate,
            params.region_id,
            attrs_sr,
            params.shared_buf_size,
            min_align,
        )?;
        heap.is_creator = true;
        heap.owned = owned;
        heap.post_init()?;
        Ok(Arc::new(heap))
    }

    /// Builds a region-wide heap at offset 0 of `region_id`. Used by the
    /// region directory's `start`.
    pub(crate) fn for_region(
        dir: &Arc<SharedRegionDir>,
        region_id: u16,
    ) -> IpcResult<Arc<Self>> {
        let min_align = Self::min_align_for(dir, region_id)?;
        // The whole region backs the heap; attrs live at its base.
        let region_len = dir.get_region_len(region_id)? as u32;
        let attrs_overhead = round_up(size_of::<HeapAttrs>() as u32, min_align);
        if region_len <= attrs_overhead {
            return Err(IpcError::InvalidArg);
        }
        let mut heap = Self::layout(
            dir.clone(),
            GateMp::new(None),
            region_id,
            SrPtr::new(region_id, 0),
            region_len - attrs_overhead,
            min_align,
        )?;
        heap.is_creator = true;
        heap.post_init()?;
        Ok(Arc::new(heap))
    }

    /// Opens an instance some other processor created at `shared_addr`.
    pub fn open_by_addr(
        dir: &Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        shared_addr: SrPtr,
    ) -> IpcResult<Arc<Self>> {
        let region_id = shared_addr.region_id();
        let min_align = Self::min_align_for(dir, region_id)?;
        let attrs: HeapAttrs = unsafe {
            dir.load_shared(shared_addr).ok_or(IpcError::InvalidArg)?
        };
        if attrs.status != HEAPMEM_CREATED {
            return Err(IpcError::NotFound);
        }
        let heap = Self::layout(
            dir.clone(),
            gate,
            region_id,
            shared_addr,
            attrs.buf_size,
            min_align,
        )?;
        Ok(Arc::new(heap))
    }

    fn layout(
        dir: Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        region_id: u16,
        attrs_sr: SrPtr,
        raw_buf_size: u32,
        min_align: u32,
    ) -> IpcResult<Self> {
        let attrs_ptr =
            dir.get_ptr(attrs_sr).ok_or(IpcError::InvalidArg)?.as_ptr();
        if attrs_ptr as usize % min_align as usize != 0 {
            return Err(IpcError::InvalidArg);
        }
        let buf_off = round_up(size_of::<HeapAttrs>() as u32, min_align);
        let buf = attrs_sr.add(buf_off);
        let buf_size = round_down(raw_buf_size, min_align);
        // The tail of the buffer must still translate.
        if buf_size == 0
            || dir.get_ptr(buf.add(buf_size - 1)).is_none()
        {
            return Err(IpcError::InvalidArg);
        }
        Ok(Self {
            dir,
            gate,
            region_id,
            min_align,
            attrs: attrs_sr,
            buf,
            buf_size,
            is_creator: false,
            owned: None,
            registered: None,
        })
    }

    fn post_init(&self) -> IpcResult<()> {
        // One free block spanning the whole buffer, linked from the head.
        self.store_hdr(
            self.buf,
            HeapHeader {
                next: SrPtr::INVALID,
                size: self.buf_size,
            },
        );
        self.store_attrs(HeapAttrs {
            status: HEAPMEM_CREATED,
            buf: self.buf,
            buf_size: self.buf_size,
            head: HeapHeader {
                next: self.buf,
                size: 0,
            },
        });
        Ok(())
    }

    /// Shared pointer of the free-list sentinel.
    fn head_sr(&self) -> SrPtr {
        self.attrs.add(offset_of!(HeapAttrs, head) as u32)
    }

    fn load_hdr(&self, sr: SrPtr) -> IpcResult<HeapHeader> {
        // Safety: sr names a header inside this heap's region and the
        // caller holds the gate.
        unsafe { self.dir.load_shared(sr) }.ok_or(IpcError::Fail)
    }

    fn store_hdr(&self, sr: SrPtr, h: HeapHeader) {
        // Safety: as in load_hdr, with the gate held for exclusivity.
        let ok = unsafe { self.dir.store_shared(sr, h) };
        debug_assert!(ok, "header store outside region");
    }

    fn store_attrs(&self, a: HeapAttrs) {
        let ok = unsafe { self.dir.store_shared(self.attrs, a) };
        debug_assert!(ok, "attrs store outside region");
    }

    fn local(&self, sr: SrPtr) -> IpcResult<usize> {
        Ok(self.dir.get_ptr(sr).ok_or(IpcError::Fail)?.as_ptr() as usize)
    }

    pub fn min_align(&self) -> u32 {
        self.min_align
    }

    pub fn buf_size(&self) -> u32 {
        self.buf_size
    }

    /// Allocates `size` bytes aligned to `align` (0 means the heap's
    /// minimum). First fit from the head of the free list; a candidate
    /// whose aligned start leaves a front gap keeps the gap as a shrunk
    /// free block, and any back remainder becomes a new free block.
    pub fn alloc(&self, size: u32, align: u32) -> IpcResult<NonNull<u8>> {
        if size == 0 || (align != 0 && !align.is_power_of_two()) {
            return Err(IpcError::InvalidArg);
        }
        let adj_size = round_up(size, self.min_align);
        let adj_align = if align & (self.min_align - 1) != 0 || align == 0 {
            self.min_align
        } else {
            align
        };

        let key = self.gate.enter();
        let result = self.alloc_locked(adj_size, adj_align);
        self.gate.leave(key);
        result.map(|addr| {
            // Safety: the free list never contains address 0.
            unsafe { NonNull::new_unchecked(addr as *mut u8) }
        })
    }

    fn alloc_locked(&self, adj_size: u32, adj_align: u32) -> IpcResult<usize> {
        let mut prev_sr = self.head_sr();
        let mut cur_sr = self.load_hdr(prev_sr)?.next;

        while cur_sr.is_valid() {
            let cur = self.load_hdr(cur_sr)?;
            let cur_local = self.local(cur_sr)?;

            // Front padding needed to honor the alignment request.
            let mut offset = (cur_local as u32) & (adj_align - 1);
            if offset != 0 {
                offset = adj_align - offset;
            }
            debug_assert_eq!(offset & (self.min_align - 1), 0);

            if cur.size >= adj_size + offset {
                let alloc_local = cur_local + offset as usize;
                let remain = cur.size - adj_size - offset;
                debug_assert_eq!(remain & (self.min_align - 1), 0);

                if offset != 0 {
                    // Keep the front gap on the list as a shrunk block.
                    if remain != 0 {
                        let new_sr = cur_sr.add(offset + adj_size);
                        self.store_hdr(
                            new_sr,
                            HeapHeader {
                                next: cur.next,
                                size: remain,
                            },
                        );
                        self.store_hdr(
                            cur_sr,
                            HeapHeader {
                                next: new_sr,
                                size: offset,
                            },
                        );
                    } else {
                        self.store_hdr(
                            cur_sr,
                            HeapHeader {
                                next: cur.next,
                                size: offset,
                            },
                        );
                    }
                } else if remain != 0 {
                    let new_sr = cur_sr.add(adj_size);
                    self.store_hdr(
                        new_sr,
                        HeapHeader {
                            next: cur.next,
                            size: remain,
                        },
                    );
                    let mut prev = self.load_hdr(prev_sr)?;
                    prev.next = new_sr;
                    self.store_hdr(prev_sr, prev);
                } else {
                    let mut prev = self.load_hdr(prev_sr)?;
                    prev.next = cur.next;
                    self.store_hdr(prev_sr, prev);
                }
                return Ok(alloc_local);
            }
            prev_sr = cur_sr;
            cur_sr = cur.next;
        }
        Err(IpcError::Memory)
    }

    /// Returns a block to the heap. The block re-enters the free list in
    /// address order and coalesces with contiguous neighbors on both sides.
    ///
    /// Misuse (misaligned or out-of-range address, overlap with a free
    /// block) violates the heap's invariants and panics.
    pub fn free(&self, addr: NonNull<u8>, size: u32) {
        let size = round_up(size, self.min_align);
        let addr = addr.as_ptr();
        assert_eq!(
            addr as usize % self.min_align as usize,
            0,
            "freed address not minAlign-aligned"
        );
        let new_sr = self
            .dir
            .get_srptr(addr, self.region_id)
            .expect("freed address outside heap region");
        let buf_off = self.buf.offset();
        let new_off = new_sr.offset();
        assert!(
            new_off >= buf_off && new_off + size <= buf_off + self.buf_size,
            "freed block outside heap buffer"
        );

        // Invalidate the whole block so stale lines are never evicted over
        // the rebuilt free list.
        self.dir.inv(self.region_id, addr, size as usize);

        let key = self.gate.enter();

        // Walk to the insertion point: cur < new < next in address order.
        let mut cur_sr = self.head_sr();
        let mut next_sr =
            self.load_hdr(cur_sr).expect("corrupt free list").next;
        while next_sr.is_valid() && next_sr.offset() < new_off {
            let next = self.load_hdr(next_sr).expect("corrupt free list");
            assert!(
                new_off >= next_sr.offset() + next.size,
                "freed block overlaps a free block"
            );
            cur_sr = next_sr;
            next_sr = next.next;
        }

        let mut new_hdr = HeapHeader {
            next: next_sr,
            size,
        };

        // Join with the successor when contiguous, absorbing its header.
        if next_sr.is_valid() {
            assert!(
                new_off + size <= next_sr.offset(),
                "freed block overlaps a free block"
            );
            if new_off + size == next_sr.offset() {
                let next = self.load_hdr(next_sr).expect("corrupt free list");
                new_hdr.next = next.next;
                new_hdr.size += next.size;
            }
        }
        self.store_hdr(new_sr, new_hdr);

        let mut cur = self.load_hdr(cur_sr).expect("corrupt free list");
        cur.next = new_sr;

        // Join with the predecessor when contiguous (never the sentinel).
        if cur_sr != self.head_sr() && cur_sr.offset() + cur.size == new_off
        {
            cur.next = new_hdr.next;
            cur.size += new_hdr.size;
        }
        self.store_hdr(cur_sr, cur);

        self.gate.leave(key);
    }

    /// Walks the free list and reports totals.
    pub fn get_stats(&self) -> IpcResult<HeapStats> {
        let mut stats = HeapStats {
            total_size: self.buf_size,
            total_free_size: 0,
            largest_free_size: 0,
        };
        let key = self.gate.enter();
        let mut cur = self.load_hdr(self.head_sr())?.next;
        while cur.is_valid() {
            let hdr = self.load_hdr(cur)?;
            stats.total_free_size += hdr.size;
            stats.largest_free_size = stats.largest_free_size.max(hdr.size);
            cur = hdr.next;
        }
        self.gate.leave(key);
        Ok(stats)
    }

    /// Tears the instance down. Only the creator may delete; the shared
    /// status word is cleared before any memory is returned so openers see
    /// a not-created instance.
    pub fn delete(self: Arc<Self>) -> IpcResult<()> {
        let mut this = Arc::into_inner(self).ok_or(IpcError::RemoteActive)?;
        if !this.is_creator {
            return Err(IpcError::NotOwner);
        }
        let mut attrs: HeapAttrs = unsafe {
            this.dir.load_shared(this.attrs).ok_or(IpcError::Fail)?
        };
        attrs.status = 0;
        let ok = unsafe { this.dir.store_shared(this.attrs, attrs) };
        debug_assert!(ok);
        if let Some((ns, key)) = this.registered.take() {
            let _ = ns.remove_entry(key);
        }
        if let Some(owned) = this.owned.take() {
            owned.heap.free(owned.addr, owned.size);
        }
        Ok(())
    }

    /// Releases an opener's handle. Local state only.
    pub fn close(self: Arc<Self>) -> IpcResult<()> {
        if self.is_creator {
            return Err(IpcError::NotOwner);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn free_blocks(&self) -> Vec<(u32, u32)> {
        let key = self.gate.enter();
        let mut out = Vec::new();
        let mut cur = self.load_hdr(self.head_sr()).unwrap().next;
        while cur.is_valid() {
            let hdr = self.load_hdr(cur).unwrap();
            out.push((cur.offset() - self.buf.offset(), hdr.size));
            cur = hdr.next;
        }
        self.gate.leave(key);
        out
    }
}

/// Name-registry wrapper: creates instances registered in the module's
/// NameServer table so peers can `open` by name.
pub struct HeapMemMpModule {
    ns: Arc<NameServerInst>,
    dir: Arc<SharedRegionDir>,
}

impl HeapMemMpModule {
    pub const NAMESERVER: &'static str = "HeapMemMP";

    pub fn setup(
        ns_module: &Arc<NameServerModule>,
        dir: Arc<SharedRegionDir>,
    ) -> IpcResult<Arc<Self>> {
        let ns = ns_module.create(
            Self::NAMESERVER,
            NameServerParams {
                max_value_len: 4,
                max_name_len: 32,
                ..Default::default()
            },
        )?;
        Ok(Arc::new(Self { ns, dir }))
    }

    pub fn create(
        &self,
        gate: Arc<GateMp>,
        params: &HeapMemMpParams,
    ) -> IpcResult<Arc<HeapMemMp>> {
        let mut heap = HeapMemMp::create(&self.dir, gate, params)?;
        if let Some(name) = &params.name {
            let key = self.ns.add_u32(name, heap.attrs.0)?;
            // The instance was just created, so this handle is the only
            // one and get_mut cannot fail.
            Arc::get_mut(&mut heap).ok_or(IpcError::Fail)?.registered =
                Some((self.ns.clone(), key));
        }
        Ok(heap)
    }

    pub fn open(
        &self,
        gate: Arc<GateMp>,
        name: &str,
    ) -> IpcResult<Arc<HeapMemMp>> {
        let sr = SrPtr(self.ns.get_u32(name, None)?);
        HeapMemMp::open_by_addr(&self.dir, gate, sr)
    }
}

fn round_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

fn round_down(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    v & !(align - 1)
}
