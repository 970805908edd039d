// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bucketed fixed-block shared heap.
//!
//! Blocks come from a small set of buckets, each a FIFO of fixed-size
//! elements carved out at create time. Bucket entries are normalized before
//! the carve: alignments are raised to at least the region cache line,
//! block sizes are rounded up to the alignment, the set is sorted by
//! `(block_size, align)`, and duplicates merge their block counts. The
//! free path finds a block's bucket by comparing shared-region pointers
//! against the sorted bucket bases, a bounded scan.
//!
//! With the `exact` policy, allocations must match a bucket's block size
//! exactly; this catches callers that would silently waste tail space in a
//! larger block.

use std::mem::{offset_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;

use abi::{IpcError, IpcResult, SrPtr};
use serde::{Deserialize, Serialize};

use crate::gate::GateMp;
use crate::heapmem::OwnedBlock;
use crate::nameserver::{NameServerInst, NameServerModule, NameServerParams, NsKey};
use crate::sharedregion::SharedRegionDir;

/// Status word published in shared memory by the creator.
const HEAPMULTIBUF_CREATED: u32 = 0x0503_1981;

/// Upper bound on buckets per instance.
pub const MAX_BUCKETS: usize = 8;

/// Alignment floor used when the region's cache line is smaller than the
/// widest primitive the blocks may hold.
const DEFAULT_TYPE_ALIGN: u32 = 8;

/// One bucket as requested by the creator.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub block_size: u32,
    pub num_blocks: u32,
    pub align: u32,
}

/// Free-list linkage at the head of every free block.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BufElem {
    next: SrPtr,
}

/// Per-bucket shared bookkeeping.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BucketAttrs {
    base_addr: SrPtr,
    head: SrPtr,
    tail: SrPtr,
    block_size: u32,
    num_blocks: u32,
    num_free_blocks: u32,
    min_free_blocks: u32,
    align: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct MultiBufAttrs {
    status: u32,
    num_buckets: u32,
    exact: u32,
    _pad: u32,
    buckets: [BucketAttrs; MAX_BUCKETS],
}

/// Creation parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeapMultiBufMpParams {
    pub name: Option<String>,
    pub region_id: u16,
    /// Place the instance at this shared address instead of carving it from
    /// the region heap.
    pub shared_addr: Option<SrPtr>,
    pub buckets: Vec<Bucket>,
    /// Require allocation sizes to match a bucket's block size exactly.
    pub exact: bool,
    /// Track the low-water mark of free blocks per bucket.
    pub track_max_allocs: bool,
}

impl Default for HeapMultiBufMpParams {
    fn default() -> Self {
        Self {
            name: None,
            region_id: 0,
            shared_addr: None,
            buckets: Vec::new(),
            exact: false,
            track_max_allocs: false,
        }
    }
}

/// Per-bucket numbers reported by
/// [`HeapMultiBufMp::get_extended_stats`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BucketStats {
    pub block_size: u32,
    pub align: u32,
    pub num_blocks: u32,
    pub num_allocated_blocks: u32,
    /// Peak simultaneous allocations observed (when tracking is enabled).
    pub max_allocated_blocks: u32,
}

/// A bucketed fixed-block heap instance (creator or opener).
pub struct HeapMultiBufMp {
    dir: Arc<SharedRegionDir>,
    gate: Arc<GateMp>,
    region_id: u16,
    attrs: SrPtr,
    num_buckets: u32,
    exact: bool,
    track_max_allocs: bool,
    is_creator: bool,
    owned: Option<OwnedBlock>,
    registered: Option<(Arc<NameServerInst>, NsKey)>,
}

impl HeapMultiBufMp {
    /// Normalizes a bucket set: raise alignments, round block sizes, sort
    /// by `(block_size, align)`, merge identical pairs.
    fn process_buckets(
        dir: &SharedRegionDir,
        region_id: u16,
        raw: &[Bucket],
    ) -> IpcResult<Vec<Bucket>> {
        if raw.is_empty() || raw.len() > MAX_BUCKETS {
            return Err(IpcError::InvalidArg);
        }
        let line = dir.get_cache_line_size(region_id)? as u32;
        let mut buckets = Vec::with_capacity(raw.len());
        for b in raw {
            if b.align != 0 && !b.align.is_power_of_two() {
                return Err(IpcError::InvalidArg);
            }
            if b.block_size == 0 || b.num_blocks == 0 {
                return Err(IpcError::InvalidArg);
            }
            let align = b.align.max(line).max(DEFAULT_TYPE_ALIGN);
            let block_size = (b.block_size + align - 1) & !(align - 1);
            buckets.push(Bucket {
                block_size,
                num_blocks: b.num_blocks,
                align,
            });
        }
        buckets.sort_by_key(|b| (b.block_size, b.align));
        let mut merged: Vec<Bucket> = Vec::new();
        for b in buckets {
            match merged.last_mut() {
                Some(last)
                    if last.block_size == b.block_size
                        && last.align == b.align =>
                {
                    last.num_blocks += b.num_blocks;
                }
                _ => merged.push(b),
            }
        }
        Ok(merged)
    }

    /// Shared memory needed to create an instance with `params`.
    pub fn shared_mem_req(
        dir: &SharedRegionDir,
        params: &HeapMultiBufMpParams,
    ) -> IpcResult<u32> {
        let buckets =
            Self::process_buckets(dir, params.region_id, &params.buckets)?;
        let line = dir.get_cache_line_size(params.region_id)? as u32;
        let min_align = line.max(DEFAULT_TYPE_ALIGN);
        let mut req = round_up(size_of::<MultiBufAttrs>() as u32, min_align);
        for b in &buckets {
            req = round_up(req, b.align);
            req += b.block_size * b.num_blocks;
        }
        Ok(req)
    }

    pub fn create(
        dir: &Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        params: &HeapMultiBufMpParams,
    ) -> IpcResult<Arc<Self>> {
        let buckets =
            Self::process_buckets(dir, params.region_id, &params.buckets)?;
        let total = Self::shared_mem_req(dir, params)?;

        let line = dir.get_cache_line_size(params.region_id)? as u32;
        let min_align = line.max(DEFAULT_TYPE_ALIGN) as usize;
        let (attrs_sr, owned) = match params.shared_addr {
            Some(sa) => {
                let Some(base) = dir.get_ptr(sa) else {
                    return Err(IpcError::InvalidArg);
                };
                if base.as_ptr() as usize % min_align != 0
                    || dir.get_ptr(sa.add(total - 1)).is_none()
                {
                    return Err(IpcError::InvalidArg);
                }
                (sa, None)
            }
            None => {
                let region_heap = dir.get_heap(params.region_id)?;
                let addr = region_heap.alloc(total, min_align as u32)?;
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

        let heap = Self {
            dir: dir.clone(),
            gate,
            region_id: attrs_sr.region_id(),
            attrs: attrs_sr,
            num_buckets: buckets.len() as u32,
            exact: params.exact,
            track_max_allocs: params.track_max_allocs,
            is_creator: true,
            owned,
            registered: None,
        };
        heap.post_init(&buckets)?;
        Ok(Arc::new(heap))
    }

    /// Opens an instance some other processor created at `shared_addr`.
    pub fn open_by_addr(
        dir: &Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        shared_addr: SrPtr,
    ) -> IpcResult<Arc<Self>> {
        let attrs: MultiBufAttrs = unsafe {
            dir.load_shared(shared_addr).ok_or(IpcError::InvalidArg)?
        };
        if attrs.status != HEAPMULTIBUF_CREATED {
            return Err(IpcError::NotFound);
        }
        Ok(Arc::new(Self {
            dir: dir.clone(),
            gate,
            region_id: shared_addr.region_id(),
            attrs: shared_addr,
            num_buckets: attrs.num_buckets,
            exact: attrs.exact != 0,
            track_max_allocs: false,
            is_creator: false,
            owned: None,
            registered: None,
        }))
    }

    /// Carves the buckets and publishes the attrs record.
    fn post_init(&self, buckets: &[Bucket]) -> IpcResult<()> {
        let line = self.dir.get_cache_line_size(self.region_id)? as u32;
        let min_align = line.max(DEFAULT_TYPE_ALIGN);
        let mut cursor = self
            .attrs
            .add(round_up(size_of::<MultiBufAttrs>() as u32, min_align))
            .offset();

        let mut battrs = [BucketAttrs {
            base_addr: SrPtr::INVALID,
            head: SrPtr::INVALID,
            tail: SrPtr::INVALID,
            block_size: 0,
            num_blocks: 0,
            num_free_blocks: 0,
            min_free_blocks: 0,
            align: 0,
        }; MAX_BUCKETS];

        for (i, b) in buckets.iter().enumerate() {
            cursor = round_up(cursor, b.align);
            let base = SrPtr::new(self.region_id, cursor);
            battrs[i] = BucketAttrs {
                base_addr: base,
                head: SrPtr::INVALID,
                tail: SrPtr::INVALID,
                block_size: b.block_size,
                num_blocks: b.num_blocks,
                num_free_blocks: b.num_blocks,
                min_free_blocks: b.num_blocks,
                align: b.align,
            };
            cursor += b.block_size * b.num_blocks;
        }

        self.store_attrs(MultiBufAttrs {
            status: 0,
            num_buckets: self.num_buckets,
            exact: u32::from(self.exact),
            _pad: 0,
            buckets: battrs,
        })?;

        // Thread every block onto its bucket's FIFO.
        for (i, b) in buckets.iter().enumerate() {
            for n in 0..b.num_blocks {
                let block = battrs[i].base_addr.add(n * b.block_size);
                self.put_tail(i, block)?;
            }
        }

        // Publish the created status only after the free lists are whole.
        let mut attrs = self.load_attrs()?;
        attrs.status = HEAPMULTIBUF_CREATED;
        self.store_attrs(attrs)?;
        Ok(())
    }

    fn load_attrs(&self) -> IpcResult<MultiBufAttrs> {
        // Safety: attrs names this instance's shared record; callers hold
        // the gate around mutation windows.
        unsafe { self.dir.load_shared(self.attrs) }.ok_or(IpcError::Fail)
    }

    fn store_attrs(&self, a: MultiBufAttrs) -> IpcResult<()> {
        // Safety: as in load_attrs.
        if unsafe { self.dir.store_shared(self.attrs, a) } {
            Ok(())
        } else {
            Err(IpcError::Fail)
        }
    }

    fn bucket_sr(&self, index: usize) -> SrPtr {
        self.attrs.add(
            (offset_of!(MultiBufAttrs, buckets)
                + index * size_of::<BucketAttrs>()) as u32,
        )
    }

    fn load_bucket(&self, index: usize) -> IpcResult<BucketAttrs> {
        // Safety: bucket_sr stays inside the attrs record.
        unsafe { self.dir.load_shared(self.bucket_sr(index)) }
            .ok_or(IpcError::Fail)
    }

    fn store_bucket(&self, index: usize, b: BucketAttrs) -> IpcResult<()> {
        // Safety: as in load_bucket, under the gate.
        if unsafe { self.dir.store_shared(self.bucket_sr(index), b) } {
            Ok(())
        } else {
            Err(IpcError::Fail)
        }
    }

    /// Pops the head of bucket `index`'s FIFO. Gate held by the caller.
    fn get_head(&self, index: usize) -> IpcResult<Option<SrPtr>> {
        let mut b = self.load_bucket(index)?;
        if !b.head.is_valid() {
            return Ok(None);
        }
        let block = b.head;
        let elem: BufElem = unsafe {
            self.dir.load_shared(block).ok_or(IpcError::Fail)?
        };
        b.head = elem.next;
        if !b.head.is_valid() {
            b.tail = SrPtr::INVALID;
        }
        self.store_bucket(index, b)?;
        Ok(Some(block))
    }

    /// Pushes `block` on bucket `index`'s FIFO tail. Gate held by the
    /// caller.
    fn put_tail(&self, index: usize, block: SrPtr) -> IpcResult<()> {
        let mut b = self.load_bucket(index)?;
        let elem = BufElem {
            next: SrPtr::INVALID,
        };
        // Safety: block is inside the bucket's carve; exclusive under gate.
        if !unsafe { self.dir.store_shared(block, elem) } {
            return Err(IpcError::Fail);
        }
        if b.tail.is_valid() {
            let mut tail: BufElem = unsafe {
                self.dir.load_shared(b.tail).ok_or(IpcError::Fail)?
            };
            tail.next = block;
            if !unsafe { self.dir.store_shared(b.tail, tail) } {
                return Err(IpcError::Fail);
            }
        } else {
            b.head = block;
        }
        b.tail = block;
        self.store_bucket(index, b)?;
        Ok(())
    }

    /// Allocates one block from the first bucket whose size and alignment
    /// cover the request.
    pub fn alloc(&self, size: u32, align: u32) -> IpcResult<NonNull<u8>> {
        if size == 0 || (align != 0 && !align.is_power_of_two()) {
            return Err(IpcError::InvalidArg);
        }

        // Bucket geometry is fixed at create time; scanning it needs no
        // gate or cache maintenance.
        let mut index = None;
        for i in 0..self.num_buckets as usize {
            let b = self.load_bucket(i)?;
            if size <= b.block_size && align <= b.align {
                if self.exact && size != b.block_size {
                    return Err(IpcError::ExactFail);
                }
                index = Some(i);
                break;
            }
        }
        let Some(index) = index else {
            return Err(IpcError::Memory);
        };

        let key = self.gate.enter();
        let result = (|| {
            let Some(block) = self.get_head(index)? else {
                return Err(IpcError::NoBlocksLeft);
            };
            let mut b = self.load_bucket(index)?;
            b.num_free_blocks -= 1;
            if self.track_max_allocs && b.num_free_blocks < b.min_free_blocks
            {
                b.min_free_blocks = b.num_free_blocks;
            }
            self.store_bucket(index, b)?;
            Ok(block)
        })();
        self.gate.leave(key);

        let block = result?;
        let ptr = self.dir.get_ptr(block).ok_or(IpcError::Fail)?;
        Ok(ptr)
    }

    /// Returns a block to its bucket.
    ///
    /// With `exact == false`, any `size` up to the bucket's block size is
    /// accepted (callers commonly pass their original, smaller request);
    /// with `exact == true`, `size` must equal the block size. Violations
    /// panic, as do addresses outside every bucket.
    pub fn free(&self, addr: NonNull<u8>, size: u32) {
        assert!(size != 0, "freed size must be non-zero");
        let block = self
            .dir
            .get_srptr(addr.as_ptr(), self.region_id)
            .expect("freed address outside heap region");

        // Buckets are sorted by base; scan from the top for the first base
        // at or below the block.
        let mut found = None;
        for i in (0..self.num_buckets as usize).rev() {
            let b = self.load_bucket(i).expect("corrupt attrs");
            if b.base_addr.is_valid()
                && b.base_addr.offset() <= block.offset()
            {
                found = Some((i, b));
                break;
            }
        }
        let (index, b) = found.expect("freed address below every bucket");
        let span = b.block_size * b.num_blocks;
        assert!(
            block.offset() < b.base_addr.offset() + span,
            "freed address beyond the last bucket"
        );
        if self.exact {
            assert_eq!(size, b.block_size, "freed size must match bucket");
        } else {
            assert!(size <= b.block_size, "freed size exceeds bucket");
        }

        self.dir.inv(
            self.region_id,
            addr.as_ptr(),
            b.block_size as usize,
        );

        let key = self.gate.enter();
        let r = (|| {
            self.put_tail(index, block)?;
            let mut b = self.load_bucket(index)?;
            b.num_free_blocks += 1;
            self.store_bucket(index, b)
        })();
        self.gate.leave(key);
        r.expect("corrupt bucket free list");
    }

    /// Totals across buckets, shaped like the plain heap's stats.
    pub fn get_stats(&self) -> IpcResult<crate::heapmem::HeapStats> {
        let key = self.gate.enter();
        let result = (|| {
            let mut stats = crate::heapmem::HeapStats::default();
            for i in 0..self.num_buckets as usize {
                let b = self.load_bucket(i)?;
                stats.total_size += b.block_size * b.num_blocks;
                stats.total_free_size += b.block_size * b.num_free_blocks;
                if b.num_free_blocks > 0 {
                    stats.largest_free_size =
                        stats.largest_free_size.max(b.block_size);
                }
            }
            Ok(stats)
        })();
        self.gate.leave(key);
        result
    }

    /// Per-bucket statistics.
    pub fn get_extended_stats(&self) -> IpcResult<Vec<BucketStats>> {
        let key = self.gate.enter();
        let result = (|| {
            let mut out = Vec::with_capacity(self.num_buckets as usize);
            for i in 0..self.num_buckets as usize {
                let b = self.load_bucket(i)?;
                out.push(BucketStats {
                    block_size: b.block_size,
                    align: b.align,
                    num_blocks: b.num_blocks,
                    num_allocated_blocks: b.num_blocks - b.num_free_blocks,
                    max_allocated_blocks: b.num_blocks - b.min_free_blocks,
                });
            }
            Ok(out)
        })();
        self.gate.leave(key);
        result
    }

    /// Tears the instance down; creator only.
    pub fn delete(self: Arc<Self>) -> IpcResult<()> {
        let mut this = Arc::into_inner(self).ok_or(IpcError::RemoteActive)?;
        if !this.is_creator {
            return Err(IpcError::NotOwner);
        }
        let mut attrs = this.load_attrs()?;
        attrs.status = 0;
        this.store_attrs(attrs)?;
        if let Some((ns, key)) = this.registered.take() {
            let _ = ns.remove_entry(key);
        }
        if let Some(owned) = this.owned.take() {
            owned.heap.free(owned.addr, owned.size);
        }
        Ok(())
    }

    /// Releases an opener's handle.
    pub fn close(self: Arc<Self>) -> IpcResult<()> {
        if self.is_creator {
            return Err(IpcError::NotOwner);
        }
        Ok(())
    }
}

/// Name-registry wrapper mirroring the other container modules.
pub struct HeapMultiBufMpModule {
    ns: Arc<NameServerInst>,
    dir: Arc<SharedRegionDir>,
}

impl HeapMultiBufMpModule {
    pub const NAMESERVER: &'static str = "HeapMultiBufMP";

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
        params: &HeapMultiBufMpParams,
    ) -> IpcResult<Arc<HeapMultiBufMp>> {
        let mut heap = HeapMultiBufMp::create(&self.dir, gate, params)?;
        if let Some(name) = &params.name {
            let key = self.ns.add_u32(name, heap.attrs.0)?;
            Arc::get_mut(&mut heap).ok_or(IpcError::Fail)?.registered =
                Some((self.ns.clone(), key));
        }
        Ok(heap)
    }

    pub fn open(
        &self,
        gate: Arc<GateMp>,
        name: &str,
    ) -> IpcResult<Arc<HeapMultiBufMp>> {
        let sr = SrPtr(self.ns.get_u32(name, None)?);
        HeapMultiBufMp::open_by_addr(&self.dir, gate, sr)
    }
}

fn round_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}
