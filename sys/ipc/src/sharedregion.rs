// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared-region directory.
//!
//! A region is a range of memory visible to more than one processor. The
//! directory translates [`SrPtr`] values (region id + offset) to and from
//! local pointers and records each region's cache geometry. Containers never
//! store local pointers in shared memory; they store `SrPtr`s and translate
//! at this boundary.
//!
//! Cache maintenance is expressed through the [`CacheOps`] capability
//! installed per region, and every shared access in the runtime funnels
//! through [`SharedRegionDir::load_shared`] / [`store_shared`], which apply
//! the invalidate-before-read / write-back-after-write discipline so the
//! containers do not sprinkle ad-hoc cache calls.

use std::ptr::NonNull;
use std::sync::{Arc, RwLock};

use abi::{IpcError, IpcResult, ProcId, SrPtr, MAX_REGIONS, REGION_OFFSET_BITS};
use serde::{Deserialize, Serialize};

use crate::heapmem::HeapMemMp;

/// Sentinel returned by [`SharedRegionDir::get_id`] for pointers outside
/// every region.
pub const INVALID_REGION_ID: u16 = 0xFFFF;

/// Cache maintenance operations for one region.
///
/// On targets where the region is cached, an implementation performs the
/// real line operations; where it is not, the directory never calls these.
pub trait CacheOps: Send + Sync {
    fn inv(&self, ptr: *const u8, len: usize);
    fn wb(&self, ptr: *const u8, len: usize);
    fn wb_inv(&self, ptr: *const u8, len: usize);
}

/// Static description of one region, minus its base address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionDesc {
    pub len: usize,
    /// Cache line size of the region; containers use it as an alignment
    /// floor. Must be a power of two.
    pub cache_line_size: usize,
    pub cache_enabled: bool,
    /// When set, `start` carves a region-wide heap that containers without a
    /// caller-supplied shared address allocate from.
    pub create_heap: bool,
    pub owner: ProcId,
    pub name: Option<String>,
}

struct Entry {
    base: *mut u8,
    desc: RegionDesc,
    cache: Option<Arc<dyn CacheOps>>,
    heap: Option<Arc<HeapMemMp>>,
}

/// The directory itself. One per processor; regions are added during
/// platform bring-up and rarely change afterwards.
pub struct SharedRegionDir {
    /// When false, every core maps shared memory at identical addresses and
    /// an `SrPtr` is the raw address itself; translation short-circuits.
    /// Only meaningful on targets whose shared windows sit below 4 GiB.
    translate: bool,
    entries: RwLock<Vec<Option<Entry>>>,
}

// Safety: `Entry::base` is a raw pointer into memory the caller of
// `set_entry` guaranteed valid (and exclusively governed by the runtime's
// gates) for the lifetime of the entry, so moving or sharing the directory
// across threads does not by itself create aliasing.
unsafe impl Send for SharedRegionDir {}
unsafe impl Sync for SharedRegionDir {}

impl SharedRegionDir {
    pub fn new(translate: bool) -> Arc<Self> {
        let mut entries = Vec::with_capacity(MAX_REGIONS);
        entries.resize_with(MAX_REGIONS, || None);
        Arc::new(Self {
            translate,
            entries: RwLock::new(entries),
        })
    }

    /// Registers region `id` at `base`.
    ///
    /// # Safety
    ///
    /// `base .. base + desc.len` must be valid for reads and writes for as
    /// long as the entry remains in the directory, and concurrent access to
    /// it must follow the runtime's gating discipline (shared container
    /// state is only touched under its GateMP).
    pub unsafe fn set_entry(
        &self,
        id: u16,
        base: NonNull<u8>,
        desc: RegionDesc,
    ) -> IpcResult<()> {
        if usize::from(id) >= MAX_REGIONS
            || desc.len == 0
            || desc.cache_line_size == 0
            || !desc.cache_line_size.is_power_of_two()
        {
            return Err(IpcError::InvalidArg);
        }
        if desc.len > (1usize << REGION_OFFSET_BITS) {
            return Err(IpcError::InvalidArg);
        }
        let mut entries = self.entries.write().unwrap();
        if entries[usize::from(id)].is_some() {
            return Err(IpcError::AlreadyExists);
        }
        // Regions must not overlap: a pointer belongs to at most one.
        let new_lo = base.as_ptr() as usize;
        let new_hi = new_lo + desc.len;
        for e in entries.iter().flatten() {
            let lo = e.base as usize;
            let hi = lo + e.desc.len;
            if new_lo < hi && lo < new_hi {
                return Err(IpcError::InvalidArg);
            }
        }
        entries[usize::from(id)] = Some(Entry {
            base: base.as_ptr(),
            desc,
            cache: None,
            heap: None,
        });
        Ok(())
    }

    /// Installs the cache maintenance capability for a region. Without one,
    /// a cache-enabled region performs no maintenance (correct only on
    /// coherent targets).
    pub fn set_cache_ops(
        &self,
        id: u16,
        ops: Arc<dyn CacheOps>,
    ) -> IpcResult<()> {
        let mut entries = self.entries.write().unwrap();
        let entry = entry_mut(&mut entries, id)?;
        entry.cache = Some(ops);
        Ok(())
    }

    pub fn clear_entry(&self, id: u16) -> IpcResult<()> {
        let mut entries = self.entries.write().unwrap();
        let slot = entries
            .get_mut(usize::from(id))
            .ok_or(IpcError::InvalidArg)?;
        if slot.take().is_none() {
            return Err(IpcError::NotFound);
        }
        Ok(())
    }

    /// Creates the region heaps for regions owned by `self_proc` that asked
    /// for one. Call after all entries are set.
    pub fn start(self: &Arc<Self>, self_proc: ProcId) -> IpcResult<()> {
        for id in 0..MAX_REGIONS as u16 {
            let wants_heap = {
                let entries = self.entries.read().unwrap();
                match &entries[usize::from(id)] {
                    Some(e) => {
                        e.desc.create_heap
                            && e.desc.owner == self_proc
                            && e.heap.is_none()
                    }
                    None => false,
                }
            };
            if !wants_heap {
                continue;
            }
            // Created outside the directory lock: heap creation translates
            // pointers through us.
            let heap = HeapMemMp::for_region(self, id)?;
            let mut entries = self.entries.write().unwrap();
            let entry = entry_mut(&mut entries, id)?;
            entry.heap = Some(heap);
        }
        Ok(())
    }

    /// Drops the region heaps, breaking the directory <-> heap reference
    /// cycle. Call during teardown.
    pub fn stop(&self) {
        let mut entries = self.entries.write().unwrap();
        for e in entries.iter_mut().flatten() {
            e.heap = None;
        }
    }

    pub fn get_heap(&self, id: u16) -> IpcResult<Arc<HeapMemMp>> {
        let entries = self.entries.read().unwrap();
        let entry = entry_ref(&entries, id)?;
        entry.heap.clone().ok_or(IpcError::InvalidArg)
    }

    /// Translates a shared pointer to a local one. `None` for the invalid
    /// pointer, an unknown region, or an out-of-range offset.
    pub fn get_ptr(&self, sr: SrPtr) -> Option<NonNull<u8>> {
        if !sr.is_valid() {
            return None;
        }
        if !self.translate {
            return NonNull::new(sr.0 as usize as *mut u8);
        }
        let entries = self.entries.read().unwrap();
        let entry = entries.get(usize::from(sr.region_id()))?.as_ref()?;
        let offset = sr.offset() as usize;
        if offset >= entry.desc.len {
            return None;
        }
        // Safety: offset is within the entry's length, which the set_entry
        // caller guaranteed addressable.
        NonNull::new(unsafe { entry.base.add(offset) })
    }

    /// Produces the shared pointer naming `p` within region `id`.
    pub fn get_srptr(&self, p: *const u8, id: u16) -> IpcResult<SrPtr> {
        if p.is_null() {
            return Err(IpcError::InvalidArg);
        }
        if !self.translate {
            return Ok(SrPtr(p as usize as u32));
        }
        let entries = self.entries.read().unwrap();
        let entry = entry_ref(&entries, id)?;
        let lo = entry.base as usize;
        let addr = p as usize;
        if addr < lo || addr >= lo + entry.desc.len {
            return Err(IpcError::InvalidArg);
        }
        Ok(SrPtr::new(id, (addr - lo) as u32))
    }

    /// Region containing `p`, or [`INVALID_REGION_ID`].
    pub fn get_id(&self, p: *const u8) -> u16 {
        let addr = p as usize;
        let entries = self.entries.read().unwrap();
        for (id, e) in entries.iter().enumerate() {
            if let Some(e) = e {
                let lo = e.base as usize;
                if addr >= lo && addr < lo + e.desc.len {
                    return id as u16;
                }
            }
        }
        INVALID_REGION_ID
    }

    pub fn get_region_len(&self, id: u16) -> IpcResult<usize> {
        let entries = self.entries.read().unwrap();
        Ok(entry_ref(&entries, id)?.desc.len)
    }

    pub fn is_cache_enabled(&self, id: u16) -> IpcResult<bool> {
        let entries = self.entries.read().unwrap();
        Ok(entry_ref(&entries, id)?.desc.cache_enabled)
    }

    pub fn get_cache_line_size(&self, id: u16) -> IpcResult<usize> {
        let entries = self.entries.read().unwrap();
        Ok(entry_ref(&entries, id)?.desc.cache_line_size)
    }

    /// Invalidate `len` bytes at `ptr` if region `id` is cached.
    pub fn inv(&self, id: u16, ptr: *const u8, len: usize) {
        let entries = self.entries.read().unwrap();
        if let Ok(e) = entry_ref(&entries, id) {
            if e.desc.cache_enabled {
                if let Some(c) = &e.cache {
                    c.inv(ptr, len);
                }
            }
        }
    }

    /// Write back and invalidate `len` bytes at `ptr` if region `id` is
    /// cached.
    pub fn wb_inv(&self, id: u16, ptr: *const u8, len: usize) {
        let entries = self.entries.read().unwrap();
        if let Ok(e) = entry_ref(&entries, id) {
            if e.desc.cache_enabled {
                if let Some(c) = &e.cache {
                    c.wb_inv(ptr, len);
                }
            }
        }
    }

    /// Reads a `T` out of shared memory with acquire semantics: the line is
    /// invalidated (if cached) before the read.
    ///
    /// # Safety
    ///
    /// `sr` must name a properly aligned `T` within its region, and the
    /// caller must hold whatever gate protects that object from concurrent
    /// writers.
    pub unsafe fn load_shared<T: Copy>(&self, sr: SrPtr) -> Option<T> {
        let p = self.get_ptr(sr)?.as_ptr();
        self.inv(sr.region_id(), p, core::mem::size_of::<T>());
        debug_assert!(p as usize % core::mem::align_of::<T>() == 0);
        Some(unsafe { (p as *const T).read() })
    }

    /// Writes a `T` into shared memory with release semantics: the line is
    /// written back and invalidated (if cached) after the write.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::load_shared`], plus exclusive write access
    /// (the gate) for the duration of the call.
    pub unsafe fn store_shared<T: Copy>(&self, sr: SrPtr, v: T) -> bool {
        let Some(p) = self.get_ptr(sr) else {
            return false;
        };
        let p = p.as_ptr();
        debug_assert!(p as usize % core::mem::align_of::<T>() == 0);
        unsafe { (p as *mut T).write(v) };
        self.wb_inv(sr.region_id(), p, core::mem::size_of::<T>());
        true
    }
}

fn entry_ref<'a>(
    entries: &'a [Option<Entry>],
    id: u16,
) -> IpcResult<&'a Entry> {
    entries
        .get(usize::from(id))
        .and_then(|e| e.as_ref())
        .ok_or(IpcError::InvalidArg)
}

fn entry_mut<'a>(
    entries: &'a mut [Option<Entry>],
    id: u16,
) -> IpcResult<&'a mut Entry> {
    entries
        .get_mut(usize::from(id))
        .and_then(|e| e.as_mut())
        .ok_or(IpcError::InvalidArg)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    #[repr(C, align(128))]
    #[derive(Clone, Copy)]
    struct Chunk([u8; 128]);

    /// An owned, aligned allocation standing in for a platform shared
    /// window in tests. Chunked storage keeps the base aligned to the
    /// largest cache-line size the containers use as an alignment floor.
    pub struct TestRegion {
        buf: Box<[Chunk]>,
    }

    impl TestRegion {
        pub fn new(len: usize) -> Self {
            Self {
                buf: vec![Chunk([0; 128]); len.div_ceil(128)]
                    .into_boxed_slice(),
            }
        }

        pub fn base(&mut self) -> NonNull<u8> {
            NonNull::new(self.buf.as_mut_ptr() as *mut u8).unwrap()
        }
    }

    /// Directory with one uncached region of `len` bytes, plus the backing
    /// storage (keep it alive as long as the directory).
    pub fn dir_with_region(
        len: usize,
        cache_line_size: usize,
    ) -> (Arc<SharedRegionDir>, TestRegion) {
        let mut region = TestRegion::new(len);
        let dir = SharedRegionDir::new(true);
        unsafe {
            dir.set_entry(
                0,
                region.base(),
                RegionDesc {
                    len,
                    cache_line_size,
                    cache_enabled: false,
                    create_heap: false,
                    owner: ProcId(0),
                    name: None,
                },
            )
            .unwrap();
        }
        (dir, region)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn srptr_round_trip() {
        let (dir, _region) = dir_with_region(4096, 64);
        let p = dir.get_ptr(SrPtr::new(0, 128)).unwrap();
        let back = dir.get_srptr(p.as_ptr(), 0).unwrap();
        assert_eq!(back, SrPtr::new(0, 128));
        assert_eq!(dir.get_id(p.as_ptr()), 0);
    }

    #[test]
    fn rejects_out_of_range() {
        let (dir, _region) = dir_with_region(4096, 64);
        assert!(dir.get_ptr(SrPtr::new(0, 4096)).is_none());
        assert!(dir.get_ptr(SrPtr::new(1, 0)).is_none());
        assert!(dir.get_ptr(SrPtr::INVALID).is_none());
    }

    #[test]
    fn pointer_outside_all_regions() {
        let (dir, _region) = dir_with_region(4096, 64);
        let elsewhere = Box::new(0u64);
        assert_eq!(dir.get_id(&*elsewhere as *const u64 as *const u8), {
            INVALID_REGION_ID
        });
    }

    #[test]
    fn overlapping_region_rejected() {
        let mut region = TestRegion::new(4096);
        let dir = SharedRegionDir::new(true);
        let desc = RegionDesc {
            len: 4096,
            cache_line_size: 64,
            cache_enabled: false,
            create_heap: false,
            owner: ProcId(0),
            name: None,
        };
        unsafe {
            dir.set_entry(0, region.base(), desc.clone()).unwrap();
            let overlapping = NonNull::new(region.base().as_ptr().add(64))
                .unwrap();
            let mut smaller = desc;
            smaller.len = 64;
            assert_eq!(
                dir.set_entry(1, overlapping, smaller),
                Err(IpcError::InvalidArg)
            );
        }
    }

    #[derive(Default)]
    struct SpyCache {
        pub invs: Mutex<usize>,
        pub wb_invs: Mutex<usize>,
    }

    impl CacheOps for SpyCache {
        fn inv(&self, _ptr: *const u8, _len: usize) {
            *self.invs.lock().unwrap() += 1;
        }
        fn wb(&self, _ptr: *const u8, _len: usize) {}
        fn wb_inv(&self, _ptr: *const u8, _len: usize) {
            *self.wb_invs.lock().unwrap() += 1;
        }
    }

    #[test]
    fn load_store_apply_cache_discipline() {
        let mut region = TestRegion::new(4096);
        let dir = SharedRegionDir::new(true);
        unsafe {
            dir.set_entry(
                0,
                region.base(),
                RegionDesc {
                    len: 4096,
                    cache_line_size: 64,
                    cache_enabled: true,
                    create_heap: false,
                    owner: ProcId(0),
                    name: None,
                },
            )
            .unwrap();
        }
        let spy = Arc::new(SpyCache::default());
        dir.set_cache_ops(0, spy.clone()).unwrap();

        let sr = SrPtr::new(0, 64);
        unsafe {
            assert!(dir.store_shared(sr, 0xABCD_1234u32));
            assert_eq!(dir.load_shared::<u32>(sr), Some(0xABCD_1234));
        }
        assert_eq!(*spy.wb_invs.lock().unwrap(), 1);
        assert_eq!(*spy.invs.lock().unwrap(), 1);
    }
}
