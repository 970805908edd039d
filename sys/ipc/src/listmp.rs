// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared-memory doubly linked list.
//!
//! Every element begins with a [`ListElem`]: a pair of shared-region
//! pointers. The list object keeps an inline head element in its shared
//! attrs record; emptiness is `head.next == &head` compared as SrPtrs, never
//! as local pointers. Elements are addressed exclusively by SrPtr at this
//! API; translation happens inside, at the owning processor's boundary.
//!
//! Mutating operations hold the instance gate. Each shared node is
//! invalidated before its links are read and written back after they are
//! changed, via the region directory's load/store helpers, so the head and
//! neighbor nodes can never be observed half-updated by another processor.

use std::mem::{offset_of, size_of};
use std::sync::Arc;

use abi::{IpcError, IpcResult, SrPtr};
use serde::{Deserialize, Serialize};

use crate::gate::GateMp;
use crate::heapmem::OwnedBlock;
use crate::nameserver::{NameServerInst, NameServerModule, NameServerParams, NsKey};
use crate::sharedregion::SharedRegionDir;

/// Status word published in shared memory by the creator.
const LISTMP_CREATED: u32 = 0x1202_2009;

/// List linkage placed at the head of every shared element.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListElem {
    pub next: SrPtr,
    pub prev: SrPtr,
}

#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct ListAttrs {
    status: u32,
    _pad: u32,
    head: ListElem,
}

/// Creation parameters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListMpParams {
    pub name: Option<String>,
    pub region_id: u16,
    /// Place the instance at this shared address instead of carving it from
    /// the region heap.
    pub shared_addr: Option<SrPtr>,
}

/// A shared doubly linked list instance (creator or opener).
pub struct ListMp {
    dir: Arc<SharedRegionDir>,
    gate: Arc<GateMp>,
    attrs: SrPtr,
    is_creator: bool,
    owned: Option<OwnedBlock>,
    registered: Option<(Arc<NameServerInst>, NsKey)>,
}

impl ListMp {
    /// Shared memory needed for one instance in `region_id`.
    pub fn shared_mem_req(
        dir: &SharedRegionDir,
        region_id: u16,
    ) -> IpcResult<u32> {
        let line = dir.get_cache_line_size(region_id)? as u32;
        let min_align = line.max(8);
        Ok(round_up(size_of::<ListAttrs>() as u32, min_align))
    }

    pub fn create(
        dir: &Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        params: &ListMpParams,
    ) -> IpcResult<Arc<Self>> {
        let (attrs_sr, owned) = match params.shared_addr {
            Some(sa) => {
                if dir.get_ptr(sa).is_none() {
                    return Err(IpcError::InvalidArg);
                }
                (sa, None)
            }
            None => {
                let total = Self::shared_mem_req(dir, params.region_id)?;
                let region_heap = dir.get_heap(params.region_id)?;
                let addr = region_heap.alloc(total, 0)?;
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

        let list = Self {
            dir: dir.clone(),
            gate,
            attrs: attrs_sr,
            is_creator: true,
            owned,
            registered: None,
        };

        let head = list.head_sr();
        list.store_elem(
            head,
            ListElem {
                next: head,
                prev: head,
            },
        )?;
        // Publish the created status after the head links are visible.
        let ok = unsafe {
            list.dir.store_shared(
                attrs_sr,
                ListAttrs {
                    status: LISTMP_CREATED,
                    _pad: 0,
                    head: ListElem {
                        next: head,
                        prev: head,
                    },
                },
            )
        };
        if !ok {
            return Err(IpcError::Fail);
        }
        Ok(Arc::new(list))
    }

    /// Opens a list some other processor created at `shared_addr`.
    pub fn open_by_addr(
        dir: &Arc<SharedRegionDir>,
        gate: Arc<GateMp>,
        shared_addr: SrPtr,
    ) -> IpcResult<Arc<Self>> {
        let attrs: ListAttrs = unsafe {
            dir.load_shared(shared_addr).ok_or(IpcError::InvalidArg)?
        };
        if attrs.status != LISTMP_CREATED {
            return Err(IpcError::NotFound);
        }
        Ok(Arc::new(Self {
            dir: dir.clone(),
            gate,
            attrs: shared_addr,
            is_creator: false,
            owned: None,
            registered: None,
        }))
    }

    fn head_sr(&self) -> SrPtr {
        self.attrs.add(offset_of!(ListAttrs, head) as u32)
    }

    fn load_elem(&self, sr: SrPtr) -> IpcResult<ListElem> {
        // Safety: sr names a ListElem in shared memory; callers hold the
        // gate for any traversal that races mutators.
        unsafe { self.dir.load_shared(sr) }.ok_or(IpcError::InvalidArg)
    }

    fn store_elem(&self, sr: SrPtr, e: ListElem) -> IpcResult<()> {
        // Safety: as in load_elem, under the gate.
        if unsafe { self.dir.store_shared(sr, e) } {
            Ok(())
        } else {
            Err(IpcError::InvalidArg)
        }
    }

    /// True when the list has no elements. Emptiness is SrPtr equality of
    /// `head.next` with the head itself.
    pub fn empty(&self) -> IpcResult<bool> {
        let head = self.load_elem(self.head_sr())?;
        Ok(head.next == self.head_sr())
    }

    /// Unlinks and returns the element at the front, or `None`.
    pub fn get_head(&self) -> IpcResult<Option<SrPtr>> {
        let head_sr = self.head_sr();
        let key = self.gate.enter();
        let result = (|| {
            let head = self.load_elem(head_sr)?;
            if head.next == head_sr {
                return Ok(None);
            }
            let elem_sr = head.next;
            let elem = self.load_elem(elem_sr)?;
            // New first element's prev points back at the head.
            let next_sr = elem.next;
            let mut next = self.load_elem(next_sr)?;
            next.prev = elem.prev;
            self.store_elem(next_sr, next)?;
            let mut head = self.load_elem(head_sr)?;
            head.next = elem.next;
            self.store_elem(head_sr, head)?;
            Ok(Some(elem_sr))
        })();
        self.gate.leave(key);
        result
    }

    /// Unlinks and returns the element at the back, or `None`.
    pub fn get_tail(&self) -> IpcResult<Option<SrPtr>> {
        let head_sr = self.head_sr();
        let key = self.gate.enter();
        let result = (|| {
            let head = self.load_elem(head_sr)?;
            if head.prev == head_sr {
                return Ok(None);
            }
            let elem_sr = head.prev;
            let elem = self.load_elem(elem_sr)?;
            let prev_sr = elem.prev;
            let mut prev = self.load_elem(prev_sr)?;
            prev.next = elem.next;
            self.store_elem(prev_sr, prev)?;
            let mut head = self.load_elem(head_sr)?;
            head.prev = prev_sr;
            self.store_elem(head_sr, head)?;
            Ok(Some(elem_sr))
        })();
        self.gate.leave(key);
        result
    }

    /// Links `elem` at the front.
    pub fn put_head(&self, elem: SrPtr) -> IpcResult<()> {
        let head_sr = self.head_sr();
        let key = self.gate.enter();
        let result = self.link_after(head_sr, elem);
        self.gate.leave(key);
        result
    }

    /// Links `elem` at the back.
    pub fn put_tail(&self, elem: SrPtr) -> IpcResult<()> {
        let head_sr = self.head_sr();
        let key = self.gate.enter();
        let result = (|| {
            let head = self.load_elem(head_sr)?;
            self.link_after(head.prev, elem)
        })();
        self.gate.leave(key);
        result
    }

    /// Inserts `new_elem` ahead of `cur_elem`.
    pub fn insert(&self, new_elem: SrPtr, cur_elem: SrPtr) -> IpcResult<()> {
        let key = self.gate.enter();
        let result = (|| {
            let cur = self.load_elem(cur_elem)?;
            self.link_after(cur.prev, new_elem)
        })();
        self.gate.leave(key);
        result
    }

    /// Unlinks `elem` from wherever it is.
    pub fn remove(&self, elem: SrPtr) -> IpcResult<()> {
        let key = self.gate.enter();
        let result = (|| {
            let e = self.load_elem(elem)?;
            let mut prev = self.load_elem(e.prev)?;
            prev.next = e.next;
            self.store_elem(e.prev, prev)?;
            let mut next = self.load_elem(e.next)?;
            next.prev = e.prev;
            self.store_elem(e.next, next)?;
            Ok(())
        })();
        self.gate.leave(key);
        result
    }

    /// Next element after `elem` (or the first, for `None`) without
    /// unlinking. Traversal is the caller's to serialize.
    pub fn next(&self, elem: Option<SrPtr>) -> IpcResult<Option<SrPtr>> {
        let head_sr = self.head_sr();
        let cur = elem.unwrap_or(head_sr);
        let e = self.load_elem(cur)?;
        if e.next == head_sr {
            Ok(None)
        } else {
            Ok(Some(e.next))
        }
    }

    /// Previous element before `elem` (or the last, for `None`).
    pub fn prev(&self, elem: Option<SrPtr>) -> IpcResult<Option<SrPtr>> {
        let head_sr = self.head_sr();
        let cur = elem.unwrap_or(head_sr);
        let e = self.load_elem(cur)?;
        if e.prev == head_sr {
            Ok(None)
        } else {
            Ok(Some(e.prev))
        }
    }

    /// Links `elem` directly after `at`, under the gate.
    fn link_after(&self, at: SrPtr, elem: SrPtr) -> IpcResult<()> {
        if !elem.is_valid() || self.dir.get_ptr(elem).is_none() {
            return Err(IpcError::InvalidArg);
        }
        let at_node = self.load_elem(at)?;
        let next_sr = at_node.next;
        self.store_elem(
            elem,
            ListElem {
                next: next_sr,
                prev: at,
            },
        )?;
        let mut at_node = self.load_elem(at)?;
        at_node.next = elem;
        self.store_elem(at, at_node)?;
        let mut next = self.load_elem(next_sr)?;
        next.prev = elem;
        self.store_elem(next_sr, next)?;
        Ok(())
    }

    /// Tears the instance down; creator only. Clears the shared status word
    /// before returning memory.
    pub fn delete(self: Arc<Self>) -> IpcResult<()> {
        let mut this = Arc::into_inner(self).ok_or(IpcError::RemoteActive)?;
        if !this.is_creator {
            return Err(IpcError::NotOwner);
        }
        let mut attrs: ListAttrs = unsafe {
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

    /// Releases an opener's handle.
    pub fn close(self: Arc<Self>) -> IpcResult<()> {
        if self.is_creator {
            return Err(IpcError::NotOwner);
        }
        Ok(())
    }
}

/// Name-registry wrapper mirroring the heap modules: create/open by name.
pub struct ListMpModule {
    ns: Arc<NameServerInst>,
    dir: Arc<SharedRegionDir>,
}

impl ListMpModule {
    pub const NAMESERVER: &'static str = "ListMP";

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
        params: &ListMpParams,
    ) -> IpcResult<Arc<ListMp>> {
        let mut list = ListMp::create(&self.dir, gate, params)?;
        if let Some(name) = &params.name {
            let key = self.ns.add_u32(name, list.attrs.0)?;
            Arc::get_mut(&mut list).ok_or(IpcError::Fail)?.registered =
                Some((self.ns.clone(), key));
        }
        Ok(list)
    }

    pub fn open(
        &self,
        gate: Arc<GateMp>,
        name: &str,
    ) -> IpcResult<Arc<ListMp>> {
        let sr = SrPtr(self.ns.get_u32(name, None)?);
        ListMp::open_by_addr(&self.dir, gate, sr)
    }
}

fn round_up(v: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}
