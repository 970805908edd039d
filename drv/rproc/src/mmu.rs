// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Co-processor MMU control.
//!
//! The MMU maps the co-processor's view (`slave_virt`) onto system
//! addresses (`master_phys`) with pages of 4 KB, 64 KB, 1 MB, or 16 MB.
//! Adding a range splits it greedily into the largest pages that divide
//! both addresses; each resulting descriptor is programmed only when
//! absent or when its existing translation differs.
//!
//! The fault path runs in interrupt context: read the fault address and
//! status, record a one-line summary, mask further MMU interrupts, and
//! write the status back to clear it. State-machine consequences (the
//! transition to `MmuFault`) belong to the processor object driving this
//! device.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use abi::{IpcError, IpcResult};
use bitflags::bitflags;
use ringbuf::{ringbuf, ringbuf_entry};
use serde::{Deserialize, Serialize};

use crate::RegisterBus;

pub const PAGE_SIZE_4KB: u32 = 0x1000;
pub const PAGE_SIZE_64KB: u32 = 0x1_0000;
pub const PAGE_SIZE_1MB: u32 = 0x10_0000;
pub const PAGE_SIZE_16MB: u32 = 0x100_0000;

/// Page sizes in descending order, the greedy split's preference.
const PAGE_SIZES: [u32; 4] =
    [PAGE_SIZE_16MB, PAGE_SIZE_1MB, PAGE_SIZE_64KB, PAGE_SIZE_4KB];

bitflags! {
    /// MMU interrupt status bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MmuIrq: u32 {
        const TLB_MISS = 1 << 0;
        const TRANSLATION_FAULT = 1 << 1;
        const EMU_MISS = 1 << 2;
        const TABLE_WALK_FAULT = 1 << 3;
        const MULTI_HIT_FAULT = 1 << 4;
    }
}

/// All interrupt sources this driver handles.
pub const MMU_IRQ_MASK: u32 = 0x1F;

/// Register offsets of one MMU instance. Per-SoC data.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MmuRegLayout {
    pub irq_status: u32,
    pub irq_enable: u32,
    pub fault_addr: u32,
}

/// The layout used by the media-processor subsystems this driver grew up
/// on.
pub const IPU_MMU_LAYOUT: MmuRegLayout = MmuRegLayout {
    irq_status: 0x18,
    irq_enable: 0x1C,
    fault_addr: 0x48,
};

/// Access width attribute of a mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum ElementSize {
    Elem8,
    #[default]
    Elem16,
    Elem32,
    None,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum Endianism {
    #[default]
    Little,
    Big,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum MixedSize {
    #[default]
    TlbElementSize,
    CpuElementSize,
    None,
}

/// One mapping request.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct MmuEntry {
    pub slave_virt: u32,
    pub master_phys: u32,
    pub size: u32,
    pub element_size: ElementSize,
    pub endianism: Endianism,
    pub mixed_size: MixedSize,
}

impl MmuEntry {
    pub fn new(slave_virt: u32, master_phys: u32, size: u32) -> Self {
        Self {
            slave_virt,
            master_phys,
            size,
            element_size: ElementSize::default(),
            endianism: Endianism::default(),
            mixed_size: MixedSize::default(),
        }
    }
}

/// What the fault handler observed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FaultInfo {
    pub fault_addr: u32,
    pub status: MmuIrq,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Pte {
    phys: u32,
    page_size: u32,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Enabled { entries: u32 },
    Programmed { va: u32, size: u32 },
    Cleared { va: u32 },
    Fault { addr: u32, status: u32 },
    Disabled,
}

ringbuf!(Trace, 64, Trace::None);

/// One MMU instance.
pub struct Mmu {
    bus: Arc<dyn RegisterBus>,
    layout: MmuRegLayout,
    /// Programmed descriptors, keyed by slave-virtual base.
    pages: Mutex<BTreeMap<u32, Pte>>,
    enabled: AtomicBool,
}

impl Mmu {
    pub fn new(bus: Arc<dyn RegisterBus>, layout: MmuRegLayout) -> Arc<Self> {
        Arc::new(Self {
            bus,
            layout,
            pages: Mutex::new(BTreeMap::new()),
            enabled: AtomicBool::new(false),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Programs the boot-time map and unmasks the fault interrupt.
    ///
    /// Static entries tolerate unaligned input the way boot maps do: both
    /// addresses are aligned down to 4 KB and the size is grown to cover
    /// the original range.
    pub fn enable(&self, entries: &[MmuEntry]) -> IpcResult<()> {
        for e in entries {
            let head = e.slave_virt & (PAGE_SIZE_4KB - 1);
            let aligned = MmuEntry {
                slave_virt: e.slave_virt & !(PAGE_SIZE_4KB - 1),
                master_phys: e.master_phys & !(PAGE_SIZE_4KB - 1),
                size: round_up_page(e.size + head),
                ..*e
            };
            self.add_aligned(&aligned)?;
        }
        self.bus.write32(self.layout.irq_enable, MMU_IRQ_MASK);
        self.enabled.store(true, Ordering::SeqCst);
        ringbuf_entry!(Trace::Enabled {
            entries: entries.len() as u32
        });
        Ok(())
    }

    /// Masks the fault interrupt and forgets the page table.
    pub fn disable(&self) {
        self.bus.write32(self.layout.irq_enable, 0);
        self.enabled.store(false, Ordering::SeqCst);
        self.pages.lock().unwrap().clear();
        ringbuf_entry!(Trace::Disabled);
    }

    /// Maps one range. Dynamic entries are strict: addresses and size must
    /// be page-aligned, or the request fails with `MmuConfig`.
    pub fn add_entry(&self, e: &MmuEntry) -> IpcResult<()> {
        if e.size == 0 {
            return Err(IpcError::InvalidArg);
        }
        if e.slave_virt % PAGE_SIZE_4KB != 0
            || e.master_phys % PAGE_SIZE_4KB != 0
            || e.size % PAGE_SIZE_4KB != 0
        {
            return Err(IpcError::MmuConfig);
        }
        self.add_aligned(e)
    }

    fn add_aligned(&self, e: &MmuEntry) -> IpcResult<()> {
        let mut va = e.slave_virt;
        let mut pa = e.master_phys;
        let mut remaining = e.size;
        let mut pages = self.pages.lock().unwrap();

        while remaining != 0 {
            let Some(ps) = pick_page_size(va, pa, remaining) else {
                // No page size divides both addresses within the
                // remaining length.
                return Err(IpcError::MmuConfig);
            };
            let wanted = Pte {
                phys: pa,
                page_size: ps,
            };
            // Program only absent or re-translated descriptors.
            if pages.get(&va) != Some(&wanted) {
                pages.insert(va, wanted);
                ringbuf_entry!(Trace::Programmed { va, size: ps });
            }
            va += ps;
            pa += ps;
            remaining -= ps;
        }
        Ok(())
    }

    /// Unmaps a range, clearing whichever descriptors exist within it.
    /// Unaligned input is aligned and rounded like the static add path.
    pub fn delete_entry(&self, e: &MmuEntry) -> IpcResult<()> {
        if e.size == 0 {
            return Err(IpcError::InvalidArg);
        }
        let head = e.slave_virt & (PAGE_SIZE_4KB - 1);
        let mut va = e.slave_virt & !(PAGE_SIZE_4KB - 1);
        let mut remaining = round_up_page(e.size + head);
        let mut pages = self.pages.lock().unwrap();

        while remaining != 0 {
            let step = match pages.get(&va) {
                Some(pte) => {
                    let ps = pte.page_size;
                    pages.remove(&va);
                    ringbuf_entry!(Trace::Cleared { va });
                    ps
                }
                None => PAGE_SIZE_4KB,
            };
            if step > remaining {
                break;
            }
            va += step;
            remaining -= step;
        }
        Ok(())
    }

    /// Walks the table for `va`. `None` reproduces what the hardware would
    /// raise as a translation fault.
    pub fn translate(&self, va: u32) -> Option<u32> {
        let pages = self.pages.lock().unwrap();
        let (&base, pte) = pages.range(..=va).next_back()?;
        if va - base < pte.page_size {
            Some(pte.phys + (va - base))
        } else {
            None
        }
    }

    /// The fault handler's check-and-clear half, run in interrupt context.
    ///
    /// Returns `None` when no MMU interrupt is pending (shared-line
    /// spurious entry). Otherwise reads the fault address, records the
    /// decoded status, masks further MMU interrupts, and writes the
    /// status back to clear it.
    pub fn check_and_clear_fault(&self) -> Option<FaultInfo> {
        let status =
            self.bus.read32(self.layout.irq_status) & MMU_IRQ_MASK;
        if status == 0 {
            return None;
        }
        let fault_addr = self.bus.read32(self.layout.fault_addr);
        ringbuf_entry!(Trace::Fault {
            addr: fault_addr,
            status,
        });
        self.bus.write32(self.layout.irq_enable, 0);
        self.bus.write32(self.layout.irq_status, status);
        Some(FaultInfo {
            fault_addr,
            status: MmuIrq::from_bits_truncate(status),
        })
    }
}

fn round_up_page(v: u32) -> u32 {
    (v + PAGE_SIZE_4KB - 1) & !(PAGE_SIZE_4KB - 1)
}

/// Largest page size that divides both addresses and fits the remaining
/// length.
fn pick_page_size(va: u32, pa: u32, remaining: u32) -> Option<u32> {
    PAGE_SIZES.into_iter().find(|&ps| {
        remaining >= ps && va % ps == 0 && pa % ps == 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MockBus {
        regs: Mutex<HashMap<u32, u32>>,
    }

    impl RegisterBus for MockBus {
        fn read32(&self, offset: u32) -> u32 {
            *self.regs.lock().unwrap().get(&offset).unwrap_or(&0)
        }
        fn write32(&self, offset: u32, value: u32) {
            self.regs.lock().unwrap().insert(offset, value);
        }
    }

    fn mmu() -> (Arc<Mmu>, Arc<MockBus>) {
        let bus = Arc::new(MockBus::default());
        (Mmu::new(bus.clone(), IPU_MMU_LAYOUT), bus)
    }

    #[test]
    fn greedy_split_prefers_large_pages() {
        let (mmu, _bus) = mmu();
        // 17 MB at 16 MB-aligned addresses: one 16 MB page + one 1 MB.
        mmu.add_entry(&MmuEntry::new(
            0x8000_0000,
            0x9000_0000,
            PAGE_SIZE_16MB + PAGE_SIZE_1MB,
        ))
        .unwrap();
        let pages = mmu.pages.lock().unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(
            pages[&0x8000_0000],
            Pte {
                phys: 0x9000_0000,
                page_size: PAGE_SIZE_16MB
            }
        );
        assert_eq!(
            pages[&0x8100_0000],
            Pte {
                phys: 0x9100_0000,
                page_size: PAGE_SIZE_1MB
            }
        );
    }

    #[test]
    fn split_degrades_to_common_alignment() {
        let (mmu, _bus) = mmu();
        // Virtual is 1 MB-aligned but physical only 64 KB-aligned; the
        // split must stay at 64 KB pages.
        mmu.add_entry(&MmuEntry::new(
            0x8010_0000,
            0x1001_0000,
            2 * PAGE_SIZE_64KB,
        ))
        .unwrap();
        let pages = mmu.pages.lock().unwrap();
        assert_eq!(pages.len(), 2);
        assert!(pages
            .values()
            .all(|p| p.page_size == PAGE_SIZE_64KB));
    }

    #[test]
    fn unaligned_dynamic_entry_is_mmu_config() {
        let (mmu, _bus) = mmu();
        assert_eq!(
            mmu.add_entry(&MmuEntry::new(0x8000_0800, 0x1000_0000, {
                PAGE_SIZE_4KB
            })),
            Err(IpcError::MmuConfig)
        );
        assert_eq!(
            mmu.add_entry(&MmuEntry::new(0x8000_0000, 0x1000_0000, 100)),
            Err(IpcError::MmuConfig)
        );
    }

    #[test]
    fn static_entries_are_rounded() {
        let (mmu, _bus) = mmu();
        mmu.enable(&[MmuEntry::new(0x8000_0800, 0x1000_0800, 0x100)])
            .unwrap();
        assert_eq!(mmu.translate(0x8000_0801), Some(0x1000_0801));
        assert!(mmu.is_enabled());
    }

    #[test]
    fn reprogram_only_on_changed_translation() {
        let (mmu, _bus) = mmu();
        let e = MmuEntry::new(0x8000_0000, 0x1000_0000, PAGE_SIZE_4KB);
        mmu.add_entry(&e).unwrap();
        // Same translation again: no change.
        mmu.add_entry(&e).unwrap();
        assert_eq!(mmu.translate(0x8000_0000), Some(0x1000_0000));
        // Different physical: descriptor is reprogrammed.
        mmu.add_entry(&MmuEntry::new(0x8000_0000, 0x2000_0000, {
            PAGE_SIZE_4KB
        }))
        .unwrap();
        assert_eq!(mmu.translate(0x8000_0000), Some(0x2000_0000));
    }

    #[test]
    fn delete_clears_translations() {
        let (mmu, _bus) = mmu();
        let e = MmuEntry::new(0x8000_0000, 0x1000_0000, 2 * PAGE_SIZE_4KB);
        mmu.add_entry(&e).unwrap();
        mmu.delete_entry(&e).unwrap();
        assert_eq!(mmu.translate(0x8000_0000), None);
        assert_eq!(mmu.translate(0x8000_1000), None);
    }

    #[test]
    fn fault_check_reads_masks_and_clears() {
        let (mmu, bus) = mmu();
        mmu.enable(&[]).unwrap();
        assert_eq!(bus.read32(IPU_MMU_LAYOUT.irq_enable), MMU_IRQ_MASK);

        // Nothing pending: not our interrupt.
        assert_eq!(mmu.check_and_clear_fault(), None);

        bus.write32(
            IPU_MMU_LAYOUT.irq_status,
            (MmuIrq::TRANSLATION_FAULT | MmuIrq::TABLE_WALK_FAULT).bits(),
        );
        bus.write32(IPU_MMU_LAYOUT.fault_addr, 0x8100_0000);

        let info = mmu.check_and_clear_fault().unwrap();
        assert_eq!(info.fault_addr, 0x8100_0000);
        assert_eq!(
            info.status,
            MmuIrq::TRANSLATION_FAULT | MmuIrq::TABLE_WALK_FAULT
        );
        // Masked and acknowledged.
        assert_eq!(bus.read32(IPU_MMU_LAYOUT.irq_enable), 0);
    }
}
