// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Co-processor fault handling end to end: the MMU fault drives the
//! processor state machine, and notifier-driven paths unblock waiting
//! message-queue readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use abi::{IpcError, IpcResult, ProcState};
use drv_rproc::mmu::{Mmu, MmuEntry, MmuIrq, IPU_MMU_LAYOUT, PAGE_SIZE_4KB};
use drv_rproc::proc::{AttachParams, ProcEventStatus, Processor};
use drv_rproc::reset::{Core, ResetCtrl, IPU_RESET_LAYOUT};
use drv_rproc::{RegisterBus, SlaveMemory};
use ipc::messageq::FOREVER;
use test_suite::{World, PEER};

/// Register bank whose reset lines acknowledge immediately, so the
/// bring-up sequences run to completion.
struct AckBus {
    regs: Mutex<HashMap<u32, u32>>,
}

impl AckBus {
    fn new() -> Arc<Self> {
        let l = IPU_RESET_LAYOUT;
        let mut regs = HashMap::new();
        regs.insert(l.rstctrl, l.rst1 | l.rst2 | l.rst3);
        Arc::new(Self {
            regs: Mutex::new(regs),
        })
    }
}

impl RegisterBus for AckBus {
    fn read32(&self, offset: u32) -> u32 {
        *self.regs.lock().unwrap().get(&offset).unwrap_or(&0)
    }

    fn write32(&self, offset: u32, value: u32) {
        let l = IPU_RESET_LAYOUT;
        let mut regs = self.regs.lock().unwrap();
        if offset == l.rstst {
            let cur = regs.get(&l.rstst).copied().unwrap_or(0);
            regs.insert(l.rstst, cur & !value);
            return;
        }
        if offset == l.rstctrl {
            let old = regs.get(&l.rstctrl).copied().unwrap_or(0);
            let released = old & !value;
            let mut st = regs.get(&l.rstst).copied().unwrap_or(0);
            for (rst, stbit) in
                [(l.rst1, l.rst1st), (l.rst2, l.rst2st), (l.rst3, l.rst3st)]
            {
                if released & rst != 0 {
                    st |= stbit;
                }
            }
            regs.insert(l.rstst, st);
            regs.insert(l.rstctrl, value);
            return;
        }
        if offset == l.clkstctrl
            && value == drv_rproc::reset::CLKSTCTRL_SW_WKUP
        {
            regs.insert(l.clkstctrl, value | l.clkactivity);
            return;
        }
        regs.insert(offset, value);
    }
}

struct NullMem;

impl SlaveMemory for NullMem {
    fn write(&self, _proc_addr: u32, _buf: &[u8]) -> IpcResult<()> {
        Ok(())
    }
}

fn running_processor() -> (Processor, Arc<AckBus>, Arc<AckBus>) {
    let mmu_bus = AckBus::new();
    let reset_bus = AckBus::new();
    let mmu = Mmu::new(mmu_bus.clone(), IPU_MMU_LAYOUT);
    let reset = Arc::new(ResetCtrl::new(
        reset_bus.clone(),
        IPU_RESET_LAYOUT,
    ));
    let proc = Processor::new(
        PEER,
        Core::Core0,
        mmu,
        reset,
        Arc::new(NullMem),
    );
    (proc, mmu_bus, reset_bus)
}

#[test]
fn mmu_fault_notifier_literal() {
    let (proc, mmu_bus, _reset_bus) = running_processor();
    proc.attach(&AttachParams::default()).unwrap();

    let fw = drv_rproc::rprc::build(&drv_rproc::rprc::FirmwareImage {
        entry_point: 0x8000_0000,
        sections: vec![],
        mmu_map: vec![drv_rproc::rprc::MmuMapEntry {
            slave_virt: 0x8000_0000,
            master_phys: 0x1000_0000,
            size: PAGE_SIZE_4KB,
        }],
    });
    let entry = proc.load(&fw).unwrap();
    proc.start(entry).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    proc.register_notifier(
        &[ProcState::MmuFault],
        None,
        Arc::new(move |_p, _old, new, status| {
            assert_eq!(new, ProcState::MmuFault);
            assert_eq!(status, ProcEventStatus::Event);
            f.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // The mapped page translates; the faulting address does not.
    assert_eq!(proc.mmu().translate(0x8000_0000), Some(0x1000_0000));
    assert_eq!(proc.mmu().translate(0x8100_0000), None);

    // The slave touches 0x8100_0000: the MMU latches the fault.
    mmu_bus.write32(
        IPU_MMU_LAYOUT.irq_status,
        (MmuIrq::TRANSLATION_FAULT | MmuIrq::TABLE_WALK_FAULT).bits(),
    );
    mmu_bus.write32(IPU_MMU_LAYOUT.fault_addr, 0x8100_0000);

    let info = proc.mmu_fault_isr().unwrap();
    assert!(info
        .status
        .contains(MmuIrq::TRANSLATION_FAULT | MmuIrq::TABLE_WALK_FAULT));
    assert_eq!(info.fault_addr, 0x8100_0000);
    assert_eq!(proc.state(), ProcState::MmuFault);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Further MMU interrupts are masked.
    assert_eq!(mmu_bus.read32(IPU_MMU_LAYOUT.irq_enable), 0);
}

#[test]
fn fault_unblocks_pending_get() {
    // A host-side reader blocks on its queue; the peer faults; the fault
    // notifier posts an unblock so the reader can give up cleanly.
    let world = World::new();
    let q = Arc::new(
        world
            .host
            .mq
            .create(Some("Q0"), &Default::default())
            .unwrap(),
    );

    let (proc, mmu_bus, _reset_bus) = running_processor();
    proc.attach(&AttachParams {
        boot_mode: abi::BootMode::NoBoot,
    })
    .unwrap();

    let q_for_notify = q.clone();
    proc.register_notifier(
        &[ProcState::MmuFault, ProcState::Watchdog],
        None,
        Arc::new(move |_p, _old, _new, _status| {
            q_for_notify.unblock();
        }),
    );

    let reader = {
        let q = q.clone();
        std::thread::spawn(move || q.get(FOREVER))
    };
    std::thread::sleep(Duration::from_millis(40));

    proc.mmu().enable(&[]).unwrap();
    mmu_bus.write32(
        IPU_MMU_LAYOUT.irq_status,
        MmuIrq::TRANSLATION_FAULT.bits(),
    );
    mmu_bus.write32(IPU_MMU_LAYOUT.fault_addr, 0x8200_0000);
    assert!(proc.mmu_fault_isr().is_some());

    assert_eq!(reader.join().unwrap().err(), Some(IpcError::Unblocked));

    // Only stop recovers the processor.
    proc.stop().unwrap();
    assert_eq!(proc.state(), ProcState::Reset);
}

#[test]
fn watchdog_and_timeout_notifiers() {
    let (proc, _mmu_bus, _reset_bus) = running_processor();
    proc.attach(&AttachParams {
        boot_mode: abi::BootMode::NoBoot,
    })
    .unwrap();

    let timeouts = Arc::new(AtomicUsize::new(0));
    let t = timeouts.clone();
    proc.register_notifier(
        &[ProcState::Reset],
        Some(Duration::from_millis(20)),
        Arc::new(move |_p, _old, _new, status| {
            assert_eq!(status, ProcEventStatus::Timeout);
            t.fetch_add(1, Ordering::SeqCst);
        }),
    );

    proc.watchdog_isr();
    assert_eq!(proc.state(), ProcState::Watchdog);

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
}
