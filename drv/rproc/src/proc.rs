// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The co-processor life-cycle state machine.
//!
//! ```text
//! Unknown -> Powered -> Loaded -> Running <-> Suspended
//!                 \         \        |
//!                  Reset     Mmu_Fault / Watchdog / Error
//! ```
//!
//! `attach` enters the machine according to the boot mode; `start` and
//! `stop` drive the reset controller; the MMU fault and watchdog paths
//! park the processor in their terminal states until `stop`/`detach`.
//!
//! State changes fire registered notifiers. A notifier may carry a
//! timeout: if the awaited state never arrives, the callback fires once
//! with `Timeout` status and the registration is cancelled. Deadlines are
//! watched by a small worker thread owned by the processor object.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use abi::{BootMode, IpcError, IpcResult, ProcId, ProcState};
use ringbuf::{ringbuf, ringbuf_entry};

use crate::mmu::{FaultInfo, Mmu};
use crate::reset::{Core, ResetCmd, ResetCtrl};
use crate::{rprc, SlaveMemory};

/// Why a notifier fired.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcEventStatus {
    /// The awaited state transition happened.
    Event,
    /// The registration's timeout lapsed first.
    Timeout,
}

/// Notifier callback: `(proc, old_state, new_state, status)`.
pub type ProcNotifier =
    Arc<dyn Fn(ProcId, ProcState, ProcState, ProcEventStatus) + Send + Sync>;

/// Handle identifying one registration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotifierId(u64);

/// Parameters for [`Processor::attach`].
#[derive(Copy, Clone, Debug)]
pub struct AttachParams {
    pub boot_mode: BootMode,
}

impl Default for AttachParams {
    fn default() -> Self {
        Self {
            boot_mode: BootMode::Boot,
        }
    }
}

struct NotifierReg {
    id: NotifierId,
    states: Vec<ProcState>,
    deadline: Option<Instant>,
    cb: ProcNotifier,
}

struct Inner {
    state: ProcState,
    entry_point: Option<u32>,
    notifiers: Vec<NotifierReg>,
    next_id: u64,
    shutdown: bool,
}

struct Shared {
    proc_id: ProcId,
    inner: Mutex<Inner>,
    cv: Condvar,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    State { old: ProcState, new: ProcState },
    Loaded { entry: u32 },
    Fault { addr: u32 },
    Watchdog,
    NotifierTimeout,
}

ringbuf!(Trace, 32, Trace::None);

/// One managed co-processor.
pub struct Processor {
    shared: Arc<Shared>,
    core: Core,
    mmu: Arc<Mmu>,
    reset: Arc<ResetCtrl>,
    slave: Arc<dyn SlaveMemory>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Processor {
    pub fn new(
        proc_id: ProcId,
        core: Core,
        mmu: Arc<Mmu>,
        reset: Arc<ResetCtrl>,
        slave: Arc<dyn SlaveMemory>,
    ) -> Self {
        let shared = Arc::new(Shared {
            proc_id,
            inner: Mutex::new(Inner {
                state: ProcState::Unknown,
                entry_point: None,
                notifiers: Vec::new(),
                next_id: 1,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let worker = spawn_deadline_worker(shared.clone());
        Self {
            shared,
            core,
            mmu,
            reset,
            slave,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn proc_id(&self) -> ProcId {
        self.shared.proc_id
    }

    pub fn mmu(&self) -> &Arc<Mmu> {
        &self.mmu
    }

    pub fn state(&self) -> ProcState {
        self.shared.inner.lock().unwrap().state
    }

    /// Brings the processor under management. The entry state depends on
    /// the boot mode: a processor we will load starts `Powered`, one with
    /// resident firmware starts `Loaded`, and an already-running one
    /// starts `Running`.
    pub fn attach(&self, params: &AttachParams) -> IpcResult<()> {
        if self.state() != ProcState::Unknown {
            return Err(IpcError::InvalidState);
        }
        let next = match params.boot_mode {
            BootMode::Boot => {
                // Hold the core in reset until firmware is in place.
                self.reset.control(self.core, ResetCmd::Reset)?;
                ProcState::Powered
            }
            BootMode::NoLoad => ProcState::Loaded,
            BootMode::NoBoot => ProcState::Running,
        };
        self.set_state(next);
        Ok(())
    }

    /// Parses `firmware`, brings the MMU block out of reset, programs the
    /// boot-time map, and writes the sections. Returns the entry point.
    pub fn load(&self, firmware: &[u8]) -> IpcResult<u32> {
        if self.state() != ProcState::Powered {
            return Err(IpcError::InvalidState);
        }
        let image = rprc::parse(firmware)?;

        self.reset.control(self.core, ResetCmd::MmuReset)?;
        self.reset.control(self.core, ResetCmd::MmuRelease)?;
        self.mmu.enable(&image.boot_map())?;
        rprc::load(&image, &*self.slave)?;

        self.shared.inner.lock().unwrap().entry_point =
            Some(image.entry_point);
        ringbuf_entry!(Trace::Loaded {
            entry: image.entry_point
        });
        self.set_state(ProcState::Loaded);
        Ok(image.entry_point)
    }

    /// Releases the core's reset and lets it run from `entry_point`.
    pub fn start(&self, entry_point: u32) -> IpcResult<()> {
        if self.state() != ProcState::Loaded {
            return Err(IpcError::InvalidState);
        }
        self.shared.inner.lock().unwrap().entry_point = Some(entry_point);
        self.reset.control(self.core, ResetCmd::Release)?;
        self.set_state(ProcState::Running);
        Ok(())
    }

    /// Puts the core back into reset. Legal from `Running` and from each
    /// of the fault states; this is the only way out of them.
    pub fn stop(&self) -> IpcResult<()> {
        match self.state() {
            ProcState::Running
            | ProcState::Suspended
            | ProcState::MmuFault
            | ProcState::Watchdog
            | ProcState::Error => {}
            _ => return Err(IpcError::InvalidState),
        }
        self.reset.control(self.core, ResetCmd::Reset)?;
        self.set_state(ProcState::Reset);
        Ok(())
    }

    pub fn suspend(&self) -> IpcResult<()> {
        if self.state() != ProcState::Running {
            return Err(IpcError::InvalidState);
        }
        self.set_state(ProcState::Suspended);
        Ok(())
    }

    pub fn resume(&self) -> IpcResult<()> {
        if self.state() != ProcState::Suspended {
            return Err(IpcError::InvalidState);
        }
        self.set_state(ProcState::Running);
        Ok(())
    }

    /// Detaches unconditionally: the MMU is masked and the machine
    /// returns to `Unknown`.
    pub fn detach(&self) {
        self.mmu.disable();
        self.set_state(ProcState::Unknown);
    }

    /// MMU fault interrupt entry point. When the MMU reports a pending
    /// fault, the processor transitions to `MmuFault` (firing notifiers)
    /// and the decoded fault is returned.
    pub fn mmu_fault_isr(&self) -> Option<FaultInfo> {
        let info = self.mmu.check_and_clear_fault()?;
        ringbuf_entry!(Trace::Fault {
            addr: info.fault_addr
        });
        self.set_state(ProcState::MmuFault);
        Some(info)
    }

    /// Watchdog interrupt entry point.
    pub fn watchdog_isr(&self) {
        ringbuf_entry!(Trace::Watchdog);
        self.set_state(ProcState::Watchdog);
    }

    /// Registers `cb` for transitions into any of `states`, optionally
    /// with a timeout after which it fires once with `Timeout` status and
    /// is dropped.
    pub fn register_notifier(
        &self,
        states: &[ProcState],
        timeout: Option<Duration>,
        cb: ProcNotifier,
    ) -> NotifierId {
        let mut inner = self.shared.inner.lock().unwrap();
        let id = NotifierId(inner.next_id);
        inner.next_id += 1;
        inner.notifiers.push(NotifierReg {
            id,
            states: states.to_vec(),
            deadline: timeout.map(|t| Instant::now() + t),
            cb,
        });
        drop(inner);
        self.shared.cv.notify_all();
        id
    }

    pub fn unregister_notifier(&self, id: NotifierId) -> IpcResult<()> {
        let mut inner = self.shared.inner.lock().unwrap();
        let before = inner.notifiers.len();
        inner.notifiers.retain(|r| r.id != id);
        if inner.notifiers.len() == before {
            return Err(IpcError::NotFound);
        }
        Ok(())
    }

    fn set_state(&self, new: ProcState) {
        let (old, fired) = {
            let mut inner = self.shared.inner.lock().unwrap();
            let old = inner.state;
            if old == new {
                return;
            }
            inner.state = new;
            let mut fired = Vec::new();
            for reg in &mut inner.notifiers {
                if reg.states.contains(&new) {
                    // The awaited event arrived; its timeout no longer
                    // applies.
                    reg.deadline = None;
                    fired.push(reg.cb.clone());
                }
            }
            (old, fired)
        };
        ringbuf_entry!(Trace::State { old, new });
        for cb in fired {
            cb(self.shared.proc_id, old, new, ProcEventStatus::Event);
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.shutdown = true;
        }
        self.shared.cv.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

/// Watches notifier deadlines. Parked whenever none are armed.
fn spawn_deadline_worker(shared: Arc<Shared>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut inner = shared.inner.lock().unwrap();
        loop {
            if inner.shutdown {
                return;
            }
            let now = Instant::now();
            let mut fired = Vec::new();
            inner.notifiers.retain(|r| {
                if r.deadline.is_some_and(|d| d <= now) {
                    fired.push(r.cb.clone());
                    false
                } else {
                    true
                }
            });
            if !fired.is_empty() {
                let state = inner.state;
                drop(inner);
                ringbuf_entry!(Trace::NotifierTimeout);
                for cb in fired {
                    cb(
                        shared.proc_id,
                        state,
                        state,
                        ProcEventStatus::Timeout,
                    );
                }
                inner = shared.inner.lock().unwrap();
                continue;
            }

            let next = inner
                .notifiers
                .iter()
                .filter_map(|r| r.deadline)
                .min();
            inner = match next {
                None => shared.cv.wait(inner).unwrap(),
                Some(dl) => {
                    let dur = dl.saturating_duration_since(Instant::now());
                    shared.cv.wait_timeout(inner, dur).unwrap().0
                }
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::{IPU_MMU_LAYOUT, MmuEntry, MmuIrq, PAGE_SIZE_4KB};
    use crate::reset::test_support::{AckBus, FakeTimer};
    use crate::reset::IPU_RESET_LAYOUT;
    use crate::RegisterBus;
    use crate::rprc::{FirmwareImage, MmuMapEntry, Section};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FlatBus {
        regs: Mutex<HashMap<u32, u32>>,
    }

    impl crate::RegisterBus for FlatBus {
        fn read32(&self, offset: u32) -> u32 {
            *self.regs.lock().unwrap().get(&offset).unwrap_or(&0)
        }
        fn write32(&self, offset: u32, value: u32) {
            self.regs.lock().unwrap().insert(offset, value);
        }
    }

    /// Records loader writes; stands in for the mapped co-processor
    /// memory.
    struct FakeMem {
        writes: Mutex<Vec<(u32, Vec<u8>)>>,
    }

    impl SlaveMemory for FakeMem {
        fn write(&self, proc_addr: u32, buf: &[u8]) -> IpcResult<()> {
            self.writes
                .lock()
                .unwrap()
                .push((proc_addr, buf.to_vec()));
            Ok(())
        }
    }

    fn processor() -> (Processor, Arc<FakeMem>, Arc<FlatBus>) {
        let mmu_bus = Arc::new(FlatBus {
            regs: Mutex::new(HashMap::new()),
        });
        let mmu = Mmu::new(mmu_bus.clone(), IPU_MMU_LAYOUT);
        let reset_bus = Arc::new(AckBus::new(IPU_RESET_LAYOUT));
        let reset = Arc::new(
            ResetCtrl::new(reset_bus, IPU_RESET_LAYOUT)
                .with_timer(Core::Core0, Arc::new(FakeTimer::default())),
        );
        let mem = Arc::new(FakeMem {
            writes: Mutex::new(Vec::new()),
        });
        let proc =
            Processor::new(ProcId(1), Core::Core0, mmu, reset, mem.clone());
        (proc, mem, mmu_bus)
    }

    fn firmware() -> Vec<u8> {
        rprc::build(&FirmwareImage {
            entry_point: 0x8000_0040,
            sections: vec![Section {
                addr: 0x8000_0000,
                data: vec![0xEE; 32],
            }],
            mmu_map: vec![MmuMapEntry {
                slave_virt: 0x8000_0000,
                master_phys: 0x1000_0000,
                size: PAGE_SIZE_4KB,
            }],
        })
    }

    #[test]
    fn boot_flow() {
        let (proc, mem, _mmu_bus) = processor();
        assert_eq!(proc.state(), ProcState::Unknown);
        assert_eq!(proc.start(0), Err(IpcError::InvalidState));

        proc.attach(&AttachParams::default()).unwrap();
        assert_eq!(proc.state(), ProcState::Powered);
        assert_eq!(
            proc.attach(&AttachParams::default()),
            Err(IpcError::InvalidState)
        );

        let entry = proc.load(&firmware()).unwrap();
        assert_eq!(entry, 0x8000_0040);
        assert_eq!(proc.state(), ProcState::Loaded);
        assert_eq!(mem.writes.lock().unwrap().len(), 1);
        // The boot map is live.
        assert_eq!(proc.mmu().translate(0x8000_0010), Some(0x1000_0010));

        proc.start(entry).unwrap();
        assert_eq!(proc.state(), ProcState::Running);

        proc.stop().unwrap();
        assert_eq!(proc.state(), ProcState::Reset);

        proc.detach();
        assert_eq!(proc.state(), ProcState::Unknown);
        assert!(!proc.mmu().is_enabled());
    }

    #[test]
    fn no_boot_modes() {
        let (proc, _mem, _bus) = processor();
        proc.attach(&AttachParams {
            boot_mode: BootMode::NoBoot,
        })
        .unwrap();
        assert_eq!(proc.state(), ProcState::Running);
        proc.suspend().unwrap();
        assert_eq!(proc.state(), ProcState::Suspended);
        proc.resume().unwrap();
        proc.detach();

        proc.attach(&AttachParams {
            boot_mode: BootMode::NoLoad,
        })
        .unwrap();
        assert_eq!(proc.state(), ProcState::Loaded);
    }

    #[test]
    fn fault_parks_processor_and_notifies_once() {
        let (proc, _mem, mmu_bus) = processor();
        proc.attach(&AttachParams::default()).unwrap();
        let entry = proc.load(&firmware()).unwrap();
        proc.start(entry).unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        proc.register_notifier(
            &[ProcState::MmuFault],
            None,
            Arc::new(move |p, old, new, status| {
                assert_eq!(p, ProcId(1));
                assert_eq!(old, ProcState::Running);
                assert_eq!(new, ProcState::MmuFault);
                assert_eq!(status, ProcEventStatus::Event);
                f.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // An access outside the single mapped page.
        assert_eq!(proc.mmu().translate(0x8100_0000), None);
        mmu_bus.write32(
            IPU_MMU_LAYOUT.irq_status,
            (MmuIrq::TRANSLATION_FAULT | MmuIrq::TABLE_WALK_FAULT).bits(),
        );
        mmu_bus.write32(IPU_MMU_LAYOUT.fault_addr, 0x8100_0000);

        let info = proc.mmu_fault_isr().unwrap();
        assert_eq!(info.fault_addr, 0x8100_0000);
        assert!(info.status.contains(MmuIrq::TRANSLATION_FAULT));
        assert_eq!(proc.state(), ProcState::MmuFault);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Only stop leads out of the fault state.
        assert_eq!(proc.start(0), Err(IpcError::InvalidState));
        proc.stop().unwrap();
        assert_eq!(proc.state(), ProcState::Reset);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dynamic_mmu_entry_rules() {
        let (proc, _mem, _bus) = processor();
        proc.mmu()
            .add_entry(&MmuEntry::new(0x9000_0000, 0x2000_0000, {
                PAGE_SIZE_4KB
            }))
            .unwrap();
        assert_eq!(
            proc.mmu().add_entry(&MmuEntry::new(
                0x9000_0100,
                0x2000_0000,
                PAGE_SIZE_4KB
            )),
            Err(IpcError::MmuConfig)
        );
    }

    #[test]
    fn notifier_timeout_fires_and_cancels() {
        let (proc, _mem, _bus) = processor();
        let fired = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let (f, t) = (fired.clone(), timeouts.clone());
        let id = proc.register_notifier(
            &[ProcState::Running],
            Some(Duration::from_millis(20)),
            Arc::new(move |_p, _old, _new, status| match status {
                ProcEventStatus::Event => {
                    f.fetch_add(1, Ordering::SeqCst);
                }
                ProcEventStatus::Timeout => {
                    t.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // The registration was cancelled by the timeout.
        assert_eq!(
            proc.unregister_notifier(id),
            Err(IpcError::NotFound)
        );
    }

    #[test]
    fn watchdog_is_terminal_until_stop() {
        let (proc, _mem, _bus) = processor();
        proc.attach(&AttachParams {
            boot_mode: BootMode::NoBoot,
        })
        .unwrap();
        proc.watchdog_isr();
        assert_eq!(proc.state(), ProcState::Watchdog);
        assert_eq!(proc.resume(), Err(IpcError::InvalidState));
        proc.stop().unwrap();
    }
}
