// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reset-line and clock sequencing for a two-core co-processor subsystem.
//!
//! The subsystem exposes three reset lines: RST1 and RST2 hold the two
//! M-class cores, RST3 holds the shared cache/MMU block. Each core also
//! leans on one general-purpose timer that must be running before its
//! reset is released. The sequences here mirror the part's bring-up
//! requirements; every hardware acknowledge is polled a bounded number of
//! times and exhaustion is fatal.
//!
//! Reset status registers are write-to-clear: writing a set bit clears it.

use std::sync::Arc;

use abi::{IpcError, IpcResult};
use ringbuf::{ringbuf, ringbuf_entry};
use serde::{Deserialize, Serialize};

use crate::{bounded_poll, RegisterBus};

/// Module-mode values for the clock-control register.
pub const MODULEMODE_DISABLE: u32 = 0x0;
pub const MODULEMODE_HWAUTO: u32 = 0x1;

/// Clock-domain transition controls.
pub const CLKSTCTRL_SW_WKUP: u32 = 0x2;
pub const CLKSTCTRL_HW_AUTO: u32 = 0x3;

/// Register offsets and bit masks of one subsystem's reset/clock block.
/// Per-SoC data.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct ResetRegLayout {
    pub rstctrl: u32,
    pub rstst: u32,
    pub clkctrl: u32,
    pub clkstctrl: u32,
    pub rst1: u32,
    pub rst2: u32,
    pub rst3: u32,
    pub rst1st: u32,
    pub rst2st: u32,
    pub rst3st: u32,
    pub clkactivity: u32,
}

/// The layout of the media-processor subsystem this driver grew up on.
pub const IPU_RESET_LAYOUT: ResetRegLayout = ResetRegLayout {
    rstctrl: 0x910,
    rstst: 0x914,
    clkctrl: 0x920,
    clkstctrl: 0x900,
    rst1: 1 << 0,
    rst2: 1 << 1,
    rst3: 1 << 2,
    rst1st: 1 << 0,
    rst2st: 1 << 1,
    rst3st: 1 << 2,
    clkactivity: 1 << 8,
};

/// The general-purpose timer a core depends on.
pub trait CoreTimer: Send + Sync {
    fn enable(&self) -> IpcResult<()>;
    fn disable(&self);
    fn start(&self);
    fn stop(&self);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Core {
    Core0,
    Core1,
}

impl Core {
    fn index(self) -> usize {
        match self {
            Core::Core0 => 0,
            Core::Core1 => 1,
        }
    }
}

/// Reset control commands.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ResetCmd {
    /// Assert the core's reset and park its timer.
    Reset,
    /// Assert the cache/MMU reset and gate the subsystem clock.
    MmuReset,
    /// Bring the subsystem clock up and release the cache/MMU reset.
    MmuRelease,
    /// Start the core's timer and release the core's reset.
    Release,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Cmd { core: u8, cmd: ResetCmd },
    StatusCleared,
    ClockActive,
    Released { mask: u32 },
    PollExpired { offset: u32 },
}

ringbuf!(Trace, 32, Trace::None);

/// Reset controller for one subsystem.
pub struct ResetCtrl {
    bus: Arc<dyn RegisterBus>,
    layout: ResetRegLayout,
    timers: [Option<Arc<dyn CoreTimer>>; 2],
}

impl ResetCtrl {
    pub fn new(bus: Arc<dyn RegisterBus>, layout: ResetRegLayout) -> Self {
        Self {
            bus,
            layout,
            timers: [None, None],
        }
    }

    /// Installs the timer backing `core`.
    pub fn with_timer(
        mut self,
        core: Core,
        timer: Arc<dyn CoreTimer>,
    ) -> Self {
        self.timers[core.index()] = Some(timer);
        self
    }

    fn core_bits(&self, core: Core) -> (u32, u32) {
        match core {
            Core::Core0 => (self.layout.rst1, self.layout.rst1st),
            Core::Core1 => (self.layout.rst2, self.layout.rst2st),
        }
    }

    /// Runs one reset control command.
    pub fn control(&self, core: Core, cmd: ResetCmd) -> IpcResult<()> {
        ringbuf_entry!(Trace::Cmd {
            core: core.index() as u8,
            cmd,
        });
        match cmd {
            ResetCmd::Reset => self.reset(core),
            ResetCmd::MmuReset => self.mmu_reset(core),
            ResetCmd::MmuRelease => self.mmu_release(core),
            ResetCmd::Release => self.release(core),
        }
    }

    fn reset(&self, core: Core) -> IpcResult<()> {
        let (rst, _) = self.core_bits(core);
        self.bus.set_bits(self.layout.rstctrl, rst);
        if let Some(timer) = &self.timers[core.index()] {
            timer.stop();
            timer.disable();
        }
        Ok(())
    }

    fn mmu_reset(&self, core: Core) -> IpcResult<()> {
        // The cache/MMU block is shared; only the first core's sequence
        // touches it.
        if core != Core::Core0 {
            return Ok(());
        }
        self.bus.set_bits(self.layout.rstctrl, self.layout.rst3);
        self.bus.write32(self.layout.clkctrl, MODULEMODE_DISABLE);
        Ok(())
    }

    fn mmu_release(&self, core: Core) -> IpcResult<()> {
        if core != Core::Core0 {
            return Ok(());
        }
        let l = &self.layout;

        // Stale reset status would make later acks unreadable; clear it
        // first and wait for the clear to take.
        let st = self.bus.read32(l.rstst);
        if st != 0 {
            self.bus.write32(l.rstst, st);
            if !bounded_poll(|| self.bus.read32(l.rstst) == 0) {
                ringbuf_entry!(Trace::PollExpired { offset: l.rstst });
                return Err(IpcError::OsFailure);
            }
            ringbuf_entry!(Trace::StatusCleared);
        }

        // Hand the module to hardware management and force the domain
        // awake until the clock is observably running.
        self.bus.write32(l.clkctrl, MODULEMODE_HWAUTO);
        self.bus.write32(l.clkstctrl, CLKSTCTRL_SW_WKUP);
        if !bounded_poll(|| self.bus.test_bits(l.clkstctrl, l.clkactivity))
        {
            ringbuf_entry!(Trace::PollExpired {
                offset: l.clkstctrl
            });
            return Err(IpcError::OsFailure);
        }
        ringbuf_entry!(Trace::ClockActive);

        // Releasing RST3 is only meaningful with every line still
        // asserted; repair the control register if something disturbed
        // it.
        let all = l.rst1 | l.rst2 | l.rst3;
        if self.bus.read32(l.rstctrl) != all {
            self.bus.write32(l.rstctrl, all);
            if !bounded_poll(|| {
                self.bus.read32(l.rstctrl) & all == all
            }) {
                ringbuf_entry!(Trace::PollExpired { offset: l.rstctrl });
                return Err(IpcError::OsFailure);
            }
        }

        // De-assert RST3, wait for the acknowledge, clear the ack bit.
        self.bus.clear_bits(l.rstctrl, l.rst3);
        if !bounded_poll(|| self.bus.test_bits(l.rstst, l.rst3st)) {
            ringbuf_entry!(Trace::PollExpired { offset: l.rstst });
            return Err(IpcError::OsFailure);
        }
        self.bus.write32(l.rstst, l.rst3st);
        ringbuf_entry!(Trace::Released { mask: l.rst3 });
        Ok(())
    }

    fn release(&self, core: Core) -> IpcResult<()> {
        let l = &self.layout;
        let (rst, rstst) = self.core_bits(core);

        if let Some(timer) = &self.timers[core.index()] {
            timer.enable()?;
            timer.start();
        }

        self.bus.clear_bits(l.rstctrl, rst);
        if !bounded_poll(|| self.bus.test_bits(l.rstst, rstst)) {
            ringbuf_entry!(Trace::PollExpired { offset: l.rstst });
            return Err(IpcError::OsFailure);
        }
        self.bus.write32(l.rstst, rstst);

        if core == Core::Core0 {
            // Once the first core runs, the domain can fall back to
            // hardware-managed transitions.
            self.bus.write32(l.clkstctrl, CLKSTCTRL_HW_AUTO);
        }
        ringbuf_entry!(Trace::Released { mask: rst });
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Register bank that models the subsystem's acknowledge behavior:
    /// clearing a reset bit raises its status bit, waking the clock
    /// domain raises the activity bit, and the status register is
    /// write-to-clear.
    pub(crate) struct AckBus {
        regs: Mutex<HashMap<u32, u32>>,
        layout: ResetRegLayout,
    }

    impl AckBus {
        pub(crate) fn new(layout: ResetRegLayout) -> Self {
            let mut regs = HashMap::new();
            // Everything held in reset at power-on.
            regs.insert(
                layout.rstctrl,
                layout.rst1 | layout.rst2 | layout.rst3,
            );
            Self {
                regs: Mutex::new(regs),
                layout,
            }
        }
    }

    impl RegisterBus for AckBus {
        fn read32(&self, offset: u32) -> u32 {
            *self.regs.lock().unwrap().get(&offset).unwrap_or(&0)
        }

        fn write32(&self, offset: u32, value: u32) {
            let l = self.layout;
            let mut regs = self.regs.lock().unwrap();
            if offset == l.rstst {
                // Write-to-clear.
                let cur = regs.get(&l.rstst).copied().unwrap_or(0);
                regs.insert(l.rstst, cur & !value);
                return;
            }
            if offset == l.rstctrl {
                // A 1->0 edge on a reset line raises its status bit.
                let old = regs.get(&l.rstctrl).copied().unwrap_or(0);
                let released = old & !value;
                let mut st = regs.get(&l.rstst).copied().unwrap_or(0);
                if released & l.rst1 != 0 {
                    st |= l.rst1st;
                }
                if released & l.rst2 != 0 {
                    st |= l.rst2st;
                }
                if released & l.rst3 != 0 {
                    st |= l.rst3st;
                }
                regs.insert(l.rstst, st);
                regs.insert(l.rstctrl, value);
                return;
            }
            if offset == l.clkstctrl && value == CLKSTCTRL_SW_WKUP {
                regs.insert(l.clkstctrl, value | l.clkactivity);
                return;
            }
            regs.insert(offset, value);
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeTimer {
        pub(crate) enables: AtomicU32,
        pub(crate) starts: AtomicU32,
        pub(crate) stops: AtomicU32,
    }

    impl CoreTimer for FakeTimer {
        fn enable(&self) -> IpcResult<()> {
            self.enables.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn disable(&self) {}
        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{AckBus, FakeTimer};
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Mutex;

    fn ctrl() -> (ResetCtrl, Arc<AckBus>, Arc<FakeTimer>) {
        let bus = Arc::new(AckBus::new(IPU_RESET_LAYOUT));
        let timer = Arc::new(FakeTimer::default());
        let ctrl = ResetCtrl::new(bus.clone(), IPU_RESET_LAYOUT)
            .with_timer(Core::Core0, timer.clone());
        (ctrl, bus, timer)
    }

    #[test]
    fn full_bringup_sequence() {
        let (ctrl, bus, timer) = ctrl();
        let l = IPU_RESET_LAYOUT;

        ctrl.control(Core::Core0, ResetCmd::MmuReset).unwrap();
        ctrl.control(Core::Core0, ResetCmd::MmuRelease).unwrap();
        // RST3 released, ack consumed, clock module in hardware-auto.
        assert_eq!(bus.read32(l.rstctrl) & l.rst3, 0);
        assert_eq!(bus.read32(l.rstst) & l.rst3st, 0);
        assert_eq!(bus.read32(l.clkctrl), MODULEMODE_HWAUTO);

        ctrl.control(Core::Core0, ResetCmd::Release).unwrap();
        assert_eq!(bus.read32(l.rstctrl) & l.rst1, 0);
        assert_eq!(bus.read32(l.rstst) & l.rst1st, 0);
        assert_eq!(bus.read32(l.clkstctrl), CLKSTCTRL_HW_AUTO);
        assert_eq!(timer.enables.load(Ordering::SeqCst), 1);
        assert_eq!(timer.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_reasserts_and_parks_timer() {
        let (ctrl, bus, timer) = ctrl();
        let l = IPU_RESET_LAYOUT;
        ctrl.control(Core::Core0, ResetCmd::MmuReset).unwrap();
        ctrl.control(Core::Core0, ResetCmd::MmuRelease).unwrap();
        ctrl.control(Core::Core0, ResetCmd::Release).unwrap();

        ctrl.control(Core::Core0, ResetCmd::Reset).unwrap();
        assert_ne!(bus.read32(l.rstctrl) & l.rst1, 0);
        assert_eq!(timer.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_core_skips_mmu_lines() {
        let (ctrl, bus, _timer) = ctrl();
        let l = IPU_RESET_LAYOUT;
        let before = bus.read32(l.rstctrl);
        ctrl.control(Core::Core1, ResetCmd::MmuReset).unwrap();
        ctrl.control(Core::Core1, ResetCmd::MmuRelease).unwrap();
        assert_eq!(bus.read32(l.rstctrl), before);

        ctrl.control(Core::Core1, ResetCmd::Release).unwrap();
        assert_eq!(bus.read32(l.rstctrl) & l.rst2, 0);
        assert_eq!(bus.read32(l.rstst) & l.rst2st, 0);
    }

    /// A bank that never raises acknowledge bits: every bounded poll must
    /// expire into `OsFailure`.
    struct DeadBus {
        regs: Mutex<HashMap<u32, u32>>,
    }

    impl RegisterBus for DeadBus {
        fn read32(&self, offset: u32) -> u32 {
            *self.regs.lock().unwrap().get(&offset).unwrap_or(&0)
        }
        fn write32(&self, offset: u32, value: u32) {
            self.regs.lock().unwrap().insert(offset, value);
        }
    }

    #[test]
    fn dead_hardware_is_os_failure() {
        let bus = Arc::new(DeadBus {
            regs: Mutex::new(HashMap::new()),
        });
        let ctrl = ResetCtrl::new(bus, IPU_RESET_LAYOUT);
        assert_eq!(
            ctrl.control(Core::Core0, ResetCmd::MmuRelease),
            Err(IpcError::OsFailure)
        );
        assert_eq!(
            ctrl.control(Core::Core0, ResetCmd::Release),
            Err(IpcError::OsFailure)
        );
    }
}
