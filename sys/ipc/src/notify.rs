// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-line, per-event callback demultiplexer.
//!
//! Each `(peer, interrupt line)` pair carries a small number of event ids.
//! Registration installs a callback for one event, either exclusively
//! (single mode) or as one of several listeners behind a fan-out shim.
//! The line's driver proxy does the actual signalling; this module owns the
//! registration state and the local dispatch.
//!
//! A note about delivery ordering: the registration functions modify state
//! that the delivery path ([`Notify::exec`], run from the driver's
//! interrupt context) reads. To keep delivery from ever observing a
//! half-installed registration, state changes follow a strict order:
//!
//! - registering: add to the event list, install the callback, and only
//!   then enable the event at the driver, opening the gate for incoming
//!   interrupts;
//! - unregistering: the same steps in reverse, so the possibility of an
//!   incoming interrupt is gone before local state is taken apart.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use abi::{IpcError, IpcResult, ProcId};
use ringbuf::{ringbuf, ringbuf_entry};
use serde::{Deserialize, Serialize};

use crate::multiproc::MultiProc;

/// Events per line.
pub const NUM_EVENTS: u16 = 32;

/// Key that must accompany a reserved event id (in the upper 16 bits of the
/// 32-bit event argument) for the registration to be accepted.
pub const SYSTEM_KEY: u16 = 0xC1D2;

/// Builds the 32-bit event argument for a reserved (system) event.
pub const fn system_event(event: u16) -> u32 {
    (SYSTEM_KEY as u32) << 16 | event as u32
}

/// Callback invoked on event delivery: `(src_proc, line_id, event_id,
/// payload)`.
pub type EventCallback = Arc<dyn Fn(ProcId, u16, u16, u32) + Send + Sync>;

/// Handle identifying one listener installed by
/// [`Notify::register_event`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ListenerId(u64);

/// Driver proxy for one `(peer, line)`. Implementations wrap the actual
/// interrupt plumbing (mailbox, doorbell, in-process loopback in tests).
pub trait NotifyDriver: Send + Sync {
    fn register_event(&self, event: u16) -> IpcResult<()>;
    fn unregister_event(&self, event: u16);
    /// May block when `wait_clear` is set and the previous event has not
    /// been consumed.
    fn send_event(
        &self,
        event: u16,
        payload: u32,
        wait_clear: bool,
    ) -> IpcResult<()>;
    fn disable(&self);
    fn enable(&self);
    fn disable_event(&self, event: u16);
    fn enable_event(&self, event: u16);
}

/// Driver that signals nothing. Stands in for the loopback driver on the
/// local processor's own line, where delivery is synchronous in
/// `send_event`.
pub struct NullDriver;

impl NotifyDriver for NullDriver {
    fn register_event(&self, _event: u16) -> IpcResult<()> {
        Ok(())
    }
    fn unregister_event(&self, _event: u16) {}
    fn send_event(
        &self,
        _event: u16,
        _payload: u32,
        _wait_clear: bool,
    ) -> IpcResult<()> {
        Ok(())
    }
    fn disable(&self) {}
    fn enable(&self) {}
    fn disable_event(&self, _event: u16) {}
    fn enable_event(&self, _event: u16) {}
}

/// Module configuration.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Interrupt lines per peer.
    pub num_lines: u16,
    /// Event ids below this are reserved for system use and require
    /// [`SYSTEM_KEY`].
    pub reserved_events: u16,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            num_lines: 1,
            reserved_events: 0,
        }
    }
}

enum Slot {
    Single(EventCallback),
    Many(Vec<(ListenerId, EventCallback)>),
}

struct LineState {
    driver: Arc<dyn NotifyDriver>,
    slots: [Option<Slot>; NUM_EVENTS as usize],
    /// Depth of `disable` nesting; events deliver only at zero.
    nesting: u32,
}

#[derive(Copy, Clone, PartialEq)]
enum Trace {
    None,
    Registered { proc: u16, line: u16, event: u16 },
    Unregistered { proc: u16, line: u16, event: u16 },
    Sent { proc: u16, event: u16 },
    Delivered { event: u16, payload: u32 },
    DroppedNoListener { event: u16 },
}

ringbuf!(Trace, 64, Trace::None);

/// The notify module.
pub struct Notify {
    multiproc: Arc<MultiProc>,
    config: NotifyConfig,
    /// Indexed `[cluster][line]`.
    lines: Mutex<Vec<Vec<Option<LineState>>>>,
    /// Module-wide enable mask for locally delivered events.
    enable_mask: AtomicU32,
    next_listener: AtomicU64,
}

impl Notify {
    pub fn setup(
        multiproc: Arc<MultiProc>,
        config: NotifyConfig,
    ) -> IpcResult<Arc<Self>> {
        if config.num_lines == 0 || config.reserved_events > NUM_EVENTS {
            return Err(IpcError::InvalidArg);
        }
        let clusters = usize::from(multiproc.num_procs_in_cluster());
        let mut lines = Vec::with_capacity(clusters);
        for _ in 0..clusters {
            let mut per_line =
                Vec::with_capacity(usize::from(config.num_lines));
            per_line.resize_with(usize::from(config.num_lines), || None);
            lines.push(per_line);
        }
        Ok(Arc::new(Self {
            multiproc,
            config,
            lines: Mutex::new(lines),
            enable_mask: AtomicU32::new(u32::MAX),
            next_listener: AtomicU64::new(1),
        }))
    }

    /// Installs the driver for `(proc_id, line_id)`.
    pub fn attach_driver(
        &self,
        proc_id: ProcId,
        line_id: u16,
        driver: Arc<dyn NotifyDriver>,
    ) -> IpcResult<()> {
        let cluster = self.multiproc.cluster_id(proc_id)?;
        if line_id >= self.config.num_lines {
            return Err(IpcError::InvalidArg);
        }
        let mut lines = self.lines.lock().unwrap();
        let slot = &mut lines[usize::from(cluster)][usize::from(line_id)];
        if slot.is_some() {
            return Err(IpcError::AlreadyExists);
        }
        *slot = Some(LineState {
            driver,
            slots: std::array::from_fn(|_| None),
            nesting: 0,
        });
        Ok(())
    }

    pub fn detach_driver(
        &self,
        proc_id: ProcId,
        line_id: u16,
    ) -> IpcResult<()> {
        let cluster = self.multiproc.cluster_id(proc_id)?;
        if line_id >= self.config.num_lines {
            return Err(IpcError::InvalidArg);
        }
        let mut lines = self.lines.lock().unwrap();
        let slot = &mut lines[usize::from(cluster)][usize::from(line_id)];
        if slot.take().is_none() {
            return Err(IpcError::NotFound);
        }
        Ok(())
    }

    fn check_args(&self, proc_id: ProcId, line_id: u16, event: u16) -> IpcResult<()> {
        if !self.multiproc.is_valid(proc_id)
            || line_id >= self.config.num_lines
            || event >= NUM_EVENTS
        {
            return Err(IpcError::InvalidArg);
        }
        Ok(())
    }

    /// A reserved event id is acceptable only with the system key in the
    /// upper half of the 32-bit event argument.
    fn reserved_ok(&self, event_arg: u32) -> bool {
        (event_arg & 0xFFFF) as u16 >= self.config.reserved_events
            || (event_arg >> 16) as u16 == SYSTEM_KEY
    }

    /// Registers the sole callback for an event.
    pub fn register_event_single(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
        cb: EventCallback,
    ) -> IpcResult<()> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        let remote = proc_id != self.multiproc.self_id();
        let cluster = self.multiproc.cluster_id(proc_id)?;

        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        let slot = &mut line.slots[usize::from(event)];
        if slot.is_some() {
            return Err(IpcError::AlreadyExists);
        }
        // Callback first, driver enable last.
        *slot = Some(Slot::Single(cb));
        if remote {
            if let Err(e) = line.driver.register_event(event) {
                line.slots[usize::from(event)] = None;
                return Err(e);
            }
        }
        ringbuf_entry!(Trace::Registered {
            proc: proc_id.0,
            line: line_id,
            event,
        });
        Ok(())
    }

    /// Removes the sole callback for an event.
    pub fn unregister_event_single(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
    ) -> IpcResult<()> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        let remote = proc_id != self.multiproc.self_id();
        let cluster = self.multiproc.cluster_id(proc_id)?;

        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        match &line.slots[usize::from(event)] {
            Some(Slot::Single(_)) => {}
            _ => return Err(IpcError::NotFound),
        }
        // Driver disable first, then the callback goes away.
        if remote {
            line.driver.unregister_event(event);
        }
        line.slots[usize::from(event)] = None;
        ringbuf_entry!(Trace::Unregistered {
            proc: proc_id.0,
            line: line_id,
            event,
        });
        Ok(())
    }

    /// Adds a listener for an event; any number may coexist behind the
    /// fan-out shim. Fails `AlreadyExists` if the event is held in single
    /// mode.
    pub fn register_event(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
        cb: EventCallback,
    ) -> IpcResult<ListenerId> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        let remote = proc_id != self.multiproc.self_id();
        let cluster = self.multiproc.cluster_id(proc_id)?;
        let id = ListenerId(
            self.next_listener.fetch_add(1, Ordering::Relaxed),
        );

        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        let slot = &mut line.slots[usize::from(event)];
        match slot {
            None => {
                // First listener: list first, then driver enable.
                *slot = Some(Slot::Many(vec![(id, cb)]));
                if remote {
                    if let Err(e) = line.driver.register_event(event) {
                        line.slots[usize::from(event)] = None;
                        return Err(e);
                    }
                }
            }
            Some(Slot::Many(list)) => list.push((id, cb)),
            Some(Slot::Single(_)) => return Err(IpcError::AlreadyExists),
        }
        ringbuf_entry!(Trace::Registered {
            proc: proc_id.0,
            line: line_id,
            event,
        });
        Ok(id)
    }

    /// Removes one listener; the last removal also disables the event at
    /// the driver.
    pub fn unregister_event(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
        id: ListenerId,
    ) -> IpcResult<()> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        let remote = proc_id != self.multiproc.self_id();
        let cluster = self.multiproc.cluster_id(proc_id)?;

        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        let slot = &mut line.slots[usize::from(event)];
        let Some(Slot::Many(list)) = slot else {
            return Err(IpcError::NotFound);
        };
        let Some(pos) = list.iter().position(|(lid, _)| *lid == id) else {
            return Err(IpcError::NotFound);
        };
        if list.len() == 1 {
            // Last listener: driver first, then dismantle the list.
            if remote {
                line.driver.unregister_event(event);
            }
            *slot = None;
        } else {
            list.remove(pos);
        }
        ringbuf_entry!(Trace::Unregistered {
            proc: proc_id.0,
            line: line_id,
            event,
        });
        Ok(())
    }

    /// Disables event delivery on `(proc_id, line_id)`; nests. Returns the
    /// key for [`Notify::restore`].
    pub fn disable(&self, proc_id: ProcId, line_id: u16) -> IpcResult<u32> {
        let remote = proc_id != self.multiproc.self_id();
        let cluster = self.multiproc.cluster_id(proc_id)?;
        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        line.nesting += 1;
        if line.nesting == 1 && remote {
            line.driver.disable();
        }
        Ok(line.nesting)
    }

    /// Undoes one [`Notify::disable`], in LIFO order.
    pub fn restore(
        &self,
        proc_id: ProcId,
        line_id: u16,
        key: u32,
    ) -> IpcResult<()> {
        let remote = proc_id != self.multiproc.self_id();
        let cluster = self.multiproc.cluster_id(proc_id)?;
        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        if line.nesting != key || line.nesting == 0 {
            return Err(IpcError::InvalidArg);
        }
        line.nesting -= 1;
        if line.nesting == 0 && remote {
            line.driver.enable();
        }
        Ok(())
    }

    pub fn disable_event(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
    ) -> IpcResult<()> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        if proc_id != self.multiproc.self_id() {
            let driver = self.driver_for(proc_id, line_id)?;
            driver.disable_event(event);
        } else {
            self.enable_mask
                .fetch_and(!(1u32 << event), Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn enable_event(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
    ) -> IpcResult<()> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        if proc_id != self.multiproc.self_id() {
            let driver = self.driver_for(proc_id, line_id)?;
            driver.enable_event(event);
        } else {
            self.enable_mask.fetch_or(1u32 << event, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Sends an event to `(proc_id, line_id)`.
    ///
    /// Self-sends validate that a callback is registered, that the line is
    /// not disabled, and that the event is enabled, then run the callback
    /// synchronously. Remote sends delegate to the driver, which may block
    /// when `wait_clear` is set.
    pub fn send_event(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
        payload: u32,
        wait_clear: bool,
    ) -> IpcResult<()> {
        let event = (event_arg & 0xFFFF) as u16;
        self.check_args(proc_id, line_id, event)?;
        if !self.reserved_ok(event_arg) {
            return Err(IpcError::ReservedEvent);
        }
        ringbuf_entry!(Trace::Sent {
            proc: proc_id.0,
            event,
        });

        if proc_id != self.multiproc.self_id() {
            let driver = self.driver_for(proc_id, line_id)?;
            return driver.send_event(event, payload, wait_clear);
        }

        let cbs = {
            let mut lines = self.lines.lock().unwrap();
            let cluster = self.multiproc.cluster_id(proc_id)?;
            let line = line_state(&mut lines, cluster, line_id)?;
            match &line.slots[usize::from(event)] {
                None => return Err(IpcError::NotFound),
                Some(_) if line.nesting != 0 => {
                    return Err(IpcError::Fail);
                }
                Some(_)
                    if self.enable_mask.load(Ordering::SeqCst)
                        & (1 << event)
                        == 0 =>
                {
                    return Err(IpcError::InvalidState);
                }
                Some(slot) => collect(slot),
            }
        };
        for cb in cbs {
            cb(proc_id, line_id, event, payload);
        }
        ringbuf_entry!(Trace::Delivered { event, payload });
        Ok(())
    }

    /// Delivery entry point for drivers: runs the callbacks registered for
    /// `(src_proc, line_id, event)`. Called from the driver's interrupt
    /// context; never takes longer than the dispatch itself.
    pub fn exec(
        &self,
        src_proc: ProcId,
        line_id: u16,
        event: u16,
        payload: u32,
    ) {
        let cbs = {
            let mut lines = self.lines.lock().unwrap();
            let Ok(cluster) = self.multiproc.cluster_id(src_proc) else {
                return;
            };
            let Ok(line) = line_state(&mut lines, cluster, line_id) else {
                return;
            };
            match &line.slots[usize::from(event)] {
                None => {
                    ringbuf_entry!(Trace::DroppedNoListener { event });
                    return;
                }
                Some(slot) => collect(slot),
            }
        };
        for cb in cbs {
            cb(src_proc, line_id, event, payload);
        }
        ringbuf_entry!(Trace::Delivered { event, payload });
    }

    /// True when the event has no registered callback (and so is free for
    /// a single-mode registration).
    pub fn event_available(
        &self,
        proc_id: ProcId,
        line_id: u16,
        event_arg: u32,
    ) -> bool {
        let event = (event_arg & 0xFFFF) as u16;
        if self.check_args(proc_id, line_id, event).is_err()
            || !self.reserved_ok(event_arg)
        {
            return false;
        }
        let Ok(cluster) = self.multiproc.cluster_id(proc_id) else {
            return false;
        };
        let mut lines = self.lines.lock().unwrap();
        match line_state(&mut lines, cluster, line_id) {
            Ok(line) => line.slots[usize::from(event)].is_none(),
            Err(_) => false,
        }
    }

    /// True when a driver is attached for `(proc_id, line_id)`.
    pub fn int_line_registered(&self, proc_id: ProcId, line_id: u16) -> bool {
        let Ok(cluster) = self.multiproc.cluster_id(proc_id) else {
            return false;
        };
        if line_id >= self.config.num_lines {
            return false;
        }
        let lines = self.lines.lock().unwrap();
        lines[usize::from(cluster)][usize::from(line_id)].is_some()
    }

    /// Number of usable interrupt lines toward `proc_id`. The loopback to
    /// self always has exactly one.
    pub fn num_int_lines(&self, proc_id: ProcId) -> u16 {
        if proc_id == self.multiproc.self_id() {
            return 1;
        }
        let Ok(cluster) = self.multiproc.cluster_id(proc_id) else {
            return 0;
        };
        let lines = self.lines.lock().unwrap();
        lines[usize::from(cluster)]
            .iter()
            .filter(|l| l.is_some())
            .count() as u16
    }

    fn driver_for(
        &self,
        proc_id: ProcId,
        line_id: u16,
    ) -> IpcResult<Arc<dyn NotifyDriver>> {
        let cluster = self.multiproc.cluster_id(proc_id)?;
        let mut lines = self.lines.lock().unwrap();
        let line = line_state(&mut lines, cluster, line_id)?;
        Ok(line.driver.clone())
    }
}

fn line_state<'a>(
    lines: &'a mut [Vec<Option<LineState>>],
    cluster: u16,
    line_id: u16,
) -> IpcResult<&'a mut LineState> {
    lines
        .get_mut(usize::from(cluster))
        .and_then(|v| v.get_mut(usize::from(line_id)))
        .and_then(|l| l.as_mut())
        .ok_or(IpcError::NotFound)
}

fn collect(slot: &Slot) -> Vec<EventCallback> {
    match slot {
        Slot::Single(cb) => vec![cb.clone()],
        Slot::Many(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiproc::MultiProcConfig;
    use std::sync::atomic::AtomicUsize;

    fn notify_with_reserved(reserved: u16) -> (Arc<Notify>, ProcId) {
        let mp = MultiProc::setup(MultiProcConfig {
            names: vec!["HOST".into(), "IPU".into()],
            self_id: ProcId(0),
            base_cluster_id: 0,
        })
        .unwrap();
        let notify = Notify::setup(
            mp,
            NotifyConfig {
                num_lines: 1,
                reserved_events: reserved,
            },
        )
        .unwrap();
        notify
            .attach_driver(ProcId(0), 0, Arc::new(NullDriver))
            .unwrap();
        (notify, ProcId(0))
    }

    #[test]
    fn self_send_runs_callback() {
        let (notify, me) = notify_with_reserved(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        notify
            .register_event_single(
                me,
                0,
                5,
                Arc::new(move |_p, _l, e, payload| {
                    assert_eq!(e, 5);
                    assert_eq!(payload, 0x77);
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        notify.send_event(me, 0, 5, 0x77, false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        notify.unregister_event_single(me, 0, 5).unwrap();
        assert_eq!(
            notify.send_event(me, 0, 5, 0, false),
            Err(IpcError::NotFound)
        );
    }

    #[test]
    fn reserved_events_need_system_key() {
        let (notify, me) = notify_with_reserved(4);
        let cb: EventCallback = Arc::new(|_, _, _, _| {});
        assert_eq!(
            notify.register_event_single(me, 0, 2, cb.clone()),
            Err(IpcError::ReservedEvent)
        );
        notify
            .register_event_single(me, 0, system_event(2), cb.clone())
            .unwrap();
        // Non-reserved ids need no key.
        notify.register_event_single(me, 0, 9, cb).unwrap();
    }

    #[test]
    fn single_slot_is_exclusive() {
        let (notify, me) = notify_with_reserved(0);
        let cb: EventCallback = Arc::new(|_, _, _, _| {});
        notify
            .register_event_single(me, 0, 3, cb.clone())
            .unwrap();
        assert!(!notify.event_available(me, 0, 3));
        assert_eq!(
            notify.register_event_single(me, 0, 3, cb.clone()),
            Err(IpcError::AlreadyExists)
        );
        assert_eq!(
            notify.register_event(me, 0, 3, cb).err(),
            Some(IpcError::AlreadyExists)
        );
    }

    #[test]
    fn fan_out_listeners() {
        let (notify, me) = notify_with_reserved(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let mk = |hits: &Arc<AtomicUsize>| -> EventCallback {
            let h = hits.clone();
            Arc::new(move |_, _, _, _| {
                h.fetch_add(1, Ordering::SeqCst);
            })
        };
        let a = notify.register_event(me, 0, 7, mk(&hits)).unwrap();
        let b = notify.register_event(me, 0, 7, mk(&hits)).unwrap();
        notify.send_event(me, 0, 7, 0, false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        notify.unregister_event(me, 0, 7, a).unwrap();
        notify.send_event(me, 0, 7, 0, false).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        notify.unregister_event(me, 0, 7, b).unwrap();
        assert_eq!(
            notify.send_event(me, 0, 7, 0, false),
            Err(IpcError::NotFound)
        );
        assert_eq!(
            notify.unregister_event(me, 0, 7, b),
            Err(IpcError::NotFound)
        );
    }

    #[test]
    fn disable_restore_nesting() {
        let (notify, me) = notify_with_reserved(0);
        let cb: EventCallback = Arc::new(|_, _, _, _| {});
        notify.register_event_single(me, 0, 1, cb).unwrap();

        let k1 = notify.disable(me, 0).unwrap();
        let k2 = notify.disable(me, 0).unwrap();
        assert_eq!(
            notify.send_event(me, 0, 1, 0, false),
            Err(IpcError::Fail)
        );
        // Out-of-order restore is rejected.
        assert_eq!(notify.restore(me, 0, k1), Err(IpcError::InvalidArg));
        notify.restore(me, 0, k2).unwrap();
        notify.restore(me, 0, k1).unwrap();
        notify.send_event(me, 0, 1, 0, false).unwrap();
    }

    #[test]
    fn per_event_enable_mask() {
        let (notify, me) = notify_with_reserved(0);
        let cb: EventCallback = Arc::new(|_, _, _, _| {});
        notify.register_event_single(me, 0, 6, cb).unwrap();
        notify.disable_event(me, 0, 6).unwrap();
        assert_eq!(
            notify.send_event(me, 0, 6, 0, false),
            Err(IpcError::InvalidState)
        );
        notify.enable_event(me, 0, 6).unwrap();
        notify.send_event(me, 0, 6, 0, false).unwrap();
    }

    #[test]
    fn line_introspection() {
        let (notify, me) = notify_with_reserved(0);
        assert!(notify.int_line_registered(me, 0));
        assert!(!notify.int_line_registered(ProcId(1), 0));
        assert_eq!(notify.num_int_lines(me), 1);
        assert_eq!(notify.num_int_lines(ProcId(1)), 0);
        notify
            .attach_driver(ProcId(1), 0, Arc::new(NullDriver))
            .unwrap();
        assert_eq!(notify.num_int_lines(ProcId(1)), 1);
        notify.detach_driver(ProcId(1), 0).unwrap();
    }

    #[test]
    fn exec_dispatches_from_driver_context() {
        let (notify, _me) = notify_with_reserved(0);
        notify
            .attach_driver(ProcId(1), 0, Arc::new(NullDriver))
            .unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        notify
            .register_event_single(
                ProcId(1),
                0,
                4,
                Arc::new(move |src, _, _, _| {
                    assert_eq!(src, ProcId(1));
                    h.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        // What the peer's interrupt would do.
        notify.exec(ProcId(1), 0, 4, 9);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
