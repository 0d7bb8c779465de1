// SPDX-License-Identifier: MPL-2.0

//! Shared dispatch of legacy INTx interrupts.
//!
//! A single system vector can serve the INTx pins of many functions.
//! One `SharedLegacyIrqHandler` exists per vector; it owns the
//! platform-level handler registration and fans a dispatch pass out
//! over every attached device.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use log::warn;
use spin::Mutex;

use crate::{
    cfg_space::{Command, Status},
    device::{reset_common_irq_bookkeeping, DeviceIrqState, PcieDevice, PcieIrqMode},
    error::{Error, Result},
    handler::{HandlerTable, IrqReturn},
    platform::{HandlerReturn, InterruptHandler, PciePlatform},
};

/// Fan-out point for one system-level INTx vector.
///
/// The platform vector is unmasked exactly while the device list is
/// non-empty.
pub(crate) struct SharedLegacyIrqHandler {
    vector: u32,
    platform: Arc<dyn PciePlatform>,
    /// IRQ-safe list lock. Held for the whole dispatch pass, so the
    /// pass is bounded by the list length and never blocks.
    device_list: Mutex<Vec<Arc<PcieDevice>>>,
}

impl SharedLegacyIrqHandler {
    /// Creates the handler for `vector` and installs it at the platform
    /// controller, masked.
    pub(crate) fn new(vector: u32, platform: Arc<dyn PciePlatform>) -> Arc<Self> {
        let handler = Arc::new(Self {
            vector,
            platform: platform.clone(),
            device_list: Mutex::new(Vec::new()),
        });

        // Should not be needed, but just in case.
        platform.mask_vector(vector);
        platform.register_int_handler(
            vector,
            Some(Arc::new(LegacyIrqThunk(Arc::downgrade(&handler)))),
        );

        handler
    }

    pub(crate) fn vector(&self) -> u32 {
        self.vector
    }

    /// Attaches a device whose INTx pin routes to this vector.
    ///
    /// The device's legacy IRQ must already be masked at the config
    /// level; this reasserts it before the device becomes reachable
    /// from the dispatch pass. Unmasks the platform vector on the
    /// empty-to-non-empty transition.
    pub(crate) fn add_device(&self, dev: &Arc<PcieDevice>) {
        debug_assert!(dev
            .shared_handler()
            .is_some_and(|h| core::ptr::eq(h.as_ref(), self)));

        let mut list = self.device_list.lock();
        debug_assert!(!list.iter().any(|d| Arc::ptr_eq(d, dev)));

        dev.modify_command(Command::empty(), Command::INTERRUPT_DISABLE);

        let first_device = list.is_empty();
        list.push(dev.clone());

        if first_device {
            self.platform.unmask_vector(self.vector);
        }
    }

    /// Detaches a device. Masks the platform vector when the list
    /// becomes empty.
    pub(crate) fn remove_device(&self, dev: &Arc<PcieDevice>) {
        let mut list = self.device_list.lock();

        // Make absolutely sure the device is masked at the config level
        // before it drops off the dispatch path.
        dev.modify_command(Command::empty(), Command::INTERRUPT_DISABLE);

        let pos = list.iter().position(|d| Arc::ptr_eq(d, dev));
        debug_assert!(pos.is_some());
        if let Some(pos) = pos {
            list.remove(pos);
        }

        if list.is_empty() {
            self.platform.mask_vector(self.vector);
        }
    }

    /// One dispatch pass, in IRQ context.
    ///
    /// Walks the attached devices in attach order and gives each
    /// asserting device's handler a chance to run. Devices asserting
    /// without a usable handler are force-masked at the config level.
    pub(crate) fn dispatch(&self) -> HandlerReturn {
        let list = self.device_list.lock();

        if list.is_empty() {
            warn!(
                "received legacy PCI interrupt on vector {} with no registered devices, \
                 masking the vector to prevent a storm",
                self.vector
            );
            self.platform.mask_vector(self.vector);
            return HandlerReturn::NoReschedule;
        }

        let mut need_resched = false;
        for dev in list.iter() {
            let (command, status) = dev.read_command_status();

            if !status.contains(Status::INTERRUPT_STATUS)
                || command.contains(Command::INTERRUPT_DISABLE)
            {
                continue;
            }

            let slot = dev.singleton_slot();
            let mut state = slot.lock();

            let mut ret = IrqReturn::MASK;
            if let Some(handler) = state.handler.as_ref() {
                if !state.masked {
                    ret = handler(dev.as_ref(), 0);
                }
                if ret.contains(IrqReturn::RESCHED) {
                    need_resched = true;
                }
            } else {
                warn!(
                    "received legacy PCI interrupt on vector {} for {} with no driver \
                     handler registered, force disabling the device's interrupt",
                    self.vector,
                    dev.location()
                );
            }

            if ret.contains(IrqReturn::MASK) {
                state.masked = true;
                dev.modify_command(Command::empty(), Command::INTERRUPT_DISABLE);
            }
        }

        if need_resched {
            HandlerReturn::Reschedule
        } else {
            HandlerReturn::NoReschedule
        }
    }
}

impl Drop for SharedLegacyIrqHandler {
    fn drop(&mut self) {
        debug_assert!(self.device_list.lock().is_empty());
        self.platform.mask_vector(self.vector);
        self.platform.register_int_handler(self.vector, None);
    }
}

/// The platform-facing registration for a shared handler.
///
/// Holds a weak reference so that dropping the last strong reference
/// (registry shutdown) can run the handler's teardown even while the
/// platform still holds this thunk.
struct LegacyIrqThunk(Weak<SharedLegacyIrqHandler>);

impl InterruptHandler for LegacyIrqThunk {
    fn handle_interrupt(&self) -> HandlerReturn {
        match self.0.upgrade() {
            Some(handler) => handler.dispatch(),
            None => HandlerReturn::NoReschedule,
        }
    }
}

/// Masks or unmasks the device's single legacy vector via the
/// INT_DISABLE command bit.
pub(crate) fn mask_unmask_legacy_irq(
    dev: &PcieDevice,
    state: &DeviceIrqState,
    mask: bool,
) -> Result<()> {
    let slot = state.handlers.slot(0).ok_or(Error::InvalidArgs)?;
    let mut slot_state = slot.lock();

    if mask {
        dev.modify_command(Command::empty(), Command::INTERRUPT_DISABLE);
    } else {
        dev.modify_command(Command::INTERRUPT_DISABLE, Command::empty());
    }
    slot_state.masked = mask;

    Ok(())
}

pub(crate) fn enter_legacy_irq_mode(
    dev: &Arc<PcieDevice>,
    state: &mut DeviceIrqState,
    requested_irqs: u32,
) -> Result<()> {
    debug_assert!(requested_irqs >= 1);

    if dev.legacy_pin() == 0 || requested_irqs > 1 {
        return Err(Error::NotSupported);
    }

    // A single slot always fits the embedded singleton, so this cannot
    // fail once the pin check has passed.
    state.handlers = HandlerTable::alloc(dev, requested_irqs)?;
    state.mode = PcieIrqMode::Legacy;

    let shared = dev.shared_handler().ok_or(Error::Internal)?;
    shared.add_device(dev);
    state.in_shared_handler_list = true;

    Ok(())
}

pub(crate) fn leave_legacy_irq_mode(dev: &Arc<PcieDevice>, state: &mut DeviceIrqState) {
    // Disable legacy IRQs and unregister from the shared handler.
    let _ = mask_unmask_legacy_irq(dev, state, true);
    if let Some(shared) = dev.shared_handler() {
        shared.remove_device(dev);
    }
    state.in_shared_handler_list = false;

    reset_common_irq_bookkeeping(dev, state);
}
