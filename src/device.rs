// SPDX-License-Identifier: MPL-2.0

//! Per-device interrupt state and the driver-facing control plane.
//!
//! Lock ordering, outermost first:
//!
//! 1. The enumerator's rescan lock (outside this crate).
//! 2. The device lock (`PcieDevice::inner`).
//! 3. The bus driver's legacy registry lock, or a shared handler's
//!    device-list lock, or a handler-slot lock. These are siblings; the
//!    registry lock and a list lock are never held together. On the
//!    dispatch path the list lock nests outside slot locks.
//! 4. The command-register lock (leaf; taken inside slot locks).
//!
//! Dispatch runs in hard-IRQ context and takes only the spinlock-class
//! locks (3 and 4). Only the device lock and the platform's MSI block
//! alloc/free may block.

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};

use log::debug;
use spin::Mutex;

use crate::{
    bus::PcieBusDriver,
    capability::msi::CapabilityMsiData,
    cfg_space::{Command, PciCommonCfgOffset, PciConfigAccess, Status},
    device_info::PciDeviceLocation,
    error::{Error, Result},
    handler::{HandlerSlot, HandlerTable, IrqHandlerFn, IrqReturn},
    legacy::{self, SharedLegacyIrqHandler},
    msi,
    platform::{MsiBlock, PciePlatform},
};

/// Interrupt delivery discipline of a PCIe function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcieIrqMode {
    /// No interrupts are delivered.
    Disabled,
    /// Pin-based INTx, shared with other functions on the same system
    /// vector.
    Legacy,
    /// Message Signaled Interrupts.
    Msi,
    /// Reserved. Every MSI-X path currently fails with
    /// [`Error::NotSupported`].
    MsiX,
}

/// What a mode can offer, as reported by
/// [`PcieDevice::query_irq_mode_capabilities`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcieIrqModeCaps {
    /// The largest number of vectors the mode supports on this device.
    pub max_irqs: u32,
    /// Whether individual vectors can be masked and unmasked.
    pub per_vector_masking_supported: bool,
}

/// A snapshot of the active configuration, as reported by
/// [`PcieDevice::irq_mode_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcieIrqModeInfo {
    pub mode: PcieIrqMode,
    /// Number of handler slots in the active configuration.
    pub max_handlers: u32,
    /// Number of slots with a registered handler.
    pub registered_handlers: u32,
}

/// The mutable half of a device's interrupt state, guarded by the
/// device lock.
pub(crate) struct DeviceIrqState {
    pub(crate) plugged_in: bool,
    pub(crate) disabled: bool,
    pub(crate) mode: PcieIrqMode,
    pub(crate) handlers: HandlerTable,
    pub(crate) registered_handler_count: u32,
    /// Membership token: true while linked into the shared legacy
    /// handler's device list.
    pub(crate) in_shared_handler_list: bool,
    /// The vector block on loan from the platform while in MSI mode.
    pub(crate) msi_block: Option<MsiBlock>,
}

/// One PCIe function, from the interrupt engine's point of view.
pub struct PcieDevice {
    weak_self: Weak<Self>,
    location: PciDeviceLocation,
    cfg: Arc<dyn PciConfigAccess>,
    bus_drv: Arc<PcieBusDriver>,
    msi: Option<CapabilityMsiData>,
    legacy_pin: u8,
    shared_handler: Option<Arc<SharedLegacyIrqHandler>>,
    /// Serializes every read-modify-write of the command register.
    /// Distinct from the device lock because dispatchers flip
    /// INT_DISABLE in IRQ context.
    cmd_reg_lock: Mutex<()>,
    /// Pre-allocated slot backing every single-vector configuration.
    singleton_slot: Arc<HandlerSlot>,
    inner: Mutex<DeviceIrqState>,
}

impl PcieDevice {
    /// Sets up the interrupt state for a freshly enumerated function.
    ///
    /// `msi_cap_ptr` is the offset of the MSI capability if the
    /// enumerator found one. `legacy_vector` is the system vector the
    /// function's INTx pin routes to; it is required exactly when the
    /// function reports a pin, and failing to provide one surfaces the
    /// routing failure as [`Error::NotEnoughResources`].
    pub fn new(
        bus_drv: &Arc<PcieBusDriver>,
        location: PciDeviceLocation,
        cfg: Arc<dyn PciConfigAccess>,
        msi_cap_ptr: Option<u16>,
        legacy_vector: Option<u32>,
    ) -> Result<Arc<Self>> {
        // Make certain that the function's legacy IRQ is disabled
        // before anything can observe the device.
        let command = cfg.read16(PciCommonCfgOffset::Command as u16);
        cfg.write16(
            PciCommonCfgOffset::Command as u16,
            command | Command::INTERRUPT_DISABLE.bits(),
        );

        let legacy_pin = cfg.read8(PciCommonCfgOffset::InterruptPin as u16);
        if legacy_pin > 4 {
            return Err(Error::InvalidArgs);
        }

        let shared_handler = if legacy_pin != 0 {
            let Some(vector) = legacy_vector else {
                log::warn!(
                    "no system vector routed for {} (pin {}), legacy mode unavailable",
                    location,
                    legacy_pin
                );
                return Err(Error::NotEnoughResources);
            };
            Some(bus_drv.find_legacy_irq_handler(vector))
        } else {
            None
        };

        let msi = msi_cap_ptr.map(|cap_ptr| CapabilityMsiData::new(cfg.clone(), cap_ptr));

        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            location,
            cfg,
            bus_drv: bus_drv.clone(),
            msi,
            legacy_pin,
            shared_handler,
            cmd_reg_lock: Mutex::new(()),
            singleton_slot: Arc::new(HandlerSlot::new(0)),
            inner: Mutex::new(DeviceIrqState {
                plugged_in: true,
                disabled: false,
                mode: PcieIrqMode::Disabled,
                handlers: HandlerTable::Empty,
                registered_handler_count: 0,
                in_shared_handler_list: false,
                msi_block: None,
            }),
        }))
    }

    /// Recovers the owning `Arc`. Infallible on a live device: a caller
    /// holding `&self` keeps the strong count above zero.
    fn strong_self(&self) -> Arc<Self> {
        self.weak_self.upgrade().expect("device has no strong references")
    }

    /// Returns the function's location.
    pub fn location(&self) -> PciDeviceLocation {
        self.location
    }

    /// Returns the INTx pin the function reports (0 if none, 1..4 for
    /// INTA..INTD).
    pub fn legacy_pin(&self) -> u8 {
        self.legacy_pin
    }

    /// Returns the function's MSI capability, if it has one.
    pub fn msi(&self) -> Option<&CapabilityMsiData> {
        self.msi.as_ref()
    }

    pub(crate) fn platform(&self) -> &Arc<dyn PciePlatform> {
        self.bus_drv.platform()
    }

    pub(crate) fn shared_handler(&self) -> Option<&Arc<SharedLegacyIrqHandler>> {
        self.shared_handler.as_ref()
    }

    pub(crate) fn singleton_slot(&self) -> &Arc<HandlerSlot> {
        &self.singleton_slot
    }

    /// Reads the command register.
    pub fn read_command(&self) -> Command {
        Command::from_bits_truncate(self.cfg.read16(PciCommonCfgOffset::Command as u16))
    }

    /// Reads the status register.
    pub fn read_status(&self) -> Status {
        Status::from_bits_truncate(self.cfg.read16(PciCommonCfgOffset::Status as u16))
    }

    /// Reads the command and status registers as one snapshot.
    pub(crate) fn read_command_status(&self) -> (Command, Status) {
        let _guard = self.cmd_reg_lock.lock();
        (self.read_command(), self.read_status())
    }

    /// Read-modify-writes the command register under the
    /// command-register lock.
    pub(crate) fn modify_command(&self, clr: Command, set: Command) {
        let _guard = self.cmd_reg_lock.lock();
        let old = self.read_command();
        self.cfg
            .write16(PciCommonCfgOffset::Command as u16, ((old - clr) | set).bits());
    }

    /// Marks the function as no longer present in the topology.
    ///
    /// Control-plane calls on an unplugged device fail with
    /// [`Error::BadState`], except for masking and the transition to
    /// [`PcieIrqMode::Disabled`], which teardown still needs.
    pub fn unplug(&self) {
        self.inner.lock().plugged_in = false;
    }

    /// Quiesces (or reactivates) the function on behalf of the bus
    /// driver. A disabled function rejects control-plane calls the same
    /// way an unplugged one does.
    pub fn set_disabled(&self, disabled: bool) {
        self.inner.lock().disabled = disabled;
    }

    /// Reports what `mode` could offer on this device.
    pub fn query_irq_mode_capabilities(&self, mode: PcieIrqMode) -> Result<PcieIrqModeCaps> {
        let state = self.inner.lock();
        if !(state.plugged_in && !state.disabled) {
            return Err(Error::BadState);
        }

        let platform = self.platform();
        match mode {
            PcieIrqMode::Legacy => {
                if self.legacy_pin == 0 {
                    return Err(Error::NotSupported);
                }

                Ok(PcieIrqModeCaps {
                    max_irqs: 1,
                    per_vector_masking_supported: true,
                })
            }
            PcieIrqMode::Msi => {
                // If the platform cannot deliver MSIs, the function's
                // capability does not matter.
                if !platform.supports_msi() {
                    return Err(Error::NotSupported);
                }
                let Some(msi) = self.msi() else {
                    return Err(Error::NotSupported);
                };

                Ok(PcieIrqModeCaps {
                    max_irqs: msi.max_irqs(),
                    per_vector_masking_supported: msi.has_per_vector_masking()
                        || platform.supports_msi_masking(),
                })
            }
            PcieIrqMode::MsiX => Err(Error::NotSupported),
            PcieIrqMode::Disabled => Err(Error::InvalidArgs),
        }
    }

    /// Returns the active mode and handler bookkeeping.
    pub fn irq_mode_info(&self) -> Result<PcieIrqModeInfo> {
        let state = self.inner.lock();
        if !(state.plugged_in && !state.disabled) {
            return Err(Error::BadState);
        }

        Ok(PcieIrqModeInfo {
            mode: state.mode,
            max_handlers: state.handlers.len(),
            registered_handlers: state.registered_handler_count,
        })
    }

    /// Switches the interrupt delivery discipline.
    ///
    /// The only legal transitions are into and out of
    /// [`PcieIrqMode::Disabled`]; switching between active modes (or
    /// resizing an active MSI configuration) requires disabling first.
    /// A failed activation unwinds completely: the device is left
    /// disabled with nothing allocated.
    ///
    /// Once this returns, a hardware interrupt is either delivered
    /// through the new mode's dispatch path or masked; after a
    /// transition to `Disabled` no further callback for this device
    /// will run.
    pub fn set_irq_mode(&self, mode: PcieIrqMode, requested_irqs: u32) -> Result<()> {
        let this = self.strong_self();
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        // Disabling must keep working on an unplugged device.
        if !(mode == PcieIrqMode::Disabled || (state.plugged_in && !state.disabled)) {
            return Err(Error::BadState);
        }

        if mode == PcieIrqMode::Disabled {
            return match state.mode {
                PcieIrqMode::Disabled => {
                    debug_assert!(state.handlers.is_empty());
                    debug_assert_eq!(state.registered_handler_count, 0);
                    Ok(())
                }
                PcieIrqMode::Legacy => {
                    debug_assert!(state.in_shared_handler_list);
                    legacy::leave_legacy_irq_mode(&this, state);
                    debug!("{} left legacy IRQ mode", self.location);
                    Ok(())
                }
                PcieIrqMode::Msi => {
                    debug_assert!(self.msi.is_some());
                    debug_assert!(state.msi_block.is_some());
                    msi::leave_msi_irq_mode(&this, state);
                    debug!("{} left MSI mode", self.location);
                    Ok(())
                }
                // There is no way into MSI-X mode yet.
                PcieIrqMode::MsiX => {
                    debug_assert!(false);
                    Err(Error::NotSupported)
                }
            };
        }

        if requested_irqs < 1 {
            return Err(Error::InvalidArgs);
        }

        // Transitions between active modes must go through Disabled.
        if state.mode != PcieIrqMode::Disabled {
            return Err(Error::BadState);
        }

        match mode {
            PcieIrqMode::Legacy => {
                legacy::enter_legacy_irq_mode(&this, state, requested_irqs)?;
                debug!("{} entered legacy IRQ mode", self.location);
                Ok(())
            }
            PcieIrqMode::Msi => {
                msi::enter_msi_irq_mode(&this, state, requested_irqs)?;
                debug!("{} entered MSI mode with {} vectors", self.location, requested_irqs);
                Ok(())
            }
            PcieIrqMode::MsiX => Err(Error::NotSupported),
            // Handled above; reaching this arm is a bug.
            PcieIrqMode::Disabled => Err(Error::Internal),
        }
    }

    /// Registers `handler` for the vector `irq_id`.
    ///
    /// Re-registration replaces the previous handler; the swap is
    /// atomic with respect to dispatch. The handler runs in hard-IRQ
    /// context with the slot lock held and must not call back into this
    /// device's registration API.
    pub fn register_irq_handler<F>(&self, irq_id: u32, handler: F) -> Result<()>
    where
        F: Fn(&PcieDevice, u32) -> IrqReturn + Send + Sync + 'static,
    {
        self.update_irq_handler(irq_id, Some(Box::new(handler)))
    }

    /// Removes the handler for `irq_id`. Once this returns, the removed
    /// handler will not be invoked again.
    pub fn unregister_irq_handler(&self, irq_id: u32) -> Result<()> {
        self.update_irq_handler(irq_id, None)
    }

    fn update_irq_handler(&self, irq_id: u32, handler: Option<Box<IrqHandlerFn>>) -> Result<()> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if !(state.plugged_in && !state.disabled) {
            return Err(Error::BadState);
        }
        // Cannot register a handler while disabled; there is no slot to
        // register against.
        if state.mode == PcieIrqMode::Disabled {
            return Err(Error::BadState);
        }
        debug_assert!(!state.handlers.is_empty());

        if irq_id >= state.handlers.len() {
            return Err(Error::InvalidArgs);
        }
        let slot = state.handlers.slot(irq_id).ok_or(Error::Internal)?;

        let mut slot_state = slot.lock();
        match (slot_state.handler.is_some(), handler.is_some()) {
            (true, false) => {
                debug_assert!(state.registered_handler_count > 0);
                state.registered_handler_count -= 1;
            }
            (false, true) => state.registered_handler_count += 1,
            _ => {}
        }
        slot_state.handler = handler;
        debug_assert!(state.registered_handler_count <= state.handlers.len());

        Ok(())
    }

    /// Masks or unmasks the vector `irq_id` in the active mode.
    ///
    /// Unmasking requires a registered handler (an unmasked vector
    /// nobody services would storm). Masking keeps working on an
    /// unplugged device so teardown can quiesce it.
    pub fn mask_unmask_irq(&self, irq_id: u32, mask: bool) -> Result<()> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if !(mask || (state.plugged_in && !state.disabled)) {
            return Err(Error::BadState);
        }
        if state.mode == PcieIrqMode::Disabled {
            return Err(Error::BadState);
        }
        debug_assert!(!state.handlers.is_empty());

        if irq_id >= state.handlers.len() {
            return Err(Error::InvalidArgs);
        }

        if !mask {
            let slot = state.handlers.slot(irq_id).ok_or(Error::Internal)?;
            if slot.lock().handler.is_none() {
                return Err(Error::BadState);
            }
        }

        match state.mode {
            PcieIrqMode::Legacy => legacy::mask_unmask_legacy_irq(self, state, mask),
            PcieIrqMode::Msi => msi::mask_unmask_msi_irq(self, state, irq_id, mask),
            PcieIrqMode::MsiX => Err(Error::NotSupported),
            // Rejected above; reaching this arm is a bug.
            PcieIrqMode::Disabled => Err(Error::Internal),
        }
    }
}

impl core::fmt::Debug for PcieDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("PcieDevice")
            .field("location", &self.location)
            .field("legacy_pin", &self.legacy_pin)
            .field("msi", &self.msi)
            .finish_non_exhaustive()
    }
}

/// Returns a device to the clean disabled state.
///
/// The sole path back to [`PcieIrqMode::Disabled`]. Must only run once
/// the dispatch path can no longer reach the device: after the shared
/// handler detach for legacy mode, or after the platform's block free
/// (which drains in-flight dispatches) for MSI.
pub(crate) fn reset_common_irq_bookkeeping(dev: &PcieDevice, state: &mut DeviceIrqState) {
    if state.handlers.len() > 1 {
        debug_assert!(matches!(state.handlers, HandlerTable::Heap(_)));
    }

    // The embedded slot outlives the session; scrub it for the next one.
    dev.singleton_slot.reset();

    state.handlers = HandlerTable::Empty;
    state.registered_handler_count = 0;
    state.mode = PcieIrqMode::Disabled;
}
