// SPDX-License-Identifier: MPL-2.0

//! MSI mode: vector-block programming and per-vector dispatch.

use alloc::sync::Arc;

use crate::{
    capability::msi::CapabilityMsiData,
    device::{reset_common_irq_bookkeeping, DeviceIrqState, PcieDevice, PcieIrqMode},
    error::{Error, Result},
    handler::{HandlerTable, IrqReturn, SlotState},
    platform::{HandlerReturn, InterruptHandler, MsiBlock},
};

/// Per-vector dispatcher, registered with the platform as the handler
/// for one vector of an allocated block.
///
/// Carries its own copy of the block description so dispatch never has
/// to reach for the device lock. The strong device reference is what
/// keeps the device alive until `free_msi_block` has unregistered every
/// vector and drained in-flight passes.
pub(crate) struct MsiVector {
    dev: Arc<PcieDevice>,
    table: HandlerTable,
    irq_id: u32,
    block: MsiBlock,
}

impl InterruptHandler for MsiVector {
    fn handle_interrupt(&self) -> HandlerReturn {
        let Some(slot) = self.table.slot(self.irq_id) else {
            debug_assert!(false, "MSI vector registered without a handler slot");
            return HandlerReturn::NoReschedule;
        };
        debug_assert_eq!(slot.pci_irq_id(), self.irq_id);

        let mut state = slot.lock();

        // Mask our vector if we can.
        let maskable = self.dev.platform().supports_msi_masking()
            || self
                .dev
                .msi()
                .is_some_and(|m| m.has_per_vector_masking());
        let was_masked = if maskable {
            mask_unmask_msi_vector_locked(&self.dev, &self.block, &mut state, self.irq_id, true)
        } else {
            debug_assert!(!state.masked);
            false
        };

        // If the vector was masked or the handler removed by the time
        // we got here, leave the vector masked and get out.
        if was_masked {
            return HandlerReturn::NoReschedule;
        }
        let Some(handler) = state.handler.as_ref() else {
            return HandlerReturn::NoReschedule;
        };

        let ret = handler(self.dev.as_ref(), self.irq_id);

        // Re-enable the vector unless the driver asked to stay masked.
        if !ret.contains(IrqReturn::MASK) {
            mask_unmask_msi_vector_locked(&self.dev, &self.block, &mut state, self.irq_id, false);
        }

        if ret.contains(IrqReturn::RESCHED) {
            HandlerReturn::Reschedule
        } else {
            HandlerReturn::NoReschedule
        }
    }
}

/// Applies a mask state to one vector at every level available (device
/// PVM register, platform controller) and records it in the slot.
///
/// Returns the previous value of the slot's masked flag. The caller
/// holds the slot lock.
pub(crate) fn mask_unmask_msi_vector_locked(
    dev: &PcieDevice,
    block: &MsiBlock,
    slot_state: &mut SlotState,
    irq_id: u32,
    mask: bool,
) -> bool {
    debug_assert!(irq_id < block.num_irqs);

    if let Some(msi) = dev.msi() {
        if msi.has_per_vector_masking() {
            msi.set_mask_bit(irq_id, mask);
        }
    }

    let platform = dev.platform();
    if platform.supports_msi_masking() {
        platform.mask_unmask_msi(block, irq_id, mask);
    }

    let prev = slot_state.masked;
    slot_state.masked = mask;
    prev
}

/// Control-plane mask/unmask of one MSI vector.
pub(crate) fn mask_unmask_msi_irq(
    dev: &PcieDevice,
    state: &DeviceIrqState,
    irq_id: u32,
    mask: bool,
) -> Result<()> {
    if irq_id >= state.handlers.len() {
        return Err(Error::InvalidArgs);
    }

    // A mask request with no mechanism to mask at either level is
    // unsupportable; an unmask request always has something to clear.
    if mask
        && !dev.platform().supports_msi_masking()
        && !dev.msi().is_some_and(|m| m.has_per_vector_masking())
    {
        return Err(Error::NotSupported);
    }

    let block = state.msi_block.as_ref().ok_or(Error::Internal)?;
    let slot = state.handlers.slot(irq_id).ok_or(Error::Internal)?;
    let mut slot_state = slot.lock();
    mask_unmask_msi_vector_locked(dev, block, &mut slot_state, irq_id, mask);

    Ok(())
}

/// Masks every vector of the active configuration.
fn mask_all_msi_vectors(dev: &PcieDevice, state: &DeviceIrqState) {
    for irq_id in 0..state.handlers.len() {
        // Ignores NotSupported: a configuration with no mask mechanism
        // simply stays unmasked, as the capability advertises.
        let _ = mask_unmask_msi_irq(dev, state, irq_id, true);
    }

    // The loop has covered the vectors with handler slots; mask the
    // remaining bits of the register as well.
    if let Some(msi) = dev.msi() {
        if msi.has_per_vector_masking() {
            msi.write_mask_bits(0xFFFF_FFFF);
        }
    }
}

/// Programs the message target, first disabling MSI at the top level
/// and masking all vectors so the function cannot emit a write to a
/// half-updated address/data pair.
fn set_msi_target(dev: &PcieDevice, state: &DeviceIrqState, tgt_addr: u64, tgt_data: u16) {
    let Some(msi) = dev.msi() else {
        debug_assert!(false, "programming MSI target without an MSI capability");
        return;
    };

    msi.set_enabled(false);
    mask_all_msi_vectors(dev, state);
    msi.set_message_target(tgt_addr, tgt_data);
}

/// Writes the Multi-Message Enable field for `requested_irqs` vectors.
///
/// The field holds a power-of-two exponent, so a request that is not a
/// power of two is rounded up; the surplus vectors of the block never
/// get handler slots and stay masked.
fn set_msi_multi_message_enable(msi: &CapabilityMsiData, requested_irqs: u32) {
    let log2 = requested_irqs.next_power_of_two().trailing_zeros() as u16;
    debug_assert!(log2 <= 5);

    msi.set_multi_message_enable(log2);
}

/// Unregisters every per-vector dispatcher and returns the block to the
/// platform.
///
/// The platform's free primitive drains in-flight dispatches, so once
/// this returns no `MsiVector` for this device can be running.
fn free_msi_block(dev: &PcieDevice, state: &mut DeviceIrqState) {
    let Some(block) = state.msi_block.take() else {
        return;
    };

    let platform = dev.platform();
    debug_assert!(platform.supports_msi());

    for irq_id in 0..block.num_irqs {
        if platform.supports_msi_masking() {
            platform.mask_unmask_msi(&block, irq_id, true);
        }
        platform.register_msi_handler(&block, irq_id, None);
    }

    platform.free_msi_block(block);
}

pub(crate) fn enter_msi_irq_mode(
    dev: &Arc<PcieDevice>,
    state: &mut DeviceIrqState,
    requested_irqs: u32,
) -> Result<()> {
    debug_assert!(requested_irqs >= 1);

    // MSI mode needs support from both the function and the platform,
    // and the request must fit what the function advertises.
    let Some(msi) = dev.msi() else {
        return Err(Error::NotSupported);
    };
    if !dev.platform().supports_msi() || requested_irqs > msi.max_irqs() {
        return Err(Error::NotSupported);
    }

    debug_assert!(state.msi_block.is_none());

    // If any step fails, unwind through the full DISABLED transition so
    // no partial configuration survives.
    if let Err(err) = try_enter_msi_irq_mode(dev, state, requested_irqs) {
        leave_msi_irq_mode(dev, state);
        return Err(err);
    }
    Ok(())
}

fn try_enter_msi_irq_mode(
    dev: &Arc<PcieDevice>,
    state: &mut DeviceIrqState,
    requested_irqs: u32,
) -> Result<()> {
    let platform = dev.platform();
    let msi = dev.msi().ok_or(Error::Internal)?;

    // Ask the platform for a chunk of MSI compatible vectors.
    let block = platform.alloc_msi_block(requested_irqs, msi.is_64bit(), false)?;
    state.msi_block = Some(block.clone());

    state.handlers = HandlerTable::alloc(dev, requested_irqs)?;

    state.mode = PcieIrqMode::Msi;

    // Programming the target also disables MSI at the top level and
    // masks every vector (PVM and controller, where supported).
    debug_assert!(block.tgt_data <= u16::MAX as u32);
    set_msi_target(dev, state, block.tgt_addr, block.tgt_data as u16);

    set_msi_multi_message_enable(msi, requested_irqs);

    // Hook up a dispatcher for every vector that has a handler slot.
    debug_assert!(state.handlers.len() <= block.num_irqs);
    for irq_id in 0..state.handlers.len() {
        let vector = MsiVector {
            dev: dev.clone(),
            table: state.handlers.clone(),
            irq_id,
            block: block.clone(),
        };
        platform.register_msi_handler(&block, irq_id, Some(Arc::new(vector)));
    }

    msi.set_enabled(true);
    Ok(())
}

pub(crate) fn leave_msi_irq_mode(dev: &Arc<PcieDevice>, state: &mut DeviceIrqState) {
    // Disable MSI, mask all vectors and zero out the target.
    set_msi_target(dev, state, 0, 0);

    // Return the vector block, synchronizing with the dispatchers in
    // the process.
    free_msi_block(dev, state);

    reset_common_irq_bookkeeping(dev, state);
}
