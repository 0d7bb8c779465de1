// SPDX-License-Identifier: MPL-2.0

//! Per-vector handler slots and their storage.

use alloc::{boxed::Box, sync::Arc, vec::Vec};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::{
    device::PcieDevice,
    error::{Error, Result},
};

bitflags! {
    /// Value returned by a driver's interrupt handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqReturn: u32 {
        /// Leave the vector masked; the driver will unmask when ready.
        const MASK = 1 << 0;
        /// A higher-priority runnable exists; request a reschedule.
        const RESCHED = 1 << 1;
    }
}

/// A driver's per-vector interrupt callback.
///
/// Invoked in hard-IRQ context with the slot lock held: the callback
/// must not block and must not call back into the registration API for
/// its own device.
pub type IrqHandlerFn = dyn Fn(&PcieDevice, u32) -> IrqReturn + Send + Sync;

pub(crate) struct SlotState {
    pub(crate) handler: Option<Box<IrqHandlerFn>>,
    pub(crate) masked: bool,
}

/// One handler slot: the unit a driver registers against and a
/// dispatcher fires.
pub(crate) struct HandlerSlot {
    pci_irq_id: u32,
    state: Mutex<SlotState>,
}

impl HandlerSlot {
    pub(crate) fn new(pci_irq_id: u32) -> Self {
        Self {
            pci_irq_id,
            state: Mutex::new(SlotState {
                handler: None,
                masked: false,
            }),
        }
    }

    pub(crate) fn pci_irq_id(&self) -> u32 {
        self.pci_irq_id
    }

    /// Locks the slot. IRQ-safe leaf lock; see the ordering notes in
    /// `device.rs`.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock()
    }

    /// Drops any registered handler and clears the masked flag.
    pub(crate) fn reset(&self) {
        let mut state = self.state.lock();
        state.handler = None;
        state.masked = false;
    }
}

/// Handler storage for one device.
///
/// A single-vector configuration reuses the slot embedded in the device
/// record instead of allocating; larger tables live on the heap. Either
/// way callers address slots through [`slot`].
///
/// [`slot`]: Self::slot
#[derive(Clone)]
pub(crate) enum HandlerTable {
    Empty,
    Singleton(Arc<HandlerSlot>),
    Heap(Arc<[HandlerSlot]>),
}

impl HandlerTable {
    /// Allocates storage for `requested_irqs` slots, reusing the
    /// device's embedded slot for the single-vector case.
    pub(crate) fn alloc(dev: &PcieDevice, requested_irqs: u32) -> Result<Self> {
        debug_assert!(requested_irqs >= 1);

        if requested_irqs == 1 {
            let slot = dev.singleton_slot().clone();
            slot.reset();
            return Ok(Self::Singleton(slot));
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(requested_irqs as usize)
            .map_err(|_| Error::NoMemory)?;
        for i in 0..requested_irqs {
            slots.push(HandlerSlot::new(i));
        }
        Ok(Self::Heap(slots.into()))
    }

    pub(crate) fn len(&self) -> u32 {
        match self {
            Self::Empty => 0,
            Self::Singleton(_) => 1,
            Self::Heap(slots) => slots.len() as u32,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub(crate) fn slot(&self, irq_id: u32) -> Option<&HandlerSlot> {
        match self {
            Self::Empty => None,
            Self::Singleton(slot) => (irq_id == 0).then_some(&**slot),
            Self::Heap(slots) => slots.get(irq_id as usize),
        }
    }
}
