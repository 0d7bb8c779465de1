// SPDX-License-Identifier: MPL-2.0

//! MSI capability support.

use alloc::sync::Arc;
use core::fmt::{self, Debug};

use bit_field::BitField;

use crate::cfg_space::PciConfigAccess;

/// The MSI specification never grants a function more than 32 vectors.
pub const MAX_MSI_IRQS: u32 = 32;

/// MSI capability.
///
/// The capability is parsed once at device initialization; only the
/// interrupt engine writes the registers inside it afterwards.
///
/// Register layout (offsets relative to the capability pointer):
///
/// | offset | 32-bit form      | 64-bit form      |
/// |--------|------------------|------------------|
/// | +0x02  | message control  | message control  |
/// | +0x04  | address          | address (low)    |
/// | +0x08  | data             | address (high)   |
/// | +0x0C  | mask bits (PVM)  | data             |
/// | +0x10  | —                | mask bits (PVM)  |
pub struct CapabilityMsiData {
    cfg: Arc<dyn PciConfigAccess>,
    cap_ptr: u16,
    is_64bit: bool,
    has_pvm: bool,
    max_irqs: u32,
}

/// Message control register fields.
const CTRL_OFFSET: u16 = 0x02;
const CTRL_ENABLE_BIT: usize = 0;
const CTRL_MMC_BITS: core::ops::Range<usize> = 1..4;
const CTRL_MME_BITS: core::ops::Range<usize> = 4..7;
const CTRL_64BIT_BIT: usize = 7;
const CTRL_PVM_BIT: usize = 8;

const ADDR_OFFSET: u16 = 0x04;
const ADDR_UPPER_OFFSET: u16 = 0x08;
const DATA_32BIT_OFFSET: u16 = 0x08;
const DATA_64BIT_OFFSET: u16 = 0x0C;
const MASK_32BIT_OFFSET: u16 = 0x0C;
const MASK_64BIT_OFFSET: u16 = 0x10;

impl CapabilityMsiData {
    /// Parses the capability at `cap_ptr`.
    pub(crate) fn new(cfg: Arc<dyn PciConfigAccess>, cap_ptr: u16) -> Self {
        let msg_ctrl = cfg.read16(cap_ptr + CTRL_OFFSET);

        let mmc = msg_ctrl.get_bits(CTRL_MMC_BITS) as u32;
        let max_irqs = if mmc > 5 {
            // Encodings above 101b are reserved by the specification.
            log::warn!(
                "MSI capability advertises reserved MMC encoding {}, clamping to {} vectors",
                mmc,
                MAX_MSI_IRQS
            );
            MAX_MSI_IRQS
        } else {
            1 << mmc
        };

        Self {
            cfg,
            cap_ptr,
            is_64bit: msg_ctrl.get_bit(CTRL_64BIT_BIT),
            has_pvm: msg_ctrl.get_bit(CTRL_PVM_BIT),
            max_irqs,
        }
    }

    /// Returns the maximum number of vectors the function advertises.
    pub fn max_irqs(&self) -> u32 {
        self.max_irqs
    }

    /// Returns true if the function emits 64-bit message addresses.
    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    /// Returns true if the function supports per-vector masking.
    pub fn has_per_vector_masking(&self) -> bool {
        self.has_pvm
    }

    /// Sets or clears the top-level MSI enable bit.
    pub(crate) fn set_enabled(&self, enabled: bool) {
        let ctrl = self.cap_ptr + CTRL_OFFSET;
        let mut msg_ctrl = self.cfg.read16(ctrl);
        msg_ctrl.set_bit(CTRL_ENABLE_BIT, enabled);
        self.cfg.write16(ctrl, msg_ctrl);
    }

    /// Programs the Multi-Message Enable field with `log2` of the
    /// number of active vectors.
    pub(crate) fn set_multi_message_enable(&self, log2_irqs: u16) {
        debug_assert!(log2_irqs <= 5);

        let ctrl = self.cap_ptr + CTRL_OFFSET;
        let mut msg_ctrl = self.cfg.read16(ctrl);
        msg_ctrl.set_bits(CTRL_MME_BITS, log2_irqs & 0b111);
        self.cfg.write16(ctrl, msg_ctrl);
    }

    /// Writes the message address/data pair the function will target.
    ///
    /// The caller must have disabled MSI and masked all vectors first;
    /// the function may otherwise emit a write to a half-updated target.
    pub(crate) fn set_message_target(&self, tgt_addr: u64, tgt_data: u16) {
        debug_assert!(self.is_64bit || (tgt_addr >> 32) == 0);

        // The low address dword is common to both forms. The upper
        // address bits and the data position depend on the form.
        self.cfg
            .write32(self.cap_ptr + ADDR_OFFSET, (tgt_addr & 0xFFFF_FFFF) as u32);
        if self.is_64bit {
            self.cfg
                .write32(self.cap_ptr + ADDR_UPPER_OFFSET, (tgt_addr >> 32) as u32);
            self.cfg.write16(self.cap_ptr + DATA_64BIT_OFFSET, tgt_data);
        } else {
            self.cfg.write16(self.cap_ptr + DATA_32BIT_OFFSET, tgt_data);
        }
    }

    fn mask_bits_offset(&self) -> u16 {
        self.cap_ptr
            + if self.is_64bit {
                MASK_64BIT_OFFSET
            } else {
                MASK_32BIT_OFFSET
            }
    }

    /// Reads the PVM mask register. Must only be called when the
    /// function supports per-vector masking.
    pub(crate) fn read_mask_bits(&self) -> u32 {
        debug_assert!(self.has_pvm);
        self.cfg.read32(self.mask_bits_offset())
    }

    /// Overwrites the whole PVM mask register.
    pub(crate) fn write_mask_bits(&self, bits: u32) {
        debug_assert!(self.has_pvm);
        self.cfg.write32(self.mask_bits_offset(), bits);
    }

    /// Sets or clears the PVM mask bit for one vector.
    pub(crate) fn set_mask_bit(&self, irq_id: u32, mask: bool) {
        debug_assert!(irq_id < MAX_MSI_IRQS);

        let mut bits = self.read_mask_bits();
        bits.set_bit(irq_id as usize, mask);
        self.write_mask_bits(bits);
    }
}

impl Debug for CapabilityMsiData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CapabilityMsiData")
            .field("cap_ptr", &self.cap_ptr)
            .field("is_64bit", &self.is_64bit)
            .field("has_pvm", &self.has_pvm)
            .field("max_irqs", &self.max_irqs)
            .finish_non_exhaustive()
    }
}
