// SPDX-License-Identifier: MPL-2.0

//! PCI configuration space layout and the accessor seam.

use bitflags::bitflags;

/// Offsets into the type-00h configuration header.
#[repr(u16)]
pub enum PciCommonCfgOffset {
    VendorId = 0x00,
    DeviceId = 0x02,
    Command = 0x04,
    Status = 0x06,
    RevisionId = 0x08,
    ClassCode = 0x09,
    CacheLineSize = 0x0C,
    LatencyTimer = 0x0D,
    HeaderType = 0x0E,
    Bist = 0x0F,
    Bar0 = 0x10,
    Bar1 = 0x14,
    Bar2 = 0x18,
    Bar3 = 0x1C,
    Bar4 = 0x20,
    Bar5 = 0x24,
    CardbusCisPtr = 0x28,
    SubsystemVendorId = 0x2C,
    SubsystemId = 0x2E,
    XromBar = 0x30,
    CapabilitiesPointer = 0x34,
    InterruptLine = 0x3C,
    InterruptPin = 0x3D,
    MinGrant = 0x3E,
    MaxLatency = 0x3F,
}

bitflags! {
    /// PCI device common config space command register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        const IO_SPACE                  =  1 << 0;
        const MEMORY_SPACE              =  1 << 1;
        const BUS_MASTER                =  1 << 2;
        const SPECIAL_CYCLES            =  1 << 3;
        const MWI_ENABLE                =  1 << 4;
        const VGA_PALETTE_SNOOP         =  1 << 5;
        const PARITY_ERROR_RESPONSE     =  1 << 6;
        const STEPPING_CONTROL          =  1 << 7;
        const SERR_ENABLE               =  1 << 8;
        const FAST_BACK_TO_BACK_ENABLE  =  1 << 9;
        const INTERRUPT_DISABLE         =  1 << 10;
    }
}

bitflags! {
    /// PCI device common config space status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u16 {
        const INTERRUPT_STATUS          = 1 << 3;
        const CAPABILITIES_LIST         = 1 << 4;
        const MHZ66_CAPABLE             = 1 << 5;
        const FAST_BACK_TO_BACK_CAPABLE = 1 << 7;
        const MASTER_DATA_PARITY_ERROR  = 1 << 8;
        const DEVSEL_MEDIUM_TIMING      = 1 << 9;
        const DEVSEL_SLOW_TIMING        = 1 << 10;
        const SIGNALED_TARGET_ABORT     = 1 << 11;
        const RECEIVED_TARGET_ABORT     = 1 << 12;
        const RECEIVED_MASTER_ABORT     = 1 << 13;
        const SIGNALED_SYSTEM_ERROR     = 1 << 14;
        const DETECTED_PARITY_ERROR     = 1 << 15;
    }
}

const BIT32_ALIGN_MASK: u16 = 0xFFFC;

/// Access to one function's configuration space.
///
/// The accessor primitives themselves (ECAM mapping, port I/O, whatever
/// the platform provides) are owned by the bus driver; this engine only
/// consumes them through this trait. Implementations supply the aligned
/// dword operations; the sub-dword forms are derived from them.
pub trait PciConfigAccess: Send + Sync {
    /// Reads a 32-bit value from the PCI configuration space at the specified offset.
    ///
    /// `offset` must be 4-byte aligned.
    fn read32(&self, offset: u16) -> u32;

    /// Writes a 32-bit value to the PCI configuration space at the specified offset.
    ///
    /// `offset` must be 4-byte aligned.
    fn write32(&self, offset: u16, val: u32);

    /// Reads a 8-bit value from the PCI configuration space at the specified offset.
    fn read8(&self, offset: u16) -> u8 {
        let val = self.read32(offset & BIT32_ALIGN_MASK);
        ((val >> ((offset as usize & 0b11) << 3)) & 0xFF) as u8
    }

    /// Reads a 16-bit value from the PCI configuration space at the specified offset.
    fn read16(&self, offset: u16) -> u16 {
        let val = self.read32(offset & BIT32_ALIGN_MASK);
        ((val >> ((offset as usize & 0b10) << 3)) & 0xFFFF) as u16
    }

    /// Writes an 8-bit value to the PCI configuration space at the specified offset.
    fn write8(&self, offset: u16, val: u8) {
        let old = self.read32(offset & BIT32_ALIGN_MASK);
        let dest = (offset as usize & 0b11) << 3;
        let mask = (0xFF << dest) as u32;
        self.write32(
            offset & BIT32_ALIGN_MASK,
            ((val as u32) << dest) | (old & !mask),
        );
    }

    /// Writes a 16-bit value to the PCI configuration space at the specified offset.
    fn write16(&self, offset: u16, val: u16) {
        let old = self.read32(offset & BIT32_ALIGN_MASK);
        let dest = (offset as usize & 0b10) << 3;
        let mask = (0xFFFF << dest) as u32;
        self.write32(
            offset & BIT32_ALIGN_MASK,
            ((val as u32) << dest) | (old & !mask),
        );
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::test_util::FakeConfigSpace;

    #[test]
    fn sub_dword_access_is_derived_from_dword_access() {
        let cfg = Arc::new(FakeConfigSpace::new(0));
        cfg.write32(0x10, 0xAABB_CCDD);
        assert_eq!(cfg.read16(0x10), 0xCCDD);
        assert_eq!(cfg.read16(0x12), 0xAABB);
        assert_eq!(cfg.read8(0x13), 0xAA);

        cfg.write16(0x12, 0x1122);
        assert_eq!(cfg.read32(0x10), 0x1122_CCDD);
        cfg.write8(0x10, 0xEE);
        assert_eq!(cfg.read32(0x10), 0x1122_CCEE);
    }

    #[test]
    fn command_bits_match_the_header_layout() {
        assert_eq!(Command::INTERRUPT_DISABLE.bits(), 1 << 10);
        assert_eq!(Status::INTERRUPT_STATUS.bits(), 1 << 3);
        assert_eq!(PciCommonCfgOffset::Command as u16, 0x04);
        assert_eq!(PciCommonCfgOffset::InterruptPin as u16, 0x3D);
    }
}
