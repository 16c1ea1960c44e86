//! Register offsets and bit definitions for the type 0/1 configuration headers.

use bitflags::bitflags;

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
pub const PCIE_CONFIG_SPACE_SIZE: usize = 4096;

/// First byte after the standard header; capabilities live at or above this offset.
pub const PCI_CONFIG_HEADER_SIZE: usize = 0x40;

pub const PCI_VENDOR_ID: usize = 0x00;
pub const PCI_DEVICE_ID: usize = 0x02;
pub const PCI_COMMAND: usize = 0x04;
pub const PCI_STATUS: usize = 0x06;
pub const PCI_REVISION_ID: usize = 0x08;
pub const PCI_CLASS_PROG: usize = 0x09;
pub const PCI_CLASS_DEVICE: usize = 0x0a;
pub const PCI_CACHE_LINE_SIZE: usize = 0x0c;
pub const PCI_LATENCY_TIMER: usize = 0x0d;
pub const PCI_HEADER_TYPE: usize = 0x0e;
pub const PCI_BASE_ADDRESS_0: usize = 0x10;
pub const PCI_SUBSYSTEM_VENDOR_ID: usize = 0x2c;
pub const PCI_SUBSYSTEM_ID: usize = 0x2e;
pub const PCI_ROM_ADDRESS: usize = 0x30;
pub const PCI_CAPABILITY_LIST: usize = 0x34;
pub const PCI_INTERRUPT_LINE: usize = 0x3c;
pub const PCI_INTERRUPT_PIN: usize = 0x3d;

pub const PCI_HEADER_TYPE_NORMAL: u8 = 0x00;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 0x01;
pub const PCI_HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;

// Type 1 header.
pub const PCI_PRIMARY_BUS: usize = 0x18;
pub const PCI_SECONDARY_BUS: usize = 0x19;
pub const PCI_SUBORDINATE_BUS: usize = 0x1a;
pub const PCI_SEC_LATENCY_TIMER: usize = 0x1b;
pub const PCI_IO_BASE: usize = 0x1c;
pub const PCI_IO_LIMIT: usize = 0x1d;
pub const PCI_SEC_STATUS: usize = 0x1e;
pub const PCI_MEMORY_BASE: usize = 0x20;
pub const PCI_MEMORY_LIMIT: usize = 0x22;
pub const PCI_PREF_MEMORY_BASE: usize = 0x24;
pub const PCI_PREF_MEMORY_LIMIT: usize = 0x26;
pub const PCI_PREF_BASE_UPPER32: usize = 0x28;
pub const PCI_PREF_LIMIT_UPPER32: usize = 0x2c;
pub const PCI_IO_BASE_UPPER16: usize = 0x30;
pub const PCI_IO_LIMIT_UPPER16: usize = 0x32;
pub const PCI_ROM_ADDRESS1: usize = 0x38;
pub const PCI_BRIDGE_CONTROL: usize = 0x3e;

pub const PCI_IO_RANGE_TYPE_MASK: u8 = 0x0f;
pub const PCI_IO_RANGE_TYPE_16: u8 = 0x00;
pub const PCI_IO_RANGE_TYPE_32: u8 = 0x01;
pub const PCI_IO_RANGE_MASK: u8 = 0xf0;
pub const PCI_MEMORY_RANGE_TYPE_MASK: u16 = 0x000f;
pub const PCI_MEMORY_RANGE_MASK: u16 = 0xfff0;
pub const PCI_PREF_RANGE_TYPE_MASK: u16 = 0x000f;
pub const PCI_PREF_RANGE_TYPE_64: u16 = 0x0001;
pub const PCI_PREF_RANGE_MASK: u16 = 0xfff0;

pub const PCI_ROM_ADDRESS_ENABLE: u32 = 0x01;
pub const PCI_ROM_SLOT: usize = 6;
pub const PCI_NUM_REGIONS: usize = 7;
pub const PCI_NUM_PINS: usize = 4;

pub const PCI_BAR_UNMAPPED: u64 = u64::MAX;

pub const PCI_SLOT_MAX: u8 = 32;
pub const PCI_FUNC_MAX: u8 = 8;
pub const PCI_DEVFN_MAX: usize = 256;

// Capability IDs.
pub const PCI_CAP_ID_PM: u8 = 0x01;
pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_VNDR: u8 = 0x09;
pub const PCI_CAP_ID_SSVID: u8 = 0x0d;
pub const PCI_CAP_ID_EXP: u8 = 0x10;
pub const PCI_CAP_ID_MSIX: u8 = 0x11;

// PCI Express capability layout (offsets relative to the capability).
pub const PCI_EXP_FLAGS: usize = 0x02;
pub const PCI_EXP_FLAGS_TYPE: u16 = 0x00f0;
pub const PCI_EXP_LNKCAP: usize = 0x0c;
pub const PCI_EXP_LNKSTA: usize = 0x12;
pub const PCI_EXP_LNKSTA_CLS: u16 = 0x000f;
pub const PCI_EXP_LNKSTA_NLW: u16 = 0x03f0;
pub const PCI_EXP_LNKSTA_DLLLA: u16 = 0x2000;
pub const PCI_EXP_VER2_SIZEOF: u8 = 0x3c;

pub const PCI_EXP_TYPE_ENDPOINT: u8 = 0x0;
pub const PCI_EXP_TYPE_ROOT_PORT: u8 = 0x4;
pub const PCI_EXP_TYPE_UPSTREAM: u8 = 0x5;
pub const PCI_EXP_TYPE_DOWNSTREAM: u8 = 0x6;
pub const PCI_EXP_TYPE_PCI_BRIDGE: u8 = 0x7;
pub const PCI_EXP_TYPE_RC_END: u8 = 0x9;

// Legacy VGA ranges.
pub const PCI_VGA_MEM_BASE: u64 = 0xa_0000;
pub const PCI_VGA_MEM_SIZE: u64 = 0x2_0000;
pub const PCI_VGA_IO_LO_BASE: u64 = 0x3b0;
pub const PCI_VGA_IO_LO_SIZE: u64 = 0xc;
pub const PCI_VGA_IO_HI_BASE: u64 = 0x3c0;
pub const PCI_VGA_IO_HI_SIZE: u64 = 0x20;

bitflags! {
    /// Command register (offset 0x04).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PciCommand: u16 {
        const IO = 0x0001;
        const MEMORY = 0x0002;
        const MASTER = 0x0004;
        const SPECIAL = 0x0008;
        const INVALIDATE = 0x0010;
        const VGA_PALETTE = 0x0020;
        const PARITY = 0x0040;
        const WAIT = 0x0080;
        const SERR = 0x0100;
        const FAST_BACK = 0x0200;
        const INTX_DISABLE = 0x0400;
    }
}

bitflags! {
    /// Status register (offset 0x06).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PciStatus: u16 {
        const INTERRUPT = 0x0008;
        const CAP_LIST = 0x0010;
        const MHZ_66 = 0x0020;
        const FAST_BACK = 0x0080;
        const PARITY = 0x0100;
        const DEVSEL_MASK = 0x0600;
        const SIG_TARGET_ABORT = 0x0800;
        const REC_TARGET_ABORT = 0x1000;
        const REC_MASTER_ABORT = 0x2000;
        const SIG_SYSTEM_ERROR = 0x4000;
        const DETECTED_PARITY = 0x8000;

        /// Error bits the guest acknowledges by writing 1.
        const W1C = Self::PARITY.bits()
            | Self::SIG_TARGET_ABORT.bits()
            | Self::REC_TARGET_ABORT.bits()
            | Self::REC_MASTER_ABORT.bits()
            | Self::SIG_SYSTEM_ERROR.bits()
            | Self::DETECTED_PARITY.bits();
    }
}

bitflags! {
    /// Bridge control register (type 1 header, offset 0x3e).
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PciBridgeControl: u16 {
        const PARITY = 0x0001;
        const SERR = 0x0002;
        const ISA = 0x0004;
        const VGA = 0x0008;
        const VGA_16BIT = 0x0010;
        const MASTER_ABORT = 0x0020;
        const BUS_RESET = 0x0040;
        const FAST_BACK = 0x0080;
        const DISCARD = 0x0100;
        const SEC_DISCARD = 0x0200;
        const DISCARD_STATUS = 0x0400;
        const DISCARD_SERR = 0x0800;
    }
}

bitflags! {
    /// Low type bits of a BAR register.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct PciBarType: u8 {
        const IO = 0x01;
        const MEM_TYPE_64 = 0x04;
        const PREFETCH = 0x08;
    }
}

impl PciBarType {
    pub const MEM_32: Self = Self::empty();

    pub fn is_io(self) -> bool {
        self.contains(Self::IO)
    }

    pub fn is_64bit(self) -> bool {
        !self.is_io() && self.contains(Self::MEM_TYPE_64)
    }
}

/// Config-space offset of BAR `region`, or of the ROM register for [`PCI_ROM_SLOT`].
pub fn bar_offset(region: usize, is_bridge: bool) -> usize {
    if region == PCI_ROM_SLOT {
        if is_bridge {
            PCI_ROM_ADDRESS1
        } else {
            PCI_ROM_ADDRESS
        }
    } else {
        PCI_BASE_ADDRESS_0 + region * 4
    }
}

pub(crate) fn ranges_overlap(a_start: usize, a_len: usize, b_start: usize, b_len: usize) -> bool {
    a_start < b_start + b_len && b_start < a_start + a_len
}
