//! PCI bus fabric: bus topology, configuration space, BAR decoding, INTx routing, bridge
//! forwarding windows and hot-plug.
//!
//! A [`PciFabric`] owns every bus and function in arenas keyed by [`BusId`] and [`DeviceId`].
//! Device models implement [`PciDevice`] and own their [`PciConfigSpace`]; the fabric drives
//! the side effects of guest config accesses (remapping BARs and bridge windows, INTx
//! re-evaluation, secondary bus resets) and publishes the resulting address maps through
//! [`AddressSpaces`].

pub mod address_space;
pub mod capabilities;
pub mod class;
pub mod config;
pub mod regs;

mod bar;
mod bios;
mod bridge;
mod bus;
mod device;
mod error;
mod fabric;
mod hotplug;
mod iommu;
mod irq_router;
mod ports;
mod resources;
mod snapshot;

pub use address_space::{
    AddressSpaceId, AddressSpaceKind, AddressSpaceListener, AddressSpaces, BridgeWindow,
    FlatRange, FlatTarget, FlatView, FlatViewReader, Mapping, MappingKey, MappingTarget,
};
pub use bar::PciIoRegion;
pub use bios::bios_post;
pub use bridge::{BridgeResetPolicy, PciBridgeWindows};
pub use bus::{PciBus, PciBusKind, PciBusSpec, WalkOrder};
pub use capabilities::{add_express_capability, add_vendor_capability, PcieLink};
pub use config::{
    PciClassCode, PciConfigMask, PciConfigSpace, PciSubsystemIds, PciVendorDeviceId,
};
pub use device::{PciDevice, PciDeviceSetup, PciFunction};
pub use error::{PciError, Result};
pub use fabric::{PciFabric, PciFabricConfig, SharedPciFabric};
pub use hotplug::{HotplugError, HotplugHandler};
pub use iommu::{DmaAddressSpace, PciIommu};
pub use irq_router::{
    pci_swizzle, GsiLevelSink, PciIntxRoute, PciIntxRouter, PciIntxRouterConfig, PciIrqSink,
};
pub use ports::{PciConfigMechanism1, PCI_CFG_ADDR_PORT, PCI_CFG_DATA_PORT};
pub use resources::{PciResourceAllocator, PciResourceAllocatorConfig, PciResourceError};
pub use snapshot::{SnapshotError, PCI_DEVICE_SNAPSHOT_VERSION};

use core::fmt;
use core::str::FromStr;

/// Arena handle of a registered function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub(crate) u32);

/// Arena handle of a bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BusId(pub(crate) u32);

/// Combined slot/function address on one bus; also the index into the bus slot table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciDevFn(u8);

impl PciDevFn {
    /// # Panics
    ///
    /// Panics if `slot >= 32` or `function >= 8`.
    pub const fn new(slot: u8, function: u8) -> Self {
        assert!(slot < regs::PCI_SLOT_MAX);
        assert!(function < regs::PCI_FUNC_MAX);
        Self((slot << 3) | function)
    }

    pub const fn from_raw(devfn: u8) -> Self {
        Self(devfn)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn slot(self) -> u8 {
        self.0 >> 3
    }

    pub const fn function(self) -> u8 {
        self.0 & 7
    }

    /// Function 0 of the same slot.
    pub const fn function_zero(self) -> Self {
        Self(self.0 & !7)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PciDevFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}.{}", self.slot(), self.function())
    }
}

/// PCI bus/device/function identifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    /// Creates a new BDF.
    ///
    /// The caller is responsible for ensuring the values are within the PCI ranges:
    /// bus < 256, device < 32, function < 8.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    pub const fn devfn(self) -> PciDevFn {
        PciDevFn::new(self.device, self.function)
    }

    /// Packs this BDF into the bus/devfn layout of a mechanism #1 config address, shifted
    /// right by 8.
    pub const fn pack_u16(self) -> u16 {
        debug_assert!(self.device < 32);
        debug_assert!(self.function < 8);
        ((self.bus as u16) << 8) | ((self.device as u16) << 3) | (self.function as u16)
    }

    pub const fn unpack_u16(v: u16) -> Self {
        Self {
            bus: (v >> 8) as u8,
            device: ((v >> 3) & 0x1f) as u8,
            function: (v & 0x7) as u8,
        }
    }
}

impl From<PciBdf> for u16 {
    fn from(value: PciBdf) -> Self {
        value.pack_u16()
    }
}

impl From<u16> for PciBdf {
    fn from(value: u16) -> Self {
        Self::unpack_u16(value)
    }
}

impl core::cmp::Ord for PciBdf {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.bus, self.device, self.function).cmp(&(other.bus, other.device, other.function))
    }
}

impl core::cmp::PartialOrd for PciBdf {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// A user-supplied `[[domain:]bus:]slot[.function]` address, all fields hexadecimal except the
/// function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = PciError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PciError::InvalidAddress(s.to_string());
        let hex = |part: &str, max: u32| {
            if part.is_empty() {
                return Err(invalid());
            }
            u32::from_str_radix(part, 16)
                .ok()
                .filter(|v| *v <= max)
                .ok_or_else(invalid)
        };

        let (rest, function) = match s.split_once('.') {
            Some((rest, func)) => {
                let func: u8 = func.parse().map_err(|_| invalid())?;
                if func >= regs::PCI_FUNC_MAX {
                    return Err(invalid());
                }
                (rest, func)
            }
            None => (s, 0),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let (domain, bus, slot) = match parts.as_slice() {
            [slot] => (0, 0, hex(*slot, 0x1f)?),
            [bus, slot] => (0, hex(*bus, 0xff)?, hex(*slot, 0x1f)?),
            [domain, bus, slot] => (hex(*domain, 0xffff)?, hex(*bus, 0xff)?, hex(*slot, 0x1f)?),
            _ => return Err(invalid()),
        };

        Ok(Self {
            domain: domain as u16,
            bus: bus as u8,
            slot: slot as u8,
            function,
        })
    }
}

/// PCI INTx interrupt pin.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PciInterruptPin {
    IntA,
    IntB,
    IntC,
    IntD,
}

impl PciInterruptPin {
    pub const ALL: [Self; 4] = [Self::IntA, Self::IntB, Self::IntC, Self::IntD];

    pub const fn index(self) -> usize {
        match self {
            Self::IntA => 0,
            Self::IntB => 1,
            Self::IntC => 2,
            Self::IntD => 3,
        }
    }

    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::IntA),
            1 => Some(Self::IntB),
            2 => Some(Self::IntC),
            3 => Some(Self::IntD),
            _ => None,
        }
    }

    /// Converts to the PCI config-space encoding (1 = INTA#, 2 = INTB#, ...).
    pub const fn to_config_u8(self) -> u8 {
        self.index() as u8 + 1
    }

    pub const fn from_config_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::IntA),
            2 => Some(Self::IntB),
            3 => Some(Self::IntC),
            4 => Some(Self::IntD),
            _ => None,
        }
    }
}
