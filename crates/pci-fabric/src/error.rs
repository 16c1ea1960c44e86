use thiserror::Error;

use crate::{BusId, DeviceId, PciDevFn};

pub type Result<T> = std::result::Result<T, PciError>;

/// Recoverable topology and configuration errors.
///
/// None of these leave the bus or device arrays partially updated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PciError {
    #[error("devfn {devfn} is reserved on bus {bus}")]
    SlotReserved { bus: String, devfn: PciDevFn },

    #[error("devfn {devfn} on bus {bus} is already occupied by {occupant}")]
    SlotOccupied {
        bus: String,
        devfn: PciDevFn,
        occupant: String,
    },

    #[error("no free slot on bus {bus}")]
    NoFreeSlot { bus: String },

    #[error("slot {slot} function 0 must be present before hot-plugging function {function}")]
    FunctionZeroMissing { slot: u8, function: u8 },

    #[error("slot {slot} function 0 is not multifunction; function {function} cannot be added")]
    FunctionZeroNotMultifunction { slot: u8, function: u8 },

    #[error("slot {slot} already has functions above 0; function 0 must be multifunction")]
    SingleFunctionSlot { slot: u8 },

    #[error("only PCI bridges can be attached to expander root bus {bus}")]
    OnlyBridgesAllowed { bus: String },

    #[error("unknown PCI device {0:?}")]
    DeviceNotFound(DeviceId),

    #[error("unknown PCI bus {0:?}")]
    BusNotFound(BusId),

    #[error("no PCI device matches {0}")]
    NoSuchDevice(String),

    #[error("capability 0x{id:02x} at 0x{offset:02x}+{size} overlaps an existing capability at 0x{conflict:02x}")]
    CapabilityOverlap {
        id: u8,
        offset: u16,
        size: u8,
        conflict: u16,
    },

    #[error("capability 0x{0:02x} is not present")]
    CapabilityNotFound(u8),

    #[error("{0} is not a PCI bridge")]
    NotABridge(String),

    #[error("bridge {0} still has devices on its secondary bus")]
    BridgeNotEmpty(String),

    #[error("invalid PCI address {0:?}")]
    InvalidAddress(String),

    #[error("PIRQ index {0} out of range")]
    InvalidPirq(usize),

    #[error("device realize failed: {0}")]
    Realize(String),
}
