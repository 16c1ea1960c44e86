use std::sync::Arc;

use crate::address_space::AddressSpaceId;
use crate::hotplug::HotplugHandler;
use crate::iommu::PciIommu;
use crate::irq_router::{BusIrq, MapIrqFn, RouteIntxFn};
use crate::regs::PCI_DEVFN_MAX;
use crate::{DeviceId, PciDevFn};

/// Where a bus sits in the hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciBusKind {
    /// The host bridge's bus.
    Root,
    /// An additional root bus hosted by an expander device on another bus.
    ExpanderRoot { host: DeviceId },
    /// The secondary side of a PCI-to-PCI bridge.
    Secondary { bridge: DeviceId },
}

/// Parameters of an expander root bus.
#[derive(Clone, Debug)]
pub struct PciBusSpec {
    pub name: String,
    pub number: u8,
    pub devfn_min: u8,
    /// Bit `n` reserves slot `n` against any registration.
    pub slot_reserved_mask: u32,
    pub express: bool,
    pub bypass_iommu: bool,
}

impl PciBusSpec {
    pub fn new(name: impl Into<String>, number: u8) -> Self {
        Self {
            name: name.into(),
            number,
            devfn_min: 0,
            slot_reserved_mask: 0,
            express: false,
            bypass_iommu: false,
        }
    }
}

/// Order used when walking a bus's devfn table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkOrder {
    Forward,
    Reverse,
}

pub struct PciBus {
    pub(crate) name: String,
    pub(crate) kind: PciBusKind,
    /// Bus number of a root or expander root; secondary buses read it from their bridge.
    pub(crate) number: u8,
    pub(crate) slots: [Option<DeviceId>; PCI_DEVFN_MAX],
    pub(crate) devfn_min: u8,
    pub(crate) slot_reserved_mask: u32,
    pub(crate) irq: Option<BusIrq>,
    pub(crate) map_irq: Option<MapIrqFn>,
    pub(crate) route_intx: Option<RouteIntxFn>,
    /// Secondary buses of bridges on this bus and expander roots hosted here.
    pub(crate) children: Vec<crate::BusId>,
    pub(crate) mem: AddressSpaceId,
    pub(crate) io: AddressSpaceId,
    pub(crate) iommu: Option<Arc<dyn PciIommu>>,
    pub(crate) bypass_iommu: bool,
    pub(crate) express: bool,
    pub(crate) hotplug: Option<Box<dyn HotplugHandler>>,
}

impl PciBus {
    pub(crate) fn new(
        name: String,
        kind: PciBusKind,
        mem: AddressSpaceId,
        io: AddressSpaceId,
    ) -> Self {
        Self {
            name,
            kind,
            number: 0,
            slots: [None; PCI_DEVFN_MAX],
            devfn_min: 0,
            slot_reserved_mask: 0,
            irq: None,
            map_irq: None,
            route_intx: None,
            children: Vec::new(),
            mem,
            io,
            iommu: None,
            bypass_iommu: false,
            express: false,
            hotplug: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PciBusKind {
        self.kind
    }

    pub fn is_root(&self) -> bool {
        !matches!(self.kind, PciBusKind::Secondary { .. })
    }

    pub fn is_express(&self) -> bool {
        self.express
    }

    pub fn memory_space(&self) -> AddressSpaceId {
        self.mem
    }

    pub fn io_space(&self) -> AddressSpaceId {
        self.io
    }

    pub fn children(&self) -> &[crate::BusId] {
        &self.children
    }

    pub fn device_at(&self, devfn: PciDevFn) -> Option<DeviceId> {
        self.slots[devfn.index()]
    }

    pub fn is_reserved(&self, devfn: PciDevFn) -> bool {
        self.slot_reserved_mask & (1 << devfn.slot()) != 0
    }

    pub fn has_irq_sink(&self) -> bool {
        self.irq.is_some()
    }

    /// Occupied devfns in the requested order.
    pub fn devices(&self, order: WalkOrder) -> Vec<(PciDevFn, DeviceId)> {
        let iter = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(devfn, id)| Some((PciDevFn::from_raw(devfn as u8), (*id)?)));
        match order {
            WalkOrder::Forward => iter.collect(),
            WalkOrder::Reverse => iter.rev().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// First function-0 devfn at or after `devfn_min` that is neither reserved nor occupied.
    pub(crate) fn free_devfn(&self) -> Option<PciDevFn> {
        (usize::from(self.devfn_min)..PCI_DEVFN_MAX)
            .step_by(usize::from(crate::regs::PCI_FUNC_MAX))
            .map(|devfn| PciDevFn::from_raw(devfn as u8))
            .find(|devfn| !self.is_reserved(*devfn) && self.slots[devfn.index()].is_none())
    }
}

impl core::fmt::Debug for PciBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PciBus")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("number", &self.number)
            .field("children", &self.children)
            .field("express", &self.express)
            .finish_non_exhaustive()
    }
}
