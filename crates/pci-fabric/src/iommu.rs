use std::sync::Arc;

use crate::address_space::FlatViewReader;
use crate::bus::PciBusKind;
use crate::error::{PciError, Result};
use crate::fabric::PciFabric;
use crate::regs::PCI_EXP_TYPE_PCI_BRIDGE;
use crate::{BusId, DeviceId, PciDevFn};

/// Per-bus DMA translation hook.
///
/// Implementations own their locking; the fabric only calls them from `&self` paths.
pub trait PciIommu: Send + Sync {
    /// Address space seen by requester `devfn` on `bus` (after aliasing).
    fn address_space_for(&self, bus: BusId, bus_number: u8, devfn: PciDevFn) -> DmaAddressSpace;
}

/// Where a function's DMA lands.
#[derive(Clone, Debug)]
pub enum DmaAddressSpace {
    /// Bus mastering is off or the function has no power.
    Disabled,
    /// Untranslated: the root bus memory space.
    System(FlatViewReader),
    /// Translated by an IOMMU for the given (possibly aliased) requester.
    Translated {
        requester_bus: u8,
        requester_devfn: PciDevFn,
        view: FlatViewReader,
    },
}

impl PciFabric {
    pub fn set_iommu(&mut self, bus: BusId, iommu: Arc<dyn PciIommu>) -> Result<()> {
        self.buses
            .get_mut(&bus)
            .ok_or(PciError::BusNotFound(bus))?
            .iommu = Some(iommu);
        Ok(())
    }

    /// Resolves the address space DMA from `id` goes to, ignoring the bus master state.
    ///
    /// The walk climbs to the first bus with an IOMMU. Crossing a conventional (non-express)
    /// bus aliases the requester: behind a PCIe-to-PCI bridge to devfn 0 of that bus, otherwise
    /// to the bridge itself.
    pub fn iommu_address_space(&self, id: DeviceId) -> Option<DmaAddressSpace> {
        let function = self.devices.get(&id)?;
        let mut bus = function.bus;
        let mut devfn = function.devfn;
        let mut iommu_bus = bus;

        loop {
            let entry = self.bus_ref(iommu_bus);
            if entry.iommu.is_some() {
                break;
            }
            let Some(parent) = self.parent_device(iommu_bus) else {
                break;
            };
            let parent_fn = self.func(parent);
            if !entry.express {
                let behind_pcie_bridge = parent_fn.config().is_express()
                    && parent_fn.config().express_port_type() == Some(PCI_EXP_TYPE_PCI_BRIDGE);
                if behind_pcie_bridge {
                    devfn = PciDevFn::new(0, 0);
                    bus = iommu_bus;
                } else {
                    devfn = parent_fn.devfn;
                    bus = parent_fn.bus;
                }
            }
            iommu_bus = parent_fn.bus;
        }

        let system = || self.spaces.reader(self.bus_ref(self.root_bus()).mem);
        match &self.bus_ref(iommu_bus).iommu {
            Some(iommu) if !self.bypasses_iommu(bus) => {
                Some(iommu.address_space_for(bus, self.bus_number(bus), devfn))
            }
            _ => system().map(DmaAddressSpace::System),
        }
    }

    /// The DMA target of a function, honouring bus master enable.
    pub fn dma_address_space(&self, id: DeviceId) -> DmaAddressSpace {
        match self.devices.get(&id) {
            Some(function) if function.bus_master => self
                .iommu_address_space(id)
                .unwrap_or(DmaAddressSpace::Disabled),
            _ => DmaAddressSpace::Disabled,
        }
    }

    /// Whether the root `bus` hangs off asked for DMA to skip the IOMMU.
    fn bypasses_iommu(&self, mut bus: BusId) -> bool {
        loop {
            let entry = self.bus_ref(bus);
            match entry.kind {
                PciBusKind::Secondary { bridge } => bus = self.func(bridge).bus,
                PciBusKind::Root | PciBusKind::ExpanderRoot { .. } => return entry.bypass_iommu,
            }
        }
    }
}
