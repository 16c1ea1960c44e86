use crate::bar::PciIoRegion;
use crate::bridge::{BridgeResetPolicy, BridgeState};
use crate::config::PciConfigSpace;
use crate::error::Result;
use crate::irq_router::pci_swizzle;
use crate::regs::{PciBarType, PCI_NUM_REGIONS, PCI_ROM_SLOT};
use crate::{BusId, PciDevFn};

/// A device model plugged into the fabric.
///
/// The model owns its config space. The fabric reads and writes it on the guest's behalf and
/// applies the bus-level side effects (BAR decoding, INTx masking, bridge windows) around the
/// model's own `config_read`/`config_write` hooks.
pub trait PciDevice: Send {
    fn config(&self) -> &PciConfigSpace;
    fn config_mut(&mut self) -> &mut PciConfigSpace;

    /// Called once while the function is being registered, before it becomes visible on the bus.
    /// BARs and VGA ranges are declared here; an error aborts the registration.
    fn realize(&mut self, _setup: &mut PciDeviceSetup) -> Result<()> {
        Ok(())
    }

    /// Called when the function is being removed from its bus.
    fn exit(&mut self) {}

    /// Model-specific reset, run before the generic function reset.
    fn reset(&mut self) {}

    fn config_read(&mut self, offset: u16, size: usize) -> u32 {
        self.config().read(offset, size)
    }

    fn config_write(&mut self, offset: u16, size: usize, value: u32) {
        self.config_mut().write(offset, size, value);
    }

    /// For bridges: maps a pin of a function on the secondary bus to a pin on the primary bus.
    fn map_irq(&self, devfn: PciDevFn, pin: usize) -> usize {
        pci_swizzle(devfn, pin)
    }

    /// For bridges: what the forwarding windows hold after a reset.
    fn bridge_reset_policy(&self) -> BridgeResetPolicy {
        BridgeResetPolicy::Zero
    }

    /// Fired when an upstream routing table changed and the pin-to-IRQ route may be different.
    fn intx_routing_changed(&mut self) {}
}

/// Resources a device model declares while it is being realized.
#[derive(Debug, Default)]
pub struct PciDeviceSetup {
    pub(crate) bars: Vec<(usize, PciBarType, u64)>,
    pub(crate) vga: bool,
    pub(crate) secondary_bus_name: Option<String>,
}

impl PciDeviceSetup {
    /// Declares BAR `region` (or the expansion ROM, [`PCI_ROM_SLOT`]).
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a power of two or `region` is out of range. A 64-bit memory BAR
    /// also consumes `region + 1`, which can then not be declared on its own.
    pub fn register_bar(&mut self, region: usize, ty: PciBarType, size: u64) {
        assert!(region < PCI_NUM_REGIONS, "BAR index {region} out of range");
        assert!(size.is_power_of_two(), "BAR size {size:#x} is not a power of two");
        if region == PCI_ROM_SLOT {
            assert!(!ty.is_io(), "expansion ROM must be memory");
        }
        assert!(
            !self.bars.iter().any(|(r, t, _)| t.is_64bit() && r + 1 == region),
            "BAR {region} is the upper half of 64-bit BAR {}",
            region.wrapping_sub(1)
        );
        if ty.is_64bit() {
            assert!(region + 1 < PCI_ROM_SLOT, "64-bit BAR {region} has no upper half");
            assert!(
                !self.bars.iter().any(|(r, _, _)| *r == region + 1),
                "upper half of 64-bit BAR {region} is already declared"
            );
        }
        self.bars.retain(|(r, _, _)| *r != region);
        self.bars.push((region, ty, size));
    }

    /// Claims the legacy VGA memory and I/O ranges.
    pub fn register_vga(&mut self) {
        self.vga = true;
    }

    /// Names the secondary bus a bridge creates.
    pub fn secondary_bus_name(&mut self, name: impl Into<String>) {
        self.secondary_bus_name = Some(name.into());
    }
}

/// A function registered on a bus: the device model plus the state the fabric keeps for it.
pub struct PciFunction {
    pub(crate) name: String,
    pub(crate) bus: BusId,
    pub(crate) devfn: PciDevFn,
    pub(crate) regions: [PciIoRegion; PCI_NUM_REGIONS],
    /// One bit per INTx pin as last driven by the device.
    pub(crate) irq_state: u8,
    pub(crate) hotplugged: bool,
    pub(crate) has_power: bool,
    pub(crate) bus_master: bool,
    pub(crate) vga: bool,
    pub(crate) bridge: Option<BridgeState>,
    pub(crate) model: Box<dyn PciDevice>,
}

impl PciFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> BusId {
        self.bus
    }

    pub fn devfn(&self) -> PciDevFn {
        self.devfn
    }

    pub fn config(&self) -> &PciConfigSpace {
        self.model.config()
    }

    pub fn model(&self) -> &dyn PciDevice {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn PciDevice {
        self.model.as_mut()
    }

    pub fn region(&self, index: usize) -> &PciIoRegion {
        &self.regions[index]
    }

    pub fn irq_state(&self) -> u8 {
        self.irq_state
    }

    pub fn is_hotplugged(&self) -> bool {
        self.hotplugged
    }

    pub fn has_power(&self) -> bool {
        self.has_power
    }

    /// Whether the function may currently initiate DMA.
    pub fn bus_master_enabled(&self) -> bool {
        self.bus_master
    }

    pub fn is_bridge(&self) -> bool {
        self.bridge.is_some()
    }

    /// The bus behind this function, for bridges.
    pub fn secondary_bus(&self) -> Option<BusId> {
        self.bridge.as_ref().map(|bridge| bridge.secondary)
    }

    pub(crate) fn irq_disabled(&self) -> bool {
        self.config()
            .command()
            .contains(crate::regs::PciCommand::INTX_DISABLE)
    }

    pub(crate) fn pin_level(&self, pin: usize) -> bool {
        self.irq_state & (1 << pin) != 0
    }

    pub(crate) fn set_pin_level(&mut self, pin: usize, level: bool) {
        if level {
            self.irq_state |= 1 << pin;
        } else {
            self.irq_state &= !(1 << pin);
        }
    }

    /// Mirrors `irq_state` into the INTERRUPT status bit.
    pub(crate) fn update_irq_status(&mut self) {
        let pending = self.irq_state != 0;
        self.model
            .config_mut()
            .set_status_bits(crate::regs::PciStatus::INTERRUPT, pending);
    }
}

impl core::fmt::Debug for PciFunction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PciFunction")
            .field("name", &self.name)
            .field("bus", &self.bus)
            .field("devfn", &self.devfn)
            .field("irq_state", &self.irq_state)
            .field("hotplugged", &self.hotplugged)
            .field("has_power", &self.has_power)
            .finish_non_exhaustive()
    }
}
