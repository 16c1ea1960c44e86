use thiserror::Error;
use tracing::warn;

use crate::device::{PciDevice, PciFunction};
use crate::error::PciError;
use crate::fabric::PciFabric;
use crate::regs::PCI_FUNC_MAX;
use crate::{BusId, DeviceId, PciDevFn};

#[derive(Debug, Error)]
pub enum HotplugError {
    #[error("bus {0} does not support hot-plug")]
    Unsupported(String),

    #[error("hot-plug refused: {0}")]
    Refused(String),

    #[error("function 0 of slot {slot} must be removed after the other functions of the slot")]
    FunctionZeroBusy { slot: u8 },

    #[error(transparent)]
    Pci(#[from] PciError),
}

/// Platform hot-plug controller attached to a bus (ACPI, SHPC, a PCIe slot, ...).
pub trait HotplugHandler: Send {
    /// Vetoes a function before it is registered.
    fn pre_plug(
        &mut self,
        _devfn: Option<PciDevFn>,
        _device: &dyn PciDevice,
    ) -> Result<(), HotplugError> {
        Ok(())
    }

    /// The function is registered and visible on the bus.
    fn plug(&mut self, function: &PciFunction) -> Result<(), HotplugError>;

    /// Asks the guest to release the function; removal follows later through
    /// [`PciFabric::hot_unplug`].
    fn unplug_request(&mut self, function: &PciFunction) -> Result<(), HotplugError>;

    /// The function is about to be removed.
    fn unplug(&mut self, function: &PciFunction) -> Result<(), HotplugError>;
}

impl PciFabric {
    pub fn set_hotplug_handler(
        &mut self,
        bus: BusId,
        handler: Box<dyn HotplugHandler>,
    ) -> Result<(), PciError> {
        self.buses
            .get_mut(&bus)
            .ok_or(PciError::BusNotFound(bus))?
            .hotplug = Some(handler);
        Ok(())
    }

    /// Registers `model` on `bus` through the bus's hot-plug handler. The registration is rolled
    /// back if the handler refuses to plug it.
    pub fn hot_plug(
        &mut self,
        bus: BusId,
        devfn: Option<PciDevFn>,
        name: impl Into<String>,
        model: Box<dyn PciDevice>,
    ) -> Result<DeviceId, HotplugError> {
        let name = name.into();
        let entry = self.buses.get_mut(&bus).ok_or(PciError::BusNotFound(bus))?;
        let bus_name = entry.name.clone();
        let handler = entry
            .hotplug
            .as_mut()
            .ok_or(HotplugError::Unsupported(bus_name))?;
        handler.pre_plug(devfn, model.as_ref())?;

        let id = self.register_device(bus, devfn, name, model)?;

        let Self { buses, devices, .. } = &mut *self;
        let handler = buses
            .get_mut(&bus)
            .and_then(|entry| entry.hotplug.as_mut())
            .expect("hot-plug handler checked above");
        let function = devices.get(&id).expect("just registered");
        if let Err(err) = handler.plug(function) {
            warn!(name = %function.name(), %err, "hot-plug refused; rolling back");
            self.unregister_device(id)?;
            return Err(err);
        }
        Ok(id)
    }

    /// Starts guest-cooperative removal of a function.
    pub fn hot_unplug_request(&mut self, id: DeviceId) -> Result<(), HotplugError> {
        self.check_function_zero_last(id)?;
        let Self { buses, devices, .. } = &mut *self;
        let function = devices.get(&id).ok_or(PciError::DeviceNotFound(id))?;
        let entry = buses.get_mut(&function.bus()).ok_or(PciError::BusNotFound(function.bus()))?;
        let handler = entry
            .hotplug
            .as_mut()
            .ok_or_else(|| HotplugError::Unsupported(entry.name.clone()))?;
        handler.unplug_request(function)
    }

    /// Removes a function through its bus's hot-plug handler: INTx is deasserted and all regions
    /// are unmapped before the slot is freed. The handler is only told once removal cannot fail.
    pub fn hot_unplug(&mut self, id: DeviceId) -> Result<Box<dyn PciDevice>, HotplugError> {
        self.check_function_zero_last(id)?;
        self.check_removable(id)?;
        {
            let Self { buses, devices, .. } = &mut *self;
            let function = devices.get(&id).ok_or(PciError::DeviceNotFound(id))?;
            let entry = buses
                .get_mut(&function.bus())
                .ok_or(PciError::BusNotFound(function.bus()))?;
            let handler = entry
                .hotplug
                .as_mut()
                .ok_or_else(|| HotplugError::Unsupported(entry.name.clone()))?;
            handler.unplug(function)?;
        }
        Ok(self.unregister_device(id)?)
    }

    fn check_function_zero_last(&self, id: DeviceId) -> Result<(), HotplugError> {
        let function = self.devices.get(&id).ok_or(PciError::DeviceNotFound(id))?;
        let devfn = function.devfn();
        if devfn.function() != 0 {
            return Ok(());
        }
        let bus = self.bus_ref(function.bus());
        let siblings = (1..PCI_FUNC_MAX)
            .any(|func| bus.device_at(PciDevFn::new(devfn.slot(), func)).is_some());
        if siblings {
            warn!(
                name = %function.name(),
                "function 0 unplug refused while other functions remain"
            );
            return Err(HotplugError::FunctionZeroBusy { slot: devfn.slot() });
        }
        Ok(())
    }
}
