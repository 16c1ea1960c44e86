use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::address_space::{AddressSpaceKind, AddressSpaces};
use crate::bus::{PciBus, PciBusKind, PciBusSpec, WalkOrder};
use crate::class::class_description;
use crate::config::PciConfigSpace;
use crate::device::{PciDevice, PciDeviceSetup, PciFunction};
use crate::error::{PciError, Result};
use crate::regs::*;
use crate::{BusId, DeviceId, PciAddress, PciBdf, PciDevFn};

/// The fabric behind a single lock, for platforms that share it between vCPU and device threads.
pub type SharedPciFabric = Arc<Mutex<PciFabric>>;

#[derive(Debug, Clone)]
pub struct PciFabricConfig {
    pub root_bus_name: String,
    pub root_bus_number: u8,
    /// Lowest devfn handed out by automatic slot assignment on the root bus.
    pub devfn_min: u8,
    pub slot_reserved_mask: u32,
    /// Number of interrupt lines of the root bus sink.
    pub nirq: usize,
    /// Whether a BAR programmed to address 0 decodes.
    pub allow_zero_bar_address: bool,
    pub bypass_iommu: bool,
    pub express: bool,
}

impl Default for PciFabricConfig {
    fn default() -> Self {
        Self {
            root_bus_name: "pci.0".to_string(),
            root_bus_number: 0,
            devfn_min: 0,
            slot_reserved_mask: 0,
            nirq: PCI_NUM_PINS,
            allow_zero_bar_address: false,
            bypass_iommu: false,
            express: false,
        }
    }
}

/// Owns every bus and function of one PCI hierarchy together with the address spaces they decode
/// into.
pub struct PciFabric {
    pub(crate) cfg: PciFabricConfig,
    pub(crate) buses: BTreeMap<BusId, PciBus>,
    pub(crate) devices: BTreeMap<DeviceId, PciFunction>,
    pub(crate) spaces: AddressSpaces,
    root: BusId,
    next_bus: u32,
    next_device: u32,
    machine_ready: bool,
}

impl PciFabric {
    pub fn new(cfg: PciFabricConfig) -> Self {
        let mut spaces = AddressSpaces::new();
        let mem = spaces.create(format!("{}-mem", cfg.root_bus_name), AddressSpaceKind::Memory);
        let io = spaces.create(format!("{}-io", cfg.root_bus_name), AddressSpaceKind::Io);

        let mut root = PciBus::new(cfg.root_bus_name.clone(), PciBusKind::Root, mem, io);
        root.number = cfg.root_bus_number;
        root.devfn_min = cfg.devfn_min;
        root.slot_reserved_mask = cfg.slot_reserved_mask;
        root.bypass_iommu = cfg.bypass_iommu;
        root.express = cfg.express;

        let root_id = BusId(0);
        let mut buses = BTreeMap::new();
        buses.insert(root_id, root);

        Self {
            cfg,
            buses,
            devices: BTreeMap::new(),
            spaces,
            root: root_id,
            next_bus: 1,
            next_device: 0,
            machine_ready: false,
        }
    }

    pub fn into_shared(self) -> SharedPciFabric {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &PciFabricConfig {
        &self.cfg
    }

    pub fn root_bus(&self) -> BusId {
        self.root
    }

    pub fn address_spaces(&self) -> &AddressSpaces {
        &self.spaces
    }

    pub fn address_spaces_mut(&mut self) -> &mut AddressSpaces {
        &mut self.spaces
    }

    /// Marks machine construction as complete; functions registered from now on are hot-plugged.
    pub fn machine_done(&mut self) {
        self.machine_ready = true;
        let ids: Vec<DeviceId> = self.devices.keys().copied().collect();
        for id in ids {
            self.update_bus_master(id);
        }
    }

    pub fn is_machine_ready(&self) -> bool {
        self.machine_ready
    }

    pub fn bus(&self, id: BusId) -> Option<&PciBus> {
        self.buses.get(&id)
    }

    pub fn device(&self, id: DeviceId) -> Option<&PciFunction> {
        self.devices.get(&id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut PciFunction> {
        self.devices.get_mut(&id)
    }

    pub(crate) fn func(&self, id: DeviceId) -> &PciFunction {
        self.devices.get(&id).expect("stale PCI device id")
    }

    pub(crate) fn func_mut(&mut self, id: DeviceId) -> &mut PciFunction {
        self.devices.get_mut(&id).expect("stale PCI device id")
    }

    pub(crate) fn bus_ref(&self, id: BusId) -> &PciBus {
        self.buses.get(&id).expect("stale PCI bus id")
    }

    pub(crate) fn bus_mut(&mut self, id: BusId) -> &mut PciBus {
        self.buses.get_mut(&id).expect("stale PCI bus id")
    }

    /// Bus number as the guest sees it. Secondary buses take it from their bridge.
    pub fn bus_number(&self, bus: BusId) -> u8 {
        let bus = self.bus_ref(bus);
        match bus.kind {
            PciBusKind::Secondary { bridge } => self.func(bridge).config().byte(PCI_SECONDARY_BUS),
            PciBusKind::Root | PciBusKind::ExpanderRoot { .. } => bus.number,
        }
    }

    /// The device a bus hangs off: the bridge of a secondary bus or the host of an expander root.
    pub fn parent_device(&self, bus: BusId) -> Option<DeviceId> {
        match self.bus_ref(bus).kind {
            PciBusKind::Root => None,
            PciBusKind::ExpanderRoot { host } => Some(host),
            PciBusKind::Secondary { bridge } => Some(bridge),
        }
    }

    /// Adds a root bus hosted by `host`, listed among the children of `host`'s bus. It shares the
    /// host bus's address spaces and accepts only bridges.
    pub fn add_expander_root(&mut self, host: DeviceId, spec: PciBusSpec) -> Result<BusId> {
        let host_bus = self
            .devices
            .get(&host)
            .ok_or(PciError::DeviceNotFound(host))?
            .bus;
        let (mem, io) = {
            let parent = self.bus_ref(host_bus);
            (parent.mem, parent.io)
        };

        let mut bus = PciBus::new(spec.name, PciBusKind::ExpanderRoot { host }, mem, io);
        bus.number = spec.number;
        bus.devfn_min = spec.devfn_min;
        bus.slot_reserved_mask = spec.slot_reserved_mask;
        bus.express = spec.express;
        bus.bypass_iommu = spec.bypass_iommu;

        let id = self.alloc_bus(bus);
        self.bus_mut(host_bus).children.push(id);
        debug!(bus = %self.bus_ref(id).name, number = spec.number, "expander root bus added");
        Ok(id)
    }

    pub(crate) fn alloc_bus(&mut self, bus: PciBus) -> BusId {
        let id = BusId(self.next_bus);
        self.next_bus += 1;
        self.buses.insert(id, bus);
        id
    }

    /// Registers `model` on `bus` at `devfn`, or at the first free slot when `devfn` is `None`.
    ///
    /// Validation and the model's realize step run before the function becomes visible; on error
    /// the bus is unchanged.
    pub fn register_device(
        &mut self,
        bus: BusId,
        devfn: Option<PciDevFn>,
        name: impl Into<String>,
        mut model: Box<dyn PciDevice>,
    ) -> Result<DeviceId> {
        let name = name.into();
        let devfn = self.validate_registration(bus, devfn, model.config())?;

        let mut setup = PciDeviceSetup::default();
        model.realize(&mut setup)?;

        let is_bridge = model.config().is_bridge();
        if is_bridge {
            assert!(
                setup
                    .bars
                    .iter()
                    .all(|(region, _, _)| *region < 2 || *region == PCI_ROM_SLOT),
                "bridge {name} declares a BAR beyond BAR1"
            );
        }

        let id = DeviceId(self.next_device);
        self.next_device += 1;

        let function = PciFunction {
            name,
            bus,
            devfn,
            regions: [Default::default(); PCI_NUM_REGIONS],
            irq_state: 0,
            hotplugged: self.machine_ready,
            has_power: true,
            bus_master: false,
            vga: setup.vga,
            bridge: None,
            model,
        };
        self.devices.insert(id, function);
        self.bus_mut(bus).slots[devfn.index()] = Some(id);

        self.spaces.begin();
        self.register_regions(id, &setup.bars);
        self.update_vga(id);
        if is_bridge {
            self.attach_secondary_bus(id, setup.secondary_bus_name.take());
        }
        self.spaces.commit();

        let function = self.func(id);
        let class = function.config().class_code();
        info!(
            bdf = %self.device_bdf(id),
            name = %function.name,
            class = class_description(class.class, class.subclass),
            hotplugged = function.hotplugged,
            "PCI device registered"
        );
        Ok(id)
    }

    fn validate_registration(
        &self,
        bus_id: BusId,
        devfn: Option<PciDevFn>,
        cfg: &PciConfigSpace,
    ) -> Result<PciDevFn> {
        let bus = self.buses.get(&bus_id).ok_or(PciError::BusNotFound(bus_id))?;

        if matches!(bus.kind, PciBusKind::ExpanderRoot { .. }) && !cfg.is_bridge() {
            return Err(PciError::OnlyBridgesAllowed {
                bus: bus.name.clone(),
            });
        }

        let devfn = match devfn {
            None => bus.free_devfn().ok_or_else(|| PciError::NoFreeSlot {
                bus: bus.name.clone(),
            })?,
            Some(devfn) if bus.is_reserved(devfn) => {
                return Err(PciError::SlotReserved {
                    bus: bus.name.clone(),
                    devfn,
                })
            }
            Some(devfn) => {
                if let Some(occupant) = bus.device_at(devfn) {
                    return Err(PciError::SlotOccupied {
                        bus: bus.name.clone(),
                        devfn,
                        occupant: self.func(occupant).name.clone(),
                    });
                }
                devfn
            }
        };

        if self.machine_ready
            && devfn.function() != 0
            && self.function_zero(bus_id, devfn).is_none()
        {
            return Err(PciError::FunctionZeroMissing {
                slot: devfn.slot(),
                function: devfn.function(),
            });
        }

        let slot = devfn.slot();
        if devfn.function() != 0 {
            if let Some(f0) = bus.device_at(devfn.function_zero()) {
                if !self.func(f0).config().is_multifunction() {
                    return Err(PciError::FunctionZeroNotMultifunction {
                        slot,
                        function: devfn.function(),
                    });
                }
            }
        } else if !cfg.is_multifunction()
            && (1..PCI_FUNC_MAX).any(|func| bus.device_at(PciDevFn::new(slot, func)).is_some())
        {
            return Err(PciError::SingleFunctionSlot { slot });
        }

        Ok(devfn)
    }

    /// Function 0 of `devfn`'s slot. Below a PCIe root or downstream port only devfn 0 exists.
    pub(crate) fn function_zero(&self, bus: BusId, devfn: PciDevFn) -> Option<DeviceId> {
        let devfn = if self.has_upstream_port(bus) {
            PciDevFn::new(0, 0)
        } else {
            devfn.function_zero()
        };
        self.bus_ref(bus).device_at(devfn)
    }

    fn has_upstream_port(&self, bus: BusId) -> bool {
        let PciBusKind::Secondary { bridge } = self.bus_ref(bus).kind else {
            return false;
        };
        matches!(
            self.func(bridge).config().express_port_type(),
            Some(PCI_EXP_TYPE_ROOT_PORT | PCI_EXP_TYPE_DOWNSTREAM)
        )
    }

    /// Removes a function: INTx is deasserted, all regions are unmapped, the model's exit hook
    /// runs and the slot is freed. Bridges must have an empty secondary bus.
    pub fn unregister_device(&mut self, id: DeviceId) -> Result<Box<dyn PciDevice>> {
        self.check_removable(id)?;
        let is_bridge = self.func(id).is_bridge();

        self.deassert_intx(id);

        self.spaces.begin();
        self.unmap_regions(id);
        if is_bridge {
            self.detach_secondary_bus(id);
        }
        for bus in self.hosted_expanders(id) {
            self.remove_child_bus(bus);
        }
        self.spaces.commit();

        self.func_mut(id).model.exit();
        let function = self.devices.remove(&id).expect("stale PCI device id");
        self.bus_mut(function.bus).slots[function.devfn.index()] = None;
        debug!(name = %function.name, devfn = %function.devfn, "PCI device removed");
        Ok(function.model)
    }

    /// Fails unless every bus the function owns (its secondary bus and any expander roots it
    /// hosts) is empty.
    pub(crate) fn check_removable(&self, id: DeviceId) -> Result<()> {
        let function = self.devices.get(&id).ok_or(PciError::DeviceNotFound(id))?;
        let mut owned = function.secondary_bus().into_iter().collect::<Vec<_>>();
        owned.extend(self.hosted_expanders(id));
        for bus in &owned {
            let bus = self.bus_ref(*bus);
            if !bus.is_empty() || !bus.children.is_empty() {
                return Err(PciError::BridgeNotEmpty(function.name.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn hosted_expanders(&self, host: DeviceId) -> Vec<BusId> {
        let bus = self.func(host).bus;
        self.bus_ref(bus)
            .children
            .iter()
            .copied()
            .filter(|child| {
                matches!(
                    self.bus_ref(*child).kind,
                    PciBusKind::ExpanderRoot { host: h } if h == host
                )
            })
            .collect()
    }

    /// Unlinks an empty child bus from its parent and drops it.
    pub(crate) fn remove_child_bus(&mut self, bus: BusId) {
        let parent = match self.bus_ref(bus).kind {
            PciBusKind::Root => return,
            PciBusKind::ExpanderRoot { host } | PciBusKind::Secondary { bridge: host } => {
                self.func(host).bus
            }
        };
        self.bus_mut(parent).children.retain(|child| *child != bus);
        let removed = self.buses.remove(&bus).expect("stale PCI bus id");
        if matches!(removed.kind, PciBusKind::Secondary { .. }) {
            self.spaces.destroy(removed.mem);
            self.spaces.destroy(removed.io);
        }
    }

    /// Finds the bus numbered `n` at or below `from`, descending only into ranges that can hold it.
    pub fn find_bus_by_number(&self, from: BusId, n: u8) -> Option<BusId> {
        let bus = self.buses.get(&from)?;
        if self.bus_number(from) == n {
            return Some(from);
        }
        if let PciBusKind::Secondary { bridge } = bus.kind {
            if !self.secondary_in_range(bridge, n) {
                return None;
            }
        }

        let mut current = from;
        'descend: loop {
            for &child in &self.bus_ref(current).children {
                if self.bus_number(child) == n {
                    return Some(child);
                }
                let in_range = match self.bus_ref(child).kind {
                    PciBusKind::Secondary { bridge } => self.secondary_in_range(bridge, n),
                    PciBusKind::ExpanderRoot { .. } | PciBusKind::Root => {
                        self.root_in_range(child, n)
                    }
                };
                if in_range {
                    current = child;
                    continue 'descend;
                }
            }
            return None;
        }
    }

    fn secondary_in_range(&self, bridge: DeviceId, n: u8) -> bool {
        let cfg = self.func(bridge).config();
        let control = PciBridgeControl::from_bits_retain(cfg.word(PCI_BRIDGE_CONTROL));
        !control.contains(PciBridgeControl::BUS_RESET)
            && cfg.byte(PCI_SECONDARY_BUS) <= n
            && n <= cfg.byte(PCI_SUBORDINATE_BUS)
    }

    fn root_in_range(&self, bus: BusId, n: u8) -> bool {
        self.bus_ref(bus)
            .devices(WalkOrder::Forward)
            .into_iter()
            .any(|(_, id)| self.func(id).is_bridge() && self.secondary_in_range(id, n))
    }

    /// Lowest and highest bus numbers reachable through `bus`'s bridges.
    pub fn bus_range(&self, bus: BusId) -> (u8, u8) {
        let number = self.bus_number(bus);
        self.bus_ref(bus)
            .devices(WalkOrder::Forward)
            .into_iter()
            .map(|(_, id)| self.func(id))
            .filter(|function| function.is_bridge())
            .fold((number, number), |(min, max), bridge| {
                let cfg = bridge.config();
                (
                    min.min(cfg.byte(PCI_SECONDARY_BUS)),
                    max.max(cfg.byte(PCI_SUBORDINATE_BUS)),
                )
            })
    }

    pub fn find_device(&self, bus_number: u8, devfn: PciDevFn) -> Option<DeviceId> {
        let bus = self.find_bus_by_number(self.root, bus_number)?;
        self.bus_ref(bus).device_at(devfn)
    }

    pub fn find_device_by_name(&self, name: &str) -> Option<DeviceId> {
        self.devices
            .iter()
            .find(|(_, function)| function.name == name)
            .map(|(id, _)| *id)
    }

    pub fn find_device_by_address(&self, address: &PciAddress) -> Result<DeviceId> {
        let not_found = || {
            PciError::NoSuchDevice(format!(
                "{:04x}:{:02x}:{:02x}.{}",
                address.domain, address.bus, address.slot, address.function
            ))
        };
        if address.domain != 0 {
            return Err(not_found());
        }
        self.find_device(address.bus, PciDevFn::new(address.slot, address.function))
            .ok_or_else(not_found)
    }

    pub fn device_bdf(&self, id: DeviceId) -> PciBdf {
        let function = self.func(id);
        PciBdf::new(
            self.bus_number(function.bus),
            function.devfn.slot(),
            function.devfn.function(),
        )
    }

    /// Topology path of a function, e.g. `0000:00:03.0:01.0`: the root bus followed by the
    /// slot/function of every hop from the root down. Independent of bus numbering.
    pub fn device_path(&self, id: DeviceId) -> String {
        let mut hops = Vec::new();
        let mut current = Some(id);
        let mut root = self.root;
        while let Some(dev) = current {
            let function = self.func(dev);
            hops.push(function.devfn);
            match self.bus_ref(function.bus).kind {
                PciBusKind::Secondary { bridge } => current = Some(bridge),
                PciBusKind::Root | PciBusKind::ExpanderRoot { .. } => {
                    root = function.bus;
                    current = None;
                }
            }
        }

        let mut path = format!("0000:{:02x}", self.bus_number(root));
        for devfn in hops.iter().rev() {
            path.push_str(&format!(":{:02x}.{}", devfn.slot(), devfn.function()));
        }
        path
    }

    pub fn for_each_device(
        &self,
        bus: BusId,
        order: WalkOrder,
        mut visit: impl FnMut(DeviceId, &PciFunction),
    ) {
        let Some(bus) = self.buses.get(&bus) else {
            return;
        };
        for (_, id) in bus.devices(order) {
            visit(id, self.func(id));
        }
    }

    /// `bus` and every bus below it, parents before children.
    pub fn buses_depth_first(&self, bus: BusId) -> Vec<BusId> {
        let mut out = Vec::new();
        let mut stack = vec![bus];
        while let Some(bus) = stack.pop() {
            let Some(entry) = self.buses.get(&bus) else {
                continue;
            };
            out.push(bus);
            stack.extend(entry.children.iter().rev().copied());
        }
        out
    }

    /// Every function at or below `bus`, in depth-first bus order.
    pub fn devices_below(&self, bus: BusId) -> Vec<DeviceId> {
        self.buses_depth_first(bus)
            .into_iter()
            .flat_map(|bus| {
                self.bus_ref(bus)
                    .devices(WalkOrder::Forward)
                    .into_iter()
                    .map(|(_, id)| id)
            })
            .collect()
    }

    /// Guest config read with the bus-level read side effects applied first.
    pub fn config_read(&mut self, id: DeviceId, offset: u16, size: usize) -> u32 {
        let Some(function) = self.devices.get(&id) else {
            warn!(?id, "config read from unknown PCI device");
            return u32::MAX;
        };
        if let Some(cap) = crate::bridge::downstream_port_cap(function.config()) {
            if ranges_overlap(usize::from(offset), size, cap + PCI_EXP_LNKSTA, 2) {
                self.sync_bridge_link(id);
            }
        }
        self.func_mut(id).model.config_read(offset, size)
    }

    /// Guest config write followed by the side effects of the registers it touched.
    pub fn config_write(&mut self, id: DeviceId, offset: u16, size: usize, value: u32) {
        let Some(function) = self.devices.get_mut(&id) else {
            warn!(?id, "config write to unknown PCI device");
            return;
        };
        let was_irq_disabled = function.irq_disabled();
        let old_control = function.config().word(PCI_BRIDGE_CONTROL);
        let is_bridge = function.is_bridge();

        function.model.config_write(offset, size, value);

        self.spaces.begin();
        self.config_write_side_effects(id, offset, size, was_irq_disabled, old_control, is_bridge);
        self.spaces.commit();
    }

    fn config_write_side_effects(
        &mut self,
        id: DeviceId,
        offset: u16,
        size: usize,
        was_irq_disabled: bool,
        old_control: u16,
        is_bridge: bool,
    ) {
        let addr = usize::from(offset);
        let touches_command = ranges_overlap(addr, size, PCI_COMMAND, 2);
        if ranges_overlap(addr, size, PCI_BASE_ADDRESS_0, 24)
            || ranges_overlap(addr, size, PCI_ROM_ADDRESS, 4)
            || ranges_overlap(addr, size, PCI_ROM_ADDRESS1, 4)
            || touches_command
        {
            self.update_mappings(id);
        }
        if touches_command {
            self.update_irq_disabled(id, was_irq_disabled);
            self.update_bus_master(id);
        }

        if !is_bridge {
            return;
        }
        if touches_command
            || ranges_overlap(addr, size, PCI_IO_BASE, 2)
            || ranges_overlap(addr, size, PCI_MEMORY_BASE, 20)
            || ranges_overlap(addr, size, PCI_BRIDGE_CONTROL, 2)
        {
            self.update_bridge_windows(id);
        }

        let new_control = self.func(id).config().word(PCI_BRIDGE_CONTROL);
        if !old_control & new_control & PciBridgeControl::BUS_RESET.bits() != 0 {
            self.reset_secondary_bus(id);
        }
    }

    /// Resets every function of the hierarchy.
    pub fn reset(&mut self) {
        self.reset_bus(self.root);
    }

    /// Resets every function on `bus` and below it.
    pub fn reset_bus(&mut self, bus: BusId) {
        self.spaces.begin();
        self.reset_bus_devices(bus);
        self.spaces.commit();
    }

    /// Resets a function and everything below it.
    pub fn reset_device(&mut self, id: DeviceId) {
        if !self.devices.contains_key(&id) {
            return;
        }
        self.spaces.begin();
        self.reset_subtree(id);
        self.spaces.commit();
    }

    pub(crate) fn reset_bus_devices(&mut self, bus: BusId) {
        for (_, id) in self.bus_ref(bus).devices(WalkOrder::Forward) {
            self.reset_subtree(id);
        }
        if let Some(irq) = &self.bus_ref(bus).irq {
            assert!(
                irq.counts.iter().all(|count| *count == 0),
                "interrupt lines of bus {} still asserted after reset",
                self.bus_ref(bus).name
            );
        }
    }

    fn reset_subtree(&mut self, id: DeviceId) {
        let mut below: Vec<BusId> = self.func(id).secondary_bus().into_iter().collect();
        below.extend(self.hosted_expanders(id));
        for bus in below {
            self.reset_bus_devices(bus);
        }
        self.reset_function(id);
    }

    fn reset_function(&mut self, id: DeviceId) {
        self.func_mut(id).model.reset();
        self.deassert_intx(id);
        debug_assert_eq!(self.func(id).irq_state, 0);

        let is_bridge = self.func(id).is_bridge();
        if is_bridge {
            self.reset_bridge_registers(id);
        }
        self.func_mut(id).model.config_mut().reset_header();
        self.reset_regions(id);
        self.update_mappings(id);
        if is_bridge {
            self.update_bridge_windows(id);
        }
        self.update_bus_master(id);
    }
}

impl core::fmt::Debug for PciFabric {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PciFabric")
            .field("buses", &self.buses.len())
            .field("devices", &self.devices.len())
            .field("machine_ready", &self.machine_ready)
            .finish_non_exhaustive()
    }
}
