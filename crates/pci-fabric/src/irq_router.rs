use std::collections::HashMap;

use tracing::{error, trace};

use crate::bus::PciBusKind;
use crate::error::{PciError, Result};
use crate::fabric::PciFabric;
use crate::regs::PCI_NUM_PINS;
use crate::{BusId, DeviceId, PciDevFn, PciInterruptPin};

/// Platform interrupt controller input wired to a bus.
pub trait PciIrqSink: Send {
    fn set_irq(&mut self, line: usize, level: bool);
}

/// Maps `(devfn, pin)` of a function on a bus to the pin or line it drives one level up.
pub type MapIrqFn = Box<dyn Fn(PciDevFn, usize) -> usize + Send>;

/// Resolves a root bus line to the platform IRQ it ends up on.
pub type RouteIntxFn = Box<dyn Fn(usize) -> PciIntxRoute + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciIntxRoute {
    Enabled(u32),
    Disabled,
}

/// The standard bridge swizzle: `(pin + slot) mod 4`.
pub fn pci_swizzle(devfn: PciDevFn, pin: usize) -> usize {
    (pin + usize::from(devfn.slot())) % PCI_NUM_PINS
}

/// Sink installed on a bus plus the per-line count of asserted sources.
pub(crate) struct BusIrq {
    pub(crate) sink: Box<dyn PciIrqSink>,
    pub(crate) counts: Vec<u32>,
}

impl PciFabric {
    /// Installs the interrupt sink of `bus`; INTx propagation stops at the first bus that has one.
    pub fn set_bus_irqs(
        &mut self,
        bus: BusId,
        sink: Box<dyn PciIrqSink>,
        nirq: usize,
    ) -> Result<()> {
        let bus = self.buses.get_mut(&bus).ok_or(PciError::BusNotFound(bus))?;
        bus.irq = Some(BusIrq {
            sink,
            counts: vec![0; nirq],
        });
        Ok(())
    }

    /// Installs `sink` on the root bus with the configured number of lines.
    pub fn set_root_irqs(&mut self, sink: Box<dyn PciIrqSink>) {
        let nirq = self.cfg.nirq;
        let root = self.root_bus();
        self.bus_mut(root).irq = Some(BusIrq {
            sink,
            counts: vec![0; nirq],
        });
    }

    /// Overrides the pin mapping applied when an interrupt crosses `bus`.
    pub fn set_bus_map_irq(&mut self, bus: BusId, map: MapIrqFn) -> Result<()> {
        self.buses
            .get_mut(&bus)
            .ok_or(PciError::BusNotFound(bus))?
            .map_irq = Some(map);
        Ok(())
    }

    /// Installs the line-to-IRQ route function of a top-level bus and notifies every function
    /// below it.
    pub fn set_route_intx_to_irq(&mut self, bus: BusId, route: RouteIntxFn) -> Result<()> {
        self.buses
            .get_mut(&bus)
            .ok_or(PciError::BusNotFound(bus))?
            .route_intx = Some(route);
        self.fire_intx_routing_notifier(bus);
        Ok(())
    }

    /// Number of sources currently asserting `line` of `bus`'s sink.
    pub fn bus_irq_count(&self, bus: BusId, line: usize) -> Option<u32> {
        self.buses.get(&bus)?.irq.as_ref()?.counts.get(line).copied()
    }

    /// Drives an INTx pin of a function.
    pub fn set_irq_level(&mut self, id: DeviceId, pin: PciInterruptPin, level: bool) {
        let Some(function) = self.devices.get_mut(&id) else {
            return;
        };
        let pin = pin.index();
        if function.pin_level(pin) == level {
            return;
        }
        function.set_pin_level(pin, level);
        function.update_irq_status();
        if function.irq_disabled() {
            return;
        }
        self.change_irq_level(id, pin, if level { 1 } else { -1 });
    }

    /// Drives the pin the function advertises in its interrupt pin register.
    ///
    /// # Panics
    ///
    /// Panics if the function does not advertise a pin.
    pub fn set_intx(&mut self, id: DeviceId, level: bool) {
        let Some(function) = self.devices.get(&id) else {
            return;
        };
        let pin = PciInterruptPin::from_config_u8(function.config().interrupt_pin())
            .unwrap_or_else(|| panic!("{} has no INTx pin", function.name));
        self.set_irq_level(id, pin, level);
    }

    pub fn irq_level(&self, id: DeviceId, pin: PciInterruptPin) -> bool {
        self.devices
            .get(&id)
            .is_some_and(|function| function.pin_level(pin.index()))
    }

    /// Pin mapping applied when an interrupt of `devfn` crosses `bus`.
    fn map_pin(&self, bus: BusId, devfn: PciDevFn, pin: usize) -> usize {
        let entry = self.bus_ref(bus);
        if let Some(map) = &entry.map_irq {
            return map(devfn, pin);
        }
        match entry.kind {
            PciBusKind::Secondary { bridge } => self.func(bridge).model.map_irq(devfn, pin),
            PciBusKind::Root | PciBusKind::ExpanderRoot { .. } => pci_swizzle(devfn, pin),
        }
    }

    /// Climbs from the function's bus until a bus with a sink, mapping the pin at every hop, and
    /// applies `delta` to the line it lands on.
    ///
    /// # Panics
    ///
    /// Panics when no bus up to the top has a sink, or when a line count would go negative.
    pub(crate) fn change_irq_level(&mut self, id: DeviceId, pin: usize, delta: i32) {
        let mut dev = id;
        let mut irq = pin;
        let bus = loop {
            let function = self.func(dev);
            let bus = function.bus;
            let mapped = self.map_pin(bus, function.devfn, irq);
            trace!(
                name = %function.name,
                pin = irq,
                line = mapped,
                bus = %self.bus_ref(bus).name,
                "INTx route hop"
            );
            irq = mapped;
            if self.bus_ref(bus).irq.is_some() {
                break bus;
            }
            dev = self.parent_device(bus).unwrap_or_else(|| {
                panic!("INTx from {} reached the top without an IRQ sink", self.func(id).name)
            });
        };

        let entry = self.bus_mut(bus);
        let irqs = entry.irq.as_mut().expect("sink checked above");
        assert!(irq < irqs.counts.len(), "line {irq} beyond bus {} lines", entry.name);
        let count = &mut irqs.counts[irq];
        *count = count
            .checked_add_signed(delta)
            .unwrap_or_else(|| panic!("line {irq} count of bus {} went negative", entry.name));
        let level = *count != 0;
        irqs.sink.set_irq(irq, level);
    }

    /// Re-applies the asserted pins after the INTx disable bit changed.
    pub(crate) fn update_irq_disabled(&mut self, id: DeviceId, was_disabled: bool) {
        let function = self.func(id);
        let disabled = function.irq_disabled();
        if disabled == was_disabled {
            return;
        }
        let asserted: Vec<usize> = (0..PCI_NUM_PINS)
            .filter(|pin| function.pin_level(*pin))
            .collect();
        for pin in asserted {
            self.change_irq_level(id, pin, if disabled { -1 } else { 1 });
        }
    }

    /// Lowers every asserted pin of a function.
    pub(crate) fn deassert_intx(&mut self, id: DeviceId) {
        for pin in PciInterruptPin::ALL {
            self.set_irq_level(id, pin, false);
        }
    }

    /// Where a pin of a function ends up on the platform, without changing any state.
    pub fn route_intx_to_irq(&self, id: DeviceId, pin: PciInterruptPin) -> PciIntxRoute {
        let mut dev = Some(id);
        let mut irq = pin.index();
        let mut top = self.func(id).bus;
        while let Some(current) = dev {
            let function = self.func(current);
            top = function.bus;
            irq = self.map_pin(top, function.devfn, irq);
            dev = self.parent_device(top);
        }

        match &self.bus_ref(top).route_intx {
            Some(route) => route(irq),
            None => {
                error!(
                    bus = %self.bus_ref(top).name,
                    "PCI: unimplemented INTx routing on the top-level bus"
                );
                PciIntxRoute::Disabled
            }
        }
    }

    /// Tells every function at or below `bus` that routes may have changed.
    pub fn fire_intx_routing_notifier(&mut self, bus: BusId) {
        for id in self.devices_below(bus) {
            self.func_mut(id).model.intx_routing_changed();
        }
    }

    /// Sets the PIRQ (A..H as 0..7) a bridge routes `(slot, pin)` of its secondary bus to.
    pub fn set_pirq_route(
        &mut self,
        bridge: DeviceId,
        slot: u8,
        pin: PciInterruptPin,
        pirq: usize,
    ) -> Result<()> {
        if pirq >= 8 {
            return Err(PciError::InvalidPirq(pirq));
        }
        let function = self
            .devices
            .get_mut(&bridge)
            .ok_or(PciError::DeviceNotFound(bridge))?;
        let state = function
            .bridge
            .as_mut()
            .ok_or_else(|| PciError::NotABridge(function.name.clone()))?;
        state.pirq_table[usize::from(slot & 0x1f)][pin.index()] = pirq as u8;
        let secondary = state.secondary;
        self.fire_intx_routing_notifier(secondary);
        Ok(())
    }

    pub fn pirq_route(&self, bridge: DeviceId, slot: u8, pin: PciInterruptPin) -> Option<u8> {
        let state = self.devices.get(&bridge)?.bridge.as_ref()?;
        Some(state.pirq_table[usize::from(slot & 0x1f)][pin.index()])
    }
}

/// Platform interrupt controller input addressed by GSI.
pub trait GsiLevelSink: Send {
    fn set_gsi_level(&mut self, gsi: u32, level: bool);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PciIntxRouterConfig {
    /// Mapping of PIRQ[A-D] to GSIs.
    pub pirq_to_gsi: [u32; 4],
}

impl Default for PciIntxRouterConfig {
    fn default() -> Self {
        // Match a typical PC-compatible setup where PCI INTx ends up on IRQ/GSI 10-13.
        Self {
            pirq_to_gsi: [10, 11, 12, 13],
        }
    }
}

/// PC-style PIRQ router for the root bus.
///
/// The bus lines are PIRQ[A-D] (`PIRQ = (pin + slot) mod 4`); each PIRQ is wired to a platform
/// GSI. Several PIRQs may share a GSI, so the router reference-counts asserted PIRQs per GSI and
/// only forwards level transitions.
pub struct PciIntxRouter {
    cfg: PciIntxRouterConfig,
    pirq_level: [bool; 4],
    gsi_assert_count: HashMap<u32, u32>,
    sink: Box<dyn GsiLevelSink>,
}

impl PciIntxRouter {
    pub fn new(cfg: PciIntxRouterConfig, sink: Box<dyn GsiLevelSink>) -> Self {
        Self {
            cfg,
            pirq_level: [false; 4],
            gsi_assert_count: HashMap::new(),
            sink,
        }
    }

    /// Computes the PIRQ index (0 = A, 1 = B, 2 = C, 3 = D) for a device/pin pair.
    pub fn pirq_index(devfn: PciDevFn, pin: PciInterruptPin) -> usize {
        pci_swizzle(devfn, pin.index())
    }

    pub fn gsi_for_pirq(&self, pirq: usize) -> u32 {
        self.cfg.pirq_to_gsi[pirq]
    }

    /// Installs the router as the sink, swizzle and route function of `bus`.
    pub fn install(self, fabric: &mut PciFabric, bus: BusId) -> Result<()> {
        let pirq_to_gsi = self.cfg.pirq_to_gsi;
        fabric.set_bus_irqs(bus, Box::new(self), PCI_NUM_PINS)?;
        fabric.set_bus_map_irq(bus, Box::new(pci_swizzle))?;
        fabric.set_route_intx_to_irq(
            bus,
            Box::new(move |pirq: usize| match pirq_to_gsi.get(pirq) {
                Some(gsi) => PciIntxRoute::Enabled(*gsi),
                None => PciIntxRoute::Disabled,
            }),
        )
    }
}

impl PciIrqSink for PciIntxRouter {
    fn set_irq(&mut self, pirq: usize, level: bool) {
        if self.pirq_level[pirq] == level {
            return;
        }
        self.pirq_level[pirq] = level;

        let gsi = self.cfg.pirq_to_gsi[pirq];
        let count = self.gsi_assert_count.entry(gsi).or_insert(0);
        if level {
            *count += 1;
            if *count == 1 {
                self.sink.set_gsi_level(gsi, true);
            }
        } else {
            debug_assert!(*count > 0, "PIRQ deassert would underflow assert count");
            if *count > 0 {
                *count -= 1;
                if *count == 0 {
                    self.sink.set_gsi_level(gsi, false);
                }
            }
        }
    }
}
