use std::sync::{Arc, Mutex};

use aero_pci_fabric::regs::PCI_COMMAND;
use aero_pci_fabric::{
    pci_swizzle, BusId, DeviceId, GsiLevelSink, PciConfigSpace, PciDevFn, PciDevice, PciFabric,
    PciFabricConfig, PciInterruptPin, PciIntxRoute, PciIntxRouter, PciIntxRouterConfig,
    PciIrqSink,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

struct IntxDev {
    cfg: PciConfigSpace,
}

impl IntxDev {
    fn new(pin: PciInterruptPin) -> Box<Self> {
        let mut cfg = PciConfigSpace::new(0x1af4, 0x1000);
        cfg.set_interrupt_pin(pin.to_config_u8());
        Box::new(Self { cfg })
    }
}

impl PciDevice for IntxDev {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }
}

struct Bridge {
    cfg: PciConfigSpace,
}

impl Bridge {
    fn new() -> Box<Self> {
        Box::new(Self {
            cfg: PciConfigSpace::new_bridge(0x1b36, 0x0001),
        })
    }
}

impl PciDevice for Bridge {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }
}

/// Level of every line as last driven by the fabric.
#[derive(Clone)]
struct Lines(Arc<Mutex<Vec<bool>>>);

impl Lines {
    fn new(n: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![false; n])))
    }

    fn get(&self, line: usize) -> bool {
        self.0.lock().unwrap()[line]
    }
}

impl PciIrqSink for Lines {
    fn set_irq(&mut self, line: usize, level: bool) {
        self.0.lock().unwrap()[line] = level;
    }
}

fn plug(
    fabric: &mut PciFabric,
    bus: BusId,
    slot: u8,
    name: &str,
    pin: PciInterruptPin,
) -> DeviceId {
    fabric
        .register_device(bus, Some(PciDevFn::new(slot, 0)), name, IntxDev::new(pin))
        .unwrap()
}

fn fabric_with_sink() -> (PciFabric, Lines) {
    let mut fabric = PciFabric::new(PciFabricConfig::default());
    let lines = Lines::new(4);
    fabric.set_root_irqs(Box::new(lines.clone()));
    (fabric, lines)
}

#[test]
fn root_bus_swizzles_by_slot() {
    let (mut fabric, lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let a = plug(&mut fabric, root, 3, "a", PciInterruptPin::IntA);
    let b = plug(&mut fabric, root, 5, "b", PciInterruptPin::IntA);

    fabric.set_intx(a, true);
    assert_eq!(fabric.bus_irq_count(root, 3), Some(1));
    assert!(lines.get(3));

    fabric.set_intx(b, true);
    assert_eq!(fabric.bus_irq_count(root, 1), Some(1));
    assert!(lines.get(1));
}

#[test]
fn shared_line_stays_high_until_every_source_drops() {
    let (mut fabric, lines) = fabric_with_sink();
    let root = fabric.root_bus();
    // Slots 1 and 5 both land on line 1.
    let a = plug(&mut fabric, root, 1, "a", PciInterruptPin::IntA);
    let b = plug(&mut fabric, root, 5, "b", PciInterruptPin::IntA);

    fabric.set_intx(a, true);
    fabric.set_intx(b, true);
    assert_eq!(fabric.bus_irq_count(root, 1), Some(2));

    fabric.set_intx(a, false);
    assert_eq!(fabric.bus_irq_count(root, 1), Some(1));
    assert!(lines.get(1));

    // Repeating a level is not a transition.
    fabric.set_intx(a, false);
    assert_eq!(fabric.bus_irq_count(root, 1), Some(1));

    fabric.set_intx(b, false);
    assert_eq!(fabric.bus_irq_count(root, 1), Some(0));
    assert!(!lines.get(1));
}

#[test]
fn intx_disable_masks_without_forgetting_the_pin() {
    let (mut fabric, lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let dev = plug(&mut fabric, root, 2, "dev", PciInterruptPin::IntB);

    fabric.set_intx(dev, true);
    assert!(lines.get(3));

    fabric.config_write(dev, PCI_COMMAND as u16, 2, 0x0400);
    assert!(!lines.get(3));
    assert_eq!(fabric.bus_irq_count(root, 3), Some(0));
    assert!(fabric.irq_level(dev, PciInterruptPin::IntB));
    // The status bit still reports the pending interrupt.
    assert_eq!(fabric.config_read(dev, 0x06, 2) & 0x0008, 0x0008);

    fabric.config_write(dev, PCI_COMMAND as u16, 2, 0);
    assert!(lines.get(3));
    assert_eq!(fabric.bus_irq_count(root, 3), Some(1));
}

#[test]
fn removal_deasserts_first() {
    let (mut fabric, lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let dev = plug(&mut fabric, root, 4, "dev", PciInterruptPin::IntA);
    fabric.set_intx(dev, true);
    assert!(lines.get(0));

    fabric.unregister_device(dev).unwrap();
    assert!(!lines.get(0));
    assert_eq!(fabric.bus_irq_count(root, 0), Some(0));
}

#[test]
fn reset_lowers_every_line() {
    let (mut fabric, lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let dev = plug(&mut fabric, root, 4, "dev", PciInterruptPin::IntA);
    fabric.set_intx(dev, true);

    fabric.reset();
    assert!(!lines.get(0));
    assert!(!fabric.irq_level(dev, PciInterruptPin::IntA));
}

#[test]
fn interrupts_swizzle_at_every_bridge() {
    let (mut fabric, lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let route = |line: usize| PciIntxRoute::Enabled(16 + line as u32);
    fabric.set_route_intx_to_irq(root, Box::new(route)).unwrap();

    let outer = fabric
        .register_device(root, Some(PciDevFn::new(2, 0)), "outer", Bridge::new())
        .unwrap();
    let bus1 = fabric.device(outer).unwrap().secondary_bus().unwrap();
    let inner = fabric
        .register_device(bus1, Some(PciDevFn::new(1, 0)), "inner", Bridge::new())
        .unwrap();
    let bus2 = fabric.device(inner).unwrap().secondary_bus().unwrap();
    let dev = plug(&mut fabric, bus2, 3, "dev", PciInterruptPin::IntA);

    // pin A at slot 3 -> pin D; at slot 1 -> pin A; at slot 2 of the root -> line 2.
    assert_eq!(
        fabric.route_intx_to_irq(dev, PciInterruptPin::IntA),
        PciIntxRoute::Enabled(18)
    );

    fabric.set_intx(dev, true);
    assert_eq!(fabric.bus_irq_count(root, 2), Some(1));
    assert!(lines.get(2));
    fabric.set_intx(dev, false);
    assert!(!lines.get(2));
}

#[test]
fn missing_route_function_reports_disabled() {
    let (mut fabric, _lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let dev = fabric
        .register_device(root, None, "dev", IntxDev::new(PciInterruptPin::IntA))
        .unwrap();
    assert_eq!(
        fabric.route_intx_to_irq(dev, PciInterruptPin::IntA),
        PciIntxRoute::Disabled
    );
}

#[test]
fn pirq_table_updates_are_validated() {
    let (mut fabric, _lines) = fabric_with_sink();
    let root = fabric.root_bus();
    let bridge = fabric.register_device(root, None, "bridge", Bridge::new()).unwrap();
    let dev = fabric
        .register_device(root, None, "dev", IntxDev::new(PciInterruptPin::IntA))
        .unwrap();

    fabric
        .set_pirq_route(bridge, 3, PciInterruptPin::IntC, 5)
        .unwrap();
    assert_eq!(fabric.pirq_route(bridge, 3, PciInterruptPin::IntC), Some(5));
    assert!(fabric.set_pirq_route(bridge, 3, PciInterruptPin::IntC, 8).is_err());
    assert!(fabric.set_pirq_route(dev, 3, PciInterruptPin::IntC, 1).is_err());
}

#[derive(Clone, Default)]
struct GsiLog(Arc<Mutex<Vec<(u32, bool)>>>);

impl GsiLevelSink for GsiLog {
    fn set_gsi_level(&mut self, gsi: u32, level: bool) {
        self.0.lock().unwrap().push((gsi, level));
    }
}

#[test]
fn pirq_router_shares_gsis_between_pirqs() {
    let mut fabric = PciFabric::new(PciFabricConfig::default());
    let root = fabric.root_bus();
    let log = GsiLog::default();
    PciIntxRouter::new(
        PciIntxRouterConfig {
            pirq_to_gsi: [10, 10, 11, 11],
        },
        Box::new(log.clone()),
    )
    .install(&mut fabric, root)
    .unwrap();

    let a = plug(&mut fabric, root, 0, "a", PciInterruptPin::IntA);
    let b = plug(&mut fabric, root, 1, "b", PciInterruptPin::IntA);
    assert_eq!(
        fabric.route_intx_to_irq(b, PciInterruptPin::IntA),
        PciIntxRoute::Enabled(10)
    );

    fabric.set_intx(a, true);
    fabric.set_intx(b, true);
    fabric.set_intx(a, false);
    assert_eq!(*log.0.lock().unwrap(), vec![(10, true)]);

    fabric.set_intx(b, false);
    assert_eq!(*log.0.lock().unwrap(), vec![(10, true), (10, false)]);
}

proptest! {
    #[test]
    fn line_counts_match_asserted_sources(
        slots in proptest::collection::btree_set(0u8..32, 1..6),
        ops in proptest::collection::vec((0usize..6, 0usize..4, any::<bool>()), 0..64),
    ) {
        let (mut fabric, lines) = fabric_with_sink();
        let root = fabric.root_bus();
        let slots: Vec<u8> = slots.into_iter().collect();
        let mut devices = Vec::new();
        for &slot in &slots {
            let devfn = PciDevFn::new(slot, 0);
            let id = plug(&mut fabric, root, slot, &format!("dev{slot}"), PciInterruptPin::IntA);
            devices.push((id, devfn));
        }

        let mut asserted = vec![[false; 4]; devices.len()];
        for (index, pin, level) in ops {
            let index = index % devices.len();
            let (id, _) = devices[index];
            let pin_id = PciInterruptPin::from_index(pin).unwrap();
            fabric.set_irq_level(id, pin_id, level);
            asserted[index][pin] = level;

            for line in 0..4 {
                let expected = devices
                    .iter()
                    .zip(&asserted)
                    .map(|((_, devfn), pins)| {
                        (0..4)
                            .filter(|p| pins[*p] && pci_swizzle(*devfn, *p) == line)
                            .count() as u32
                    })
                    .sum::<u32>();
                prop_assert_eq!(fabric.bus_irq_count(root, line), Some(expected));
                prop_assert_eq!(lines.get(line), expected > 0);
            }
        }

        for (id, _) in &devices {
            fabric.unregister_device(*id).unwrap();
        }
        for line in 0..4 {
            prop_assert_eq!(fabric.bus_irq_count(root, line), Some(0));
            prop_assert!(!lines.get(line));
        }
    }
}
