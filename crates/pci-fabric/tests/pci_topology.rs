use std::collections::BTreeMap;

use aero_pci_fabric::regs::{
    PCI_CAPABILITY_LIST, PCI_CAP_ID_MSI, PCI_CAP_ID_VNDR, PCI_CONFIG_HEADER_SIZE,
};
use aero_pci_fabric::{
    add_vendor_capability, DeviceId, PciAddress, PciBusSpec, PciConfigSpace, PciDevFn,
    PciDevice, PciError, PciFabric, PciFabricConfig, WalkOrder,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

struct Stub {
    cfg: PciConfigSpace,
}

impl Stub {
    fn new() -> Box<Self> {
        Box::new(Self {
            cfg: PciConfigSpace::new(0x1af4, 0x1000),
        })
    }

    fn multifunction() -> Box<Self> {
        let mut cfg = PciConfigSpace::new(0x8086, 0x7000);
        cfg.set_multifunction(true);
        Box::new(Self { cfg })
    }

    fn bridge() -> Box<Self> {
        Box::new(Self {
            cfg: PciConfigSpace::new_bridge(0x1b36, 0x0001),
        })
    }
}

impl PciDevice for Stub {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }
}

fn fabric() -> PciFabric {
    PciFabric::new(PciFabricConfig::default())
}

fn at(slot: u8, function: u8) -> Option<PciDevFn> {
    Some(PciDevFn::new(slot, function))
}

#[test]
fn occupied_slots_are_refused() {
    let mut fabric = fabric();
    let root = fabric.root_bus();
    fabric.register_device(root, at(3, 0), "first", Stub::new()).unwrap();

    let err = fabric
        .register_device(root, at(3, 0), "second", Stub::new())
        .unwrap_err();
    assert_eq!(
        err,
        PciError::SlotOccupied {
            bus: "pci.0".to_string(),
            devfn: PciDevFn::new(3, 0),
            occupant: "first".to_string(),
        }
    );
    assert_eq!(fabric.bus(root).unwrap().devices(WalkOrder::Forward).len(), 1);
    assert_eq!(fabric.find_device_by_name("second"), None);
}

#[test]
fn automatic_assignment_skips_reserved_and_low_slots() {
    let mut fabric = PciFabric::new(PciFabricConfig {
        devfn_min: PciDevFn::new(2, 0).raw(),
        slot_reserved_mask: 1 << 3,
        ..Default::default()
    });
    let root = fabric.root_bus();

    let err = fabric
        .register_device(root, at(3, 0), "pinned", Stub::new())
        .unwrap_err();
    assert_eq!(
        err,
        PciError::SlotReserved {
            bus: "pci.0".to_string(),
            devfn: PciDevFn::new(3, 0),
        }
    );

    let a = fabric.register_device(root, None, "a", Stub::new()).unwrap();
    let b = fabric.register_device(root, None, "b", Stub::new()).unwrap();
    assert_eq!(fabric.device(a).unwrap().devfn(), PciDevFn::new(2, 0));
    assert_eq!(fabric.device(b).unwrap().devfn(), PciDevFn::new(4, 0));

    // Explicit addresses below the automatic range are still allowed.
    let low = fabric.register_device(root, at(0, 0), "low", Stub::new()).unwrap();
    assert_eq!(fabric.device(low).unwrap().devfn(), PciDevFn::new(0, 0));
}

#[test]
fn a_full_bus_has_no_free_slot() {
    let mut fabric = fabric();
    let root = fabric.root_bus();
    for slot in 0..32 {
        fabric
            .register_device(root, None, format!("dev{slot}"), Stub::new())
            .unwrap();
    }
    let err = fabric.register_device(root, None, "extra", Stub::new()).unwrap_err();
    assert_eq!(
        err,
        PciError::NoFreeSlot {
            bus: "pci.0".to_string()
        }
    );
}

#[test]
fn multifunction_rules() {
    let mut fabric = fabric();
    let root = fabric.root_bus();

    fabric.register_device(root, at(1, 0), "single", Stub::new()).unwrap();
    assert_eq!(
        fabric
            .register_device(root, at(1, 1), "f1", Stub::new())
            .unwrap_err(),
        PciError::FunctionZeroNotMultifunction { slot: 1, function: 1 }
    );

    fabric.register_device(root, at(2, 0), "multi", Stub::multifunction()).unwrap();
    fabric.register_device(root, at(2, 1), "f1", Stub::new()).unwrap();

    // Cold-plugged functions may precede function 0, which then has to be multifunction.
    fabric.register_device(root, at(4, 3), "f3", Stub::new()).unwrap();
    assert_eq!(
        fabric
            .register_device(root, at(4, 0), "f0", Stub::new())
            .unwrap_err(),
        PciError::SingleFunctionSlot { slot: 4 }
    );
    fabric.register_device(root, at(4, 0), "f0", Stub::multifunction()).unwrap();

    fabric.machine_done();
    assert_eq!(
        fabric
            .register_device(root, at(5, 2), "late", Stub::new())
            .unwrap_err(),
        PciError::FunctionZeroMissing { slot: 5, function: 2 }
    );
}

#[test]
fn functions_are_found_by_number_name_and_address() {
    let mut fabric = fabric();
    let root = fabric.root_bus();
    let bridge = fabric.register_device(root, at(2, 0), "bridge", Stub::bridge()).unwrap();
    let secondary = fabric.device(bridge).unwrap().secondary_bus().unwrap();
    let nested = fabric
        .register_device(secondary, at(1, 0), "nested", Stub::bridge())
        .unwrap();
    let deep_bus = fabric.device(nested).unwrap().secondary_bus().unwrap();
    let disk = fabric.register_device(deep_bus, at(4, 0), "disk", Stub::new()).unwrap();

    // Unnumbered bridges hide everything behind them.
    assert_eq!(fabric.find_device(2, PciDevFn::new(4, 0)), None);

    fabric.config_write(bridge, 0x18, 4, 0x0003_0100);
    fabric.config_write(nested, 0x18, 4, 0x0002_0201);
    assert_eq!(fabric.find_bus_by_number(root, 1), Some(secondary));
    assert_eq!(fabric.find_bus_by_number(root, 2), Some(deep_bus));
    assert_eq!(fabric.find_bus_by_number(root, 3), None);
    assert_eq!(fabric.find_bus_by_number(secondary, 2), Some(deep_bus));
    assert_eq!(fabric.bus_range(root), (0, 3));

    assert_eq!(fabric.find_device(2, PciDevFn::new(4, 0)), Some(disk));
    assert_eq!(fabric.find_device_by_name("disk"), Some(disk));
    assert_eq!(fabric.device_bdf(disk).to_string(), "02:04.0");
    assert_eq!(fabric.device_path(disk), "0000:00:02.0:01.0:04.0");

    let address: PciAddress = "2:04".parse().unwrap();
    assert_eq!(fabric.find_device_by_address(&address), Ok(disk));
    let missing: PciAddress = "1:1f.7".parse().unwrap();
    assert!(matches!(
        fabric.find_device_by_address(&missing),
        Err(PciError::NoSuchDevice(_))
    ));

    assert_eq!(
        fabric.devices_below(root),
        vec![bridge, nested, disk],
        "parents come before children"
    );
}

#[test]
fn expander_roots_take_only_bridges() {
    let mut fabric = fabric();
    let root = fabric.root_bus();
    let host = fabric.register_device(root, at(4, 0), "pxb", Stub::new()).unwrap();
    let expander = fabric
        .add_expander_root(host, PciBusSpec::new("pxb.0", 0x80))
        .unwrap();
    assert!(fabric.bus(root).unwrap().children().contains(&expander));
    assert_eq!(fabric.parent_device(expander), Some(host));

    let err = fabric
        .register_device(expander, at(0, 0), "nic", Stub::new())
        .unwrap_err();
    assert_eq!(
        err,
        PciError::OnlyBridgesAllowed {
            bus: "pxb.0".to_string()
        }
    );

    let port = fabric.register_device(expander, at(0, 0), "port", Stub::bridge()).unwrap();
    fabric.config_write(port, 0x18, 4, 0x0082_8180);
    let behind = fabric.device(port).unwrap().secondary_bus().unwrap();
    let nic = fabric.register_device(behind, at(0, 0), "nic", Stub::new()).unwrap();

    assert_eq!(fabric.bus_range(expander), (0x80, 0x82));
    assert_eq!(fabric.find_bus_by_number(root, 0x80), Some(expander));
    assert_eq!(fabric.find_device(0x81, PciDevFn::new(0, 0)), Some(nic));
    assert_eq!(fabric.device_path(nic), "0000:80:00.0:00.0");

    // The host cannot go while its expander still has devices.
    fabric.unregister_device(nic).unwrap();
    assert!(matches!(
        fabric.unregister_device(host),
        Err(PciError::BridgeNotEmpty(_))
    ));
    fabric.unregister_device(port).unwrap();
    fabric.unregister_device(host).unwrap();
    assert!(fabric.bus(expander).is_none());
    assert!(fabric.bus(root).unwrap().children().is_empty());
}

#[test]
fn bridges_keep_their_secondary_bus_until_it_is_empty() {
    let mut fabric = fabric();
    let root = fabric.root_bus();
    let bridge = fabric.register_device(root, None, "bridge", Stub::bridge()).unwrap();
    let secondary = fabric.device(bridge).unwrap().secondary_bus().unwrap();
    let dev = fabric.register_device(secondary, None, "dev", Stub::new()).unwrap();

    assert_eq!(
        fabric.unregister_device(bridge).err(),
        Some(PciError::BridgeNotEmpty("bridge".to_string()))
    );
    fabric.unregister_device(dev).unwrap();
    fabric.unregister_device(bridge).unwrap();
    assert!(fabric.bus(secondary).is_none());
    assert_eq!(
        fabric.unregister_device(bridge).err(),
        Some(PciError::DeviceNotFound(bridge))
    );
}

#[test]
fn capabilities_refuse_to_overlap() {
    let mut cfg = PciConfigSpace::new(0x1af4, 0x1000);
    let vndr = add_vendor_capability(&mut cfg, &[1, 2, 3, 4, 5]).unwrap();
    assert_eq!(vndr, 0x40);
    assert_eq!(cfg.find_capability(PCI_CAP_ID_VNDR), Some(0x40));
    assert_eq!(cfg.byte(0x34), 0x40);

    let before = cfg.bytes().to_vec();
    let err = cfg.add_capability(PCI_CAP_ID_MSI, Some(0x44), 10).unwrap_err();
    assert_eq!(
        err,
        PciError::CapabilityOverlap {
            id: PCI_CAP_ID_MSI,
            offset: 0x44,
            size: 10,
            conflict: 0x44,
        }
    );
    assert_eq!(cfg.bytes(), before.as_slice());

    let msi = cfg.add_capability(PCI_CAP_ID_MSI, Some(0x50), 10).unwrap();
    assert_eq!(msi, 0x50);
    // Newest first in the chain.
    assert_eq!(cfg.byte(0x34), 0x50);
    assert_eq!(cfg.byte(0x51), 0x40);
    assert!(cfg.masks_disjoint());
}

#[derive(Debug, Clone)]
enum Op {
    Plug(Option<u8>),
    Unplug(usize),
}

#[derive(Debug, Clone)]
enum CapOp {
    Add { at: Option<u8>, size: u8 },
    Del(usize),
}

fn cap_op() -> impl Strategy<Value = CapOp> {
    prop_oneof![
        (2u8..=24, proptest::option::of(any::<u8>())).prop_map(|(size, at)| {
            // Explicit offsets stay inside the capability area.
            let at = at.map(|at| 0x40 + at % (0xc0 - size + 1));
            CapOp::Add { at, size }
        }),
        any::<usize>().prop_map(CapOp::Del),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::option::of(0u8..32).prop_map(Op::Plug),
        any::<usize>().prop_map(Op::Unplug),
    ]
}

proptest! {
    #[test]
    fn every_slot_holds_at_most_one_function(ops in proptest::collection::vec(op(), 1..80)) {
        let mut fabric = fabric();
        let root = fabric.root_bus();
        let mut model: BTreeMap<u8, DeviceId> = BTreeMap::new();

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Plug(slot) => {
                    let result = fabric.register_device(
                        root,
                        slot.map(|slot| PciDevFn::new(slot, 0)),
                        format!("dev{n}"),
                        Stub::new(),
                    );
                    let expected = match slot {
                        Some(slot) => (!model.contains_key(&slot)).then_some(slot),
                        None => (0..32).find(|slot| !model.contains_key(slot)),
                    };
                    match (result, expected) {
                        (Ok(id), Some(slot)) => {
                            let devfn = fabric.device(id).unwrap().devfn();
                            prop_assert_eq!(devfn, PciDevFn::new(slot, 0));
                            model.insert(slot, id);
                        }
                        (Err(_), None) => {}
                        (result, expected) => {
                            prop_assert!(false, "got {:?}, expected slot {:?}", result, expected);
                        }
                    }
                }
                Op::Unplug(pick) => {
                    if model.is_empty() {
                        continue;
                    }
                    let slot = *model.keys().nth(pick % model.len()).unwrap();
                    let id = model.remove(&slot).unwrap();
                    fabric.unregister_device(id).unwrap();
                }
            }

            let live: Vec<(PciDevFn, DeviceId)> = model
                .iter()
                .map(|(slot, id)| (PciDevFn::new(*slot, 0), *id))
                .collect();
            prop_assert_eq!(fabric.bus(root).unwrap().devices(WalkOrder::Forward), live);
        }
    }

    #[test]
    fn guest_writes_never_touch_read_only_bits(
        writes in proptest::collection::vec((0u16..256, 0usize..3, any::<u32>()), 0..128),
    ) {
        let mut fabric = fabric();
        let root = fabric.root_bus();
        let bridge = fabric.register_device(root, at(1, 0), "bridge", Stub::bridge()).unwrap();
        let mut cfg = PciConfigSpace::new(0x1af4, 0x1000);
        add_vendor_capability(&mut cfg, &[0xaa; 8]).unwrap();
        let dev = fabric
            .register_device(root, at(2, 0), "dev", Box::new(Stub { cfg }))
            .unwrap();

        for (offset, size, value) in writes {
            let size = [1usize, 2, 4][size];
            let offset = offset.min(256 - size as u16);
            fabric.config_write(bridge, offset, size, value);
            fabric.config_write(dev, offset, size, value);
        }

        for (id, vendor, header) in [(bridge, 0x1b36, 0x01), (dev, 0x1af4, 0x00)] {
            let cfg = fabric.device(id).unwrap().config();
            prop_assert!(cfg.masks_disjoint());
            prop_assert_eq!(cfg.vendor_device_id().vendor_id, vendor);
            prop_assert_eq!(cfg.header_type() & 0x7f, header);
        }
        let cfg = fabric.device(dev).unwrap().config();
        prop_assert_eq!(cfg.find_capability(PCI_CAP_ID_VNDR), Some(0x40));
        prop_assert_eq!(cfg.byte(0x43), 0xaa);
    }

    #[test]
    fn capability_list_stays_consistent(ops in proptest::collection::vec(cap_op(), 1..48)) {
        let mut cfg = PciConfigSpace::new(0x1af4, 0x1000);
        // (id, offset, size) of every live capability.
        let mut live: Vec<(u8, u8, u8)> = Vec::new();

        for (n, op) in ops.into_iter().enumerate() {
            let id = 0x80 + n as u8;
            match op {
                CapOp::Add { at: Some(at), size } => {
                    let (start, end) = (usize::from(at), usize::from(at) + usize::from(size));
                    let free = live.iter().all(|&(_, offset, size)| {
                        let lo = usize::from(offset);
                        end <= lo || start >= lo + usize::from(size)
                    });
                    let result = cfg.add_capability(id, Some(at), size);
                    prop_assert_eq!(result.is_ok(), free, "add {:#x}+{} over {:?}", at, size, live);
                    if free {
                        live.push((id, at, size));
                    }
                }
                CapOp::Add { at: None, size } => {
                    let fits = (PCI_CONFIG_HEADER_SIZE..=256 - usize::from(size))
                        .step_by(4)
                        .any(|start| (start..start + usize::from(size)).all(|i| !cfg.is_used(i)));
                    if !fits {
                        continue;
                    }
                    let offset = cfg.add_capability(id, None, size).unwrap();
                    prop_assert_eq!(offset % 4, 0);
                    live.push((id, offset, size));
                }
                CapOp::Del(pick) => {
                    if live.is_empty() {
                        continue;
                    }
                    let (id, _, size) = live.remove(pick % live.len());
                    cfg.del_capability(id, size).unwrap();
                }
            }

            prop_assert!(cfg.masks_disjoint());
            for (i, &(_, a, a_size)) in live.iter().enumerate() {
                let a = (usize::from(a), usize::from(a) + usize::from(a_size));
                prop_assert!(a.0 >= PCI_CONFIG_HEADER_SIZE && a.1 <= 256);
                for &(_, b, b_size) in &live[i + 1..] {
                    let b = (usize::from(b), usize::from(b) + usize::from(b_size));
                    prop_assert!(a.1 <= b.0 || b.1 <= a.0, "{:?} overlaps {:?}", a, b);
                }
            }

            let mut chain = Vec::new();
            let mut next = cfg.byte(PCI_CAPABILITY_LIST);
            while next != 0 && chain.len() <= live.len() {
                chain.push((cfg.byte(usize::from(next)), next));
                next = cfg.byte(usize::from(next) + 1);
            }
            let mut expected: Vec<(u8, u8)> =
                live.iter().map(|&(id, offset, _)| (id, offset)).collect();
            chain.sort_unstable();
            expected.sort_unstable();
            prop_assert_eq!(chain, expected);
        }
    }
}
