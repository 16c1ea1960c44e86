use std::sync::{Arc, Mutex};

use aero_pci_fabric::regs::PciBarType;
use aero_pci_fabric::{
    bios_post, FlatTarget, GsiLevelSink, PciBdf, PciConfigMechanism1, PciConfigSpace, PciDevFn,
    PciDevice, PciDeviceSetup, PciFabric, PciFabricConfig, PciInterruptPin, PciIntxRouter,
    PciIntxRouterConfig, PciResourceAllocator, PciResourceAllocatorConfig, PCI_CFG_ADDR_PORT,
    PCI_CFG_DATA_PORT,
};
use pretty_assertions::assert_eq;

struct Nic {
    cfg: PciConfigSpace,
}

impl Nic {
    fn new() -> Box<Self> {
        let mut cfg = PciConfigSpace::new(0x8086, 0x100e);
        cfg.set_class_code(0x02, 0x00, 0x00, 0x03);
        cfg.set_interrupt_pin(PciInterruptPin::IntA.to_config_u8());
        Box::new(Self { cfg })
    }
}

impl PciDevice for Nic {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }

    fn realize(&mut self, setup: &mut PciDeviceSetup) -> aero_pci_fabric::Result<()> {
        setup.register_bar(0, PciBarType::MEM_32, 0x2_0000);
        setup.register_bar(1, PciBarType::IO, 0x40);
        Ok(())
    }
}

struct Plain {
    cfg: PciConfigSpace,
}

impl Plain {
    fn new(multifunction: bool) -> Box<Self> {
        let mut cfg = PciConfigSpace::new(0x1af4, 0x1000);
        cfg.set_multifunction(multifunction);
        Box::new(Self { cfg })
    }

    fn bridge() -> Box<Self> {
        Box::new(Self {
            cfg: PciConfigSpace::new_bridge(0x1b36, 0x0001),
        })
    }
}

impl PciDevice for Plain {
    fn config(&self) -> &PciConfigSpace {
        &self.cfg
    }

    fn config_mut(&mut self) -> &mut PciConfigSpace {
        &mut self.cfg
    }
}

#[derive(Clone, Default)]
struct Pic(Arc<Mutex<Vec<(u32, bool)>>>);

impl GsiLevelSink for Pic {
    fn set_gsi_level(&mut self, gsi: u32, level: bool) {
        self.0.lock().unwrap().push((gsi, level));
    }
}

fn cfg_address(bdf: PciBdf, reg: u8) -> u32 {
    0x8000_0000 | (u32::from(bdf.pack_u16()) << 8) | u32::from(reg & 0xfc)
}

fn read(
    fabric: &mut PciFabric,
    cfg: &mut PciConfigMechanism1,
    bdf: PciBdf,
    reg: u8,
    size: u8,
) -> u32 {
    cfg.io_write(fabric, PCI_CFG_ADDR_PORT, 4, cfg_address(bdf, reg));
    cfg.io_read(fabric, PCI_CFG_DATA_PORT + u16::from(reg & 3), size)
}

fn write(
    fabric: &mut PciFabric,
    cfg: &mut PciConfigMechanism1,
    bdf: PciBdf,
    reg: u8,
    size: u8,
    value: u32,
) {
    cfg.io_write(fabric, PCI_CFG_ADDR_PORT, 4, cfg_address(bdf, reg));
    cfg.io_write(fabric, PCI_CFG_DATA_PORT + u16::from(reg & 3), size, value);
}

#[test]
fn firmware_view_after_post() {
    let mut fabric = PciFabric::new(PciFabricConfig::default());
    let root = fabric.root_bus();
    let pic = Pic::default();
    PciIntxRouter::new(PciIntxRouterConfig::default(), Box::new(pic.clone()))
        .install(&mut fabric, root)
        .unwrap();

    let bridge = fabric
        .register_device(root, Some(PciDevFn::new(2, 0)), "bridge", Plain::bridge())
        .unwrap();
    let secondary = fabric.device(bridge).unwrap().secondary_bus().unwrap();
    let nic = fabric
        .register_device(secondary, Some(PciDevFn::new(0, 0)), "nic", Nic::new())
        .unwrap();
    fabric.machine_done();

    let mut allocator = PciResourceAllocator::new(PciResourceAllocatorConfig::default());
    bios_post(&mut fabric, &mut allocator).unwrap();

    let mut cfg = PciConfigMechanism1::new();
    let nic_bdf = PciBdf::new(1, 0, 0);
    assert_eq!(fabric.device_bdf(nic), nic_bdf);
    assert_eq!(read(&mut fabric, &mut cfg, nic_bdf, 0x00, 4), 0x100e_8086);
    assert_eq!(read(&mut fabric, &mut cfg, nic_bdf, 0x02, 2), 0x100e);
    assert_eq!(read(&mut fabric, &mut cfg, nic_bdf, 0x10, 4), 0xe000_0000);
    assert_eq!(read(&mut fabric, &mut cfg, nic_bdf, 0x14, 4), 0x1001);

    // INTA at slot 0 behind a bridge in slot 2 lands on PIRQC.
    assert_eq!(read(&mut fabric, &mut cfg, nic_bdf, 0x3c, 1), 12);
    assert_eq!(read(&mut fabric, &mut cfg, nic_bdf, 0x3d, 1), 1);

    let bridge_bdf = PciBdf::new(0, 2, 0);
    assert_eq!(read(&mut fabric, &mut cfg, bridge_bdf, 0x18, 4) & 0x00ff_ffff, 0x0001_0100);
    assert_eq!(read(&mut fabric, &mut cfg, bridge_bdf, 0x20, 4), 0xe000_e000);

    let mem = fabric.bus(root).unwrap().memory_space();
    let io = fabric.bus(root).unwrap().io_space();
    assert_eq!(
        fabric.address_spaces().view(mem).lookup(0xe001_0000),
        Some((FlatTarget::Region { device: nic, region: 0 }, 0x1_0000))
    );
    assert_eq!(
        fabric.address_spaces().view(io).lookup(0x1004),
        Some((FlatTarget::Region { device: nic, region: 1 }, 4))
    );

    // Turning memory decode off through the data port unmaps the BAR.
    let command = read(&mut fabric, &mut cfg, nic_bdf, 0x04, 2);
    write(&mut fabric, &mut cfg, nic_bdf, 0x04, 2, command & !0x2);
    assert_eq!(fabric.address_spaces().view(mem).lookup(0xe001_0000), None);
    assert_eq!(fabric.bar_address(nic, 0), None);

    fabric.set_intx(nic, true);
    assert_eq!(*pic.0.lock().unwrap(), vec![(12, true)]);
}

#[test]
fn absent_functions_read_all_ones() {
    let mut fabric = PciFabric::new(PciFabricConfig::default());
    let root = fabric.root_bus();
    let mut cfg = PciConfigMechanism1::new();

    let dev = fabric
        .register_device(root, Some(PciDevFn::new(3, 0)), "dev", Plain::new(false))
        .unwrap();
    let bdf = PciBdf::new(0, 3, 0);
    assert_eq!(read(&mut fabric, &mut cfg, bdf, 0x00, 2), 0x1af4);
    assert_eq!(read(&mut fabric, &mut cfg, PciBdf::new(0, 4, 0), 0x00, 4), 0xffff_ffff);
    assert_eq!(read(&mut fabric, &mut cfg, PciBdf::new(7, 0, 0), 0x00, 4), 0xffff_ffff);

    fabric.set_power(dev, false);
    assert_eq!(read(&mut fabric, &mut cfg, bdf, 0x00, 4), 0xffff_ffff);
    // Writes to a function that does not answer are dropped.
    write(&mut fabric, &mut cfg, bdf, 0x3c, 1, 0x0a);
    assert_eq!(fabric.device(dev).unwrap().config().interrupt_line(), 0);

    fabric.set_power(dev, true);
    assert_eq!(read(&mut fabric, &mut cfg, bdf, 0x00, 2), 0x1af4);
}

#[test]
fn data_port_accesses_are_cut_at_the_end_of_config_space() {
    let mut fabric = PciFabric::new(PciFabricConfig::default());
    let root = fabric.root_bus();
    fabric
        .register_device(root, Some(PciDevFn::new(1, 0)), "dev", Plain::new(false))
        .unwrap();
    let mut cfg = PciConfigMechanism1::new();
    cfg.io_write(&mut fabric, PCI_CFG_ADDR_PORT, 4, 0x8000_08fc);

    cfg.io_write(&mut fabric, PCI_CFG_DATA_PORT, 4, 0x1122_3344);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT + 1, 4), 0x0011_2233);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT + 2, 4), 0x1122);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT + 3, 4), 0x11);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT + 3, 2), 0x11);

    cfg.io_write(&mut fabric, PCI_CFG_DATA_PORT + 1, 4, 0xffaa_bbcc);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT, 4), 0xaabb_cc44);
    cfg.io_write(&mut fabric, PCI_CFG_DATA_PORT + 2, 4, 0x5566);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT, 4), 0x5566_cc44);
    cfg.io_write(&mut fabric, PCI_CFG_DATA_PORT + 3, 2, 0x77);
    assert_eq!(cfg.io_read(&mut fabric, PCI_CFG_DATA_PORT, 4), 0x7766_cc44);
}

#[test]
fn hotplugged_functions_hide_without_function_zero() {
    let mut fabric = PciFabric::new(PciFabricConfig::default());
    let root = fabric.root_bus();
    let mut cfg = PciConfigMechanism1::new();
    fabric.machine_done();

    let fn0 = fabric
        .register_device(root, Some(PciDevFn::new(5, 0)), "fn0", Plain::new(true))
        .unwrap();
    fabric
        .register_device(root, Some(PciDevFn::new(5, 1)), "fn1", Plain::new(false))
        .unwrap();
    let fn1_bdf = PciBdf::new(0, 5, 1);
    assert_eq!(read(&mut fabric, &mut cfg, fn1_bdf, 0x00, 2), 0x1af4);

    fabric.unregister_device(fn0).unwrap();
    assert_eq!(read(&mut fabric, &mut cfg, fn1_bdf, 0x00, 2), 0xffff_ffff);
}
