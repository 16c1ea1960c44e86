use tracing::{debug, warn};

use crate::bus::{PciBusKind, WalkOrder};
use crate::fabric::PciFabric;
use crate::irq_router::PciIntxRoute;
use crate::regs::*;
use crate::resources::{PciResourceAllocator, PciResourceError};
use crate::{BusId, DeviceId, PciInterruptPin};

const BRIDGE_IO_ALIGN: u64 = 0x1000;
const BRIDGE_MEM_ALIGN: u64 = 0x10_0000;

/// A minimal PCI "POST" routine: numbers the buses, assigns BARs and bridge windows, fills in the
/// interrupt line and enables decoding.
///
/// This is a firmware helper, not a full PCI BIOS implementation. It exists so that early boot
/// payloads can see a coherent PCI resource map without relying on the guest OS to assign BARs.
/// Ranges reserved in `allocator` beforehand are left alone.
pub fn bios_post(
    fabric: &mut PciFabric,
    allocator: &mut PciResourceAllocator,
) -> Result<(), PciResourceError> {
    fabric.reset();

    let root = fabric.root_bus();
    let mut last_bus = fabric.bus_number(root);
    number_buses(fabric, root, &mut last_bus)?;
    assign_bus(fabric, root, allocator)?;
    Ok(())
}

/// Depth-first bus numbering. On return `last` is the highest number used at or below `bus`.
fn number_buses(
    fabric: &mut PciFabric,
    bus: BusId,
    last: &mut u8,
) -> Result<(), PciResourceError> {
    let primary = fabric.bus_number(bus);
    let devices = fabric.bus_ref(bus).devices(WalkOrder::Forward);
    for (_, id) in devices {
        let Some(secondary) = fabric.func(id).secondary_bus() else {
            continue;
        };
        *last = last.checked_add(1).ok_or(PciResourceError::OutOfBusNumbers)?;
        write8(fabric, id, PCI_PRIMARY_BUS, primary);
        write8(fabric, id, PCI_SECONDARY_BUS, *last);
        write8(fabric, id, PCI_SUBORDINATE_BUS, 0xff);
        number_buses(fabric, secondary, last)?;
        write8(fabric, id, PCI_SUBORDINATE_BUS, *last);
    }

    let expanders: Vec<BusId> = fabric
        .bus_ref(bus)
        .children()
        .iter()
        .copied()
        .filter(|child| matches!(fabric.bus_ref(*child).kind(), PciBusKind::ExpanderRoot { .. }))
        .collect();
    for expander in expanders {
        *last = (*last).max(fabric.bus_number(expander));
        number_buses(fabric, expander, last)?;
    }
    Ok(())
}

fn assign_bus(
    fabric: &mut PciFabric,
    bus: BusId,
    allocator: &mut PciResourceAllocator,
) -> Result<(), PciResourceError> {
    let devices = fabric.bus_ref(bus).devices(WalkOrder::Forward);
    for (_, id) in devices {
        let mut command = assign_bars(fabric, id, allocator)?;
        if let Some(secondary) = fabric.func(id).secondary_bus() {
            assign_bridge_windows(fabric, id, secondary, allocator)?;
            command |= PciCommand::IO | PciCommand::MEMORY | PciCommand::MASTER;
        }
        assign_interrupt_line(fabric, id);
        if !command.is_empty() {
            let current = fabric.func(id).config().command();
            fabric.config_write(id, PCI_COMMAND as u16, 2, u32::from((current | command).bits()));
        }
    }

    let expanders: Vec<BusId> = fabric
        .bus_ref(bus)
        .children()
        .iter()
        .copied()
        .filter(|child| matches!(fabric.bus_ref(*child).kind(), PciBusKind::ExpanderRoot { .. }))
        .collect();
    for expander in expanders {
        assign_bus(fabric, expander, allocator)?;
    }
    Ok(())
}

/// Places every registered region in ascending order; returns the decode bits it needs.
fn assign_bars(
    fabric: &mut PciFabric,
    id: DeviceId,
    allocator: &mut PciResourceAllocator,
) -> Result<PciCommand, PciResourceError> {
    let is_bridge = fabric.func(id).is_bridge();
    let mut command = PciCommand::empty();
    for region in 0..PCI_NUM_REGIONS {
        let Some(bar) = fabric.region(id, region).filter(|bar| bar.size > 0) else {
            continue;
        };
        let addr = allocator.allocate_bar(bar.ty, bar.size)?;
        let offset = bar_offset(region, is_bridge) as u16;
        fabric.config_write(id, offset, 4, addr as u32);
        if bar.ty.is_64bit() {
            fabric.config_write(id, offset + 4, 4, (addr >> 32) as u32);
        }
        debug!(
            name = %fabric.func(id).name(),
            region,
            addr = format_args!("{addr:#x}"),
            "BAR assigned"
        );

        // The expansion ROM stays disabled; the guest enables it when it wants to shadow it.
        if region == PCI_ROM_SLOT {
            continue;
        }
        command |= if bar.ty.is_io() {
            PciCommand::IO
        } else {
            PciCommand::MEMORY
        };
    }
    Ok(command)
}

fn assign_bridge_windows(
    fabric: &mut PciFabric,
    bridge: DeviceId,
    secondary: BusId,
    allocator: &mut PciResourceAllocator,
) -> Result<(), PciResourceError> {
    let io_start = allocator.align_io(BRIDGE_IO_ALIGN)?;
    let mem_start = allocator.align_mmio(BRIDGE_MEM_ALIGN)?;
    assign_bus(fabric, secondary, allocator)?;
    let io_end = allocator.align_io(BRIDGE_IO_ALIGN)?;
    let mem_end = allocator.align_mmio(BRIDGE_MEM_ALIGN)?;

    if io_end > io_start {
        write8(fabric, bridge, PCI_IO_BASE, (io_start >> 8) as u8 & PCI_IO_RANGE_MASK);
        write8(fabric, bridge, PCI_IO_LIMIT, ((io_end - 1) >> 8) as u8 & PCI_IO_RANGE_MASK);
    } else {
        write8(fabric, bridge, PCI_IO_BASE, PCI_IO_RANGE_MASK);
        write8(fabric, bridge, PCI_IO_LIMIT, 0);
    }

    if mem_end > mem_start {
        let base = (mem_start >> 16) as u16 & PCI_MEMORY_RANGE_MASK;
        let limit = ((mem_end - 1) >> 16) as u16 & PCI_MEMORY_RANGE_MASK;
        write16(fabric, bridge, PCI_MEMORY_BASE, base);
        write16(fabric, bridge, PCI_MEMORY_LIMIT, limit);
    } else {
        write16(fabric, bridge, PCI_MEMORY_BASE, PCI_MEMORY_RANGE_MASK);
        write16(fabric, bridge, PCI_MEMORY_LIMIT, 0);
    }

    // Prefetchable BARs are placed in the non-prefetchable window.
    write16(fabric, bridge, PCI_PREF_MEMORY_BASE, PCI_PREF_RANGE_MASK);
    write16(fabric, bridge, PCI_PREF_MEMORY_LIMIT, 0);
    fabric.config_write(bridge, PCI_PREF_BASE_UPPER32 as u16, 4, 0);
    fabric.config_write(bridge, PCI_PREF_LIMIT_UPPER32 as u16, 4, 0);

    debug!(
        name = %fabric.func(bridge).name(),
        io = format_args!("{io_start:#x}..{io_end:#x}"),
        mem = format_args!("{mem_start:#x}..{mem_end:#x}"),
        "bridge windows assigned"
    );
    Ok(())
}

fn assign_interrupt_line(fabric: &mut PciFabric, id: DeviceId) {
    let Some(pin) = PciInterruptPin::from_config_u8(fabric.func(id).config().interrupt_pin())
    else {
        return;
    };
    match fabric.route_intx_to_irq(id, pin) {
        PciIntxRoute::Enabled(irq) => match u8::try_from(irq) {
            Ok(line) => write8(fabric, id, PCI_INTERRUPT_LINE, line),
            Err(_) => warn!(name = %fabric.func(id).name(), irq, "INTx routed above IRQ 255"),
        },
        PciIntxRoute::Disabled => write8(fabric, id, PCI_INTERRUPT_LINE, 0xff),
    }
}

fn write8(fabric: &mut PciFabric, id: DeviceId, offset: usize, value: u8) {
    fabric.config_write(id, offset as u16, 1, u32::from(value));
}

fn write16(fabric: &mut PciFabric, id: DeviceId, offset: usize, value: u16) {
    fabric.config_write(id, offset as u16, 2, u32::from(value));
}
