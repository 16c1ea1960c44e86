use tracing::debug;

use crate::address_space::{AddressSpaceId, Mapping, MappingKey, MappingTarget};
use crate::config::PciConfigMask;
use crate::fabric::PciFabric;
use crate::regs::*;
use crate::{BusId, DeviceId};

/// A BAR or expansion ROM region of a function.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PciIoRegion {
    /// Zero for an unregistered region.
    pub size: u64,
    pub ty: PciBarType,
    /// Address the region currently decodes at.
    pub addr: Option<u64>,
    /// The owning bus's memory or I/O space.
    pub space: Option<AddressSpaceId>,
}

/// Legacy VGA ranges: (memory?, base, size).
const VGA_RANGES: [(bool, u64, u64); 3] = [
    (true, PCI_VGA_MEM_BASE, PCI_VGA_MEM_SIZE),
    (false, PCI_VGA_IO_LO_BASE, PCI_VGA_IO_LO_SIZE),
    (false, PCI_VGA_IO_HI_BASE, PCI_VGA_IO_HI_SIZE),
];

impl PciFabric {
    /// Installs the declared regions: type bits in config space, writable address bits and the
    /// target address space of each region.
    pub(crate) fn register_regions(&mut self, id: DeviceId, bars: &[(usize, PciBarType, u64)]) {
        let (mem, io) = {
            let bus = self.bus_ref(self.func(id).bus);
            (bus.mem, bus.io)
        };
        let function = self.func_mut(id);
        let is_bridge = function.config().is_bridge();

        for &(region, ty, size) in bars {
            function.regions[region] = PciIoRegion {
                size,
                ty,
                addr: None,
                space: Some(if ty.is_io() { io } else { mem }),
            };

            let mut wmask = !(size - 1);
            if region == PCI_ROM_SLOT {
                wmask |= u64::from(PCI_ROM_ADDRESS_ENABLE);
            }
            let offset = bar_offset(region, is_bridge);
            let cfg = function.model.config_mut();
            let len = if !ty.is_io() && ty.is_64bit() { 8 } else { 4 };
            if len == 8 {
                cfg.set_quad(offset, u64::from(ty.bits()));
            } else {
                cfg.set_long(offset, u32::from(ty.bits()));
                wmask &= 0xffff_ffff;
            }
            cfg.set_mask(PciConfigMask::Write, offset, len, wmask);
            cfg.set_mask(PciConfigMask::WriteOneToClear, offset, len, 0);
            // Type bits are checked on load; address bits are guest state.
            cfg.set_mask(PciConfigMask::Check, offset, len, !wmask);
        }
    }

    /// Rewrites every registered BAR register to its bare type bits.
    pub(crate) fn reset_regions(&mut self, id: DeviceId) {
        let function = self.func_mut(id);
        let is_bridge = function.config().is_bridge();
        for region in 0..PCI_NUM_REGIONS {
            let PciIoRegion { size, ty, .. } = function.regions[region];
            if size == 0 {
                continue;
            }
            let offset = bar_offset(region, is_bridge);
            let cfg = function.model.config_mut();
            if !ty.is_io() && ty.is_64bit() {
                cfg.set_quad(offset, u64::from(ty.bits()));
            } else {
                cfg.set_long(offset, u32::from(ty.bits()));
            }
        }
    }

    /// Where `region` would decode given the current command register and BAR contents, or
    /// `None` when it is not decoded.
    pub fn bar_address(&self, id: DeviceId, region: usize) -> Option<u64> {
        let function = self.devices.get(&id)?;
        let PciIoRegion { size, ty, .. } = *function.regions.get(region)?;
        if size == 0 {
            return None;
        }
        let cfg = function.config();
        let command = cfg.command();
        let offset = bar_offset(region, cfg.is_bridge());
        let allow_zero = self.cfg.allow_zero_bar_address;

        if ty.is_io() {
            if !command.contains(PciCommand::IO) {
                return None;
            }
            let base = u64::from(cfg.long(offset)) & !(size - 1);
            let last = base.wrapping_add(size - 1);
            if last <= base || last >= u64::from(u32::MAX) || (!allow_zero && base == 0) {
                return None;
            }
            return Some(base);
        }

        if !command.contains(PciCommand::MEMORY) {
            return None;
        }
        let raw = if ty.is_64bit() {
            cfg.quad(offset)
        } else {
            u64::from(cfg.long(offset))
        };
        if region == PCI_ROM_SLOT && raw & u64::from(PCI_ROM_ADDRESS_ENABLE) == 0 {
            return None;
        }
        let base = raw & !(size - 1);
        let last = base.wrapping_add(size - 1);
        if last <= base || last == PCI_BAR_UNMAPPED || (!allow_zero && base == 0) {
            return None;
        }
        if !ty.is_64bit() && last >= u64::from(u32::MAX) {
            return None;
        }
        Some(base)
    }

    /// Re-derives every region's decode address and moves the mappings that changed, in one
    /// batch. Also refreshes the VGA ranges.
    pub(crate) fn update_mappings(&mut self, id: DeviceId) {
        self.spaces.begin();
        for region in 0..PCI_NUM_REGIONS {
            let current = self.func(id).regions[region];
            if current.size == 0 {
                continue;
            }
            let new_addr = if self.func(id).has_power {
                self.bar_address(id, region)
            } else {
                None
            };
            if new_addr == current.addr {
                continue;
            }

            let space = current.space.expect("registered region without address space");
            let key = MappingKey::Bar { device: id, region };
            if current.addr.is_some() {
                self.spaces.remove(space, key);
            }
            if let Some(base) = new_addr {
                self.spaces.add(
                    space,
                    key,
                    Mapping {
                        base,
                        size: current.size,
                        priority: 1,
                        target: MappingTarget::Region { device: id, region },
                    },
                );
            }
            debug!(
                bdf = %self.device_bdf(id),
                region,
                old = ?current.addr,
                new = ?new_addr,
                "BAR mapping updated"
            );
            self.func_mut(id).regions[region].addr = new_addr;
        }
        self.update_vga(id);
        self.spaces.commit();
    }

    /// VGA ranges decode whenever the matching command bit is set.
    pub(crate) fn update_vga(&mut self, id: DeviceId) {
        let function = self.func(id);
        if !function.vga {
            return;
        }
        let command = function.config().command();
        let powered = function.has_power;
        let (mem, io) = self.bus_spaces(function.bus);

        self.spaces.begin();
        for (index, (is_mem, base, size)) in VGA_RANGES.into_iter().enumerate() {
            let (space, enable) = if is_mem {
                (mem, command.contains(PciCommand::MEMORY))
            } else {
                (io, command.contains(PciCommand::IO))
            };
            let key = MappingKey::Vga { device: id, index };
            if enable && powered {
                if self.spaces.get(space, key).is_none() {
                    self.spaces.add(
                        space,
                        key,
                        Mapping {
                            base,
                            size,
                            priority: 1,
                            target: MappingTarget::Vga { device: id, index },
                        },
                    );
                }
            } else {
                self.spaces.remove(space, key);
            }
        }
        self.spaces.commit();
    }

    /// Drops every BAR and VGA mapping of a function.
    pub(crate) fn unmap_regions(&mut self, id: DeviceId) {
        let (mem, io) = self.bus_spaces(self.func(id).bus);
        self.spaces.begin();
        for region in 0..PCI_NUM_REGIONS {
            let current = self.func(id).regions[region];
            if let (Some(_), Some(space)) = (current.addr, current.space) {
                self.spaces.remove(space, MappingKey::Bar { device: id, region });
            }
            self.func_mut(id).regions[region].addr = None;
        }
        for (index, (is_mem, _, _)) in VGA_RANGES.into_iter().enumerate() {
            let space = if is_mem { mem } else { io };
            self.spaces.remove(space, MappingKey::Vga { device: id, index });
        }
        self.spaces.commit();
    }

    fn bus_spaces(&self, bus: BusId) -> (AddressSpaceId, AddressSpaceId) {
        let bus = self.bus_ref(bus);
        (bus.mem, bus.io)
    }

    pub fn region(&self, id: DeviceId, region: usize) -> Option<PciIoRegion> {
        self.devices.get(&id)?.regions.get(region).copied()
    }

    /// Bus mastering follows the command register and the power state.
    pub(crate) fn update_bus_master(&mut self, id: DeviceId) {
        let function = self.func_mut(id);
        let enabled =
            function.has_power && function.config().command().contains(PciCommand::MASTER);
        if function.bus_master != enabled {
            function.bus_master = enabled;
            debug!(name = %function.name, enabled, "bus master");
        }
    }

    /// Powers a function on or off. An unpowered function decodes nothing, cannot master the
    /// bus and is reset.
    pub fn set_power(&mut self, id: DeviceId, on: bool) {
        let Some(function) = self.devices.get_mut(&id) else {
            return;
        };
        if function.has_power == on {
            return;
        }
        function.has_power = on;
        self.update_mappings(id);
        self.update_bus_master(id);
        if !on {
            self.reset_device(id);
        }
    }

    /// Span of the 64-bit memory decoded at or above 4 GiB by memory-enabled functions on `bus`:
    /// prefetchable bridge windows (which cover everything behind them) and mapped 64-bit BARs.
    pub fn bus_w64_range(&self, bus: BusId) -> Option<(u64, u64)> {
        const FOUR_GIB: u64 = 1 << 32;
        let mut range: Option<(u64, u64)> = None;
        let mut extend = |base: u64, last: u64| {
            let base = base.max(FOUR_GIB);
            if last < base {
                return;
            }
            range = Some(match range {
                Some((lo, hi)) => (lo.min(base), hi.max(last)),
                None => (base, last),
            });
        };

        let bus = self.buses.get(&bus)?;
        for (_, id) in bus.devices(crate::bus::WalkOrder::Forward) {
            let function = self.func(id);
            let cfg = function.config();
            if !cfg.command().contains(PciCommand::MEMORY) {
                continue;
            }
            if function.is_bridge() {
                if let Some(window) = self.bridge_windows(id) {
                    let (base, size) = window.prefetch;
                    if size > 0 {
                        extend(base, base + (size - 1));
                    }
                }
                continue;
            }
            for region in &function.regions[..PCI_ROM_SLOT] {
                if region.size == 0 || region.ty.is_io() || !region.ty.is_64bit() {
                    continue;
                }
                if let Some(base) = region.addr {
                    extend(base, base + (region.size - 1));
                }
            }
        }
        range
    }
}
