//! PCI-to-PCI bridges: the secondary bus, forwarding windows and secondary bus reset.
//!
//! A bridge forwards three windows from its primary bus into its secondary bus: I/O, memory and
//! prefetchable memory. Each window is an alias of the secondary address space placed at the
//! same address in the primary space, so a BAR mapped behind the bridge is reachable from above
//! exactly when the bridge's window covers it and the bridge's command register enables decoding.

use tracing::debug;

use crate::address_space::{
    AddressSpaceId, AddressSpaceKind, BridgeWindow, Mapping, MappingKey, MappingTarget,
};
use crate::bus::{PciBus, PciBusKind};
use crate::config::PciConfigSpace;
use crate::capabilities::link_status;
use crate::fabric::PciFabric;
use crate::regs::*;
use crate::{DeviceId, PciDevFn};

/// What a bridge's base/limit registers hold after reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BridgeResetPolicy {
    /// All base and limit registers read as zero.
    #[default]
    Zero,
    /// Every base is programmed above its limit so no window forwards anything.
    Disable,
}

/// State the fabric keeps for a function with a type 1 header.
#[derive(Debug)]
pub(crate) struct BridgeState {
    pub(crate) secondary: crate::BusId,
    /// PIRQ A..H (0..7) per (slot, pin) of the secondary bus.
    pub(crate) pirq_table: [[u8; PCI_NUM_PINS]; 32],
}

/// Decoded base/limit registers of a bridge, as `(base, size)` pairs. A size of zero means the
/// window forwards nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciBridgeWindows {
    pub io: (u64, u64),
    pub memory: (u64, u64),
    pub prefetch: (u64, u64),
    /// Bridge control VGA enable.
    pub vga: bool,
}

const VGA_ALIASES: [(AddressSpaceKind, u64, u64); 3] = [
    (AddressSpaceKind::Io, PCI_VGA_IO_LO_BASE, PCI_VGA_IO_LO_SIZE),
    (AddressSpaceKind::Io, PCI_VGA_IO_HI_BASE, PCI_VGA_IO_HI_SIZE),
    (AddressSpaceKind::Memory, PCI_VGA_MEM_BASE, PCI_VGA_MEM_SIZE),
];

fn io_base(cfg: &PciConfigSpace, reg: usize, upper16: usize) -> u64 {
    let raw = cfg.byte(reg);
    let mut value = u64::from(raw & PCI_IO_RANGE_MASK) << 8;
    if raw & PCI_IO_RANGE_TYPE_MASK == PCI_IO_RANGE_TYPE_32 {
        value |= u64::from(cfg.word(upper16)) << 16;
    }
    value
}

fn memory_base(cfg: &PciConfigSpace, reg: usize) -> u64 {
    u64::from(cfg.word(reg) & PCI_MEMORY_RANGE_MASK) << 16
}

fn pref_base(cfg: &PciConfigSpace, reg: usize, upper32: usize) -> u64 {
    let raw = cfg.word(reg);
    let mut value = u64::from(raw & PCI_PREF_RANGE_MASK) << 16;
    if raw & PCI_PREF_RANGE_TYPE_64 != 0 {
        value |= u64::from(cfg.long(upper32)) << 32;
    }
    value
}

fn window_size(base: u64, limit: u64) -> u64 {
    if limit >= base {
        // A window spanning the whole 64-bit space cannot be expressed; clamp it.
        (limit - base).saturating_add(1)
    } else {
        0
    }
}

impl PciBridgeWindows {
    pub fn from_config(cfg: &PciConfigSpace) -> Self {
        let io = io_base(cfg, PCI_IO_BASE, PCI_IO_BASE_UPPER16);
        let io_limit = io_base(cfg, PCI_IO_LIMIT, PCI_IO_LIMIT_UPPER16) | 0xfff;
        let mem = memory_base(cfg, PCI_MEMORY_BASE);
        let mem_limit = memory_base(cfg, PCI_MEMORY_LIMIT) | 0xf_ffff;
        let pref = pref_base(cfg, PCI_PREF_MEMORY_BASE, PCI_PREF_BASE_UPPER32);
        let pref_limit = pref_base(cfg, PCI_PREF_MEMORY_LIMIT, PCI_PREF_LIMIT_UPPER32) | 0xf_ffff;
        let control = PciBridgeControl::from_bits_retain(cfg.word(PCI_BRIDGE_CONTROL));

        Self {
            io: (io, window_size(io, io_limit)),
            memory: (mem, window_size(mem, mem_limit)),
            prefetch: (pref, window_size(pref, pref_limit)),
            vga: control.contains(PciBridgeControl::VGA),
        }
    }
}

/// Express capability offset of a root or downstream port.
pub(crate) fn downstream_port_cap(cfg: &PciConfigSpace) -> Option<usize> {
    match cfg.express_port_type()? {
        PCI_EXP_TYPE_ROOT_PORT | PCI_EXP_TYPE_DOWNSTREAM => {
            cfg.find_capability(PCI_CAP_ID_EXP).map(usize::from)
        }
        _ => None,
    }
}

impl PciFabric {
    /// Creates the secondary bus of a newly registered bridge and installs its (initially
    /// disabled) windows.
    pub(crate) fn attach_secondary_bus(&mut self, bridge: DeviceId, name: Option<String>) {
        let function = self.func(bridge);
        let name = name.unwrap_or_else(|| format!("{}.0", function.name));
        let express = function.config().is_express()
            && function.config().express_port_type() != Some(PCI_EXP_TYPE_PCI_BRIDGE);
        let parent = function.bus;

        let mem = self.spaces.create(format!("{name}-mem"), AddressSpaceKind::Memory);
        let io = self.spaces.create(format!("{name}-io"), AddressSpaceKind::Io);
        let mut bus = PciBus::new(name, PciBusKind::Secondary { bridge }, mem, io);
        bus.express = express;

        let secondary = self.alloc_bus(bus);
        self.bus_mut(parent).children.push(secondary);
        self.func_mut(bridge).bridge = Some(BridgeState {
            secondary,
            pirq_table: [[0; PCI_NUM_PINS]; 32],
        });
        self.update_bridge_windows(bridge);
    }

    /// Removes a bridge's windows and its (empty) secondary bus.
    pub(crate) fn detach_secondary_bus(&mut self, bridge: DeviceId) {
        let Some(secondary) = self.func(bridge).secondary_bus() else {
            return;
        };
        let (mem, io) = {
            let parent = self.bus_ref(self.func(bridge).bus);
            (parent.mem, parent.io)
        };
        self.spaces.begin();
        for window in [BridgeWindow::Io, BridgeWindow::Memory, BridgeWindow::Prefetch] {
            let space = if window == BridgeWindow::Io { io } else { mem };
            self.spaces.remove(space, MappingKey::Window { bridge, window });
        }
        for (index, (kind, _, _)) in VGA_ALIASES.into_iter().enumerate() {
            let space = if kind == AddressSpaceKind::Io { io } else { mem };
            self.spaces.remove(space, MappingKey::BridgeVga { bridge, index });
        }
        self.remove_child_bus(secondary);
        self.spaces.commit();
        self.func_mut(bridge).bridge = None;
    }

    /// Decoded window registers of a bridge.
    pub fn bridge_windows(&self, bridge: DeviceId) -> Option<PciBridgeWindows> {
        let function = self.devices.get(&bridge)?;
        function.bridge.as_ref()?;
        Some(PciBridgeWindows::from_config(function.config()))
    }

    /// Republishes the bridge's windows and VGA aliases from its registers, in one batch.
    pub(crate) fn update_bridge_windows(&mut self, bridge: DeviceId) {
        let function = self.func(bridge);
        let Some(secondary) = function.secondary_bus() else {
            return;
        };
        let windows = PciBridgeWindows::from_config(function.config());
        let command = function.config().command();
        let (parent_mem, parent_io) = {
            let parent = self.bus_ref(function.bus);
            (parent.mem, parent.io)
        };
        let (sec_mem, sec_io) = {
            let secondary = self.bus_ref(secondary);
            (secondary.mem, secondary.io)
        };

        let decode = [
            (
                BridgeWindow::Prefetch,
                windows.prefetch,
                command.contains(PciCommand::MEMORY),
            ),
            (
                BridgeWindow::Memory,
                windows.memory,
                command.contains(PciCommand::MEMORY),
            ),
            (BridgeWindow::Io, windows.io, command.contains(PciCommand::IO)),
        ];

        self.spaces.begin();
        for (window, (base, size), enabled) in decode {
            let (parent, inner) = if window == BridgeWindow::Io {
                (parent_io, sec_io)
            } else {
                (parent_mem, sec_mem)
            };
            let key = MappingKey::Window { bridge, window };
            self.spaces.remove(parent, key);
            if enabled && size > 0 {
                self.spaces.add(
                    parent,
                    key,
                    Mapping {
                        base,
                        size,
                        priority: 1,
                        target: MappingTarget::Alias {
                            space: inner,
                            offset: base,
                        },
                    },
                );
            }
        }

        for (index, (kind, base, size)) in VGA_ALIASES.into_iter().enumerate() {
            let (parent, inner): (AddressSpaceId, AddressSpaceId) = if kind == AddressSpaceKind::Io
            {
                (parent_io, sec_io)
            } else {
                (parent_mem, sec_mem)
            };
            let key = MappingKey::BridgeVga { bridge, index };
            self.spaces.remove(parent, key);
            if windows.vga {
                self.spaces.add(
                    parent,
                    key,
                    Mapping {
                        base,
                        size,
                        priority: 1,
                        target: MappingTarget::Alias {
                            space: inner,
                            offset: base,
                        },
                    },
                );
            }
        }
        self.spaces.commit();

        debug!(
            bdf = %self.device_bdf(bridge),
            io = ?windows.io,
            mem = ?windows.memory,
            pref = ?windows.prefetch,
            vga = windows.vga,
            "bridge windows updated"
        );
    }

    /// Bridge part of a function reset: bus numbers, latency timer, windows and bridge control.
    pub(crate) fn reset_bridge_registers(&mut self, bridge: DeviceId) {
        let function = self.func_mut(bridge);
        let policy = function.model.bridge_reset_policy();
        let cfg = function.model.config_mut();

        for reg in [
            PCI_PRIMARY_BUS,
            PCI_SECONDARY_BUS,
            PCI_SUBORDINATE_BUS,
            PCI_SEC_LATENCY_TIMER,
        ] {
            cfg.set_byte(reg, 0);
        }

        match policy {
            BridgeResetPolicy::Zero => {
                for reg in [PCI_IO_BASE, PCI_IO_LIMIT] {
                    let value = cfg.byte(reg) & !PCI_IO_RANGE_MASK;
                    cfg.set_byte(reg, value);
                }
                for reg in [
                    PCI_MEMORY_BASE,
                    PCI_MEMORY_LIMIT,
                    PCI_PREF_MEMORY_BASE,
                    PCI_PREF_MEMORY_LIMIT,
                ] {
                    let value = cfg.word(reg) & !PCI_MEMORY_RANGE_MASK;
                    cfg.set_word(reg, value);
                }
            }
            BridgeResetPolicy::Disable => {
                let io = cfg.byte(PCI_IO_BASE) | PCI_IO_RANGE_MASK;
                cfg.set_byte(PCI_IO_BASE, io);
                let io = cfg.byte(PCI_IO_LIMIT) & !PCI_IO_RANGE_MASK;
                cfg.set_byte(PCI_IO_LIMIT, io);
                for (base, limit) in [
                    (PCI_MEMORY_BASE, PCI_MEMORY_LIMIT),
                    (PCI_PREF_MEMORY_BASE, PCI_PREF_MEMORY_LIMIT),
                ] {
                    let value = cfg.word(base) | PCI_MEMORY_RANGE_MASK;
                    cfg.set_word(base, value);
                    let value = cfg.word(limit) & !PCI_MEMORY_RANGE_MASK;
                    cfg.set_word(limit, value);
                }
            }
        }
        cfg.set_long(PCI_PREF_BASE_UPPER32, 0);
        cfg.set_long(PCI_PREF_LIMIT_UPPER32, 0);
        cfg.set_long(PCI_IO_BASE_UPPER16, 0);
        cfg.set_word(PCI_BRIDGE_CONTROL, 0);
    }

    /// Resets everything below a bridge; the bridge itself is untouched.
    pub(crate) fn reset_secondary_bus(&mut self, bridge: DeviceId) {
        let Some(secondary) = self.func(bridge).secondary_bus() else {
            return;
        };
        debug!(bdf = %self.device_bdf(bridge), "secondary bus reset");
        self.reset_bus(secondary);
    }

    /// Refreshes the link status of a root or downstream port from the function behind it.
    pub(crate) fn sync_bridge_link(&mut self, port: DeviceId) {
        let function = self.func(port);
        let Some(cap) = downstream_port_cap(function.config()) else {
            return;
        };
        let Some(secondary) = function.secondary_bus() else {
            return;
        };
        let lnkcap = function.config().long(cap + PCI_EXP_LNKCAP);
        let max_speed = (lnkcap & 0xf) as u16;
        let max_width = ((lnkcap >> 4) & 0x3f) as u16;

        let target = self
            .bus_ref(secondary)
            .device_at(PciDevFn::new(0, 0))
            .map(|id| self.func(id).config());
        let status = match target {
            Some(cfg) => {
                let trained = cfg
                    .find_capability(PCI_CAP_ID_EXP)
                    .map(|exp| cfg.word(usize::from(exp) + PCI_EXP_LNKSTA))
                    .unwrap_or_else(|| {
                        link_status(crate::capabilities::PcieLink {
                            speed: max_speed as u8,
                            width: max_width as u8,
                        })
                    });
                let speed = (trained & PCI_EXP_LNKSTA_CLS).min(max_speed);
                let width = ((trained & PCI_EXP_LNKSTA_NLW) >> 4).min(max_width);
                Some(speed | (width << 4) | PCI_EXP_LNKSTA_DLLLA)
            }
            None => None,
        };

        let cfg = self.func_mut(port).model.config_mut();
        let keep = cfg.word(cap + PCI_EXP_LNKSTA)
            & !(PCI_EXP_LNKSTA_CLS | PCI_EXP_LNKSTA_NLW | PCI_EXP_LNKSTA_DLLLA);
        cfg.set_word(cap + PCI_EXP_LNKSTA, keep | status.unwrap_or(0));
    }
}
