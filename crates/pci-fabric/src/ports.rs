use tracing::trace;

use crate::fabric::PciFabric;
use crate::{DeviceId, PciBdf};

pub const PCI_CFG_ADDR_PORT: u16 = 0xCF8;
pub const PCI_CFG_DATA_PORT: u16 = 0xCFC;

const CONFIG_ENABLE: u32 = 0x8000_0000;

/// PCI configuration mechanism #1: an address latch at `0xCF8` and a data window at
/// `0xCFC..=0xCFF`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PciConfigMechanism1 {
    addr: u32,
}

impl PciConfigMechanism1 {
    pub fn new() -> Self {
        Self { addr: 0 }
    }

    /// Current value of the address latch.
    pub fn address(&self) -> u32 {
        self.addr
    }

    pub fn io_read(&mut self, fabric: &mut PciFabric, port: u16, size: u8) -> u32 {
        match port {
            // Only 32-bit reads are meaningful, but return the stored value.
            PCI_CFG_ADDR_PORT => read_u32_part(self.addr, size),
            0xCFC..=0xCFF => match self.target(port) {
                Some((bdf, offset)) => fabric.host_config_read(bdf, offset, size),
                None => 0xFFFF_FFFF,
            },
            _ => 0xFFFF_FFFF,
        }
    }

    pub fn io_write(&mut self, fabric: &mut PciFabric, port: u16, size: u8, value: u32) {
        match port {
            PCI_CFG_ADDR_PORT => self.addr = write_u32_part(self.addr, size, value),
            0xCFC..=0xCFF => {
                if let Some((bdf, offset)) = self.target(port) {
                    fabric.host_config_write(bdf, offset, size, value);
                }
            }
            _ => {}
        }
    }

    fn target(&self, port: u16) -> Option<(PciBdf, u16)> {
        if self.addr & CONFIG_ENABLE == 0 {
            return None;
        }
        let bus = ((self.addr >> 16) & 0xFF) as u8;
        let device = ((self.addr >> 11) & 0x1F) as u8;
        let function = ((self.addr >> 8) & 0x07) as u8;
        let reg = (self.addr & 0xFC) as u16;
        Some((
            PciBdf::new(bus, device, function),
            reg + (port - PCI_CFG_DATA_PORT),
        ))
    }
}

impl PciFabric {
    /// Function a host bridge access to `bdf` reaches, if it answers at all.
    ///
    /// Unpowered functions and hot-plugged functions whose function 0 is absent do not respond.
    fn host_target(&self, bdf: PciBdf) -> Option<DeviceId> {
        let id = self.find_device(bdf.bus, bdf.devfn())?;
        let function = self.func(id);
        if !function.has_power() {
            return None;
        }
        let orphaned = function.is_hotplugged()
            && self
                .function_zero(function.bus(), function.devfn())
                .is_none();
        if orphaned {
            return None;
        }
        Some(id)
    }

    /// Config read on behalf of a host bridge. Missing functions read as all ones; accesses
    /// running past the end of config space are truncated.
    pub fn host_config_read(&mut self, bdf: PciBdf, offset: u16, size: u8) -> u32 {
        let Some(id) = self.host_target(bdf) else {
            return 0xFFFF_FFFF;
        };
        let limit = self.func(id).config().size();
        let Some(len) = access_len(limit, offset, size) else {
            return 0xFFFF_FFFF;
        };
        let value = self.config_read(id, offset, len);
        trace!(%bdf, offset, len, value, "host config read");
        value
    }

    /// Config write on behalf of a host bridge; writes to missing functions are dropped.
    pub fn host_config_write(&mut self, bdf: PciBdf, offset: u16, size: u8, value: u32) {
        let Some(id) = self.host_target(bdf) else {
            return;
        };
        let limit = self.func(id).config().size();
        let Some(len) = access_len(limit, offset, size) else {
            return;
        };
        trace!(%bdf, offset, len, value, "host config write");
        self.config_write(id, offset, len, value);
    }
}

fn access_len(limit: usize, offset: u16, size: u8) -> Option<usize> {
    let offset = usize::from(offset);
    if offset >= limit {
        return None;
    }
    Some(usize::from(size).min(limit - offset))
}

fn read_u32_part(value: u32, size: u8) -> u32 {
    match size {
        1 => value & 0xFF,
        2 => value & 0xFFFF,
        4 => value,
        _ => panic!("invalid read size {size}"),
    }
}

fn write_u32_part(old: u32, size: u8, value: u32) -> u32 {
    match size {
        1 => (old & !0xFF) | (value & 0xFF),
        2 => (old & !0xFFFF) | (value & 0xFFFF),
        4 => value,
        _ => panic!("invalid write size {size}"),
    }
}
