use std::ops::Range;

use thiserror::Error;

use crate::regs::PciBarType;

#[derive(Debug, Clone)]
pub struct PciResourceAllocatorConfig {
    /// Base address of the 32-bit MMIO window reserved for BAR and bridge window allocation.
    pub mmio_base: u64,
    pub mmio_size: u64,
    /// Base port of the I/O window reserved for BAR allocation.
    pub io_base: u32,
    pub io_size: u32,
}

impl Default for PciResourceAllocatorConfig {
    fn default() -> Self {
        // I/O stays clear of the legacy 0x0000..0x0FFF range; MMIO sits high in the 32-bit space.
        Self {
            mmio_base: 0xE000_0000,
            mmio_size: 0x1000_0000,
            io_base: 0x1000,
            io_size: 0xE000,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum PciResourceError {
    #[error("PCI MMIO window exhausted")]
    OutOfMmioSpace,
    #[error("PCI I/O window exhausted")]
    OutOfIoSpace,
    #[error("BAR size must be a non-zero power of two")]
    InvalidBarSize,
    #[error("ran out of PCI bus numbers")]
    OutOfBusNumbers,
}

/// Bump allocator for BARs and bridge windows, skipping reserved ranges.
#[derive(Debug, Clone)]
pub struct PciResourceAllocator {
    cfg: PciResourceAllocatorConfig,
    next_mmio: u64,
    next_io: u64,
    reserved_mmio: Vec<Range<u64>>,
    reserved_io: Vec<Range<u64>>,
}

impl PciResourceAllocator {
    pub fn new(cfg: PciResourceAllocatorConfig) -> Self {
        Self {
            next_mmio: cfg.mmio_base,
            next_io: u64::from(cfg.io_base),
            cfg,
            reserved_mmio: Vec::new(),
            reserved_io: Vec::new(),
        }
    }

    pub fn config(&self) -> &PciResourceAllocatorConfig {
        &self.cfg
    }

    pub fn reset(&mut self) {
        self.next_mmio = self.cfg.mmio_base;
        self.next_io = u64::from(self.cfg.io_base);
        self.reserved_mmio.clear();
        self.reserved_io.clear();
    }

    /// Keeps future allocations clear of a fixed assignment (legacy ports, platform devices).
    pub fn reserve_range(&mut self, ty: PciBarType, base: u64, size: u64) {
        let Some(end) = base.checked_add(size) else {
            return;
        };
        if base == 0 || size == 0 {
            return;
        }
        if ty.is_io() {
            self.reserved_io.push(base..end);
        } else {
            self.reserved_mmio.push(base..end);
        }
    }

    /// Next free I/O port and MMIO address.
    pub fn cursor(&self) -> (u64, u64) {
        (self.next_io, self.next_mmio)
    }

    /// Rounds the I/O cursor up to `align` (a bridge window boundary).
    pub fn align_io(&mut self, align: u64) -> Result<u64, PciResourceError> {
        let end = u64::from(self.cfg.io_base) + u64::from(self.cfg.io_size);
        self.next_io = align_up_u64(self.next_io, align).ok_or(PciResourceError::OutOfIoSpace)?;
        if self.next_io > end {
            return Err(PciResourceError::OutOfIoSpace);
        }
        Ok(self.next_io)
    }

    /// Rounds the MMIO cursor up to `align`.
    pub fn align_mmio(&mut self, align: u64) -> Result<u64, PciResourceError> {
        let end = self.cfg.mmio_base.saturating_add(self.cfg.mmio_size);
        self.next_mmio =
            align_up_u64(self.next_mmio, align).ok_or(PciResourceError::OutOfMmioSpace)?;
        if self.next_mmio > end {
            return Err(PciResourceError::OutOfMmioSpace);
        }
        Ok(self.next_mmio)
    }

    /// Allocates a naturally aligned range for a BAR of type `ty`.
    ///
    /// 64-bit BARs are placed in the 32-bit MMIO window as well.
    pub fn allocate_bar(&mut self, ty: PciBarType, size: u64) -> Result<u64, PciResourceError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(PciResourceError::InvalidBarSize);
        }

        if ty.is_io() {
            let window_end = u64::from(self.cfg.io_base) + u64::from(self.cfg.io_size);
            let base = first_fit(self.next_io, size, window_end, &self.reserved_io)
                .ok_or(PciResourceError::OutOfIoSpace)?;
            self.next_io = base + size;
            Ok(base)
        } else {
            let window_end = self.cfg.mmio_base.saturating_add(self.cfg.mmio_size);
            let base = first_fit(self.next_mmio, size, window_end, &self.reserved_mmio)
                .ok_or(PciResourceError::OutOfMmioSpace)?;
            self.next_mmio = base + size;
            Ok(base)
        }
    }
}

fn first_fit(start: u64, size: u64, window_end: u64, reserved: &[Range<u64>]) -> Option<u64> {
    let mut base = align_up_u64(start, size)?;
    loop {
        let end = base.checked_add(size)?;
        if end > window_end {
            return None;
        }
        match reserved.iter().find(|r| base < r.end && r.start < end) {
            Some(overlap) => base = align_up_u64(overlap.end, size)?,
            None => return Some(base),
        }
    }
}

fn align_up_u64(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    Some(value.checked_add(align - 1)? & !(align - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bars_are_naturally_aligned() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig::default());
        assert_eq!(alloc.allocate_bar(PciBarType::MEM_32, 0x100), Ok(0xE000_0000));
        assert_eq!(alloc.allocate_bar(PciBarType::MEM_32, 0x1000), Ok(0xE000_1000));
        assert_eq!(alloc.allocate_bar(PciBarType::IO, 0x20), Ok(0x1000));
        assert_eq!(alloc.allocate_bar(PciBarType::IO, 0x100), Ok(0x1100));
    }

    #[test]
    fn reserved_ranges_are_skipped() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig::default());
        alloc.reserve_range(PciBarType::IO, 0x1000, 0x10);
        assert_eq!(alloc.allocate_bar(PciBarType::IO, 0x10), Ok(0x1010));
    }

    #[test]
    fn invalid_sizes_and_exhaustion_are_reported() {
        let mut alloc = PciResourceAllocator::new(PciResourceAllocatorConfig {
            mmio_base: 0x1000_0000,
            mmio_size: 0x2000,
            io_base: 0x1000,
            io_size: 0x100,
        });
        assert_eq!(
            alloc.allocate_bar(PciBarType::MEM_32, 0x300),
            Err(PciResourceError::InvalidBarSize)
        );
        assert_eq!(alloc.allocate_bar(PciBarType::MEM_TYPE_64, 0x2000), Ok(0x1000_0000));
        assert_eq!(
            alloc.allocate_bar(PciBarType::MEM_32, 0x1000),
            Err(PciResourceError::OutOfMmioSpace)
        );
        assert_eq!(
            alloc.allocate_bar(PciBarType::IO, 0x200),
            Err(PciResourceError::OutOfIoSpace)
        );
    }
}
