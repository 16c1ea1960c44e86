use crate::capabilities::{PciCapabilityInfo, PciCapabilityRecord};
use crate::error::{PciError, Result};
use crate::regs::*;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciVendorDeviceId {
    pub vendor_id: u16,
    pub device_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciSubsystemIds {
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PciClassCode {
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision_id: u8,
}

/// Which of the parallel mask arrays an accessor targets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PciConfigMask {
    /// Bits compared against incoming snapshot images.
    Check,
    /// Bits the guest may write.
    Write,
    /// Bits the guest clears by writing 1.
    WriteOneToClear,
}

/// PCI configuration space of one function.
///
/// Besides the guest-visible bytes this keeps the per-byte masks that drive write semantics
/// (`wmask`, `w1cmask`), snapshot validation (`cmask`) and capability placement (`used`).
/// The capability chain is held as a list of records, head first; the in-band pointer bytes
/// are rewritten from that list whenever it changes.
///
/// The standard class-default masks are installed by the constructors, so a device model can add
/// capabilities or tweak masks before the function is registered on a bus.
#[derive(Debug, Clone)]
pub struct PciConfigSpace {
    config: Vec<u8>,
    cmask: Vec<u8>,
    wmask: Vec<u8>,
    w1cmask: Vec<u8>,
    used: Vec<bool>,
    capabilities: Vec<PciCapabilityRecord>,
}

impl PciConfigSpace {
    /// Type 0 header with a 256-byte conventional config space.
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        Self::with_size(vendor_id, device_id, PCI_HEADER_TYPE_NORMAL, PCI_CONFIG_SPACE_SIZE)
    }

    /// Type 0 header with a 4 KiB PCI Express config space.
    pub fn new_express(vendor_id: u16, device_id: u16) -> Self {
        Self::with_size(vendor_id, device_id, PCI_HEADER_TYPE_NORMAL, PCIE_CONFIG_SPACE_SIZE)
    }

    /// Type 1 (PCI-to-PCI bridge) header.
    pub fn new_bridge(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self::with_size(
            vendor_id,
            device_id,
            PCI_HEADER_TYPE_BRIDGE,
            PCI_CONFIG_SPACE_SIZE,
        );
        // PCI-to-PCI bridge class.
        cfg.set_class_code(0x06, 0x04, 0x00, 0x00);
        cfg
    }

    /// Type 1 header with a PCI Express config space (root and downstream ports).
    pub fn new_express_bridge(vendor_id: u16, device_id: u16) -> Self {
        let mut cfg = Self::with_size(
            vendor_id,
            device_id,
            PCI_HEADER_TYPE_BRIDGE,
            PCIE_CONFIG_SPACE_SIZE,
        );
        cfg.set_class_code(0x06, 0x04, 0x00, 0x00);
        cfg
    }

    fn with_size(vendor_id: u16, device_id: u16, header_type: u8, size: usize) -> Self {
        let mut cfg = Self {
            config: vec![0; size],
            cmask: vec![0; size],
            wmask: vec![0; size],
            w1cmask: vec![0; size],
            used: vec![false; size],
            capabilities: Vec::new(),
        };
        cfg.set_word(PCI_VENDOR_ID, vendor_id);
        cfg.set_word(PCI_DEVICE_ID, device_id);
        cfg.config[PCI_HEADER_TYPE] = header_type;
        cfg.used[..PCI_CONFIG_HEADER_SIZE].fill(true);

        cfg.init_cmask();
        cfg.init_wmask();
        cfg.init_w1cmask();
        if header_type == PCI_HEADER_TYPE_BRIDGE {
            cfg.init_bridge_masks();
        }
        cfg
    }

    fn init_cmask(&mut self) {
        write_le(&mut self.cmask, PCI_VENDOR_ID, 2, 0xffff);
        write_le(&mut self.cmask, PCI_DEVICE_ID, 2, 0xffff);
        write_le(&mut self.cmask, PCI_STATUS, 2, u64::from(PciStatus::CAP_LIST.bits()));
        self.cmask[PCI_REVISION_ID] = 0xff;
        self.cmask[PCI_CLASS_PROG] = 0xff;
        write_le(&mut self.cmask, PCI_CLASS_DEVICE, 2, 0xffff);
        self.cmask[PCI_HEADER_TYPE] = 0xff;
        self.cmask[PCI_CAPABILITY_LIST] = 0xff;
    }

    fn init_wmask(&mut self) {
        self.wmask[PCI_CACHE_LINE_SIZE] = 0xff;
        self.wmask[PCI_INTERRUPT_LINE] = 0xff;
        let command = PciCommand::IO
            | PciCommand::MEMORY
            | PciCommand::MASTER
            | PciCommand::INTX_DISABLE
            | PciCommand::SERR;
        write_le(&mut self.wmask, PCI_COMMAND, 2, u64::from(command.bits()));
        self.wmask[PCI_CONFIG_HEADER_SIZE..].fill(0xff);
    }

    fn init_w1cmask(&mut self) {
        write_le(&mut self.w1cmask, PCI_STATUS, 2, u64::from(PciStatus::W1C.bits()));
    }

    fn init_bridge_masks(&mut self) {
        // Primary, secondary, subordinate bus numbers and secondary latency timer.
        self.wmask[PCI_PRIMARY_BUS..PCI_PRIMARY_BUS + 4].fill(0xff);

        self.wmask[PCI_IO_BASE] = PCI_IO_RANGE_MASK;
        self.wmask[PCI_IO_LIMIT] = PCI_IO_RANGE_MASK;
        write_le(&mut self.wmask, PCI_MEMORY_BASE, 2, u64::from(PCI_MEMORY_RANGE_MASK));
        write_le(&mut self.wmask, PCI_MEMORY_LIMIT, 2, u64::from(PCI_MEMORY_RANGE_MASK));
        write_le(&mut self.wmask, PCI_PREF_MEMORY_BASE, 2, u64::from(PCI_PREF_RANGE_MASK));
        write_le(&mut self.wmask, PCI_PREF_MEMORY_LIMIT, 2, u64::from(PCI_PREF_RANGE_MASK));
        self.wmask[PCI_PREF_BASE_UPPER32..PCI_PREF_BASE_UPPER32 + 8].fill(0xff);

        self.config[PCI_IO_BASE] |= PCI_IO_RANGE_TYPE_16;
        self.config[PCI_IO_LIMIT] |= PCI_IO_RANGE_TYPE_16;
        for offset in [PCI_PREF_MEMORY_BASE, PCI_PREF_MEMORY_LIMIT] {
            let value = self.word(offset) | PCI_PREF_RANGE_TYPE_64;
            self.set_word(offset, value);
        }

        let control = PciBridgeControl::PARITY
            | PciBridgeControl::SERR
            | PciBridgeControl::ISA
            | PciBridgeControl::VGA
            | PciBridgeControl::VGA_16BIT
            | PciBridgeControl::MASTER_ABORT
            | PciBridgeControl::BUS_RESET
            | PciBridgeControl::FAST_BACK
            | PciBridgeControl::DISCARD
            | PciBridgeControl::SEC_DISCARD
            | PciBridgeControl::DISCARD_SERR;
        write_le(&mut self.wmask, PCI_BRIDGE_CONTROL, 2, u64::from(control.bits()));
        write_le(
            &mut self.w1cmask,
            PCI_BRIDGE_CONTROL,
            2,
            u64::from(PciBridgeControl::DISCARD_STATUS.bits()),
        );

        self.cmask[PCI_IO_BASE] |= PCI_IO_RANGE_TYPE_MASK;
        self.cmask[PCI_IO_LIMIT] |= PCI_IO_RANGE_TYPE_MASK;
        for offset in [PCI_PREF_MEMORY_BASE, PCI_PREF_MEMORY_LIMIT] {
            let value = read_le(&self.cmask, offset, 2) | u64::from(PCI_PREF_RANGE_TYPE_MASK);
            write_le(&mut self.cmask, offset, 2, value);
        }
    }

    pub fn size(&self) -> usize {
        self.config.len()
    }

    pub fn is_express(&self) -> bool {
        self.config.len() == PCIE_CONFIG_SPACE_SIZE
    }

    pub fn bytes(&self) -> &[u8] {
        &self.config
    }

    pub fn vendor_device_id(&self) -> PciVendorDeviceId {
        PciVendorDeviceId {
            vendor_id: self.word(PCI_VENDOR_ID),
            device_id: self.word(PCI_DEVICE_ID),
        }
    }

    pub fn class_code(&self) -> PciClassCode {
        PciClassCode {
            revision_id: self.config[PCI_REVISION_ID],
            prog_if: self.config[PCI_CLASS_PROG],
            subclass: self.config[PCI_CLASS_DEVICE],
            class: self.config[PCI_CLASS_DEVICE + 1],
        }
    }

    pub fn set_class_code(&mut self, class: u8, subclass: u8, prog_if: u8, revision_id: u8) {
        self.config[PCI_REVISION_ID] = revision_id;
        self.config[PCI_CLASS_PROG] = prog_if;
        self.config[PCI_CLASS_DEVICE] = subclass;
        self.config[PCI_CLASS_DEVICE + 1] = class;
    }

    pub fn set_subsystem_ids(&mut self, ids: PciSubsystemIds) {
        self.set_word(PCI_SUBSYSTEM_VENDOR_ID, ids.subsystem_vendor_id);
        self.set_word(PCI_SUBSYSTEM_ID, ids.subsystem_id);
    }

    pub fn header_type(&self) -> u8 {
        self.config[PCI_HEADER_TYPE]
    }

    pub fn is_bridge(&self) -> bool {
        self.header_type() & !PCI_HEADER_TYPE_MULTI_FUNCTION == PCI_HEADER_TYPE_BRIDGE
    }

    pub fn is_multifunction(&self) -> bool {
        self.header_type() & PCI_HEADER_TYPE_MULTI_FUNCTION != 0
    }

    /// Sets or clears the multifunction bit of the header type register.
    pub fn set_multifunction(&mut self, multifunction: bool) {
        if multifunction {
            self.config[PCI_HEADER_TYPE] |= PCI_HEADER_TYPE_MULTI_FUNCTION;
        } else {
            self.config[PCI_HEADER_TYPE] &= !PCI_HEADER_TYPE_MULTI_FUNCTION;
        }
    }

    pub fn command(&self) -> PciCommand {
        PciCommand::from_bits_retain(self.word(PCI_COMMAND))
    }

    pub fn set_command(&mut self, command: PciCommand) {
        self.set_word(PCI_COMMAND, command.bits());
    }

    pub fn status(&self) -> PciStatus {
        PciStatus::from_bits_retain(self.word(PCI_STATUS))
    }

    pub(crate) fn set_status_bits(&mut self, bits: PciStatus, on: bool) {
        let mut status = self.status();
        status.set(bits, on);
        self.set_word(PCI_STATUS, status.bits());
    }

    pub fn interrupt_line(&self) -> u8 {
        self.config[PCI_INTERRUPT_LINE]
    }

    pub fn interrupt_pin(&self) -> u8 {
        self.config[PCI_INTERRUPT_PIN]
    }

    /// Interrupt Pin (0x3D) is read-only to the guest; device models set it directly.
    pub fn set_interrupt_pin(&mut self, pin: u8) {
        self.config[PCI_INTERRUPT_PIN] = pin;
    }

    pub fn byte(&self, offset: usize) -> u8 {
        self.config[offset]
    }

    pub fn word(&self, offset: usize) -> u16 {
        read_le(&self.config, offset, 2) as u16
    }

    pub fn long(&self, offset: usize) -> u32 {
        read_le(&self.config, offset, 4) as u32
    }

    pub fn quad(&self, offset: usize) -> u64 {
        read_le(&self.config, offset, 8)
    }

    /// Direct stores below bypass the guest masks; they are for device and fabric code.
    pub fn set_byte(&mut self, offset: usize, value: u8) {
        self.config[offset] = value;
    }

    pub fn set_word(&mut self, offset: usize, value: u16) {
        write_le(&mut self.config, offset, 2, u64::from(value));
    }

    pub fn set_long(&mut self, offset: usize, value: u32) {
        write_le(&mut self.config, offset, 4, u64::from(value));
    }

    pub fn set_quad(&mut self, offset: usize, value: u64) {
        write_le(&mut self.config, offset, 8, value);
    }

    pub fn mask(&self, which: PciConfigMask, offset: usize) -> u8 {
        match which {
            PciConfigMask::Check => self.cmask[offset],
            PciConfigMask::Write => self.wmask[offset],
            PciConfigMask::WriteOneToClear => self.w1cmask[offset],
        }
    }

    /// Installs `len` bytes of a mask starting at `offset`.
    ///
    /// Write-mask bits are removed from the check mask, and check-mask bits are only accepted
    /// where the byte is not writable, so `cmask & wmask` stays zero for every byte.
    pub fn set_mask(&mut self, which: PciConfigMask, offset: usize, len: usize, value: u64) {
        assert!(len <= 8 && offset + len <= self.size());
        match which {
            PciConfigMask::Write => {
                write_le(&mut self.wmask, offset, len, value);
                for i in offset..offset + len {
                    self.cmask[i] &= !self.wmask[i];
                }
            }
            PciConfigMask::Check => {
                write_le(&mut self.cmask, offset, len, value);
                for i in offset..offset + len {
                    self.cmask[i] &= !self.wmask[i];
                }
            }
            PciConfigMask::WriteOneToClear => write_le(&mut self.w1cmask, offset, len, value),
        }
    }

    /// Guest-visible config read of 1 to 4 bytes; a plain little-endian copy.
    pub fn read(&self, offset: u16, size: usize) -> u32 {
        assert!((1..=4).contains(&size), "invalid config read size {size}");
        let offset = usize::from(offset);
        assert!(
            offset + size <= self.size(),
            "config read {offset:#x}+{size} beyond config space"
        );
        read_le(&self.config, offset, size) as u32
    }

    /// Guest-visible config write of 1 to 4 bytes through `wmask` and `w1cmask`.
    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        assert!((1..=4).contains(&size), "invalid config write size {size}");
        let offset = usize::from(offset);
        assert!(
            offset + size <= self.size(),
            "config write {offset:#x}+{size} beyond config space"
        );

        for i in 0..size {
            let addr = offset + i;
            let val = (value >> (8 * i)) as u8;
            let wmask = self.wmask[addr];
            let w1cmask = self.w1cmask[addr];
            assert_eq!(wmask & w1cmask, 0, "byte {addr:#x} is both writable and W1C");
            let old = self.config[addr];
            self.config[addr] = ((old & !wmask) | (val & wmask)) & !(val & w1cmask);
        }
    }

    /// Resets the header registers a function reset clears: writable command and status bits,
    /// the interrupt line and the cache line size.
    pub(crate) fn reset_header(&mut self) {
        for offset in [PCI_COMMAND, PCI_STATUS] {
            let clear =
                (read_le(&self.wmask, offset, 2) | read_le(&self.w1cmask, offset, 2)) as u16;
            let value = self.word(offset) & !clear;
            self.set_word(offset, value);
        }
        let clear = self.wmask[PCI_INTERRUPT_LINE] | self.w1cmask[PCI_INTERRUPT_LINE];
        self.config[PCI_INTERRUPT_LINE] &= !clear;
        self.config[PCI_CACHE_LINE_SIZE] = 0;
    }

    pub fn capability_list(&self) -> Vec<PciCapabilityInfo> {
        self.capabilities
            .iter()
            .map(|cap| PciCapabilityInfo {
                id: cap.id,
                offset: cap.offset,
            })
            .collect()
    }

    pub fn find_capability(&self, id: u8) -> Option<u8> {
        self.capabilities
            .iter()
            .find(|cap| cap.id == id)
            .map(|cap| cap.offset)
    }

    /// Adds a capability of `size` bytes and returns its offset.
    ///
    /// With `offset == None` the first dword-aligned run of unused bytes above the standard
    /// header is taken; running out of space is a device model bug and panics. An explicit offset
    /// that overlaps an existing capability is refused without changing anything.
    pub fn add_capability(&mut self, id: u8, offset: Option<u8>, size: u8) -> Result<u8> {
        assert!(size >= 2, "capability must hold at least the id and next bytes");
        let offset = match offset {
            Some(offset) => {
                let start = usize::from(offset);
                assert!(
                    start >= PCI_CONFIG_HEADER_SIZE,
                    "capability at {start:#x} overlaps the standard header"
                );
                assert!(start + usize::from(size) <= PCI_CONFIG_SPACE_SIZE);
                if let Some(conflict) = (start..start + usize::from(size)).find(|&i| self.used[i]) {
                    return Err(PciError::CapabilityOverlap {
                        id,
                        offset: u16::from(offset),
                        size,
                        conflict: conflict as u16,
                    });
                }
                offset
            }
            None => self.find_space(size).unwrap_or_else(|| {
                panic!("no room for a {size}-byte capability 0x{id:02x} in config space")
            }),
        };

        let start = usize::from(offset);
        let len = usize::from(size);
        self.used[start..start + len].fill(true);
        self.wmask[start..start + len].fill(0);
        self.w1cmask[start..start + len].fill(0);
        self.cmask[start..start + len].fill(0xff);

        self.capabilities.insert(
            0,
            PciCapabilityRecord {
                id,
                offset,
                size,
            },
        );
        self.sync_capability_chain();
        Ok(offset)
    }

    /// Unlinks the first capability with `id` and returns its bytes to the free pool.
    pub fn del_capability(&mut self, id: u8, size: u8) -> Result<()> {
        let Some(index) = self.capabilities.iter().position(|cap| cap.id == id) else {
            return Err(PciError::CapabilityNotFound(id));
        };
        let cap = self.capabilities.remove(index);

        let start = usize::from(cap.offset);
        let len = usize::from(size);
        self.wmask[start..start + len].fill(0xff);
        self.w1cmask[start..start + len].fill(0);
        self.cmask[start..start + len].fill(0);
        self.used[start..start + len].fill(false);

        self.sync_capability_chain();
        Ok(())
    }

    /// First dword-aligned run of `size` unused bytes above the standard header.
    fn find_space(&self, size: u8) -> Option<u8> {
        let len = usize::from(size);
        (PCI_CONFIG_HEADER_SIZE..=PCI_CONFIG_SPACE_SIZE - len)
            .step_by(4)
            .find(|&start| !self.used[start..start + len].contains(&true))
            .map(|start| start as u8)
    }

    /// Rewrites the in-band capability chain from the record list.
    fn sync_capability_chain(&mut self) {
        let head = self.capabilities.first().map_or(0, |cap| cap.offset);
        self.config[PCI_CAPABILITY_LIST] = head;
        for (i, cap) in self.capabilities.iter().enumerate() {
            let next = self.capabilities.get(i + 1).map_or(0, |next| next.offset);
            let base = usize::from(cap.offset);
            self.config[base] = cap.id;
            self.config[base + 1] = next;
        }
        self.set_status_bits(PciStatus::CAP_LIST, !self.capabilities.is_empty());
    }

    /// Returns the first offset where `image` disagrees with the live bytes in a bit that is
    /// checked, not writable and not write-1-to-clear.
    pub fn first_checked_mismatch(&self, image: &[u8]) -> Option<usize> {
        (0..self.size().min(image.len())).find(|&i| {
            let checked = self.cmask[i] & !self.wmask[i] & !self.w1cmask[i];
            (image[i] ^ self.config[i]) & checked != 0
        })
    }

    /// Replaces the guest-visible bytes; callers validate with [`Self::first_checked_mismatch`].
    pub(crate) fn restore_bytes(&mut self, image: &[u8]) {
        assert_eq!(image.len(), self.size());
        self.config.copy_from_slice(image);
    }

    /// True when every byte satisfies `cmask & wmask == 0`.
    pub fn masks_disjoint(&self) -> bool {
        self.cmask
            .iter()
            .zip(&self.wmask)
            .all(|(cmask, wmask)| cmask & wmask == 0)
    }

    pub fn is_used(&self, offset: usize) -> bool {
        self.used[offset]
    }

    /// PCI Express device/port type from the express capability, if present.
    pub fn express_port_type(&self) -> Option<u8> {
        let cap = usize::from(self.find_capability(PCI_CAP_ID_EXP)?);
        Some(((self.word(cap + PCI_EXP_FLAGS) & PCI_EXP_FLAGS_TYPE) >> 4) as u8)
    }
}

fn read_le(bytes: &[u8], offset: usize, len: usize) -> u64 {
    bytes[offset..offset + len]
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn write_le(bytes: &mut [u8], offset: usize, len: usize, value: u64) {
    for (i, byte) in bytes[offset..offset + len].iter_mut().enumerate() {
        *byte = (value >> (8 * i)) as u8;
    }
}
