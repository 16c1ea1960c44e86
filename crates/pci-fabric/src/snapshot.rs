//! Migration state of functions and buses.
//!
//! A function record is `version: u32 BE`, the raw config space, then one `u32 BE` per INTx pin
//! (0 or 1). The INTERRUPT status bit is cleared in the saved image; it is re-derived from the
//! pin states on load.
//!
//! A bus record is `count: u32 BE` followed by, per function at or below the bus, its device path
//! (`u16 BE` length + UTF-8) and its function record (`u32 BE` length + bytes). Functions are
//! matched by path, so a restore is independent of bus numbering.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::{debug, warn};

use crate::fabric::PciFabric;
use crate::regs::{PciStatus, PCIE_CONFIG_SPACE_SIZE, PCI_NUM_PINS, PCI_STATUS};
use crate::{BusId, DeviceId};

pub const PCI_DEVICE_SNAPSHOT_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("config byte 0x{offset:x} differs from the device in a read-only checked bit")]
    CmaskMismatch { offset: usize },

    #[error("INTx state of pin {pin} is {value}; must be 0 or 1")]
    InvalidIrqState { pin: usize, value: u32 },

    #[error("unsupported PCI device snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("device record is {found} bytes, expected {expected}")]
    SizeMismatch { expected: usize, found: usize },

    #[error("corrupt snapshot: {0}")]
    Corrupt(&'static str),
}

/// A parsed and validated function record.
struct DeviceImage {
    config: Vec<u8>,
    irq_state: u8,
}

/// Length of a current-version function record over `config_size` bytes of config space.
fn device_record_len(config_size: usize) -> usize {
    4 + config_size + 4 * PCI_NUM_PINS
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u16(r: &mut impl Read) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

impl PciFabric {
    /// Writes the migration record of a function.
    pub fn save_device(&self, id: DeviceId, w: &mut impl Write) -> Result<(), SnapshotError> {
        let function = self.func(id);
        let mut config = function.config().bytes().to_vec();
        let status = u16::from_le_bytes([config[PCI_STATUS], config[PCI_STATUS + 1]])
            & !PciStatus::INTERRUPT.bits();
        config[PCI_STATUS..PCI_STATUS + 2].copy_from_slice(&status.to_le_bytes());

        w.write_all(&PCI_DEVICE_SNAPSHOT_VERSION.to_be_bytes())?;
        w.write_all(&config)?;
        for pin in 0..PCI_NUM_PINS {
            w.write_all(&u32::from(function.pin_level(pin)).to_be_bytes())?;
        }
        Ok(())
    }

    /// Loads a function record written by [`Self::save_device`] at stream `version`.
    ///
    /// Nothing is changed unless the whole record is valid.
    pub fn load_device(
        &mut self,
        id: DeviceId,
        r: &mut impl Read,
        version: u32,
    ) -> Result<(), SnapshotError> {
        let image = self.parse_device_image(id, r, version)?;
        self.apply_device_image(id, image);
        Ok(())
    }

    fn parse_device_image(
        &self,
        id: DeviceId,
        r: &mut impl Read,
        version: u32,
    ) -> Result<DeviceImage, SnapshotError> {
        if version == 0 || version > PCI_DEVICE_SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        let record_version = read_u32(r)?;
        if record_version == 0 || record_version > version {
            return Err(SnapshotError::UnsupportedVersion(record_version));
        }

        let cfg = self.func(id).config();
        let mut config = vec![0u8; cfg.size()];
        r.read_exact(&mut config)?;

        let mut irq_state = 0u8;
        if record_version >= 2 {
            for pin in 0..PCI_NUM_PINS {
                match read_u32(r)? {
                    0 => {}
                    1 => irq_state |= 1 << pin,
                    value => return Err(SnapshotError::InvalidIrqState { pin, value }),
                }
            }
        }

        if let Some(offset) = cfg.first_checked_mismatch(&config) {
            warn!(
                name = %self.func(id).name(),
                offset,
                live = cfg.byte(offset),
                saved = config[offset],
                "config snapshot rejected"
            );
            return Err(SnapshotError::CmaskMismatch { offset });
        }

        Ok(DeviceImage { config, irq_state })
    }

    fn apply_device_image(&mut self, id: DeviceId, image: DeviceImage) {
        let function = self.func_mut(id);
        let was_disabled = function.irq_disabled();
        let old_state = function.irq_state;

        function.model.config_mut().restore_bytes(&image.config);
        function.irq_state = image.irq_state;
        function.update_irq_status();
        let disabled = function.irq_disabled();
        let is_bridge = function.is_bridge();

        // Move the line counts from what the old state contributed to what the new one does.
        let contributed = |state: u8, disabled: bool| if disabled { 0 } else { state };
        let before = contributed(old_state, was_disabled);
        let after = contributed(image.irq_state, disabled);
        for pin in 0..PCI_NUM_PINS {
            let delta = i32::from((after >> pin) & 1) - i32::from((before >> pin) & 1);
            if delta != 0 {
                self.change_irq_level(id, pin, delta);
            }
        }

        self.spaces.begin();
        self.update_mappings(id);
        if is_bridge {
            self.update_bridge_windows(id);
        }
        self.spaces.commit();
        self.update_bus_master(id);
    }

    /// Writes the records of every function at or below `bus`.
    pub fn save_bus(&self, bus: BusId, w: &mut impl Write) -> Result<(), SnapshotError> {
        let devices = self.devices_below(bus);
        let count = u32::try_from(devices.len())
            .map_err(|_| SnapshotError::Corrupt("too many devices"))?;
        w.write_all(&count.to_be_bytes())?;
        for id in devices {
            let path = self.device_path(id);
            let mut record = Vec::new();
            self.save_device(id, &mut record)?;

            w.write_all(&(path.len() as u16).to_be_bytes())?;
            w.write_all(path.as_bytes())?;
            w.write_all(&(record.len() as u32).to_be_bytes())?;
            w.write_all(&record)?;
        }
        Ok(())
    }

    /// Restores a bus record written by [`Self::save_bus`].
    ///
    /// Every record is validated before any function is touched. Records for functions that are
    /// not present are skipped; functions missing from the record keep their state.
    pub fn restore_bus(
        &mut self,
        bus: BusId,
        r: &mut impl Read,
        version: u32,
    ) -> Result<(), SnapshotError> {
        let live: HashMap<String, DeviceId> = self
            .devices_below(bus)
            .into_iter()
            .map(|id| (self.device_path(id), id))
            .collect();

        let count = read_u32(r)?;
        let mut images = Vec::new();
        for _ in 0..count {
            let path_len = usize::from(read_u16(r)?);
            let mut path = vec![0u8; path_len];
            r.read_exact(&mut path)?;
            let path =
                String::from_utf8(path).map_err(|_| SnapshotError::Corrupt("device path"))?;

            let record_len = read_u32(r)? as usize;
            let config_size = live
                .get(&path)
                .map_or(PCIE_CONFIG_SPACE_SIZE, |&id| self.func(id).config().size());
            let max_len = device_record_len(config_size);
            if record_len > max_len {
                warn!(%path, record_len, max_len, "oversized device record");
                return Err(SnapshotError::SizeMismatch {
                    expected: max_len,
                    found: record_len,
                });
            }
            let mut record = vec![0u8; record_len];
            r.read_exact(&mut record)?;

            let Some(&id) = live.get(&path) else {
                warn!(%path, "snapshot has a device that is not present; skipping");
                continue;
            };
            let mut cursor = record.as_slice();
            let image = self.parse_device_image(id, &mut cursor, version)?;
            if !cursor.is_empty() {
                return Err(SnapshotError::SizeMismatch {
                    expected: record_len - cursor.len(),
                    found: record_len,
                });
            }
            images.push((id, image));
        }

        debug!(devices = images.len(), "restoring PCI bus state");
        for (id, image) in images {
            self.apply_device_image(id, image);
        }
        Ok(())
    }
}
