use crate::config::{PciConfigMask, PciConfigSpace};
use crate::error::Result;
use crate::regs::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciCapabilityInfo {
    pub id: u8,
    pub offset: u8,
}

/// One node of a function's capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PciCapabilityRecord {
    pub(crate) id: u8,
    pub(crate) offset: u8,
    pub(crate) size: u8,
}

/// Adds a vendor-specific capability carrying `payload` after the length byte.
pub fn add_vendor_capability(cfg: &mut PciConfigSpace, payload: &[u8]) -> Result<u8> {
    let len =
        u8::try_from(3 + payload.len()).expect("vendor capability too large for config space");
    let offset = cfg.add_capability(PCI_CAP_ID_VNDR, None, len)?;
    let base = usize::from(offset);
    cfg.set_byte(base + 2, len);
    for (i, byte) in payload.iter().enumerate() {
        cfg.set_byte(base + 3 + i, *byte);
    }
    Ok(offset)
}

/// Link parameters advertised by a PCI Express capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcieLink {
    /// Current link speed encoding (1 = 2.5 GT/s).
    pub speed: u8,
    /// Negotiated link width in lanes.
    pub width: u8,
}

impl Default for PcieLink {
    fn default() -> Self {
        Self { speed: 1, width: 1 }
    }
}

/// Adds a version 2 PCI Express capability for a function of `port_type`.
///
/// Endpoints report their link as trained; ports leave the status empty and pick it up from
/// the function behind them.
pub fn add_express_capability(
    cfg: &mut PciConfigSpace,
    offset: Option<u8>,
    port_type: u8,
    link: PcieLink,
) -> Result<u8> {
    let cap = cfg.add_capability(PCI_CAP_ID_EXP, offset, PCI_EXP_VER2_SIZEOF)?;
    let base = usize::from(cap);

    cfg.set_word(base + PCI_EXP_FLAGS, (u16::from(port_type) << 4) | 0x2);
    let lnkcap = u32::from(link.speed & 0xf) | (u32::from(link.width & 0x3f) << 4);
    cfg.set_long(base + PCI_EXP_LNKCAP, lnkcap);

    if !matches!(port_type, PCI_EXP_TYPE_ROOT_PORT | PCI_EXP_TYPE_DOWNSTREAM) {
        cfg.set_word(base + PCI_EXP_LNKSTA, link_status(link));
    }

    // Link status is maintained by the fabric, never by the guest.
    cfg.set_mask(PciConfigMask::Check, base + PCI_EXP_LNKSTA, 2, 0);
    Ok(cap)
}

pub(crate) fn link_status(link: PcieLink) -> u16 {
    (u16::from(link.speed) & PCI_EXP_LNKSTA_CLS)
        | ((u16::from(link.width) << 4) & PCI_EXP_LNKSTA_NLW)
}
