//! Human-readable names for PCI class codes, used when logging devices.

struct ClassDescription {
    class: u8,
    subclass: u8,
    desc: &'static str,
    /// Matches every subclass of `class`.
    whole_class: bool,
}

const fn entry(class: u8, subclass: u8, desc: &'static str) -> ClassDescription {
    ClassDescription {
        class,
        subclass,
        desc,
        whole_class: false,
    }
}

const fn any_subclass(class: u8, desc: &'static str) -> ClassDescription {
    ClassDescription {
        class,
        subclass: 0,
        desc,
        whole_class: true,
    }
}

const CLASS_DESCRIPTIONS: &[ClassDescription] = &[
    entry(0x00, 0x01, "VGA controller"),
    entry(0x01, 0x00, "SCSI controller"),
    entry(0x01, 0x01, "IDE controller"),
    entry(0x01, 0x02, "Floppy controller"),
    entry(0x01, 0x03, "IPI controller"),
    entry(0x01, 0x04, "RAID controller"),
    entry(0x01, 0x06, "SATA controller"),
    entry(0x01, 0x07, "SAS controller"),
    entry(0x01, 0x08, "NVMe controller"),
    entry(0x01, 0x80, "Storage controller"),
    entry(0x02, 0x00, "Ethernet controller"),
    entry(0x02, 0x01, "Token Ring controller"),
    entry(0x02, 0x02, "FDDI controller"),
    entry(0x02, 0x03, "ATM controller"),
    entry(0x02, 0x80, "Network controller"),
    entry(0x03, 0x00, "VGA controller"),
    entry(0x03, 0x01, "XGA controller"),
    entry(0x03, 0x02, "3D controller"),
    entry(0x03, 0x80, "Display controller"),
    entry(0x04, 0x00, "Video controller"),
    entry(0x04, 0x01, "Audio controller"),
    entry(0x04, 0x02, "Phone"),
    entry(0x04, 0x03, "Audio controller"),
    entry(0x04, 0x80, "Multimedia controller"),
    entry(0x05, 0x00, "RAM controller"),
    entry(0x05, 0x01, "Flash controller"),
    entry(0x05, 0x80, "Memory controller"),
    entry(0x06, 0x00, "Host bridge"),
    entry(0x06, 0x01, "ISA bridge"),
    entry(0x06, 0x02, "EISA bridge"),
    entry(0x06, 0x03, "MC bridge"),
    entry(0x06, 0x04, "PCI bridge"),
    entry(0x06, 0x05, "PCMCIA bridge"),
    entry(0x06, 0x06, "NUBUS bridge"),
    entry(0x06, 0x07, "CARDBUS bridge"),
    entry(0x06, 0x08, "RACEWAY bridge"),
    entry(0x06, 0x80, "Bridge"),
    entry(0x07, 0x00, "Serial port"),
    entry(0x07, 0x01, "Parallel port"),
    entry(0x08, 0x00, "Interrupt controller"),
    entry(0x08, 0x01, "DMA controller"),
    entry(0x08, 0x02, "Timer"),
    entry(0x08, 0x03, "RTC"),
    entry(0x09, 0x00, "Keyboard"),
    entry(0x09, 0x01, "Pen"),
    entry(0x09, 0x02, "Mouse"),
    any_subclass(0x0a, "Dock station"),
    any_subclass(0x0b, "Processor"),
    entry(0x0c, 0x00, "Firewire controller"),
    entry(0x0c, 0x01, "Access bus controller"),
    entry(0x0c, 0x02, "SSA controller"),
    entry(0x0c, 0x03, "USB controller"),
    entry(0x0c, 0x04, "Fibre channel controller"),
    entry(0x0c, 0x05, "SMBus"),
];

/// Description of a `class:subclass` pair, or `"Unclassified device"`.
pub fn class_description(class: u8, subclass: u8) -> &'static str {
    CLASS_DESCRIPTIONS
        .iter()
        .find(|d| d.class == class && (d.whole_class || d.subclass == subclass))
        .map_or("Unclassified device", |d| d.desc)
}
