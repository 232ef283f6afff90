//! Static register and parameter catalogs.

/// A register the peripheral exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    pub address: u8,
    /// Payload length in bytes. 0 means the length varies with the pack configuration.
    pub length: usize,
    pub readable: bool,
    pub writable: bool,
    pub display_name: &'static str,
    pub unit: &'static str,
}

pub const REG_ENTER_FACTORY: u8 = 0x00;
pub const REG_EXIT_FACTORY: u8 = 0x01;
pub const REG_BASIC_INFO: u8 = 0x03;
pub const REG_CELL_VOLTAGES: u8 = 0x04;
pub const REG_HARDWARE_VERSION: u8 = 0x05;

const fn ro(address: u8, length: usize, display_name: &'static str, unit: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, length, readable: true, writable: false, display_name, unit }
}

const fn rw(address: u8, length: usize, display_name: &'static str, unit: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, length, readable: true, writable: true, display_name, unit }
}

const fn wo(address: u8, length: usize, display_name: &'static str, unit: &'static str) -> RegisterDescriptor {
    RegisterDescriptor { address, length, readable: false, writable: true, display_name, unit }
}

/// Sorted by address.
pub static REGISTERS: &[RegisterDescriptor] = &[
    wo(REG_ENTER_FACTORY, 2, "Enter factory mode", ""),
    wo(REG_EXIT_FACTORY, 2, "Exit factory mode", ""),
    ro(REG_BASIC_INFO, 0, "Basic information", ""),
    ro(REG_CELL_VOLTAGES, 0, "Cell voltages", "mV"),
    ro(REG_HARDWARE_VERSION, 0, "Hardware version", ""),
    rw(0x10, 2, "Design capacity", "10mAh"),
    rw(0x11, 2, "Cycle capacity", "10mAh"),
    rw(0x12, 2, "Cell full voltage", "mV"),
    rw(0x13, 2, "Cell empty voltage", "mV"),
    rw(0x14, 2, "Self discharge rate", "0.1%"),
    rw(0x15, 2, "Manufacture date", ""),
    rw(0x16, 2, "Serial number", ""),
    rw(0x17, 2, "Cycle count", ""),
    rw(0x18, 2, "Charge over-temperature", "0.1K"),
    rw(0x19, 2, "Charge over-temperature release", "0.1K"),
    rw(0x1A, 2, "Charge under-temperature", "0.1K"),
    rw(0x1B, 2, "Charge under-temperature release", "0.1K"),
    rw(0x1C, 2, "Discharge over-temperature", "0.1K"),
    rw(0x1D, 2, "Discharge over-temperature release", "0.1K"),
    rw(0x1E, 2, "Discharge under-temperature", "0.1K"),
    rw(0x1F, 2, "Discharge under-temperature release", "0.1K"),
    rw(0x20, 2, "Cell over-voltage", "mV"),
    rw(0x21, 2, "Cell over-voltage release", "mV"),
    rw(0x22, 2, "Cell under-voltage", "mV"),
    rw(0x23, 2, "Cell under-voltage release", "mV"),
    rw(0x24, 2, "Pack over-voltage", "10mV"),
    rw(0x25, 2, "Pack over-voltage release", "10mV"),
    rw(0x26, 2, "Pack under-voltage", "10mV"),
    rw(0x27, 2, "Pack under-voltage release", "10mV"),
    rw(0x28, 2, "Charge over-current", "10mA"),
    rw(0x29, 2, "Discharge over-current", "10mA"),
    rw(0x2A, 2, "Balance start voltage", "mV"),
    rw(0x2B, 2, "Balance window", "mV"),
    rw(0x2D, 2, "Function configuration", ""),
    rw(0x2E, 2, "NTC configuration", ""),
    rw(0x2F, 2, "Cell count", ""),
    rw(0xA0, 0, "Manufacturer name", ""),
    rw(0xA1, 0, "Device name", ""),
    rw(0xA2, 0, "Barcode", ""),
    ro(0xAA, 0, "Error counters", ""),
    wo(0xE1, 2, "MOSFET control", ""),
    ro(0xFA, 0, "Parameter", ""),
];

/// Find the descriptor for `address`.
pub fn lookup(address: u8) -> Option<&'static RegisterDescriptor> {
    REGISTERS
        .binary_search_by_key(&address, |r| r.address)
        .ok()
        .map(|i| &REGISTERS[i])
}

/// A value read indirectly through the 0xFA parameter register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    SerialNumber,
    ProductionDate,
    ManufacturerName,
    ModelName,
    UniqueId,
    BarCode,
    DesignCapacity,
    CycleCount,
}

impl Parameter {
    pub const ALL: [Parameter; 8] = [
        Parameter::SerialNumber,
        Parameter::ProductionDate,
        Parameter::ManufacturerName,
        Parameter::ModelName,
        Parameter::UniqueId,
        Parameter::BarCode,
        Parameter::DesignCapacity,
        Parameter::CycleCount,
    ];

    /// `(parameter number, expected reply length in 16 bit words)`
    pub const fn address(self) -> (u8, u8) {
        match self {
            Parameter::SerialNumber => (0x16, 1),
            Parameter::ProductionDate => (0x15, 1),
            Parameter::ManufacturerName => (0x38, 10),
            Parameter::ModelName => (0x42, 12),
            Parameter::UniqueId => (0x4E, 8),
            Parameter::BarCode => (0x56, 10),
            Parameter::DesignCapacity => (0x10, 1),
            Parameter::CycleCount => (0x17, 1),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Parameter::SerialNumber => "Serial number",
            Parameter::ProductionDate => "Production date",
            Parameter::ManufacturerName => "Manufacturer",
            Parameter::ModelName => "Model",
            Parameter::UniqueId => "Unique id",
            Parameter::BarCode => "Barcode",
            Parameter::DesignCapacity => "Design capacity",
            Parameter::CycleCount => "Cycle count",
        }
    }

    /// Whether the value is text rather than a number.
    pub fn is_text(self) -> bool {
        matches!(
            self,
            Parameter::ManufacturerName | Parameter::ModelName | Parameter::BarCode
        )
    }
}

#[test]
fn test_catalog_is_sorted_and_unique() {
    assert!(REGISTERS.windows(2).all(|w| w[0].address < w[1].address));
}

#[test]
fn test_lookup() {
    let basic = lookup(REG_BASIC_INFO).unwrap();
    assert!(basic.readable);
    assert!(!basic.writable);
    assert_eq!(lookup(0x24).unwrap().unit, "10mV");
    assert!(lookup(0x99).is_none());
}
