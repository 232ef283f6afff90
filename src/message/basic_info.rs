use super::{require_len, u16_at};
use crate::error::DecodeError;
use crate::registers::REG_BASIC_INFO;

/// Temperatures are reported in 0.1K
const KELVIN_OFFSET_DK: i32 = 2731;

/// The reply to a basic information (0x03) read: pack voltage, current, capacity, state of
/// charge, protection flags and temperatures.
///
/// Offset | Meaning
/// 0..2   | Pack voltage, 10mV
/// 2..4   | Current, 10mA, signed, positive when charging
/// 4..6   | Residual capacity, 10mAh
/// 6..8   | Nominal capacity, 10mAh
/// 8..10  | Cycle count
/// 10..12 | Production date, `(year - 2000) << 9 | month << 5 | day`
/// 12..16 | Balance status, one bit per cell
/// 16..18 | Protection status flags
/// 18     | Software version
/// 19     | Relative state of charge, %
/// 20     | MOSFET status, bit 0 charge, bit 1 discharge
/// 21     | Cell count
/// 22     | Temperature sensor count
/// 23..   | Temperatures, 0.1K each
///
/// Peripherals sometimes send a truncated reply. Only the pack voltage is required; fields
/// beyond the end of the payload read as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicInfoMessage(Vec<u8>);

impl BasicInfoMessage {
    pub fn new(data: Vec<u8>) -> Result<Self, DecodeError> {
        require_len(REG_BASIC_INFO, &data, 2)?;
        log::debug!("BATTERY basic info: {}", hex::encode(&data));
        Ok(Self(data))
    }

    /// The pack voltage in V/100
    pub fn pack_voltage_cv(&self) -> Option<u16> {
        u16_at(&self.0, 0)
    }

    pub fn pack_voltage_v(&self) -> Option<f32> {
        self.pack_voltage_cv().map(|cv| cv as f32 / 100.0)
    }

    /// The current in A/100, positive when charging
    pub fn current_ca(&self) -> Option<i16> {
        u16_at(&self.0, 2).map(|raw| raw as i16)
    }

    pub fn current_a(&self) -> Option<f32> {
        self.current_ca().map(|ca| ca as f32 / 100.0)
    }

    /// The residual capacity in Ah/100
    pub fn residual_capacity_cah(&self) -> Option<u16> {
        u16_at(&self.0, 4)
    }

    /// The nominal capacity in Ah/100
    pub fn nominal_capacity_cah(&self) -> Option<u16> {
        u16_at(&self.0, 6)
    }

    pub fn cycles_count(&self) -> Option<u16> {
        u16_at(&self.0, 8)
    }

    /// `(year, month, day)`
    pub fn production_date(&self) -> Option<(u16, u8, u8)> {
        let raw = u16_at(&self.0, 10)?;
        Some((2000 + (raw >> 9), ((raw >> 5) & 0x0F) as u8, (raw & 0x1F) as u8))
    }

    /// One bit per cell, set while the cell is being balanced
    pub fn balance_status(&self) -> Option<u32> {
        let low = u16_at(&self.0, 12)? as u32;
        let high = u16_at(&self.0, 14)? as u32;
        Some(low | high << 16)
    }

    pub fn protection_status(&self) -> Option<u16> {
        u16_at(&self.0, 16)
    }

    pub fn software_version(&self) -> Option<u8> {
        self.0.get(18).copied()
    }

    /// The relative state of charge in %
    pub fn state_of_charge_pct(&self) -> Option<u8> {
        self.0.get(19).copied()
    }

    pub fn charge_fet_on(&self) -> Option<bool> {
        self.0.get(20).map(|fet| fet & 0x01 != 0)
    }

    pub fn discharge_fet_on(&self) -> Option<bool> {
        self.0.get(20).map(|fet| fet & 0x02 != 0)
    }

    pub fn cell_count(&self) -> Option<u8> {
        self.0.get(21).copied()
    }

    /// Temperatures in °C, as many as the sensor count promises and the payload holds
    pub fn temperatures_c(&self) -> Vec<f32> {
        let count = self.0.get(22).copied().unwrap_or(0) as usize;
        (0..count)
            .map_while(|i| u16_at(&self.0, 23 + 2 * i))
            .map(|dk| (dk as i32 - KELVIN_OFFSET_DK) as f32 / 10.0)
            .collect()
    }
}
