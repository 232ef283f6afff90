use super::u16_at;
use crate::error::DecodeError;
use crate::registers::REG_CELL_VOLTAGES;

/// The reply to a cell voltage (0x04) read: one big endian u16 per cell, in mV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellVoltagesMessage(Vec<u16>);

impl CellVoltagesMessage {
    pub fn new(data: Vec<u8>) -> Result<Self, DecodeError> {
        if data.len() % 2 != 0 {
            return Err(DecodeError::PayloadTooShort {
                register: REG_CELL_VOLTAGES,
                needed: data.len() + 1,
                actual: data.len(),
            });
        }
        let nums: Vec<u16> = (0..data.len() / 2)
            .filter_map(|i| u16_at(&data, 2 * i))
            .collect();
        log::debug!("BATTERY cell voltages: {nums:?}");
        Ok(Self(nums))
    }

    pub fn cell_voltage_mv(&self) -> &[u16] {
        &self.0
    }

    pub fn cell_voltage_v(&self) -> Vec<f32> {
        self.0.iter().map(|&mv| mv as f32 / 1000.0).collect()
    }
}

#[test]
fn test_decode_cells() {
    let message = CellVoltagesMessage::new(hex::decode("0ce40ce50cdf0ce6").unwrap()).unwrap();
    assert_eq!(message.cell_voltage_mv(), &[3300, 3301, 3295, 3302]);
    assert_eq!(message.cell_voltage_v()[0], 3.3);
}

#[test]
fn test_odd_length_is_rejected() {
    assert!(CellVoltagesMessage::new(vec![0x0c, 0xe4, 0x0c]).is_err());
}
