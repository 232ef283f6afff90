//! Decoders for reply payloads.

mod basic_info;
mod cell_voltages;
mod hardware_version;

pub use basic_info::BasicInfoMessage;
pub use cell_voltages::CellVoltagesMessage;
pub use hardware_version::HardwareVersionMessage;

use crate::error::DecodeError;

/// Read the big endian u16 at `offset`, if the payload is long enough.
fn u16_at(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn require_len(register: u8, data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::PayloadTooShort { register, needed, actual: data.len() });
    }
    Ok(())
}
