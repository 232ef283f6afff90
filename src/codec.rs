//! Outbound command frames and the checksum shared by both directions.
//!
//! Every frame is delimited by a start marker and an end marker:
//!
//! Offset     | Meaning
//! 0          | Start marker 0xDD
//! 1          | Command (0xA5 read, 0x5A write) or, in a reply, the register
//! 2          | Register or, in a reply, the status byte
//! 3          | Length of the data that follows
//! 4..4+n     | Data
//! 4+n..6+n   | Checksum, big endian
//! 6+n        | End marker 0x77
//!
//! The checksum is `(0x10000 - sum) mod 0x10000` where `sum` is the sum of every byte between
//! the start marker and the checksum bytes.

use tokio::time::Instant;

use crate::error::{DecodeError, FrameError};
use crate::packet::Packet;
use crate::registers::{self, Parameter};

pub const START_MARKER: u8 = 0xDD;
pub const END_MARKER: u8 = 0x77;
pub const CMD_READ: u8 = 0xA5;
pub const CMD_WRITE: u8 = 0x5A;
/// The indirect parameter register
pub const REG_PARAMETER: u8 = 0xFA;

/// Start marker, command/register, register/status, length
pub const HEADER_LEN: usize = 4;
/// Checksum and end marker
pub const TRAILER_LEN: usize = 3;

/// A verbatim frame which puts the peripheral into factory (write) mode.
pub const ENTER_FACTORY_MODE: [u8; 9] = [0xDD, 0x5A, 0x00, 0x02, 0x56, 0x78, 0xFE, 0xD6, 0x77];
/// A verbatim frame which leaves factory mode without saving.
pub const EXIT_FACTORY_MODE: [u8; 9] = [0xDD, 0x5A, 0x01, 0x02, 0x00, 0x00, 0xFF, 0xA3, 0x77];

/// Compute the frame checksum over the given bytes.
pub fn checksum(bytes: &[u8]) -> u16 {
    let sum = bytes
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16));
    0u16.wrapping_sub(sum)
}

/// Build a basic register read: `[DD A5 reg 00 chkHi chkLo 77]`.
pub fn read_register(register: u8) -> Vec<u8> {
    seal(&[CMD_READ, register, 0x00])
}

/// Build an indirect parameter read through register 0xFA.
pub fn read_parameter(parameter: Parameter) -> Vec<u8> {
    let (number, expected_length) = parameter.address();
    seal(&[CMD_READ, REG_PARAMETER, 0x03, 0x00, number, expected_length])
}

/// Build a register write. The peripheral only honours it in factory mode.
pub fn write_register(register: u8, data: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let descriptor =
        registers::lookup(register).ok_or(DecodeError::UnknownRegister(register))?;
    if !descriptor.writable {
        return Err(DecodeError::NotWritable(register));
    }
    if descriptor.length != 0 && data.len() != descriptor.length {
        return Err(DecodeError::LengthMismatch {
            register,
            expected: descriptor.length,
            actual: data.len(),
        });
    }
    let length = u8::try_from(data.len()).map_err(|_| DecodeError::PayloadTooLong {
        register,
        max: u8::MAX as usize,
        actual: data.len(),
    })?;

    let mut body = Vec::with_capacity(data.len() + 3);
    body.push(CMD_WRITE);
    body.push(register);
    body.push(length);
    body.extend_from_slice(data);
    Ok(seal(&body))
}

/// Wrap a frame body in the start marker, checksum and end marker.
fn seal(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 1 + TRAILER_LEN);
    frame.push(START_MARKER);
    frame.extend_from_slice(body);
    frame.extend_from_slice(&checksum(body).to_be_bytes());
    frame.push(END_MARKER);
    frame
}

/// Check the markers and checksum of a complete frame.
pub fn verify_frame(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < HEADER_LEN + TRAILER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN + TRAILER_LEN,
            available: frame.len(),
        });
    }
    if frame[0] != START_MARKER {
        return Err(FrameError::BadStart(frame[0]));
    }
    let end = frame[frame.len() - 1];
    if end != END_MARKER {
        return Err(FrameError::BadEnd(end));
    }

    let body = &frame[1..frame.len() - TRAILER_LEN];
    let expected = checksum(body);
    let received = u16::from_be_bytes([frame[frame.len() - 3], frame[frame.len() - 2]]);
    if expected != received {
        return Err(FrameError::ChecksumMismatch { expected, received });
    }
    Ok(())
}

/// Turn a complete reply frame into a `Packet`.
///
/// A checksum mismatch still yields a packet, flagged with `checksum_valid = false`, so the
/// caller can report it. Structural problems are errors.
pub fn parse_frame(frame: &[u8]) -> Result<Packet, FrameError> {
    if frame.len() < HEADER_LEN + TRAILER_LEN {
        return Err(FrameError::Truncated {
            needed: HEADER_LEN + TRAILER_LEN,
            available: frame.len(),
        });
    }
    if frame[0] != START_MARKER {
        return Err(FrameError::BadStart(frame[0]));
    }

    let length = frame[3] as usize;
    let total = HEADER_LEN + length + TRAILER_LEN;
    if frame.len() < total {
        return Err(FrameError::Truncated {
            needed: total,
            available: frame.len(),
        });
    }
    if frame[total - 1] != END_MARKER {
        return Err(FrameError::BadEnd(frame[total - 1]));
    }

    let expected = checksum(&frame[1..HEADER_LEN + length]);
    let received = u16::from_be_bytes([frame[total - 3], frame[total - 2]]);

    Ok(Packet {
        register: frame[1],
        status: frame[2],
        payload: frame[HEADER_LEN..HEADER_LEN + length].to_vec(),
        checksum_valid: expected == received,
        received_at: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_register_frame() {
        let frame = read_register(0x03);
        // 0x10000 - (0xA5 + 0x03)
        assert_eq!(frame, vec![0xDD, 0xA5, 0x03, 0x00, 0xFF, 0x58, 0x77]);
        assert_eq!(verify_frame(&frame), Ok(()));
    }

    #[test]
    fn test_read_parameter_frame() {
        let frame = read_parameter(Parameter::SerialNumber);
        let (number, len) = Parameter::SerialNumber.address();
        assert_eq!(frame.len(), 10);
        assert_eq!(&frame[..7], &[0xDD, 0xA5, 0xFA, 0x03, 0x00, number, len]);
        assert_eq!(frame[9], 0x77);
        assert_eq!(verify_frame(&frame), Ok(()));
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0x01]), 0xFFFF);
        assert_eq!(checksum(&[0x03, 0x00, 0x02, 0x01, 0x2C]), 0xFFCE);
        // 258 bytes of 0xFF sum past 0x10000
        let big = vec![0xFF; 258];
        let sum: u32 = big.iter().map(|&b| b as u32).sum();
        assert_eq!(checksum(&big) as u32, (0x10000 - (sum % 0x10000)) % 0x10000);
    }

    #[test]
    fn test_every_built_frame_verifies_and_any_mutation_fails() {
        let mut frames = vec![
            read_register(0x03),
            read_register(0x04),
            read_register(0x05),
            ENTER_FACTORY_MODE.to_vec(),
            EXIT_FACTORY_MODE.to_vec(),
        ];
        frames.extend(Parameter::ALL.iter().map(|&p| read_parameter(p)));

        for frame in frames {
            assert_eq!(verify_frame(&frame), Ok(()), "{}", hex::encode(&frame));
            for i in 1..frame.len() - TRAILER_LEN {
                let mut mutated = frame.clone();
                mutated[i] = mutated[i].wrapping_add(1);
                assert!(
                    matches!(
                        verify_frame(&mutated),
                        Err(FrameError::ChecksumMismatch { .. })
                    ),
                    "mutating byte {i} of {} went unnoticed",
                    hex::encode(&frame)
                );
            }
        }
    }

    #[test]
    fn test_write_register() {
        let frame = write_register(0x10, &[0x27, 0x10]).unwrap();
        assert_eq!(&frame[..6], &[0xDD, 0x5A, 0x10, 0x02, 0x27, 0x10]);
        assert_eq!(verify_frame(&frame), Ok(()));

        assert_eq!(write_register(0x03, &[]), Err(DecodeError::NotWritable(0x03)));
        assert_eq!(write_register(0x99, &[]), Err(DecodeError::UnknownRegister(0x99)));
        assert_eq!(
            write_register(0x10, &[0x27, 0x10, 0x00]),
            Err(DecodeError::LengthMismatch { register: 0x10, expected: 2, actual: 3 })
        );
    }

    #[test]
    fn test_write_variable_length_register() {
        let name = write_register(0xA0, b"JBD").unwrap();
        assert_eq!(&name[..4], &[0xDD, 0x5A, 0xA0, 0x03]);
        assert_eq!(verify_frame(&name), Ok(()));

        let longest = write_register(0xA0, &[0x41; 255]).unwrap();
        assert_eq!(longest[3], 0xFF);
        assert_eq!(longest.len(), 255 + 7);

        for len in [256, 300] {
            assert_eq!(
                write_register(0xA0, &vec![0x41; len]),
                Err(DecodeError::PayloadTooLong { register: 0xA0, max: 255, actual: len })
            );
        }
    }

    #[test]
    fn test_parse_frame() {
        let frame = hex::decode("dd030002012cffce77").unwrap();
        let packet = parse_frame(&frame).unwrap();
        assert_eq!(packet.register, 0x03);
        assert_eq!(packet.status, 0x00);
        assert_eq!(packet.payload, vec![0x01, 0x2c]);
        assert!(packet.checksum_valid);

        let corrupt = hex::decode("dd030002012dffce77").unwrap();
        assert!(!parse_frame(&corrupt).unwrap().checksum_valid);

        let bad_end = hex::decode("dd030002012cffce78").unwrap();
        assert_eq!(parse_frame(&bad_end), Err(FrameError::BadEnd(0x78)));
    }
}
