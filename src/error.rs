//! Error types shared by the framing, correlation and transport layers.

use thiserror::Error;

/// A frame failed to reassemble. Recovered locally by discarding bytes and resynchronising.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame did not begin with the start marker.
    #[error("missing start marker, got 0x{0:02x}")]
    BadStart(u8),

    /// The byte where the end marker belongs held something else.
    #[error("bad end marker 0x{0:02x}")]
    BadEnd(u8),

    /// The frame checksum did not match its contents.
    #[error("checksum mismatch: expected 0x{expected:04x}, received 0x{received:04x}")]
    ChecksumMismatch {
        /// Checksum computed over the received bytes.
        expected: u16,
        /// Checksum carried by the frame.
        received: u16,
    },

    /// Fewer bytes than the length field promised.
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes the header promised.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },
}

/// Error status reported by the peripheral in the status byte of a reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolStatus {
    #[error("command not found")]
    CommandNotFound,
    #[error("invalid operation (factory mode required)")]
    InvalidOperation,
    #[error("peripheral rejected the request checksum")]
    ChecksumError,
    #[error("password mismatch")]
    PasswordMismatch,
    #[error("unknown status 0x{0:02x}")]
    Unknown(u8),
}

impl ProtocolStatus {
    /// Decode a non-zero status byte.
    pub fn from_status(status: u8) -> Self {
        match status {
            0x80 => Self::CommandNotFound,
            0x81 => Self::InvalidOperation,
            0x82 => Self::ChecksumError,
            0x83 => Self::PasswordMismatch,
            other => Self::Unknown(other),
        }
    }

    /// The status byte this error was decoded from.
    pub fn code(&self) -> u8 {
        match self {
            Self::CommandNotFound => 0x80,
            Self::InvalidOperation => 0x81,
            Self::ChecksumError => 0x82,
            Self::PasswordMismatch => 0x83,
            Self::Unknown(code) => *code,
        }
    }
}

/// The transport collaborator failed to carry bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("transport disconnected")]
    Disconnected,

    #[error("MTU exchange failed: {0}")]
    MtuExchange(String),
}

/// A reply payload could not be decoded into telemetry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short for register 0x{register:02x}: need {needed} bytes, got {actual}")]
    PayloadTooShort {
        register: u8,
        needed: usize,
        actual: usize,
    },

    #[error("register 0x{register:02x} takes {expected} bytes, got {actual}")]
    LengthMismatch {
        register: u8,
        expected: usize,
        actual: usize,
    },

    #[error("payload for register 0x{register:02x} is {actual} bytes, at most {max} fit a frame")]
    PayloadTooLong {
        register: u8,
        max: usize,
        actual: usize,
    },

    #[error("register 0x{0:02x} is not in the catalog")]
    UnknownRegister(u8),

    #[error("register 0x{0:02x} is not readable")]
    NotReadable(u8),

    #[error("register 0x{0:02x} is not writable")]
    NotWritable(u8),
}

/// Why a request did not produce a payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The peripheral answered with an error status.
    #[error("register 0x{register:02x}: {status}")]
    Protocol {
        register: u8,
        status: ProtocolStatus,
    },

    /// No matching reply arrived before the deadline.
    #[error("register 0x{0:02x}: timed out waiting for a reply")]
    Timeout(u8),

    /// The breaker guarding this operation is open; the transport was not touched.
    #[error("circuit '{0}' is open")]
    CircuitOpen(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A request for the same register is already outstanding.
    #[error("register 0x{0:02x} already has a request in flight")]
    RegisterBusy(u8),

    /// A newer request for the same register replaced this one.
    #[error("register 0x{0:02x}: superseded by a newer request")]
    Superseded(u8),

    /// The correlator went away before the request completed.
    #[error("register 0x{0:02x}: request cancelled")]
    Cancelled(u8),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[test]
fn test_protocol_status_codes() {
    for code in [0x80u8, 0x81, 0x82, 0x83, 0x90] {
        assert_eq!(ProtocolStatus::from_status(code).code(), code);
    }
    assert_eq!(ProtocolStatus::from_status(0x81), ProtocolStatus::InvalidOperation);
    assert_eq!(ProtocolStatus::from_status(0x42), ProtocolStatus::Unknown(0x42));
}
