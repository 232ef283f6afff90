use tokio::time::Instant;

/// A reassembled reply frame.
///
/// Only built from a complete frame: start marker, header, payload, checksum and end marker
/// were all present. `checksum_valid` records whether the checksum matched; packets with a
/// bad checksum never resolve a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The register the reply concerns
    pub register: u8,
    /// 0x00 for success, otherwise a protocol error code
    pub status: u8,
    pub payload: Vec<u8>,
    pub checksum_valid: bool,
    pub received_at: Instant,
}

impl Packet {
    pub fn is_success(&self) -> bool {
        self.status == 0x00
    }
}
