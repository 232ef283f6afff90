/// The reply to a hardware version (0x05) read: an ASCII model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareVersionMessage(String);

impl HardwareVersionMessage {
    pub fn new(data: Vec<u8>) -> Self {
        let text = String::from_utf8_lossy(&data)
            .trim_end_matches('\0')
            .trim()
            .to_string();
        Self(text)
    }

    pub fn version(&self) -> &str {
        &self.0
    }
}

#[test]
fn test_decode_version() {
    let message = HardwareVersionMessage::new(b"SP04S034L4S100A\0\0".to_vec());
    assert_eq!(message.version(), "SP04S034L4S100A");
}
