/*!
 # Command frames

 Every command written to the control characteristic is a fixed-offset frame:

 ```text
 FF | SOP2 | DID | CID | SEQ | DLEN | payload... | CHK
 ```

 `DLEN` counts the payload plus the checksum byte. `CHK` is the inverted low
 byte of the sum of `DID`, `CID`, `SEQ`, `DLEN` and every payload byte.
*/

use crate::{Error, Result};

/// First start-of-packet byte
pub const SOP1: u8 = 0xff;
/// Base value of the second start-of-packet byte
pub const SOP2_BASE: u8 = 0xfc;
/// Ask the device to answer the command
pub const SOP2_ANSWER: u8 = 0x01;
/// Reset the device's inactivity timeout
pub const SOP2_RESET_TIMEOUT: u8 = 0x02;
/// Control byte used for every frame this crate emits
pub const SOP2: u8 = SOP2_BASE | SOP2_ANSWER | SOP2_RESET_TIMEOUT;

/// Bytes before the payload
pub const HEADER_LEN: usize = 6;
/// Largest payload whose length still fits in `DLEN`
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize - 1;

/// A logical request to one of the robot's virtual devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    device_id: u8,
    command_id: u8,
    payload: Vec<u8>,
    label: Option<String>,
}

impl Command {
    /// Builds a command, rejecting payloads too long for a single frame
    pub fn new(device_id: u8, command_id: u8, payload: impl Into<Vec<u8>>) -> Result<Self> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidCommandInput(format!(
                "payload of {} bytes exceeds {} bytes",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        Ok(Self {
            device_id,
            command_id,
            payload,
            label: None,
        })
    }

    /// Attaches a diagnostic name
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn device_id(&self) -> u8 {
        self.device_id
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

/// A wire-ready frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedFrame {
    bytes: Vec<u8>,
}

impl SequencedFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn sequence(&self) -> u8 {
        self.bytes[4]
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }
}

/// Computes the checksum over a frame's summed fields
pub fn checksum(device_id: u8, command_id: u8, sequence: u8, data_length: u8, payload: &[u8]) -> u8 {
    let sum = payload
        .iter()
        .fold(0u32, |acc, b| acc + u32::from(*b))
        + u32::from(device_id)
        + u32::from(command_id)
        + u32::from(sequence)
        + u32::from(data_length);

    (sum & 0xff) as u8 ^ 0xff
}

/// Encodes a command with the sequence number it was assigned
pub fn encode(command: &Command, sequence: u8) -> SequencedFrame {
    debug_assert!(command.payload.len() <= MAX_PAYLOAD_LEN);

    let data_length = (command.payload.len() + 1) as u8;
    let chk = checksum(
        command.device_id,
        command.command_id,
        sequence,
        data_length,
        &command.payload,
    );

    let mut bytes = Vec::with_capacity(HEADER_LEN + command.payload.len() + 1);
    bytes.extend_from_slice(&[
        SOP1,
        SOP2,
        command.device_id,
        command.command_id,
        sequence,
        data_length,
    ]);
    bytes.extend_from_slice(&command.payload);
    bytes.push(chk);

    SequencedFrame { bytes }
}

/// Checks both start bytes, length and checksum of raw frame bytes
pub fn verify(bytes: &[u8]) -> bool {
    if bytes.len() < HEADER_LEN + 1 || bytes[0] != SOP1 || bytes[1] != SOP2 {
        return false;
    }

    let data_length = bytes[5];
    if usize::from(data_length) != bytes.len() - HEADER_LEN {
        return false;
    }

    // DID through the last payload byte
    let sum = bytes[2..bytes.len() - 1]
        .iter()
        .fold(0u32, |acc, b| acc + u32::from(*b));

    bytes[bytes.len() - 1] == (sum & 0xff) as u8 ^ 0xff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_byte_is_answer_and_reset_timeout() {
        assert_eq!(SOP2, 0xff);
    }

    #[test]
    fn set_color_red_frame() {
        let command = Command::new(0x02, 0x20, [255u8, 0, 0, 0]).unwrap();
        for seq in [0u8, 1, 0x7f, 0xff] {
            let frame = encode(&command, seq);
            let expected_chk =
                0xff ^ ((255u32 + 0x02 + 0x20 + u32::from(seq) + 5) & 0xff) as u8;
            assert_eq!(
                frame.as_bytes(),
                &[0xff, 0xff, 0x02, 0x20, seq, 0x05, 0xff, 0x00, 0x00, 0x00, expected_chk]
            );
            assert_eq!(frame.sequence(), seq);
        }
    }

    #[test]
    fn known_checksum_value() {
        // 255 + 2 + 32 + 0 + 5 = 294 -> 0x26 -> !0x26 = 0xd9
        let command = Command::new(0x02, 0x20, [255u8, 0, 0, 0]).unwrap();
        assert_eq!(encode(&command, 0).checksum(), 0xd9);
    }

    #[test]
    fn every_sequence_passes_independent_verifier() {
        let payloads: [&[u8]; 4] = [&[], &[0x00], &[0xff; 4], &[0x12, 0x34, 0x56, 0x78, 0x9a]];
        for payload in payloads {
            let command = Command::new(0x02, 0x20, payload).unwrap();
            for seq in 0..=u8::MAX {
                let frame = encode(&command, seq);
                assert!(verify(frame.as_bytes()), "seq {seq} payload {payload:?}");
            }
        }
    }

    #[test]
    fn empty_payload_sums_to_zero() {
        let command = Command::new(0x00, 0x01, Vec::<u8>::new()).unwrap();
        let frame = encode(&command, 3);
        assert_eq!(frame.as_bytes(), &[0xff, 0xff, 0x00, 0x01, 0x03, 0x01, 0xfa]);
    }

    #[test]
    fn verifier_rejects_corruption() {
        let command = Command::new(0x02, 0x20, [1u8, 2, 3, 0]).unwrap();
        let mut bytes = encode(&command, 9).into_bytes();
        assert!(verify(&bytes));

        let mut payload = bytes.clone();
        payload[6] ^= 0x01;
        assert!(!verify(&payload));

        // Checksum does not cover the control byte
        bytes[1] = SOP2_BASE;
        assert!(!verify(&bytes));
        assert!(!verify(&bytes[..5]));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let err = Command::new(0x02, 0x20, vec![0u8; MAX_PAYLOAD_LEN + 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidCommandInput(_)));
        assert!(Command::new(0x02, 0x20, vec![0u8; MAX_PAYLOAD_LEN]).is_ok());
    }
}
