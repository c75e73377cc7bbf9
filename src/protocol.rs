use crate::{
    error::{NexusError, Result},
    IMAGE_RECEIVE_SERVICE_UUID, IMAGE_SEND_SERVICE_UUID, MISSING_PACKET_WRITE_CHAR_UUID,
    PACKET_READ_CHAR_UUID, PACKET_WRITE_CHAR_UUID, TOTAL_PACKET_COUNT_CHAR_UUID,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

/// Largest wave a single missing-packet bitmap can describe
pub const MAX_WAVE_SIZE: usize = 128;

/// Header bit marking a retransmitted packet, and a missing list on writes
pub const MISSING_FLAG: u8 = 0x80;

/// Header bits carrying the sequence number
pub const SEQUENCE_MASK: u8 = 0x7F;

/// Role a supported characteristic plays in the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicRole {
    /// Notify source carrying document packets
    PacketRead,
    /// Sink for missing lists and wave acknowledgments
    MissingPacketWrite,
    /// Outbound packet sink, unused by the status pull
    PacketWrite,
    /// Initial read giving the transfer size
    TotalPacketCount,
}

impl CharacteristicRole {
    /// Every supported characteristic in registry order
    pub const ALL: [Self; 4] = [
        Self::PacketRead,
        Self::MissingPacketWrite,
        Self::PacketWrite,
        Self::TotalPacketCount,
    ];

    /// Characteristic UUID agreed with the robot firmware
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::PacketRead => PACKET_READ_CHAR_UUID,
            Self::MissingPacketWrite => MISSING_PACKET_WRITE_CHAR_UUID,
            Self::PacketWrite => PACKET_WRITE_CHAR_UUID,
            Self::TotalPacketCount => TOTAL_PACKET_COUNT_CHAR_UUID,
        }
    }

    /// Look up the role of a characteristic
    #[must_use]
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == *uuid)
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketRead => write!(f, "Packet Read"),
            Self::MissingPacketWrite => write!(f, "Missing Packet Write"),
            Self::PacketWrite => write!(f, "Packet Write"),
            Self::TotalPacketCount => write!(f, "Total Number of Packets"),
        }
    }
}

/// Check if a service is one the robot firmware exposes for transfers
#[must_use]
pub fn is_supported_service(uuid: &Uuid) -> bool {
    *uuid == IMAGE_RECEIVE_SERVICE_UUID || *uuid == IMAGE_SEND_SERVICE_UUID
}

/// One notification of a document transfer
///
/// Byte 0 holds the missing flag in its top bit and the sequence number in
/// the remaining seven; the rest is a fragment of the UTF-8 document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Set on packets resent in answer to a missing list
    pub missing_flag: bool,
    /// Position of the fragment within its wave
    pub sequence: u8,
    /// Document bytes
    pub fragment: Bytes,
}

impl Packet {
    /// Create a packet
    #[must_use]
    pub fn new(missing_flag: bool, sequence: u8, fragment: impl Into<Bytes>) -> Self {
        Self {
            missing_flag,
            sequence: sequence & SEQUENCE_MASK,
            fragment: fragment.into(),
        }
    }

    /// Decode a raw notification value
    ///
    /// # Errors
    ///
    /// Returns [`NexusError::Protocol`] for an empty value.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (&header, fragment) = data
            .split_first()
            .ok_or_else(|| NexusError::Protocol("empty packet".to_string()))?;

        Ok(Self {
            missing_flag: header & MISSING_FLAG != 0,
            sequence: header & SEQUENCE_MASK,
            fragment: Bytes::copy_from_slice(fragment),
        })
    }

    /// Encode to the notification wire format
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.fragment.len() + 1);
        let flag = if self.missing_flag { MISSING_FLAG } else { 0 };
        buf.put_u8(flag | (self.sequence & SEQUENCE_MASK));
        buf.put_slice(&self.fragment);
        buf.freeze()
    }
}

/// Build a missing-packet list
///
/// The first bit is set to mark the frame as a missing list; each following
/// bit is one sequence number in order, set when that packet is missing. The
/// frame is zero-padded to `frame_len`, or to the bitmap's own length if that
/// is longer.
#[must_use]
pub fn encode_missing_list(missing: &[bool], frame_len: usize) -> Bytes {
    let bits = missing.len() + 1;
    let mut frame = vec![0u8; frame_len.max(bits.div_ceil(8))];
    frame[0] = MISSING_FLAG;

    for (sequence, _) in missing.iter().enumerate().filter(|(_, m)| **m) {
        let bit = sequence + 1;
        frame[bit / 8] |= 0x80 >> (bit % 8);
    }

    Bytes::from(frame)
}

/// Decode a missing-packet list back into sequence numbers
///
/// Returns `None` if the frame is not flagged as a missing list.
#[must_use]
pub fn decode_missing_list(frame: &[u8], wave_size: usize) -> Option<Vec<u8>> {
    let first = *frame.first()?;
    if first & MISSING_FLAG == 0 {
        return None;
    }

    let missing = (0..wave_size)
        .filter(|sequence| {
            let bit = sequence + 1;
            frame
                .get(bit / 8)
                .is_some_and(|byte| byte & (0x80 >> (bit % 8)) != 0)
        })
        .filter_map(|sequence| u8::try_from(sequence).ok())
        .collect();
    Some(missing)
}

/// Build the acknowledgment written once a wave is complete
///
/// The meaningful content is the leading zero byte with its flag bit clear.
#[must_use]
pub fn encode_ack(frame_len: usize) -> Bytes {
    Bytes::from(vec![0u8; frame_len.max(1)])
}

/// Decode the value of the total-packet-count characteristic
///
/// The firmware sends a big-endian signed 32-bit count; short or negative
/// values mean there is nothing to transfer.
#[must_use]
pub fn decode_total_packets(value: &[u8]) -> u32 {
    value
        .get(..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .map(i32::from_be_bytes)
        .and_then(|count| u32::try_from(count).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_header_decoding() {
        let packet = Packet::from_bytes(&[0x85, b'{', b'"']).unwrap();
        assert!(packet.missing_flag);
        assert_eq!(packet.sequence, 5);
        assert_eq!(&packet.fragment[..], b"{\"");

        let packet = Packet::from_bytes(&[0x7F]).unwrap();
        assert!(!packet.missing_flag);
        assert_eq!(packet.sequence, 127);
        assert!(packet.fragment.is_empty());

        assert!(Packet::from_bytes(&[]).is_err());
    }

    #[test]
    fn test_packet_encoding() {
        let bytes = Packet::new(true, 3, &b"ab"[..]).to_bytes();
        assert_eq!(&bytes[..], &[0x83, b'a', b'b']);
    }

    #[test]
    fn test_missing_list_bitmap() {
        // wave of 5, packet 3 missing: 1 0 0 0 1 0 0 0
        let frame = encode_missing_list(&[false, false, false, true, false], 20);
        assert_eq!(frame.len(), 20);
        assert_eq!(frame[0], 0x88);
        assert!(frame[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_missing_list_crosses_byte_boundary() {
        let mut missing = vec![false; 128];
        missing[6] = true;
        missing[7] = true;
        missing[127] = true;
        let frame = encode_missing_list(&missing, 20);

        assert_eq!(frame[0], 0x81);
        assert_eq!(frame[1], 0x80);
        assert_eq!(frame[16], 0x80);
        assert_eq!(decode_missing_list(&frame, 128).unwrap(), vec![6, 7, 127]);
    }

    #[test]
    fn test_missing_list_grows_past_short_frame() {
        let frame = encode_missing_list(&[true; 20], 1);
        assert_eq!(frame.len(), 3);
        assert_eq!(frame[0], 0xFF);
    }

    #[test]
    fn test_ack_frame() {
        let ack = encode_ack(20);
        assert_eq!(ack.len(), 20);
        assert_eq!(ack[0], 0);
        assert!(decode_missing_list(&ack, 5).is_none());
    }

    #[test]
    fn test_total_packets_decoding() {
        assert_eq!(decode_total_packets(&[0x00, 0x00, 0x00, 0xC8]), 200);
        assert_eq!(decode_total_packets(&[0x00, 0x00, 0x01, 0x00, 0xFF]), 256);
        assert_eq!(decode_total_packets(&[0xFF, 0xFF, 0xFF, 0xFF]), 0);
        assert_eq!(decode_total_packets(&[0x05]), 0);
    }

    #[test]
    fn test_characteristic_registry() {
        for role in CharacteristicRole::ALL {
            assert_eq!(CharacteristicRole::from_uuid(&role.uuid()), Some(role));
        }
        assert_eq!(
            CharacteristicRole::PacketRead.uuid().to_string(),
            "00002a10-30de-4630-9b59-27228d45bf11"
        );
        assert!(CharacteristicRole::from_uuid(&crate::CCCD_UUID).is_none());
        assert!(is_supported_service(&IMAGE_SEND_SERVICE_UUID));
        assert!(!is_supported_service(&PACKET_READ_CHAR_UUID));
    }
}
