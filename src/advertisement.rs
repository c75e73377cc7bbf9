use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// GAP type: flags
pub const AD_TYPE_FLAGS: u8 = 0x01;
/// GAP type: incomplete list of 128-bit service UUIDs
pub const AD_TYPE_INCOMPLETE_128_UUIDS: u8 = 0x06;
/// GAP type: complete list of 128-bit service UUIDs
pub const AD_TYPE_COMPLETE_128_UUIDS: u8 = 0x07;
/// GAP type: shortened local name
pub const AD_TYPE_SHORT_NAME: u8 = 0x08;
/// GAP type: complete local name
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
/// GAP type: manufacturer specific data
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Bytes in a 128-bit UUID
const UUID_LEN: usize = 16;

/// One length-prefixed structure of an advertising payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapStructure {
    /// Length byte as transmitted (type byte plus data)
    pub length: u8,
    /// GAP type
    pub ad_type: u8,
    /// Structure data after the type byte
    pub data: Bytes,
}

/// Split a raw advertising payload into its GAP structures
///
/// Parsing runs left to right and stops at a zero length byte, a zero type
/// byte, or a structure that would run past the end of the payload. It never
/// fails; whatever was parsed before the stop is returned.
#[must_use]
pub fn parse(raw: &[u8]) -> Vec<GapStructure> {
    let mut structures = Vec::new();
    let mut index = 0;

    while index < raw.len() {
        let length = raw[index];
        if length == 0 {
            break;
        }
        index += 1;

        let Some(&ad_type) = raw.get(index) else {
            break;
        };
        if ad_type == 0 {
            break;
        }

        let end = index + usize::from(length);
        if end > raw.len() {
            break;
        }

        structures.push(GapStructure {
            length,
            ad_type,
            data: Bytes::copy_from_slice(&raw[index + 1..end]),
        });
        index = end;
    }

    structures
}

/// Find the UUID carried in the incomplete 128-bit UUID list
///
/// BLE stores 128-bit UUIDs least significant byte first, so the last
/// sixteen bytes of the structure are reversed into the canonical big-endian
/// order. Returns `None` if no such structure exists or it is too short to
/// hold a UUID.
#[must_use]
pub fn extract_uuid(structures: &[GapStructure]) -> Option<Uuid> {
    let structure = structures
        .iter()
        .find(|s| s.ad_type == AD_TYPE_INCOMPLETE_128_UUIDS)?;

    let data = &structure.data;
    if data.len() < UUID_LEN {
        return None;
    }

    let mut bytes = [0u8; UUID_LEN];
    for (slot, byte) in bytes
        .iter_mut()
        .zip(data[data.len() - UUID_LEN..].iter().rev())
    {
        *slot = *byte;
    }

    Some(Uuid::from_bytes(bytes))
}

/// Parse a payload and extract its advertised UUID in one step
#[must_use]
pub fn advertised_uuid(raw: &[u8]) -> Option<Uuid> {
    extract_uuid(&parse(raw))
}

/// Encoder for advertising payloads
///
/// Used by radio adapters whose platform only exposes decoded advertisement
/// properties, so every payload still goes through [`parse`].
#[derive(Debug, Default)]
pub struct AdvertisementBuilder {
    buf: BytesMut,
}

impl AdvertisementBuilder {
    /// Start an empty payload
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary structure
    ///
    /// Data longer than 254 bytes is truncated to fit the length byte.
    #[must_use]
    pub fn structure(mut self, ad_type: u8, data: &[u8]) -> Self {
        let data = &data[..data.len().min(usize::from(u8::MAX) - 1)];
        #[allow(clippy::cast_possible_truncation)]
        self.buf.put_u8(data.len() as u8 + 1);
        self.buf.put_u8(ad_type);
        self.buf.put_slice(data);
        self
    }

    /// Append a flags structure
    #[must_use]
    pub fn flags(self, flags: u8) -> Self {
        self.structure(AD_TYPE_FLAGS, &[flags])
    }

    /// Append an incomplete 128-bit UUID list in BLE byte order
    #[must_use]
    pub fn incomplete_uuids(self, uuids: &[Uuid]) -> Self {
        if uuids.is_empty() {
            return self;
        }
        let mut data = Vec::with_capacity(uuids.len() * UUID_LEN);
        for uuid in uuids {
            data.extend(uuid.as_bytes().iter().rev());
        }
        self.structure(AD_TYPE_INCOMPLETE_128_UUIDS, &data)
    }

    /// Append a complete local name
    #[must_use]
    pub fn complete_name(self, name: &str) -> Self {
        self.structure(AD_TYPE_COMPLETE_NAME, name.as_bytes())
    }

    /// Append manufacturer data with its little-endian company identifier
    #[must_use]
    pub fn manufacturer_data(self, company_id: u16, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(data.len() + 2);
        payload.extend_from_slice(&company_id.to_le_bytes());
        payload.extend_from_slice(data);
        self.structure(AD_TYPE_MANUFACTURER_DATA, &payload)
    }

    /// Finish the payload
    #[must_use]
    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `11bf458d-2227-599b-3046-de3000180000` as BLE stores it
    const ROBOT_UUID_LE: [u8; 16] = [
        0x00, 0x00, 0x18, 0x00, 0x30, 0xDE, 0x46, 0x30, 0x9B, 0x59, 0x27, 0x22, 0x8D, 0x45, 0xBF,
        0x11,
    ];

    fn robot_payload() -> Vec<u8> {
        let mut raw = vec![0x02, AD_TYPE_FLAGS, 0x06, 0x11, AD_TYPE_INCOMPLETE_128_UUIDS];
        raw.extend_from_slice(&ROBOT_UUID_LE);
        raw.extend_from_slice(&[0x05, AD_TYPE_COMPLETE_NAME, b'j', b'u', b'n', b'r']);
        raw
    }

    #[test]
    fn test_parse_structures() {
        let structures = parse(&robot_payload());

        assert_eq!(structures.len(), 3);
        assert_eq!(structures[0].ad_type, AD_TYPE_FLAGS);
        assert_eq!(&structures[0].data[..], &[0x06]);
        assert_eq!(structures[1].length, 17);
        assert_eq!(structures[1].data.len(), 16);
        assert_eq!(&structures[2].data[..], b"junr");
    }

    #[test]
    fn test_extract_robot_uuid() {
        let uuid = advertised_uuid(&robot_payload()).unwrap();
        assert_eq!(uuid.to_string(), "11bf458d-2227-599b-3046-de3000180000");
    }

    #[test]
    fn test_extract_uuid_byte_exact_groups() {
        // every byte distinct so a misplaced nibble or byte shows up
        let stored: Vec<u8> = (0x00..0x10).collect();
        let mut raw = vec![0x11, AD_TYPE_INCOMPLETE_128_UUIDS];
        raw.extend_from_slice(&stored);

        let uuid = advertised_uuid(&raw).unwrap();
        assert_eq!(uuid.to_string(), "0f0e0d0c-0b0a-0908-0706-050403020100");
    }

    #[test]
    fn test_extract_uses_final_uuid_of_list() {
        let mut raw = vec![0x21, AD_TYPE_INCOMPLETE_128_UUIDS];
        raw.extend_from_slice(&[0xAA; 16]);
        raw.extend_from_slice(&ROBOT_UUID_LE);

        let uuid = advertised_uuid(&raw).unwrap();
        assert_eq!(uuid.to_string(), "11bf458d-2227-599b-3046-de3000180000");
    }

    #[test]
    fn test_name_only_payload_has_no_uuid() {
        let raw = [
            0x05, AD_TYPE_COMPLETE_NAME, b'l', b'a', b'm', b'p', 0x03, AD_TYPE_COMPLETE_NAME, b'x',
            b'y',
        ];
        assert_eq!(parse(&raw).len(), 2);
        assert!(advertised_uuid(&raw).is_none());
    }

    #[test]
    fn test_short_uuid_structure_is_ignored() {
        let raw = [0x05, AD_TYPE_INCOMPLETE_128_UUIDS, 0x01, 0x02, 0x03, 0x04];
        assert!(advertised_uuid(&raw).is_none());
    }

    #[test]
    fn test_parse_stops_on_zero_length_or_type() {
        let raw = [0x02, AD_TYPE_FLAGS, 0x06, 0x00, 0x03, AD_TYPE_COMPLETE_NAME, b'a', b'b'];
        assert_eq!(parse(&raw).len(), 1);

        let raw = [0x02, AD_TYPE_FLAGS, 0x06, 0x03, 0x00, b'a', b'b'];
        assert_eq!(parse(&raw).len(), 1);
    }

    #[test]
    fn test_parse_stops_on_truncated_structure() {
        let raw = [0x02, AD_TYPE_FLAGS, 0x06, 0x09, AD_TYPE_COMPLETE_NAME, b'a'];
        let structures = parse(&raw);
        assert_eq!(structures.len(), 1);

        // length byte with nothing after it
        assert_eq!(parse(&[0x02, AD_TYPE_FLAGS, 0x06, 0x04]).len(), 1);
        assert!(parse(&[]).is_empty());
    }

    #[test]
    fn test_builder_output_matches_stored_order() {
        let target = crate::TARGET_ROBOT_UUID;
        let raw = AdvertisementBuilder::new()
            .flags(0x06)
            .incomplete_uuids(&[target])
            .complete_name("junr")
            .build();

        assert_eq!(&raw[..], &robot_payload()[..]);
    }

    #[test]
    fn test_builder_manufacturer_data() {
        let raw = AdvertisementBuilder::new()
            .manufacturer_data(0x0059, &[0x01, 0x02])
            .build();
        let structures = parse(&raw);

        assert_eq!(structures[0].ad_type, AD_TYPE_MANUFACTURER_DATA);
        assert_eq!(&structures[0].data[..], &[0x59, 0x00, 0x01, 0x02]);
    }
}
