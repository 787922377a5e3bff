//! GAP advertising data elements: serialization, length gates, and the
//! fragmentation used by the extended advertising data commands.

/// Standard advertising data types used by the core.
pub mod data_types {
    pub const FLAGS: u8 = 0x01;
    pub const COMPLETE_LIST_16_BIT_SERVICE_UUIDS: u8 = 0x03;
    pub const COMPLETE_LIST_32_BIT_SERVICE_UUIDS: u8 = 0x05;
    pub const COMPLETE_LIST_128_BIT_SERVICE_UUIDS: u8 = 0x07;
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;
    pub const TX_POWER_LEVEL: u8 = 0x0a;
    pub const LIST_16_BIT_SERVICE_SOLICITATION_UUIDS: u8 = 0x14;
    pub const LIST_128_BIT_SERVICE_SOLICITATION_UUIDS: u8 = 0x15;
    pub const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;
    pub const LIST_32_BIT_SERVICE_SOLICITATION_UUIDS: u8 = 0x1f;
    pub const SERVICE_DATA_32_BIT_UUID: u8 = 0x20;
    pub const SERVICE_DATA_128_BIT_UUID: u8 = 0x21;
    pub const TRANSPORT_DISCOVERY_DATA: u8 = 0x26;
    pub const ENCRYPTED_ADVERTISING_DATA: u8 = 0x31;
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;
}

/// Advertising flag bits.
pub mod flags {
    pub const LE_LIMITED_DISCOVERABLE: u8 = 0x01;
    pub const LE_GENERAL_DISCOVERABLE: u8 = 0x02;
    pub const BR_EDR_NOT_SUPPORTED: u8 = 0x04;
}

/// Maximum bytes a single extended-advertising data command may carry.
pub const LE_MAX_FRAGMENT_LENGTH: usize = 252;
/// Maximum serialized size of one GAP element.
pub const LE_MAX_GAP_DATA_LENGTH: usize = 254;
/// Legacy PDU advertising data cap.
pub const LEGACY_ADV_DATA_LEN_MAX: usize = 31;
/// Serialized size of the auto-inserted FLAGS element.
pub const FLAGS_LEN: usize = 3;

/// One length-type-value advertising element.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GapData {
    pub data_type: u8,
    pub data: Vec<u8>,
}

impl GapData {
    pub fn new(data_type: u8, data: Vec<u8>) -> Self {
        GapData { data_type, data }
    }

    /// Serialized size: length byte, type byte, payload.
    pub fn size(&self) -> usize {
        self.data.len() + 2
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push((self.data.len() + 1) as u8);
        out.push(self.data_type);
        out.extend_from_slice(&self.data);
    }
}

/// Serializes a list of elements into the raw stream sent to the controller.
pub fn serialize_elements(data: &[GapData]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.iter().map(GapData::size).sum());
    for element in data {
        element.serialize(&mut out);
    }
    out
}

/// Parses a raw LTV stream back into elements. Used by the unseal path and
/// by tests; trailing garbage is an error.
pub fn parse_elements(mut bytes: &[u8]) -> Option<Vec<GapData>> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 2 {
            return None;
        }
        let len = bytes[0] as usize;
        if len == 0 || bytes.len() < len + 1 {
            return None;
        }
        out.push(GapData { data_type: bytes[1], data: bytes[2..len + 1].to_vec() });
        bytes = &bytes[len + 1..];
    }
    Some(out)
}

pub fn data_has_flags(data: &[GapData]) -> bool {
    data.iter().any(|d| d.data_type == data_types::FLAGS)
}

/// Total serialized length, counting the FLAGS element that `set_data` will
/// insert for connectable+discoverable payloads that do not carry one.
pub fn total_serialized_length(data: &[GapData], include_flags: bool) -> usize {
    let mut len: usize = data.iter().map(GapData::size).sum();
    if include_flags && !data_has_flags(data) {
        len += FLAGS_LEN;
    }
    len
}

/// Fragment operation of the extended advertising data commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    IntermediateFragment = 0x00,
    FirstFragment = 0x01,
    LastFragment = 0x02,
    CompleteAdvertisement = 0x03,
    UnchangedData = 0x04,
}

impl Operation {
    /// Whether a completion for this fragment surfaces a client callback.
    /// Earlier fragments must not report success to callers.
    pub fn is_final(&self) -> bool {
        matches!(self, Operation::CompleteAdvertisement | Operation::LastFragment)
    }
}

/// Splits a serialized stream into fragments of at most `limit` bytes. Short
/// payloads become a single COMPLETE operation.
pub fn fragment_bytes(bytes: &[u8], limit: usize) -> Vec<(Operation, Vec<u8>)> {
    if bytes.len() <= limit {
        return vec![(Operation::CompleteAdvertisement, bytes.to_vec())];
    }
    let chunks: Vec<&[u8]> = bytes.chunks(limit).collect();
    let last = chunks.len() - 1;
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let operation = if i == 0 {
                Operation::FirstFragment
            } else if i == last {
                Operation::LastFragment
            } else {
                Operation::IntermediateFragment
            };
            (operation, chunk.to_vec())
        })
        .collect()
}

/// Splits element-wise: whole elements are packed into fragments of at most
/// `limit` bytes. Callers must have rejected single elements larger than the
/// limit beforehand.
pub fn fragment_elements(data: &[GapData], limit: usize) -> Vec<(Operation, Vec<u8>)> {
    let total: usize = data.iter().map(GapData::size).sum();
    if total <= limit {
        return vec![(Operation::CompleteAdvertisement, serialize_elements(data))];
    }
    let mut fragments = Vec::new();
    let mut current = Vec::new();
    let mut operation = Operation::FirstFragment;
    for element in data {
        if current.len() + element.size() > limit {
            fragments.push((operation, std::mem::take(&mut current)));
            operation = Operation::IntermediateFragment;
        }
        element.serialize(&mut current);
    }
    fragments.push((Operation::LastFragment, current));
    fragments
}
