//! Structured advertise-data builder lowered to GAP LTV elements.

use std::collections::HashMap;

use itertools::Itertools;
use num_traits::clamp;
use uuid::Uuid;

use crate::gap_data::{data_types, GapData};

pub type ManfId = u16;

// Device name length before shortening kicks in.
const DEVICE_NAME_MAX: usize = 26;

const SERVICE_AD_TYPES: [u8; 3] = [
    data_types::COMPLETE_LIST_16_BIT_SERVICE_UUIDS,
    data_types::COMPLETE_LIST_32_BIT_SERVICE_UUIDS,
    data_types::COMPLETE_LIST_128_BIT_SERVICE_UUIDS,
];
const SOLICIT_AD_TYPES: [u8; 3] = [
    data_types::LIST_16_BIT_SERVICE_SOLICITATION_UUIDS,
    data_types::LIST_32_BIT_SERVICE_SOLICITATION_UUIDS,
    data_types::LIST_128_BIT_SERVICE_SOLICITATION_UUIDS,
];

// Tail of the Bluetooth base UUID, bytes 4..16.
const BASE_UUID_TAIL: [u8; 12] =
    [0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb];

/// Returns the shortest big-endian representation of a UUID: 2 or 4 bytes
/// when it sits inside the Bluetooth base UUID, 16 bytes otherwise.
fn shortest_uuid_slice(uuid: &Uuid) -> Vec<u8> {
    let bytes = uuid.as_bytes();
    if bytes[4..] == BASE_UUID_TAIL {
        if bytes[0] == 0 && bytes[1] == 0 {
            return bytes[2..4].to_vec();
        }
        return bytes[..4].to_vec();
    }
    bytes.to_vec()
}

/// The data to be advertised, or the scan response for active scans.
#[derive(Debug, Default, Clone)]
pub struct AdvertiseData {
    /// Service UUIDs identifying the GATT services on the advertiser.
    pub service_uuids: Vec<Uuid>,
    /// Service solicitation UUIDs we invite to connect.
    pub solicit_uuids: Vec<Uuid>,
    /// Transport discovery blocks, emitted verbatim.
    pub transport_discovery_data: Vec<Vec<u8>>,
    /// Manufacturer id with the corresponding manufacturer specific data.
    pub manufacturer_data: HashMap<ManfId, Vec<u8>>,
    /// Service UUID with the corresponding service data.
    pub service_data: HashMap<String, Vec<u8>>,
    /// Whether TX power level is included in the payload; the value is
    /// patched at emit time with the set's calibrated power.
    pub include_tx_power_level: bool,
    /// Whether the device name is included.
    pub include_device_name: bool,
}

impl AdvertiseData {
    fn push_element(dest: &mut Vec<GapData>, ad_type: u8, payload: &[u8]) {
        let len = clamp(payload.len(), 0, 254);
        dest.push(GapData::new(ad_type, payload[..len].to_vec()));
    }

    fn append_uuids(dest: &mut Vec<GapData>, ad_types: &[u8; 3], uuids: &[Uuid]) {
        let mut uuid16_bytes = Vec::<u8>::new();
        let mut uuid32_bytes = Vec::<u8>::new();
        let mut uuid128_bytes = Vec::<u8>::new();

        // Group UUIDs by their shortest binary form so the generated data is
        // [16-bit list, 32-bit list, 128-bit list], little-endian each.
        for uuid in uuids {
            let id: Vec<u8> = shortest_uuid_slice(uuid).iter().rev().cloned().collect();
            match id.len() {
                2 => uuid16_bytes.extend(id),
                4 => uuid32_bytes.extend(id),
                16 => uuid128_bytes.extend(id),
                _ => (),
            }
        }

        let bytes_list = [uuid16_bytes, uuid32_bytes, uuid128_bytes];
        for (ad_type, bytes) in
            ad_types.iter().zip(bytes_list.iter()).filter(|(_, bytes)| !bytes.is_empty())
        {
            AdvertiseData::push_element(dest, *ad_type, bytes);
        }
    }

    fn append_service_uuids(dest: &mut Vec<GapData>, uuids: &[Uuid]) {
        AdvertiseData::append_uuids(dest, &SERVICE_AD_TYPES, uuids);
    }

    fn append_solicit_uuids(dest: &mut Vec<GapData>, uuids: &[Uuid]) {
        AdvertiseData::append_uuids(dest, &SOLICIT_AD_TYPES, uuids);
    }

    fn append_service_data(dest: &mut Vec<GapData>, service_data: &HashMap<String, Vec<u8>>) {
        for (uuid, data) in service_data
            .iter()
            .sorted()
            .filter_map(|(s, d)| Uuid::parse_str(s).ok().map(|u| (u, d)))
        {
            let uuid_slice = shortest_uuid_slice(&uuid);
            let concated: Vec<u8> = uuid_slice.iter().rev().chain(data.iter()).cloned().collect();
            match uuid_slice.len() {
                2 => AdvertiseData::push_element(dest, data_types::SERVICE_DATA_16_BIT_UUID, &concated),
                4 => AdvertiseData::push_element(dest, data_types::SERVICE_DATA_32_BIT_UUID, &concated),
                16 => {
                    AdvertiseData::push_element(dest, data_types::SERVICE_DATA_128_BIT_UUID, &concated)
                }
                _ => (),
            }
        }
    }

    fn append_device_name(dest: &mut Vec<GapData>, device_name: &str) {
        if device_name.is_empty() {
            return;
        }

        let (ad_type, name) = if device_name.len() > DEVICE_NAME_MAX {
            (
                data_types::SHORTENED_LOCAL_NAME,
                [&device_name.as_bytes()[..DEVICE_NAME_MAX], &[0]].concat(),
            )
        } else {
            (data_types::COMPLETE_LOCAL_NAME, [device_name.as_bytes(), &[0]].concat())
        };
        AdvertiseData::push_element(dest, ad_type, &name);
    }

    fn append_manufacturer_data(dest: &mut Vec<GapData>, manufacturer_data: &HashMap<ManfId, Vec<u8>>) {
        for (m, data) in manufacturer_data.iter().sorted() {
            let concated = [&m.to_le_bytes()[..], data].concat();
            AdvertiseData::push_element(dest, data_types::MANUFACTURER_SPECIFIC_DATA, &concated);
        }
    }

    fn append_transport_discovery_data(dest: &mut Vec<GapData>, tdd: &[Vec<u8>]) {
        for block in tdd.iter().filter(|block| !block.is_empty()) {
            AdvertiseData::push_element(dest, data_types::TRANSPORT_DISCOVERY_DATA, block);
        }
    }

    /// Lowers the structured data into GAP elements, using `device_name` for
    /// the name element when requested.
    pub fn make_with(&self, device_name: &str) -> Vec<GapData> {
        let mut elements = Vec::<GapData>::new();
        if self.include_device_name {
            AdvertiseData::append_device_name(&mut elements, device_name);
        }
        if self.include_tx_power_level {
            // The advertising manager fills the actual tx power level.
            AdvertiseData::push_element(&mut elements, data_types::TX_POWER_LEVEL, &[0]);
        }
        AdvertiseData::append_manufacturer_data(&mut elements, &self.manufacturer_data);
        AdvertiseData::append_service_uuids(&mut elements, &self.service_uuids);
        AdvertiseData::append_service_data(&mut elements, &self.service_data);
        AdvertiseData::append_solicit_uuids(&mut elements, &self.solicit_uuids);
        AdvertiseData::append_transport_discovery_data(&mut elements, &self.transport_discovery_data);
        elements
    }
}
