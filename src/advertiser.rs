//! Per-set advertiser records and the id registry.

use std::collections::HashMap;

use log::warn;

use crate::address::{Address, AddressType, AddressWithType, AdvertiserAddressType};
use crate::gap_data::GapData;
use crate::hci::{AdvertiserId, DurationTicks, ErrorCode, RegId};

/// Status surfaced through the advertising callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvertisingStatus {
    Success,
    DataTooLarge,
    TooManyAdvertisers,
    AlreadyStarted,
    InternalError,
    FeatureUnsupported,
    AdvertisingTimeout,
    LimitReached,
}

impl From<ErrorCode> for AdvertisingStatus {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Success => AdvertisingStatus::Success,
            ErrorCode::AdvertisingTimeout => AdvertisingStatus::AdvertisingTimeout,
            ErrorCode::LimitReached => AdvertisingStatus::LimitReached,
            ErrorCode::MemoryCapacityExceeded => AdvertisingStatus::TooManyAdvertisers,
            _ => AdvertisingStatus::InternalError,
        }
    }
}

/// One-shot status callback for locally-registered advertisers.
pub type StatusCallback = Box<dyn FnOnce(AdvertisingStatus) + Send>;
/// Scan-request-received callback: scanner address and address type.
pub type ScanCallback = Box<dyn Fn(Address, AddressType) + Send>;
/// Set-terminated callback towards the connection layer.
pub type TerminatedCallback = Box<dyn Fn(ErrorCode, AdvertiserId, u16) + Send>;

/// State of one advertising set.
#[derive(Default)]
pub struct Advertiser {
    pub in_use: bool,
    pub started: bool,

    pub requested_address_type: Option<AdvertiserAddressType>,
    /// After policy narrowing; may differ from the requested type.
    pub address_type: Option<AdvertiserAddressType>,
    pub current_address: Option<AddressWithType>,

    pub tx_power: i8,
    pub duration: DurationTicks,
    pub max_extended_advertising_events: u8,

    pub is_legacy: bool,
    pub connectable: bool,
    pub scannable: bool,
    pub discoverable: bool,
    pub directed: bool,
    pub anonymous: bool,
    pub include_tx_power: bool,
    pub is_periodic: bool,
    pub include_adi: bool,

    pub advertisement: Vec<GapData>,
    pub scan_response: Vec<GapData>,
    pub periodic_data: Vec<GapData>,
    pub advertisement_enc: Vec<GapData>,
    pub scan_response_enc: Vec<GapData>,
    pub periodic_data_enc: Vec<GapData>,
    /// `key(16) ∥ iv(16)`; empty means "use the stored adapter material".
    pub enc_key_value: Vec<u8>,
    /// Regenerated before every seal.
    pub randomizer: [u8; 5],

    pub status_callback: Option<StatusCallback>,
    pub timeout_callback: Option<StatusCallback>,
    pub scan_callback: Option<ScanCallback>,
    pub terminated_callback: Option<TerminatedCallback>,
}

impl Advertiser {
    pub fn address(&self) -> AddressWithType {
        self.current_address.unwrap_or(AddressWithType::EMPTY)
    }
}

/// Registry of advertising sets keyed by advertiser id. Ids are allocated
/// smallest-first inside `[first_id, first_id + num_instances)`; the vendor
/// multi-advertising command set is 1-based, everything else 0-based.
pub struct AdvertiserRegistry {
    sets: HashMap<AdvertiserId, Advertiser>,
    first_id: AdvertiserId,
    num_instances: usize,
    /// reg_id correlation back to the registering client.
    id_map: HashMap<AdvertiserId, RegId>,
}

impl AdvertiserRegistry {
    pub fn new(first_id: AdvertiserId, num_instances: usize) -> Self {
        AdvertiserRegistry { sets: HashMap::new(), first_id, num_instances, id_map: HashMap::new() }
    }

    pub fn num_instances(&self) -> usize {
        self.num_instances
    }

    /// Returns the smallest unused id, marking it in use, or None when all
    /// instances are taken.
    pub fn allocate(&mut self) -> Option<AdvertiserId> {
        let end = self.first_id as usize + self.num_instances;
        let mut id = self.first_id as usize;
        while id < end && self.sets.contains_key(&(id as AdvertiserId)) {
            id += 1;
        }
        if id == end {
            warn!("Number of max instances {} reached", self.num_instances);
            return None;
        }
        let id = id as AdvertiserId;
        let advertiser = Advertiser { in_use: true, ..Default::default() };
        self.sets.insert(id, advertiser);
        Some(id)
    }

    pub fn contains(&self, id: AdvertiserId) -> bool {
        self.sets.contains_key(&id)
    }

    pub fn get(&self, id: AdvertiserId) -> Option<&Advertiser> {
        self.sets.get(&id)
    }

    pub fn get_mut(&mut self, id: AdvertiserId) -> Option<&mut Advertiser> {
        self.sets.get_mut(&id)
    }

    /// Removes the record. The caller is responsible for cancelling timers
    /// and unregistering from the address manager when the registry drains.
    pub fn remove(&mut self, id: AdvertiserId) -> Option<Advertiser> {
        self.id_map.remove(&id);
        self.sets.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn in_use_count(&self) -> usize {
        self.sets.values().filter(|s| s.in_use).count()
    }

    pub fn ids(&self) -> Vec<AdvertiserId> {
        self.sets.keys().cloned().collect()
    }

    pub fn set_reg_id(&mut self, id: AdvertiserId, reg_id: RegId) {
        self.id_map.insert(id, reg_id);
    }

    pub fn reg_id(&self, id: AdvertiserId) -> RegId {
        self.id_map.get(&id).cloned().unwrap_or(crate::adv_manager::REG_ID_LOCAL)
    }
}
