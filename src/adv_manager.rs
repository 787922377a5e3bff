//! LE advertising manager: lifecycle of advertising sets, address privacy
//! rotation, encrypted payload sealing, and controller event handling.

use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use num_traits::clamp;

use crate::address::{
    advertiser_address_type_from_policy, advertiser_address_type_non_connectable, Address,
    AddressPolicy, AddressType, AddressWithType, AdvertiserAddressType, LeAddressManager,
};
use crate::advertiser::{
    AdvertiserRegistry, AdvertisingStatus, ScanCallback, StatusCallback, TerminatedCallback,
};
use crate::alarm::{AlarmService, AlarmToken};
use crate::config::StackConfig;
use crate::controller::ControllerInfo;
use crate::enc::{
    self, KeyMaterialBuilder, KeyStore, BTIF_STORAGE_KEY_ENCR_DATA, ENC_KEY_MATERIAL_LEN,
    STORAGE_SECTION_ADAPTER,
};
use crate::gap_data::{
    data_has_flags, data_types, flags, fragment_bytes, fragment_elements, serialize_elements,
    GapData, Operation, FLAGS_LEN, LEGACY_ADV_DATA_LEN_MAX, LE_MAX_FRAGMENT_LENGTH,
    LE_MAX_GAP_DATA_LENGTH,
};
use crate::hci::{
    AdvertiserId, CommandComplete, CommandContext, DurationTicks, EnabledSet, ErrorCode,
    HciCommand, HciDispatcher, RegId, ReturnParams, VseStateChangeReason, INVALID_ADVERTISER_ID,
};

/// reg_id of advertisers not registered through the binder surface.
pub const REG_ID_LOCAL: RegId = 0xff;

pub const CLIENT_ID_JNI: u8 = 0xff;
pub const CLIENT_ID_LE_AUDIO: u8 = 0x01;

// sid must stay in 0x00..0x0f.
const ADVERTISING_SET_ID_MASK: u8 = 0x10;

const TX_POWER_MIN: i64 = -127;
const TX_POWER_MAX: i64 = 20;

/// Which HCI command family drives advertising, selected once at start from
/// the controller capabilities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdvertisingApiType {
    Legacy,
    AndroidVendor,
    Extended,
}

/// Parameters of the periodic advertising train.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeriodicAdvertisingParameters {
    pub enable: bool,
    pub include_adi: bool,
    /// In 1.25 ms units.
    pub min_interval: u16,
    pub max_interval: u16,
    pub include_tx_power: bool,
}

/// Everything needed to start an advertising set.
#[derive(Clone)]
pub struct AdvertisingConfig {
    pub advertisement: Vec<GapData>,
    pub scan_response: Vec<GapData>,
    pub periodic_data: Vec<GapData>,
    pub advertisement_enc: Vec<GapData>,
    pub scan_response_enc: Vec<GapData>,
    pub periodic_data_enc: Vec<GapData>,
    /// `key(16) ∥ iv(16)`; empty selects the stored adapter material.
    pub enc_key_value: Vec<u8>,
    pub requested_advertiser_address_type: AdvertiserAddressType,
    pub legacy_pdus: bool,
    pub connectable: bool,
    pub scannable: bool,
    pub directed: bool,
    pub high_duty_directed_connectable: bool,
    pub anonymous: bool,
    pub include_tx_power: bool,
    pub discoverable: bool,
    /// In 0.625 ms units.
    pub interval_min: u32,
    pub interval_max: u32,
    pub channel_map: u8,
    pub filter_policy: u8,
    pub tx_power: i8,
    pub peer_address: AddressWithType,
    pub periodic_parameters: PeriodicAdvertisingParameters,
}

impl Default for AdvertisingConfig {
    fn default() -> Self {
        AdvertisingConfig {
            advertisement: vec![],
            scan_response: vec![],
            periodic_data: vec![],
            advertisement_enc: vec![],
            scan_response_enc: vec![],
            periodic_data_enc: vec![],
            enc_key_value: vec![],
            requested_advertiser_address_type: AdvertiserAddressType::ResolvableRandom,
            legacy_pdus: false,
            connectable: false,
            scannable: false,
            directed: false,
            high_duty_directed_connectable: false,
            anonymous: false,
            include_tx_power: false,
            discoverable: true,
            interval_min: 0x20,
            interval_max: 0x40,
            channel_map: 0x07,
            filter_policy: 0x00,
            tx_power: 0,
            peer_address: AddressWithType::EMPTY,
            periodic_parameters: PeriodicAdvertisingParameters::default(),
        }
    }
}

// Legacy PDU advertising types.
const ADV_IND: u8 = 0x00;
const ADV_DIRECT_IND_HIGH: u8 = 0x01;
const ADV_SCAN_IND: u8 = 0x02;
const ADV_NONCONN_IND: u8 = 0x03;
const ADV_DIRECT_IND_LOW: u8 = 0x04;

impl AdvertisingConfig {
    fn legacy_advertising_type(&self) -> u8 {
        if self.connectable && self.directed {
            if self.high_duty_directed_connectable {
                ADV_DIRECT_IND_HIGH
            } else {
                ADV_DIRECT_IND_LOW
            }
        } else if self.scannable && !self.connectable {
            ADV_SCAN_IND
        } else if !self.scannable && !self.connectable {
            ADV_NONCONN_IND
        } else {
            ADV_IND
        }
    }

    /// Whether the creation flow writes scan response data, matching the
    /// legacy ADV_IND / ADV_NONCONN_IND gate.
    fn wants_scan_response(&self) -> bool {
        matches!(self.legacy_advertising_type(), ADV_IND | ADV_NONCONN_IND)
    }
}

/// Client-facing advertising callbacks.
pub trait AdvertisingCallbacks {
    fn on_advertising_set_started(
        &mut self,
        reg_id: RegId,
        advertiser_id: AdvertiserId,
        tx_power: i8,
        status: AdvertisingStatus,
    );
    fn on_advertising_enabled(
        &mut self,
        advertiser_id: AdvertiserId,
        enable: bool,
        status: AdvertisingStatus,
    );
    fn on_advertising_data_set(&mut self, advertiser_id: AdvertiserId, status: AdvertisingStatus);
    fn on_scan_response_data_set(
        &mut self,
        advertiser_id: AdvertiserId,
        status: AdvertisingStatus,
    );
    fn on_advertising_parameters_updated(
        &mut self,
        advertiser_id: AdvertiserId,
        tx_power: i8,
        status: AdvertisingStatus,
    );
    fn on_periodic_advertising_parameters_updated(
        &mut self,
        advertiser_id: AdvertiserId,
        status: AdvertisingStatus,
    );
    fn on_periodic_advertising_data_set(
        &mut self,
        advertiser_id: AdvertiserId,
        status: AdvertisingStatus,
    );
    fn on_periodic_advertising_enabled(
        &mut self,
        advertiser_id: AdvertiserId,
        enable: bool,
        status: AdvertisingStatus,
    );
    fn on_own_address_read(
        &mut self,
        advertiser_id: AdvertiserId,
        address_type: AddressType,
        address: Address,
    );
}

/// Fires when the encrypted-advertising key material becomes available.
pub trait EncKeyMaterialCallback {
    fn on_enc_key_material(&mut self, key_iv: Vec<u8>);
}

pub struct AdvertiseManager {
    hci: Arc<Mutex<HciDispatcher>>,
    address_manager: Arc<Mutex<LeAddressManager>>,
    alarms: AlarmService,
    key_store: Box<dyn KeyStore + Send>,
    controller: ControllerInfo,
    config: StackConfig,

    callbacks: Option<Box<dyn AdvertisingCallbacks + Send>>,
    enc_key_callback: Option<Box<dyn EncKeyMaterialCallback + Send>>,

    sets: AdvertiserRegistry,
    enabled_sets: Vec<Option<EnabledSet>>,
    api_type: AdvertisingApiType,
    le_maximum_advertising_data_length: usize,
    le_physical_channel_tx_power: i8,
    le_tx_path_loss_comp: i8,
    paused: bool,
    address_manager_registered: bool,
    key_material_builder: Option<KeyMaterialBuilder>,
}

impl AdvertiseManager {
    pub fn new(
        hci: Arc<Mutex<HciDispatcher>>,
        address_manager: Arc<Mutex<LeAddressManager>>,
        alarms: AlarmService,
        key_store: Box<dyn KeyStore + Send>,
        controller: ControllerInfo,
        config: StackConfig,
    ) -> Self {
        let (api_type, first_id, num_instances) = if controller.supports_ble_extended_advertising {
            (
                AdvertisingApiType::Extended,
                0,
                controller.le_number_of_supported_advertising_sets as usize,
            )
        } else if controller.supports_multi_advertising {
            // Vendor multi-advertising handles start from 1.
            (AdvertisingApiType::AndroidVendor, 1, controller.vendor_max_advt_instances as usize)
        } else {
            (AdvertisingApiType::Legacy, 0, 1)
        };

        let le_tx_path_loss_comp = config.tx_path_loss_compensation();
        let le_maximum_advertising_data_length =
            controller.le_maximum_advertising_data_length as usize;
        let enabled_sets = vec![None; first_id as usize + num_instances];

        let mut manager = AdvertiseManager {
            hci,
            address_manager,
            alarms,
            key_store,
            controller,
            config,
            callbacks: None,
            enc_key_callback: None,
            sets: AdvertiserRegistry::new(first_id, num_instances),
            enabled_sets,
            api_type,
            le_maximum_advertising_data_length,
            le_physical_channel_tx_power: 0,
            le_tx_path_loss_comp,
            paused: false,
            address_manager_registered: false,
            key_material_builder: None,
        };

        if manager.api_type == AdvertisingApiType::Legacy {
            manager.enqueue(
                HciCommand::LeReadAdvertisingPhysicalChannelTxPower,
                CommandContext::ReadChannelTxPower,
            );
        }
        manager
    }

    pub fn register_callbacks(&mut self, callbacks: Box<dyn AdvertisingCallbacks + Send>) {
        self.callbacks = Some(callbacks);
    }

    pub fn register_enc_key_material_callback(
        &mut self,
        callback: Box<dyn EncKeyMaterialCallback + Send>,
    ) {
        self.enc_key_callback = Some(callback);
    }

    pub fn advertising_api_type(&self) -> AdvertisingApiType {
        self.api_type
    }

    pub fn number_of_advertising_instances(&self) -> usize {
        self.sets.num_instances()
    }

    pub fn number_of_advertising_instances_in_use(&self) -> usize {
        self.sets.in_use_count()
    }

    fn enqueue(&self, cmd: HciCommand, context: CommandContext) {
        self.hci.lock().unwrap().enqueue(cmd, context);
    }

    fn get_tx_power_after_calibration(&self, tx_power: i8) -> i8 {
        if self.le_tx_path_loss_comp == 0 {
            return tx_power;
        }
        let mut calibrated = tx_power;
        let number = tx_power as i64 + self.le_tx_path_loss_comp as i64;
        if !(TX_POWER_MIN..=TX_POWER_MAX).contains(&number) {
            error!("Invalid number for calibrated tx power: {}", number);
        } else {
            calibrated = number as i8;
        }
        info!("tx_power: {}, calibrated_tx_power: {}", tx_power, calibrated);
        calibrated
    }

    fn single_element_limit(&self) -> usize {
        if self.config.flags.divide_long_single_gap_data {
            LE_MAX_GAP_DATA_LENGTH
        } else {
            LE_MAX_FRAGMENT_LENGTH
        }
    }

    fn check_advertising_data(&self, data: &[GapData], include_flags: bool) -> bool {
        let mut data_len: usize = data.iter().map(GapData::size).sum();
        // The FLAGS element inserted by set_data must be counted here.
        if include_flags && !data_has_flags(data) {
            data_len += FLAGS_LEN;
        }
        if data_len > self.le_maximum_advertising_data_length {
            warn!(
                "advertising data len {} exceeds le_maximum_advertising_data_length {}",
                data_len, self.le_maximum_advertising_data_length
            );
            return false;
        }
        true
    }

    fn check_extended_advertising_data(&self, data: &[GapData], include_flags: bool) -> bool {
        let limit = self.single_element_limit();
        for element in data {
            if element.size() > limit {
                warn!("AD data len shall not greater than {}", limit);
                return false;
            }
        }
        self.check_advertising_data(data, include_flags)
    }

    fn start_advertising_fail(&mut self, reg_id: RegId, status: AdvertisingStatus) {
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_advertising_set_started(reg_id, INVALID_ADVERTISER_ID, 0, status);
        }
    }

    /// Allocates an advertiser id without starting anything on it.
    pub fn register_advertiser(&mut self) -> Result<AdvertiserId, AdvertisingStatus> {
        self.sets.allocate().ok_or(AdvertisingStatus::TooManyAdvertisers)
    }

    /// Reports the set's current own address through the callbacks.
    pub fn get_own_address(&mut self, advertiser_id: AdvertiserId) {
        let address = match self.sets.get(advertiser_id) {
            Some(adv) => adv.address(),
            None => {
                info!("Unknown advertising id {}", advertiser_id);
                return;
            }
        };
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_own_address_read(advertiser_id, address.address_type, address.address);
        }
    }

    /// Starts advertising on a pre-allocated set with one-shot local
    /// status/timeout callbacks instead of the registered callback surface.
    #[allow(clippy::too_many_arguments)]
    pub fn start_advertising(
        &mut self,
        advertiser_id: AdvertiserId,
        config: AdvertisingConfig,
        duration: DurationTicks,
        status_callback: StatusCallback,
        timeout_callback: StatusCallback,
        scan_callback: Option<ScanCallback>,
        terminated_callback: Option<TerminatedCallback>,
    ) {
        if let Some(adv) = self.sets.get_mut(advertiser_id) {
            adv.status_callback = Some(status_callback);
            adv.timeout_callback = Some(timeout_callback);
        } else {
            warn!("start_advertising on unknown set {}", advertiser_id);
            return;
        }
        self.create_extended_advertiser_with_id(
            CLIENT_ID_JNI,
            REG_ID_LOCAL,
            advertiser_id,
            config,
            scan_callback,
            terminated_callback,
            duration,
            0,
        );
    }

    /// Upgrades a legacy request whose payload cannot fit a legacy PDU to
    /// extended advertising, when the controller can take it.
    fn can_upgrade(&self, config: &mut AdvertisingConfig) -> bool {
        if config.legacy_pdus
            && self.controller.supports_ble_extended_advertising
            && crate::gap_data::total_serialized_length(
                &config.advertisement,
                config.connectable && config.discoverable,
            ) > LEGACY_ADV_DATA_LEN_MAX
        {
            info!("Auto upgrading advertisement to extended");
            config.legacy_pdus = false;
            return true;
        }
        false
    }

    /// Creates a set and drives it all the way to enabled. Results arrive
    /// via `on_advertising_set_started`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_extended_advertiser(
        &mut self,
        client_id: u8,
        reg_id: RegId,
        mut config: AdvertisingConfig,
        scan_callback: Option<ScanCallback>,
        terminated_callback: Option<TerminatedCallback>,
        duration: DurationTicks,
        max_ext_adv_events: u8,
    ) {
        self.can_upgrade(&mut config);
        if self.api_type == AdvertisingApiType::Extended {
            if config.directed && config.peer_address == AddressWithType::EMPTY {
                info!("Peer address can not be empty for directed advertising");
                self.start_advertising_fail(reg_id, AdvertisingStatus::InternalError);
                return;
            }
            if config.channel_map == 0 {
                info!("At least one channel must be set in the map");
                self.start_advertising_fail(reg_id, AdvertisingStatus::InternalError);
                return;
            }
            if !config.legacy_pdus {
                if config.connectable && config.scannable {
                    info!("Extended advertising PDUs can not be connectable and scannable");
                    self.start_advertising_fail(reg_id, AdvertisingStatus::InternalError);
                    return;
                }
                if config.high_duty_directed_connectable {
                    info!("Extended advertising PDUs can not be high duty cycle");
                    self.start_advertising_fail(reg_id, AdvertisingStatus::InternalError);
                    return;
                }
            }
            if config.interval_min > config.interval_max {
                info!(
                    "Advertising interval: min ({}) > max ({})",
                    config.interval_min, config.interval_max
                );
                self.start_advertising_fail(reg_id, AdvertisingStatus::InternalError);
                return;
            }
        } else if config.peer_address == AddressWithType::EMPTY
            && matches!(config.legacy_advertising_type(), ADV_DIRECT_IND_HIGH | ADV_DIRECT_IND_LOW)
        {
            warn!("Peer address can not be empty for directed advertising");
            self.start_advertising_fail(reg_id, AdvertisingStatus::InternalError);
            return;
        }

        let id = match self.sets.allocate() {
            Some(id) => id,
            None => {
                warn!("Number of max instances reached");
                self.start_advertising_fail(reg_id, AdvertisingStatus::TooManyAdvertisers);
                return;
            }
        };
        self.create_extended_advertiser_with_id(
            client_id,
            reg_id,
            id,
            config,
            scan_callback,
            terminated_callback,
            duration,
            max_ext_adv_events,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn create_extended_advertiser_with_id(
        &mut self,
        client_id: u8,
        reg_id: RegId,
        id: AdvertiserId,
        config: AdvertisingConfig,
        scan_callback: Option<ScanCallback>,
        terminated_callback: Option<TerminatedCallback>,
        duration: DurationTicks,
        max_ext_adv_events: u8,
    ) {
        self.sets.set_reg_id(id, reg_id);

        if self.api_type != AdvertisingApiType::Extended {
            self.create_advertiser_with_id(reg_id, id, config, scan_callback, terminated_callback);
            return;
        }

        let include_flags = config.connectable && config.discoverable;
        if !self.check_extended_advertising_data(&config.advertisement, include_flags)
            || !self.check_extended_advertising_data(&config.advertisement_enc, include_flags)
            || !self.check_extended_advertising_data(&config.scan_response, false)
            || !self.check_extended_advertising_data(&config.scan_response_enc, false)
        {
            let tx_power = self.le_physical_channel_tx_power;
            if let Some(cb) = self.callbacks.as_mut() {
                cb.on_advertising_set_started(reg_id, id, tx_power, AdvertisingStatus::DataTooLarge);
            }
            self.reset_advertiser(id);
            return;
        }

        if !self.address_manager_registered {
            self.address_manager.lock().unwrap().register_client();
            self.address_manager_registered = true;
        }

        let policy = self.address_manager.lock().unwrap().address_policy();
        let address_type = if self.config.flags.nrpa_non_connectable_adv && !config.connectable {
            advertiser_address_type_non_connectable(
                config.requested_advertiser_address_type,
                policy,
            )
        } else {
            advertiser_address_type_from_policy(config.requested_advertiser_address_type, policy)
        };

        if let Some(adv) = self.sets.get_mut(id) {
            adv.scan_callback = scan_callback;
            adv.terminated_callback = terminated_callback;
            adv.duration = duration;
            adv.max_extended_advertising_events = max_ext_adv_events;
            adv.requested_address_type = Some(config.requested_advertiser_address_type);
            adv.address_type = Some(address_type);
        }
        let current_address = self.new_advertiser_address(address_type);
        if let Some(adv) = self.sets.get_mut(id) {
            adv.current_address = Some(current_address);
        }

        self.set_parameters(id, config.clone());

        if current_address.address_type != AddressType::PublicDeviceAddress {
            // Non-public at the HCI level requires setting the set's random
            // address explicitly.
            self.enqueue(
                HciCommand::LeSetAdvertisingSetRandomAddress {
                    advertising_handle: id,
                    address: current_address.address,
                },
                CommandContext::AdvRandomAddress { id, address: current_address },
            );

            let leaudio_requested_nrpa = client_id == CLIENT_ID_LE_AUDIO
                && address_type == AdvertiserAddressType::NonResolvableRandom;
            if leaudio_requested_nrpa {
                info!("Advertiser started by le audio client with address type {:?}", address_type);
            }

            // Only rotate non-public types, and not the NRPA LeAudio asked
            // for.
            if address_type != AdvertiserAddressType::Public && !leaudio_requested_nrpa {
                let interval = self.address_manager.lock().unwrap().next_private_address_interval();
                self.alarms.schedule(AlarmToken::AddressRotation(id), interval);
            }
        }

        if config.wants_scan_response() {
            self.set_enc_data(id, true, config.scan_response.clone(), config.scan_response_enc.clone());
        }
        self.set_enc_data(id, false, config.advertisement.clone(), config.advertisement_enc.clone());

        if !config.periodic_data.is_empty() || !config.periodic_data_enc.is_empty() {
            self.set_periodic_parameters(id, config.periodic_parameters);
            self.set_periodic_enc_data(id, config.periodic_data.clone(), config.periodic_data_enc.clone());
            if config.periodic_data_enc.is_empty() {
                self.enable_periodic_advertising(
                    id,
                    config.periodic_parameters.enable,
                    config.periodic_parameters.include_adi,
                );
            }
        }

        if config.advertisement_enc.is_empty() && config.scan_response_enc.is_empty() {
            if !self.paused {
                self.enable_advertiser(id, true, duration, max_ext_adv_events);
            } else {
                self.enabled_sets[id as usize] = Some(EnabledSet {
                    advertising_handle: id,
                    duration,
                    max_extended_advertising_events: max_ext_adv_events,
                });
            }
        }
    }

    /// Legacy / vendor creation path.
    fn create_advertiser_with_id(
        &mut self,
        reg_id: RegId,
        id: AdvertiserId,
        config: AdvertisingConfig,
        scan_callback: Option<ScanCallback>,
        terminated_callback: Option<TerminatedCallback>,
    ) {
        let include_flags = config.connectable && config.discoverable;
        if !self.check_advertising_data(&config.advertisement, include_flags)
            || !self.check_advertising_data(&config.scan_response, false)
        {
            let tx_power = self.le_physical_channel_tx_power;
            if let Some(cb) = self.callbacks.as_mut() {
                cb.on_advertising_set_started(reg_id, id, tx_power, AdvertisingStatus::DataTooLarge);
            }
            self.reset_advertiser(id);
            return;
        }

        if !self.address_manager_registered {
            self.address_manager.lock().unwrap().register_client();
            self.address_manager_registered = true;
        }

        let policy = self.address_manager.lock().unwrap().address_policy();
        let address_type = if self.config.flags.nrpa_non_connectable_adv && !config.connectable {
            advertiser_address_type_non_connectable(
                config.requested_advertiser_address_type,
                policy,
            )
        } else {
            advertiser_address_type_from_policy(config.requested_advertiser_address_type, policy)
        };
        let current_address = self.new_advertiser_address(address_type);

        if let Some(adv) = self.sets.get_mut(id) {
            adv.scan_callback = scan_callback;
            adv.terminated_callback = terminated_callback;
            adv.requested_address_type = Some(config.requested_advertiser_address_type);
            adv.address_type = Some(address_type);
            adv.current_address = Some(current_address);
        }

        self.set_parameters(id, config.clone());

        if config.wants_scan_response() {
            self.set_enc_data(id, true, config.scan_response.clone(), config.scan_response_enc.clone());
        }
        self.set_enc_data(id, false, config.advertisement.clone(), config.advertisement_enc.clone());

        if self.api_type == AdvertisingApiType::AndroidVendor
            && address_type != AdvertiserAddressType::Public
        {
            self.enqueue(
                HciCommand::LeMultiAdvtSetRandomAddr {
                    advertising_handle: id,
                    address: current_address.address,
                },
                CommandContext::CheckComplete,
            );
        }

        if !self.paused {
            self.enable_advertiser(id, true, DurationTicks::INDEFINITE, 0);
        } else {
            self.enabled_sets[id as usize] = Some(EnabledSet {
                advertising_handle: id,
                duration: DurationTicks::INDEFINITE,
                max_extended_advertising_events: 0,
            });
        }
    }

    /// Generates an address for the advertiser per its effective type.
    fn new_advertiser_address(&self, address_type: AdvertiserAddressType) -> AddressWithType {
        let address_manager = self.address_manager.lock().unwrap();
        match address_type {
            AdvertiserAddressType::Public => {
                if address_manager.address_policy() == AddressPolicy::UseStaticAddress {
                    address_manager.initiator_address()
                } else {
                    AddressWithType::new(
                        self.controller.mac_address,
                        AddressType::PublicDeviceAddress,
                    )
                }
            }
            AdvertiserAddressType::ResolvableRandom => {
                if self.api_type == AdvertisingApiType::Legacy {
                    // Legacy advertising has no per-set random address slot,
                    // so privacy-mode advertisers share the initiator
                    // address.
                    address_manager.initiator_address()
                } else {
                    address_manager.new_resolvable_address()
                }
            }
            AdvertiserAddressType::NonResolvableRandom => {
                address_manager.new_non_resolvable_address()
            }
        }
    }

    /// Updates the set's parameters on the controller and records the
    /// configuration bits the data path depends on.
    pub fn set_parameters(&mut self, advertiser_id: AdvertiserId, mut config: AdvertisingConfig) {
        config.tx_power = self.get_tx_power_after_calibration(config.tx_power);
        let own_address = match self.sets.get_mut(advertiser_id) {
            Some(adv) => {
                adv.is_legacy = config.legacy_pdus;
                adv.connectable = config.connectable;
                adv.scannable = config.scannable;
                adv.discoverable = config.discoverable;
                adv.directed = config.directed;
                adv.anonymous = config.anonymous;
                adv.include_tx_power = config.include_tx_power;
                adv.tx_power = config.tx_power;
                adv.is_periodic = config.periodic_parameters.enable;
                adv.enc_key_value = config.enc_key_value.clone();
                adv.address()
            }
            None => {
                warn!("set_parameters on unknown set {}", advertiser_id);
                return;
            }
        };
        let own_address_type = own_address.address_type as u8;

        match self.api_type {
            AdvertisingApiType::Legacy => {
                self.enqueue(
                    HciCommand::LeSetAdvertisingParameters {
                        interval_min: config.interval_min as u16,
                        interval_max: config.interval_max as u16,
                        advertising_type: config.legacy_advertising_type(),
                        own_address_type,
                        peer_address: config.peer_address,
                        channel_map: config.channel_map,
                        filter_policy: config.filter_policy,
                    },
                    CommandContext::AdvParameters { id: advertiser_id },
                );
            }
            AdvertisingApiType::AndroidVendor => {
                self.enqueue(
                    HciCommand::LeMultiAdvtParam {
                        advertising_handle: advertiser_id,
                        interval_min: config.interval_min as u16,
                        interval_max: config.interval_max as u16,
                        advertising_type: config.legacy_advertising_type(),
                        own_address: own_address.address,
                        own_address_type,
                        peer_address: config.peer_address,
                        channel_map: config.channel_map,
                        filter_policy: config.filter_policy,
                        tx_power: config.tx_power,
                    },
                    CommandContext::AdvParameters { id: advertiser_id },
                );
            }
            AdvertisingApiType::Extended => {
                // No controller supports more than 16 advertisers, so the
                // sid can mirror the id.
                let sid = advertiser_id % ADVERTISING_SET_ID_MASK;
                self.enqueue(
                    HciCommand::LeSetExtendedAdvertisingParameters {
                        advertising_handle: advertiser_id,
                        connectable: config.connectable,
                        scannable: config.scannable,
                        directed: config.directed,
                        high_duty_cycle: config.high_duty_directed_connectable,
                        legacy: config.legacy_pdus,
                        anonymous: config.anonymous,
                        include_tx_power: config.include_tx_power,
                        interval_min: config.interval_min,
                        interval_max: config.interval_max,
                        channel_map: config.channel_map,
                        own_address_type,
                        peer_address: config.peer_address,
                        filter_policy: config.filter_policy,
                        tx_power: config.tx_power,
                        sid,
                        scan_request_notification: false,
                    },
                    CommandContext::AdvParameters { id: advertiser_id },
                );
            }
        }
    }

    /// Plain (unencrypted) data update.
    pub fn set_advertising_data(
        &mut self,
        advertiser_id: AdvertiserId,
        set_scan_rsp: bool,
        data: Vec<GapData>,
    ) {
        self.set_enc_data(advertiser_id, set_scan_rsp, data, vec![]);
    }

    /// Updates advertising or scan response data. When `data_enc` is
    /// non-empty the plaintext is sealed and appended as an
    /// ENCRYPTED_ADVERTISING_DATA element.
    pub fn set_enc_data(
        &mut self,
        advertiser_id: AdvertiserId,
        set_scan_rsp: bool,
        mut data: Vec<GapData>,
        data_enc: Vec<GapData>,
    ) {
        let (connectable, discoverable, duration, tx_power) =
            match self.sets.get_mut(advertiser_id) {
                Some(adv) => {
                    if set_scan_rsp {
                        adv.scan_response = data.clone();
                        adv.scan_response_enc = data_enc.clone();
                    } else {
                        adv.advertisement = data.clone();
                        adv.advertisement_enc = data_enc.clone();
                    }
                    (adv.connectable, adv.discoverable, adv.duration, adv.tx_power)
                }
                None => {
                    warn!("set_enc_data on unknown set {}", advertiser_id);
                    return;
                }
            };

        // The Flags data type shall be included when any of the Flag bits
        // are non-zero and the advertising packet is connectable and
        // discoverable.
        if !set_scan_rsp && connectable && discoverable && !data_has_flags(&data) {
            let flag = if duration.is_indefinite() {
                flags::LE_GENERAL_DISCOVERABLE
            } else {
                flags::LE_LIMITED_DISCOVERABLE
            };
            data.insert(0, GapData::new(data_types::FLAGS, vec![flag]));
        }

        // Find and fill TX Power with the correct value.
        let mut data_enc = data_enc;
        for gap_data in data.iter_mut().chain(data_enc.iter_mut()) {
            if gap_data.data_type == data_types::TX_POWER_LEVEL && !gap_data.data.is_empty() {
                gap_data.data[0] = tx_power as u8;
                break;
            }
        }

        if !data_enc.is_empty() {
            self.encrypted_advertising_complete(advertiser_id, set_scan_rsp, data, data_enc);
            return;
        }

        if self.api_type != AdvertisingApiType::Extended {
            if !self.check_advertising_data(&data, false) {
                self.data_set_failed(advertiser_id, set_scan_rsp, AdvertisingStatus::DataTooLarge);
                return;
            }
            let bytes = serialize_elements(&data);
            let cmd = match (self.api_type, set_scan_rsp) {
                (AdvertisingApiType::Legacy, true) => {
                    HciCommand::LeSetScanResponseData { data: bytes }
                }
                (AdvertisingApiType::Legacy, false) => {
                    HciCommand::LeSetAdvertisingData { data: bytes }
                }
                (_, true) => HciCommand::LeMultiAdvtSetScanResp {
                    advertising_handle: advertiser_id,
                    data: bytes,
                },
                (_, false) => HciCommand::LeMultiAdvtSetData {
                    advertising_handle: advertiser_id,
                    data: bytes,
                },
            };
            self.enqueue(
                cmd,
                CommandContext::AdvData {
                    id: advertiser_id,
                    scan_response: set_scan_rsp,
                    send_callback: true,
                },
            );
            return;
        }

        self.send_extended_data(advertiser_id, set_scan_rsp, data);
    }

    /// Extended-API data write with fragmentation and, for chained data on a
    /// started set, an enable bracket so the controller accepts the update.
    fn send_extended_data(
        &mut self,
        advertiser_id: AdvertiserId,
        set_scan_rsp: bool,
        data: Vec<GapData>,
    ) {
        let limit = self.single_element_limit();
        for element in &data {
            if element.size() > limit {
                warn!("AD data len shall not greater than {}", limit);
                self.data_set_failed(advertiser_id, set_scan_rsp, AdvertisingStatus::InternalError);
                return;
            }
        }

        let (is_legacy, started, connectable, discoverable, duration, max_events) =
            match self.sets.get(advertiser_id) {
                Some(adv) => (
                    adv.is_legacy,
                    adv.started,
                    adv.connectable,
                    adv.discoverable,
                    adv.duration,
                    adv.max_extended_advertising_events,
                ),
                None => return,
            };

        let max_data_length = if self.config.flags.ble_check_data_length_on_legacy_advertising
            && is_legacy
        {
            LEGACY_ADV_DATA_LEN_MAX
        } else {
            self.le_maximum_advertising_data_length
        };
        let data_len: usize = data.iter().map(GapData::size).sum();
        if data_len > max_data_length {
            warn!("advertising data len {} exceeds maxDataLength {}", data_len, max_data_length);
            self.data_set_failed(advertiser_id, set_scan_rsp, AdvertisingStatus::DataTooLarge);
            return;
        }

        let fragments = if self.config.flags.divide_long_single_gap_data {
            fragment_bytes(&serialize_elements(&data), LE_MAX_FRAGMENT_LENGTH)
        } else {
            fragment_elements(&data, LE_MAX_FRAGMENT_LENGTH)
        };

        let chained = {
            let mut total = data_len;
            if connectable && discoverable && !data_has_flags(&data) {
                total += FLAGS_LEN;
            }
            total > LE_MAX_FRAGMENT_LENGTH
        };
        let enabled_set = EnabledSet {
            advertising_handle: advertiser_id,
            duration,
            max_extended_advertising_events: max_events,
        };

        if chained && started {
            self.enqueue(
                HciCommand::LeSetExtendedAdvertisingEnable {
                    enable: false,
                    sets: vec![enabled_set],
                },
                CommandContext::CheckComplete,
            );
        }
        for (operation, bytes) in fragments {
            self.send_data_fragment(advertiser_id, set_scan_rsp, operation, bytes);
        }
        if chained && started {
            self.enqueue(
                HciCommand::LeSetExtendedAdvertisingEnable {
                    enable: true,
                    sets: vec![enabled_set],
                },
                CommandContext::CheckComplete,
            );
        }
    }

    fn send_data_fragment(
        &mut self,
        advertiser_id: AdvertiserId,
        set_scan_rsp: bool,
        operation: Operation,
        bytes: Vec<u8>,
    ) {
        // First and intermediate fragments never surface client callbacks.
        let context = CommandContext::AdvData {
            id: advertiser_id,
            scan_response: set_scan_rsp,
            send_callback: operation.is_final(),
        };
        let cmd = if set_scan_rsp {
            HciCommand::LeSetExtendedScanResponseData {
                advertising_handle: advertiser_id,
                operation,
                data: bytes,
            }
        } else {
            HciCommand::LeSetExtendedAdvertisingData {
                advertising_handle: advertiser_id,
                operation,
                data: bytes,
            }
        };
        self.enqueue(cmd, context);
    }

    fn data_set_failed(
        &mut self,
        advertiser_id: AdvertiserId,
        set_scan_rsp: bool,
        status: AdvertisingStatus,
    ) {
        if let Some(cb) = self.callbacks.as_mut() {
            if set_scan_rsp {
                cb.on_scan_response_data_set(advertiser_id, status);
            } else {
                cb.on_advertising_data_set(advertiser_id, status);
            }
        }
    }

    /// Seals the encrypted payload, appends the EAD element, and writes the
    /// combined data; enables the set afterwards when it is not yet started.
    fn encrypted_advertising_complete(
        &mut self,
        advertiser_id: AdvertiserId,
        set_scan_rsp: bool,
        mut data: Vec<GapData>,
        data_enc: Vec<GapData>,
    ) {
        let sealed = match self.seal_for_advertiser(advertiser_id, &data_enc) {
            Some(sealed) => sealed,
            None => return,
        };
        data.push(sealed);

        if self.api_type != AdvertisingApiType::Extended {
            if !self.check_advertising_data(&data, false) {
                self.data_set_failed(advertiser_id, set_scan_rsp, AdvertisingStatus::DataTooLarge);
                return;
            }
            let bytes = serialize_elements(&data);
            let cmd = match (self.api_type, set_scan_rsp) {
                (AdvertisingApiType::Legacy, true) => {
                    HciCommand::LeSetScanResponseData { data: bytes }
                }
                (AdvertisingApiType::Legacy, false) => {
                    HciCommand::LeSetAdvertisingData { data: bytes }
                }
                (_, true) => HciCommand::LeMultiAdvtSetScanResp {
                    advertising_handle: advertiser_id,
                    data: bytes,
                },
                (_, false) => HciCommand::LeMultiAdvtSetData {
                    advertising_handle: advertiser_id,
                    data: bytes,
                },
            };
            self.enqueue(
                cmd,
                CommandContext::AdvData {
                    id: advertiser_id,
                    scan_response: set_scan_rsp,
                    send_callback: true,
                },
            );
        } else {
            self.send_extended_data(advertiser_id, set_scan_rsp, data);
        }

        let (started, duration, max_events) = match self.sets.get(advertiser_id) {
            Some(adv) => (adv.started, adv.duration, adv.max_extended_advertising_events),
            None => return,
        };
        if !started {
            if !self.paused {
                self.enable_advertiser(advertiser_id, true, duration, max_events);
            } else {
                self.enabled_sets[advertiser_id as usize] = Some(EnabledSet {
                    advertising_handle: advertiser_id,
                    duration,
                    max_extended_advertising_events: max_events,
                });
            }
        }
    }

    /// Regenerates the randomizer and seals `data_enc` under the set's key
    /// material (or the stored adapter material). Fatal on missing keys.
    fn seal_for_advertiser(
        &mut self,
        advertiser_id: AdvertiserId,
        data_enc: &[GapData],
    ) -> Option<GapData> {
        let key_iv = match self.sets.get(advertiser_id) {
            Some(adv) if !adv.enc_key_value.is_empty() => adv.enc_key_value.clone(),
            Some(_) => match self
                .key_store
                .get_bin(STORAGE_SECTION_ADAPTER, BTIF_STORAGE_KEY_ENCR_DATA)
            {
                Some(key_iv) => key_iv,
                None => {
                    error!("Encrypted data configured but no key material stored");
                    return None;
                }
            },
            None => return None,
        };
        if key_iv.len() != ENC_KEY_MATERIAL_LEN {
            error!("Malformed key material ({} bytes)", key_iv.len());
            return None;
        }

        let randomizer = enc::generate_randomizer();
        if let Some(adv) = self.sets.get_mut(advertiser_id) {
            adv.randomizer = randomizer;
        }
        match enc::seal(&key_iv, &randomizer, data_enc) {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                error!("Failed to seal advertising data: {}", e);
                None
            }
        }
    }

    /// Enables or disables the set. Disabling cancels the rotation alarm.
    pub fn enable_advertiser(
        &mut self,
        advertiser_id: AdvertiserId,
        enable: bool,
        duration: DurationTicks,
        max_extended_advertising_events: u8,
    ) {
        if !self.sets.contains(advertiser_id) {
            warn!("No advertising set with key: {}", advertiser_id);
            return;
        }
        let curr_set = EnabledSet {
            advertising_handle: advertiser_id,
            duration,
            max_extended_advertising_events,
        };
        let sets = vec![curr_set];

        let cmd = match self.api_type {
            AdvertisingApiType::Legacy => HciCommand::LeSetAdvertisingEnable { enable },
            AdvertisingApiType::AndroidVendor => {
                HciCommand::LeMultiAdvtSetEnable { advertising_handle: advertiser_id, enable }
            }
            AdvertisingApiType::Extended => {
                HciCommand::LeSetExtendedAdvertisingEnable { enable, sets: sets.clone() }
            }
        };
        self.enqueue(cmd, CommandContext::AdvEnable { enable, sets, trigger_callbacks: true });

        if enable {
            self.enabled_sets[advertiser_id as usize] = Some(curr_set);
            if let Some(adv) = self.sets.get_mut(advertiser_id) {
                adv.duration = duration;
                adv.max_extended_advertising_events = max_extended_advertising_events;
            }
        } else {
            self.enabled_sets[advertiser_id as usize] = None;
            self.alarms.cancel(AlarmToken::AddressRotation(advertiser_id));
        }
    }

    pub fn set_periodic_parameters(
        &mut self,
        advertiser_id: AdvertiserId,
        parameters: PeriodicAdvertisingParameters,
    ) {
        self.enqueue(
            HciCommand::LeSetPeriodicAdvertisingParameters {
                advertising_handle: advertiser_id,
                interval_min: parameters.min_interval,
                interval_max: parameters.max_interval,
                include_tx_power: parameters.include_tx_power,
            },
            CommandContext::PeriodicParameters { id: advertiser_id },
        );
    }

    pub fn set_periodic_data(&mut self, advertiser_id: AdvertiserId, data: Vec<GapData>) {
        self.set_periodic_enc_data(advertiser_id, data, vec![]);
    }

    pub fn set_periodic_enc_data(
        &mut self,
        advertiser_id: AdvertiserId,
        data: Vec<GapData>,
        data_enc: Vec<GapData>,
    ) {
        match self.sets.get_mut(advertiser_id) {
            Some(adv) => {
                adv.periodic_data = data.clone();
                adv.periodic_data_enc = data_enc.clone();
            }
            None => {
                warn!("set_periodic_enc_data on unknown set {}", advertiser_id);
                return;
            }
        }

        if !data_enc.is_empty() {
            self.encrypted_periodic_advertising_complete(advertiser_id, data, data_enc);
            return;
        }
        self.send_periodic_data(advertiser_id, data);
    }

    fn send_periodic_data(&mut self, advertiser_id: AdvertiserId, data: Vec<GapData>) {
        let limit = self.single_element_limit();
        for element in &data {
            if element.size() > limit {
                warn!("AD data len shall not greater than {}", limit);
                self.periodic_data_set_failed(advertiser_id, AdvertisingStatus::InternalError);
                return;
            }
        }
        let data_len: usize = data.iter().map(GapData::size).sum();
        if data_len > self.le_maximum_advertising_data_length {
            warn!(
                "advertising data len exceeds le_maximum_advertising_data_length {}",
                self.le_maximum_advertising_data_length
            );
            self.periodic_data_set_failed(advertiser_id, AdvertisingStatus::DataTooLarge);
            return;
        }

        let fragments = if self.config.flags.divide_long_single_gap_data {
            fragment_bytes(&serialize_elements(&data), LE_MAX_FRAGMENT_LENGTH)
        } else {
            fragment_elements(&data, LE_MAX_FRAGMENT_LENGTH)
        };
        for (operation, bytes) in fragments {
            self.enqueue(
                HciCommand::LeSetPeriodicAdvertisingData {
                    advertising_handle: advertiser_id,
                    operation,
                    data: bytes,
                },
                CommandContext::PeriodicData {
                    id: advertiser_id,
                    send_callback: operation.is_final(),
                },
            );
        }
    }

    fn encrypted_periodic_advertising_complete(
        &mut self,
        advertiser_id: AdvertiserId,
        mut data: Vec<GapData>,
        data_enc: Vec<GapData>,
    ) {
        let sealed = match self.seal_for_advertiser(advertiser_id, &data_enc) {
            Some(sealed) => sealed,
            None => return,
        };
        data.push(sealed);

        let (started, include_adi) = match self.sets.get(advertiser_id) {
            Some(adv) => (adv.started, adv.include_adi),
            None => return,
        };
        let data_len: usize = data.iter().map(GapData::size).sum();
        let chained = data_len > LE_MAX_FRAGMENT_LENGTH;

        // Chained periodic data cannot be replaced while the train runs.
        if chained && started {
            self.enable_periodic_advertising(advertiser_id, false, include_adi);
        }
        self.send_periodic_data(advertiser_id, data);
        if chained && started {
            self.enable_periodic_advertising(advertiser_id, true, include_adi);
        }
        if !started {
            self.enable_periodic_advertising(advertiser_id, true, include_adi);
        }
    }

    fn periodic_data_set_failed(&mut self, advertiser_id: AdvertiserId, status: AdvertisingStatus) {
        if let Some(cb) = self.callbacks.as_mut() {
            cb.on_periodic_advertising_data_set(advertiser_id, status);
        }
    }

    /// Enables or disables the periodic train. Silently ignored on
    /// controllers without periodic advertising support; ADI is dropped when
    /// unsupported.
    pub fn enable_periodic_advertising(
        &mut self,
        advertiser_id: AdvertiserId,
        enable: bool,
        mut include_adi: bool,
    ) {
        if !self.controller.supports_ble_periodic_advertising {
            return;
        }
        if include_adi && !self.controller.supports_ble_periodic_advertising_adi {
            include_adi = false;
        }
        if let Some(adv) = self.sets.get_mut(advertiser_id) {
            adv.include_adi = include_adi;
        }
        self.enqueue(
            HciCommand::LeSetPeriodicAdvertisingEnable {
                advertising_handle: advertiser_id,
                enable,
                include_adi,
            },
            CommandContext::PeriodicEnable { id: advertiser_id, enable },
        );
    }

    /// Disables the set (and its periodic train) without touching the
    /// record.
    pub fn stop_advertising(&mut self, advertiser_id: AdvertiserId) {
        if !self.sets.contains(advertiser_id) {
            info!("Unknown advertising set {}", advertiser_id);
            return;
        }
        match self.api_type {
            AdvertisingApiType::Legacy => {
                self.enqueue(
                    HciCommand::LeSetAdvertisingEnable { enable: false },
                    CommandContext::CheckComplete,
                );
            }
            AdvertisingApiType::AndroidVendor => {
                self.enqueue(
                    HciCommand::LeMultiAdvtSetEnable {
                        advertising_handle: advertiser_id,
                        enable: false,
                    },
                    CommandContext::CheckComplete,
                );
            }
            AdvertisingApiType::Extended => {
                let curr_set = EnabledSet {
                    advertising_handle: advertiser_id,
                    duration: DurationTicks::INDEFINITE,
                    max_extended_advertising_events: 0,
                };
                self.enqueue(
                    HciCommand::LeSetExtendedAdvertisingEnable {
                        enable: false,
                        sets: vec![curr_set],
                    },
                    CommandContext::CheckComplete,
                );
                let is_periodic = self.sets.get(advertiser_id).map_or(false, |s| s.is_periodic);
                debug!("advertiser_id: {} is_periodic: {}", advertiser_id, is_periodic);
                if is_periodic && self.controller.supports_ble_periodic_advertising {
                    self.enqueue(
                        HciCommand::LeSetPeriodicAdvertisingEnable {
                            advertising_handle: advertiser_id,
                            enable: false,
                            include_adi: false,
                        },
                        CommandContext::CheckComplete,
                    );
                }
            }
        }
        self.enabled_sets[advertiser_id as usize] = None;
    }

    /// Stops and destroys the set, releasing the controller instance.
    pub fn remove_advertiser(&mut self, advertiser_id: AdvertiserId) {
        self.stop_advertising(advertiser_id);
        if !self.sets.contains(advertiser_id) {
            return;
        }
        if self.api_type == AdvertisingApiType::Extended {
            self.enqueue(
                HciCommand::LeRemoveAdvertisingSet { advertising_handle: advertiser_id },
                CommandContext::CheckComplete,
            );
        }
        self.alarms.cancel(AlarmToken::AddressRotation(advertiser_id));
        self.sets.remove(advertiser_id);
        self.maybe_unregister_address_manager();
    }

    /// Destroys the record without issuing HCI, for sets whose start failed.
    pub fn reset_advertiser(&mut self, advertiser_id: AdvertiserId) {
        if !self.sets.contains(advertiser_id) {
            return;
        }
        if self.api_type == AdvertisingApiType::Extended {
            self.enabled_sets[advertiser_id as usize] = None;
            self.alarms.cancel(AlarmToken::AddressRotation(advertiser_id));
        }
        self.sets.remove(advertiser_id);
        self.maybe_unregister_address_manager();
    }

    fn maybe_unregister_address_manager(&mut self) {
        if self.sets.is_empty() && self.address_manager_registered {
            self.address_manager.lock().unwrap().unregister_client();
            self.address_manager_registered = false;
            self.paused = false;
        }
    }

    // ---- address rotation ----

    fn rotate_advertiser_address(&mut self, advertiser_id: AdvertiserId) {
        if self.api_type != AdvertisingApiType::Extended {
            return;
        }
        let address_type = match self.sets.get(advertiser_id).and_then(|s| s.address_type) {
            Some(t) => t,
            None => return,
        };
        let address_with_type = self.new_advertiser_address(address_type);
        self.enqueue(
            HciCommand::LeSetAdvertisingSetRandomAddress {
                advertising_handle: advertiser_id,
                address: address_with_type.address,
            },
            CommandContext::AdvRandomAddress { id: advertiser_id, address: address_with_type },
        );
    }

    /// Re-seals and re-writes whichever payloads carry encrypted content,
    /// e.g. after an address rotation.
    fn set_encrypted_advertiser_data(&mut self, advertiser_id: AdvertiserId) {
        let (adv, adv_enc, scan, scan_enc, periodic, periodic_enc) =
            match self.sets.get(advertiser_id) {
                Some(s) => (
                    s.advertisement.clone(),
                    s.advertisement_enc.clone(),
                    s.scan_response.clone(),
                    s.scan_response_enc.clone(),
                    s.periodic_data.clone(),
                    s.periodic_data_enc.clone(),
                ),
                None => return,
            };

        if !adv_enc.is_empty() {
            debug!("Encrypted Advertisement");
            self.set_enc_data(advertiser_id, false, adv, adv_enc);
            self.set_enc_data(advertiser_id, true, scan, scan_enc);
            if !periodic_enc.is_empty() {
                debug!("Encrypted Periodic");
                self.set_periodic_enc_data(advertiser_id, periodic, periodic_enc);
            }
        } else if !scan_enc.is_empty() {
            debug!("Encrypted Scan Response");
            self.set_enc_data(advertiser_id, true, scan, scan_enc);
        } else if !periodic_enc.is_empty() {
            debug!("Encrypted Periodic Only");
            self.set_periodic_enc_data(advertiser_id, periodic, periodic_enc);
        }
    }

    /// The rotation alarm fired. All commands are enqueued synchronously so
    /// the whole sequence precedes any later OnResume work; OnResume can
    /// never re-enable in the middle of this sequence for the same reason.
    fn on_address_rotation_alarm(&mut self, advertiser_id: AdvertiserId) {
        if self.enabled_sets.get(advertiser_id as usize).map_or(true, |s| s.is_none()) {
            // The set is no longer enabled; drop the alarm.
            self.alarms.cancel(AlarmToken::AddressRotation(advertiser_id));
            return;
        }
        let (connectable, duration, max_events, has_enc) = match self.sets.get(advertiser_id) {
            Some(adv) => (
                adv.connectable,
                adv.duration,
                adv.max_extended_advertising_events,
                !adv.advertisement_enc.is_empty()
                    || !adv.scan_response_enc.is_empty()
                    || !adv.periodic_data_enc.is_empty(),
            ),
            None => return,
        };
        let enabled_set = EnabledSet {
            advertising_handle: advertiser_id,
            duration,
            max_extended_advertising_events: max_events,
        };

        // Connectable sets must not change their address while enabled.
        if connectable {
            self.enqueue(
                HciCommand::LeSetExtendedAdvertisingEnable {
                    enable: false,
                    sets: vec![enabled_set],
                },
                CommandContext::CheckComplete,
            );
        }

        self.rotate_advertiser_address(advertiser_id);

        if has_enc {
            self.set_encrypted_advertiser_data(advertiser_id);
        }

        // If we are paused, OnResume re-enables through the normal path.
        if connectable && !self.paused {
            self.enqueue(
                HciCommand::LeSetExtendedAdvertisingEnable {
                    enable: true,
                    sets: vec![enabled_set],
                },
                CommandContext::CheckComplete,
            );
        }

        let interval = self.address_manager.lock().unwrap().next_private_address_interval();
        self.alarms.schedule(AlarmToken::AddressRotation(advertiser_id), interval);
    }

    /// Entry point for fired alarms routed by the stack.
    pub fn on_alarm(&mut self, token: AlarmToken) {
        self.alarms.on_fired(token);
        if let AlarmToken::AddressRotation(id) = token {
            self.on_address_rotation_alarm(id);
        }
    }

    // ---- pause / resume / IRK ----

    fn currently_enabled_sets(&self) -> Vec<EnabledSet> {
        self.enabled_sets.iter().flatten().cloned().collect()
    }

    /// The address manager is about to refresh its own random address; stop
    /// advertising on every enabled set and acknowledge.
    pub fn on_pause(&mut self) {
        if !self.address_manager_registered {
            warn!("Unregistered!");
            return;
        }
        self.paused = true;
        if !self.sets.is_empty() {
            let enabled_sets = self.currently_enabled_sets();
            match self.api_type {
                AdvertisingApiType::Legacy => {
                    self.enqueue(
                        HciCommand::LeSetAdvertisingEnable { enable: false },
                        CommandContext::CheckComplete,
                    );
                }
                AdvertisingApiType::AndroidVendor => {
                    for set in &enabled_sets {
                        self.enqueue(
                            HciCommand::LeMultiAdvtSetEnable {
                                advertising_handle: set.advertising_handle,
                                enable: false,
                            },
                            CommandContext::CheckComplete,
                        );
                    }
                }
                AdvertisingApiType::Extended => {
                    if !enabled_sets.is_empty() {
                        self.enqueue(
                            HciCommand::LeSetExtendedAdvertisingEnable {
                                enable: false,
                                sets: enabled_sets,
                            },
                            CommandContext::CheckComplete,
                        );
                    }
                }
            }
        }
        self.address_manager.lock().unwrap().ack_pause();
    }

    /// Re-enables exactly the sets that were enabled at pause time and
    /// acknowledges.
    pub fn on_resume(&mut self) {
        if !self.address_manager_registered {
            warn!("Unregistered!");
            return;
        }
        self.paused = false;
        if !self.sets.is_empty() {
            let enabled_sets = self.currently_enabled_sets();
            match self.api_type {
                AdvertisingApiType::Legacy => {
                    self.enqueue(
                        HciCommand::LeSetAdvertisingEnable { enable: true },
                        CommandContext::AdvEnable {
                            enable: true,
                            sets: enabled_sets,
                            trigger_callbacks: false,
                        },
                    );
                }
                AdvertisingApiType::AndroidVendor => {
                    for set in &enabled_sets {
                        self.enqueue(
                            HciCommand::LeMultiAdvtSetEnable {
                                advertising_handle: set.advertising_handle,
                                enable: true,
                            },
                            CommandContext::AdvEnable {
                                enable: true,
                                sets: vec![*set],
                                trigger_callbacks: false,
                            },
                        );
                    }
                }
                AdvertisingApiType::Extended => {
                    if !enabled_sets.is_empty() {
                        self.enqueue(
                            HciCommand::LeSetExtendedAdvertisingEnable {
                                enable: true,
                                sets: enabled_sets.clone(),
                            },
                            CommandContext::AdvEnable {
                                enable: true,
                                sets: enabled_sets,
                                trigger_callbacks: false,
                            },
                        );
                    }
                }
            }
        }
        self.address_manager.lock().unwrap().ack_resume();
    }

    /// The IRK changed: rotate every enabled set's address synchronously.
    /// The dispatcher's FIFO ordering guarantees later IRK-dependent work
    /// sees the new addresses; no ack protocol is needed.
    pub fn on_irk_change(&mut self) {
        for id in 0..self.enabled_sets.len() {
            if self.enabled_sets[id].is_some() {
                self.rotate_advertiser_address(id as AdvertiserId);
            }
        }
    }

    // ---- controller events ----

    pub fn handle_set_terminated(
        &mut self,
        status: ErrorCode,
        advertiser_id: AdvertiserId,
        connection_handle: u16,
    ) {
        // The Core spec states this event shall not be sent when the Host
        // disables the set, so a cancelled-by-host status is noise.
        if status == ErrorCode::OperationCancelledByHost {
            warn!("Unexpected advertising set terminated event status: {:?}", status);
            return;
        }
        if !self.sets.contains(advertiser_id) {
            info!("Unknown advertising set {}", advertiser_id);
            return;
        }

        let was_rotating = self.alarms.is_scheduled(AlarmToken::AddressRotation(advertiser_id));
        self.alarms.cancel(AlarmToken::AddressRotation(advertiser_id));
        self.enabled_sets[advertiser_id as usize] = None;

        let reg_id = self.sets.reg_id(advertiser_id);
        let (directed, duration, max_events) = {
            let adv = self.sets.get(advertiser_id).unwrap();
            if let Some(cb) = &adv.terminated_callback {
                cb(status, advertiser_id, connection_handle);
            }
            (adv.directed, adv.duration, adv.max_extended_advertising_events)
        };

        if status == ErrorCode::LimitReached || status == ErrorCode::AdvertisingTimeout {
            if reg_id == REG_ID_LOCAL {
                if let Some(cb) =
                    self.sets.get_mut(advertiser_id).and_then(|adv| adv.timeout_callback.take())
                {
                    cb(status.into());
                }
            } else if let Some(cb) = self.callbacks.as_mut() {
                cb.on_advertising_enabled(advertiser_id, false, status.into());
            }
            return;
        }

        if !directed && duration.is_indefinite() && max_events == 0 {
            info!("Reenable advertising");
            if was_rotating {
                let interval = self.address_manager.lock().unwrap().next_private_address_interval();
                self.alarms.schedule(AlarmToken::AddressRotation(advertiser_id), interval);
            }
            self.enable_advertiser(advertiser_id, true, DurationTicks::INDEFINITE, 0);
        }
    }

    pub fn handle_scan_request(
        &mut self,
        advertiser_id: AdvertiserId,
        scanner_address: AddressWithType,
    ) {
        if let Some(adv) = self.sets.get(advertiser_id) {
            if let Some(cb) = &adv.scan_callback {
                cb(scanner_address.address, scanner_address.address_type);
            }
        }
    }

    /// Vendor BLE_STCHANGE: a vendor-advertising instance stopped because a
    /// connection came in. Resume it unless directed.
    pub fn handle_vendor_state_change(
        &mut self,
        advertiser_id: AdvertiserId,
        reason: VseStateChangeReason,
        connection_handle: u16,
    ) {
        let current_address = self.sets.get(advertiser_id).map(|s| s.address());
        info!(
            "Instance: 0x{:x} StateChangeReason: {:?} Handle: 0x{:x} Address: {:?}",
            advertiser_id, reason, connection_handle, current_address
        );
        if reason != VseStateChangeReason::ConnectionReceived {
            return;
        }
        let directed = match self.sets.get(advertiser_id) {
            Some(adv) => {
                if let Some(cb) = &adv.terminated_callback {
                    cb(ErrorCode::Success, advertiser_id, connection_handle);
                }
                adv.directed
            }
            None => return,
        };
        self.enabled_sets[advertiser_id as usize] = None;
        if !directed {
            info!("Resuming advertising, since not directed");
            self.enable_advertiser(advertiser_id, true, DurationTicks::INDEFINITE, 0);
        }
    }

    // ---- key material ----

    /// Fetches or generates the encrypted-advertising key material; the
    /// result arrives via the registered key-material callback.
    pub fn get_enc_key_material(&mut self) {
        let stored = self.key_store.get_bin(STORAGE_SECTION_ADAPTER, BTIF_STORAGE_KEY_ENCR_DATA);
        match stored {
            Some(key_iv) if key_iv.len() >= ENC_KEY_MATERIAL_LEN => {
                info!("Encrypted Data Key Material in Config");
                if let Some(cb) = self.enc_key_callback.as_mut() {
                    cb.on_enc_key_material(key_iv);
                } else {
                    warn!("enc key material callback is not registered");
                }
            }
            _ => {
                info!("Encrypted Data Key Material not in Config");
                self.key_material_builder = Some(KeyMaterialBuilder::new());
                for iteration in 1..=3u8 {
                    self.enqueue(
                        HciCommand::LeRand,
                        CommandContext::KeyMaterialRand { iteration },
                    );
                }
            }
        }
    }

    // ---- command completions ----

    pub fn on_command_complete(&mut self, context: CommandContext, complete: CommandComplete) {
        let status = if complete.status.is_success() {
            AdvertisingStatus::Success
        } else {
            info!("Got a command complete with status {:?}", complete.status);
            AdvertisingStatus::InternalError
        };

        match context {
            CommandContext::CheckComplete => {}
            CommandContext::AdvParameters { id } => {
                self.on_set_parameters_complete(id, status, complete.return_params);
            }
            CommandContext::AdvRandomAddress { id, address } => {
                if complete.status.is_success() {
                    info!("update random address for advertising set {} : {}", id, address.address);
                    if let Some(adv) = self.sets.get_mut(id) {
                        adv.current_address = Some(address);
                    }
                } else {
                    error!("Got a command complete with status {:?}", complete.status);
                }
            }
            CommandContext::AdvData { id, scan_response, send_callback } => {
                if !self.should_surface(id) || !send_callback {
                    return;
                }
                if let Some(cb) = self.callbacks.as_mut() {
                    if scan_response {
                        cb.on_scan_response_data_set(id, status);
                    } else {
                        cb.on_advertising_data_set(id, status);
                    }
                }
            }
            CommandContext::AdvEnable { enable, sets, trigger_callbacks } => {
                self.on_set_enable_complete(enable, sets, trigger_callbacks, status);
            }
            CommandContext::PeriodicParameters { id } => {
                if !self.should_surface(id) {
                    return;
                }
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.on_periodic_advertising_parameters_updated(id, status);
                }
            }
            CommandContext::PeriodicData { id, send_callback } => {
                if !self.should_surface(id) || !send_callback {
                    return;
                }
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.on_periodic_advertising_data_set(id, status);
                }
            }
            CommandContext::PeriodicEnable { id, enable } => {
                if !self.should_surface(id) {
                    return;
                }
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.on_periodic_advertising_enabled(id, enable, status);
                }
            }
            CommandContext::ReadChannelTxPower => {
                if complete.status == ErrorCode::UnknownHciCommand {
                    info!("Unknown command, not setting tx power");
                    return;
                }
                if let ReturnParams::TxPowerLevel(power) = complete.return_params {
                    if complete.status.is_success() {
                        self.le_physical_channel_tx_power = power;
                    }
                }
            }
            CommandContext::KeyMaterialRand { iteration } => {
                self.on_key_material_rand(iteration, complete);
            }
            CommandContext::PowerMode { .. } | CommandContext::SsrParams { .. } => {
                warn!("Power-manager completion routed to the advertising manager");
            }
        }
    }

    /// Callbacks are suppressed until the set started and for local sets.
    fn should_surface(&self, id: AdvertiserId) -> bool {
        self.sets.get(id).map_or(false, |adv| adv.started) && self.sets.reg_id(id) != REG_ID_LOCAL
    }

    fn on_set_parameters_complete(
        &mut self,
        id: AdvertiserId,
        status: AdvertisingStatus,
        return_params: ReturnParams,
    ) {
        let tx_power = match (self.api_type, return_params) {
            (AdvertisingApiType::Extended, ReturnParams::SelectedTxPower(power)) => {
                if let Some(adv) = self.sets.get_mut(id) {
                    adv.tx_power = power;
                }
                power
            }
            _ => self.le_physical_channel_tx_power,
        };
        if self.should_surface(id) {
            if let Some(cb) = self.callbacks.as_mut() {
                cb.on_advertising_parameters_updated(id, tx_power, status);
            }
        }
    }

    fn on_set_enable_complete(
        &mut self,
        enable: bool,
        sets: Vec<EnabledSet>,
        trigger_callbacks: bool,
        status: AdvertisingStatus,
    ) {
        for enabled_set in sets {
            let id = enabled_set.advertising_handle;
            if id == INVALID_ADVERTISER_ID || !self.sets.contains(id) {
                continue;
            }
            let reg_id = self.sets.reg_id(id);
            let (started, tx_power) = {
                let adv = self.sets.get(id).unwrap();
                let tx_power = if self.api_type == AdvertisingApiType::Extended {
                    adv.tx_power
                } else {
                    self.le_physical_channel_tx_power
                };
                (adv.started, tx_power)
            };

            if reg_id == REG_ID_LOCAL {
                if let Some(cb) =
                    self.sets.get_mut(id).and_then(|adv| adv.status_callback.take())
                {
                    cb(status);
                }
                continue;
            }

            if started {
                if trigger_callbacks {
                    if let Some(cb) = self.callbacks.as_mut() {
                        cb.on_advertising_enabled(id, enable, status);
                    }
                }
            } else {
                if let Some(adv) = self.sets.get_mut(id) {
                    adv.started = true;
                }
                if let Some(cb) = self.callbacks.as_mut() {
                    cb.on_advertising_set_started(reg_id, id, tx_power, status);
                }
                if status != AdvertisingStatus::Success {
                    warn!(
                        "on_advertising_set_started(): failed! reg_id = {}, status = {:?}",
                        reg_id, status
                    );
                    self.reset_advertiser(id);
                }
            }
        }
    }

    fn on_key_material_rand(&mut self, iteration: u8, complete: CommandComplete) {
        let random = match complete.return_params {
            ReturnParams::RandomNumber(random) => random,
            _ => {
                warn!("LE_RAND completion without a random number");
                return;
            }
        };
        if let Some(builder) = self.key_material_builder.as_mut() {
            builder.push_rand(iteration, random);
            if iteration == 3 {
                let builder = self.key_material_builder.take().unwrap();
                if !builder.is_complete() {
                    error!("Key material generation incomplete");
                    return;
                }
                let key_iv = builder.into_bytes();
                if let Err(e) = self.key_store.set_bin(
                    STORAGE_SECTION_ADAPTER,
                    BTIF_STORAGE_KEY_ENCR_DATA,
                    &key_iv,
                ) {
                    error!("Failed to persist key material: {}", e);
                }
                if let Some(cb) = self.enc_key_callback.as_mut() {
                    cb.on_enc_key_material(key_iv);
                }
            }
        }
    }
}

// Clamp helper matching the binder-facing integer ranges.
pub fn clamp_duration(duration: i32) -> DurationTicks {
    DurationTicks(clamp(duration, 0, 0xffff) as u16)
}

pub fn clamp_max_events(max_ext_adv_events: i32) -> u8 {
    clamp(max_ext_adv_events, 0, 0xff) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enc::MemoryKeyStore;
    use crate::gap_data::parse_elements;
    use crate::hci::{OpCode, SubOcf};
    use crate::Message;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Clone, Debug, PartialEq)]
    enum CallbackEvent {
        SetStarted(RegId, AdvertiserId, i8, AdvertisingStatus),
        Enabled(AdvertiserId, bool, AdvertisingStatus),
        DataSet(AdvertiserId, AdvertisingStatus),
        ScanResponseSet(AdvertiserId, AdvertisingStatus),
        ParamsUpdated(AdvertiserId, i8, AdvertisingStatus),
        PeriodicParamsUpdated(AdvertiserId, AdvertisingStatus),
        PeriodicDataSet(AdvertiserId, AdvertisingStatus),
        PeriodicEnabled(AdvertiserId, bool, AdvertisingStatus),
        OwnAddressRead(AdvertiserId, AddressType, Address),
    }

    struct RecordingCallbacks {
        events: std_mpsc::Sender<CallbackEvent>,
    }

    impl AdvertisingCallbacks for RecordingCallbacks {
        fn on_advertising_set_started(
            &mut self,
            reg_id: RegId,
            advertiser_id: AdvertiserId,
            tx_power: i8,
            status: AdvertisingStatus,
        ) {
            let _ = self
                .events
                .send(CallbackEvent::SetStarted(reg_id, advertiser_id, tx_power, status));
        }
        fn on_advertising_enabled(
            &mut self,
            advertiser_id: AdvertiserId,
            enable: bool,
            status: AdvertisingStatus,
        ) {
            let _ = self.events.send(CallbackEvent::Enabled(advertiser_id, enable, status));
        }
        fn on_advertising_data_set(
            &mut self,
            advertiser_id: AdvertiserId,
            status: AdvertisingStatus,
        ) {
            let _ = self.events.send(CallbackEvent::DataSet(advertiser_id, status));
        }
        fn on_scan_response_data_set(
            &mut self,
            advertiser_id: AdvertiserId,
            status: AdvertisingStatus,
        ) {
            let _ = self.events.send(CallbackEvent::ScanResponseSet(advertiser_id, status));
        }
        fn on_advertising_parameters_updated(
            &mut self,
            advertiser_id: AdvertiserId,
            tx_power: i8,
            status: AdvertisingStatus,
        ) {
            let _ =
                self.events.send(CallbackEvent::ParamsUpdated(advertiser_id, tx_power, status));
        }
        fn on_periodic_advertising_parameters_updated(
            &mut self,
            advertiser_id: AdvertiserId,
            status: AdvertisingStatus,
        ) {
            let _ = self.events.send(CallbackEvent::PeriodicParamsUpdated(advertiser_id, status));
        }
        fn on_periodic_advertising_data_set(
            &mut self,
            advertiser_id: AdvertiserId,
            status: AdvertisingStatus,
        ) {
            let _ = self.events.send(CallbackEvent::PeriodicDataSet(advertiser_id, status));
        }
        fn on_periodic_advertising_enabled(
            &mut self,
            advertiser_id: AdvertiserId,
            enable: bool,
            status: AdvertisingStatus,
        ) {
            let _ =
                self.events.send(CallbackEvent::PeriodicEnabled(advertiser_id, enable, status));
        }
        fn on_own_address_read(
            &mut self,
            advertiser_id: AdvertiserId,
            address_type: AddressType,
            address: Address,
        ) {
            let _ =
                self.events.send(CallbackEvent::OwnAddressRead(advertiser_id, address_type, address));
        }
    }

    struct Fixture {
        manager: AdvertiseManager,
        cmd_rx: UnboundedReceiver<HciCommand>,
        msg_rx: tokio::sync::mpsc::Receiver<Message>,
        events: std_mpsc::Receiver<CallbackEvent>,
    }

    impl Fixture {
        fn new(controller: ControllerInfo, policy: AddressPolicy) -> Self {
            let (dispatcher, cmd_rx) = HciDispatcher::new();
            let hci = Arc::new(Mutex::new(dispatcher));
            let address_manager =
                Arc::new(Mutex::new(LeAddressManager::new(policy, Address([0x11; 6]))));
            let (tx, msg_rx) = crate::Stack::create_channel();
            let alarms = AlarmService::new(tx);
            let (event_tx, events) = std_mpsc::channel();
            let mut manager = AdvertiseManager::new(
                hci,
                address_manager,
                alarms,
                Box::new(MemoryKeyStore::new()),
                controller,
                StackConfig::new(),
            );
            manager.register_callbacks(Box::new(RecordingCallbacks { events: event_tx }));
            Fixture { manager, cmd_rx, msg_rx, events }
        }

        fn extended() -> Self {
            Fixture::new(ControllerInfo::default(), AddressPolicy::UseResolvableAddress)
        }

        fn legacy() -> Self {
            let controller = ControllerInfo {
                supports_ble_extended_advertising: false,
                supports_multi_advertising: false,
                ..Default::default()
            };
            Fixture::new(controller, AddressPolicy::UsePublicAddress)
        }

        fn success_reply(cmd: &HciCommand) -> CommandComplete {
            let return_params = match cmd {
                HciCommand::LeSetExtendedAdvertisingParameters { tx_power, .. } => {
                    ReturnParams::SelectedTxPower(*tx_power)
                }
                HciCommand::LeReadAdvertisingPhysicalChannelTxPower => {
                    ReturnParams::TxPowerLevel(0)
                }
                HciCommand::LeRand => ReturnParams::RandomNumber(0x0123456789abcdef),
                _ => ReturnParams::None,
            };
            CommandComplete {
                opcode: cmd.opcode(),
                sub_opcode: cmd.sub_opcode(),
                status: ErrorCode::Success,
                return_params,
            }
        }

        /// Drains the command stream, answering each command with a success
        /// completion, and returns the observed trace.
        fn pump(&mut self) -> Vec<HciCommand> {
            let mut trace = Vec::new();
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                let reply = Fixture::success_reply(&cmd);
                trace.push(cmd);
                let routed = self.manager.hci.lock().unwrap().on_command_complete(reply);
                if let Some((context, complete)) = routed {
                    self.manager.on_command_complete(context, complete);
                }
            }
            trace
        }

        /// Drains commands, replying with `reply_status` for commands whose
        /// opcode matches `failing`, success otherwise.
        fn pump_with_failure(
            &mut self,
            failing: OpCode,
            reply_status: ErrorCode,
        ) -> Vec<HciCommand> {
            let mut trace = Vec::new();
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                let mut reply = Fixture::success_reply(&cmd);
                if cmd.opcode() == failing {
                    reply.status = reply_status;
                }
                trace.push(cmd);
                let routed = self.manager.hci.lock().unwrap().on_command_complete(reply);
                if let Some((context, complete)) = routed {
                    self.manager.on_command_complete(context, complete);
                }
            }
            trace
        }

        fn callback_events(&self) -> Vec<CallbackEvent> {
            let mut events = Vec::new();
            while let Ok(e) = self.events.try_recv() {
                events.push(e);
            }
            events
        }
    }

    fn connectable_config(legacy: bool) -> AdvertisingConfig {
        AdvertisingConfig {
            legacy_pdus: legacy,
            connectable: true,
            scannable: legacy,
            discoverable: true,
            advertisement: vec![GapData::new(data_types::COMPLETE_LOCAL_NAME, b"dev".to_vec())],
            scan_response: if legacy {
                vec![GapData::new(data_types::TX_POWER_LEVEL, vec![0x00])]
            } else {
                vec![]
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_connectable_set_trace() {
        let mut fixture = Fixture::legacy();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(true),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        let trace = fixture.pump();

        // Startup tx power read precedes the set's own sequence.
        assert!(matches!(trace[0], HciCommand::LeReadAdvertisingPhysicalChannelTxPower));
        assert!(matches!(trace[1], HciCommand::LeSetAdvertisingParameters { .. }));
        assert!(matches!(trace[2], HciCommand::LeSetScanResponseData { .. }));
        match &trace[3] {
            HciCommand::LeSetAdvertisingData { data } => {
                let elements = parse_elements(data).unwrap();
                assert_eq!(elements[0].data_type, data_types::FLAGS);
                assert_eq!(elements[0].data, vec![flags::LE_GENERAL_DISCOVERABLE]);
                assert_eq!(elements[1].data_type, data_types::COMPLETE_LOCAL_NAME);
            }
            other => panic!("expected advertising data, got {:?}", other),
        }
        assert!(matches!(trace[4], HciCommand::LeSetAdvertisingEnable { enable: true }));
        assert_eq!(trace.len(), 5);

        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::SetStarted(1, 0, 0, AdvertisingStatus::Success)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_discoverable_flag_with_duration() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(false),
            None,
            None,
            DurationTicks(100),
            0,
        );
        let trace = fixture.pump();
        let data_cmd = trace.iter().find_map(|cmd| match cmd {
            HciCommand::LeSetExtendedAdvertisingData { data, .. } => Some(data.clone()),
            _ => None,
        });
        let elements = parse_elements(&data_cmd.unwrap()).unwrap();
        assert_eq!(elements[0].data_type, data_types::FLAGS);
        // A bounded-duration set advertises limited discoverability.
        assert_eq!(elements[0].data, vec![flags::LE_LIMITED_DISCOVERABLE]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_set_started_with_selected_tx_power() {
        let mut fixture = Fixture::extended();
        let mut config = connectable_config(false);
        config.tx_power = 7;
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            5,
            config,
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        let trace = fixture.pump();

        assert!(matches!(trace[0], HciCommand::LeSetExtendedAdvertisingParameters { .. }));
        assert!(matches!(trace[1], HciCommand::LeSetAdvertisingSetRandomAddress { .. }));
        assert!(matches!(
            trace.last().unwrap(),
            HciCommand::LeSetExtendedAdvertisingEnable { enable: true, .. }
        ));
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::SetStarted(5, 0, 7, AdvertisingStatus::Success)]
        );
        // RPA rotation alarm armed for the connectable random-address set.
        assert!(fixture.manager.alarms.is_scheduled(AlarmToken::AddressRotation(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_data_only_last_surfaces_callback() {
        let mut fixture = Fixture::extended();
        // Broadcast set: no FLAGS auto-insert, so the payload length is
        // exactly the serialized element length.
        let mut config = connectable_config(false);
        config.connectable = false;
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            2,
            config,
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        // 3 elements of 100 serialized bytes each: 300 bytes -> 252 + 48.
        let data: Vec<GapData> = (0..3).map(|i| GapData::new(0xfe, vec![i as u8; 98])).collect();
        fixture.manager.set_advertising_data(0, false, data);
        let trace = fixture.pump();

        let mut fragments = Vec::new();
        for cmd in &trace {
            if let HciCommand::LeSetExtendedAdvertisingData { operation, data, .. } = cmd {
                fragments.push((*operation, data.len()));
            }
        }
        assert_eq!(
            fragments,
            vec![(Operation::FirstFragment, 252), (Operation::LastFragment, 48)]
        );
        // Chained data on a started set is bracketed by disable/enable.
        assert!(matches!(
            trace.first().unwrap(),
            HciCommand::LeSetExtendedAdvertisingEnable { enable: false, .. }
        ));
        assert!(matches!(
            trace.last().unwrap(),
            HciCommand::LeSetExtendedAdvertisingEnable { enable: true, .. }
        ));
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::DataSet(0, AdvertisingStatus::Success)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_too_large_issues_no_commands() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            2,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        let oversized: Vec<GapData> =
            (0..10).map(|_| GapData::new(0xfe, vec![0u8; 200])).collect();
        fixture.manager.set_advertising_data(0, false, oversized);

        assert_eq!(fixture.manager.hci.lock().unwrap().pending_count(), 0);
        assert!(fixture.cmd_rx.try_recv().is_err());
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::DataSet(0, AdvertisingStatus::DataTooLarge)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_element_over_limit_is_internal_error() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            2,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        fixture.manager.set_advertising_data(0, false, vec![GapData::new(0xfe, vec![0u8; 260])]);
        assert!(fixture.cmd_rx.try_recv().is_err());
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::DataSet(0, AdvertisingStatus::InternalError)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_rotation_trace() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            3,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        let old_address = fixture.manager.sets.get(0).unwrap().address();

        // The rotation window tops out at 15 minutes.
        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        let token = match fixture.msg_rx.recv().await {
            Some(Message::AlarmFired(token)) => token,
            _ => panic!("expected alarm"),
        };
        fixture.manager.alarms.on_fired(token);
        fixture.manager.on_alarm(token);
        let trace = fixture.pump();

        assert!(matches!(
            trace[0],
            HciCommand::LeSetExtendedAdvertisingEnable { enable: false, .. }
        ));
        let new_address = match &trace[1] {
            HciCommand::LeSetAdvertisingSetRandomAddress { address, .. } => *address,
            other => panic!("expected random address command, got {:?}", other),
        };
        assert!(matches!(
            trace[2],
            HciCommand::LeSetExtendedAdvertisingEnable { enable: true, .. }
        ));
        assert_eq!(trace.len(), 3);
        assert_ne!(new_address, old_address.address);
        // The record tracks the new address and the alarm re-armed.
        assert_eq!(fixture.manager.sets.get(0).unwrap().address().address, new_address);
        assert!(fixture.manager.alarms.is_scheduled(AlarmToken::AddressRotation(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_dropped_when_no_longer_enabled() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            3,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();

        // Simulate a fired-but-queued alarm racing a disable.
        fixture.manager.enabled_sets[0] = None;
        fixture.manager.on_alarm(AlarmToken::AddressRotation(0));
        assert!(fixture.cmd_rx.try_recv().is_err());
        assert!(!fixture.manager.alarms.is_scheduled(AlarmToken::AddressRotation(0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_terminated_timeout_local_reg() {
        let mut fixture = Fixture::extended();
        let id = fixture.manager.register_advertiser().unwrap();
        let (status_tx, status_rx) = std_mpsc::channel();
        let (timeout_tx, timeout_rx) = std_mpsc::channel();
        fixture.manager.start_advertising(
            id,
            connectable_config(false),
            DurationTicks(100),
            Box::new(move |status| {
                let _ = status_tx.send(status);
            }),
            Box::new(move |status| {
                let _ = timeout_tx.send(status);
            }),
            None,
            None,
        );
        fixture.pump();
        assert_eq!(status_rx.try_recv().unwrap(), AdvertisingStatus::Success);

        fixture.manager.handle_set_terminated(ErrorCode::AdvertisingTimeout, id, 0);
        // One-shot timeout callback, no client callback, no auto re-enable.
        assert_eq!(timeout_rx.try_recv().unwrap(), AdvertisingStatus::AdvertisingTimeout);
        assert!(fixture.callback_events().is_empty());
        assert!(fixture.cmd_rx.try_recv().is_err());
        assert!(!fixture.manager.alarms.is_scheduled(AlarmToken::AddressRotation(id)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_terminated_indefinite_reenables_and_rearms() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            4,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        fixture.manager.handle_set_terminated(ErrorCode::Success, 0, 0x40);
        let trace = fixture.pump();
        assert!(matches!(
            trace[0],
            HciCommand::LeSetExtendedAdvertisingEnable { enable: true, .. }
        ));
        assert!(fixture.manager.alarms.is_scheduled(AlarmToken::AddressRotation(0)));
        // Re-enable of an already-started set surfaces on_advertising_enabled.
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::Enabled(0, true, AdvertisingStatus::Success)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_resume_reenables_same_sets() {
        let mut fixture = Fixture::extended();
        for reg_id in [1, 2] {
            fixture.manager.create_extended_advertiser(
                CLIENT_ID_JNI,
                reg_id,
                connectable_config(false),
                None,
                None,
                DurationTicks::INDEFINITE,
                0,
            );
        }
        fixture.pump();
        fixture.callback_events();

        fixture.manager.on_pause();
        let trace = fixture.pump();
        match &trace[0] {
            HciCommand::LeSetExtendedAdvertisingEnable { enable: false, sets } => {
                let ids: Vec<AdvertiserId> =
                    sets.iter().map(|s| s.advertising_handle).collect();
                assert_eq!(ids, vec![0, 1]);
            }
            other => panic!("expected disable, got {:?}", other),
        }
        assert_eq!(fixture.manager.address_manager.lock().unwrap().pause_acks(), 1);

        fixture.manager.on_resume();
        let trace = fixture.pump();
        match &trace[0] {
            HciCommand::LeSetExtendedAdvertisingEnable { enable: true, sets } => {
                assert_eq!(sets.len(), 2);
            }
            other => panic!("expected enable, got {:?}", other),
        }
        assert_eq!(fixture.manager.address_manager.lock().unwrap().resume_acks(), 1);
        // Resume does not re-trigger enable callbacks.
        assert!(fixture.callback_events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_irk_change_rotates_enabled_sets() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();

        fixture.manager.on_irk_change();
        let trace = fixture.pump();
        assert!(trace
            .iter()
            .any(|cmd| matches!(cmd, HciCommand::LeSetAdvertisingSetRandomAddress { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_encrypted_data_sealed_and_resealed_on_rotation() {
        let mut fixture = Fixture::extended();
        fixture
            .manager
            .key_store
            .set_bin(STORAGE_SECTION_ADAPTER, BTIF_STORAGE_KEY_ENCR_DATA, &[0x42u8; 32])
            .unwrap();

        let mut config = connectable_config(false);
        config.advertisement_enc = vec![GapData::new(0xff, vec![0xbe, 0xef])];
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            config,
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        let trace = fixture.pump();

        let sealed_payloads: Vec<Vec<u8>> = trace
            .iter()
            .filter_map(|cmd| match cmd {
                HciCommand::LeSetExtendedAdvertisingData { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert!(!sealed_payloads.is_empty());
        let elements = parse_elements(&sealed_payloads[0]).unwrap();
        let sealed = elements
            .iter()
            .find(|e| e.data_type == data_types::ENCRYPTED_ADVERTISING_DATA)
            .expect("sealed element present");
        // randomizer(5) + ciphertext(4) + MIC(4)
        assert_eq!(sealed.data.len(), 13);
        let first_randomizer = fixture.manager.sets.get(0).unwrap().randomizer;

        // Rotation re-seals with a fresh randomizer.
        tokio::time::advance(Duration::from_secs(16 * 60)).await;
        let token = match fixture.msg_rx.recv().await {
            Some(Message::AlarmFired(token)) => token,
            _ => panic!("expected alarm"),
        };
        fixture.manager.alarms.on_fired(token);
        fixture.manager.on_alarm(token);
        fixture.pump();
        let second_randomizer = fixture.manager.sets.get(0).unwrap().randomizer;
        assert_ne!(first_randomizer, second_randomizer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_many_advertisers() {
        let controller = ControllerInfo {
            le_number_of_supported_advertising_sets: 1,
            ..Default::default()
        };
        let mut fixture = Fixture::new(controller, AddressPolicy::UseResolvableAddress);
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            2,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::SetStarted(
                2,
                INVALID_ADVERTISER_ID,
                0,
                AdvertisingStatus::TooManyAdvertisers
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_resets_set() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            9,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump_with_failure(
            OpCode::LeSetExtendedAdvertisingEnable,
            ErrorCode::CommandDisallowed,
        );
        let events = fixture.callback_events();
        assert_eq!(
            events,
            vec![CallbackEvent::SetStarted(9, 0, 0, AdvertisingStatus::InternalError)]
        );
        // The failed set was reset; its id is free again.
        assert_eq!(fixture.manager.number_of_advertising_instances_in_use(), 0);
        assert_eq!(fixture.manager.register_advertiser(), Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_request_routed_to_set_callback() {
        let mut fixture = Fixture::extended();
        let (scan_tx, scan_rx) = std_mpsc::channel();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(false),
            Some(Box::new(move |address, address_type| {
                let _ = scan_tx.send((address, address_type));
            })),
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();

        let scanner = AddressWithType::new(Address([5; 6]), AddressType::RandomDeviceAddress);
        fixture.manager.handle_scan_request(0, scanner);
        assert_eq!(
            scan_rx.try_recv().unwrap(),
            (Address([5; 6]), AddressType::RandomDeviceAddress)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vendor_state_change_resumes_undirected() {
        let controller = ControllerInfo {
            supports_ble_extended_advertising: false,
            supports_multi_advertising: true,
            vendor_max_advt_instances: 4,
            ..Default::default()
        };
        let mut fixture = Fixture::new(controller, AddressPolicy::UseResolvableAddress);
        assert_eq!(fixture.manager.advertising_api_type(), AdvertisingApiType::AndroidVendor);

        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(true),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        fixture
            .manager
            .handle_vendor_state_change(1, VseStateChangeReason::ConnectionReceived, 0x42);
        let trace = fixture.pump();
        assert!(trace.iter().any(|cmd| matches!(
            cmd,
            HciCommand::LeMultiAdvtSetEnable { advertising_handle: 1, enable: true }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_vendor_handles_are_one_based() {
        let controller = ControllerInfo {
            supports_ble_extended_advertising: false,
            supports_multi_advertising: true,
            vendor_max_advt_instances: 2,
            ..Default::default()
        };
        let mut fixture = Fixture::new(controller, AddressPolicy::UseResolvableAddress);
        assert_eq!(fixture.manager.register_advertiser(), Ok(1));
        assert_eq!(fixture.manager.register_advertiser(), Ok(2));
        assert_eq!(
            fixture.manager.register_advertiser(),
            Err(AdvertisingStatus::TooManyAdvertisers)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_own_address() {
        let mut fixture = Fixture::extended();
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(false),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        fixture.pump();
        fixture.callback_events();

        fixture.manager.get_own_address(0);
        let events = fixture.callback_events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            CallbackEvent::OwnAddressRead(0, AddressType::RandomDeviceAddress, address) => {
                assert!(address.is_resolvable_private());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_material_generated_via_le_rand() {
        struct KeyCb(std_mpsc::Sender<Vec<u8>>);
        impl EncKeyMaterialCallback for KeyCb {
            fn on_enc_key_material(&mut self, key_iv: Vec<u8>) {
                let _ = self.0.send(key_iv);
            }
        }

        let mut fixture = Fixture::extended();
        let (key_tx, key_rx) = std_mpsc::channel();
        fixture.manager.register_enc_key_material_callback(Box::new(KeyCb(key_tx)));

        fixture.manager.get_enc_key_material();
        let trace = fixture.pump();
        assert_eq!(trace.iter().filter(|c| matches!(c, HciCommand::LeRand)).count(), 3);

        let key_iv = key_rx.try_recv().unwrap();
        assert_eq!(key_iv.len(), ENC_KEY_MATERIAL_LEN);
        // Persisted for later seals.
        assert_eq!(
            fixture
                .manager
                .key_store
                .get_bin(STORAGE_SECTION_ADAPTER, BTIF_STORAGE_KEY_ENCR_DATA),
            Some(key_iv)
        );

        // Second request answers straight from storage.
        fixture.manager.get_enc_key_material();
        assert!(fixture.cmd_rx.try_recv().is_err());
        assert!(key_rx.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_payload_auto_upgrades_to_extended() {
        let mut fixture = Fixture::extended();
        let mut config = connectable_config(false);
        config.legacy_pdus = true;
        // 40 serialized bytes cannot fit a legacy PDU.
        config.advertisement = vec![GapData::new(0xfe, vec![0u8; 38])];
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            config,
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        let trace = fixture.pump();
        match &trace[0] {
            HciCommand::LeSetExtendedAdvertisingParameters { legacy, .. } => {
                assert!(!legacy);
            }
            other => panic!("expected parameters, got {:?}", other),
        }
        assert_eq!(
            fixture.callback_events(),
            vec![CallbackEvent::SetStarted(1, 0, 0, AdvertisingStatus::Success)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_advt_sub_opcode_correlation() {
        let controller = ControllerInfo {
            supports_ble_extended_advertising: false,
            supports_multi_advertising: true,
            vendor_max_advt_instances: 4,
            ..Default::default()
        };
        let mut fixture = Fixture::new(controller, AddressPolicy::UseResolvableAddress);
        fixture.manager.create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            connectable_config(true),
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        let trace = fixture.pump();
        let subs: Vec<SubOcf> = trace.iter().filter_map(|c| c.sub_opcode()).collect();
        assert!(subs.contains(&SubOcf::SetParam));
        assert!(subs.contains(&SubOcf::SetEnable));
    }
}
