//! Snapshot of the controller capabilities the core consumes.
//!
//! The transport reads these once at startup; the stack treats them as
//! immutable afterwards.

use crate::address::Address;

#[derive(Clone, Debug)]
pub struct ControllerInfo {
    pub mac_address: Address,
    pub supports_ble_extended_advertising: bool,
    /// Vendor LE_MULTI_ADVT command set.
    pub supports_multi_advertising: bool,
    /// Maximum instances reported by the vendor capabilities, when the
    /// vendor command set is in use.
    pub vendor_max_advt_instances: u8,
    pub supports_ble_periodic_advertising: bool,
    pub supports_ble_periodic_advertising_adi: bool,
    pub supports_sniff_subrating: bool,
    pub le_maximum_advertising_data_length: u16,
    pub le_number_of_supported_advertising_sets: u8,
}

impl Default for ControllerInfo {
    fn default() -> Self {
        ControllerInfo {
            mac_address: Address::EMPTY,
            supports_ble_extended_advertising: true,
            supports_multi_advertising: false,
            vendor_max_advt_instances: 0,
            supports_ble_periodic_advertising: true,
            supports_ble_periodic_advertising_adi: true,
            supports_sniff_subrating: true,
            le_maximum_advertising_data_length: 1650,
            le_number_of_supported_advertising_sets: 16,
        }
    }
}
