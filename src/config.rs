//! Sysprop-style configuration and runtime feature flags.
//!
//! Properties are key/value strings with typed accessors and defaults, the
//! same shape the native stack exposes through `osi_property_get_*`.

use std::collections::HashMap;

use log::{error, info};

// Recognized property keys.
pub const PROPERTY_LE_TX_PATH_LOSS_COMP: &str =
    "bluetooth.hardware.radio.le_tx_path_loss_comp_db";
pub const PROPERTY_SNIFF_MAX_INTERVALS: &str = "bluetooth.core.classic.sniff_max_intervals";
pub const PROPERTY_SNIFF_MIN_INTERVALS: &str = "bluetooth.core.classic.sniff_min_intervals";
pub const PROPERTY_SNIFF_ATTEMPTS: &str = "bluetooth.core.classic.sniff_attempts";
pub const PROPERTY_SNIFF_TIMEOUTS: &str = "bluetooth.core.classic.sniff_timeouts";

const LE_TX_PATH_LOSS_COMP_MIN: i64 = -128;
const LE_TX_PATH_LOSS_COMP_MAX: i64 = 127;

/// Runtime feature flags consumed by the advertising path.
#[derive(Clone, Copy, Debug)]
pub struct FeatureFlags {
    /// Non-connectable advertising under the public/static policy uses NRPA
    /// instead of the public address.
    pub nrpa_non_connectable_adv: bool,
    /// A single GAP element may exceed the fragment length; fragmentation
    /// splits the serialized stream by raw byte count.
    pub divide_long_single_gap_data: bool,
    /// Legacy-PDU advertising data is additionally capped at 31 bytes.
    pub ble_check_data_length_on_legacy_advertising: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            nrpa_non_connectable_adv: true,
            divide_long_single_gap_data: true,
            ble_check_data_length_on_legacy_advertising: true,
        }
    }
}

/// Configuration snapshot handed to the stack at startup.
#[derive(Clone, Debug, Default)]
pub struct StackConfig {
    properties: HashMap<String, String>,
    pub flags: FeatureFlags,
}

impl StackConfig {
    pub fn new() -> Self {
        StackConfig::default()
    }

    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.properties.get(key).and_then(|v| v.trim().parse::<i64>().ok())
    }

    /// Parses a comma-separated unsigned integer list property. Returns None
    /// when the property is absent or any entry is malformed.
    pub fn get_uint_list(&self, key: &str) -> Option<Vec<u32>> {
        let raw = self.properties.get(key)?;
        raw.split(',').map(|part| part.trim().parse::<u32>().ok()).collect()
    }

    /// TX path loss compensation in dB, applied to requested advertising TX
    /// power. Out-of-range values are rejected.
    pub fn tx_path_loss_compensation(&self) -> i8 {
        let mut compensation = 0i8;
        if let Some(number) = self.get_i64(PROPERTY_LE_TX_PATH_LOSS_COMP) {
            if !(LE_TX_PATH_LOSS_COMP_MIN..=LE_TX_PATH_LOSS_COMP_MAX).contains(&number) {
                error!("Invalid number for tx path loss compensation: {}", number);
            } else {
                compensation = number as i8;
            }
        }
        info!("Tx path loss compensation: {}", compensation);
        compensation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_path_loss_compensation_parsing() {
        let mut config = StackConfig::new();
        assert_eq!(config.tx_path_loss_compensation(), 0);

        config.set_property(PROPERTY_LE_TX_PATH_LOSS_COMP, "5");
        assert_eq!(config.tx_path_loss_compensation(), 5);

        config.set_property(PROPERTY_LE_TX_PATH_LOSS_COMP, "-12");
        assert_eq!(config.tx_path_loss_compensation(), -12);

        // Out of range keeps the default.
        config.set_property(PROPERTY_LE_TX_PATH_LOSS_COMP, "300");
        assert_eq!(config.tx_path_loss_compensation(), 0);
    }

    #[test]
    fn test_uint_list_parsing() {
        let mut config = StackConfig::new();
        assert_eq!(config.get_uint_list(PROPERTY_SNIFF_ATTEMPTS), None);

        config.set_property(PROPERTY_SNIFF_ATTEMPTS, "4, 4, 2, 2, 2, 2, 1");
        assert_eq!(
            config.get_uint_list(PROPERTY_SNIFF_ATTEMPTS),
            Some(vec![4, 4, 2, 2, 2, 2, 1])
        );

        config.set_property(PROPERTY_SNIFF_ATTEMPTS, "4,nope,2");
        assert_eq!(config.get_uint_list(PROPERTY_SNIFF_ATTEMPTS), None);
    }
}
