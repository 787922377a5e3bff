//! Static power-management configuration: the service-to-spec mapping, the
//! per-spec action tables, sniff-subrating specs, and the sniff parameter
//! table with its sysprop overrides.

use std::time::Duration;

use lazy_static::lazy_static;
use log::info;

use crate::config::{
    StackConfig, PROPERTY_SNIFF_ATTEMPTS, PROPERTY_SNIFF_MAX_INTERVALS,
    PROPERTY_SNIFF_MIN_INTERVALS, PROPERTY_SNIFF_TIMEOUTS,
};
use crate::hci::{LinkMode, PowerModeParams};
use crate::pm::services::ALL_APP_ID;
use crate::pm::{action, ServiceId};

/// One (action, delay) pair of a spec's action table.
#[derive(Clone, Copy, Debug)]
pub struct PmActionEntry {
    pub action: u8,
    pub timeout: Duration,
}

const fn act(action: u8, timeout_ms: u64) -> PmActionEntry {
    PmActionEntry { action, timeout: Duration::from_millis(timeout_ms) }
}

/// Power-mode behavior of one service class: which low-power modes it
/// tolerates, its SSR spec, and the reaction to each connection status.
#[derive(Clone, Debug)]
pub struct PmSpec {
    pub allow_mask: u8,
    pub ssr: usize,
    /// Indexed by `SysConnStatus`.
    pub actions: [PmActionEntry; 8],
}

#[derive(Clone, Copy, Debug)]
pub struct PmConfigEntry {
    pub id: ServiceId,
    pub app_id: u8,
    pub spec_idx: usize,
}

/// Sniff-subrating parameters; latencies and timeouts in 0.625 ms slots.
#[derive(Clone, Copy, Debug)]
pub struct SsrSpec {
    pub name: &'static str,
    pub max_latency: u16,
    pub min_remote_timeout: u16,
    pub min_local_timeout: u16,
}

pub const SSR0: usize = 0;
/// Dedicated to the HID SSR entry; its parameters come from the
/// per-connection HID descriptor.
pub const SSR_HH: usize = 1;
pub const SSR2: usize = 2;
pub const SSR3: usize = 3;
pub const SSR4: usize = 4;

const SPEC_AG: usize = 0;
const SPEC_AV: usize = 1;
const SPEC_HH: usize = 2;
const SPEC_PAN: usize = 3;
const SPEC_HD: usize = 4;

const NO_ACT: PmActionEntry = act(action::NO_ACTION, 0);

lazy_static! {
    /// Maps (service, app) to a spec index. First match wins.
    pub static ref PM_CONFIG: Vec<PmConfigEntry> = vec![
        PmConfigEntry { id: ServiceId::Ag, app_id: ALL_APP_ID, spec_idx: SPEC_AG },
        PmConfigEntry { id: ServiceId::Hs, app_id: ALL_APP_ID, spec_idx: SPEC_AG },
        PmConfigEntry { id: ServiceId::Av, app_id: ALL_APP_ID, spec_idx: SPEC_AV },
        PmConfigEntry { id: ServiceId::Hh, app_id: ALL_APP_ID, spec_idx: SPEC_HH },
        PmConfigEntry { id: ServiceId::Pan, app_id: ALL_APP_ID, spec_idx: SPEC_PAN },
        PmConfigEntry { id: ServiceId::Hd, app_id: ALL_APP_ID, spec_idx: SPEC_HD },
    ];

    /// Action tables, indexed by SysConnStatus:
    /// [conn_open, conn_close, app_open, app_close, sco_open, sco_close,
    ///  conn_idle, conn_busy]
    pub static ref PM_SPECS: Vec<PmSpec> = vec![
        // AG / HS
        PmSpec {
            allow_mask: action::PARK | action::SNIFF,
            ssr: SSR2,
            actions: [
                act(action::SNIFF, 7000),
                act(action::NO_PREF, 0),
                NO_ACT,
                NO_ACT,
                act(action::SNIFF3, 7000),
                act(action::SNIFF, 7000),
                act(action::SNIFF, 7000),
                NO_ACT,
            ],
        },
        // AV
        PmSpec {
            allow_mask: action::SNIFF,
            ssr: SSR2,
            actions: [
                act(action::SNIFF, 5000),
                act(action::NO_PREF, 0),
                NO_ACT,
                NO_ACT,
                NO_ACT,
                NO_ACT,
                act(action::SNIFF, 5000),
                NO_ACT,
            ],
        },
        // HH
        PmSpec {
            allow_mask: action::PARK | action::SNIFF,
            ssr: SSR_HH,
            actions: [
                act(action::SNIFF2, 5000),
                act(action::NO_PREF, 0),
                NO_ACT,
                NO_ACT,
                NO_ACT,
                NO_ACT,
                act(action::SNIFF2, 5000),
                NO_ACT,
            ],
        },
        // PAN
        PmSpec {
            allow_mask: action::SNIFF,
            ssr: SSR0,
            actions: [
                act(action::SNIFF, 7000),
                act(action::NO_PREF, 0),
                NO_ACT,
                NO_ACT,
                NO_ACT,
                NO_ACT,
                act(action::SNIFF, 7000),
                act(action::ACTIVE, 0),
            ],
        },
        // HD
        PmSpec {
            allow_mask: action::SNIFF,
            ssr: SSR3,
            actions: [
                act(action::SNIFF4, 5000),
                act(action::NO_PREF, 0),
                NO_ACT,
                NO_ACT,
                NO_ACT,
                NO_ACT,
                act(action::SNIFF4, 5000),
                NO_ACT,
            ],
        },
    ];

    pub static ref SSR_SPECS: Vec<SsrSpec> = vec![
        SsrSpec { name: "SSR0", max_latency: 0, min_remote_timeout: 0, min_local_timeout: 0 },
        // Filled per connection from the HID descriptor.
        SsrSpec { name: "SSR_HH", max_latency: 0, min_remote_timeout: 0, min_local_timeout: 0 },
        SsrSpec { name: "SSR2", max_latency: 1250, min_remote_timeout: 2, min_local_timeout: 2 },
        SsrSpec { name: "SSR3", max_latency: 360, min_remote_timeout: 160, min_local_timeout: 1600 },
        SsrSpec { name: "SSR4", max_latency: 360, min_remote_timeout: 160, min_local_timeout: 1600 },
    ];
}

/// Finds the PM configuration entry for a service/app pair.
pub fn find_pm_config(id: ServiceId, app_id: u8) -> Option<&'static PmConfigEntry> {
    PM_CONFIG
        .iter()
        .find(|e| e.id == id && (e.app_id == ALL_APP_ID || e.app_id == app_id))
}

/// Index of the park entry inside the sniff parameter table.
pub const PARK_IDX: usize = 7;

const DEFAULT_SNIFF_TABLE: [(u16, u16, u16, u16); PARK_IDX] = [
    (800, 400, 4, 1),
    (400, 200, 4, 1),
    (180, 150, 4, 1),
    (150, 50, 4, 1),
    (54, 30, 4, 1),
    (36, 30, 2, 0),
    (18, 10, 4, 1),
];

const DEFAULT_PARK: (u16, u16, u16, u16) = (800, 400, 0, 0);

/// The sniff/park parameter table, optionally overridden entry-per-index by
/// the `bluetooth.core.classic.sniff_*` integer-list properties. Defaults
/// are used whenever any list is missing, malformed, or short.
#[derive(Clone, Debug)]
pub struct SniffTable {
    entries: Vec<PowerModeParams>,
}

impl SniffTable {
    pub fn from_config(config: &StackConfig) -> Self {
        let max = config.get_uint_list(PROPERTY_SNIFF_MAX_INTERVALS);
        let min = config.get_uint_list(PROPERTY_SNIFF_MIN_INTERVALS);
        let attempt = config.get_uint_list(PROPERTY_SNIFF_ATTEMPTS);
        let timeout = config.get_uint_list(PROPERTY_SNIFF_TIMEOUTS);

        let overridden = match (&max, &min, &attempt, &timeout) {
            (Some(max), Some(min), Some(attempt), Some(timeout)) => {
                max.len() >= PARK_IDX
                    && min.len() >= PARK_IDX
                    && attempt.len() >= PARK_IDX
                    && timeout.len() >= PARK_IDX
            }
            _ => false,
        };

        let mut entries = Vec::with_capacity(PARK_IDX + 1);
        for i in 0..PARK_IDX {
            let (max_i, min_i, attempt_i, timeout_i) = if overridden {
                (
                    max.as_ref().unwrap()[i] as u16,
                    min.as_ref().unwrap()[i] as u16,
                    attempt.as_ref().unwrap()[i] as u16,
                    timeout.as_ref().unwrap()[i] as u16,
                )
            } else {
                DEFAULT_SNIFF_TABLE[i]
            };
            entries.push(PowerModeParams {
                mode: LinkMode::Sniff,
                max_interval: max_i,
                min_interval: min_i,
                attempt: attempt_i,
                timeout: timeout_i,
                force: false,
            });
        }
        entries.push(PowerModeParams {
            mode: LinkMode::Park,
            max_interval: DEFAULT_PARK.0,
            min_interval: DEFAULT_PARK.1,
            attempt: DEFAULT_PARK.2,
            timeout: DEFAULT_PARK.3,
            force: false,
        });
        if overridden {
            info!("Sniff parameter table overridden from properties");
        }
        SniffTable { entries }
    }

    /// Sniff parameters for a sniff table index; out-of-range indices fall
    /// back to index 0.
    pub fn sniff_entry(&self, index: usize) -> PowerModeParams {
        if index >= PARK_IDX {
            return self.entries[0];
        }
        self.entries[index]
    }

    pub fn park_entry(&self) -> PowerModeParams {
        self.entries[PARK_IDX]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_pm_config_wildcard_app() {
        let entry = find_pm_config(ServiceId::Av, 42).unwrap();
        assert_eq!(entry.spec_idx, SPEC_AV);
        assert!(find_pm_config(ServiceId::Sys, 0).is_none());
    }

    #[test]
    fn test_spec_tables_consistent() {
        for spec in PM_SPECS.iter() {
            assert!(spec.ssr < SSR_SPECS.len());
            for entry in &spec.actions {
                if entry.action != action::NO_ACTION && entry.action != action::NO_PREF {
                    // Every real action is a mode the spec could ask for.
                    assert!(
                        entry.action == action::ACTIVE
                            || entry.action & 0xf0 == action::SNIFF
                            || entry.action == action::PARK
                    );
                }
            }
        }
    }

    #[test]
    fn test_sniff_table_defaults() {
        let table = SniffTable::from_config(&StackConfig::new());
        let first = table.sniff_entry(0);
        assert_eq!(first.mode, LinkMode::Sniff);
        assert_eq!(first.max_interval, 800);
        assert_eq!(table.sniff_entry(99).max_interval, 800);
        assert_eq!(table.park_entry().mode, LinkMode::Park);
    }

    #[test]
    fn test_sniff_table_override() {
        let mut config = StackConfig::new();
        config.set_property(PROPERTY_SNIFF_MAX_INTERVALS, "700,600,500,400,300,200,100");
        config.set_property(PROPERTY_SNIFF_MIN_INTERVALS, "350,300,250,200,150,100,50");
        config.set_property(PROPERTY_SNIFF_ATTEMPTS, "4,4,4,4,4,2,1");
        config.set_property(PROPERTY_SNIFF_TIMEOUTS, "1,1,1,1,1,0,0");
        let table = SniffTable::from_config(&config);
        assert_eq!(table.sniff_entry(0).max_interval, 700);
        assert_eq!(table.sniff_entry(6).min_interval, 50);
    }

    #[test]
    fn test_sniff_table_malformed_override_uses_defaults() {
        let mut config = StackConfig::new();
        // Too short, so the defaults stay in force.
        config.set_property(PROPERTY_SNIFF_MAX_INTERVALS, "700,600");
        config.set_property(PROPERTY_SNIFF_MIN_INTERVALS, "350,300");
        config.set_property(PROPERTY_SNIFF_ATTEMPTS, "4,4");
        config.set_property(PROPERTY_SNIFF_TIMEOUTS, "1,1");
        let table = SniffTable::from_config(&config);
        assert_eq!(table.sniff_entry(0).max_interval, 800);
    }
}
