//! Classic power manager: per-peer arbitration of low-power mode requests
//! from the connected service profiles, delayed transitions via the timer
//! bank, sniff-subrating selection, and controller mode-change handling.

pub mod btm;
pub mod services;
pub mod tables;
pub mod timer;

use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::address::Address;
use crate::alarm::{AlarmService, AlarmToken};
use crate::controller::ControllerInfo;
use crate::hci::{ErrorCode, LinkMode, PowerModeParams};

use self::btm::{BtmPm, PmCmdStatus};
use self::services::{ConnectedServices, ServiceEntry};
use self::tables::{
    find_pm_config, SniffTable, PM_SPECS, SSR0, SSR4, SSR_HH, SSR_SPECS,
};
use self::timer::{PmTimerBank, PmTimerIdx};

/// Service classes participating in power management.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceId {
    Sys,
    Ag,
    Hs,
    Av,
    Hh,
    Pan,
    Hd,
}

/// Connection status reported by the system layer; doubles as the index
/// into a spec's action table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum SysConnStatus {
    ConnOpen = 0,
    ConnClose = 1,
    AppOpen = 2,
    AppClose = 3,
    ScoOpen = 4,
    ScoClose = 5,
    ConnIdle = 6,
    ConnBusy = 7,
}

/// Power-mode actions, ordered by strictness: a numerically larger action
/// wins when several services propose one.
pub mod action {
    pub const NO_ACTION: u8 = 0x00;
    pub const NO_PREF: u8 = 0x01;
    pub const PARK: u8 = 0x10;
    /// Low nibble selects the sniff parameter table entry.
    pub const SNIFF: u8 = 0x20;
    pub const SNIFF1: u8 = 0x21;
    pub const SNIFF2: u8 = 0x22;
    pub const SNIFF3: u8 = 0x23;
    pub const SNIFF4: u8 = 0x24;
    pub const SNIFF5: u8 = 0x25;
    pub const SNIFF6: u8 = 0x26;
    pub const SNIFF7: u8 = 0x27;
    pub const SUSPEND: u8 = 0x30;
    pub const ACTIVE: u8 = 0x40;
    pub const RETRY: u8 = 0x80;

    pub fn is_sniff(a: u8) -> bool {
        a & 0xf0 == SNIFF
    }

    pub fn is_park(a: u8) -> bool {
        a == PARK
    }
}

/// What kind of reconciliation pass set_mode runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmReq {
    /// A service issued a new request; only its timeout is adopted.
    New,
    /// Re-evaluate everything, e.g. after a timer stop or mode change.
    Restart,
    /// A delay timer expired; issue the mode now.
    Execute,
}

/// Controller-side power status, as delivered by mode-change and
/// sniff-subrating events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmStatus {
    Active,
    Hold,
    Sniff,
    Park,
    Ssr,
    Error,
}

bitflags! {
    /// Per-peer sniff/SSR state bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DeviceInfo: u8 {
        /// Sniff subrating negotiated on the link.
        const USE_SSR = 0x01;
        /// We initiated the last sniff.
        const INT_SNIFF = 0x02;
        /// The remote initiated the last sniff.
        const ACP_SNIFF = 0x04;
        /// A sniff command from us is outstanding.
        const SET_SNIFF = 0x08;
    }
}

/// Per-peer record the PM algorithm consults.
pub struct PeerDevice {
    pub peer: Address,
    pub info: DeviceInfo,
    pub pm_mode_attempted: u8,
    pub pm_mode_failed: u8,
    /// Low-power status seen before the last active transition, kept so SSR
    /// parameters can be re-issued.
    pub prev_low: Option<PmStatus>,
}

impl PeerDevice {
    fn new(peer: Address) -> Self {
        PeerDevice {
            peer,
            info: DeviceInfo::empty(),
            pm_mode_attempted: action::NO_ACTION,
            pm_mode_failed: action::NO_ACTION,
            prev_low: None,
        }
    }
}

/// Per-connection HID sniff-subrating preference.
pub trait HidSsrQuery {
    /// (max_latency, min_remote_timeout) from the HID descriptor, or None
    /// when the parameters are not available.
    fn read_ssr_params(&self, peer: Address) -> Option<(u16, u16)>;
}

pub struct PowerManager {
    services: ConnectedServices,
    devices: Vec<PeerDevice>,
    timers: PmTimerBank,
    alarms: AlarmService,
    btm: BtmPm,
    sniff_table: SniffTable,
    controller: ControllerInfo,
    hid: Option<Box<dyn HidSsrQuery + Send>>,
}

impl PowerManager {
    pub fn new(
        alarms: AlarmService,
        btm: BtmPm,
        controller: ControllerInfo,
        sniff_table: SniffTable,
    ) -> Self {
        PowerManager {
            services: ConnectedServices::new(),
            devices: Vec::new(),
            timers: PmTimerBank::new(),
            alarms,
            btm,
            sniff_table,
            controller,
            hid: None,
        }
    }

    pub fn set_hid_interface(&mut self, hid: Box<dyn HidSsrQuery + Send>) {
        self.hid = Some(hid);
    }

    pub fn btm_mut(&mut self) -> &mut BtmPm {
        &mut self.btm
    }

    /// Stops and clears every PM timer; called when PM shuts down.
    pub fn disable(&mut self) {
        self.timers.reset(&mut self.alarms);
    }

    pub fn av_count(&self) -> usize {
        self.services.av_count()
    }

    fn find_device(&self, peer: Address) -> Option<usize> {
        self.devices.iter().position(|d| d.peer == peer)
    }

    fn ensure_device(&mut self, peer: Address) -> usize {
        match self.find_device(peer) {
            Some(i) => i,
            None => {
                self.devices.push(PeerDevice::new(peer));
                self.devices.len() - 1
            }
        }
    }

    /// Connection status change from the system layer; the main entry point
    /// driving the per-peer reconciliation.
    pub fn on_conn_status_change(
        &mut self,
        status: SysConnStatus,
        id: ServiceId,
        app_id: u8,
        peer: Address,
    ) {
        debug!(
            "Power management callback status:{:?} id:{:?} app:{}",
            status, id, app_id
        );

        let cfg = match find_pm_config(id, app_id) {
            Some(cfg) => cfg,
            None => {
                debug!("Ignoring power management callback as no service entries exist");
                return;
            }
        };

        debug!("Stopped all timers for service to device:{} id:{:?}", peer, id);
        self.timers.stop_by_srvc_id(&mut self.alarms, peer, id);

        if status == SysConnStatus::ConnOpen {
            self.ensure_device(peer);
            self.btm.on_connection_up(peer);
        }
        let dev_idx = self.find_device(peer);
        if dev_idx.is_none() {
            error!("Unable to find peer device...yet soldiering on...");
        }

        // Pick the SSR spec to apply on this transition.
        let spec = &PM_SPECS[cfg.spec_idx];
        let use_ssr =
            dev_idx.map_or(false, |i| self.devices[i].info.contains(DeviceInfo::USE_SSR));
        let mut index = SSR0;
        if status == SysConnStatus::ConnOpen && use_ssr {
            index = spec.ssr;
        } else if id == ServiceId::Av {
            if status == SysConnStatus::ConnBusy {
                index = SSR4;
            } else if status == SysConnStatus::ConnIdle {
                index = spec.ssr;
            }
        }

        let act = spec.actions[status as usize];
        if act.action == action::NO_ACTION && index == SSR0 {
            return;
        }

        let existing = self.services.find(id, app_id, peer);
        if let Some(j) = existing {
            self.services.entries_mut()[j].new_request = true;
        }

        if act.action == action::NO_PREF {
            // The service no longer cares; drop its entry.
            match existing {
                Some(j) => self.services.remove(j),
                None => {
                    warn!("no entry for connected service cbs");
                    return;
                }
            }
        } else if let Some(j) = existing {
            self.services.entries_mut()[j].state = status;
        } else if !self.services.push(ServiceEntry {
            id,
            app_id,
            state: status,
            peer,
            new_request: true,
        }) {
            return;
        }

        self.timers.stop_all(&mut self.alarms, peer);
        let pm_req = if self.services.count() > 0 {
            debug!(
                "Stopped timer for current service, restart other service timers: count = {}",
                self.services.count()
            );
            PmReq::Restart
        } else {
            PmReq::New
        };

        if let Some(i) = self.find_device(peer) {
            self.devices[i].pm_mode_attempted = action::NO_ACTION;
            self.devices[i].pm_mode_failed = action::NO_ACTION;
        }

        if SSR_SPECS[index].max_latency > 0 || index == SSR_HH {
            // Never subrate around an AVDTP start.
            if !(id == ServiceId::Av && status == SysConnStatus::ConnBusy) {
                self.ssr(peer, index);
            } else {
                debug!("Do not perform SSR when AVDTP start");
            }
        } else if self.controller.supports_sniff_subrating
            && self.btm.remote_supports_ssr(peer)
            && index == SSR0
        {
            if status == SysConnStatus::ScoOpen {
                debug!("SCO active, reset SSR to zero");
                self.btm.set_ssr_params(peer, 0, 0, 0);
            } else if status == SysConnStatus::ScoClose {
                debug!("SCO closed, back to old SSR");
                self.ssr(peer, SSR0);
            }
        }

        self.set_mode(peer, action::NO_ACTION, pm_req);
    }

    /// Reconciles the desired power mode for `peer` over all its connected
    /// services and either arms a delay timer or issues the mode.
    pub fn set_mode(&mut self, peer: Address, pm_request: u8, pm_req: PmReq) {
        if self.devices.is_empty() {
            info!("Device list count is zero");
            return;
        }
        let dev_idx = match self.find_device(peer) {
            Some(i) => i,
            None => {
                info!("No peer device found");
                return;
            }
        };
        let failed_pm = self.devices[dev_idx].pm_mode_failed;

        let mut pm_action = action::NO_ACTION;
        let mut timeout = Duration::ZERO;
        let mut allowed_modes = 0u8;
        let mut pref_modes = 0u8;
        let mut timer_srvc_id = None;

        for entry in self.services.entries_mut().iter_mut().filter(|e| e.peer == peer) {
            let cfg = match find_pm_config(entry.id, entry.app_id) {
                Some(cfg) => cfg,
                None => continue,
            };
            let spec = &PM_SPECS[cfg.spec_idx];
            let act = spec.actions[entry.state as usize];
            allowed_modes |= spec.allow_mask;
            timer_srvc_id = Some(entry.id);
            debug!(
                "Service:{:?} state:{:?} allowed_modes:0x{:02x}",
                entry.id, entry.state, allowed_modes
            );

            // Actions are compared in strictness order; modes that already
            // failed on this peer are skipped until the next connection
            // refreshes the record.
            if failed_pm & act.action == 0 {
                pref_modes |= act.action;
                if act.action >= pm_action {
                    pm_action = act.action;
                    if pm_req != PmReq::New || entry.new_request {
                        entry.new_request = false;
                        timeout = act.timeout;
                    }
                }
            }
        }

        if action::is_park(pm_action) || action::is_sniff(pm_action) {
            // Some service dislikes the chosen mode; fall back to the other
            // allowed, preferred one, or do nothing.
            if allowed_modes & pm_action == 0 {
                pm_action = allowed_modes & (action::PARK | action::SNIFF) & pref_modes;
                if pm_action == action::NO_ACTION {
                    timeout = Duration::ZERO;
                }
            }
        }

        if pm_req != PmReq::Execute && timeout > Duration::ZERO {
            let srvc_id = match timer_srvc_id {
                Some(id) => id,
                None => return,
            };
            if let Some(idx) = PmTimerIdx::from_action(pm_action) {
                if let Some(slot) = self.timers.claim(peer) {
                    let token = AlarmToken::PmTimer(slot, idx as usize);
                    let armed = self.timers.is_armed(slot, idx);
                    let remaining = self.alarms.remaining(token).unwrap_or(Duration::ZERO);
                    // An index armed at a later deadline restarts at the
                    // earlier one.
                    if !armed || remaining > timeout {
                        self.timers.stop_index(&mut self.alarms, slot, idx);
                        self.timers.start(
                            &mut self.alarms,
                            slot,
                            peer,
                            idx,
                            timeout,
                            srvc_id,
                            pm_action,
                        );
                    }
                }
            }
            return;
        }

        // An expired timer whose action is weaker than what the profiles
        // now require is stale.
        if pm_req == PmReq::Execute && pm_request < pm_action {
            error!("Ignore the power mode request: 0x{:02x}", pm_request);
            return;
        }

        if pm_action == action::PARK {
            self.devices[dev_idx].pm_mode_attempted = action::PARK;
            warn!("DEPRECATED Setting link to park mode peer:{}", peer);
            self.park(peer);
        } else if action::is_sniff(pm_action) {
            if self.btm.is_sniff_allowed(peer) {
                debug!("Link policy allows sniff mode so setting mode peer:{}", peer);
                self.devices[dev_idx].pm_mode_attempted = action::SNIFF;
                self.sniff(dev_idx, (pm_action & 0x0f) as usize);
            } else {
                debug!("Link policy disallows sniff mode, ignore request peer:{}", peer);
            }
        } else if pm_action == action::ACTIVE {
            debug!("Setting link to active mode peer:{}", peer);
            self.active(peer);
        }
    }

    /// Switch the link to sniff, unless the controller already accepted the
    /// remote's sniff parameters (avoiding a sniff loop with aggressive
    /// remotes).
    fn sniff(&mut self, dev_idx: usize, index: usize) {
        let peer = self.devices[dev_idx].peer;
        let mode = self.btm.read_power_mode(peer).unwrap_or(LinkMode::Active);
        let info = self.devices[dev_idx].info;
        debug!("Current power mode:{:?} peer_info:{:?}", mode, info);

        let remote_ssr =
            self.controller.supports_sniff_subrating && self.btm.remote_supports_ssr(peer);
        if mode != LinkMode::Sniff || (remote_ssr && !info.contains(DeviceInfo::USE_SSR)) {
            if mode == LinkMode::Sniff && info.contains(DeviceInfo::ACP_SNIFF) {
                debug!("Link already in sniff mode peer:{}", peer);
                return;
            }
        }

        let mut params = self.sniff_table.sniff_entry(index);
        if info.contains(DeviceInfo::INT_SNIFF) {
            debug!("Trying to force power mode");
            params.force = true;
        }
        let status = self.btm.set_power_mode(peer, params);
        let dev = &mut self.devices[dev_idx];
        if status.is_accepted() {
            dev.info.remove(DeviceInfo::INT_SNIFF | DeviceInfo::ACP_SNIFF);
            dev.info.insert(DeviceInfo::SET_SNIFF);
        } else if status == PmCmdStatus::Success {
            debug!("set_power_mode() returned success");
            dev.info
                .remove(DeviceInfo::INT_SNIFF | DeviceInfo::ACP_SNIFF | DeviceInfo::SET_SNIFF);
        } else {
            error!("Unable to set power mode peer:{} status:{:?}", peer, status);
            dev.info
                .remove(DeviceInfo::INT_SNIFF | DeviceInfo::ACP_SNIFF | DeviceInfo::SET_SNIFF);
        }
    }

    /// Switch to park if the link is not parked already.
    fn park(&mut self, peer: Address) {
        let mode = self.btm.read_power_mode(peer);
        if mode.is_none() {
            warn!("Unable to read power mode for peer:{}", peer);
        }
        if mode != Some(LinkMode::Park) {
            let status = self.btm.set_power_mode(peer, self.sniff_table.park_entry());
            if !status.is_accepted() && status != PmCmdStatus::Success {
                warn!("Unable to set park power mode");
            }
        }
    }

    /// Brings the connection to active mode.
    pub fn active(&mut self, peer: Address) {
        let status = self.btm.set_power_mode(peer, PowerModeParams::active());
        match status {
            PmCmdStatus::Stored => {
                debug!("Active power mode stored for execution later for remote:{}", peer)
            }
            PmCmdStatus::Started => debug!("Active power mode started for remote:{}", peer),
            PmCmdStatus::Success => debug!("Active power mode already set for device:{}", peer),
            other => {
                warn!("Unable to set active power mode for device:{} status:{:?}", peer, other)
            }
        }
    }

    /// Checks and sends SSR parameters, picking the spec with the smallest
    /// maximum latency across the peer's connected services.
    fn ssr(&mut self, peer: Address, ssr_request: usize) {
        let mut ssr_index = ssr_request;
        let mut spec = SSR_SPECS[ssr_index];
        debug!("Request to put link to device:{} into spec:{}", peer, spec.name);

        let on_peer: Vec<(ServiceId, u8)> = self
            .services
            .entries()
            .iter()
            .filter(|e| e.peer == peer)
            .map(|e| (e.id, e.app_id))
            .collect();
        for (id, app_id) in on_peer {
            let current = find_pm_config(id, app_id)
                .map(|c| PM_SPECS[c.spec_idx].ssr)
                .unwrap_or(SSR0);
            let mut spec_cur = SSR_SPECS[current];
            if current == SSR_HH {
                // HID carries a per-connection preference read from its
                // descriptor.
                match self.hid.as_ref().and_then(|h| h.read_ssr_params(peer)) {
                    Some((max_latency, min_remote_timeout)) => {
                        spec_cur.max_latency = max_latency;
                        spec_cur.min_remote_timeout = min_remote_timeout;
                    }
                    None => continue,
                }
            }
            if current == ssr_index {
                spec = spec_cur;
            } else if spec_cur.max_latency < spec.max_latency
                || (ssr_index == SSR0 && current != SSR0)
            {
                debug!(
                    "Changing sniff subrating specification for {} from {} to {}",
                    peer, spec.name, spec_cur.name
                );
                ssr_index = current;
                spec = spec_cur;
            }
        }

        if spec.max_latency > 0 {
            // Avoid SSR reset on a device with SCO connected.
            if let Some(idx) = self.services.sco_index() {
                if self.services.entries()[idx].peer == peer {
                    warn!("SCO is active on device, ignore SSR");
                    return;
                }
            }
            debug!(
                "Setting sniff subrating for device:{} spec:{} max_latency:{} min_remote_timeout:{} min_local_timeout:{}",
                peer, spec.name, spec.max_latency, spec.min_remote_timeout, spec.min_local_timeout
            );
            self.btm.set_ssr_params(
                peer,
                spec.max_latency,
                spec.min_remote_timeout,
                spec.min_local_timeout,
            );
        }
    }

    /// Controller power status event.
    pub fn on_btm_status(
        &mut self,
        peer: Address,
        status: PmStatus,
        interval: u16,
        hci_status: ErrorCode,
    ) {
        debug!(
            "Power mode notification event status:{:?} peer:{} interval:{} hci_status:{:?}",
            status, peer, interval, hci_status
        );
        let dev_idx = match self.find_device(peer) {
            Some(i) => i,
            None => {
                info!("Unable to process power event for peer:{}", peer);
                return;
            }
        };
        let info = self.devices[dev_idx].info;

        match status {
            PmStatus::Active => {
                if !hci_status.is_success() {
                    // The sniff or park attempt failed; do not try it again
                    // until the next connection.
                    error!("active mode event with hci_status={:?}", hci_status);
                    self.devices[dev_idx].info.remove(
                        DeviceInfo::INT_SNIFF | DeviceInfo::ACP_SNIFF | DeviceInfo::SET_SNIFF,
                    );
                    let attempted = self.devices[dev_idx].pm_mode_attempted;
                    if action::is_park(attempted) || action::is_sniff(attempted) {
                        self.devices[dev_idx].pm_mode_failed |=
                            (action::PARK | action::SNIFF) & attempted;
                        self.timers.stop_by_mode(&mut self.alarms, peer, attempted);
                        self.set_mode(peer, action::NO_ACTION, PmReq::Restart);
                    }
                } else {
                    if self.devices[dev_idx].prev_low.is_some() {
                        // Re-send the SSR parameters to the controller.
                        self.ssr(peer, SSR0);
                    }
                    self.devices[dev_idx].prev_low = None;
                    // Back to active; restart the timers for the next
                    // low-power transition.
                    self.timers.stop_all(&mut self.alarms, peer);
                    self.set_mode(peer, action::NO_ACTION, PmReq::Restart);
                }
            }
            PmStatus::Park | PmStatus::Hold => {
                // SSR parameters are sent on connection open and stay good
                // until park/hold/detach; remember the low mode so they can
                // be re-issued.
                if info.contains(DeviceInfo::USE_SSR) {
                    self.devices[dev_idx].prev_low = Some(status);
                }
            }
            PmStatus::Ssr => {
                if !hci_status.is_success() {
                    warn!("Received error when attempting to set sniff subrating mode");
                }
                if interval > 0 {
                    debug!("Enabling sniff subrating mode for peer:{}", peer);
                    self.devices[dev_idx].info.insert(DeviceInfo::USE_SSR);
                } else {
                    debug!("Disabling sniff subrating mode for peer:{}", peer);
                    self.devices[dev_idx].info.remove(DeviceInfo::USE_SSR);
                }
            }
            PmStatus::Sniff => {
                if hci_status.is_success() {
                    // The remote put the link into sniff before our delay
                    // timer did; the timer's sole purpose is gone.
                    self.timers.stop_all(&mut self.alarms, peer);
                } else {
                    let dev = &mut self.devices[dev_idx];
                    dev.info.remove(
                        DeviceInfo::SET_SNIFF | DeviceInfo::INT_SNIFF | DeviceInfo::ACP_SNIFF,
                    );
                    if info.contains(DeviceInfo::SET_SNIFF) {
                        dev.info.insert(DeviceInfo::INT_SNIFF);
                    } else {
                        dev.info.insert(DeviceInfo::ACP_SNIFF);
                    }
                }
            }
            PmStatus::Error => {
                self.devices[dev_idx].info.remove(DeviceInfo::SET_SNIFF);
            }
        }
    }

    /// Mode Change event routed from the controller.
    pub fn on_mode_change(
        &mut self,
        peer: Address,
        mode: LinkMode,
        interval: u16,
        hci_status: ErrorCode,
    ) {
        self.btm.on_mode_change(peer, mode, hci_status);
        let status = match mode {
            LinkMode::Active => PmStatus::Active,
            LinkMode::Hold => PmStatus::Hold,
            LinkMode::Sniff => PmStatus::Sniff,
            LinkMode::Park => PmStatus::Park,
        };
        self.on_btm_status(peer, status, interval, hci_status);
    }

    /// Sniff Subrating event routed from the controller.
    pub fn on_sniff_subrating(
        &mut self,
        peer: Address,
        max_tx_latency: u16,
        hci_status: ErrorCode,
    ) {
        self.on_btm_status(peer, PmStatus::Ssr, max_tx_latency, hci_status);
    }

    /// A PM delay timer fired.
    pub fn on_alarm(&mut self, token: AlarmToken) {
        self.alarms.on_fired(token);
        if let AlarmToken::PmTimer(slot, idx) = token {
            if let Some((peer, pm_action)) = self.timers.on_fired(slot, idx) {
                self.set_mode(peer, pm_action, PmReq::Execute);
            }
        }
    }
}
