//! Per-peer power-mode delay timers: a fixed pool of slots, three mode
//! indices each.

use std::time::Duration;

use log::warn;

use crate::address::Address;
use crate::alarm::{AlarmService, AlarmToken};
use crate::pm::{action, ServiceId};

/// Number of timer slots (one per peer with pending transitions).
pub const PM_TIMER_COUNT: usize = 7;
/// Mode indices per slot.
pub const PM_MODE_TIMER_MAX: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum PmTimerIdx {
    Suspend = 0,
    Park = 1,
    Sniff = 2,
}

impl PmTimerIdx {
    /// Converts a power-mode action into its delay-timer index. Active,
    /// no-preference, no-action and retry have no timer.
    pub fn from_action(pm_action: u8) -> Option<PmTimerIdx> {
        if pm_action & 0xf0 == action::SUSPEND {
            Some(PmTimerIdx::Suspend)
        } else if pm_action == action::PARK {
            Some(PmTimerIdx::Park)
        } else if pm_action & 0xf0 == action::SNIFF {
            Some(PmTimerIdx::Sniff)
        } else {
            None
        }
    }

    pub const ALL: [PmTimerIdx; PM_MODE_TIMER_MAX] =
        [PmTimerIdx::Suspend, PmTimerIdx::Park, PmTimerIdx::Sniff];
}

#[derive(Clone, Copy)]
struct PmTimerSlot {
    in_use: bool,
    peer: Address,
    active: u8,
    srvc_id: [Option<ServiceId>; PM_MODE_TIMER_MAX],
    // Intentionally preserved across stop_index; the next scheduling
    // decision still reads the old value. Only the by-service stop resets
    // it.
    pm_action: [u8; PM_MODE_TIMER_MAX],
}

impl PmTimerSlot {
    const fn idle() -> Self {
        PmTimerSlot {
            in_use: false,
            peer: Address::EMPTY,
            active: 0,
            srvc_id: [None; PM_MODE_TIMER_MAX],
            pm_action: [action::NO_ACTION; PM_MODE_TIMER_MAX],
        }
    }
}

/// Fixed pool of per-peer timer slots. A slot is claimed by the first
/// service needing a timer for that peer, shared by the rest, and released
/// when all indices go idle. State lives on the main handler; the armed
/// alarms deliver back through it.
pub struct PmTimerBank {
    slots: [PmTimerSlot; PM_TIMER_COUNT],
}

impl Default for PmTimerBank {
    fn default() -> Self {
        PmTimerBank { slots: [PmTimerSlot::idle(); PM_TIMER_COUNT] }
    }
}

impl PmTimerBank {
    pub fn new() -> Self {
        PmTimerBank::default()
    }

    /// Slot currently claimed for `peer`.
    pub fn find_slot(&self, peer: Address) -> Option<usize> {
        self.slots.iter().position(|s| s.in_use && s.peer == peer)
    }

    /// First unclaimed slot.
    pub fn find_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| !s.in_use)
    }

    pub fn is_armed(&self, slot: usize, idx: PmTimerIdx) -> bool {
        self.slots[slot].srvc_id[idx as usize].is_some()
    }

    pub fn pm_action(&self, slot: usize, idx: PmTimerIdx) -> u8 {
        self.slots[slot].pm_action[idx as usize]
    }

    /// Arms `idx` of `slot` for `peer`. Keeps the stricter of the existing
    /// and requested action.
    pub fn start(
        &mut self,
        alarms: &mut AlarmService,
        slot: usize,
        peer: Address,
        idx: PmTimerIdx,
        timeout: Duration,
        srvc_id: ServiceId,
        pm_action: u8,
    ) {
        let s = &mut self.slots[slot];
        s.in_use = true;
        s.peer = peer;
        let i = idx as usize;
        if s.srvc_id[i].is_none() {
            s.active += 1;
        }
        if s.pm_action[i] < pm_action {
            s.pm_action[i] = pm_action;
        }
        s.srvc_id[i] = Some(srvc_id);
        alarms.schedule(AlarmToken::PmTimer(slot, i), timeout);
    }

    /// Disarms `idx` of `slot`. The recorded action survives.
    pub fn stop_index(&mut self, alarms: &mut AlarmService, slot: usize, idx: PmTimerIdx) {
        let s = &mut self.slots[slot];
        let i = idx as usize;
        if s.srvc_id[i].is_none() {
            // The timer was not scheduled.
            return;
        }
        debug_assert!(s.in_use, "timer was not scheduled");
        debug_assert!(s.active > 0, "no tasks on timer are active");
        s.srvc_id[i] = None;
        s.active = s.active.saturating_sub(1);
        if s.active == 0 {
            s.in_use = false;
        }
        alarms.cancel(AlarmToken::PmTimer(slot, i));
    }

    /// Stops every timer for `peer`, keeping the recorded actions for the
    /// next scheduling decision.
    pub fn stop_all(&mut self, alarms: &mut AlarmService, peer: Address) {
        if let Some(slot) = self.find_slot(peer) {
            for idx in PmTimerIdx::ALL {
                self.stop_index(alarms, slot, idx);
            }
        }
    }

    /// Stops the timer of one power mode, re-recording that mode as the
    /// slot's action so a later restart proposes it again.
    pub fn stop_by_mode(&mut self, alarms: &mut AlarmService, peer: Address, power_mode: u8) {
        let idx = match PmTimerIdx::from_action(power_mode) {
            Some(idx) => idx,
            None => return,
        };
        if let Some(slot) = self.find_slot(peer) {
            if self.slots[slot].srvc_id[idx as usize].is_some() {
                self.stop_index(alarms, slot, idx);
                self.slots[slot].pm_action[idx as usize] = power_mode;
            }
        }
    }

    /// Stops all timers started by `srvc_id` for `peer`, clearing their
    /// recorded actions.
    pub fn stop_by_srvc_id(&mut self, alarms: &mut AlarmService, peer: Address, srvc_id: ServiceId) {
        for slot in 0..PM_TIMER_COUNT {
            if !(self.slots[slot].in_use && self.slots[slot].peer == peer) {
                continue;
            }
            for idx in PmTimerIdx::ALL {
                if self.slots[slot].srvc_id[idx as usize] == Some(srvc_id) {
                    self.stop_index(alarms, slot, idx);
                    self.slots[slot].pm_action[idx as usize] = action::NO_ACTION;
                    break;
                }
            }
        }
    }

    /// Books a fired alarm out of the slot. Returns the peer and recorded
    /// action if the index was still armed; a cancelled-but-delivered fire
    /// returns None.
    pub fn on_fired(&mut self, slot: usize, idx: usize) -> Option<(Address, u8)> {
        if slot >= PM_TIMER_COUNT || idx >= PM_MODE_TIMER_MAX {
            return None;
        }
        let s = &mut self.slots[slot];
        if !s.in_use || s.srvc_id[idx].is_none() {
            return None;
        }
        s.srvc_id[idx] = None;
        s.active = s.active.saturating_sub(1);
        if s.active == 0 {
            s.in_use = false;
        }
        Some((s.peer, s.pm_action[idx]))
    }

    /// Stops everything and clears the recorded actions; used when PM shuts
    /// down.
    pub fn reset(&mut self, alarms: &mut AlarmService) {
        for slot in 0..PM_TIMER_COUNT {
            for idx in PmTimerIdx::ALL {
                self.stop_index(alarms, slot, idx);
                self.slots[slot].pm_action[idx as usize] = action::NO_ACTION;
            }
        }
    }

    pub fn active_count(&self, slot: usize) -> u8 {
        self.slots[slot].active
    }

    pub fn in_use(&self, slot: usize) -> bool {
        self.slots[slot].in_use
    }

    /// Claims a slot for `peer` or reports exhaustion.
    pub fn claim(&mut self, peer: Address) -> Option<usize> {
        if let Some(slot) = self.find_slot(peer) {
            return Some(slot);
        }
        match self.find_free() {
            Some(slot) => Some(slot),
            None => {
                warn!("no more timers");
                None
            }
        }
    }
}
