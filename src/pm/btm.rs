//! Link power-mode front-end: per-peer mode tracking, the one-pending-
//! command rule, and the SET_POWER_MODE / SSR command plumbing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::address::Address;
use crate::hci::{
    CommandContext, ErrorCode, HciCommand, HciDispatcher, LinkMode, PowerModeParams,
};

/// Outcome of a power-mode request, mirroring the classic BTM statuses the
/// callers branch on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmCmdStatus {
    /// Command handed to the controller.
    Started,
    /// Saved; will be issued once the pending command resolves.
    Stored,
    /// The link is already in the requested mode.
    Success,
    /// No such link.
    UnknownLink,
}

impl PmCmdStatus {
    /// Whether the request counts as accepted for failure tracking.
    pub fn is_accepted(&self) -> bool {
        matches!(self, PmCmdStatus::Started | PmCmdStatus::Stored)
    }
}

fn mode_rank(mode: LinkMode) -> u8 {
    match mode {
        LinkMode::Park | LinkMode::Hold => 1,
        LinkMode::Sniff => 2,
        LinkMode::Active => 3,
    }
}

struct PeerLink {
    mode: LinkMode,
    pending: Option<PowerModeParams>,
    queued: Option<PowerModeParams>,
    sniff_allowed: bool,
    remote_supports_ssr: bool,
}

impl PeerLink {
    fn new() -> Self {
        PeerLink {
            mode: LinkMode::Active,
            pending: None,
            queued: None,
            sniff_allowed: true,
            remote_supports_ssr: false,
        }
    }
}

/// Issues SET_POWER_MODE and SSR-parameter commands, keeping at most one
/// pending mode command per peer. A later request of equal or lower
/// strictness does not preempt a pending stricter one.
pub struct BtmPm {
    hci: Arc<Mutex<HciDispatcher>>,
    links: HashMap<Address, PeerLink>,
}

impl BtmPm {
    pub fn new(hci: Arc<Mutex<HciDispatcher>>) -> Self {
        BtmPm { hci, links: HashMap::new() }
    }

    pub fn on_connection_up(&mut self, peer: Address) {
        self.links.entry(peer).or_insert_with(PeerLink::new);
    }

    pub fn on_connection_down(&mut self, peer: Address) {
        self.links.remove(&peer);
    }

    pub fn read_power_mode(&self, peer: Address) -> Option<LinkMode> {
        self.links.get(&peer).map(|l| l.mode)
    }

    pub fn set_sniff_allowed(&mut self, peer: Address, allowed: bool) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.sniff_allowed = allowed;
        }
    }

    pub fn is_sniff_allowed(&self, peer: Address) -> bool {
        self.links.get(&peer).map_or(false, |l| l.sniff_allowed)
    }

    pub fn set_remote_supports_ssr(&mut self, peer: Address, supported: bool) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.remote_supports_ssr = supported;
        }
    }

    pub fn remote_supports_ssr(&self, peer: Address) -> bool {
        self.links.get(&peer).map_or(false, |l| l.remote_supports_ssr)
    }

    /// Requests a mode transition.
    pub fn set_power_mode(&mut self, peer: Address, params: PowerModeParams) -> PmCmdStatus {
        let link = match self.links.get_mut(&peer) {
            Some(link) => link,
            None => return PmCmdStatus::UnknownLink,
        };

        if link.mode == params.mode && !params.force {
            return PmCmdStatus::Success;
        }

        if let Some(pending) = link.pending {
            if mode_rank(params.mode) <= mode_rank(pending.mode) {
                debug!("Pending {:?} not preempted by {:?}", pending.mode, params.mode);
            } else {
                link.queued = Some(params);
            }
            return PmCmdStatus::Stored;
        }

        link.pending = Some(params);
        self.hci
            .lock()
            .unwrap()
            .enqueue(HciCommand::SetPowerMode { peer, params }, CommandContext::PowerMode { peer });
        PmCmdStatus::Started
    }

    /// Mode Change event from the controller; resolves the pending command
    /// and issues any queued stricter request. Returns the settled mode.
    pub fn on_mode_change(&mut self, peer: Address, mode: LinkMode, hci_status: ErrorCode) {
        let link = match self.links.get_mut(&peer) {
            Some(link) => link,
            None => {
                warn!("Mode change for unknown link {}", peer);
                return;
            }
        };
        if hci_status.is_success() {
            link.mode = mode;
        }
        link.pending = None;
        if let Some(queued) = link.queued.take() {
            self.set_power_mode(peer, queued);
        }
    }

    /// Sends sniff-subrating parameters for the link.
    pub fn set_ssr_params(
        &mut self,
        peer: Address,
        max_latency: u16,
        min_remote_timeout: u16,
        min_local_timeout: u16,
    ) {
        self.hci.lock().unwrap().enqueue(
            HciCommand::SetSniffSubratingParams {
                peer,
                max_latency,
                min_remote_timeout,
                min_local_timeout,
            },
            CommandContext::SsrParams { peer },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hci::CommandComplete;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn btm() -> (BtmPm, UnboundedReceiver<HciCommand>, Arc<Mutex<HciDispatcher>>) {
        let (dispatcher, rx) = HciDispatcher::new();
        let hci = Arc::new(Mutex::new(dispatcher));
        (BtmPm::new(hci.clone()), rx, hci)
    }

    fn sniff_params() -> PowerModeParams {
        PowerModeParams {
            mode: LinkMode::Sniff,
            max_interval: 800,
            min_interval: 400,
            attempt: 4,
            timeout: 1,
            force: false,
        }
    }

    #[test]
    fn test_same_mode_is_success() {
        let (mut btm, _rx, _hci) = btm();
        let peer = Address([1; 6]);
        btm.on_connection_up(peer);
        assert_eq!(btm.set_power_mode(peer, PowerModeParams::active()), PmCmdStatus::Success);
    }

    #[test]
    fn test_pending_not_preempted_by_weaker() {
        let (mut btm, mut rx, hci) = btm();
        let peer = Address([1; 6]);
        btm.on_connection_up(peer);

        assert_eq!(btm.set_power_mode(peer, sniff_params()), PmCmdStatus::Started);
        assert!(matches!(rx.try_recv().unwrap(), HciCommand::SetPowerMode { .. }));

        // A second, equal-strictness request is stored, not re-issued.
        assert_eq!(btm.set_power_mode(peer, sniff_params()), PmCmdStatus::Stored);
        // One in flight, nothing else queued towards the controller.
        assert_eq!(hci.lock().unwrap().pending_count(), 1);
    }

    #[test]
    fn test_stricter_request_queued_until_resolution() {
        let (mut btm, mut rx, hci) = btm();
        let peer = Address([1; 6]);
        btm.on_connection_up(peer);
        btm.set_power_mode(peer, sniff_params());

        let mut active = PowerModeParams::active();
        active.force = true;
        assert_eq!(btm.set_power_mode(peer, active), PmCmdStatus::Stored);

        // Resolve the sniff command; the queued active request goes out.
        let cmd = rx.try_recv().unwrap();
        let _ = hci.lock().unwrap().on_command_complete(CommandComplete::success(cmd.opcode()));
        btm.on_mode_change(peer, LinkMode::Sniff, ErrorCode::Success);
        assert!(matches!(
            rx.try_recv().unwrap(),
            HciCommand::SetPowerMode { params: PowerModeParams { mode: LinkMode::Active, .. }, .. }
        ));
        assert_eq!(btm.read_power_mode(peer), Some(LinkMode::Sniff));
    }

    #[test]
    fn test_mode_change_failure_keeps_mode() {
        let (mut btm, _rx, _hci) = btm();
        let peer = Address([1; 6]);
        btm.on_connection_up(peer);
        btm.set_power_mode(peer, sniff_params());
        btm.on_mode_change(peer, LinkMode::Sniff, ErrorCode::CommandDisallowed);
        assert_eq!(btm.read_power_mode(peer), Some(LinkMode::Active));
    }

    #[test]
    fn test_unknown_link() {
        let (mut btm, _rx, _hci) = btm();
        assert_eq!(
            btm.set_power_mode(Address([9; 6]), sniff_params()),
            PmCmdStatus::UnknownLink
        );
    }
}
