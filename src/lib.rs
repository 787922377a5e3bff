//! Host-side Bluetooth core: the LE advertising manager and the classic
//! power manager, glued to a controller through an ordered HCI command
//! dispatcher.
//!
//! All mutable state lives on the stack's main handler: public entry points
//! take `&mut Stack` (or the component managers directly), controller
//! events and alarm fires arrive as [`Message`]s on the main channel, and
//! nothing blocks; continuations are the per-command completion contexts.

pub mod address;
pub mod adv_data;
pub mod adv_manager;
pub mod advertiser;
pub mod alarm;
pub mod config;
pub mod controller;
pub mod enc;
pub mod gap_data;
pub mod hci;
pub mod pm;

use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::mpsc::{channel, Receiver, Sender, UnboundedReceiver};

use crate::address::{AddressPolicy, LeAddressManager};
use crate::adv_manager::AdvertiseManager;
use crate::alarm::{AlarmService, AlarmToken};
use crate::config::StackConfig;
use crate::controller::ControllerInfo;
use crate::enc::KeyStore;
use crate::hci::{CommandContext, HciCommand, HciDispatcher, HciEvent};
use crate::pm::btm::BtmPm;
use crate::pm::tables::SniffTable;
use crate::pm::PowerManager;

/// Messages delivered on the stack's main handler.
#[derive(Debug)]
pub enum Message {
    /// A controller event forwarded by the transport.
    Hci(HciEvent),
    /// A host timer fired.
    AlarmFired(AlarmToken),
}

/// Inits logging for host builds.
pub fn init_logging() {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Owns the component managers and runs the single-threaded dispatch loop.
pub struct Stack {
    adv: AdvertiseManager,
    pm: PowerManager,
    hci: Arc<Mutex<HciDispatcher>>,
    address_manager: Arc<Mutex<LeAddressManager>>,
    rx: Receiver<Message>,
}

impl Stack {
    /// Creates the main-handler channel.
    pub fn create_channel() -> (Sender<Message>, Receiver<Message>) {
        channel(512)
    }

    /// Builds the stack. Returns the raw command stream for the transport
    /// and the sender the transport posts events and timers to.
    pub fn new(
        controller: ControllerInfo,
        config: StackConfig,
        key_store: Box<dyn KeyStore + Send>,
        address_policy: AddressPolicy,
    ) -> (Stack, UnboundedReceiver<HciCommand>, Sender<Message>) {
        let (dispatcher, cmd_rx) = HciDispatcher::new();
        let hci = Arc::new(Mutex::new(dispatcher));
        let (tx, rx) = Stack::create_channel();
        let address_manager = Arc::new(Mutex::new(LeAddressManager::new(
            address_policy,
            controller.mac_address,
        )));

        let adv = AdvertiseManager::new(
            hci.clone(),
            address_manager.clone(),
            AlarmService::new(tx.clone()),
            key_store,
            controller.clone(),
            config.clone(),
        );
        let pm = PowerManager::new(
            AlarmService::new(tx.clone()),
            BtmPm::new(hci.clone()),
            controller,
            SniffTable::from_config(&config),
        );

        (Stack { adv, pm, hci, address_manager, rx }, cmd_rx, tx)
    }

    /// Installs a new IRK and rotates every enabled advertising set's
    /// address synchronously, so later IRK-dependent work sees the new
    /// addresses.
    pub fn rotate_irk(&mut self, irk: [u8; 16]) {
        info!("Rotating IRK");
        self.address_manager.lock().unwrap().set_irk(irk);
        self.adv.on_irk_change();
    }

    pub fn advertise_manager(&mut self) -> &mut AdvertiseManager {
        &mut self.adv
    }

    pub fn power_manager(&mut self) -> &mut PowerManager {
        &mut self.pm
    }

    /// Routes one controller event.
    pub fn on_hci_event(&mut self, event: HciEvent) {
        match event {
            HciEvent::CommandComplete(complete) => {
                let routed = self.hci.lock().unwrap().on_command_complete(complete);
                if let Some((context, complete)) = routed {
                    match context {
                        CommandContext::PowerMode { peer } | CommandContext::SsrParams { peer } => {
                            // Mode outcomes arrive as Mode Change events;
                            // the completion only carries the early NAK.
                            if !complete.status.is_success() {
                                warn!(
                                    "Power command for {} rejected: {:?}",
                                    peer, complete.status
                                );
                            }
                        }
                        context => self.adv.on_command_complete(context, complete),
                    }
                }
            }
            HciEvent::AdvertisingSetTerminated {
                status,
                advertising_handle,
                connection_handle,
                ..
            } => {
                self.adv.handle_set_terminated(status, advertising_handle, connection_handle);
            }
            HciEvent::ScanRequestReceived { advertising_handle, scanner_address } => {
                self.adv.handle_scan_request(advertising_handle, scanner_address);
            }
            HciEvent::VendorStateChange { advertising_handle, reason, connection_handle } => {
                self.adv.handle_vendor_state_change(advertising_handle, reason, connection_handle);
            }
            HciEvent::ModeChange { hci_status, peer, mode, interval } => {
                self.pm.on_mode_change(peer, mode, interval, hci_status);
            }
            HciEvent::SniffSubrating { hci_status, peer, max_tx_latency, .. } => {
                self.pm.on_sniff_subrating(peer, max_tx_latency, hci_status);
            }
        }
    }

    fn on_message(&mut self, msg: Message) {
        match msg {
            Message::Hci(event) => self.on_hci_event(event),
            Message::AlarmFired(token) => match token {
                AlarmToken::AddressRotation(_) => self.adv.on_alarm(token),
                AlarmToken::PmTimer(..) => self.pm.on_alarm(token),
            },
        }
    }

    /// Runs the main handler until every sender is gone.
    pub async fn dispatch(&mut self) {
        while let Some(msg) = self.rx.recv().await {
            self.on_message(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, AddressType, AddressWithType};
    use crate::adv_manager::{AdvertisingConfig, CLIENT_ID_JNI};
    use crate::advertiser::AdvertisingStatus;
    use crate::enc::MemoryKeyStore;
    use crate::gap_data::{data_types, GapData};
    use crate::hci::{
        AdvertiserId, CommandComplete, DurationTicks, ErrorCode, LinkMode, RegId, ReturnParams,
    };
    use crate::pm::{ServiceId, SysConnStatus};
    use std::sync::mpsc as std_mpsc;

    struct StartedSink(std_mpsc::Sender<(RegId, AdvertiserId, AdvertisingStatus)>);

    impl crate::adv_manager::AdvertisingCallbacks for StartedSink {
        fn on_advertising_set_started(
            &mut self,
            reg_id: RegId,
            advertiser_id: AdvertiserId,
            _tx_power: i8,
            status: AdvertisingStatus,
        ) {
            let _ = self.0.send((reg_id, advertiser_id, status));
        }
        fn on_advertising_enabled(&mut self, _: AdvertiserId, _: bool, _: AdvertisingStatus) {}
        fn on_advertising_data_set(&mut self, _: AdvertiserId, _: AdvertisingStatus) {}
        fn on_scan_response_data_set(&mut self, _: AdvertiserId, _: AdvertisingStatus) {}
        fn on_advertising_parameters_updated(
            &mut self,
            _: AdvertiserId,
            _: i8,
            _: AdvertisingStatus,
        ) {
        }
        fn on_periodic_advertising_parameters_updated(
            &mut self,
            _: AdvertiserId,
            _: AdvertisingStatus,
        ) {
        }
        fn on_periodic_advertising_data_set(&mut self, _: AdvertiserId, _: AdvertisingStatus) {}
        fn on_periodic_advertising_enabled(
            &mut self,
            _: AdvertiserId,
            _: bool,
            _: AdvertisingStatus,
        ) {
        }
        fn on_own_address_read(&mut self, _: AdvertiserId, _: AddressType, _: Address) {}
    }

    fn reply_for(cmd: &HciCommand) -> CommandComplete {
        let return_params = match cmd {
            HciCommand::LeSetExtendedAdvertisingParameters { tx_power, .. } => {
                ReturnParams::SelectedTxPower(*tx_power)
            }
            _ => ReturnParams::None,
        };
        CommandComplete {
            opcode: cmd.opcode(),
            sub_opcode: cmd.sub_opcode(),
            status: ErrorCode::Success,
            return_params,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_routes_adv_completions() {
        let (mut stack, mut cmd_rx, _tx) = Stack::new(
            ControllerInfo::default(),
            StackConfig::new(),
            Box::new(MemoryKeyStore::new()),
            AddressPolicy::UseResolvableAddress,
        );
        let (started_tx, started_rx) = std_mpsc::channel();
        stack.advertise_manager().register_callbacks(Box::new(StartedSink(started_tx)));

        let config = AdvertisingConfig {
            connectable: true,
            discoverable: true,
            advertisement: vec![GapData::new(data_types::COMPLETE_LOCAL_NAME, b"dev".to_vec())],
            ..Default::default()
        };
        stack.advertise_manager().create_extended_advertiser(
            CLIENT_ID_JNI,
            11,
            config,
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );

        while let Ok(cmd) = cmd_rx.try_recv() {
            stack.on_hci_event(HciEvent::CommandComplete(reply_for(&cmd)));
        }
        assert_eq!(started_rx.try_recv().unwrap(), (11, 0, AdvertisingStatus::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_routes_mode_change_to_pm() {
        let (mut stack, mut cmd_rx, _tx) = Stack::new(
            ControllerInfo::default(),
            StackConfig::new(),
            Box::new(MemoryKeyStore::new()),
            AddressPolicy::UseResolvableAddress,
        );
        let peer = Address([7; 6]);
        stack.power_manager().on_conn_status_change(
            SysConnStatus::ConnOpen,
            ServiceId::Ag,
            0,
            peer,
        );

        // The remote sniffs first; the pending host timer is dropped.
        stack.on_hci_event(HciEvent::ModeChange {
            hci_status: ErrorCode::Success,
            peer,
            mode: LinkMode::Sniff,
            interval: 0x40,
        });
        tokio::time::advance(std::time::Duration::from_secs(10)).await;
        assert!(cmd_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_irk_rotates_enabled_sets() {
        let (mut stack, mut cmd_rx, _tx) = Stack::new(
            ControllerInfo::default(),
            StackConfig::new(),
            Box::new(MemoryKeyStore::new()),
            AddressPolicy::UseResolvableAddress,
        );
        stack.advertise_manager().create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            AdvertisingConfig {
                connectable: true,
                discoverable: true,
                ..Default::default()
            },
            None,
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        while let Ok(cmd) = cmd_rx.try_recv() {
            stack.on_hci_event(HciEvent::CommandComplete(reply_for(&cmd)));
        }

        stack.rotate_irk([9u8; 16]);
        let mut saw_random_address = false;
        while let Ok(cmd) = cmd_rx.try_recv() {
            if matches!(cmd, HciCommand::LeSetAdvertisingSetRandomAddress { .. }) {
                saw_random_address = true;
            }
            stack.on_hci_event(HciEvent::CommandComplete(reply_for(&cmd)));
        }
        assert!(saw_random_address);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_routes_scan_request() {
        let (mut stack, mut cmd_rx, _tx) = Stack::new(
            ControllerInfo::default(),
            StackConfig::new(),
            Box::new(MemoryKeyStore::new()),
            AddressPolicy::UseResolvableAddress,
        );
        let (scan_tx, scan_rx) = std_mpsc::channel();
        stack.advertise_manager().create_extended_advertiser(
            CLIENT_ID_JNI,
            1,
            AdvertisingConfig::default(),
            Some(Box::new(move |address, address_type| {
                let _ = scan_tx.send((address, address_type));
            })),
            None,
            DurationTicks::INDEFINITE,
            0,
        );
        while let Ok(cmd) = cmd_rx.try_recv() {
            stack.on_hci_event(HciEvent::CommandComplete(reply_for(&cmd)));
        }

        stack.on_hci_event(HciEvent::ScanRequestReceived {
            advertising_handle: 0,
            scanner_address: AddressWithType::new(
                Address([3; 6]),
                AddressType::PublicDeviceAddress,
            ),
        });
        assert_eq!(
            scan_rx.try_recv().unwrap(),
            (Address([3; 6]), AddressType::PublicDeviceAddress)
        );
    }
}
