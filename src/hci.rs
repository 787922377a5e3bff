//! HCI command/event model and the ordered command dispatcher.
//!
//! Commands are enqueued with a [`CommandContext`] describing the
//! continuation; the dispatcher keeps one command in flight, correlates the
//! completion by opcode (and sub-opcode for the vendor multi-advertising
//! command), and hands the pair back to the stack for routing. Completions
//! that match nothing are logged and dropped.

use std::collections::VecDeque;

use log::warn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::address::{Address, AddressWithType};
use crate::gap_data::Operation;

pub type AdvertiserId = u8;
pub type RegId = i32;

pub const INVALID_ADVERTISER_ID: AdvertiserId = 0xff;
pub const INVALID_HANDLE: AdvertiserId = 0xff;

/// Advertising duration as a count of 10 ms controller ticks. Kept distinct
/// from host-side `std::time::Duration` so the two units cannot be mixed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DurationTicks(pub u16);

impl DurationTicks {
    pub const INDEFINITE: DurationTicks = DurationTicks(0);

    pub fn is_indefinite(&self) -> bool {
        self.0 == 0
    }
}

/// One entry of the extended-advertising enable command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnabledSet {
    pub advertising_handle: AdvertiserId,
    pub duration: DurationTicks,
    pub max_extended_advertising_events: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpCode {
    LeSetAdvertisingParameters,
    LeSetAdvertisingData,
    LeSetScanResponseData,
    LeSetAdvertisingEnable,
    LeMultiAdvt,
    LeSetExtendedAdvertisingParameters,
    LeSetExtendedAdvertisingData,
    LeSetExtendedScanResponseData,
    LeSetExtendedAdvertisingEnable,
    LeSetPeriodicAdvertisingParameters,
    LeSetPeriodicAdvertisingData,
    LeSetPeriodicAdvertisingEnable,
    LeSetAdvertisingSetRandomAddress,
    LeSetRandomAddress,
    LeRemoveAdvertisingSet,
    LeReadAdvertisingPhysicalChannelTxPower,
    LeRand,
    SetPowerMode,
    SetSniffSubratingParams,
}

/// Sub-opcode of the vendor LE_MULTI_ADVT command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubOcf {
    SetParam,
    SetData,
    SetScanResp,
    SetRandomAddr,
    SetEnable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0x00,
    UnknownHciCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    MemoryCapacityExceeded = 0x07,
    CommandDisallowed = 0x0c,
    UnsupportedFeatureOrParameterValue = 0x11,
    InvalidHciCommandParameters = 0x12,
    AdvertisingTimeout = 0x3c,
    ConnectionFailedEstablishment = 0x3e,
    LimitReached = 0x43,
    OperationCancelledByHost = 0x44,
}

impl ErrorCode {
    pub fn is_success(&self) -> bool {
        *self == ErrorCode::Success
    }
}

/// Classic link power mode, as carried by Mode Change events and the
/// SET_POWER_MODE command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkMode {
    Active = 0x00,
    Hold = 0x01,
    Sniff = 0x02,
    Park = 0x03,
}

/// SET_POWER_MODE parameter block: the sniff/park interval bounds plus the
/// target mode. `force` asks the controller to re-negotiate even if the
/// remote already switched the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowerModeParams {
    pub mode: LinkMode,
    pub max_interval: u16,
    pub min_interval: u16,
    pub attempt: u16,
    pub timeout: u16,
    pub force: bool,
}

impl PowerModeParams {
    pub fn active() -> Self {
        PowerModeParams {
            mode: LinkMode::Active,
            max_interval: 0,
            min_interval: 0,
            attempt: 0,
            timeout: 0,
            force: false,
        }
    }
}

/// Commands the core emits towards the controller. Advertising payloads are
/// already serialized LTV streams by the time they reach a command.
#[derive(Clone, Debug, PartialEq)]
pub enum HciCommand {
    LeSetAdvertisingParameters {
        interval_min: u16,
        interval_max: u16,
        advertising_type: u8,
        own_address_type: u8,
        peer_address: AddressWithType,
        channel_map: u8,
        filter_policy: u8,
    },
    LeSetAdvertisingData {
        data: Vec<u8>,
    },
    LeSetScanResponseData {
        data: Vec<u8>,
    },
    LeSetAdvertisingEnable {
        enable: bool,
    },
    LeMultiAdvtParam {
        advertising_handle: AdvertiserId,
        interval_min: u16,
        interval_max: u16,
        advertising_type: u8,
        own_address: Address,
        own_address_type: u8,
        peer_address: AddressWithType,
        channel_map: u8,
        filter_policy: u8,
        tx_power: i8,
    },
    LeMultiAdvtSetData {
        advertising_handle: AdvertiserId,
        data: Vec<u8>,
    },
    LeMultiAdvtSetScanResp {
        advertising_handle: AdvertiserId,
        data: Vec<u8>,
    },
    LeMultiAdvtSetRandomAddr {
        advertising_handle: AdvertiserId,
        address: Address,
    },
    LeMultiAdvtSetEnable {
        advertising_handle: AdvertiserId,
        enable: bool,
    },
    LeSetExtendedAdvertisingParameters {
        advertising_handle: AdvertiserId,
        connectable: bool,
        scannable: bool,
        directed: bool,
        high_duty_cycle: bool,
        legacy: bool,
        anonymous: bool,
        include_tx_power: bool,
        interval_min: u32,
        interval_max: u32,
        channel_map: u8,
        own_address_type: u8,
        peer_address: AddressWithType,
        filter_policy: u8,
        tx_power: i8,
        sid: u8,
        scan_request_notification: bool,
    },
    LeSetExtendedAdvertisingData {
        advertising_handle: AdvertiserId,
        operation: Operation,
        data: Vec<u8>,
    },
    LeSetExtendedScanResponseData {
        advertising_handle: AdvertiserId,
        operation: Operation,
        data: Vec<u8>,
    },
    LeSetExtendedAdvertisingEnable {
        enable: bool,
        sets: Vec<EnabledSet>,
    },
    LeSetPeriodicAdvertisingParameters {
        advertising_handle: AdvertiserId,
        interval_min: u16,
        interval_max: u16,
        include_tx_power: bool,
    },
    LeSetPeriodicAdvertisingData {
        advertising_handle: AdvertiserId,
        operation: Operation,
        data: Vec<u8>,
    },
    LeSetPeriodicAdvertisingEnable {
        advertising_handle: AdvertiserId,
        enable: bool,
        include_adi: bool,
    },
    LeSetAdvertisingSetRandomAddress {
        advertising_handle: AdvertiserId,
        address: Address,
    },
    LeSetRandomAddress {
        address: Address,
    },
    LeRemoveAdvertisingSet {
        advertising_handle: AdvertiserId,
    },
    LeReadAdvertisingPhysicalChannelTxPower,
    LeRand,
    SetPowerMode {
        peer: Address,
        params: PowerModeParams,
    },
    SetSniffSubratingParams {
        peer: Address,
        max_latency: u16,
        min_remote_timeout: u16,
        min_local_timeout: u16,
    },
}

impl HciCommand {
    pub fn opcode(&self) -> OpCode {
        match self {
            HciCommand::LeSetAdvertisingParameters { .. } => OpCode::LeSetAdvertisingParameters,
            HciCommand::LeSetAdvertisingData { .. } => OpCode::LeSetAdvertisingData,
            HciCommand::LeSetScanResponseData { .. } => OpCode::LeSetScanResponseData,
            HciCommand::LeSetAdvertisingEnable { .. } => OpCode::LeSetAdvertisingEnable,
            HciCommand::LeMultiAdvtParam { .. }
            | HciCommand::LeMultiAdvtSetData { .. }
            | HciCommand::LeMultiAdvtSetScanResp { .. }
            | HciCommand::LeMultiAdvtSetRandomAddr { .. }
            | HciCommand::LeMultiAdvtSetEnable { .. } => OpCode::LeMultiAdvt,
            HciCommand::LeSetExtendedAdvertisingParameters { .. } => {
                OpCode::LeSetExtendedAdvertisingParameters
            }
            HciCommand::LeSetExtendedAdvertisingData { .. } => {
                OpCode::LeSetExtendedAdvertisingData
            }
            HciCommand::LeSetExtendedScanResponseData { .. } => {
                OpCode::LeSetExtendedScanResponseData
            }
            HciCommand::LeSetExtendedAdvertisingEnable { .. } => {
                OpCode::LeSetExtendedAdvertisingEnable
            }
            HciCommand::LeSetPeriodicAdvertisingParameters { .. } => {
                OpCode::LeSetPeriodicAdvertisingParameters
            }
            HciCommand::LeSetPeriodicAdvertisingData { .. } => {
                OpCode::LeSetPeriodicAdvertisingData
            }
            HciCommand::LeSetPeriodicAdvertisingEnable { .. } => {
                OpCode::LeSetPeriodicAdvertisingEnable
            }
            HciCommand::LeSetAdvertisingSetRandomAddress { .. } => {
                OpCode::LeSetAdvertisingSetRandomAddress
            }
            HciCommand::LeSetRandomAddress { .. } => OpCode::LeSetRandomAddress,
            HciCommand::LeRemoveAdvertisingSet { .. } => OpCode::LeRemoveAdvertisingSet,
            HciCommand::LeReadAdvertisingPhysicalChannelTxPower => {
                OpCode::LeReadAdvertisingPhysicalChannelTxPower
            }
            HciCommand::LeRand => OpCode::LeRand,
            HciCommand::SetPowerMode { .. } => OpCode::SetPowerMode,
            HciCommand::SetSniffSubratingParams { .. } => OpCode::SetSniffSubratingParams,
        }
    }

    pub fn sub_opcode(&self) -> Option<SubOcf> {
        match self {
            HciCommand::LeMultiAdvtParam { .. } => Some(SubOcf::SetParam),
            HciCommand::LeMultiAdvtSetData { .. } => Some(SubOcf::SetData),
            HciCommand::LeMultiAdvtSetScanResp { .. } => Some(SubOcf::SetScanResp),
            HciCommand::LeMultiAdvtSetRandomAddr { .. } => Some(SubOcf::SetRandomAddr),
            HciCommand::LeMultiAdvtSetEnable { .. } => Some(SubOcf::SetEnable),
            _ => None,
        }
    }
}

/// Return parameters of a command completion, beyond the status byte.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReturnParams {
    None,
    SelectedTxPower(i8),
    TxPowerLevel(i8),
    RandomNumber(u64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CommandComplete {
    pub opcode: OpCode,
    pub sub_opcode: Option<SubOcf>,
    pub status: ErrorCode,
    pub return_params: ReturnParams,
}

impl CommandComplete {
    pub fn success(opcode: OpCode) -> Self {
        CommandComplete {
            opcode,
            sub_opcode: None,
            status: ErrorCode::Success,
            return_params: ReturnParams::None,
        }
    }
}

/// Reason codes of the vendor BLE_STCHANGE event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VseStateChangeReason {
    ConnectionReceived,
    Unknown(u8),
}

/// Events the core consumes from the controller.
#[derive(Clone, Debug, PartialEq)]
pub enum HciEvent {
    CommandComplete(CommandComplete),
    AdvertisingSetTerminated {
        status: ErrorCode,
        advertising_handle: AdvertiserId,
        connection_handle: u16,
        num_completed_events: u8,
    },
    ScanRequestReceived {
        advertising_handle: AdvertiserId,
        scanner_address: AddressWithType,
    },
    VendorStateChange {
        advertising_handle: AdvertiserId,
        reason: VseStateChangeReason,
        connection_handle: u16,
    },
    ModeChange {
        hci_status: ErrorCode,
        peer: Address,
        mode: LinkMode,
        interval: u16,
    },
    SniffSubrating {
        hci_status: ErrorCode,
        peer: Address,
        max_tx_latency: u16,
        max_rx_latency: u16,
    },
}

/// Continuation attached to each enqueued command. The stack routes the
/// completion to the owning component based on this tag.
#[derive(Debug)]
pub enum CommandContext {
    /// Log on failure, nothing else.
    CheckComplete,
    AdvParameters { id: AdvertiserId },
    AdvRandomAddress { id: AdvertiserId, address: AddressWithType },
    AdvData { id: AdvertiserId, scan_response: bool, send_callback: bool },
    AdvEnable { enable: bool, sets: Vec<EnabledSet>, trigger_callbacks: bool },
    PeriodicParameters { id: AdvertiserId },
    PeriodicData { id: AdvertiserId, send_callback: bool },
    PeriodicEnable { id: AdvertiserId, enable: bool },
    ReadChannelTxPower,
    KeyMaterialRand { iteration: u8 },
    PowerMode { peer: Address },
    SsrParams { peer: Address },
}

struct PendingCommand {
    opcode: OpCode,
    sub_opcode: Option<SubOcf>,
    context: CommandContext,
}

/// Strictly-FIFO dispatcher with one command in flight. Completions are
/// matched against the in-flight command; everything else is dropped.
pub struct HciDispatcher {
    cmd_tx: UnboundedSender<HciCommand>,
    queue: VecDeque<(HciCommand, CommandContext)>,
    inflight: Option<PendingCommand>,
}

impl HciDispatcher {
    /// Returns the dispatcher and the receiving end of the raw command
    /// stream consumed by the transport.
    pub fn new() -> (Self, UnboundedReceiver<HciCommand>) {
        let (cmd_tx, cmd_rx) = unbounded_channel();
        (HciDispatcher { cmd_tx, queue: VecDeque::new(), inflight: None }, cmd_rx)
    }

    /// Places a command at the tail of the queue and submits it immediately
    /// if nothing is in flight.
    pub fn enqueue(&mut self, cmd: HciCommand, context: CommandContext) {
        self.queue.push_back((cmd, context));
        if self.inflight.is_none() {
            self.submit_next();
        }
    }

    fn submit_next(&mut self) {
        if let Some((cmd, context)) = self.queue.pop_front() {
            let pending =
                PendingCommand { opcode: cmd.opcode(), sub_opcode: cmd.sub_opcode(), context };
            if self.cmd_tx.send(cmd).is_err() {
                warn!("HCI transport is gone; dropping command {:?}", pending.opcode);
            }
            self.inflight = Some(pending);
        }
    }

    /// Correlates a completion with the in-flight command. Returns the
    /// command's context paired with the completion for routing, or None if
    /// the completion did not match anything.
    pub fn on_command_complete(
        &mut self,
        complete: CommandComplete,
    ) -> Option<(CommandContext, CommandComplete)> {
        let matches = match &self.inflight {
            Some(pending) => {
                pending.opcode == complete.opcode && pending.sub_opcode == complete.sub_opcode
            }
            None => false,
        };
        if !matches {
            warn!(
                "Dropping unmatched command complete for {:?} (sub {:?})",
                complete.opcode, complete.sub_opcode
            );
            return None;
        }
        let pending = self.inflight.take().unwrap();
        self.submit_next();
        Some((pending.context, complete))
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len() + usize::from(self.inflight.is_some())
    }
}
