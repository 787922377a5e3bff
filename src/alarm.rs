//! One-shot alarms delivered as messages on the stack's main handler.

use std::collections::HashMap;
use std::time::Duration;

use log::warn;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::Message;

/// Identifies a scheduled alarm. Tokens are stable across re-scheduling, so
/// scheduling an already-pending token replaces the pending alarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlarmToken {
    /// Private address rotation for an advertising set.
    AddressRotation(u8),
    /// A power-manager mode timer: (timer slot, mode index within the slot).
    PmTimer(usize, usize),
}

struct PendingAlarm {
    handle: JoinHandle<()>,
    deadline: Instant,
}

/// Schedules one-shot callbacks onto the main handler. A fired alarm is a
/// plain `Message::AlarmFired`; the receiving component re-validates its own
/// state before acting, which makes a fired-but-not-yet-delivered alarm
/// indistinguishable from a cancelled one.
pub struct AlarmService {
    tx: Sender<Message>,
    pending: HashMap<AlarmToken, PendingAlarm>,
}

impl AlarmService {
    pub fn new(tx: Sender<Message>) -> Self {
        AlarmService { tx, pending: HashMap::new() }
    }

    /// Schedules `token` to fire after `delay`, replacing any pending
    /// scheduling of the same token.
    pub fn schedule(&mut self, token: AlarmToken, delay: Duration) {
        self.cancel(token);
        let deadline = Instant::now() + delay;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if tx.send(Message::AlarmFired(token)).await.is_err() {
                warn!("Alarm {:?} fired after the stack shut down", token);
            }
        });
        self.pending.insert(token, PendingAlarm { handle, deadline });
    }

    /// Cancels a pending alarm. Idempotent.
    pub fn cancel(&mut self, token: AlarmToken) {
        if let Some(pending) = self.pending.remove(&token) {
            pending.handle.abort();
        }
    }

    pub fn is_scheduled(&self, token: AlarmToken) -> bool {
        self.pending.contains_key(&token)
    }

    /// Time left until `token` fires, if it is scheduled.
    pub fn remaining(&self, token: AlarmToken) -> Option<Duration> {
        self.pending
            .get(&token)
            .map(|p| p.deadline.saturating_duration_since(Instant::now()))
    }

    /// Marks `token` as delivered. Called by the dispatch loop before the
    /// component handler runs.
    pub fn on_fired(&mut self, token: AlarmToken) {
        self.pending.remove(&token);
    }
}
