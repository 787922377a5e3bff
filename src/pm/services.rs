//! Connected-services table: the per-peer list of (service, app, state)
//! entries that drives power-mode decisions.

use log::{info, warn};

use crate::address::Address;
use crate::pm::{ServiceId, SysConnStatus};

/// Maximum simultaneously tracked service connections.
pub const NUM_CONN_SERVICES: usize = 30;

/// Matches any app id in the PM configuration table.
pub const ALL_APP_ID: u8 = 0xff;

#[derive(Clone, Debug)]
pub struct ServiceEntry {
    pub id: ServiceId,
    pub app_id: u8,
    pub state: SysConnStatus,
    pub peer: Address,
    /// Cleared once the entry's request has fed a PM decision.
    pub new_request: bool,
}

/// Bounded, order-preserving table. Removal compacts, which keeps the
/// iteration order the PM algorithm observes stable.
#[derive(Default)]
pub struct ConnectedServices {
    entries: Vec<ServiceEntry>,
}

impl ConnectedServices {
    pub fn new() -> Self {
        ConnectedServices::default()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [ServiceEntry] {
        &mut self.entries
    }

    pub fn find(&self, id: ServiceId, app_id: u8, peer: Address) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.id == id && e.app_id == app_id && e.peer == peer)
    }

    /// Adds a new entry; reports and drops on overflow.
    pub fn push(&mut self, entry: ServiceEntry) -> bool {
        if self.entries.len() == NUM_CONN_SERVICES {
            warn!("no more connected service cbs");
            return false;
        }
        info!("New connection service:{:?} app_id:{}", entry.id, entry.app_id);
        self.entries.push(entry);
        true
    }

    /// Removes by index, compacting the tail forward.
    pub fn remove(&mut self, index: usize) {
        self.entries.remove(index);
    }

    /// Index of the entry holding an open SCO link, if any.
    pub fn sco_index(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.id == ServiceId::Ag && e.state == SysConnStatus::ScoOpen)
    }

    /// Number of connected AV services.
    pub fn av_count(&self) -> usize {
        self.entries.iter().filter(|e| e.id == ServiceId::Av).count()
    }
}
