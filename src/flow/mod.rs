//! Flow bookkeeping: one entry per TCP connection observed on the TUN.
//!
//! The table is a sharded concurrent map; creation is insert-if-absent so two
//! packets racing on the same SYN can never produce twin flows.

use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use crate::session::SessionError;

mod tcp;

pub use tcp::{TcpFlow, TcpFlowState};

/// Errors attributable to a single flow; every one of them ends as an RST
/// toward the device.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("relay session failed mid-flow: {0}")]
    Session(#[from] SessionError),
    #[error("flow is not established")]
    NotEstablished,
}

/// Identity of a flow as observed on the TUN side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}:{}", self.src_port, self.dst_ip, self.dst_port)
    }
}

/// Concurrent set of live TCP flows.
#[derive(Default)]
pub struct FlowTable {
    flows: DashMap<FlowKey, Arc<TcpFlow>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically creates a flow for `key`, or returns `None` when one
    /// already exists (duplicate SYN).
    pub fn create(&self, key: FlowKey, device_ip: Ipv4Addr) -> Option<Arc<TcpFlow>> {
        match self.flows.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let flow = Arc::new(TcpFlow::new(key, device_ip));
                slot.insert(flow.clone());
                Some(flow)
            }
        }
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.flows.get(key).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<TcpFlow>> {
        self.flows.remove(key).map(|(_, flow)| flow)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Empties the table, returning every flow for teardown.
    pub fn drain(&self) -> Vec<Arc<TcpFlow>> {
        let keys: Vec<FlowKey> = self.flows.iter().map(|e| *e.key()).collect();
        keys.iter()
            .filter_map(|k| self.remove(k))
            .collect()
    }
}
