//! Harbor stub: local/remote handle classification.
//!
//! Every node carries an 8-bit id in the high byte of its handles. A
//! send whose destination carries a different, non-zero node id is not
//! deliverable locally; the envelope is wrapped and pushed to a
//! distinguished remote delegate service installed at startup. The
//! delegate holds a registry reference but is excluded from the liveness
//! count, so a node whose ordinary services have all exited still shuts
//! down.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use crate::message::{Handle, HANDLE_MASK, HANDLE_REMOTE_SHIFT};
use crate::service::ServiceContext;

/// Sentinel meaning "harbor not initialized yet".
const UNSET: u32 = u32::MAX;

/// Node identity and the remote delegate slot.
#[derive(Debug)]
pub struct Harbor {
    /// Local node id, pre-shifted into the handle high byte.
    local: AtomicU32,
    /// The delegate consuming outgoing remote envelopes.
    remote: RwLock<Option<Arc<ServiceContext>>>,
}

impl Default for Harbor {
    fn default() -> Harbor {
        Harbor::new()
    }
}

impl Harbor {
    #[must_use]
    pub fn new() -> Harbor {
        Harbor {
            local: AtomicU32::new(UNSET),
            remote: RwLock::new(None),
        }
    }

    /// Fix the node id. Called once before any service launches.
    pub fn init(&self, node_id: u8) {
        self.local
            .store(u32::from(node_id) << HANDLE_REMOTE_SHIFT, Ordering::Release);
    }

    /// Install the remote delegate. The caller is responsible for
    /// excluding it from the liveness count.
    pub fn start(&self, delegate: Arc<ServiceContext>) {
        let mut remote = self.remote.write().unwrap_or_else(|e| e.into_inner());
        *remote = Some(delegate);
    }

    /// Drop the delegate reference at shutdown.
    pub fn exit(&self) -> Option<Arc<ServiceContext>> {
        let mut remote = self.remote.write().unwrap_or_else(|e| e.into_inner());
        remote.take()
    }

    /// The installed delegate, if any.
    #[must_use]
    pub fn remote(&self) -> Option<Arc<ServiceContext>> {
        let remote = self.remote.read().unwrap_or_else(|e| e.into_inner());
        remote.clone()
    }

    /// Returns `true` when `handle` lives on another node.
    #[must_use]
    pub fn is_remote(&self, handle: Handle) -> bool {
        let local = self.local.load(Ordering::Acquire);
        debug_assert_ne!(local, UNSET, "harbor id not initialized");
        let node = handle & !HANDLE_MASK;
        node != local && node != 0
    }
}

/// Resolve a textual address: `:hex` parses directly, `.name` consults
/// the registry via `find`; anything else is not resolvable here.
pub fn query_name<F>(name: &str, find: F) -> Option<Handle>
where
    F: FnOnce(&str) -> Option<Handle>,
{
    let mut chars = name.chars();
    match chars.next() {
        Some(':') => u32::from_str_radix(chars.as_str(), 16).ok(),
        Some('.') => find(chars.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_by_high_byte() {
        let harbor = Harbor::new();
        harbor.init(1);
        // Same node: local.
        assert!(!harbor.is_remote(0x0100_0001));
        // Node byte 0 is always local (pre-registration sends).
        assert!(!harbor.is_remote(0x0000_0001));
        // Another node: remote.
        assert!(harbor.is_remote(0x0200_0001));
        assert!(harbor.is_remote(0xff00_0001));
    }

    #[test]
    fn node_zero_treats_everything_nonzero_as_remote() {
        let harbor = Harbor::new();
        harbor.init(0);
        assert!(!harbor.is_remote(0x0000_0007));
        assert!(harbor.is_remote(0x0300_0007));
    }

    #[test]
    fn query_name_parses_hex_and_names() {
        assert_eq!(query_name(":10f", |_| None), Some(0x10f));
        assert_eq!(query_name(".logger", |n| (n == "logger").then_some(9)), Some(9));
        assert_eq!(query_name(".absent", |_| None), None);
        assert_eq!(query_name("plain", |_| Some(1)), None);
        assert_eq!(query_name("", |_| Some(1)), None);
        assert_eq!(query_name(":zz", |_| None), None);
    }
}
