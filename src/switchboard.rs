//! Server-side registry of remote TCP/IP forwardings.
//!
//! A connection that grants a `tcpip-forward` registers the bound address
//! here; whoever accepts connections on that address later asks for the
//! opener and tunnels the stream back as a `forwarded-tcpip` channel.
//! The registry holds only weak connection handles, so ownership stays a
//! DAG: connections own their forwarding sets, the switchboard never owns
//! a connection, and opening through a dead connection fails cleanly.
//!
//! The switchboard is per-server, not per-process: share one `Arc` across
//! the connections that should see each other's forwardings.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, Weak};

use log::debug;
use tokio::sync::mpsc;

use crate::connection::{open_tcpip, Shared, TcpIpChannel};
use crate::wire::{Message, TcpIpParams};
use crate::{Address, Error};

type Policy = dyn Fn(&str, &Address) -> bool + Send + Sync;

pub struct Switchboard {
    entries: Mutex<HashMap<Address, Registration>>,
    policy: Option<Box<Policy>>,
}

struct Registration {
    identity: String,
    opener: ForwardingOpener,
}

impl Switchboard {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy: None,
        }
    }

    /// A switchboard that consults `policy(identity, address)` before
    /// accepting a registration.
    pub fn with_policy(policy: impl Fn(&str, &Address) -> bool + Send + Sync + 'static) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy: Some(Box::new(policy)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Address, Registration>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Authorizes and registers a forwarding. Duplicates are rejected.
    pub fn request_forwarding(
        &self,
        identity: &str,
        address: &Address,
        opener: ForwardingOpener,
    ) -> bool {
        if let Some(policy) = &self.policy {
            if !policy(identity, address) {
                debug!("forwarding of {address} denied for {identity}");
                return false;
            }
        }
        let mut entries = self.lock();
        if entries.contains_key(address) {
            debug!("forwarding of {address} already registered");
            return false;
        }
        entries.insert(
            address.clone(),
            Registration {
                identity: identity.into(),
                opener,
            },
        );
        true
    }

    /// Removes a forwarding. Only the identity that registered an address
    /// may cancel it. Returns whether an entry was removed.
    pub fn cancel_forwarding(&self, identity: &str, address: &Address) -> bool {
        let mut entries = self.lock();
        match entries.get(address) {
            Some(registration) if registration.identity == identity => {
                entries.remove(address);
                true
            }
            _ => false,
        }
    }

    /// The opener registered for `address`, if any.
    pub fn get_forwarding(&self, address: &Address) -> Option<ForwardingOpener> {
        self.lock().get(address).map(|r| r.opener.clone())
    }
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak handle to the connection that registered a forwarding: enough to
/// open a `forwarded-tcpip` channel through it, nothing more.
#[derive(Clone)]
pub struct ForwardingOpener {
    shared: Weak<Shared>,
    out: mpsc::Sender<Message>,
}

impl ForwardingOpener {
    pub(crate) fn new(shared: Weak<Shared>, out: mpsc::Sender<Message>) -> Self {
        Self { shared, out }
    }

    /// Tunnels one accepted connection back through the registering
    /// connection. `connected` is the bound address that accepted,
    /// `originator` the remote endpoint.
    pub async fn open(
        &self,
        connected: Address,
        originator: Address,
    ) -> Result<TcpIpChannel, Error> {
        let shared = self.shared.upgrade().ok_or(Error::Disconnect)?;
        let params = TcpIpParams {
            host: connected.host,
            port: u32::from(connected.port),
            originator_host: originator.host,
            originator_port: u32::from(originator.port),
        };
        open_tcpip(&shared, &self.out, params, true).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Allow unwraps, expects and panics in the test suite

    use super::*;

    fn opener() -> ForwardingOpener {
        let (tx, _rx) = mpsc::channel(1);
        ForwardingOpener::new(Weak::new(), tx)
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let switchboard = Switchboard::new();
        let address = Address::new("127.0.0.1", 8022);
        assert!(switchboard.request_forwarding("alice", &address, opener()));
        assert!(!switchboard.request_forwarding("alice", &address, opener()));
        assert!(!switchboard.request_forwarding("bob", &address, opener()));
        assert!(switchboard.get_forwarding(&address).is_some());
    }

    #[test]
    fn cancel_requires_matching_identity() {
        let switchboard = Switchboard::new();
        let address = Address::new("0.0.0.0", 9000);
        assert!(switchboard.request_forwarding("alice", &address, opener()));
        assert!(!switchboard.cancel_forwarding("bob", &address));
        assert!(switchboard.get_forwarding(&address).is_some());
        assert!(switchboard.cancel_forwarding("alice", &address));
        assert!(switchboard.get_forwarding(&address).is_none());
        assert!(!switchboard.cancel_forwarding("alice", &address));
    }

    #[test]
    fn policy_gates_registration() {
        let switchboard =
            Switchboard::with_policy(|identity, address| identity == "alice" && address.port > 1024);
        assert!(!switchboard.request_forwarding("bob", &Address::new("h", 8000), opener()));
        assert!(!switchboard.request_forwarding("alice", &Address::new("h", 80), opener()));
        assert!(switchboard.request_forwarding("alice", &Address::new("h", 8000), opener()));
    }

    #[tokio::test]
    async fn opening_through_a_dead_connection_fails() {
        let switchboard = Switchboard::new();
        let address = Address::new("127.0.0.1", 8022);
        assert!(switchboard.request_forwarding("alice", &address, opener()));
        let opener = switchboard.get_forwarding(&address).unwrap();
        let result = opener
            .open(address, Address::new("198.51.100.9", 40000))
            .await;
        assert!(matches!(result, Err(Error::Disconnect)));
    }
}
