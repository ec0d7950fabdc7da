//! In-process pub/sub hub implementing [`Transport`].
//!
//! Endpoints registered on one [`MemoryHub`] connect to each other by
//! address and exchange topic messages synchronously: `publish` pushes a
//! [`TransportEvent::Message`] into the event channel of every linked
//! endpoint that joined the topic. Used by tests and local simulations in
//! place of the libp2p swarm.

use bar_core::error::NetworkError;
use bar_core::traits::{Transport, TransportEvent};
use bar_core::types::PeerId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of each endpoint's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

struct Endpoint {
    address: String,
    events: broadcast::Sender<TransportEvent>,
    topics: HashSet<String>,
    links: HashSet<PeerId>,
    online: bool,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<PeerId, Endpoint>,
    by_address: HashMap<String, PeerId>,
}

/// A shared in-memory network.
#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register an endpoint and return its transport handle plus event stream.
    pub fn endpoint(
        self: &Arc<Self>,
        id: impl Into<PeerId>,
        address: impl Into<String>,
    ) -> (Arc<MemoryTransport>, broadcast::Receiver<TransportEvent>) {
        let id = id.into();
        let address = address.into();
        let (events, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut state = self.state.lock();
        state.by_address.insert(address.clone(), id.clone());
        state.endpoints.insert(
            id.clone(),
            Endpoint {
                address,
                events,
                topics: HashSet::new(),
                links: HashSet::new(),
                online: true,
            },
        );
        let transport = Arc::new(MemoryTransport {
            id,
            hub: Arc::clone(self),
        });
        (transport, rx)
    }

    /// Subscribe to an endpoint's events a second time.
    pub fn subscribe(&self, id: &PeerId) -> Option<broadcast::Receiver<TransportEvent>> {
        self.state.lock().endpoints.get(id).map(|e| e.events.subscribe())
    }

    /// Drop the link between two endpoints, notifying both.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        let mut removed = false;
        if let Some(ep) = state.endpoints.get_mut(a) {
            removed |= ep.links.remove(b);
            let _ = ep.events.send(TransportEvent::PeerDisconnected(b.clone()));
        }
        if let Some(ep) = state.endpoints.get_mut(b) {
            removed |= ep.links.remove(a);
            let _ = ep.events.send(TransportEvent::PeerDisconnected(a.clone()));
        }
        if removed {
            debug!(%a, %b, "memory: link dropped");
        }
    }

    /// Take an endpoint offline. Offline endpoints neither send nor receive,
    /// but stay linked, which looks like a silent peer to everyone else.
    pub fn set_online(&self, id: &PeerId, online: bool) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(id) {
            ep.online = online;
        }
    }

    /// Ids linked to `id`, sorted.
    pub fn links(&self, id: &PeerId) -> Vec<PeerId> {
        let state = self.state.lock();
        let mut links: Vec<PeerId> = state
            .endpoints
            .get(id)
            .map(|e| e.links.iter().cloned().collect())
            .unwrap_or_default();
        links.sort();
        links
    }

    fn join(&self, id: &PeerId, topic: &str) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        let ep = state.endpoints.get_mut(id).ok_or(NetworkError::TransportStopped)?;
        ep.topics.insert(topic.to_string());
        Ok(())
    }

    fn connect(&self, from: &PeerId, address: &str) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        let target = state
            .by_address
            .get(address)
            .cloned()
            .ok_or_else(|| NetworkError::DialFailed(format!("no endpoint at {address}")))?;
        if &target == from {
            return Err(NetworkError::DialFailed("cannot dial self".into()));
        }
        let from_address = {
            let ep = state.endpoints.get(from).ok_or(NetworkError::TransportStopped)?;
            if !ep.online {
                return Err(NetworkError::TransportStopped);
            }
            if ep.links.contains(&target) {
                return Ok(());
            }
            ep.address.clone()
        };
        if !state.endpoints.get(&target).is_some_and(|e| e.online) {
            return Err(NetworkError::DialFailed(format!("{address} unreachable")));
        }

        if let Some(ep) = state.endpoints.get_mut(from) {
            ep.links.insert(target.clone());
            let _ = ep.events.send(TransportEvent::PeerConnected {
                peer: target.clone(),
                address: address.to_string(),
            });
        }
        if let Some(ep) = state.endpoints.get_mut(&target) {
            ep.links.insert(from.clone());
            let _ = ep.events.send(TransportEvent::PeerConnected {
                peer: from.clone(),
                address: from_address,
            });
        }
        debug!(%from, %target, "memory: link established");
        Ok(())
    }

    fn publish(&self, from: &PeerId, topic: &str, data: Vec<u8>) -> Result<(), NetworkError> {
        let state = self.state.lock();
        let ep = state.endpoints.get(from).ok_or(NetworkError::TransportStopped)?;
        if !ep.online {
            // Silent peers drop their own traffic.
            return Ok(());
        }
        for peer in &ep.links {
            let Some(dest) = state.endpoints.get(peer) else {
                continue;
            };
            if !dest.online || !dest.topics.contains(topic) {
                continue;
            }
            let _ = dest.events.send(TransportEvent::Message {
                topic: topic.to_string(),
                data: data.clone(),
                from: from.clone(),
            });
        }
        Ok(())
    }
}

/// One endpoint's handle onto a [`MemoryHub`].
pub struct MemoryTransport {
    id: PeerId,
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.id.clone()
    }

    fn join_topic(&self, topic: &str) -> Result<(), NetworkError> {
        self.hub.join(&self.id, topic)
    }

    fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), NetworkError> {
        self.hub.publish(&self.id, topic, data)
    }

    fn connect(&self, address: &str) -> Result<(), NetworkError> {
        self.hub.connect(&self.id, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<TransportEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn connect_notifies_both_sides() {
        let hub = MemoryHub::new();
        let (a, mut rx_a) = hub.endpoint("a", "mem/a");
        let (_b, mut rx_b) = hub.endpoint("b", "mem/b");

        a.connect("mem/b").unwrap();
        assert_eq!(
            drain(&mut rx_a),
            vec![TransportEvent::PeerConnected { peer: PeerId::from("b"), address: "mem/b".into() }]
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![TransportEvent::PeerConnected { peer: PeerId::from("a"), address: "mem/a".into() }]
        );

        // Second dial is a no-op.
        a.connect("mem/b").unwrap();
        assert!(drain(&mut rx_a).is_empty());
    }

    #[test]
    fn connect_unknown_address_fails() {
        let hub = MemoryHub::new();
        let (a, _rx) = hub.endpoint("a", "mem/a");
        assert!(matches!(a.connect("mem/nowhere"), Err(NetworkError::DialFailed(_))));
        assert!(a.connect("mem/a").is_err());
    }

    #[test]
    fn publish_reaches_linked_subscribers_only() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.endpoint("a", "mem/a");
        let (b, mut rx_b) = hub.endpoint("b", "mem/b");
        let (_c, mut rx_c) = hub.endpoint("c", "mem/c");
        b.join_topic("t").unwrap();
        a.connect("mem/b").unwrap();
        drain(&mut rx_b);

        a.publish("t", b"hi".to_vec()).unwrap();
        a.publish("other", b"nope".to_vec()).unwrap();
        assert_eq!(
            drain(&mut rx_b),
            vec![TransportEvent::Message { topic: "t".into(), data: b"hi".to_vec(), from: PeerId::from("a") }]
        );
        assert!(drain(&mut rx_c).is_empty());
    }

    #[test]
    fn offline_endpoint_is_silent() {
        let hub = MemoryHub::new();
        let (a, mut rx_a) = hub.endpoint("a", "mem/a");
        let (b, mut rx_b) = hub.endpoint("b", "mem/b");
        a.join_topic("t").unwrap();
        b.join_topic("t").unwrap();
        a.connect("mem/b").unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.set_online(&PeerId::from("b"), false);
        b.publish("t", b"x".to_vec()).unwrap();
        a.publish("t", b"y".to_vec()).unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn disconnect_unlinks() {
        let hub = MemoryHub::new();
        let (a, _rx_a) = hub.endpoint("a", "mem/a");
        let (_b, mut rx_b) = hub.endpoint("b", "mem/b");
        a.connect("mem/b").unwrap();
        drain(&mut rx_b);

        hub.disconnect(&PeerId::from("a"), &PeerId::from("b"));
        assert!(hub.links(&PeerId::from("a")).is_empty());
        assert_eq!(drain(&mut rx_b), vec![TransportEvent::PeerDisconnected(PeerId::from("a"))]);
    }
}
