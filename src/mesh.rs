use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::error::{MeshError, ProtocolError};
use crate::protocol::{parse_message, GameStatePayload, WireMessage};
use crate::sync::{Intent, SyncEvent, Synchronizer};
use crate::types::Role;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
}

/// One outbound frame addressed to a single connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub to: String,
    pub message: WireMessage,
}

/// Peer-mesh participant. Holds the roster, the host election and the
/// outbound queue; sockets live elsewhere and feed it through
/// `connection_opened`, `connection_closed` and `receive`.
#[derive(Debug)]
pub struct MeshPeer {
    peer_id: Option<String>,
    state: PeerState,
    host_id: Option<String>,
    is_host: bool,
    // insertion order decides failover
    connections: Vec<String>,
    awaiting_sync: HashSet<String>,
    pending_lobby: Option<String>,
    outbox: Vec<Envelope>,
    events: Vec<SyncEvent>,
}

impl Default for MeshPeer {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshPeer {
    pub fn new() -> Self {
        Self {
            peer_id: None,
            state: PeerState::Disconnected,
            host_id: None,
            is_host: false,
            connections: Vec::new(),
            awaiting_sync: HashSet::new(),
            pending_lobby: None,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn host_id(&self) -> Option<&str> {
        self.host_id.as_deref()
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn connections(&self) -> &[String] {
        &self.connections
    }

    pub fn is_awaiting_sync(&self, peer: &str) -> bool {
        self.awaiting_sync.contains(peer)
    }

    pub fn take_outbox(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    /// Registration with the rendezvous layer succeeded. The first
    /// participant to register is host until someone displaces it.
    pub fn registered(&mut self, peer_id: impl Into<String>) {
        let peer_id = peer_id.into();
        info!(peer_id = %peer_id, "registered with rendezvous");
        self.peer_id = Some(peer_id);
        self.state = PeerState::Connected;
        self.become_host();
    }

    pub fn join_lobby(&mut self, lobby_id: &str) -> Result<(), MeshError> {
        if self.peer_id.as_deref() == Some(lobby_id) {
            return Err(MeshError::SelfJoin(lobby_id.to_string()));
        }
        if self.connections.iter().any(|peer| peer == lobby_id) {
            return Err(MeshError::AlreadyConnected(lobby_id.to_string()));
        }
        info!(lobby_id, "joining lobby");
        self.pending_lobby = Some(lobby_id.to_string());
        self.state = PeerState::Connecting;
        Ok(())
    }

    pub fn pending_lobby(&self) -> Option<&str> {
        self.pending_lobby.as_deref()
    }

    pub fn connection_opened(&mut self, peer: &str, outgoing: bool) {
        if self.connections.iter().any(|known| known == peer) {
            debug!(peer, "duplicate connection ignored");
            return;
        }
        self.connections.push(peer.to_string());

        if outgoing && self.pending_lobby.as_deref() == Some(peer) {
            self.pending_lobby = None;
            self.state = PeerState::Connected;
            self.is_host = false;
            self.host_id = Some(peer.to_string());
            info!(host_id = peer, "connected to lobby host");
            self.events.push(SyncEvent::HostChanged {
                host_id: peer.to_string(),
            });
            self.send_to(peer, WireMessage::RequestGameState);
        } else if !outgoing {
            info!(peer, "peer connected");
            if self.is_host {
                self.awaiting_sync.insert(peer.to_string());
            }
            self.events.push(SyncEvent::PlayerJoined {
                peer: peer.to_string(),
            });
        }

        self.events.push(SyncEvent::RosterChanged {
            count: self.player_count(),
        });
    }

    pub fn connection_closed(&mut self, peer: &str) {
        let Some(index) = self.connections.iter().position(|known| known == peer) else {
            return;
        };
        self.connections.remove(index);
        self.awaiting_sync.remove(peer);
        if self.pending_lobby.as_deref() == Some(peer) {
            self.pending_lobby = None;
            self.state = PeerState::Connected;
        }
        info!(peer, remaining = self.connections.len(), "peer disconnected");

        self.events.push(SyncEvent::PlayerLeft {
            peer: peer.to_string(),
        });
        self.events.push(SyncEvent::RosterChanged {
            count: self.player_count(),
        });

        if self.host_id.as_deref() == Some(peer) {
            self.elect_new_host();
        }
    }

    /// Decodes and handles one inbound frame. Bad frames are logged and
    /// dropped without touching the session.
    pub fn receive(&mut self, from: &str, raw: &str) {
        match parse_message(raw) {
            Ok(message) => self.handle_message(from, message),
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(from, kind = %kind, "ignoring unknown message type");
            }
            Err(err) => warn!(from, error = %err, "dropping malformed message"),
        }
    }

    pub fn handle_message(&mut self, from: &str, message: WireMessage) {
        match message {
            WireMessage::GameState(payload) => {
                if self.is_host {
                    debug!(from, "host ignores incoming game state");
                } else {
                    self.events.push(SyncEvent::StateReceived(payload));
                }
            }
            WireMessage::RequestGameState => {
                if self.is_host {
                    self.events.push(SyncEvent::StateRequested {
                        peer: from.to_string(),
                    });
                }
            }
            WireMessage::HostChange { new_host_id } => {
                if self.peer_id.as_deref() == Some(new_host_id.as_str()) {
                    if !self.is_host {
                        self.become_host();
                    }
                } else {
                    if self.is_host {
                        info!(new_host_id = %new_host_id, "stepping down as host");
                    }
                    self.is_host = false;
                    self.awaiting_sync.clear();
                    self.host_id = Some(new_host_id.clone());
                    self.events.push(SyncEvent::HostChanged {
                        host_id: new_host_id,
                    });
                }
            }
            WireMessage::RemoveMold { x, y, .. } => {
                if self.is_host {
                    self.events.push(SyncEvent::IntentReceived {
                        x,
                        y,
                        from: from.to_string(),
                    });
                }
            }
            WireMessage::Ping => self.send_to(from, WireMessage::Pong),
            WireMessage::Pong => {}
            other => debug!(from, kind = other.kind(), "message not used by the mesh"),
        }
    }

    fn become_host(&mut self) {
        let Some(peer_id) = self.peer_id.clone() else {
            return;
        };
        info!(peer_id = %peer_id, "becoming host");
        self.is_host = true;
        self.host_id = Some(peer_id.clone());
        self.events.push(SyncEvent::BecameHost);
        self.broadcast(WireMessage::HostChange {
            new_host_id: peer_id,
        });
    }

    fn elect_new_host(&mut self) {
        let Some(next) = self.connections.first().cloned() else {
            self.become_host();
            return;
        };
        info!(host_id = %next, "electing new host");
        self.host_id = Some(next.clone());
        self.events.push(SyncEvent::HostChanged {
            host_id: next.clone(),
        });
        self.broadcast(WireMessage::HostChange { new_host_id: next });
    }

    fn broadcast(&mut self, message: WireMessage) {
        for peer in &self.connections {
            self.outbox.push(Envelope {
                to: peer.clone(),
                message: message.clone(),
            });
        }
    }

    fn send_to(&mut self, peer: &str, message: WireMessage) {
        if !self.connections.iter().any(|known| known == peer) {
            debug!(peer, kind = message.kind(), "dropping frame for unknown peer");
            return;
        }
        self.outbox.push(Envelope {
            to: peer.to_string(),
            message,
        });
    }
}

impl Synchronizer for MeshPeer {
    type Error = MeshError;

    fn join(&mut self, target: Option<&str>) -> Result<(), MeshError> {
        match target {
            Some(lobby_id) => self.join_lobby(lobby_id),
            None => Ok(()),
        }
    }

    fn leave(&mut self) {
        info!(connections = self.connections.len(), "leaving mesh");
        self.connections.clear();
        self.awaiting_sync.clear();
        self.pending_lobby = None;
        self.outbox.clear();
        self.is_host = false;
        self.host_id = None;
        self.state = PeerState::Disconnected;
        self.events.push(SyncEvent::Disconnected);
    }

    fn local_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    fn role(&self) -> Role {
        if self.is_host {
            Role::Host
        } else {
            Role::Follower
        }
    }

    fn player_count(&self) -> usize {
        self.connections.len() + 1
    }

    /// Fans the state out to every follower that has already been sent a
    /// full sync.
    fn broadcast_state(&mut self, state: GameStatePayload) {
        let targets: Vec<String> = self
            .connections
            .iter()
            .filter(|peer| !self.awaiting_sync.contains(*peer))
            .cloned()
            .collect();
        for peer in targets {
            self.outbox.push(Envelope {
                to: peer,
                message: WireMessage::GameState(state.clone()),
            });
        }
    }

    fn send_state_to(&mut self, peer: &str, state: GameStatePayload) {
        self.send_to(peer, WireMessage::GameState(state));
        self.awaiting_sync.remove(peer);
    }

    fn send_intent(&mut self, intent: Intent) {
        let Some(host_id) = self.host_id.clone().filter(|_| !self.is_host) else {
            return;
        };
        match intent {
            Intent::RemoveMold { x, y } => {
                let player_id = self.peer_id.clone();
                self.send_to(&host_id, WireMessage::RemoveMold { x, y, player_id });
            }
            other => debug!(?other, "mesh followers only forward removals"),
        }
    }

    fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str) -> MeshPeer {
        let mut peer = MeshPeer::new();
        peer.registered(id);
        peer.take_events();
        peer
    }

    #[test]
    fn first_registration_becomes_host() {
        let mut peer = MeshPeer::new();
        assert_eq!(peer.state(), PeerState::Disconnected);
        peer.registered("a");
        assert!(peer.is_host());
        assert_eq!(peer.role(), Role::Host);
        assert_eq!(peer.host_id(), Some("a"));
        assert_eq!(peer.take_events(), vec![SyncEvent::BecameHost]);
        assert!(peer.take_outbox().is_empty());
    }

    #[test]
    fn joining_own_lobby_is_rejected() {
        let mut peer = host("a");
        assert_eq!(
            peer.join(Some("a")),
            Err(MeshError::SelfJoin("a".to_string()))
        );
        assert_eq!(peer.state(), PeerState::Connected);
    }

    #[test]
    fn outgoing_connection_to_lobby_requests_state() {
        let mut peer = host("b");
        peer.join_lobby("a").unwrap();
        assert_eq!(peer.state(), PeerState::Connecting);
        peer.connection_opened("a", true);

        assert_eq!(peer.state(), PeerState::Connected);
        assert!(!peer.is_host());
        assert_eq!(peer.host_id(), Some("a"));
        assert_eq!(
            peer.take_outbox(),
            vec![Envelope {
                to: "a".to_string(),
                message: WireMessage::RequestGameState
            }]
        );
        assert_eq!(
            peer.take_events(),
            vec![
                SyncEvent::HostChanged {
                    host_id: "a".to_string()
                },
                SyncEvent::RosterChanged { count: 2 },
            ]
        );
        assert_eq!(
            peer.join(Some("a")),
            Err(MeshError::AlreadyConnected("a".to_string()))
        );
    }

    #[test]
    fn new_follower_is_held_until_full_sync() {
        let mut a = host("a");
        a.connection_opened("b", false);
        assert!(a.is_awaiting_sync("b"));

        a.broadcast_state(GameStatePayload::default());
        assert!(a.take_outbox().is_empty());

        a.send_state_to("b", GameStatePayload::default());
        assert!(!a.is_awaiting_sync("b"));
        a.broadcast_state(GameStatePayload::default());
        assert_eq!(a.take_outbox().len(), 2);
    }

    #[test]
    fn follower_forwards_removals_to_host() {
        let mut b = host("b");
        b.join_lobby("a").unwrap();
        b.connection_opened("a", true);
        b.take_outbox();

        b.send_intent(Intent::RemoveMold { x: 2, y: 3 });
        assert_eq!(
            b.take_outbox(),
            vec![Envelope {
                to: "a".to_string(),
                message: WireMessage::RemoveMold {
                    x: 2,
                    y: 3,
                    player_id: Some("b".to_string())
                }
            }]
        );
    }

    #[test]
    fn host_loss_elects_first_remaining_connection() {
        let mut c = host("c");
        c.join_lobby("a").unwrap();
        c.connection_opened("a", true);
        c.connection_opened("d", false);
        c.connection_opened("e", false);
        c.take_outbox();
        c.take_events();

        c.connection_closed("a");
        assert_eq!(c.host_id(), Some("d"));
        assert!(!c.is_host());
        let outbox = c.take_outbox();
        assert_eq!(outbox.len(), 2);
        assert!(outbox.iter().all(|envelope| envelope.message
            == WireMessage::HostChange {
                new_host_id: "d".to_string()
            }));
    }

    #[test]
    fn last_follower_standing_promotes_itself() {
        let mut b = host("b");
        b.join_lobby("a").unwrap();
        b.connection_opened("a", true);
        b.take_events();

        b.connection_closed("a");
        assert!(b.is_host());
        assert_eq!(b.host_id(), Some("b"));
        let events = b.take_events();
        assert!(events.contains(&SyncEvent::BecameHost));
        assert!(events.contains(&SyncEvent::RosterChanged { count: 1 }));
    }

    #[test]
    fn latest_host_change_wins_and_host_steps_down() {
        let mut a = host("a");
        a.connection_opened("b", false);
        a.connection_opened("c", false);
        a.handle_message("b", WireMessage::HostChange {
            new_host_id: "b".to_string(),
        });
        a.handle_message("c", WireMessage::HostChange {
            new_host_id: "c".to_string(),
        });
        assert!(!a.is_host());
        assert_eq!(a.host_id(), Some("c"));

        a.handle_message("b", WireMessage::HostChange {
            new_host_id: "a".to_string(),
        });
        assert!(a.is_host());
    }

    #[test]
    fn host_ignores_state_and_followers_ignore_intents() {
        let mut a = host("a");
        a.connection_opened("b", false);
        a.take_events();
        a.handle_message("b", WireMessage::GameState(GameStatePayload::default()));
        assert!(a.take_events().is_empty());

        let mut b = host("b");
        b.join_lobby("a").unwrap();
        b.connection_opened("a", true);
        b.take_events();
        b.handle_message("a", WireMessage::RemoveMold {
            x: 1,
            y: 1,
            player_id: None,
        });
        b.handle_message("a", WireMessage::RequestGameState);
        assert!(b.take_events().is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut a = host("a");
        a.connection_opened("b", false);
        a.take_events();
        a.receive("b", "{not json");
        a.receive("b", r#"{"type":"warp"}"#);
        a.receive("b", r#"{"type":"removeMold","x":"?"}"#);
        assert!(a.take_events().is_empty());

        a.receive("b", r#"{"type":"ping"}"#);
        assert_eq!(
            a.take_outbox(),
            vec![Envelope {
                to: "b".to_string(),
                message: WireMessage::Pong
            }]
        );
    }

    #[test]
    fn leave_resets_everything() {
        let mut a = host("a");
        a.connection_opened("b", false);
        a.leave();
        assert_eq!(a.state(), PeerState::Disconnected);
        assert_eq!(a.player_count(), 1);
        assert!(!a.is_host());
        assert!(a.take_events().contains(&SyncEvent::Disconnected));
    }
}
