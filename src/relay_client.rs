use std::convert::Infallible;

use tracing::{debug, info, warn};

use crate::constants::{get_reconnect_delay_ms, KEEPALIVE_INTERVAL_MS};
use crate::error::ProtocolError;
use crate::protocol::{parse_message, GameStatePayload, WireMessage};
use crate::sync::{Intent, SyncEvent, Synchronizer};
use crate::types::Role;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Client half of the relay protocol. The socket is owned by the caller,
/// which reports open/close, feeds frames to `receive`, polls for the
/// keepalive and reconnect schedule, and writes out `take_outbox`.
#[derive(Debug)]
pub struct RelayClient {
    state: ConnectionState,
    player_id: Option<String>,
    player_count: usize,
    reconnect_attempts: u32,
    reconnect_at: Option<u64>,
    next_ping_at: Option<u64>,
    outbox: Vec<WireMessage>,
    events: Vec<SyncEvent>,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            player_id: None,
            player_count: 1,
            reconnect_attempts: 0,
            reconnect_at: None,
            next_ping_at: None,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_at(&self) -> Option<u64> {
        self.reconnect_at
    }

    pub fn take_outbox(&mut self) -> Vec<WireMessage> {
        std::mem::take(&mut self.outbox)
    }

    pub fn connection_opened(&mut self, now_ms: u64) {
        info!("connected to relay");
        self.state = ConnectionState::Connected;
        self.reconnect_attempts = 0;
        self.reconnect_at = None;
        self.next_ping_at = Some(now_ms + KEEPALIVE_INTERVAL_MS);
    }

    /// Covers both a dropped connection and a failed dial. Schedules the
    /// next attempt with exponential backoff and returns its delay.
    pub fn connection_closed(&mut self, now_ms: u64) -> u64 {
        let delay = get_reconnect_delay_ms(self.reconnect_attempts);
        if self.state == ConnectionState::Connected {
            self.events.push(SyncEvent::Disconnected);
        }
        self.state = ConnectionState::Disconnected;
        self.next_ping_at = None;
        self.reconnect_at = Some(now_ms + delay);
        warn!(delay_ms = delay, attempts = self.reconnect_attempts, "relay connection lost");
        delay
    }

    /// Advances timers. Queues a ping when one is due and returns true
    /// when the caller should dial the relay again.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.state {
            ConnectionState::Connected => {
                if self.next_ping_at.is_some_and(|at| now_ms >= at) {
                    self.outbox.push(WireMessage::Ping);
                    self.next_ping_at = Some(now_ms + KEEPALIVE_INTERVAL_MS);
                }
                false
            }
            ConnectionState::Disconnected => match self.reconnect_at {
                Some(at) if now_ms >= at => {
                    self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                    self.reconnect_at = None;
                    self.state = ConnectionState::Connecting;
                    true
                }
                _ => false,
            },
            ConnectionState::Connecting => false,
        }
    }

    pub fn receive(&mut self, raw: &str) {
        match parse_message(raw) {
            Ok(message) => self.handle_message(message),
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(kind = %kind, "ignoring unknown message type");
            }
            Err(err) => warn!(error = %err, "dropping malformed message"),
        }
    }

    pub fn handle_message(&mut self, message: WireMessage) {
        match message {
            WireMessage::Init {
                player_id,
                game_state,
            } => {
                info!(player_id = %player_id, "initialized by relay");
                self.player_id = Some(player_id);
                self.apply_state(game_state);
            }
            WireMessage::GameState(payload) => self.apply_state(payload),
            WireMessage::Pong => {}
            other => debug!(kind = other.kind(), "message not used by relay clients"),
        }
    }

    fn apply_state(&mut self, payload: GameStatePayload) {
        if let Some(count) = payload.player_count {
            if count != self.player_count {
                self.player_count = count;
                self.events.push(SyncEvent::RosterChanged { count });
            }
        }
        if let Some(action) = payload.player_action.clone() {
            self.events.push(SyncEvent::PlayerAction(action));
        }
        self.events.push(SyncEvent::StateReceived(payload));
    }

    fn push_if_connected(&mut self, message: WireMessage) {
        if self.state == ConnectionState::Connected {
            self.outbox.push(message);
        } else {
            debug!(kind = message.kind(), "not connected, dropping frame");
        }
    }
}

impl Synchronizer for RelayClient {
    type Error = Infallible;

    fn join(&mut self, _target: Option<&str>) -> Result<(), Infallible> {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::Connecting;
            self.reconnect_at = None;
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.reconnect_at = None;
        self.next_ping_at = None;
        self.outbox.clear();
        self.events.push(SyncEvent::Disconnected);
    }

    fn local_id(&self) -> Option<&str> {
        self.player_id.as_deref()
    }

    fn role(&self) -> Role {
        Role::Relayed
    }

    fn player_count(&self) -> usize {
        self.player_count
    }

    fn broadcast_state(&mut self, state: GameStatePayload) {
        if let Some(mold_spots) = state.mold_spots {
            self.push_if_connected(WireMessage::GrowMold { mold_spots });
        }
    }

    fn send_state_to(&mut self, peer: &str, _state: GameStatePayload) {
        debug!(peer, "relay clients never address peers directly");
    }

    fn send_intent(&mut self, intent: Intent) {
        let message = match intent {
            Intent::RemoveMold { x, y } => WireMessage::RemoveMold {
                x,
                y,
                player_id: None,
            },
            Intent::AddMold(spot) => WireMessage::AddMold {
                x: spot.x,
                y: spot.y,
                size: Some(spot.size),
                growth_rate: Some(spot.growth_rate),
            },
            Intent::GrowMold(mold_spots) => WireMessage::GrowMold { mold_spots },
        };
        self.push_if_connected(message);
    }

    fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RECONNECT_MAX_DELAY_MS;
    use crate::types::{MoldSpot, PlayerAction};

    fn connected(now_ms: u64) -> RelayClient {
        let mut client = RelayClient::new();
        client.join(None).unwrap();
        client.connection_opened(now_ms);
        client
    }

    #[test]
    fn pings_every_keepalive_interval() {
        let mut client = connected(0);
        assert!(!client.poll(KEEPALIVE_INTERVAL_MS - 1));
        assert!(client.take_outbox().is_empty());
        client.poll(KEEPALIVE_INTERVAL_MS);
        assert_eq!(client.take_outbox(), vec![WireMessage::Ping]);
        client.poll(KEEPALIVE_INTERVAL_MS + 10);
        assert!(client.take_outbox().is_empty());
        client.poll(2 * KEEPALIVE_INTERVAL_MS);
        assert_eq!(client.take_outbox(), vec![WireMessage::Ping]);
    }

    #[test]
    fn reconnect_backs_off_and_resets_on_open() {
        let mut client = connected(0);
        assert_eq!(client.connection_closed(0), 1_000);
        assert_eq!(client.take_events(), vec![SyncEvent::Disconnected]);
        assert!(!client.poll(999));
        assert!(client.poll(1_000));
        assert_eq!(client.state(), ConnectionState::Connecting);

        assert_eq!(client.connection_closed(1_000), 1_500);
        assert!(client.poll(2_500));
        assert_eq!(client.connection_closed(2_500), 2_250);
        assert!(client.take_events().is_empty());

        for _ in 0..20 {
            let now = client.reconnect_at().unwrap();
            assert!(client.poll(now));
            assert!(client.connection_closed(now) <= RECONNECT_MAX_DELAY_MS);
        }

        let now = client.reconnect_at().unwrap();
        client.poll(now);
        client.connection_opened(now);
        assert_eq!(client.connection_closed(now), 1_000);
    }

    #[test]
    fn init_sets_identity_and_surfaces_state() {
        let mut client = connected(0);
        client.receive(
            r#"{"type":"init","playerId":"abcd1234","gameState":{"playerCount":3,"moldSpots":[],"defeatedCount":0,"difficulty":1.4,"seed":77}}"#,
        );
        assert_eq!(client.local_id(), Some("abcd1234"));
        assert_eq!(client.player_count(), 3);
        let events = client.take_events();
        assert_eq!(events[0], SyncEvent::RosterChanged { count: 3 });
        assert!(matches!(&events[1], SyncEvent::StateReceived(state) if state.seed == Some(77)));
    }

    #[test]
    fn player_action_is_surfaced() {
        let mut client = connected(0);
        client.receive(
            r#"{"type":"gameState","moldSpots":[],"defeatedCount":1,"difficulty":1,"playerAction":{"type":"removeMold","player":"wxyz","x":1,"y":2}}"#,
        );
        let events = client.take_events();
        assert!(events.contains(&SyncEvent::PlayerAction(PlayerAction::RemoveMold {
            player: "wxyz".to_string(),
            x: 1,
            y: 2
        })));
    }

    #[test]
    fn intents_map_to_relay_frames_only_while_connected() {
        let mut client = RelayClient::new();
        client.send_intent(Intent::RemoveMold { x: 1, y: 1 });
        assert!(client.take_outbox().is_empty());

        client.join(None).unwrap();
        client.connection_opened(0);
        client.send_intent(Intent::RemoveMold { x: 1, y: 1 });
        client.send_intent(Intent::AddMold(MoldSpot::seed(2, 2)));
        client.broadcast_state(GameStatePayload {
            mold_spots: Some(vec![MoldSpot::seed(2, 2)]),
            ..GameStatePayload::default()
        });
        assert_eq!(
            client.take_outbox(),
            vec![
                WireMessage::RemoveMold {
                    x: 1,
                    y: 1,
                    player_id: None
                },
                WireMessage::AddMold {
                    x: 2,
                    y: 2,
                    size: Some(1),
                    growth_rate: Some(1.0)
                },
                WireMessage::GrowMold {
                    mold_spots: vec![MoldSpot::seed(2, 2)]
                },
            ]
        );
    }

    #[test]
    fn leave_stops_reconnecting() {
        let mut client = connected(0);
        client.leave();
        assert!(!client.poll(u64::MAX));
        assert_eq!(client.role(), Role::Relayed);
    }
}
