use std::collections::HashMap;

use rand::distr::Alphanumeric;
use rand::Rng as _;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::get_relay_difficulty;
use crate::error::ProtocolError;
use crate::protocol::{encode_message, parse_message, GameStatePayload, WireMessage};
use crate::types::{MoldSpot, PlayerAction};

const CLIENT_ID_LEN: usize = 16;
const ACTION_TAG_LEN: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePolicy {
    DropOnFull,
    DisconnectOnFull,
}

#[derive(Clone)]
struct ClientContext {
    tx: mpsc::Sender<OutboundMessage>,
    joined_order: u64,
}

/// The one canonical game the relay fans out. Terrain travels as a seed.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayGame {
    pub seed: u32,
    pub mold_spots: Vec<MoldSpot>,
    pub defeated_count: u64,
    pub difficulty: f64,
}

impl RelayGame {
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            mold_spots: Vec::new(),
            defeated_count: 0,
            difficulty: 1.0,
        }
    }
}

pub struct RelayState {
    clients: HashMap<String, ClientContext>,
    game: RelayGame,
    next_order: u64,
}

impl RelayState {
    pub fn new(seed: u32) -> Self {
        Self {
            clients: HashMap::new(),
            game: RelayGame::new(seed),
            next_order: 0,
        }
    }

    pub fn game(&self) -> &RelayGame {
        &self.game
    }

    pub fn player_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<(&String, u64)> = self
            .clients
            .iter()
            .map(|(id, client)| (id, client.joined_order))
            .collect();
        ids.sort_by_key(|(_, order)| *order);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Registers a connection, sends it `init`, and rebroadcasts the state
    /// with the new player count. Returns `None` when the connection was
    /// dropped because its queue could not take `init`.
    pub fn connect(&mut self, tx: mpsc::Sender<OutboundMessage>) -> Option<String> {
        let client_id = make_client_id();
        self.next_order += 1;
        self.clients.insert(
            client_id.clone(),
            ClientContext {
                tx,
                joined_order: self.next_order,
            },
        );
        self.adjust_difficulty();
        info!(
            client_id = %client_id,
            players = self.player_count(),
            difficulty = self.game.difficulty,
            "client connected"
        );

        let init = WireMessage::Init {
            player_id: client_id.clone(),
            game_state: self.snapshot(),
        };
        self.send_to_client(&client_id, &init, QueuePolicy::DisconnectOnFull);
        if !self.clients.contains_key(&client_id) {
            warn!(client_id = %client_id, "client dropped before init was queued");
            return None;
        }
        self.broadcast_game_state();
        Some(client_id)
    }

    pub fn disconnect(&mut self, client_id: &str) {
        if !self.disconnect_internal(client_id) {
            return;
        }
        self.broadcast_game_state();
    }

    fn disconnect_internal(&mut self, client_id: &str) -> bool {
        if self.clients.remove(client_id).is_none() {
            return false;
        }
        self.adjust_difficulty();
        info!(
            client_id,
            players = self.player_count(),
            difficulty = self.game.difficulty,
            "client disconnected"
        );
        true
    }

    pub fn handle_client_message(&mut self, client_id: &str, raw: &str) {
        if !self.clients.contains_key(client_id) {
            debug!(client_id, "ignoring message from unknown client");
            return;
        }
        let message = match parse_message(raw) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(kind)) => {
                debug!(client_id, kind = %kind, "ignoring unknown message type");
                return;
            }
            Err(err) => {
                warn!(client_id, error = %err, "dropping malformed message");
                return;
            }
        };

        match message {
            WireMessage::RemoveMold { x, y, .. } => self.remove_mold(client_id, x, y),
            WireMessage::AddMold {
                x,
                y,
                size,
                growth_rate,
            } => {
                if self.game.mold_spots.iter().any(|spot| spot.x == x && spot.y == y) {
                    debug!(client_id, x, y, "spot already known");
                    return;
                }
                self.game.mold_spots.push(MoldSpot {
                    x,
                    y,
                    size: size.unwrap_or(1).max(1),
                    growth_rate: growth_rate.unwrap_or(1.0).max(1.0),
                });
                self.broadcast_game_state();
            }
            WireMessage::GrowMold { mold_spots } => {
                self.game.mold_spots = mold_spots;
                self.broadcast_game_state();
            }
            WireMessage::Ping => {
                self.send_to_client(client_id, &WireMessage::Pong, QueuePolicy::DropOnFull)
            }
            other => debug!(client_id, kind = other.kind(), "message not handled by the relay"),
        }
    }

    fn remove_mold(&mut self, client_id: &str, x: i32, y: i32) {
        let Some(index) = self
            .game
            .mold_spots
            .iter()
            .position(|spot| spot.x == x && spot.y == y)
        else {
            return;
        };
        self.game.mold_spots.remove(index);
        self.game.defeated_count += 1;

        let player: String = client_id.chars().take(ACTION_TAG_LEN).collect();
        let message = WireMessage::GameState(GameStatePayload {
            player_count: Some(self.player_count()),
            mold_spots: Some(self.game.mold_spots.clone()),
            defeated_count: Some(self.game.defeated_count),
            difficulty: Some(self.game.difficulty),
            player_action: Some(PlayerAction::RemoveMold { player, x, y }),
            ..GameStatePayload::default()
        });
        self.broadcast_except(&message, Some(client_id), QueuePolicy::DropOnFull);
    }

    fn adjust_difficulty(&mut self) {
        if self.player_count() > 0 {
            self.game.difficulty = get_relay_difficulty(self.player_count());
        }
    }

    pub fn snapshot(&self) -> GameStatePayload {
        GameStatePayload {
            player_count: Some(self.player_count()),
            mold_spots: Some(self.game.mold_spots.clone()),
            defeated_count: Some(self.game.defeated_count),
            difficulty: Some(self.game.difficulty),
            seed: Some(self.game.seed),
            ..GameStatePayload::default()
        }
    }

    pub fn broadcast_game_state(&mut self) {
        let message = WireMessage::GameState(self.snapshot());
        self.broadcast_except(&message, None, QueuePolicy::DropOnFull);
    }

    fn send_to_client(&mut self, client_id: &str, message: &WireMessage, policy: QueuePolicy) {
        let payload = match encode_message(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode message");
                return;
            }
        };
        let send_failed = if let Some(client) = self.clients.get(client_id) {
            client.tx.try_send(OutboundMessage::Text(payload)).is_err()
        } else {
            false
        };
        if send_failed && policy == QueuePolicy::DisconnectOnFull {
            self.disconnect_internal(client_id);
        }
    }

    fn broadcast_except(&mut self, message: &WireMessage, except: Option<&str>, policy: QueuePolicy) {
        let payload = match encode_message(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "failed to encode message");
                return;
            }
        };
        let mut failed_clients = Vec::new();
        for (client_id, client) in &self.clients {
            if except == Some(client_id.as_str()) {
                continue;
            }
            if client
                .tx
                .try_send(OutboundMessage::Text(payload.clone()))
                .is_err()
                && policy == QueuePolicy::DisconnectOnFull
            {
                failed_clients.push(client_id.clone());
            }
        }
        for client_id in failed_clients {
            self.disconnect_internal(&client_id);
        }
    }
}

fn make_client_id() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(CLIENT_ID_LEN)
        .map(char::from)
        .collect()
}
