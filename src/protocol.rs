use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{Grid, MoldSpot, PlayerAction};

/// Any subset of the simulation state. The mesh host sends the grid, the relay
/// sends a seed instead, and an initial mesh sync also carries the baseline.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<Grid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_grid: Option<Grid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mold_spots: Option<Vec<MoldSpot>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defeated_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_over: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_action: Option<PlayerAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WireMessage {
    Init {
        player_id: String,
        game_state: GameStatePayload,
    },
    GameState(GameStatePayload),
    RemoveMold {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player_id: Option<String>,
    },
    AddMold {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        growth_rate: Option<f64>,
    },
    GrowMold {
        mold_spots: Vec<MoldSpot>,
    },
    RequestGameState,
    HostChange {
        new_host_id: String,
    },
    Ping,
    Pong,
}

const KNOWN_TYPES: &[&str] = &[
    "init",
    "gameState",
    "removeMold",
    "addMold",
    "growMold",
    "requestGameState",
    "hostChange",
    "ping",
    "pong",
];

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::GameState(_) => "gameState",
            Self::RemoveMold { .. } => "removeMold",
            Self::AddMold { .. } => "addMold",
            Self::GrowMold { .. } => "growMold",
            Self::RequestGameState => "requestGameState",
            Self::HostChange { .. } => "hostChange",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

/// Decodes one frame. The `type` tag is checked first so that an unknown
/// kind (ignored by callers) is told apart from a known kind with a bad body
/// (logged).
pub fn parse_message(raw: &str) -> Result<WireMessage, ProtocolError> {
    let value: Value = serde_json::from_str(raw).map_err(ProtocolError::Json)?;
    let kind = value
        .as_object()
        .and_then(|object| object.get("type"))
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !KNOWN_TYPES.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

pub fn encode_message(message: &WireMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}
