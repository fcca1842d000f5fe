use crate::protocol::GameStatePayload;
use crate::types::{MoldSpot, PlayerAction, Role};

/// Something a participant asks the authority to do.
#[derive(Clone, Debug, PartialEq)]
pub enum Intent {
    RemoveMold { x: i32, y: i32 },
    AddMold(MoldSpot),
    GrowMold(Vec<MoldSpot>),
}

/// What a synchronizer observed since it was last drained.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    PlayerJoined { peer: String },
    PlayerLeft { peer: String },
    RosterChanged { count: usize },
    StateReceived(GameStatePayload),
    StateRequested { peer: String },
    IntentReceived { x: i32, y: i32, from: String },
    BecameHost,
    HostChanged { host_id: String },
    PlayerAction(PlayerAction),
    Disconnected,
}

/// Transport-independent side of a session protocol. Implementations queue
/// outbound frames and inbound events; the session drains the events and
/// decides what to do with them.
pub trait Synchronizer {
    type Error: std::error::Error;

    fn join(&mut self, target: Option<&str>) -> Result<(), Self::Error>;
    fn leave(&mut self);

    fn local_id(&self) -> Option<&str>;
    fn role(&self) -> Role;
    fn player_count(&self) -> usize;

    fn broadcast_state(&mut self, state: GameStatePayload);
    fn send_state_to(&mut self, peer: &str, state: GameStatePayload);
    fn send_intent(&mut self, intent: Intent);

    fn take_events(&mut self) -> Vec<SyncEvent>;
}

/// A mirror only swaps its spot list when the incoming one differs by more
/// than a single spot, shrank, or when it has nothing yet.
pub fn should_replace_spots(local: &[MoldSpot], incoming: &[MoldSpot]) -> bool {
    local.is_empty() || local.len().abs_diff(incoming.len()) > 1 || incoming.len() < local.len()
}
