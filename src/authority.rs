use tracing::debug;

use crate::engine::MoldEngine;
use crate::protocol::GameStatePayload;
use crate::scheduler::TickDue;
use crate::sync::{Intent, Synchronizer};
use crate::types::{MoldSpot, Role, TerrainCell};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClickOutcome {
    /// Cleansed locally.
    Removed,
    /// Not a mold cell; nothing happened.
    Missed,
    /// Sent to the host as an intent.
    Forwarded,
}

/// What a participant is allowed to do with the shared simulation. The
/// session swaps implementations when the synchronizer reports a role change.
pub trait Authority<S: Synchronizer> {
    fn role(&self) -> Role;

    fn cell_clicked(&mut self, engine: &mut MoldEngine, sync: &mut S, x: i32, y: i32)
        -> ClickOutcome;

    /// Runs whatever simulation this role owns. Returns true when state
    /// changed.
    fn tick(&mut self, engine: &mut MoldEngine, sync: &mut S, due: TickDue) -> bool;

    fn on_intent(&mut self, _engine: &mut MoldEngine, _sync: &mut S, x: i32, y: i32, from: &str) {
        debug!(x, y, from, "only the host acts on intents");
    }

    /// Applies state from the authority. Returns the cells that were
    /// cleansed remotely.
    fn on_state(
        &mut self,
        _engine: &mut MoldEngine,
        _sync: &mut S,
        _payload: &GameStatePayload,
    ) -> Vec<(i32, i32)> {
        Vec::new()
    }

    fn on_state_requested(&mut self, _engine: &mut MoldEngine, _sync: &mut S, _peer: &str) {}

    fn on_roster_changed(&mut self, engine: &mut MoldEngine, _sync: &mut S, count: usize) {
        engine.apply_player_count(count);
    }

    /// Returns false when this role may not restart the game.
    fn restart(&mut self, _engine: &mut MoldEngine, _sync: &mut S, _seed: u32) -> bool {
        false
    }
}

pub fn authority_for<S: Synchronizer>(role: Role) -> Box<dyn Authority<S>> {
    match role {
        Role::Host => Box::new(HostAuthority),
        Role::Follower => Box::new(FollowerAuthority),
        Role::Relayed => Box::new(RelayAuthority),
    }
}

fn host_payload(engine: &MoldEngine) -> GameStatePayload {
    GameStatePayload {
        player_count: Some(engine.player_count()),
        ..engine.state().to_broadcast()
    }
}

/// Owns the simulation in the mesh and broadcasts after every mutation.
#[derive(Debug, Default)]
pub struct HostAuthority;

impl<S: Synchronizer> Authority<S> for HostAuthority {
    fn role(&self) -> Role {
        Role::Host
    }

    fn cell_clicked(&mut self, engine: &mut MoldEngine, sync: &mut S, x: i32, y: i32) -> ClickOutcome {
        let by = sync.local_id().map(str::to_string);
        if engine.remove_mold(x, y, by.as_deref()) {
            sync.broadcast_state(host_payload(engine));
            ClickOutcome::Removed
        } else {
            ClickOutcome::Missed
        }
    }

    fn tick(&mut self, engine: &mut MoldEngine, sync: &mut S, due: TickDue) -> bool {
        if engine.is_game_over() {
            return false;
        }
        let mut changed = false;
        if due.spawn {
            changed |= engine.spawn_mold().is_some();
        }
        if due.growth {
            changed |= engine.grow_mold() > 0;
        }
        if changed {
            sync.broadcast_state(host_payload(engine));
        }
        changed
    }

    fn on_intent(&mut self, engine: &mut MoldEngine, sync: &mut S, x: i32, y: i32, from: &str) {
        if engine.remove_mold(x, y, Some(from)) {
            sync.broadcast_state(host_payload(engine));
        }
    }

    fn on_state_requested(&mut self, engine: &mut MoldEngine, sync: &mut S, peer: &str) {
        let payload = GameStatePayload {
            player_count: Some(engine.player_count()),
            ..engine.state().to_full_sync()
        };
        sync.send_state_to(peer, payload);
    }

    fn on_roster_changed(&mut self, engine: &mut MoldEngine, sync: &mut S, count: usize) {
        engine.apply_player_count(count);
        sync.broadcast_state(host_payload(engine));
    }

    fn restart(&mut self, engine: &mut MoldEngine, sync: &mut S, seed: u32) -> bool {
        engine.restart(seed);
        sync.broadcast_state(GameStatePayload {
            player_count: Some(engine.player_count()),
            ..engine.state().to_full_sync()
        });
        true
    }
}

/// Mirrors the host. Clicks become intents and local state is only ever
/// replaced from incoming frames.
#[derive(Debug, Default)]
pub struct FollowerAuthority;

impl<S: Synchronizer> Authority<S> for FollowerAuthority {
    fn role(&self) -> Role {
        Role::Follower
    }

    fn cell_clicked(&mut self, engine: &mut MoldEngine, sync: &mut S, x: i32, y: i32) -> ClickOutcome {
        if engine.is_game_over() || !engine.state().grid.is(x, y, TerrainCell::Mold) {
            return ClickOutcome::Missed;
        }
        sync.send_intent(Intent::RemoveMold { x, y });
        ClickOutcome::Forwarded
    }

    fn tick(&mut self, _engine: &mut MoldEngine, _sync: &mut S, _due: TickDue) -> bool {
        false
    }

    fn on_state(
        &mut self,
        engine: &mut MoldEngine,
        _sync: &mut S,
        payload: &GameStatePayload,
    ) -> Vec<(i32, i32)> {
        engine.apply_remote_state(payload)
    }

    /// Difficulty and rates come from the host's state. Promotion recomputes
    /// them from the roster.
    fn on_roster_changed(&mut self, _engine: &mut MoldEngine, _sync: &mut S, count: usize) {
        debug!(count, "roster changed, keeping host difficulty");
    }
}

/// Relay participant. There is no single simulation owner: every client
/// grows mold locally, pushes spot lists to the relay and adopts whatever
/// the relay fans out last.
#[derive(Debug, Default)]
pub struct RelayAuthority;

impl<S: Synchronizer> Authority<S> for RelayAuthority {
    fn role(&self) -> Role {
        Role::Relayed
    }

    /// Removes optimistically, then tells the relay.
    fn cell_clicked(&mut self, engine: &mut MoldEngine, sync: &mut S, x: i32, y: i32) -> ClickOutcome {
        let by = sync.local_id().map(str::to_string);
        if !engine.remove_mold(x, y, by.as_deref()) {
            return ClickOutcome::Missed;
        }
        sync.send_intent(Intent::RemoveMold { x, y });
        ClickOutcome::Removed
    }

    fn tick(&mut self, engine: &mut MoldEngine, sync: &mut S, due: TickDue) -> bool {
        if engine.is_game_over() {
            return false;
        }
        let mut changed = false;
        if due.spawn {
            if let Some((x, y)) = engine.spawn_mold() {
                sync.send_intent(Intent::AddMold(MoldSpot::seed(x, y)));
                changed = true;
            }
        }
        if due.growth && engine.grow_mold() > 0 {
            sync.send_intent(Intent::GrowMold(engine.state().mold_spots.clone()));
            changed = true;
        }
        changed
    }

    fn on_state(
        &mut self,
        engine: &mut MoldEngine,
        _sync: &mut S,
        payload: &GameStatePayload,
    ) -> Vec<(i32, i32)> {
        engine.apply_remote_state(payload)
    }

    /// Resets the local view only. The relay keeps its state and the next
    /// broadcast repopulates the spots.
    fn restart(&mut self, engine: &mut MoldEngine, _sync: &mut S, _seed: u32) -> bool {
        let seed = engine.seed();
        engine.restart(seed);
        true
    }
}
