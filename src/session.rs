use serde::Serialize;
use tracing::info;

use crate::authority::{authority_for, Authority, ClickOutcome};
use crate::config::SimulationConfig;
use crate::engine::{EngineEvent, MoldEngine, SimulationState};
use crate::scheduler::{Clock, SystemClock, TickDue, TickScheduler};
use crate::sync::{SyncEvent, Synchronizer};
use crate::types::{Grid, MoldSpot, PlayerAction, Role};

/// What the UI layer gets told about, in order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StateApplied { removed: Vec<(i32, i32)> },
    RosterChanged { count: usize },
    RoleChanged { role: Role },
    PlayerJoined { peer: String },
    PlayerLeft { peer: String },
    PlayerAction { action: PlayerAction },
    Disconnected,
    Engine { event: EngineEvent },
}

/// One participant: the simulation, its timers, the role-specific authority
/// and the synchronizer that links it to everybody else.
pub struct GameSession<S: Synchronizer, C: Clock = SystemClock> {
    engine: MoldEngine,
    scheduler: TickScheduler<C>,
    authority: Box<dyn Authority<S>>,
    sync: S,
    events: Vec<SessionEvent>,
}

impl<S: Synchronizer, C: Clock> GameSession<S, C> {
    pub fn new(config: SimulationConfig, seed: u32, sync: S, clock: C) -> Self {
        let role = sync.role();
        Self {
            engine: MoldEngine::new(config, seed),
            scheduler: TickScheduler::new(clock),
            authority: authority_for(role),
            sync,
            events: Vec::new(),
        }
    }

    pub fn engine(&self) -> &MoldEngine {
        &self.engine
    }

    pub fn state(&self) -> &SimulationState {
        self.engine.state()
    }

    pub fn grid(&self) -> &Grid {
        &self.engine.state().grid
    }

    pub fn mold_spots(&self) -> &[MoldSpot] {
        &self.engine.state().mold_spots
    }

    pub fn defeated_count(&self) -> u64 {
        self.engine.state().defeated_count
    }

    pub fn difficulty(&self) -> f64 {
        self.engine.state().difficulty
    }

    pub fn is_game_over(&self) -> bool {
        self.engine.is_game_over()
    }

    pub fn role(&self) -> Role {
        self.authority.role()
    }

    pub fn sync(&self) -> &S {
        &self.sync
    }

    /// Transports feed the synchronizer through this; call `pump` afterwards.
    pub fn sync_mut(&mut self) -> &mut S {
        &mut self.sync
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn join(&mut self, target: Option<&str>) -> Result<(), S::Error> {
        self.sync.join(target)?;
        self.pump();
        Ok(())
    }

    pub fn leave(&mut self) {
        self.sync.leave();
        self.pump();
    }

    pub fn cell_clicked(&mut self, x: i32, y: i32) -> ClickOutcome {
        let outcome = self
            .authority
            .cell_clicked(&mut self.engine, &mut self.sync, x, y);
        self.drain_engine_events();
        outcome
    }

    /// Handles pending network events, then runs whatever timers are due.
    pub fn tick(&mut self) -> TickDue {
        self.pump();
        let state = self.engine.state();
        let due = self.scheduler.poll(state.spawn_rate_ms, state.growth_rate_ms);
        if due.frame {
            self.authority.tick(&mut self.engine, &mut self.sync, due);
            self.drain_engine_events();
        }
        due
    }

    /// Regenerates the map. Followers cannot restart a shared game.
    pub fn restart(&mut self, seed: u32) -> bool {
        let restarted = self
            .authority
            .restart(&mut self.engine, &mut self.sync, seed);
        if restarted {
            self.scheduler.rebase();
        }
        self.drain_engine_events();
        restarted
    }

    pub fn pause(&mut self) {
        self.scheduler.pause();
    }

    pub fn resume(&mut self) {
        self.scheduler.resume();
    }

    /// Drains the synchronizer until it stops producing events. Handlers can
    /// queue further events, such as a host election after a disconnect.
    pub fn pump(&mut self) {
        loop {
            let events = self.sync.take_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                self.handle_sync_event(event);
            }
        }
        self.drain_engine_events();
    }

    fn handle_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::PlayerJoined { peer } => self.events.push(SessionEvent::PlayerJoined { peer }),
            SyncEvent::PlayerLeft { peer } => self.events.push(SessionEvent::PlayerLeft { peer }),
            SyncEvent::RosterChanged { count } => {
                self.authority
                    .on_roster_changed(&mut self.engine, &mut self.sync, count);
                self.events.push(SessionEvent::RosterChanged { count });
            }
            SyncEvent::StateReceived(payload) => {
                let removed = self
                    .authority
                    .on_state(&mut self.engine, &mut self.sync, &payload);
                self.events.push(SessionEvent::StateApplied { removed });
            }
            SyncEvent::StateRequested { peer } => {
                self.authority
                    .on_state_requested(&mut self.engine, &mut self.sync, &peer);
            }
            SyncEvent::IntentReceived { x, y, from } => {
                self.authority
                    .on_intent(&mut self.engine, &mut self.sync, x, y, &from);
            }
            SyncEvent::BecameHost | SyncEvent::HostChanged { .. } => self.sync_role(),
            SyncEvent::PlayerAction(action) => {
                self.events.push(SessionEvent::PlayerAction { action })
            }
            SyncEvent::Disconnected => self.events.push(SessionEvent::Disconnected),
        }
    }

    fn sync_role(&mut self) {
        let role = self.sync.role();
        if role == self.authority.role() {
            return;
        }
        info!(from = ?self.authority.role(), to = ?role, "role changed");
        self.authority = authority_for(role);
        if role == Role::Host {
            // a promoted follower starts its timers now rather than replaying
            // the time it spent mirroring
            self.scheduler.rebase();
            let count = self.sync.player_count();
            self.authority
                .on_roster_changed(&mut self.engine, &mut self.sync, count);
        }
        self.events.push(SessionEvent::RoleChanged { role });
    }

    fn drain_engine_events(&mut self) {
        self.events.extend(
            self.engine
                .take_events()
                .into_iter()
                .map(|event| SessionEvent::Engine { event }),
        );
    }
}
