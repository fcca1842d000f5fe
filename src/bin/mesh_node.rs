use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use mold_defense_server::config::{DifficultyCurve, SimulationConfig};
use mold_defense_server::constants::FRAME_MS;
use mold_defense_server::mesh::MeshPeer;
use mold_defense_server::mesh_transport::{MeshTransport, TransportEvent};
use mold_defense_server::scheduler::SystemClock;
use mold_defense_server::session::{GameSession, SessionEvent};
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

type MeshSession = GameSession<MeshPeer, SystemClock>;

/// Headless mesh participant. Hosts a game, or joins one by address.
#[derive(Debug, Parser)]
#[command(name = "mesh-node", version)]
struct Args {
    /// Address to accept peer connections on.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,
    /// Address of a lobby host to join.
    #[arg(long)]
    join: Option<SocketAddr>,
    /// Peer id announced to others. Random when omitted.
    #[arg(long)]
    id: Option<String>,
    /// Terrain seed used while hosting.
    #[arg(long)]
    seed: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    let peer_id = args.id.unwrap_or_else(make_peer_id);
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    let (transport, mut transport_events, bound) =
        MeshTransport::bind(args.listen, peer_id.clone()).await?;
    info!(peer_id = %peer_id, %bound, seed, "mesh node up");

    let config = SimulationConfig::default().with_curve(DifficultyCurve::PlayerCount);
    let mut session: MeshSession = GameSession::new(config, seed, MeshPeer::new(), SystemClock);
    session.sync_mut().registered(peer_id.clone());
    session.pump();

    if let Some(addr) = args.join {
        join_lobby(&transport, &mut session, addr).await;
    }
    flush(&transport, &mut session).await;

    let mut frames = tokio::time::interval(Duration::from_millis(FRAME_MS));
    loop {
        tokio::select! {
            _ = frames.tick() => {
                session.tick();
            }
            event = transport_events.recv() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    TransportEvent::Opened { peer, outgoing } => {
                        session.sync_mut().connection_opened(&peer, outgoing);
                    }
                    TransportEvent::Frame { peer, raw } => session.sync_mut().receive(&peer, &raw),
                    TransportEvent::Closed { peer } => session.sync_mut().connection_closed(&peer),
                }
                session.pump();
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                session.leave();
                break;
            }
        }
        flush(&transport, &mut session).await;
    }

    let state = session.state();
    info!(
        defeated = state.defeated_count,
        mold = state.mold_count(),
        game_over = state.game_over,
        "final state"
    );
    Ok(())
}

/// Dials a lobby host. Failure leaves the node hosting its own game.
async fn join_lobby(transport: &MeshTransport, session: &mut MeshSession, addr: SocketAddr) -> bool {
    let lobby_id = match transport.dial(addr).await {
        Ok(lobby_id) => lobby_id,
        Err(err) => {
            warn!(%addr, error = %err, "failed to connect to lobby, staying host");
            return false;
        }
    };
    if let Err(err) = session.join(Some(&lobby_id)) {
        warn!(lobby_id = %lobby_id, error = %err, "lobby join rejected");
        transport.disconnect(&lobby_id).await;
        return false;
    }
    true
}

async fn flush(transport: &MeshTransport, session: &mut MeshSession) {
    transport.deliver(session.sync_mut().take_outbox()).await;
    for event in session.take_events() {
        match &event {
            SessionEvent::Engine { .. } => debug!(?event, "engine"),
            _ => info!(?event, "session"),
        }
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn make_peer_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mold_defense_server::types::Role;

    #[tokio::test]
    async fn unreachable_lobby_keeps_node_hosting() {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let closed = std::net::TcpListener::bind(any).unwrap();
        let dead_addr = closed.local_addr().unwrap();
        drop(closed);

        let (transport, _events, _) = MeshTransport::bind(any, "solo").await.unwrap();
        let mut session: MeshSession =
            GameSession::new(SimulationConfig::default(), 1, MeshPeer::new(), SystemClock);
        session.sync_mut().registered("solo");
        session.pump();

        assert!(!join_lobby(&transport, &mut session, dead_addr).await);
        assert_eq!(session.role(), Role::Host);
        assert!(session.sync().pending_lobby().is_none());
    }
}
