use std::time::Duration;

use clap::Parser;
use futures_util::{Sink, SinkExt, StreamExt};
use mold_defense_server::config::{DifficultyCurve, SimulationConfig};
use mold_defense_server::constants::FRAME_MS;
use mold_defense_server::protocol::encode_message;
use mold_defense_server::relay_client::{ConnectionState, RelayClient};
use mold_defense_server::scheduler::{Clock, SystemClock};
use mold_defense_server::session::{GameSession, SessionEvent};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

type RelaySession = GameSession<RelayClient, SystemClock>;
type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Headless relay participant. Plays the shared game over a websocket and
/// reconnects with backoff when the relay goes away.
#[derive(Debug, Parser)]
#[command(name = "relay-client", version)]
struct Args {
    /// Relay websocket endpoint.
    #[arg(long, default_value = "ws://127.0.0.1:3000/ws")]
    url: String,
    /// Cleanse a random mold cell this often, in milliseconds.
    #[arg(long)]
    clean_every_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LinkEnd {
    Dropped,
    Shutdown,
}

struct Driver {
    session: RelaySession,
    frames: Interval,
    clean_every_ms: Option<u64>,
    next_clean_at: u64,
}

impl Driver {
    fn new(clean_every_ms: Option<u64>) -> Self {
        let config = SimulationConfig::default().with_curve(DifficultyCurve::Remote);
        let mut session = GameSession::new(config, 0, RelayClient::new(), SystemClock);
        session.join(None).unwrap_or_else(|never| match never {});
        Self {
            session,
            frames: tokio::time::interval(Duration::from_millis(FRAME_MS)),
            clean_every_ms,
            next_clean_at: 0,
        }
    }

    fn on_frame(&mut self) {
        self.session.tick();
        let now = SystemClock.now_ms();
        self.session.sync_mut().poll(now);

        let Some(every) = self.clean_every_ms else {
            return;
        };
        if now < self.next_clean_at || self.session.sync().state() != ConnectionState::Connected {
            return;
        }
        self.next_clean_at = now + every;
        let spots = self.session.mold_spots();
        if spots.is_empty() {
            return;
        }
        let target = &spots[rand::rng().random_range(0..spots.len())];
        let (x, y) = (target.x, target.y);
        let outcome = self.session.cell_clicked(x, y);
        debug!(x, y, ?outcome, "cleansing");
    }

    /// Plays until the link drops or the process is interrupted.
    async fn drive_link(&mut self, socket: RelaySocket) -> LinkEnd {
        self.session.sync_mut().connection_opened(SystemClock.now_ms());
        let (mut sink, mut stream) = socket.split();
        loop {
            tokio::select! {
                _ = self.frames.tick() => self.on_frame(),
                received = stream.next() => match received {
                    Some(Ok(Message::Text(raw))) => {
                        self.session.sync_mut().receive(raw.as_str());
                        self.session.pump();
                    }
                    Some(Ok(Message::Binary(raw))) => match std::str::from_utf8(&raw) {
                        Ok(text) => {
                            self.session.sync_mut().receive(text);
                            self.session.pump();
                        }
                        Err(_) => warn!("dropping binary frame that is not utf8"),
                    },
                    Some(Ok(Message::Close(_))) | None => return LinkEnd::Dropped,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket read failed");
                        return LinkEnd::Dropped;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    self.session.leave();
                    let _ = sink.send(Message::Close(None)).await;
                    return LinkEnd::Shutdown;
                }
            }
            if let Err(err) = self.flush(&mut sink).await {
                debug!(error = %err, "websocket write failed");
                return LinkEnd::Dropped;
            }
        }
    }

    /// Keeps the local game running between dial attempts.
    async fn wait_for_redial(&mut self) -> LinkEnd {
        while self.session.sync().state() == ConnectionState::Disconnected {
            tokio::select! {
                _ = self.frames.tick() => self.on_frame(),
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down");
                    self.session.leave();
                    return LinkEnd::Shutdown;
                }
            }
            self.log_events();
        }
        LinkEnd::Dropped
    }

    async fn flush<S>(&mut self, sink: &mut S) -> Result<(), tungstenite::Error>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        for message in self.session.sync_mut().take_outbox() {
            match encode_message(&message) {
                Ok(raw) => sink.send(Message::Text(raw.into())).await?,
                Err(err) => warn!(error = %err, "failed to encode frame"),
            }
        }
        self.log_events();
        Ok(())
    }

    fn log_events(&mut self) {
        for event in self.session.take_events() {
            match &event {
                SessionEvent::Engine { .. } => debug!(?event, "engine"),
                _ => info!(?event, "session"),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    info!(url = %args.url, "relay client starting");

    let mut driver = Driver::new(args.clean_every_ms);
    loop {
        match connect_async(args.url.as_str()).await {
            Ok((socket, _)) => {
                if driver.drive_link(socket).await == LinkEnd::Shutdown {
                    break;
                }
                driver.session.sync_mut().connection_closed(SystemClock.now_ms());
            }
            Err(err) => {
                warn!(url = %args.url, error = %err, "failed to reach relay");
                driver.session.sync_mut().connection_closed(SystemClock.now_ms());
            }
        }
        if driver.wait_for_redial().await == LinkEnd::Shutdown {
            break;
        }
    }

    let state = driver.session.state();
    info!(
        defeated = state.defeated_count,
        mold = state.mold_count(),
        game_over = state.game_over,
        "final state"
    );
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mold_defense_server::protocol::{parse_message, WireMessage};
    use mold_defense_server::sync::Synchronizer;
    use tokio::net::TcpListener;

    const INIT: &str = r#"{"type":"init","playerId":"p1","gameState":{"playerCount":2,"moldSpots":[{"x":1,"y":1,"size":1,"growthRate":1}],"defeatedCount":0,"difficulty":1.2,"seed":77}}"#;

    #[tokio::test]
    async fn link_adopts_init_and_forwards_cleansing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            socket.send(Message::Text(INIT.into())).await.unwrap();
            let forwarded = loop {
                match socket.next().await {
                    Some(Ok(Message::Text(raw))) => break parse_message(raw.as_str()).unwrap(),
                    Some(Ok(_)) => continue,
                    other => panic!("link ended early: {other:?}"),
                }
            };
            socket.close(None).await.unwrap();
            forwarded
        });

        let mut driver = Driver::new(Some(1));
        let (socket, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        let end = tokio::time::timeout(Duration::from_secs(5), driver.drive_link(socket))
            .await
            .expect("link ends after the relay closes");

        assert_eq!(end, LinkEnd::Dropped);
        assert_eq!(driver.session.sync().local_id(), Some("p1"));
        assert_eq!(driver.session.sync().player_count(), 2);
        assert!(matches!(
            relay.await.unwrap(),
            WireMessage::RemoveMold { x: 1, y: 1, .. }
        ));
        assert_eq!(driver.session.defeated_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_relay_schedules_backoff() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = closed.local_addr().unwrap();
        drop(closed);

        let mut driver = Driver::new(None);
        assert_eq!(driver.session.sync().state(), ConnectionState::Connecting);
        assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());

        let before = SystemClock.now_ms();
        let delay = driver.session.sync_mut().connection_closed(before);
        assert_eq!(driver.session.sync().state(), ConnectionState::Disconnected);
        assert_eq!(driver.session.sync().reconnect_at(), Some(before + delay));
        assert!(!driver.session.sync_mut().poll(before));
        assert!(driver.session.sync_mut().poll(before + delay));
        assert_eq!(driver.session.sync().state(), ConnectionState::Connecting);
    }
}
