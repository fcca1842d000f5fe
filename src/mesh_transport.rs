use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::mesh::Envelope;
use crate::protocol::encode_message;

const LINK_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Opened { peer: String, outgoing: bool },
    Frame { peer: String, raw: String },
    Closed { peer: String },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Hello {
    peer_id: String,
}

struct Link {
    tx: mpsc::Sender<String>,
    reader: AbortHandle,
    /// Distinguishes a redialed link from the one it replaced.
    generation: u64,
}

type Links = Arc<Mutex<HashMap<String, Link>>>;

/// Drops `peer`'s link if it is still the one tagged `generation`.
async fn release_link(links: &Links, peer: &str, generation: u64) -> bool {
    let mut links = links.lock().await;
    if links.get(peer).is_some_and(|link| link.generation == generation) {
        links.remove(peer);
        true
    } else {
        false
    }
}

/// Newline-delimited JSON over TCP. Each side opens with a `{"peerId":..}`
/// line; after that every line is one protocol frame.
#[derive(Clone)]
pub struct MeshTransport {
    local_id: String,
    links: Links,
    generations: Arc<AtomicU64>,
    events: mpsc::Sender<TransportEvent>,
}

impl MeshTransport {
    /// Listens on `addr` and returns the transport, its inbound event stream,
    /// and the bound address.
    pub async fn bind(
        addr: SocketAddr,
        local_id: impl Into<String>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>, SocketAddr), TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Self {
            local_id: local_id.into(),
            links: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            events,
        };

        let acceptor = transport.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(err) = acceptor.accept_link(stream).await {
                                warn!(%remote, error = %err, "inbound handshake failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                }
            }
        });

        info!(%bound, "mesh transport listening");
        Ok((transport, events_rx, bound))
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Connects to a lobby address and returns the remote peer id.
    pub async fn dial(&self, addr: SocketAddr) -> Result<String, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, mut write_half) = stream.into_split();
        write_hello(&mut write_half, &self.local_id).await?;
        let mut lines = BufReader::new(read_half).lines();
        let peer = read_hello(&mut lines).await?;
        self.attach(peer.clone(), true, lines, write_half).await;
        Ok(peer)
    }

    async fn accept_link(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let peer = read_hello(&mut lines).await?;
        write_hello(&mut write_half, &self.local_id).await?;
        self.attach(peer, false, lines, write_half).await;
        Ok(())
    }

    async fn attach(
        &self,
        peer: String,
        outgoing: bool,
        mut lines: Lines<BufReader<OwnedReadHalf>>,
        mut write_half: OwnedWriteHalf,
    ) {
        let (tx, mut rx) = mpsc::channel::<String>(LINK_QUEUE);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err()
                    || write_half.write_all(b"\n").await.is_err()
                {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let events = self.events.clone();
        let links = self.links.clone();
        let reader_peer = peer.clone();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        // frames must not overtake the Opened event
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let reader = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let raw = line.trim();
                        if raw.is_empty() {
                            continue;
                        }
                        let frame = TransportEvent::Frame {
                            peer: reader_peer.clone(),
                            raw: raw.to_string(),
                        };
                        if events.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(peer = %reader_peer, error = %err, "read failed");
                        break;
                    }
                }
            }
            if !release_link(&links, &reader_peer, generation).await {
                debug!(peer = %reader_peer, generation, "stale link closed");
                return;
            }
            let _ = events
                .send(TransportEvent::Closed { peer: reader_peer })
                .await;
        });

        let previous = self.links.lock().await.insert(
            peer.clone(),
            Link {
                tx,
                reader: reader.abort_handle(),
                generation,
            },
        );
        if let Some(previous) = previous {
            previous.reader.abort();
        }
        let _ = self
            .events
            .send(TransportEvent::Opened { peer, outgoing })
            .await;
        let _ = ready_tx.send(());
    }

    /// Queues a raw frame. A full queue drops the frame rather than block
    /// the session loop.
    pub async fn send(&self, peer: &str, raw: String) -> Result<(), TransportError> {
        let links = self.links.lock().await;
        let Some(link) = links.get(peer) else {
            return Err(TransportError::ChannelClosed);
        };
        if link.tx.try_send(raw).is_err() {
            warn!(peer, "outbound queue full, dropping frame");
        }
        Ok(())
    }

    pub async fn deliver(&self, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            let raw = match encode_message(&envelope.message) {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(error = %err, "failed to encode frame");
                    continue;
                }
            };
            if let Err(err) = self.send(&envelope.to, raw).await {
                debug!(peer = %envelope.to, error = %err, "frame for closed link");
            }
        }
    }

    pub async fn disconnect(&self, peer: &str) {
        let removed = self.links.lock().await.remove(peer);
        if let Some(link) = removed {
            link.reader.abort();
            let _ = self
                .events
                .send(TransportEvent::Closed {
                    peer: peer.to_string(),
                })
                .await;
        }
    }
}

async fn write_hello(write_half: &mut OwnedWriteHalf, local_id: &str) -> Result<(), TransportError> {
    let hello = serde_json::to_string(&Hello {
        peer_id: local_id.to_string(),
    })
    .map_err(|err| TransportError::Handshake(err.to_string()))?;
    write_half.write_all(hello.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

async fn read_hello(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Result<String, TransportError> {
    let Some(line) = lines.next_line().await? else {
        return Err(TransportError::Handshake("closed before hello".to_string()));
    };
    let hello: Hello = serde_json::from_str(line.trim())
        .map_err(|err| TransportError::Handshake(err.to_string()))?;
    if hello.peer_id.is_empty() {
        return Err(TransportError::Handshake("empty peer id".to_string()));
    }
    Ok(hello.peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireMessage;

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open")
    }

    #[tokio::test]
    async fn peers_handshake_and_exchange_frames() {
        let any = "127.0.0.1:0".parse().unwrap();
        let (a, mut a_rx, a_addr) = MeshTransport::bind(any, "a").await.unwrap();
        let (b, mut b_rx, _) = MeshTransport::bind(any, "b").await.unwrap();

        let remote = b.dial(a_addr).await.unwrap();
        assert_eq!(remote, "a");
        assert_eq!(
            next_event(&mut b_rx).await,
            TransportEvent::Opened {
                peer: "a".to_string(),
                outgoing: true
            }
        );
        assert_eq!(
            next_event(&mut a_rx).await,
            TransportEvent::Opened {
                peer: "b".to_string(),
                outgoing: false
            }
        );

        b.deliver(vec![Envelope {
            to: "a".to_string(),
            message: WireMessage::RequestGameState,
        }])
        .await;
        assert_eq!(
            next_event(&mut a_rx).await,
            TransportEvent::Frame {
                peer: "b".to_string(),
                raw: r#"{"type":"requestGameState"}"#.to_string()
            }
        );

        b.disconnect("a").await;
        assert_eq!(
            next_event(&mut b_rx).await,
            TransportEvent::Closed {
                peer: "a".to_string()
            }
        );
        assert_eq!(
            next_event(&mut a_rx).await,
            TransportEvent::Closed {
                peer: "b".to_string()
            }
        );
    }

    #[tokio::test]
    async fn stale_generation_leaves_replacement_link() {
        let links: Links = Arc::new(Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::channel(1);
        let reader = tokio::spawn(async {}).abort_handle();
        links.lock().await.insert(
            "b".to_string(),
            Link {
                tx,
                reader,
                generation: 2,
            },
        );

        assert!(!release_link(&links, "b", 1).await);
        assert!(links.lock().await.contains_key("b"));
        assert!(!release_link(&links, "c", 2).await);
        assert!(release_link(&links, "b", 2).await);
        assert!(links.lock().await.is_empty());
    }

    #[tokio::test]
    async fn redial_keeps_the_newer_link() {
        let any = "127.0.0.1:0".parse().unwrap();
        let (a, mut a_rx, a_addr) = MeshTransport::bind(any, "a").await.unwrap();
        let (b, mut b_rx, _) = MeshTransport::bind(any, "b").await.unwrap();

        b.dial(a_addr).await.unwrap();
        assert!(matches!(next_event(&mut a_rx).await, TransportEvent::Opened { .. }));
        assert!(matches!(next_event(&mut b_rx).await, TransportEvent::Opened { .. }));

        // replacing b's first link shuts its socket, so a sees EOF there
        b.dial(a_addr).await.unwrap();
        assert!(matches!(next_event(&mut a_rx).await, TransportEvent::Opened { .. }));
        assert!(matches!(next_event(&mut b_rx).await, TransportEvent::Opened { .. }));

        let quiet = tokio::time::timeout(std::time::Duration::from_millis(200), a_rx.recv()).await;
        assert!(quiet.is_err(), "unexpected event {quiet:?}");

        a.send("b", r#"{"type":"requestGameState"}"#.to_string())
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut b_rx).await,
            TransportEvent::Frame {
                peer: "a".to_string(),
                raw: r#"{"type":"requestGameState"}"#.to_string()
            }
        );
    }

    #[tokio::test]
    async fn sending_to_unknown_peer_fails() {
        let any = "127.0.0.1:0".parse().unwrap();
        let (a, _rx, _) = MeshTransport::bind(any, "a").await.unwrap();
        assert!(matches!(
            a.send("nobody", "{}".to_string()).await,
            Err(TransportError::ChannelClosed)
        ));
    }
}
