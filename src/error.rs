use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid json: {0}")]
    Json(#[source] serde_json::Error),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GridError {
    #[error("unknown terrain code {0}")]
    UnknownTerrain(u8),
    #[error("grid row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("grid of {width}x{height} exceeds the {max} cell side limit")]
    TooLarge {
        width: usize,
        height: usize,
        max: i32,
    },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("cannot join your own lobby `{0}`")]
    SelfJoin(String),
    #[error("already connected to lobby `{0}`")]
    AlreadyConnected(String),
}
