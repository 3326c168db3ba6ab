use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("local media unavailable: {0}")]
    Media(String),
}
