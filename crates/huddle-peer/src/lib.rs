//! Client side of a huddle room: signaling connection, one WebRTC link per
//! remote peer, and the coordinator that keeps those links in step with room
//! membership.

pub mod coordinator;
pub mod error;
pub mod link;
pub mod media;
pub mod render;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod webrtc;

pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::PeerError;
pub use link::{LinkSnapshot, LinkState};
pub use media::LocalMedia;
pub use session::{run_session, SessionConfig, SessionEnd};
pub use signaling::SignalingClient;
pub use transport::{LinkContext, LinkEvents, LinkRole, MediaRenderer, PeerTransport, TransportFactory};
