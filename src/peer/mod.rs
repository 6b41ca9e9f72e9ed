pub mod connection;
pub mod ice;
pub mod negotiation;
pub mod state;
pub mod types;

pub use state::{LinkState, PeerLink, PeerRegistry, GRACE_PERIOD};
pub use types::{IceCandidate, RosterEntry, ServerConfig};
