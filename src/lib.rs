pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use error::SessionError;
pub use events::RoomEvent;
pub use media::AudioFeed;
pub use peer::{LinkState, RosterEntry, ServerConfig};
pub use session::{AudioSink, RoomConfig, RoomSession};
