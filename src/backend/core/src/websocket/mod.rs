//! Live update fan-out over WebSocket.

mod broadcast;
mod handler;
mod message;

pub use broadcast::{BroadcastStats, Broadcaster, CONNECTION_BUFFER};
pub use handler::ws_handler;
pub use message::PushMessage;
