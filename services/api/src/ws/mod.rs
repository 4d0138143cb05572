//! WebSocket Conversation Sessions
//!
//! Each WebSocket connection drives one conversation coordinator:
//!
//! - `protocol`: the JSON message format between browser and server.
//! - `session`: the connection lifecycle, from `init` handshake to close.
//! - `rig`: the avatar rig that forwards animation effects to the browser.

pub mod protocol;
pub mod rig;
pub mod session;

pub use session::ws_handler;
