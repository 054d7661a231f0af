//! WebSocket surface: one socket per client, JSON frames in both directions.

mod handler;
pub mod protocol;

pub use handler::handle_socket;
pub use protocol::{ClientMessage, ServerMessage};
