//! Signaling: the messages, the relay seam, and the channel adapter that multiplexes
//! sessions over one relay connection.
pub mod channel;
pub mod memory_relay;
pub mod message;
pub mod relay;
pub mod retry;
pub mod websocket_relay;
