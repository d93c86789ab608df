//! The duet engine: the event loop that owns a session, and the command loop around it.
pub mod client;
pub mod duet_engine;
