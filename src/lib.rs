//! duet_sync - duet session synchronization engine
//!
//! provides the pieces a karaoke client needs to sing a duet with one partner over the
//! network: signaling through a relay, the session state machine, a shared clock, an
//! adaptive jitter buffer for the partner's audio, and the metrics that tie them together.
//! The [`engine::duet_engine::DuetEngine`] drives all of it from one event loop.
extern crate json;

pub mod clock;
pub mod common;
pub mod engine;
pub mod favorites;
pub mod media;
pub mod metrics;
pub mod relay_server;
pub mod session;
pub mod signaling;
pub mod transport;
