//! Shared clock between host and guest, see [`sync_engine::ClockSyncEngine`].
pub mod sample;
pub mod sync_engine;
