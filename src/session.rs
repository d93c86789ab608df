//! The duet session and its lifecycle.
pub mod state;
pub mod state_machine;
