//! Error type used across thread boundaries.
//!
//! Collaborators (relay, transport, config files) can fail in many different ways, so
//! anything they return is boxed.  The Send + Sync bounds let the error travel out of the
//! relay and playback threads.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
