//! Audio frames on their way in and out of a duet session.
pub mod audio_frame;
pub mod frame_queue;
pub mod jitter_buffer;
pub mod transform;
