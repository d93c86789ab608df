//! The wire seam between the signaling channel and whatever relays the messages.
//!
//! A relay moves text frames between the members of a session room.  It does not know
//! anything about the messages it carries.
use crate::common::box_error::BoxError;

#[cfg(test)]
use mockall::automock;

#[cfg_attr(test, automock)]
pub trait Relay: Send {
    /// (re)open the connection to the relay
    fn connect(&mut self) -> Result<(), BoxError>;
    fn is_connected(&self) -> bool;
    /// become a member of the room for this session
    fn join(&mut self, session_id: &str) -> Result<(), BoxError>;
    fn leave(&mut self, session_id: &str) -> Result<(), BoxError>;
    fn send_text(&mut self, text: &str) -> Result<(), BoxError>;
    /// Read one frame.  Returns Ok(None) when nothing is waiting, it must not block for
    /// more than a few msec.
    fn recv_text(&mut self) -> Result<Option<String>, BoxError>;
    fn disconnect(&mut self);
}
