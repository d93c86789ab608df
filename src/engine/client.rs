//! Command driven loop around a [`DuetEngine`].
//!
//! The front end (the cli, or whatever UI sits on top) sends [`EngineCommand`]s over an
//! mpsc channel.  [`run`] applies them between passes of the engine's event loop, so the
//! engine itself is only ever touched from this one thread.
use std::{
    fmt,
    sync::mpsc::{Receiver, TryRecvError},
    thread::sleep,
    time::Duration,
};

use log::{debug, error, info, warn};
use serde_json::json;
use simple_error::bail;

use crate::{
    common::{box_error::BoxError, get_micro_time, ms_to_micros},
    engine::duet_engine::DuetEngine,
    session::state::SessionState,
    signaling::relay::Relay,
    transport::Transport,
};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    CreateSession,
    JoinSession(String),
    SetPitch(f32),
    SetMute(bool),
    /// log the local and peer start times for a song `lead_ms` from now
    ScheduleStart(u32),
    Disconnect,
    Quit,
}

impl EngineCommand {
    /// Parse one line of input, either a json object like
    /// `{"command": "pitch", "value": -2}` or the same thing typed as `pitch -2`
    pub fn from_string(data: &str) -> Result<EngineCommand, BoxError> {
        let data = data.trim();
        if data.starts_with('{') {
            let raw: serde_json::Value = serde_json::from_str(data)?;
            return Self::from_json(&raw);
        }
        let mut words = data.split_whitespace();
        let command = match words.next() {
            Some(c) => c,
            None => {
                bail!("empty command")
            }
        };
        let value = words.next().map(|v| json!(v)).unwrap_or(serde_json::Value::Null);
        Self::from_json(&json!({ "command": command, "value": value }))
    }

    pub fn from_json(raw: &serde_json::Value) -> Result<EngineCommand, BoxError> {
        let command = match raw["command"].as_str() {
            Some(c) => c.to_lowercase(),
            None => {
                bail!("no command in message")
            }
        };
        let value = &raw["value"];
        let text = match value {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        };
        match command.as_str() {
            "create" => Ok(EngineCommand::CreateSession),
            "join" => match text {
                Some(id) => Ok(EngineCommand::JoinSession(id)),
                None => {
                    bail!("join needs a session id")
                }
            },
            "pitch" => match text {
                Some(v) => Ok(EngineCommand::SetPitch(str::parse(&v)?)),
                None => {
                    bail!("pitch needs semitones")
                }
            },
            "mute" => match text.as_deref() {
                None | Some("true") | Some("on") => Ok(EngineCommand::SetMute(true)),
                Some("false") | Some("off") => Ok(EngineCommand::SetMute(false)),
                Some(other) => {
                    bail!("mute value {} is not on or off", other)
                }
            },
            "unmute" => Ok(EngineCommand::SetMute(false)),
            "start" => match text {
                Some(v) => Ok(EngineCommand::ScheduleStart(str::parse(&v)?)),
                None => Ok(EngineCommand::ScheduleStart(3000)),
            },
            "disconnect" | "bye" => Ok(EngineCommand::Disconnect),
            "quit" | "exit" => Ok(EngineCommand::Quit),
            other => {
                bail!("unknown command {}", other)
            }
        }
    }
}

impl fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EngineCommand::CreateSession => write!(f, "create"),
            EngineCommand::JoinSession(id) => write!(f, "join {}", id),
            EngineCommand::SetPitch(p) => write!(f, "pitch {}", p),
            EngineCommand::SetMute(m) => write!(f, "mute {}", m),
            EngineCommand::ScheduleStart(ms) => write!(f, "start {}", ms),
            EngineCommand::Disconnect => write!(f, "disconnect"),
            EngineCommand::Quit => write!(f, "quit"),
        }
    }
}

/// Apply one command.  Returns false when the loop should stop.
pub fn apply_command<R: Relay, T: Transport>(
    engine: &mut DuetEngine<R, T>,
    command: EngineCommand,
    now: u128,
) -> bool {
    debug!("command: {}", command);
    match command {
        EngineCommand::CreateSession => match engine.create_session(now) {
            Ok(id) => info!("hosting session {}, give this number to your partner", id),
            Err(e) if e.is_fatal() => error!("could not create session: {}", e),
            Err(e) => warn!("could not create session: {}", e),
        },
        EngineCommand::JoinSession(id) => {
            match engine.join_session(&id, now) {
                Err(e) if e.is_fatal() => error!("could not join session {}: {}", id, e),
                Err(e) => warn!("could not join session {}: {}", id, e),
                Ok(()) => info!("joined session {}", id),
            }
        }
        EngineCommand::SetPitch(p) => engine.set_pitch(p),
        EngineCommand::SetMute(m) => engine.set_mute(m),
        EngineCommand::ScheduleStart(lead_ms) => {
            match engine.schedule_start(now, ms_to_micros(lead_ms)) {
                Ok((local, remote)) => {
                    info!("start at local {} / peer {}", local, remote)
                }
                Err(e) => warn!("cannot schedule start: {}", e),
            }
        }
        EngineCommand::Disconnect => engine.disconnect(now),
        EngineCommand::Quit => {
            engine.shutdown(now);
            return false;
        }
    }
    true
}

/// Run the engine until a Quit command arrives, the command sender goes away, or (when
/// `exit_on_end` is set) the session reaches a terminal state.  Returns the last state.
pub fn run<R: Relay, T: Transport>(
    engine: &mut DuetEngine<R, T>,
    commands: Receiver<EngineCommand>,
    tick: Duration,
    exit_on_end: bool,
) -> Result<SessionState, BoxError> {
    info!("client - starting run loop, tick {:?}", tick);
    let mut running = true;
    while running {
        let now = get_micro_time();
        loop {
            match commands.try_recv() {
                Ok(command) => {
                    if !apply_command(engine, command, now) {
                        running = false;
                        break;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("command channel closed");
                    engine.shutdown(now);
                    running = false;
                    break;
                }
            }
        }
        if !running {
            break;
        }
        engine.process(now);
        if exit_on_end && engine.state().is_terminal() {
            info!("session is {}, leaving run loop", engine.state());
            engine.shutdown(get_micro_time());
            break;
        }
        sleep(tick);
    }
    Ok(engine.state())
}

#[cfg(test)]
mod test_client {
    use super::*;
    use crate::common::duet_config::DuetConfig;
    use crate::media::transform::Passthrough;
    use crate::signaling::memory_relay::MemoryHub;
    use crate::transport::loopback::LoopbackTransport;
    use std::sync::mpsc;

    #[test]
    fn parses_typed_commands() {
        assert_eq!(EngineCommand::from_string("create").unwrap(), EngineCommand::CreateSession);
        assert_eq!(
            EngineCommand::from_string("join 123456").unwrap(),
            EngineCommand::JoinSession(String::from("123456"))
        );
        assert_eq!(EngineCommand::from_string("pitch -2").unwrap(), EngineCommand::SetPitch(-2.0));
        assert_eq!(EngineCommand::from_string("mute").unwrap(), EngineCommand::SetMute(true));
        assert_eq!(EngineCommand::from_string("mute off").unwrap(), EngineCommand::SetMute(false));
        assert_eq!(EngineCommand::from_string("start").unwrap(), EngineCommand::ScheduleStart(3000));
        assert!(EngineCommand::from_string("").is_err());
        assert!(EngineCommand::from_string("dance").is_err());
        assert!(EngineCommand::from_string("pitch high").is_err());
    }

    #[test]
    fn parses_json_commands() {
        assert_eq!(
            EngineCommand::from_string(r#"{"command": "pitch", "value": 1.5}"#).unwrap(),
            EngineCommand::SetPitch(1.5)
        );
        assert_eq!(
            EngineCommand::from_string(r#"{"command": "join", "value": 42}"#).unwrap(),
            EngineCommand::JoinSession(String::from("42"))
        );
        assert!(EngineCommand::from_string(r#"{"value": 1}"#).is_err());
    }

    #[test]
    fn quit_stops_the_loop() {
        let hub = MemoryHub::new();
        let (a, _b) = LoopbackTransport::pair();
        let (tx, _rx) = mpsc::channel();
        let mut engine = DuetEngine::new(
            hub.relay(),
            a,
            Box::new(Passthrough::default()),
            DuetConfig::default(),
            tx,
            get_micro_time(),
        );
        let (cmd_tx, cmd_rx) = mpsc::channel();
        cmd_tx.send(EngineCommand::CreateSession).unwrap();
        cmd_tx.send(EngineCommand::SetMute(true)).unwrap();
        cmd_tx.send(EngineCommand::Quit).unwrap();
        let state = run(&mut engine, cmd_rx, Duration::from_millis(1), false).unwrap();
        assert_eq!(state, SessionState::Ended);
        assert!(engine.get_mute());
    }
}
