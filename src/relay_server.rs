//! Minimal websocket relay for duet signaling.
//!
//! Each connection gets its own thread.  A connection joins session rooms with
//! `{"event":"join","sessionId":..}` and leaves them with `{"event":"leave",..}`; any
//! other text frame carrying a `sessionId` is forwarded verbatim to the other members of
//! that room.  Frames sent into a room nobody else is in yet are held (up to
//! [`ROOM_BACKLOG`]) for the next member to join, so a guest that joins after the host
//! sent its offer still gets the offer.
//!
//! The relay never looks inside the messages beyond the session id.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use simple_error::bail;
use tungstenite::{Message, WebSocket};

use crate::common::box_error::BoxError;

/// frames held for a room with no one to deliver to
pub const ROOM_BACKLOG: usize = 64;

const READ_POLL: Duration = Duration::from_millis(10);

/// Who is in which room.  Shared by all the connection threads.
#[derive(Default)]
pub struct RelayRooms {
    members: HashMap<usize, Sender<String>>,
    rooms: HashMap<String, HashSet<usize>>,
    backlog: HashMap<String, VecDeque<String>>,
    forwarded: u64,
}

impl RelayRooms {
    pub fn new() -> RelayRooms {
        RelayRooms::default()
    }

    pub fn connect(&mut self, id: usize, outbox: Sender<String>) {
        self.members.insert(id, outbox);
    }

    /// drop a connection and every room membership it had
    pub fn disconnect(&mut self, id: usize) {
        self.members.remove(&id);
        let rooms: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, ids)| ids.contains(&id))
            .map(|(room, _)| room.clone())
            .collect();
        for room in rooms {
            self.leave(id, &room);
        }
    }

    pub fn join(&mut self, id: usize, room: &str) {
        self.rooms.entry(String::from(room)).or_default().insert(id);
        if let Some(held) = self.backlog.remove(room) {
            debug!("handing {} held frames for {} to {}", held.len(), room, id);
            if let Some(tx) = self.members.get(&id) {
                for text in held {
                    let _res = tx.send(text);
                    self.forwarded += 1;
                }
            }
        }
    }

    pub fn leave(&mut self, id: usize, room: &str) {
        let empty = match self.rooms.get_mut(room) {
            Some(ids) => {
                ids.remove(&id);
                ids.is_empty()
            }
            None => true,
        };
        if empty {
            self.rooms.remove(room);
            self.backlog.remove(room);
        }
    }

    /// send text to everybody in the room except the sender
    pub fn forward(&mut self, from: usize, room: &str, text: &str) {
        let mut count = 0;
        if let Some(ids) = self.rooms.get(room) {
            for id in ids.iter().filter(|id| **id != from) {
                if let Some(tx) = self.members.get(id) {
                    if tx.send(String::from(text)).is_ok() {
                        count += 1;
                    }
                }
            }
        }
        self.forwarded += count;
        if count == 0 {
            let held = self.backlog.entry(String::from(room)).or_default();
            if held.len() >= ROOM_BACKLOG {
                held.pop_front();
            }
            held.push_back(String::from(text));
        }
    }

    /// Handle one text frame from a connection
    pub fn handle_text(&mut self, from: usize, text: &str) -> Result<(), BoxError> {
        let raw: serde_json::Value = serde_json::from_str(text)?;
        let room = match raw["sessionId"].as_str() {
            Some(r) if !r.is_empty() => r,
            _ => {
                bail!("frame without a sessionId")
            }
        };
        match raw["event"].as_str() {
            Some("join") => {
                info!("connection {} joins {}", from, room);
                self.join(from, room);
            }
            Some("leave") => {
                info!("connection {} leaves {}", from, room);
                self.leave(from, room);
            }
            _ => {
                trace!("forward from {} in {}", from, room);
                self.forward(from, room, text);
            }
        }
        Ok(())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
    pub fn members_in(&self, room: &str) -> usize {
        self.rooms.get(room).map(|r| r.len()).unwrap_or(0)
    }
    pub fn held(&self, room: &str) -> usize {
        self.backlog.get(room).map(|b| b.len()).unwrap_or(0)
    }
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }
}

pub struct RelayServer {
    listener: TcpListener,
    rooms: Arc<Mutex<RelayRooms>>,
}

impl RelayServer {
    pub fn bind(addr: &str) -> Result<RelayServer, BoxError> {
        let listener = TcpListener::bind(addr)?;
        info!("relay listening on {}", listener.local_addr()?);
        Ok(RelayServer {
            listener: listener,
            rooms: Arc::new(Mutex::new(RelayRooms::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BoxError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn rooms(&self) -> Arc<Mutex<RelayRooms>> {
        self.rooms.clone()
    }

    /// Accept connections forever, one thread each
    pub fn run(self) -> Result<(), BoxError> {
        let mut next_id = 0;
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    next_id += 1;
                    let id = next_id;
                    let rooms = self.rooms.clone();
                    let _handle = thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, id, rooms) {
                            warn!("connection {} ended: {}", id, e);
                        }
                    });
                }
                Err(e) => error!("accept failed: {}", e),
            }
        }
        Ok(())
    }

    /// run the accept loop on its own thread
    pub fn spawn(self) -> JoinHandle<()> {
        thread::spawn(move || {
            if let Err(e) = self.run() {
                error!("relay server stopped: {}", e);
            }
        })
    }
}

fn serve_connection(
    stream: TcpStream,
    id: usize,
    rooms: Arc<Mutex<RelayRooms>>,
) -> Result<(), BoxError> {
    let peer = stream.peer_addr()?;
    let mut sock = tungstenite::accept(stream).map_err(|e| format!("handshake failed: {}", e))?;
    sock.get_ref().set_read_timeout(Some(READ_POLL))?;
    info!("connection {} from {}", id, peer);

    let (tx, rx) = mpsc::channel();
    with_rooms(&rooms, |r| r.connect(id, tx))?;
    let res = pump(&mut sock, id, &rooms, &rx);
    with_rooms(&rooms, |r| r.disconnect(id))?;
    info!("connection {} from {} closed", id, peer);
    res
}

fn pump(
    sock: &mut WebSocket<TcpStream>,
    id: usize,
    rooms: &Arc<Mutex<RelayRooms>>,
    outbox: &Receiver<String>,
) -> Result<(), BoxError> {
    loop {
        match sock.read_message() {
            Ok(Message::Text(text)) => {
                let res = with_rooms(rooms, |r| r.handle_text(id, &text))?;
                if let Err(e) = res {
                    debug!("connection {} sent a bad frame: {}", id, e);
                }
            }
            Ok(Message::Close(_)) => return Ok(()),
            Ok(_) => (),
            Err(tungstenite::Error::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        while let Ok(text) = outbox.try_recv() {
            sock.write_message(Message::Text(text))?;
        }
    }
}

fn with_rooms<T>(
    rooms: &Arc<Mutex<RelayRooms>>,
    f: impl FnOnce(&mut RelayRooms) -> T,
) -> Result<T, BoxError> {
    let mut guard = rooms.lock().map_err(|_| "relay rooms lock poisoned")?;
    Ok(f(&mut *guard))
}
