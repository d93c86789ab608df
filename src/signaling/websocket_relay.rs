//! Websocket connection to the duet relay server.
//!
//! The relay understands two control frames, `{"event":"join","sessionId":..}` and
//! `{"event":"leave","sessionId":..}`.  Every other text frame is forwarded to the rest of
//! the session's room.
use log::{debug, info, warn};
use serde_json::json;
use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};
use tungstenite::{
    client,
    error::{Error, UrlError},
    http::Uri,
    stream::{Mode, NoDelay},
    Message, WebSocket,
};
use url::Url;

use crate::common::box_error::BoxError;
use crate::signaling::relay::Relay;

// short so the event loop is never held up waiting on the socket
const READ_POLL: Duration = Duration::from_millis(5);

pub struct WebSocketRelay {
    url: String,
    sock: Option<WebSocket<TcpStream>>,
}

impl WebSocketRelay {
    pub fn new(url: &str) -> WebSocketRelay {
        WebSocketRelay {
            url: String::from(url),
            sock: None,
        }
    }

    fn make_stream(url: &Url) -> Result<TcpStream, BoxError> {
        let request = client::IntoClientRequest::into_client_request(url.clone())?;
        let uri = request.uri();
        let mode = client::uri_mode(uri)?;
        if matches!(mode, Mode::Tls) {
            return Err(format!("tls relays are not supported: {}", uri).into());
        }
        let host = uri.host().ok_or(Error::Url(UrlError::NoHostName))?;
        let port = uri.port_u16().unwrap_or(80);
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        let mut stream = Self::connect_to_some(&addrs, uri)?;
        NoDelay::set_nodelay(&mut stream, true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        Ok(stream)
    }

    fn connect_to_some(addrs: &[SocketAddr], uri: &Uri) -> Result<TcpStream, Error> {
        for addr in addrs {
            debug!("Trying to contact {} at {}...", uri, addr);
            if let Ok(stream) = TcpStream::connect_timeout(addr, Duration::from_secs(2)) {
                return Ok(stream);
            }
        }
        Err(Error::Url(UrlError::UnableToConnect(uri.to_string())))
    }

    fn write(&mut self, text: String) -> Result<(), BoxError> {
        match self.sock.as_mut() {
            Some(sock) => {
                if let Err(e) = sock.write_message(Message::Text(text)) {
                    self.sock = None;
                    return Err(e.into());
                }
                Ok(())
            }
            None => Err("relay not connected".into()),
        }
    }
}

impl Relay for WebSocketRelay {
    fn connect(&mut self) -> Result<(), BoxError> {
        self.disconnect();
        let url = Url::parse(&self.url)?;
        let stream = Self::make_stream(&url)?;
        let (sock, _resp) = client::client(url, stream)
            .map_err(|e| format!("websocket handshake with {} failed: {}", self.url, e))?;
        info!("connected to relay {}", self.url);
        self.sock = Some(sock);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.sock.is_some()
    }

    fn join(&mut self, session_id: &str) -> Result<(), BoxError> {
        self.write(json!({ "event": "join", "sessionId": session_id }).to_string())
    }

    fn leave(&mut self, session_id: &str) -> Result<(), BoxError> {
        self.write(json!({ "event": "leave", "sessionId": session_id }).to_string())
    }

    fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.write(String::from(text))
    }

    fn recv_text(&mut self) -> Result<Option<String>, BoxError> {
        let sock = match self.sock.as_mut() {
            Some(s) => s,
            None => return Err("relay not connected".into()),
        };
        match sock.read_message() {
            Ok(Message::Text(text)) => Ok(Some(text)),
            Ok(Message::Close(_)) => {
                warn!("relay closed the connection");
                self.sock = None;
                Err("relay closed the connection".into())
            }
            // pings are answered by tungstenite, binary frames are not ours
            Ok(_) => Ok(None),
            Err(Error::Io(ioerr))
                if ioerr.kind() == std::io::ErrorKind::WouldBlock
                    || ioerr.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => {
                self.sock = None;
                Err(e.into())
            }
        }
    }

    fn disconnect(&mut self) {
        if let Some(mut sock) = self.sock.take() {
            let _res = sock.close(None);
            let _res = sock.write_pending();
        }
    }
}
