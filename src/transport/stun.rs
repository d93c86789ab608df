//! Just enough STUN to learn the address the outside world sees.
//!
//! A binding request goes to each configured server in turn from the media socket
//! itself, the first XOR-MAPPED-ADDRESS (or plain MAPPED-ADDRESS) that comes back is the
//! server reflexive address the udp transport offers as a second candidate.
use byteorder::{ByteOrder, NetworkEndian};
use log::{debug, info, warn};
use simple_error::bail;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    time::{Duration, Instant},
};

use crate::common::box_error::BoxError;

pub const STUN_HEADER_SIZE: usize = 20;
pub const STUN_DEFAULT_PORT: u16 = 3478;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// 20 byte binding request with no attributes
pub fn binding_request(txid: &[u8; 12]) -> [u8; STUN_HEADER_SIZE] {
    let mut req = [0u8; STUN_HEADER_SIZE];
    NetworkEndian::write_u16(&mut req[0..2], BINDING_REQUEST);
    NetworkEndian::write_u16(&mut req[2..4], 0);
    NetworkEndian::write_u32(&mut req[4..8], MAGIC_COOKIE);
    req[8..20].copy_from_slice(txid);
    req
}

/// What a server sends back: a binding success with one XOR-MAPPED-ADDRESS
pub fn binding_success(txid: &[u8; 12], mapped: SocketAddr) -> Vec<u8> {
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let (family, mut octets) = match mapped.ip() {
        IpAddr::V4(ip) => (0x01u8, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x02u8, ip.octets().to_vec()),
    };
    for (i, o) in octets.iter_mut().enumerate() {
        *o ^= if i < 4 { cookie[i] } else { txid[i - 4] };
    }
    let value_len = 4 + octets.len();
    let mut msg = vec![0u8; STUN_HEADER_SIZE + 4 + value_len];
    NetworkEndian::write_u16(&mut msg[0..2], BINDING_SUCCESS);
    NetworkEndian::write_u16(&mut msg[2..4], (4 + value_len) as u16);
    NetworkEndian::write_u32(&mut msg[4..8], MAGIC_COOKIE);
    msg[8..20].copy_from_slice(txid);
    NetworkEndian::write_u16(&mut msg[20..22], XOR_MAPPED_ADDRESS);
    NetworkEndian::write_u16(&mut msg[22..24], value_len as u16);
    msg[25] = family;
    NetworkEndian::write_u16(&mut msg[26..28], mapped.port() ^ (MAGIC_COOKIE >> 16) as u16);
    msg[28..].copy_from_slice(&octets);
    msg
}

/// The mapped address out of a binding success response for `txid`
pub fn parse_binding_response(msg: &[u8], txid: &[u8; 12]) -> Result<SocketAddr, BoxError> {
    if msg.len() < STUN_HEADER_SIZE {
        bail!("stun response too short");
    }
    if NetworkEndian::read_u16(&msg[0..2]) != BINDING_SUCCESS {
        bail!("not a binding success");
    }
    if NetworkEndian::read_u32(&msg[4..8]) != MAGIC_COOKIE {
        bail!("bad magic cookie");
    }
    if &msg[8..20] != txid {
        bail!("stun transaction mismatch");
    }

    let limit = (STUN_HEADER_SIZE + NetworkEndian::read_u16(&msg[2..4]) as usize).min(msg.len());
    let mut offset = STUN_HEADER_SIZE;
    while offset + 4 <= limit {
        let attr = NetworkEndian::read_u16(&msg[offset..offset + 2]);
        let len = NetworkEndian::read_u16(&msg[offset + 2..offset + 4]) as usize;
        offset += 4;
        if offset + len > limit {
            break;
        }
        let value = &msg[offset..offset + len];
        let found = match attr {
            XOR_MAPPED_ADDRESS => address_value(value, txid, true).ok(),
            MAPPED_ADDRESS => address_value(value, txid, false).ok(),
            _ => None,
        };
        if let Some(addr) = found {
            return Ok(addr);
        }
        // attributes are padded to 4 bytes
        offset += (len + 3) & !3;
    }
    bail!("no mapped address in stun response")
}

fn address_value(value: &[u8], txid: &[u8; 12], xor: bool) -> Result<SocketAddr, BoxError> {
    if value.len() < 8 {
        bail!("stun address too short");
    }
    let cookie = MAGIC_COOKIE.to_be_bytes();
    let mut port = NetworkEndian::read_u16(&value[2..4]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }
    match value[1] {
        0x01 => {
            let mut octets = [value[4], value[5], value[6], value[7]];
            if xor {
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 => {
            if value.len() < 20 {
                bail!("stun ipv6 address too short");
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if xor {
                for i in 0..4 {
                    octets[i] ^= cookie[i];
                }
                for i in 0..12 {
                    octets[4 + i] ^= txid[i];
                }
            }
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        family => {
            bail!("unknown stun address family {}", family)
        }
    }
}

/// `stun:host:port` (or `host`, or `stun:host`) to an address
pub fn server_addr(url: &str) -> Result<SocketAddr, BoxError> {
    let host = url.trim();
    let host = host.strip_prefix("stun:").unwrap_or(host);
    if host.is_empty() {
        bail!("empty stun server");
    }
    let with_port = match host.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => String::from(host),
        _ => format!("{}:{}", host, STUN_DEFAULT_PORT),
    };
    match with_port.to_socket_addrs()?.find(|a| a.is_ipv4()) {
        Some(addr) => Ok(addr),
        None => {
            bail!("no ipv4 address for stun server {}", url)
        }
    }
}

/// Ask one server what our address looks like from outside
pub fn query(sock: &UdpSocket, server: SocketAddr, timeout: Duration) -> Result<SocketAddr, BoxError> {
    let txid: [u8; 12] = rand::random();
    sock.send_to(&binding_request(&txid), server)?;

    let old_timeout = sock.read_timeout()?;
    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; 512];
    let res = loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            break Err(BoxError::from(format!("no answer from {}", server)));
        }
        sock.set_read_timeout(Some(left))?;
        match sock.recv_from(&mut buf) {
            // anything else showing up on the socket is not ours to judge yet
            Ok((amt, from)) if from == server => match parse_binding_response(&buf[..amt], &txid) {
                Ok(addr) => break Ok(addr),
                Err(e) => debug!("ignoring reply from {}: {}", from, e),
            },
            Ok((_, from)) => debug!("ignoring datagram from {} during stun", from),
            Err(e) => break Err(e.into()),
        }
    };
    sock.set_read_timeout(old_timeout)?;
    res
}

/// Try the servers in order, the first mapped address wins
pub fn discover(sock: &UdpSocket, servers: &[String], timeout: Duration) -> Option<SocketAddr> {
    for url in servers {
        let server = match server_addr(url) {
            Ok(s) => s,
            Err(e) => {
                warn!("skipping stun server {}: {}", url, e);
                continue;
            }
        };
        match query(sock, server, timeout) {
            Ok(mapped) => {
                info!("stun server {} sees us at {}", url, mapped);
                return Some(mapped);
            }
            Err(e) => warn!("stun server {} failed: {}", url, e),
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod test_stun {
    use super::*;
    use std::thread;

    const TXID: [u8; 12] = [
        0xb7, 0xe7, 0xa7, 0x01, 0xbc, 0x34, 0xd6, 0x86, 0xfa, 0x87, 0xdf, 0xae,
    ];

    /// binding success carrying one address attribute
    fn response(txid: &[u8; 12], attr: u16, value: &[u8]) -> Vec<u8> {
        let mut msg = vec![0u8; STUN_HEADER_SIZE + 4 + value.len()];
        NetworkEndian::write_u16(&mut msg[0..2], BINDING_SUCCESS);
        NetworkEndian::write_u16(&mut msg[2..4], (4 + value.len()) as u16);
        NetworkEndian::write_u32(&mut msg[4..8], MAGIC_COOKIE);
        msg[8..20].copy_from_slice(txid);
        NetworkEndian::write_u16(&mut msg[20..22], attr);
        NetworkEndian::write_u16(&mut msg[22..24], value.len() as u16);
        msg[24..].copy_from_slice(value);
        msg
    }

    /// answer one binding request, returns the server's url
    pub fn one_shot_server() -> (String, thread::JoinHandle<()>) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let url = format!("stun:{}", server.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (amt, from) = server.recv_from(&mut buf).unwrap();
            assert_eq!(amt, STUN_HEADER_SIZE);
            let mut txid = [0u8; 12];
            txid.copy_from_slice(&buf[8..20]);
            server.send_to(&binding_success(&txid, from), from).unwrap();
        });
        (url, handle)
    }

    #[test]
    fn request_header() {
        let req = binding_request(&TXID);
        assert_eq!(&req[0..8], &[0x00, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42]);
        assert_eq!(&req[8..], &TXID);
    }

    #[test]
    fn xor_mapped_address() {
        // 192.0.2.1:32853 as it appears on the wire
        let msg = response(&TXID, XOR_MAPPED_ADDRESS, &[0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]);
        let addr = parse_binding_response(&msg, &TXID).unwrap();
        assert_eq!(addr, "192.0.2.1:32853".parse().unwrap());
    }

    #[test]
    fn success_round_trips_both_families() {
        for addr in ["203.0.113.9:40000", "[2001:db8::1]:3478"] {
            let addr: SocketAddr = addr.parse().unwrap();
            assert_eq!(parse_binding_response(&binding_success(&TXID, addr), &TXID).unwrap(), addr);
        }
    }

    #[test]
    fn plain_mapped_address() {
        let msg = response(&TXID, MAPPED_ADDRESS, &[0x00, 0x01, 0x13, 0x88, 10, 0, 0, 7]);
        assert_eq!(
            parse_binding_response(&msg, &TXID).unwrap(),
            "10.0.0.7:5000".parse().unwrap()
        );
    }

    #[test]
    fn rejects_foreign_responses() {
        let msg = response(&TXID, MAPPED_ADDRESS, &[0x00, 0x01, 0x13, 0x88, 10, 0, 0, 7]);
        let mut other = TXID;
        other[0] ^= 1;
        assert!(parse_binding_response(&msg, &other).is_err());
        assert!(parse_binding_response(&msg[..12], &TXID).is_err());
        let mut request = msg.clone();
        NetworkEndian::write_u16(&mut request[0..2], BINDING_REQUEST);
        assert!(parse_binding_response(&request, &TXID).is_err());
        let unknown = response(&TXID, 0x8022, b"duet");
        assert!(parse_binding_response(&unknown, &TXID).is_err());
    }

    #[test]
    fn server_urls() {
        assert_eq!(server_addr("stun:127.0.0.1:19302").unwrap(), "127.0.0.1:19302".parse().unwrap());
        assert_eq!(server_addr("127.0.0.1").unwrap().port(), STUN_DEFAULT_PORT);
        assert!(server_addr("stun:").is_err());
    }

    #[test]
    fn discovers_through_a_local_server() {
        let (server_url, handle) = one_shot_server();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let servers = vec![String::from("stun:"), server_url];
        let mapped = discover(&sock, &servers, Duration::from_secs(2));
        assert_eq!(mapped, Some(sock.local_addr().unwrap()));
        handle.join().unwrap();
    }

    #[test]
    fn silent_server_gives_up() {
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let servers = vec![format!("stun:{}", silent.local_addr().unwrap())];
        assert_eq!(discover(&sock, &servers, Duration::from_millis(50)), None);
    }
}
