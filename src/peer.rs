//! # Peer Addresses
//!
//! Trackers answer with a compact binary peer list: repeating 6-byte
//! records of IPv4 address and port, both big-endian.
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::fmt;
use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

// Size of one compact peer record in bytes
const PEER_SIZE: usize = 6;

/// A peer endpoint discovered through a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ip), self.port)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse a compact peer list.
///
/// # Errors
///
/// Fails if the input length is not a multiple of 6 bytes.
pub fn parse_compact_peers(buf: &[u8]) -> Result<Vec<Peer>> {
    if buf.len() % PEER_SIZE != 0 {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers = Vec::with_capacity(buf.len() / PEER_SIZE);
    for record in buf.chunks_exact(PEER_SIZE) {
        let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
        let mut cursor = Cursor::new(&record[4..]);
        let port = cursor.read_u16::<BigEndian>()?;
        peers.push(Peer { ip, port });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_two_peers() {
        let buf = b"\x7f\x00\x00\x01\x1a\xe1\xc0\xa8\x00\x01\x1a\xe2";
        let peers = parse_compact_peers(buf).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "127.0.0.1:6881");
        assert_eq!(peers[1].to_string(), "192.168.0.1:6882");
    }

    #[test]
    fn parse_empty_list() {
        assert!(parse_compact_peers(b"").unwrap().is_empty());
    }

    #[test]
    fn reject_ragged_length() {
        let buf = [0u8; 13];
        assert!(parse_compact_peers(&buf).is_err());
    }
}
