//! # BitTorrent Handshake
//!
//! The handshake is the first exchange on a fresh peer connection, a fixed
//! 68-byte frame in both directions:
//!
//! ```text
//! <pstrlen=19><"BitTorrent protocol"><reserved: 8 zero bytes><info_hash: 20><peer_id: 20>
//! ```
//!
//! It pins the protocol, proves both sides mean the same swarm (the
//! info-hash must match), and exchanges peer ids. A reply whose framing
//! bytes diverge from the literal prefix, or whose info-hash differs from
//! ours, is rejected and the connection dropped.

use anyhow::{anyhow, Result};

use std::io::{Read, Write};

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Total size of a handshake frame on the wire.
pub const HANDSHAKE_LEN: usize = 68;

/// A handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// 20-byte SHA-1 of the torrent's info dictionary
    pub info_hash: [u8; 20],
    /// 20-byte identifier of the sending peer
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize into the fixed 68-byte wire frame.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // bytes 20..28 are the reserved zeros
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parse a received frame.
    ///
    /// Rejects any buffer that is not exactly 68 bytes or whose first 20
    /// bytes differ from the expected protocol literal. Reserved bytes are
    /// not checked: peers use them to advertise extensions we ignore.
    pub fn parse(buf: &[u8]) -> Result<Handshake> {
        if buf.len() != HANDSHAKE_LEN {
            return Err(anyhow!("handshake has invalid length {}", buf.len()));
        }
        if buf[0] != PROTOCOL_ID.len() as u8 || &buf[1..20] != PROTOCOL_ID {
            return Err(anyhow!("handshake has invalid protocol identifier"));
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}

/// Perform the handshake over an established stream.
///
/// Sends our frame, reads the peer's, and verifies the returned info-hash
/// matches ours. Returns the peer's handshake on success.
pub fn exchange<S: Read + Write>(stream: &mut S, ours: &Handshake) -> Result<Handshake> {
    stream
        .write_all(&ours.serialize())
        .map_err(|_| anyhow!("could not send handshake to peer"))?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream
        .read_exact(&mut buf)
        .map_err(|_| anyhow!("could not read handshake from peer"))?;

    let theirs = Handshake::parse(&buf)?;
    if theirs.info_hash != ours.info_hash {
        return Err(anyhow!("peer answered with a different info hash"));
    }

    Ok(theirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Read side and write side stitched together as one stream.
    struct FakeStream {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let handshake = Handshake::new([0xab; 20], [0xcd; 20]);
        let buf = handshake.serialize();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(Handshake::parse(&buf).unwrap(), handshake);
    }

    #[test]
    fn reject_corrupted_prefix() {
        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[5] ^= 0x01;
        assert!(Handshake::parse(&buf).is_err());

        let mut buf = Handshake::new([1; 20], [2; 20]).serialize();
        buf[0] = 18;
        assert!(Handshake::parse(&buf).is_err());
    }

    #[test]
    fn reject_wrong_length() {
        assert!(Handshake::parse(&[0u8; 67]).is_err());
        assert!(Handshake::parse(&[0u8; 69]).is_err());
    }

    #[test]
    fn exchange_verifies_info_hash() {
        let ours = Handshake::new([7; 20], [1; 20]);

        let reply = Handshake::new([7; 20], [9; 20]);
        let mut stream = FakeStream {
            input: Cursor::new(reply.serialize().to_vec()),
            output: Vec::new(),
        };
        let theirs = exchange(&mut stream, &ours).unwrap();
        assert_eq!(theirs.peer_id, [9; 20]);
        assert_eq!(stream.output, ours.serialize());

        // Same frame but for another swarm: must be rejected.
        let reply = Handshake::new([8; 20], [9; 20]);
        let mut stream = FakeStream {
            input: Cursor::new(reply.serialize().to_vec()),
            output: Vec::new(),
        };
        assert!(exchange(&mut stream, &ours).is_err());
    }
}
