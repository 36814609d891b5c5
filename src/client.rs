//! # Peer Connections
//!
//! One [`Client`] per remote peer: the TCP connection, the four-flag
//! choke/interest state, the peer's bitfield, and the one-shot signal that
//! fires the first time the peer unchokes us.
//!
//! ## Connection states
//!
//! Per the wire protocol, both sides start choked and uninterested:
//!
//! - `am_choking` / `am_interested` — our flags towards the peer
//! - `peer_choking` / `peer_interested` — the peer's flags towards us
//!
//! While `peer_choking` is set we must not issue requests; outstanding
//! requests are implicitly cancelled by a `choke` but the piece itself is
//! not failed, the assembler just waits for the blocks to be requested
//! again.
//!
//! ## Sharing
//!
//! The read loop owns a cloned stream handle and blocks on it without any
//! lock. All sends (requests, `interested`, `have` broadcasts) go through
//! one writer mutex so frames from different threads never interleave.

use crate::handshake::{self, Handshake};
use crate::message::Message;
use crate::peer::Peer;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};

use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
// Read/write timeout on the established connection
const SOCKET_TIMEOUT: Duration = Duration::from_secs(120);

/// Choke and interest flags for one session, ours and theirs.
struct Flags {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

/// A packed piece-availability bit array, one bit per piece, where the
/// high bit of byte 0 is piece 0.
#[derive(Debug, Default)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: u32,
}

impl Bitfield {
    /// Wrap a received `bitfield` payload.
    ///
    /// The payload must be exactly `ceil(num_pieces / 8)` bytes and the
    /// trailing bits past the last piece must be zero; anything else is a
    /// protocol violation.
    pub fn from_payload(bytes: Vec<u8>, num_pieces: u32) -> Result<Bitfield> {
        if bytes.len() != num_pieces.div_ceil(8) as usize {
            return Err(anyhow!("bitfield length does not match piece count"));
        }
        for index in num_pieces..(bytes.len() as u32 * 8) {
            if bytes[(index / 8) as usize] >> (7 - index % 8) & 1 != 0 {
                return Err(anyhow!("bitfield has trailing bits set"));
            }
        }
        Ok(Bitfield { bytes, num_pieces })
    }

    /// An all-zero bitfield, for peers that never send one.
    pub fn empty(num_pieces: u32) -> Bitfield {
        Bitfield {
            bytes: vec![0; num_pieces.div_ceil(8) as usize],
            num_pieces,
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        self.bytes[(index / 8) as usize] >> (7 - index % 8) & 1 != 0
    }

    pub fn set_piece(&mut self, index: u32) {
        if index < self.num_pieces {
            self.bytes[(index / 8) as usize] |= 1 << (7 - index % 8);
        }
    }
}

/// An established session with one remote peer.
pub struct Client {
    addr: Peer,
    /// The peer's 20-byte identifier from its handshake
    peer_id: [u8; 20],
    writer: Mutex<TcpStream>,
    flags: Mutex<Flags>,
    bitfield: Mutex<Bitfield>,
    closed: AtomicBool,
    unchoke_tx: Sender<()>,
    unchoke_rx: Receiver<()>,
}

impl Client {
    /// Connect to a peer and perform the handshake.
    ///
    /// Returns the session handle plus a second stream handle dedicated to
    /// the read loop.
    pub fn connect(addr: Peer, info_hash: [u8; 20], our_id: [u8; 20]) -> Result<(Client, TcpStream)> {
        let mut stream = TcpStream::connect_timeout(&addr.socket_addr(), CONNECT_TIMEOUT)
            .with_context(|| format!("could not connect to peer {}", addr))?;
        stream.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;

        let ours = Handshake::new(info_hash, our_id);
        let theirs = handshake::exchange(&mut stream, &ours)
            .with_context(|| format!("handshake with peer {} failed", addr))?;

        info!("connected to peer {}", addr);

        let reader = stream.try_clone()?;
        let (unchoke_tx, unchoke_rx) = bounded(1);
        let client = Client {
            addr,
            peer_id: theirs.peer_id,
            writer: Mutex::new(stream),
            flags: Mutex::new(Flags {
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
            }),
            bitfield: Mutex::new(Bitfield::default()),
            closed: AtomicBool::new(false),
            unchoke_tx,
            unchoke_rx,
        };
        Ok((client, reader))
    }

    pub fn addr(&self) -> Peer {
        self.addr
    }

    #[allow(dead_code)]
    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Serialize and send one message under the writer lock.
    pub fn send(&self, message: &Message) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        writer
            .write_all(&message.serialize())
            .with_context(|| format!("could not send message to peer {}", self.addr))
    }

    /// Send `interested` and record it.
    pub fn send_interested(&self) -> Result<()> {
        self.send(&Message::new(crate::message::MESSAGE_INTERESTED))?;
        self.flags.lock().unwrap().am_interested = true;
        Ok(())
    }

    pub fn peer_choking(&self) -> bool {
        self.flags.lock().unwrap().peer_choking
    }

    /// Record a `choke`: outstanding requests are implicitly cancelled.
    pub fn on_choke(&self) {
        self.flags.lock().unwrap().peer_choking = true;
    }

    /// Record an `unchoke` and raise the one-shot signal.
    pub fn on_unchoke(&self) {
        self.flags.lock().unwrap().peer_choking = false;
        // A full channel means the signal was already raised and nobody
        // consumed it yet; either way the waiter gets through.
        let _ = self.unchoke_tx.try_send(());
    }

    pub fn set_peer_interested(&self, interested: bool) {
        self.flags.lock().unwrap().peer_interested = interested;
    }

    #[allow(dead_code)]
    pub fn am_choking(&self) -> bool {
        self.flags.lock().unwrap().am_choking
    }

    /// Block until the peer unchokes us for the first time.
    pub fn wait_unchoke(&self, timeout: Duration) -> bool {
        self.unchoke_rx.recv_timeout(timeout).is_ok()
    }

    /// Install the peer's announced bitfield.
    pub fn set_bitfield(&self, bitfield: Bitfield) {
        *self.bitfield.lock().unwrap() = bitfield;
    }

    /// Record a `have` for one piece.
    pub fn record_have(&self, index: u32, num_pieces: u32) {
        let mut bitfield = self.bitfield.lock().unwrap();
        if bitfield.num_pieces == 0 {
            // Peer skipped the bitfield message and advertises via have only.
            *bitfield = Bitfield::empty(num_pieces);
        }
        bitfield.set_piece(index);
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.lock().unwrap().has_piece(index)
    }

    /// Shut the socket down, exactly once. Unblocks the read loop.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let writer = self.writer.lock().unwrap();
            if let Err(e) = writer.shutdown(Shutdown::Both) {
                debug!("shutdown of peer {} socket: {}", self.addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfield_bit_order() {
        let bitfield = Bitfield::from_payload(vec![0b1000_0000, 0b0100_0000], 10).unwrap();
        assert!(bitfield.has_piece(0));
        for index in 1..9 {
            assert!(!bitfield.has_piece(index), "piece {} should be absent", index);
        }
        assert!(bitfield.has_piece(9));
        // Out of range is never present.
        assert!(!bitfield.has_piece(10));
        assert!(!bitfield.has_piece(1000));
    }

    #[test]
    fn bitfield_rejects_wrong_length() {
        assert!(Bitfield::from_payload(vec![0xff], 10).is_err());
        assert!(Bitfield::from_payload(vec![0, 0, 0], 10).is_err());
    }

    #[test]
    fn bitfield_rejects_trailing_bits() {
        // Piece 10 does not exist in a 10-piece torrent.
        assert!(Bitfield::from_payload(vec![0, 0b0010_0000], 10).is_err());
        // All 16 bits valid for a 16-piece torrent.
        assert!(Bitfield::from_payload(vec![0xff, 0xff], 16).is_ok());
    }

    #[test]
    fn bitfield_set_piece() {
        let mut bitfield = Bitfield::empty(12);
        bitfield.set_piece(0);
        bitfield.set_piece(11);
        // Out of range: ignored.
        bitfield.set_piece(12);
        assert!(bitfield.has_piece(0));
        assert!(bitfield.has_piece(11));
        assert_eq!(bitfield.bytes, vec![0b1000_0000, 0b0001_0000]);
    }
}
