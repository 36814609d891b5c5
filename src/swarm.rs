//! # Swarm Coordination
//!
//! One download, many peers. This module owns the peer roster and drives
//! every session:
//!
//! - **Connector**: one thread per peer establishes the connection and
//!   handshake, registers the session, sends `interested`, and gives the
//!   peer a bounded window to unchoke us before it is dropped.
//! - **Read loop**: one thread per peer blocks on the socket and dispatches
//!   messages; `piece` payloads are routed to the shared [`Assembler`].
//! - **Request pump**: spawned on every `unchoke`, requests each block of
//!   each piece the peer advertises that is not yet verified. Deliberately
//!   naive: with several peers this duplicates requests, and the assembler
//!   absorbs the duplicate arrivals.
//!
//! Peer-local failures (socket errors, protocol violations) remove that
//! peer and leave the rest of the swarm alone. Storage failures are fatal
//! and abort the download.
//!
//! The coordinating thread owns the progress bar and counts verified
//! pieces; the download is complete when every piece is verified.

use crate::assembler::{Assembler, BlockOutcome, BLOCK_SIZE};
use crate::client::{Bitfield, Client};
use crate::message::{
    Message, MESSAGE_BITFIELD, MESSAGE_CANCEL, MESSAGE_CHOKE, MESSAGE_HAVE, MESSAGE_INTERESTED,
    MESSAGE_NOT_INTERESTED, MESSAGE_PIECE, MESSAGE_REQUEST, MESSAGE_UNCHOKE,
};
use crate::peer::Peer;
use crate::torrent::Torrent;

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Sender};
use indicatif::{ProgressBar, ProgressStyle};

use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

// How long a fresh session may stay choked before we give up on the peer
const UNCHOKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What peer threads report back to the coordinator.
enum Event {
    Verified { index: u32 },
    Fatal(anyhow::Error),
}

/// The peer roster and everything shared across sessions.
pub struct Swarm {
    torrent: Arc<Torrent>,
    assembler: Arc<Assembler>,
    our_id: [u8; 20],
    roster: Mutex<Vec<Arc<Client>>>,
}

impl Swarm {
    pub fn new(torrent: Arc<Torrent>, assembler: Arc<Assembler>, our_id: [u8; 20]) -> Arc<Swarm> {
        Arc::new(Swarm {
            torrent,
            assembler,
            our_id,
            roster: Mutex::new(Vec::new()),
        })
    }

    /// Run the download against the given peers, blocking until every
    /// piece is verified and written or the swarm can make no progress.
    pub fn download(self: &Arc<Self>, peers: &[Peer]) -> Result<()> {
        let (event_tx, event_rx) = unbounded();

        for &addr in peers {
            let swarm = Arc::clone(self);
            let events = event_tx.clone();
            thread::spawn(move || swarm.run_peer(addr, events));
        }
        // The coordinator keeps no sender: when every peer thread is gone
        // the channel closes and the stall is detected below.
        drop(event_tx);

        let bar = ProgressBar::new(self.torrent.total_length());
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}%")
                .unwrap()
                .progress_chars("#>-"),
        );

        let mut verified = self.assembler.verified_count();
        while verified < self.torrent.num_pieces() {
            let event = event_rx
                .recv()
                .map_err(|_| anyhow!("download stalled: all peer connections closed"))?;
            match event {
                Event::Verified { index } => {
                    verified += 1;
                    bar.inc(self.torrent.piece_size(index) as u64);
                }
                Event::Fatal(e) => {
                    self.close_all();
                    return Err(e);
                }
            }
        }

        bar.finish();
        self.close_all();
        Ok(())
    }

    /// Connector: establish the session, then hold the peer to the
    /// first-unchoke deadline.
    fn run_peer(self: Arc<Self>, addr: Peer, events: Sender<Event>) {
        let (client, reader) = match Client::connect(addr, self.torrent.info_hash(), self.our_id) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("{:#}", e);
                return;
            }
        };

        let client = Arc::new(client);
        self.roster.lock().unwrap().push(Arc::clone(&client));

        {
            let swarm = Arc::clone(&self);
            let client = Arc::clone(&client);
            thread::spawn(move || swarm.read_loop(client, reader, events));
        }

        if client.send_interested().is_err() {
            self.remove(&client);
            return;
        }

        if !client.wait_unchoke(UNCHOKE_TIMEOUT) {
            warn!("peer {} never unchoked us, dropping", addr);
            self.remove(&client);
        }
    }

    /// Per-peer message loop. Exits on socket error or protocol violation,
    /// removing the peer either way.
    fn read_loop(self: Arc<Self>, client: Arc<Client>, mut reader: TcpStream, events: Sender<Event>) {
        let addr = client.addr();
        let num_pieces = self.torrent.num_pieces();

        loop {
            let message = match Message::read(&mut reader) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!("keep-alive from peer {}", addr);
                    continue;
                }
                Err(e) => {
                    debug!("peer {}: {:#}", addr, e);
                    break;
                }
            };

            match message.id {
                MESSAGE_CHOKE => {
                    debug!("peer {} choked us", addr);
                    client.on_choke();
                }
                MESSAGE_UNCHOKE => {
                    debug!("peer {} unchoked us", addr);
                    client.on_unchoke();
                    let swarm = Arc::clone(&self);
                    let client = Arc::clone(&client);
                    thread::spawn(move || swarm.request_pieces(client));
                }
                MESSAGE_INTERESTED => client.set_peer_interested(true),
                MESSAGE_NOT_INTERESTED => client.set_peer_interested(false),
                MESSAGE_HAVE => match message.parse_have() {
                    Ok(index) if index < num_pieces => client.record_have(index, num_pieces),
                    _ => {
                        warn!("peer {} sent an invalid have, dropping", addr);
                        break;
                    }
                },
                MESSAGE_BITFIELD => match Bitfield::from_payload(message.payload, num_pieces) {
                    Ok(bitfield) => client.set_bitfield(bitfield),
                    Err(e) => {
                        warn!("peer {} sent an invalid bitfield, dropping: {:#}", addr, e);
                        break;
                    }
                },
                MESSAGE_PIECE => {
                    let (index, outcome) = match message.parse_piece() {
                        Ok(block) => {
                            trace!(
                                "block {}..{} of piece {} from peer {}",
                                block.begin,
                                block.begin as usize + block.block.len(),
                                block.index,
                                addr
                            );
                            let outcome =
                                self.assembler
                                    .handle_block(block.index, block.begin, block.block);
                            (block.index, outcome)
                        }
                        Err(e) => {
                            warn!("peer {} sent a malformed piece message, dropping: {:#}", addr, e);
                            break;
                        }
                    };

                    match outcome {
                        Ok(BlockOutcome::Completed) => {
                            self.broadcast_have(index);
                            if events.send(Event::Verified { index }).is_err() {
                                // Coordinator is gone; nothing left to do.
                                break;
                            }
                        }
                        Ok(BlockOutcome::Rejected) => {
                            // The failed piece came (at least partly) from
                            // this peer: have it resend the whole piece.
                            if !client.peer_choking()
                                && self.request_piece(&client, index).is_err()
                            {
                                break;
                            }
                        }
                        Ok(BlockOutcome::Invalid) => {
                            warn!("peer {} sent an invalid block, dropping", addr);
                            break;
                        }
                        Ok(BlockOutcome::Accepted) | Ok(BlockOutcome::Ignored) => {}
                        Err(e) => {
                            error!("could not persist piece {}: {:#}", index, e);
                            let _ = events.send(Event::Fatal(e));
                            break;
                        }
                    }
                }
                MESSAGE_REQUEST | MESSAGE_CANCEL => {
                    // Download-only client: we never serve blocks.
                    debug!("ignoring upload request from peer {}", addr);
                }
                other => debug!("unknown message id {} from peer {}", other, addr),
            }
        }

        self.remove(&client);
    }

    /// Request pump: every block of every advertised, still-wanted piece.
    fn request_pieces(&self, client: Arc<Client>) {
        for index in 0..self.torrent.num_pieces() {
            if client.peer_choking() {
                return;
            }
            if !client.has_piece(index) || self.assembler.is_verified(index) {
                continue;
            }
            if self.request_piece(&client, index).is_err() {
                return;
            }
        }
    }

    /// Request every block of one piece from one peer.
    fn request_piece(&self, client: &Client, index: u32) -> Result<()> {
        let piece_size = self.torrent.piece_size(index);
        let mut begin = 0;
        while begin < piece_size {
            let length = BLOCK_SIZE.min(piece_size - begin);
            client.send(&Message::request(index, begin, length))?;
            begin += length;
        }
        Ok(())
    }

    /// Tell every connected peer we now have a verified piece.
    fn broadcast_have(&self, index: u32) {
        let roster = self.roster.lock().unwrap();
        for peer in roster.iter() {
            if let Err(e) = peer.send(&Message::have(index)) {
                debug!("{:#}", e);
            }
        }
    }

    /// Drop a session from the roster and close its socket (exactly once;
    /// closing also unblocks the session's read loop).
    fn remove(&self, client: &Arc<Client>) {
        let mut roster = self.roster.lock().unwrap();
        if let Some(position) = roster.iter().position(|c| Arc::ptr_eq(c, client)) {
            roster.remove(position);
        }
        drop(roster);
        client.close();
    }

    fn close_all(&self) {
        let peers: Vec<_> = self.roster.lock().unwrap().drain(..).collect();
        for peer in peers {
            peer.close();
        }
    }
}
