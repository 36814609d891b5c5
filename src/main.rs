//! # Marmot BitTorrent Client
//!
//! A command-line BitTorrent download client written in Rust.
//!
//! ## Features
//!
//! - Core BitTorrent peer wire protocol
//! - Multitracker metainfo support (BEP 12)
//! - Multi-peer concurrent downloading
//! - Piece verification with SHA-1 hashing
//! - Multi-file torrents written straight to their on-disk layout
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! marmot <torrent_file>
//! marmot <torrent_file> -o <output_dir>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, announces to
//!   the trackers, then watches download progress
//! - **Peer threads**: one connector and one read loop per peer, plus a
//!   short-lived request pump per unchoke
//! - **Shared assembler**: reassembles blocks into pieces, verifies them,
//!   and scatters verified bytes across the output files

#[macro_use]
extern crate log;

mod assembler;
mod bencode;
mod client;
mod handshake;
mod message;
mod peer;
mod storage;
mod swarm;
mod torrent;
mod tracker;

use crate::assembler::Assembler;
use crate::storage::Storage;
use crate::swarm::Swarm;
use crate::torrent::Torrent;

use anyhow::Result;
use clap::Parser;
use rand::Rng;

use std::path::PathBuf;
use std::sync::Arc;

// Client tag leading our peer id, followed by 12 random bytes
const PEER_ID_PREFIX: &[u8; 8] = b"-MM0001-";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent download client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Output directory (created if absent)
    #[arg(short = 'o', long, default_value = ".")]
    output: PathBuf,

    /// Port reported to the tracker
    #[arg(short = 'p', long, default_value_t = 6881)]
    port: u16,
}

/// Our 20-byte peer id: client tag plus random tail.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[PEER_ID_PREFIX.len()..]);
    peer_id
}

fn run(args: Args) -> Result<()> {
    let torrent = Torrent::open(&args.torrent)?;
    let peer_id = generate_peer_id();

    println!(
        "Downloading {:?} ({} pieces)",
        torrent.name(),
        torrent.num_pieces()
    );

    let peers = tracker::request_peers(&torrent, &peer_id, args.port)?;
    info!("trackers returned {} peers", peers.len());

    let torrent = Arc::new(torrent);
    let storage = Storage::create(&args.output, torrent.files())?;
    let assembler = Arc::new(Assembler::new(Arc::clone(&torrent), storage));

    let swarm = Swarm::new(Arc::clone(&torrent), assembler, peer_id);
    swarm.download(&peers)?;

    tracker::announce_completed(&torrent, &peer_id, args.port);
    println!("Saved in {:?}.", args.output);

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {:#}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_tag_and_length() {
        let peer_id = generate_peer_id();
        assert_eq!(peer_id.len(), 20);
        assert_eq!(&peer_id[..8], b"-MM0001-");
    }
}
