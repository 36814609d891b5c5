//! # Piece Assembly
//!
//! Blocks arrive from many peers, in any order, with duplicates. This
//! module reassembles them into pieces, verifies each completed piece
//! against its expected SHA-1, and writes verified bytes through to
//! storage.
//!
//! ## Lifecycle of a piece buffer
//!
//! A buffer is created lazily when the first block of a piece arrives. It
//! holds the piece-sized byte buffer and a bitmap with one flag per 16 KiB
//! block, both behind a single mutex so a completed-but-unverified buffer
//! never races with a duplicate arrival. On a hash match the bytes are
//! written to disk and the buffer is dropped; on a mismatch the bitmap is
//! cleared, the buffer kept, and the piece downloaded again.
//!
//! ## Error split
//!
//! Malformed blocks (bad index, range overrun) come back as
//! [`BlockOutcome::Invalid`] so the session layer can drop that one peer.
//! A `Result::Err` from [`Assembler::handle_block`] means storage failed —
//! that is fatal to the whole download, not to a peer.

use crate::storage::Storage;
use crate::torrent::Torrent;

use anyhow::Result;
use sha1::{Digest, Sha1};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Protocol-level transfer unit: 16 KiB, short tail allowed.
pub const BLOCK_SIZE: u32 = 16384;

/// What became of one delivered block.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Stored; the piece is still incomplete.
    Accepted,
    /// The block completed its piece, the hash matched, bytes are on disk.
    Completed,
    /// The block completed its piece but the hash did not match; the
    /// block bitmap was reset and the piece must be fetched again.
    Rejected,
    /// Duplicate data or a block for an already verified piece.
    Ignored,
    /// Protocol violation by the sending peer.
    Invalid,
}

/// Scratch state for one in-flight piece.
struct PieceBuffer {
    data: Vec<u8>,
    received: Vec<bool>,
}

impl PieceBuffer {
    fn new(size: u32) -> PieceBuffer {
        let blocks = size.div_ceil(BLOCK_SIZE) as usize;
        PieceBuffer {
            data: vec![0; size as usize],
            received: vec![false; blocks],
        }
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

/// Shared piece-assembly pipeline, one per download.
pub struct Assembler {
    torrent: Arc<Torrent>,
    storage: Storage,
    /// In-flight piece buffers by index
    buffers: Mutex<HashMap<u32, Arc<Mutex<PieceBuffer>>>>,
    /// One flag per piece, set after verification and write-out
    verified: Mutex<Vec<bool>>,
}

impl Assembler {
    pub fn new(torrent: Arc<Torrent>, storage: Storage) -> Assembler {
        let num_pieces = torrent.num_pieces() as usize;
        Assembler {
            torrent,
            storage,
            buffers: Mutex::new(HashMap::new()),
            verified: Mutex::new(vec![false; num_pieces]),
        }
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.verified.lock().unwrap()[index as usize]
    }

    pub fn verified_count(&self) -> u32 {
        self.verified.lock().unwrap().iter().filter(|&&v| v).count() as u32
    }

    /// Ingest one block of one piece.
    ///
    /// Copies the block into the piece buffer, marks it received, and when
    /// the piece completes verifies and persists it. See the module docs
    /// for the meaning of the outcome vs an `Err`.
    pub fn handle_block(&self, index: u32, begin: u32, block: &[u8]) -> Result<BlockOutcome> {
        if index >= self.torrent.num_pieces() {
            return Ok(BlockOutcome::Invalid);
        }
        let piece_size = self.torrent.piece_size(index);
        if block.is_empty() || begin as u64 + block.len() as u64 > piece_size as u64 {
            return Ok(BlockOutcome::Invalid);
        }
        if self.is_verified(index) {
            return Ok(BlockOutcome::Ignored);
        }

        let buffer = self.get_or_create_buffer(index, piece_size);
        let mut buffer = buffer.lock().unwrap();

        let end = begin as usize + block.len();
        buffer.data[begin as usize..end].copy_from_slice(block);

        // Mark every block the range covers; normally exactly one.
        let first = begin / BLOCK_SIZE;
        let last = (begin + block.len() as u32 - 1) / BLOCK_SIZE;
        for i in first..=last {
            buffer.received[i as usize] = true;
        }

        if !buffer.is_complete() {
            return Ok(BlockOutcome::Accepted);
        }

        let digest: [u8; 20] = Sha1::digest(&buffer.data).into();
        if digest != self.torrent.piece_hash(index) {
            warn!("piece {} failed verification, discarding its blocks", index);
            for flag in buffer.received.iter_mut() {
                *flag = false;
            }
            return Ok(BlockOutcome::Rejected);
        }

        self.storage
            .write_piece(self.torrent.piece_offset(index), &buffer.data)?;

        self.verified.lock().unwrap()[index as usize] = true;
        self.buffers.lock().unwrap().remove(&index);
        debug!("piece {} verified and written", index);

        Ok(BlockOutcome::Completed)
    }

    fn get_or_create_buffer(&self, index: u32, piece_size: u32) -> Arc<Mutex<PieceBuffer>> {
        let mut buffers = self.buffers.lock().unwrap();
        buffers
            .entry(index)
            .or_insert_with(|| Arc::new(Mutex::new(PieceBuffer::new(piece_size))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::torrent::Torrent;

    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_dir(name: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let unique = format!(
            "marmot-assembler-{}-{}-{}",
            std::process::id(),
            name,
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        std::env::temp_dir().join(unique)
    }

    // Deterministic junk content.
    fn content(len: usize) -> Vec<u8> {
        let mut state = 0x2545f491u32;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1103515245).wrapping_add(12345);
                (state >> 16) as u8
            })
            .collect()
    }

    // A torrent over `data` with 2-block pieces (32 KiB).
    fn build_fixture(data: &[u8]) -> Torrent {
        let piece_length = 2 * BLOCK_SIZE as usize;
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length) {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            pieces.extend_from_slice(&digest);
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce8:http://t4:info");
        buf.extend_from_slice(
            format!(
                "d6:lengthi{}e4:name4:blob12:piece lengthi{}e6:pieces{}:",
                data.len(),
                piece_length,
                pieces.len()
            )
            .as_bytes(),
        );
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        Torrent::from_bytes(&buf).unwrap()
    }

    fn build_assembler(data: &[u8], dir: &PathBuf) -> (Arc<Torrent>, Assembler) {
        let torrent = Arc::new(build_fixture(data));
        let storage = Storage::create(dir, torrent.files()).unwrap();
        let assembler = Assembler::new(torrent.clone(), storage);
        (torrent, assembler)
    }

    #[test]
    fn out_of_order_blocks_with_duplicates_verify() {
        let dir = scratch_dir("permuted");
        // 1.5 pieces: piece 0 has 2 blocks, piece 1 one short block.
        let data = content(2 * BLOCK_SIZE as usize + 1000);
        let (_, assembler) = build_assembler(&data, &dir);

        let b = BLOCK_SIZE as usize;
        assert_eq!(
            assembler.handle_block(0, BLOCK_SIZE, &data[b..2 * b]).unwrap(),
            BlockOutcome::Accepted
        );
        // Same block again: absorbed, still incomplete from the bitmap's
        // point of view only for the missing first block.
        assert_eq!(
            assembler.handle_block(0, BLOCK_SIZE, &data[b..2 * b]).unwrap(),
            BlockOutcome::Accepted
        );
        assert_eq!(
            assembler.handle_block(0, 0, &data[..b]).unwrap(),
            BlockOutcome::Completed
        );
        assert_eq!(
            assembler.handle_block(1, 0, &data[2 * b..]).unwrap(),
            BlockOutcome::Completed
        );

        assert_eq!(assembler.verified_count(), 2);
        assert_eq!(fs::read(dir.join("blob")).unwrap(), data);

        // Late duplicate for a finished piece.
        assert_eq!(
            assembler.handle_block(1, 0, &data[2 * b..]).unwrap(),
            BlockOutcome::Ignored
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_block_resets_then_recovers() {
        let dir = scratch_dir("corrupt");
        let data = content(2 * BLOCK_SIZE as usize);
        let (_, assembler) = build_assembler(&data, &dir);

        let b = BLOCK_SIZE as usize;
        let mut bad = data[..b].to_vec();
        bad[100] ^= 0xff;

        assert_eq!(
            assembler.handle_block(0, 0, &bad).unwrap(),
            BlockOutcome::Accepted
        );
        assert_eq!(
            assembler.handle_block(0, BLOCK_SIZE, &data[b..]).unwrap(),
            BlockOutcome::Rejected
        );
        assert_eq!(assembler.verified_count(), 0);

        // Correct redelivery of every block succeeds.
        assert_eq!(
            assembler.handle_block(0, 0, &data[..b]).unwrap(),
            BlockOutcome::Accepted
        );
        assert_eq!(
            assembler.handle_block(0, BLOCK_SIZE, &data[b..]).unwrap(),
            BlockOutcome::Completed
        );
        assert_eq!(fs::read(dir.join("blob")).unwrap(), data);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_malformed_blocks() {
        let dir = scratch_dir("malformed");
        let data = content(BLOCK_SIZE as usize);
        let (_, assembler) = build_assembler(&data, &dir);

        // Index past the end of the torrent.
        assert_eq!(
            assembler.handle_block(9, 0, &data).unwrap(),
            BlockOutcome::Invalid
        );
        // Range overruns the piece.
        assert_eq!(
            assembler.handle_block(0, 10, &data).unwrap(),
            BlockOutcome::Invalid
        );
        // Empty block.
        assert_eq!(
            assembler.handle_block(0, 0, &[]).unwrap(),
            BlockOutcome::Invalid
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
