//! # Torrent Metainfo
//!
//! This module parses a metainfo (.torrent) file into the [`Torrent`]
//! descriptor that drives the download: tracker tiers, the info-hash, the
//! per-piece SHA-1 hashes, piece geometry, and the output file map.
//!
//! ## Metainfo layout
//!
//! A metainfo file is a bencoded dictionary:
//!
//! - **announce** / **announce-list**: tracker URL, or tiers of URLs (BEP 12)
//! - **info**: the swarm-defining dictionary
//!   - **piece length**: bytes per piece (uniform except the last piece)
//!   - **pieces**: concatenated 20-byte SHA-1 hashes, one per piece
//!   - **length** (single-file) or **files** (multi-file): the file map
//!   - **name**: suggested root name
//!
//! The info-hash is SHA-1 over the verbatim `info` bytes as captured by
//! [`bencode::decode_with_info`]; see that module for why re-encoding is
//! not an option.

use crate::bencode::{self, Value};

use anyhow::{anyhow, Context, Result};
use rand::seq::SliceRandom;

use std::fs;
use std::path::Path;

// Size of a SHA-1 hash in bytes
const SHA1_HASH_SIZE: usize = 20;

/// One output file: its length and its path components below the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

/// A parsed torrent descriptor.
#[derive(Debug, Clone)]
pub struct Torrent {
    /// Tracker tiers for peer discovery (each tier is a list of URLs)
    tiers: Vec<Vec<String>>,
    /// SHA-1 of the verbatim bencoded info dictionary
    info_hash: [u8; 20],
    /// One 20-byte SHA-1 hash per piece
    piece_hashes: Vec<[u8; 20]>,
    /// Size of each piece in bytes (except possibly the last)
    piece_length: u32,
    /// Total content length: the sum of all file lengths
    total_length: u64,
    /// Suggested root name from the metainfo
    name: String,
    /// Ordered file map; a single-file torrent has one entry
    files: Vec<FileEntry>,
}

impl Torrent {
    /// Read and parse a metainfo file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Torrent> {
        let buf = fs::read(path.as_ref())
            .with_context(|| format!("could not read torrent file {:?}", path.as_ref()))?;
        Torrent::from_bytes(&buf)
    }

    /// Parse a metainfo descriptor from raw bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Torrent> {
        let (root, raw_info) =
            bencode::decode_with_info(buf).context("could not decode torrent")?;
        let raw_info = raw_info.ok_or_else(|| anyhow!("torrent has no info dictionary"))?;

        let mut tiers = announce_tiers(&root)?;
        // Shuffle within each tier as per BEP 12
        let mut rng = rand::thread_rng();
        for tier in &mut tiers {
            tier.shuffle(&mut rng);
        }

        let info = root
            .get(b"info")
            .ok_or_else(|| anyhow!("torrent has no info dictionary"))?;

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .ok_or_else(|| anyhow!("torrent has no piece length"))?;
        let piece_length =
            u32::try_from(piece_length).map_err(|_| anyhow!("invalid piece length"))?;
        if piece_length == 0 {
            return Err(anyhow!("invalid piece length"));
        }

        let piece_hashes = split_piece_hashes(
            info.get(b"pieces")
                .and_then(Value::as_bytes)
                .ok_or_else(|| anyhow!("torrent has no pieces"))?,
        )?;

        let name = match info.get(b"name").and_then(Value::as_bytes) {
            Some(name) => String::from_utf8_lossy(name).into_owned(),
            None => String::from("download"),
        };

        let files = file_entries(info, &name)?;
        let total_length = files.iter().map(|f| f.length).sum();

        let torrent = Torrent {
            tiers,
            info_hash: raw_info.hash,
            piece_hashes,
            piece_length,
            total_length,
            name,
            files,
        };
        torrent.check_geometry()?;

        Ok(torrent)
    }

    /// Total length must fall in ((n-1)*pieceLength, n*pieceLength].
    fn check_geometry(&self) -> Result<()> {
        let n = self.piece_hashes.len() as u64;
        let piece_length = self.piece_length as u64;
        if n == 0 || self.total_length > n * piece_length {
            return Err(anyhow!("torrent length does not match piece count"));
        }
        if self.total_length <= (n - 1) * piece_length {
            return Err(anyhow!("torrent length does not match piece count"));
        }
        Ok(())
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn piece_hash(&self, index: u32) -> [u8; 20] {
        self.piece_hashes[index as usize]
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Size of the given piece: `piece_length`, except for the final piece
    /// which covers only the remaining bytes.
    pub fn piece_size(&self, index: u32) -> u32 {
        let begin = index as u64 * self.piece_length as u64;
        let mut end = begin + self.piece_length as u64;
        if end > self.total_length {
            end = self.total_length;
        }
        (end - begin) as u32
    }

    /// Global byte offset of the given piece.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }
}

/// Tracker tiers: `announce-list` when present and non-empty, otherwise a
/// single tier holding `announce`.
fn announce_tiers(root: &Value) -> Result<Vec<Vec<String>>> {
    if let Some(list) = root.get(b"announce-list").and_then(Value::as_list) {
        let mut tiers = Vec::new();
        for tier in list {
            let tier = tier
                .as_list()
                .ok_or_else(|| anyhow!("announce-list tier is not a list"))?;
            let urls: Vec<String> = tier
                .iter()
                .filter_map(Value::as_bytes)
                .map(|url| String::from_utf8_lossy(url).into_owned())
                .collect();
            if !urls.is_empty() {
                tiers.push(urls);
            }
        }
        if !tiers.is_empty() {
            return Ok(tiers);
        }
    }

    if let Some(announce) = root.get(b"announce").and_then(Value::as_bytes) {
        return Ok(vec![vec![String::from_utf8_lossy(announce).into_owned()]]);
    }

    Err(anyhow!("torrent has no announce or announce-list"))
}

/// Split the concatenated `pieces` string into 20-byte hashes.
fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<[u8; 20]>> {
    if pieces.len() % SHA1_HASH_SIZE != 0 {
        return Err(anyhow!("torrent pieces length is not a multiple of 20"));
    }
    Ok(pieces
        .chunks_exact(SHA1_HASH_SIZE)
        .map(|chunk| chunk.try_into().unwrap())
        .collect())
}

/// The file map: `info.files` for a multi-file torrent, otherwise one entry
/// named after the torrent covering `info.length` bytes.
fn file_entries(info: &Value, name: &str) -> Result<Vec<FileEntry>> {
    if let Some(files) = info.get(b"files").and_then(Value::as_list) {
        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let length = file
                .get(b"length")
                .and_then(Value::as_int)
                .ok_or_else(|| anyhow!("torrent file entry has no length"))?;
            let length = u64::try_from(length).map_err(|_| anyhow!("invalid file length"))?;

            let path = file
                .get(b"path")
                .and_then(Value::as_list)
                .ok_or_else(|| anyhow!("torrent file entry has no path"))?;
            let path: Vec<String> = path
                .iter()
                .filter_map(Value::as_bytes)
                .map(|seg| String::from_utf8_lossy(seg).into_owned())
                .collect();
            if path.is_empty() {
                return Err(anyhow!("torrent file entry has an empty path"));
            }

            entries.push(FileEntry { length, path });
        }
        if entries.is_empty() {
            return Err(anyhow!("torrent has an empty files list"));
        }
        return Ok(entries);
    }

    let length = info
        .get(b"length")
        .and_then(Value::as_int)
        .ok_or_else(|| anyhow!("torrent has neither length nor files"))?;
    let length = u64::try_from(length).map_err(|_| anyhow!("invalid file length"))?;

    Ok(vec![FileEntry {
        length,
        path: vec![name.to_string()],
    }])
}
