//! # On-Disk Storage
//!
//! This module owns the output file tree. The torrent's file map is an
//! ordered sequence of (path, length) entries; content bytes run through
//! the files in that order, so a piece at a given global offset may
//! straddle several files. [`Storage::write_piece`] walks the file list and
//! scatters the piece's bytes to the right positions.
//!
//! Files are created up front, parent directories included, and opened
//! without truncation so a resumed download overlays new bytes at the
//! correct offsets. Path components come from an untrusted metainfo and are
//! validated before anything touches the filesystem: absolute components,
//! `..`, empty segments and embedded separators are all rejected.

use crate::torrent::FileEntry;

use anyhow::{anyhow, Context, Result};

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct OpenFile {
    path: PathBuf,
    length: u64,
    file: File,
}

/// The opened output layout plus the writer lock that serializes all
/// positional writes across files.
pub struct Storage {
    files: Vec<OpenFile>,
    writer: Mutex<()>,
}

impl Storage {
    /// Create the root directory and open every file entry below it.
    pub fn create(root: &Path, entries: &[FileEntry]) -> Result<Storage> {
        fs::create_dir_all(root)
            .with_context(|| format!("could not create output directory {:?}", root))?;

        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = resolve_path(root, &entry.path)?;
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("could not create directory {:?}", dir))?;
            }

            // Create-if-absent without truncation: a partial file from an
            // earlier run keeps its bytes and gets overlaid.
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .with_context(|| format!("could not open output file {:?}", path))?;

            files.push(OpenFile {
                path,
                length: entry.length,
                file,
            });
        }

        Ok(Storage {
            files,
            writer: Mutex::new(()),
        })
    }

    /// Write a verified piece at its global byte offset, splitting across
    /// file boundaries as needed.
    pub fn write_piece(&self, offset: u64, data: &[u8]) -> Result<()> {
        let _guard = self.writer.lock().unwrap();

        let mut offset = offset;
        let mut remaining = data;
        for entry in &self.files {
            if remaining.is_empty() {
                break;
            }
            if offset >= entry.length {
                offset -= entry.length;
                continue;
            }

            let take = (entry.length - offset).min(remaining.len() as u64) as usize;
            let mut handle = &entry.file;
            handle
                .seek(SeekFrom::Start(offset))
                .and_then(|_| handle.write_all(&remaining[..take]))
                .with_context(|| format!("could not write to {:?}", entry.path))?;

            remaining = &remaining[take..];
            offset = 0;
        }

        if !remaining.is_empty() {
            return Err(anyhow!("piece data extends past the end of the file layout"));
        }
        Ok(())
    }
}

/// Join sanitized path components below the root.
fn resolve_path(root: &Path, components: &[String]) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for component in components {
        if component.is_empty()
            || component == "."
            || component == ".."
            || component.contains('/')
            || component.contains('\\')
            || Path::new(component).is_absolute()
        {
            return Err(anyhow!("torrent contains unsafe path component {:?}", component));
        }
        path.push(component);
    }
    Ok(path)
}
