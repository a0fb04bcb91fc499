//! Segment file naming and lifecycle.
//!
//! A bytestream is a directory; each segment inside it is a file named with
//! the 16-hex-digit stream offset at which the segment begins. The logical
//! stream is the concatenation of segments in ascending name order.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::protocol::Mode;
use crate::{Error, Result};

/// Segment filenames are exactly this many lowercase hex digits.
pub const FILENAME_LEN: usize = 16;

pub fn segment_filename(offset: u64) -> String {
    format!("{offset:016x}")
}

pub fn segment_path(root: &Path, offset: u64) -> PathBuf {
    root.join(segment_filename(offset))
}

/// Parse a directory entry name as a segment base offset.
///
/// Returns `None` for anything that is not exactly 16 lowercase hex digits,
/// so unrelated files in a stream directory are ignored.
pub fn parse_segment_filename(name: &str) -> Option<u64> {
    if name.len() != FILENAME_LEN {
        return None;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return None;
    }
    u64::from_str_radix(name, 16).ok()
}

/// Scan a stream directory, returning `(offset, size)` per segment in
/// ascending offset order.
///
/// A missing directory is created (mode `rwxrwxrwx`) when the caller is the
/// writer; readers get `InvalidRequest`, and a failed mkdir is
/// `AccessDenied`.
pub fn scan_stream_dir(root: &Path, mode: Mode) -> Result<Vec<(u64, u64)>> {
    if !root.is_dir() {
        if mode != Mode::Writer {
            log::warn!("stream {} does not exist", root.display());
            return Err(Error::InvalidRequest);
        }
        if let Err(err) = std::fs::create_dir_all(root) {
            log::warn!("failed creating stream dir {}: {err}", root.display());
            return Err(Error::AccessDenied);
        }
        let perms = std::fs::Permissions::from_mode(0o777);
        std::fs::set_permissions(root, perms)?;
    }

    let mut segments = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = match file_name.to_str() {
            Some(name) => name,
            None => continue,
        };
        let offset = match parse_segment_filename(name) {
            Some(offset) => offset,
            None => continue,
        };
        let size = entry.metadata()?.len();
        segments.push((offset, size));
    }
    segments.sort_unstable_by_key(|&(offset, _)| offset);
    Ok(segments)
}

/// Shared read-side descriptor for a segment; all readers mmap through it.
pub fn open_reader(root: &Path, offset: u64) -> Result<File> {
    Ok(File::open(segment_path(root, offset))?)
}

/// Writer-side descriptor: append-only, created on demand. The fd must be
/// readable as well because shared writable mappings need it.
pub fn open_writer(root: &Path, offset: u64) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(segment_path(root, offset))?)
}

/// Truncate a segment to its committed size.
///
/// The writer descriptor is append-only, so this reopens the file by path
/// after that descriptor has been closed rather than ftruncating it.
pub fn truncate_segment(root: &Path, offset: u64, size: u64) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(segment_path(root, offset))?;
    file.set_len(size)?;
    Ok(())
}

pub fn remove_segment(root: &Path, offset: u64) -> Result<()> {
    std::fs::remove_file(segment_path(root, offset))?;
    Ok(())
}
