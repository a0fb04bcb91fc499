//! Per-bytestream server state.
//!
//! A bytestream descriptor owns the segment list, the single optional
//! writer, the write buffer of regions awaiting the scheduler, and the FIFO
//! of blocked readers. The segment holding the shared read fd and its reader
//! list is also defined here; the writer fd deliberately lives on the
//! bytestream instead, because the writer always targets the newest segment
//! and its fd must be handed over to the scheduler on rollover.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::pool::RegionId;
use crate::protocol::{Message, Mode};
use crate::segment;
use crate::Result;

pub type ClientId = usize;

pub struct Segment {
    /// Bytestream offset of the segment's first byte; doubles as filename.
    pub offset: u64,
    /// Committed bytes, updated by REGION-write, INFORM and writer CLOSE.
    /// The backing file may be longer while the writer has room reserved.
    pub size: u64,
    /// Shared read descriptor, opened when the first reader attaches and
    /// closed when the last one leaves.
    pub reader_file: Option<File>,
    /// Readers currently attached to this segment.
    pub readers: Vec<ClientId>,
}

impl Segment {
    fn new(offset: u64, size: u64) -> Segment {
        Segment {
            offset,
            size,
            reader_file: None,
            readers: Vec::new(),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// A parked reader: the original request plus the address to answer once the
/// writer commits far enough.
pub struct Blocked {
    pub client: ClientId,
    pub msg: Message,
    pub reply_to: PathBuf,
}

pub struct Bytestream {
    pub name: PathBuf,
    /// Committed bytes across all segments.
    pub size: u64,
    /// Cap enforced by the scheduler while a writer is attached.
    pub size_cap: u64,
    /// Ascending, contiguous segment list.
    pub segments: Vec<Segment>,
    pub writer: Option<ClientId>,
    /// Append-only descriptor for the newest segment.
    pub writer_file: Option<File>,
    /// Regions awaiting unmap (and possibly close + truncate) by the
    /// scheduler.
    pub write_buffer: VecDeque<RegionId>,
    /// FIFO of parked readers, replayed on every commit.
    pub blocked: VecDeque<Blocked>,
    pub client_count: usize,
}

impl Bytestream {
    /// Build the descriptor from the filesystem.
    ///
    /// Writers get the directory created if missing; readers fail on a
    /// stream that does not exist on disk.
    pub fn open(name: &Path, mode: Mode) -> Result<Bytestream> {
        let scanned = segment::scan_stream_dir(name, mode)?;
        let mut size = 0;
        let segments = scanned
            .into_iter()
            .map(|(offset, seg_size)| {
                size += seg_size;
                Segment::new(offset, seg_size)
            })
            .collect();
        Ok(Bytestream {
            name: name.to_path_buf(),
            size,
            size_cap: 0,
            segments,
            writer: None,
            writer_file: None,
            write_buffer: VecDeque::new(),
            blocked: VecDeque::new(),
            client_count: 0,
        })
    }

    pub fn first_offset(&self) -> u64 {
        self.segments.first().map(|seg| seg.offset).unwrap_or(0)
    }

    /// One past the last committed byte.
    pub fn end_offset(&self) -> u64 {
        self.first_offset() + self.size
    }

    pub fn index_of(&self, seg_offset: u64) -> Option<usize> {
        self.segments
            .binary_search_by_key(&seg_offset, |seg| seg.offset)
            .ok()
    }

    /// Segment whose committed range covers `offset`. With a contiguous
    /// list this is the first segment ending past the offset.
    pub fn find_containing(&self, offset: u64) -> Option<usize> {
        self.segments.iter().position(|seg| offset < seg.end())
    }

    /// Append a fresh zero-length segment; offsets only grow, so the sorted
    /// order is preserved by pushing.
    pub fn push_segment(&mut self, offset: u64) -> &mut Segment {
        debug_assert!(self
            .segments
            .last()
            .map(|seg| seg.offset <= offset)
            .unwrap_or(true));
        self.segments.push(Segment::new(offset, 0));
        self.segments.last_mut().expect("just pushed")
    }

    /// Drop the oldest segment from the accounting and return it.
    ///
    /// Removing the only segment would zero the stream while it still
    /// exists, which is a bookkeeping bug.
    pub fn remove_first_segment(&mut self) -> Segment {
        if self.segments.len() <= 1 {
            panic!("reducing bytestream {} to zero size", self.name.display());
        }
        let seg = self.segments.remove(0);
        self.size -= seg.size;
        seg
    }

    /// Commit bytes up to `offset`: the newest segment and the stream size
    /// both advance. Returns true when the committed end moved.
    pub fn commit_to(&mut self, offset: u64) -> bool {
        let first = self.first_offset();
        let last = self.segments.last_mut().expect("writer without segments");
        last.size = offset - last.offset;
        let new_size = offset - first;
        let advanced = new_size > self.size;
        self.size = new_size;
        advanced
    }

    #[cfg(test)]
    pub fn check_accounting(&self) {
        let mut expected = self.segments.first().map(|seg| seg.offset);
        let mut total = 0;
        for seg in &self.segments {
            assert_eq!(Some(seg.offset), expected, "segment gap or overlap");
            expected = Some(seg.end());
            total += seg.size;
        }
        assert_eq!(total, self.size, "segment sizes out of sync with stream");
    }
}

#[cfg(test)]
mod tests {
    use super::Bytestream;
    use crate::protocol::Mode;
    use crate::segment::segment_filename;

    fn stream_with(dir: &std::path::Path, segs: &[(u64, u64)]) -> Bytestream {
        for &(offset, size) in segs {
            std::fs::write(dir.join(segment_filename(offset)), vec![0u8; size as usize])
                .expect("write segment");
        }
        Bytestream::open(dir, Mode::Reader).expect("open")
    }

    #[test]
    fn open_reconstructs_contiguous_accounting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bs = stream_with(dir.path(), &[(0, 4096), (4096, 4096), (8192, 100)]);
        bs.check_accounting();
        assert_eq!(bs.size, 8292);
        assert_eq!(bs.first_offset(), 0);
        assert_eq!(bs.end_offset(), 8292);
        assert_eq!(bs.find_containing(4096), Some(1));
        assert_eq!(bs.find_containing(8291), Some(2));
        assert_eq!(bs.find_containing(8292), None);
    }

    #[test]
    fn commit_extends_only_the_last_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bs = stream_with(dir.path(), &[(0, 4096), (4096, 10)]);
        assert!(bs.commit_to(4200));
        bs.check_accounting();
        assert_eq!(bs.segments[1].size, 104);
        assert_eq!(bs.size, 4200);
        // re-committing the same point is not an advance
        assert!(!bs.commit_to(4200));
    }

    #[test]
    fn removing_first_segment_shifts_the_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bs = stream_with(dir.path(), &[(0, 4096), (4096, 4096), (8192, 4096)]);
        let seg = bs.remove_first_segment();
        assert_eq!(seg.offset, 0);
        bs.check_accounting();
        assert_eq!(bs.first_offset(), 4096);
        assert_eq!(bs.size, 8192);
    }

    #[test]
    #[should_panic(expected = "zero size")]
    fn removing_the_only_segment_panics() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut bs = stream_with(dir.path(), &[(0, 4096)]);
        bs.remove_first_segment();
    }
}
