//! Page-aligned mapped views over segment file ranges.
//!
//! `mmap` requires a page-aligned file offset; callers work in bytestream
//! offsets that rarely are. The view rounds the offset down, maps the extra
//! slack, and exposes only the requested range. Server and client stub both
//! go through this type so the two sides always agree on the page window.

use std::fs::File;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{Error, Result};

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    size as usize
}

enum Map {
    Read(Mmap),
    Write(MmapMut),
}

pub struct MappedRegion {
    map: Map,
    slack: usize,
    len: usize,
}

impl MappedRegion {
    /// Map `len` readable bytes starting at `file_offset` within `file`.
    pub fn map_read(file: &File, file_offset: u64, len: usize) -> Result<MappedRegion> {
        let (aligned, slack) = align_down(file_offset);
        let map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(len + slack)
                .map(file)?
        };
        Ok(MappedRegion {
            map: Map::Read(map),
            slack,
            len,
        })
    }

    /// Map `len` writable shared bytes starting at `file_offset` within `file`.
    pub fn map_write(file: &File, file_offset: u64, len: usize) -> Result<MappedRegion> {
        let (aligned, slack) = align_down(file_offset);
        let map = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(len + slack)
                .map_mut(file)?
        };
        Ok(MappedRegion {
            map: Map::Write(map),
            slack,
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The requested range, slack already skipped.
    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            Map::Read(map) => &map[self.slack..],
            Map::Write(map) => &map[self.slack..],
        }
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            Map::Read(_) => Err(Error::InvalidRequest),
            Map::Write(map) => Ok(&mut map[self.slack..]),
        }
    }
}

fn align_down(file_offset: u64) -> (u64, usize) {
    let page = page_size() as u64;
    let slack = file_offset % page;
    (file_offset - slack, slack as usize)
}

#[cfg(test)]
mod tests {
    use super::{page_size, MappedRegion};
    use std::io::Write;

    #[test]
    fn unaligned_offset_reads_the_right_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg");
        let mut file = std::fs::File::create(&path).expect("create");
        let payload: Vec<u8> = (0..page_size() as u32 + 100)
            .map(|i| (i % 251) as u8)
            .collect();
        file.write_all(&payload).expect("write");
        drop(file);

        let file = std::fs::File::open(&path).expect("open");
        let offset = 37u64;
        let map = MappedRegion::map_read(&file, offset, 64).expect("map");
        assert_eq!(map.len(), 64);
        assert_eq!(map.as_slice(), &payload[37..37 + 64]);
    }

    #[test]
    fn write_map_is_visible_to_read_map() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("create");
        file.set_len(8192).expect("set_len");

        let mut wmap = MappedRegion::map_write(&file, 100, 16).expect("map write");
        wmap.as_mut_slice().expect("writable").copy_from_slice(b"sixteen bytes!!!");
        drop(wmap);

        let rmap = MappedRegion::map_read(&file, 100, 16).expect("map read");
        assert_eq!(rmap.as_slice(), b"sixteen bytes!!!");
    }

    #[test]
    fn read_map_rejects_mutable_access() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("seg");
        std::fs::write(&path, vec![0u8; 256]).expect("write");
        let file = std::fs::File::open(&path).expect("open");
        let mut map = MappedRegion::map_read(&file, 0, 64).expect("map");
        assert!(map.as_mut_slice().is_err());
    }
}
