//! Client stub: the mmap-like API linked into producer and consumer
//! processes.
//!
//! A [`StreamHandle`] mirrors the daemon's view of the client in a small
//! local state machine: the current segment's base offset, the locally
//! opened segment file, and the cached mapped region. `map` serves repeat
//! requests out of the cache without a round-trip; everything else is one
//! datagram exchange per call. A blocking reader's `map` simply sleeps in
//! `recv` until the writer commits enough data and the daemon replays the
//! request.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use log::debug;

use crate::ipc::Endpoint;
use crate::mmap::MappedRegion;
use crate::protocol::{Message, Mode, SeekDir, Tag};
use crate::record::{RecordHeader, RECORD_HEADER_SIZE};
use crate::segment;
use crate::{Error, Result};

/// Small read requests are inflated to this size so nearby reads hit the
/// cached region instead of the daemon.
pub const OPTIMAL_MAP_SIZE: u64 = 1024 * 1024;

struct StubMap {
    region: MappedRegion,
    /// Bytestream offset of the first byte of `region`.
    offset: u64,
}

impl StubMap {
    fn end(&self) -> u64 {
        self.offset + self.region.len() as u64
    }
}

pub struct StreamHandle {
    endpoint: Endpoint,
    name: PathBuf,
    mode: Mode,
    id: i32,
    /// Locally opened descriptor for the current segment, replaced when an
    /// ACK names a different segment base.
    file: Option<File>,
    seg_base: u64,
    map: Option<StubMap>,
    read_ofs: u64,
    read_len: u64,
}

impl StreamHandle {
    /// Open a bytestream through the daemon at `server`.
    ///
    /// `size_cap` is only meaningful for writers and sets the stream's
    /// retention cap.
    pub fn open(server: &Path, name: &Path, mode: Mode, size_cap: u64) -> Result<StreamHandle> {
        let name_str = name.to_str().ok_or(Error::InvalidRequest)?;
        let endpoint = Endpoint::connect(server)?;
        let msg = Message {
            id: 0,
            arg: mode.as_arg(),
            offset: 0,
            size: size_cap as i64,
            name: name_str.to_string(),
        };
        endpoint.send(Tag::Open, &msg)?;
        let (tag, reply) = endpoint.recv()?;
        match tag {
            Tag::Error => Err(Error::from_errno(reply.arg)),
            Tag::Ack => {
                let base = reply.offset as u64;
                debug!("opened [{}] as client {} at {base}", name_str, reply.id);
                Ok(StreamHandle {
                    endpoint,
                    name: name.to_path_buf(),
                    mode,
                    id: reply.id,
                    file: None,
                    seg_base: base,
                    map: None,
                    read_ofs: base,
                    read_len: 0,
                })
            }
            _ => Err(Error::Protocol("unexpected reply to OPEN")),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Bytestream offset of the current mapped block, or the current
    /// segment base when nothing is mapped.
    pub fn offset(&self) -> u64 {
        self.map.as_ref().map(|m| m.offset).unwrap_or(self.seg_base)
    }

    /// Map `len` readable bytes at `ofs`. Returns `Ok(None)` at end of
    /// stream; for a blocking reader this call sleeps until the writer
    /// commits past `ofs`. The returned slice holds the granted length,
    /// capped at `len`.
    pub fn map(&mut self, ofs: u64, len: u64) -> Result<Option<&[u8]>> {
        let usable = match self.request_region(ofs, len)? {
            0 => return Ok(None),
            granted => granted.min(len) as usize,
        };
        let map = self.map.as_ref().expect("region granted");
        let start = (ofs - map.offset) as usize;
        Ok(Some(&map.region.as_slice()[start..start + usable]))
    }

    /// Writer-side map: reserve and map `[ofs, ofs + len)` for appending.
    /// Offsets must not step backwards or leave a gap behind the previous
    /// region.
    pub fn map_mut(&mut self, ofs: u64, len: u64) -> Result<&mut [u8]> {
        if self.mode != Mode::Writer {
            return Err(Error::InvalidRequest);
        }
        let usable = match self.request_region(ofs, len)? {
            0 => return Err(Error::NoData),
            granted => granted.min(len) as usize,
        };
        let map = self.map.as_mut().expect("region granted");
        let start = (ofs - map.offset) as usize;
        Ok(&mut map.region.as_mut_slice()?[start..start + usable])
    }

    /// Tell the daemon that bytes up to `ofs` are valid, waking blocked
    /// readers. Fire-and-forget; silently skipped when `ofs` is not inside
    /// the current region or the handle is not a writer.
    pub fn commit(&self, ofs: u64) -> Result<()> {
        if self.mode != Mode::Writer {
            return Ok(());
        }
        let inside = self
            .map
            .as_ref()
            .map(|m| ofs >= m.offset && ofs <= m.end())
            .unwrap_or(false);
        if !inside {
            return Ok(());
        }
        self.endpoint.send(
            Tag::Inform,
            &Message {
                id: self.id,
                offset: ofs as i64,
                ..Default::default()
            },
        )
    }

    /// Move to the neighboring segment. `Ok(None)` means the walk fell off
    /// either end of the stream.
    pub fn seek(&mut self, dir: SeekDir) -> Result<Option<u64>> {
        let msg = Message {
            id: self.id,
            arg: dir.as_arg(),
            ..Default::default()
        };
        self.endpoint.send(Tag::Seek, &msg)?;
        let (tag, reply) = self.endpoint.recv()?;
        match tag {
            Tag::Error => match Error::from_errno(reply.arg) {
                Error::NoData => Ok(None),
                err => Err(err),
            },
            Tag::Ack => {
                self.map = None;
                self.file = None;
                self.seg_base = reply.offset as u64;
                self.read_ofs = self.seg_base;
                self.read_len = 0;
                Ok(Some(self.seg_base))
            }
            _ => Err(Error::Protocol("unexpected reply to SEEK")),
        }
    }

    /// Sequential read over an internal cursor: returns the next chunk of at
    /// most `len` bytes, or `Ok(None)` at end of stream.
    pub fn read_next(&mut self, len: u64) -> Result<Option<&[u8]>> {
        let ofs = self.read_ofs + self.read_len;
        let usable = match self.request_region(ofs, len)? {
            0 => {
                self.read_ofs = ofs;
                self.read_len = 0;
                return Ok(None);
            }
            granted => granted.min(len),
        };
        self.read_ofs = ofs;
        self.read_len = usable;
        let map = self.map.as_ref().expect("region granted");
        let start = (ofs - map.offset) as usize;
        Ok(Some(&map.region.as_slice()[start..start + usable as usize]))
    }

    /// Find the offset of the first record whose timestamp is at or past
    /// `ts`.
    ///
    /// This helper assumes the producer frames its payload with
    /// [`RecordHeader`]; the broker itself never interprets the bytes. The
    /// scan walks segment first-records to pick the right segment, then
    /// steps record by record. A zero timestamp marks lost sync and skips
    /// the rest of the segment.
    pub fn seek_to_timestamp(&mut self, ts: u64) -> Result<Option<u64>> {
        // rewind to the first segment
        while self.seek(SeekDir::Prev)?.is_some() {}

        // pick the last segment whose first record is still at or before
        // the target
        let mut best = self.offset();
        let mut ofs = best;
        loop {
            let header = match self.map(ofs, RECORD_HEADER_SIZE as u64)? {
                None => break,
                Some(bytes) => RecordHeader::from_bytes(bytes)
                    .ok_or(Error::Protocol("record header truncated"))?,
            };
            if header.timestamp != 0 {
                if header.timestamp > ts {
                    break;
                }
                best = ofs;
            }
            match self.seek(SeekDir::Next)? {
                Some(base) => ofs = base,
                None => break,
            }
        }

        // then scan record by record inside it
        let mut ofs = best;
        loop {
            let header = match self.map(ofs, RECORD_HEADER_SIZE as u64)? {
                None => return Ok(None),
                Some(bytes) => RecordHeader::from_bytes(bytes)
                    .ok_or(Error::Protocol("record header truncated"))?,
            };
            if header.timestamp == 0 {
                // lost sync: the rest of this segment is padding
                match self.seek(SeekDir::Next)? {
                    Some(base) => ofs = base,
                    None => return Ok(None),
                }
                continue;
            }
            if header.timestamp >= ts {
                return Ok(Some(ofs));
            }
            ofs += header.size;
        }
    }

    /// Fetch one whole record at `ofs`, or `Ok(None)` at end of stream or on
    /// a lost-sync marker.
    pub fn record_at(&mut self, ofs: u64) -> Result<Option<&[u8]>> {
        let header = match self.map(ofs, RECORD_HEADER_SIZE as u64)? {
            None => return Ok(None),
            Some(bytes) => {
                RecordHeader::from_bytes(bytes).ok_or(Error::Protocol("record header truncated"))?
            }
        };
        if header.timestamp == 0 {
            return Ok(None);
        }
        self.map(ofs, header.size)
    }

    /// Drop the mapping, close the local descriptor and detach from the
    /// daemon. Writers pass the offset of the last valid byte so the tail
    /// of the reserved region can be truncated away.
    pub fn close(mut self, last_valid: u64) -> Result<()> {
        self.map = None;
        self.file = None;
        self.endpoint.send(
            Tag::Close,
            &Message {
                id: self.id,
                offset: last_valid as i64,
                ..Default::default()
            },
        )
    }

    /// Make sure the cached map covers `[ofs, ofs + len)`, asking the
    /// daemon when it does not. Returns the granted length from `ofs`,
    /// 0 meaning end of stream.
    fn request_region(&mut self, ofs: u64, len: u64) -> Result<u64> {
        if len == 0 {
            return Err(Error::InvalidRequest);
        }
        if let Some(map) = &self.map {
            if ofs > map.offset && ofs + len <= map.end() {
                return Ok(len);
            }
        }

        // inflating reads helps future requests hit the cache; the caller
        // never sees more than it asked for
        let req = if self.mode == Mode::Writer {
            len
        } else {
            len.max(OPTIMAL_MAP_SIZE)
        };
        self.endpoint.send(
            Tag::Region,
            &Message {
                id: self.id,
                offset: ofs as i64,
                size: req as i64,
                ..Default::default()
            },
        )?;
        let (tag, reply) = self.endpoint.recv()?;
        match tag {
            Tag::Error => Err(Error::from_errno(reply.arg)),
            Tag::Ack => {
                self.map = None;
                if reply.size == 0 {
                    // end of stream
                    self.file = None;
                    return Ok(0);
                }
                let granted = reply.size as u64;
                let seg_base = reply.offset as u64;
                if self.file.is_none() || seg_base != self.seg_base {
                    self.file = Some(self.open_segment(seg_base)?);
                    self.seg_base = seg_base;
                }
                let file = self.file.as_ref().expect("segment just opened");
                let region = match self.mode {
                    Mode::Writer => {
                        MappedRegion::map_write(file, ofs - seg_base, granted as usize)?
                    }
                    _ => MappedRegion::map_read(file, ofs - seg_base, granted as usize)?,
                };
                self.map = Some(StubMap { region, offset: ofs });
                Ok(granted)
            }
            _ => Err(Error::Protocol("unexpected reply to REGION")),
        }
    }

    fn open_segment(&self, seg_base: u64) -> Result<File> {
        let path = segment::segment_path(&self.name, seg_base);
        let file = match self.mode {
            Mode::Writer => OpenOptions::new().read(true).write(true).open(&path)?,
            _ => File::open(&path)?,
        };
        Ok(file)
    }
}
