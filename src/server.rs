//! The storage daemon: bytestream and client tables, protocol handlers,
//! blocked-reader wake-up and the event loop.
//!
//! One single-threaded server owns every piece of persistent state and
//! mediates all producer/consumer access. Handlers process exactly one
//! datagram each and never wait on anything but the socket; the only parked
//! work is the blocked-reader list, replayed whenever the writer commits.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::ipc::Endpoint;
use crate::mmap::MappedRegion;
use crate::pool::{Region, RegionId, RegionPool, WriterFd};
use crate::protocol::{Message, Mode, SeekDir, Tag};
use crate::segment;
use crate::stream::{Blocked, Bytestream, ClientId};
use crate::{Error, Result};

/// Upper bound on concurrently attached clients across all streams.
pub const MAX_CLIENTS: usize = 500;

/// Watchdog for readers that vanish without sending CLOSE.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(3600);

const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Rollover threshold: one region never spans past this many bytes from
    /// its segment base.
    pub max_segment_size: u64,
    pub tick_interval: Duration,
    pub client_timeout: Duration,
    /// Peer to announce readiness to; an EXIT datagram from anywhere shuts
    /// the daemon down either way.
    pub supervisor: Option<PathBuf>,
}

impl ServerConfig {
    pub fn new(socket_path: impl Into<PathBuf>, max_segment_size: u64) -> ServerConfig {
        ServerConfig {
            socket_path: socket_path.into(),
            max_segment_size,
            tick_interval: DEFAULT_TICK_INTERVAL,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            supervisor: None,
        }
    }
}

pub(crate) struct Client {
    pub mode: Mode,
    /// Slot index of the owning bytestream.
    pub stream: usize,
    /// Base offset of the attached segment (readers only; the writer always
    /// targets the newest segment).
    pub segment: Option<u64>,
    pub region: Option<RegionId>,
    pub blocked: bool,
    pub deadline_ns: u64,
}

pub struct Server {
    pub(crate) cfg: ServerConfig,
    endpoint: Endpoint,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) streams: Vec<Option<Bytestream>>,
    pub(crate) pool: RegionPool,
    pub(crate) clients: Vec<Option<Client>>,
    pub(crate) client_count: usize,
    shutdown: bool,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Result<Server> {
        Server::with_clock(cfg, SystemClock)
    }

    pub fn with_clock(cfg: ServerConfig, clock: impl Clock) -> Result<Server> {
        let endpoint = Endpoint::bind(&cfg.socket_path)?;
        let mut clients = Vec::with_capacity(MAX_CLIENTS);
        clients.resize_with(MAX_CLIENTS, || None);
        Ok(Server {
            cfg,
            endpoint,
            clock: Box::new(clock),
            streams: Vec::new(),
            pool: RegionPool::new(),
            clients,
            client_count: 0,
            shutdown: false,
        })
    }

    /// Event loop: wait for datagrams, run the scheduler on the tick.
    pub fn run(&mut self) -> Result<()> {
        info!(
            "storage daemon listening on {}",
            self.cfg.socket_path.display()
        );
        if let Some(supervisor) = self.cfg.supervisor.clone() {
            // readiness announcement; the supervisor replies with EXIT when
            // it wants us gone
            let _ = self
                .endpoint
                .send_to(&supervisor, Tag::Ack, &Message::default());
        }

        let mut last_tick = Instant::now();
        while !self.shutdown {
            let busy = self.client_count > 0 || self.streams.iter().any(Option::is_some);
            let timeout = busy.then_some(self.cfg.tick_interval);
            self.endpoint.wait_readable(timeout)?;

            loop {
                match self.endpoint.try_recv_from() {
                    Ok(Some((tag, msg, peer))) => self.handle_datagram(tag, msg, &peer),
                    Ok(None) => break,
                    Err(Error::Io(err)) => return Err(Error::Io(err)),
                    Err(err) => warn!("dropping malformed datagram: {err}"),
                }
            }

            if busy && last_tick.elapsed() >= self.cfg.tick_interval {
                self.tick();
                last_tick = Instant::now();
            }
        }
        info!("storage daemon shutting down");
        Ok(())
    }

    fn handle_datagram(&mut self, tag: Tag, msg: Message, peer: &Path) {
        match tag {
            Tag::Open => self.handle_open(&msg, peer),
            Tag::Close => self.handle_close(&msg),
            Tag::Region => self.handle_region(&msg, peer),
            Tag::Seek => self.handle_seek(&msg, peer),
            Tag::Inform => self.handle_inform(&msg),
            Tag::Exit => {
                info!("exit requested by supervisor");
                self.shutdown = true;
            }
            Tag::Ack | Tag::Error => {
                warn!("unexpected {tag:?} datagram from {}", peer.display())
            }
        }
    }

    // ------------------------------------------------------------------
    // OPEN
    // ------------------------------------------------------------------

    fn handle_open(&mut self, msg: &Message, peer: &Path) {
        let mode = match Mode::from_arg(msg.arg) {
            Some(mode) => mode,
            None => {
                warn!("open: invalid mode {}", msg.arg);
                return send_err(&self.endpoint, peer, msg.id, libc::EINVAL);
            }
        };
        if msg.name.is_empty() || (mode == Mode::Writer && msg.size < 0) {
            return send_err(&self.endpoint, peer, msg.id, libc::EINVAL);
        }
        debug!("in: OPEN [{}] {mode:?}", msg.name);

        if self.client_count == MAX_CLIENTS {
            warn!("too many clients ({})", self.client_count);
            return send_err(&self.endpoint, peer, msg.id, libc::EMFILE);
        }

        let name = PathBuf::from(&msg.name);
        let sidx = match self.find_stream(&name) {
            Some(sidx) => sidx,
            None => match Bytestream::open(&name, mode) {
                Ok(bs) => self.insert_stream(bs),
                Err(err) => {
                    warn!("cannot open bytestream [{}]: {err}", msg.name);
                    return send_err(&self.endpoint, peer, msg.id, err.errno());
                }
            },
        };

        {
            let bs = self.streams[sidx].as_ref().expect("stream just resolved");
            if mode == Mode::Writer && bs.writer.is_some() {
                warn!("two writers not allowed [{}]", msg.name);
                return send_err(&self.endpoint, peer, msg.id, libc::EPERM);
            }
        }

        let cid = self.new_client(mode, sidx);
        debug!("new client for [{}], id {cid}", msg.name);

        let ofs_ack;
        if mode == Mode::Writer {
            // leftover regions of the previous writer must be unmapped and
            // truncated before a new writer extends the stream
            self.flush_write_buffer(sidx);
            let bs = self.streams[sidx].as_mut().expect("stream resolved");
            bs.writer = Some(cid);
            bs.size_cap = msg.size as u64;
            // the writer always starts on a fresh segment appended at the
            // current end of the stream; a leftover empty segment from a
            // previous writer open sits at exactly that offset, so reuse it
            let start = bs.end_offset();
            let reusable = bs
                .segments
                .last()
                .map(|seg| seg.offset == start && seg.size == 0)
                .unwrap_or(false);
            if !reusable {
                bs.push_segment(start);
            }
            let file = segment::open_writer(&bs.name, start)
                .unwrap_or_else(|err| panic!("opening segment for {}: {err}", name.display()));
            bs.writer_file = Some(file);
            ofs_ack = start;
        } else {
            ofs_ack = self.streams[sidx].as_ref().expect("stream resolved").first_offset();
        }

        send_ack(&self.endpoint, peer, cid as i32, ofs_ack, 0);
    }

    // ------------------------------------------------------------------
    // CLOSE
    // ------------------------------------------------------------------

    fn handle_close(&mut self, msg: &Message) {
        let cid = match self.lookup(msg.id) {
            Some(cid) => cid,
            None => {
                warn!("close: unknown client id {}", msg.id);
                return;
            }
        };
        debug!("in: CLOSE id {cid} offset {}", msg.offset);
        let last_valid = (msg.offset >= 0).then_some(msg.offset as u64);
        self.close_client(cid, last_valid);
    }

    /// Common teardown for CLOSE, protocol violations and the watchdog.
    ///
    /// `last_valid` is the writer's end of valid data; `None` leaves the
    /// committed size untouched.
    fn close_client(&mut self, cid: ClientId, last_valid: Option<u64>) {
        let mut cl = self.clients[cid].take().expect("caller validated id");
        self.client_count -= 1;
        let sidx = cl.stream;
        let bs = self.streams[sidx].as_mut().expect("client owns stream");
        bs.client_count -= 1;
        bs.blocked.retain(|b| b.client != cid);

        if cl.mode != Mode::Writer {
            detach(bs, &mut self.pool, cid, &mut cl);
            return;
        }

        bs.writer = None;
        match cl.region.take() {
            Some(rid) => {
                let region = self.pool.get_mut(rid).expect("client-owned region");
                let base = region.bs_offset;
                let end = base + region.len;
                let seg_offset = bs.segments.last().expect("writer segment").offset;
                region.close_on_flush = Some(WriterFd {
                    file: bs.writer_file.take().expect("writer without fd"),
                    seg_offset,
                });
                // the writer reserves more than it uses; an explicit CLOSE
                // reports the last valid byte so the scheduler can truncate
                // the tail. A teardown without one leaves the commit alone.
                if let Some(valid) = last_valid {
                    bs.commit_to(valid.clamp(base, end));
                }
                bs.write_buffer.push_back(rid);
            }
            None => {
                // writer never mapped anything; nothing can be pending
                if !bs.write_buffer.is_empty() {
                    panic!("write buffer not empty but writer is inactive");
                }
                drop(bs.writer_file.take());
            }
        }
        info!("writer removed from {}", bs.name.display());
        // readers blocked on data that will now never arrive get their EOF
        self.wakeup_blocked(sidx);
    }

    // ------------------------------------------------------------------
    // REGION
    // ------------------------------------------------------------------

    fn handle_region(&mut self, msg: &Message, peer: &Path) {
        let cid = match self.lookup(msg.id) {
            Some(cid) => cid,
            None => {
                warn!("region: unknown client id {}", msg.id);
                return send_err(&self.endpoint, peer, msg.id, libc::EINVAL);
            }
        };
        debug!(
            "in: REGION id {cid} offset {} size {}",
            msg.offset, msg.size
        );
        if msg.offset < 0 || msg.size <= 0 {
            return send_err(&self.endpoint, peer, msg.id, libc::EINVAL);
        }

        let mut msg = msg.clone();
        if msg.size as u64 > self.cfg.max_segment_size {
            warn!(
                "region size {} too large, clamping to {}",
                msg.size, self.cfg.max_segment_size
            );
            msg.size = self.cfg.max_segment_size as i64;
        }

        self.touch(cid);
        let mode = self.clients[cid].as_ref().expect("looked up").mode;
        if mode == Mode::Writer {
            self.region_write(&msg, cid, peer);
        } else {
            self.region_read(&msg, cid, peer);
        }
    }

    /// Read-side REGION: map, report EOF, or park the reader.
    ///
    /// Also the replay target for blocked readers, which is why it takes the
    /// saved request message rather than reading client state.
    fn region_read(&mut self, msg: &Message, cid: ClientId, peer: &Path) {
        let Server {
            endpoint,
            streams,
            pool,
            clients,
            ..
        } = self;
        let cl = clients[cid].as_mut().expect("caller validated id");
        let bs = streams[cl.stream].as_mut().expect("client owns stream");
        let ofs = msg.offset as u64;

        if bs.segments.is_empty() {
            if bs.writer.is_some() {
                panic!(
                    "stream {} has a writer but no segments",
                    bs.name.display()
                );
            }
            return send_ack(endpoint, peer, msg.id, 0, 0);
        }

        let first = bs.first_offset();
        let end = bs.end_offset();
        if ofs < first {
            debug!("id {cid}: offset {ofs} below first segment {first}");
            return send_err(endpoint, peer, msg.id, libc::ENODATA);
        }
        if ofs >= end {
            // past the committed bytes: EOF unless a writer may still
            // deliver them and the reader is willing to wait
            if bs.writer.is_none() || cl.mode == Mode::ReaderNoBlock {
                return send_ack(endpoint, peer, msg.id, 0, 0);
            }
            cl.blocked = true;
            detach(bs, pool, cid, cl);
            bs.blocked.push_back(Blocked {
                client: cid,
                msg: msg.clone(),
                reply_to: peer.to_path_buf(),
            });
            debug!("client {cid} blocked on offset {ofs} size {}", msg.size);
            return;
        }

        // the request is servable: replace whatever was mapped before
        if let Some(rid) = cl.region.take() {
            pool.free(rid);
        }

        // leave the current segment if the offset is outside its committed
        // range
        if let Some(seg_offset) = cl.segment {
            let stale = match bs.index_of(seg_offset) {
                Some(idx) => !bs.segments[idx].contains(ofs),
                None => true,
            };
            if stale {
                detach(bs, pool, cid, cl);
            }
        }

        if cl.segment.is_none() {
            let idx = bs
                .find_containing(ofs)
                .unwrap_or_else(|| panic!("no segment holds offset {ofs} in {}", bs.name.display()));
            let name = bs.name.clone();
            let seg = &mut bs.segments[idx];
            seg.readers.push(cid);
            cl.segment = Some(seg.offset);
            if seg.reader_file.is_none() {
                let file = segment::open_reader(&name, seg.offset)
                    .unwrap_or_else(|err| panic!("opening segment in {}: {err}", name.display()));
                seg.reader_file = Some(file);
            }
        }

        let seg_idx = bs
            .index_of(cl.segment.expect("attached above"))
            .expect("attached segment exists");
        let seg = &bs.segments[seg_idx];
        // a region never crosses a segment boundary
        let size = (msg.size as u64).min(seg.end() - ofs);
        let file = seg.reader_file.as_ref().expect("attached segment has fd");
        let map = MappedRegion::map_read(file, ofs - seg.offset, size as usize)
            .unwrap_or_else(|err| panic!("mapping {}: {err}", bs.name.display()));
        let rid = pool.alloc(Region {
            bs_offset: ofs,
            len: size,
            map: Some(map),
            close_on_flush: None,
        });
        cl.region = Some(rid);

        // the segment base tells the client which file to open
        send_ack(endpoint, peer, msg.id, seg.offset, size);
    }

    /// Write-side REGION: commit, roll over when the segment is full, extend
    /// the backing file, map, and wake parked readers.
    fn region_write(&mut self, msg: &Message, cid: ClientId, peer: &Path) {
        let sidx;
        {
            let Server {
                endpoint,
                streams,
                pool,
                clients,
                cfg,
                ..
            } = self;
            let cl = clients[cid].as_mut().expect("caller validated id");
            sidx = cl.stream;
            let bs = streams[sidx].as_mut().expect("client owns stream");
            let ofs = msg.offset as u64;
            let size = msg.size as u64;

            let (base, reserved) = match cl.region {
                Some(rid) => {
                    let region = pool.get(rid).expect("client-owned region");
                    (region.bs_offset, region.len)
                }
                None => {
                    let last = bs.segments.last().expect("writer always has a segment");
                    (last.end(), 0)
                }
            };
            if ofs < base {
                warn!("id {cid}, {}: overwriting not allowed", bs.name.display());
                send_err(endpoint, peer, msg.id, libc::EINVAL);
                return self.drop_client(cid);
            }
            if ofs > base + reserved {
                warn!("id {cid}, {}: gaps not allowed", bs.name.display());
                send_err(endpoint, peer, msg.id, libc::EINVAL);
                return self.drop_client(cid);
            }

            // a new region request commits everything before its start
            bs.commit_to(ofs);

            let prev = cl.region.take();
            let seg_base = bs.segments.last().expect("writer segment").offset;
            // physical bytes already on disk for the current segment
            let mut have = base + reserved;

            if ofs + size > seg_base + cfg.max_segment_size {
                // rollover: the outgoing region carries the writer fd so the
                // scheduler can close and truncate once it is unmapped
                let file = bs.writer_file.take().expect("writer without fd");
                match prev {
                    Some(rid) => {
                        let region = pool.get_mut(rid).expect("client-owned region");
                        region.close_on_flush = Some(WriterFd {
                            file,
                            seg_offset: seg_base,
                        });
                    }
                    None => {
                        // nothing mapped: safe to finish the file right here
                        drop(file);
                        let size = bs.segments.last().expect("writer segment").size;
                        if let Err(err) = segment::truncate_segment(&bs.name, seg_base, size) {
                            warn!("truncating {}: {err}", bs.name.display());
                        }
                    }
                }
                bs.push_segment(ofs);
                let file = segment::open_writer(&bs.name, ofs).unwrap_or_else(|err| {
                    panic!("opening segment for {}: {err}", bs.name.display())
                });
                bs.writer_file = Some(file);
                have = ofs;
            }

            if let Some(rid) = prev {
                bs.write_buffer.push_back(rid);
            }

            let seg_base = bs.segments.last().expect("writer segment").offset;
            let want = ofs + size;
            if want > have {
                // extending a shared writable mapping needs real bytes in
                // the file, so append zeroes up to the end of the region
                let zeros = vec![0u8; (want - have) as usize];
                let mut file = bs.writer_file.as_ref().expect("writer fd");
                if let Err(err) = file.write_all(&zeros) {
                    warn!(
                        "id {cid}, {}: extending file failed: {err}",
                        bs.name.display()
                    );
                    let errno = err.raw_os_error().unwrap_or(libc::EIO);
                    return send_err(endpoint, peer, msg.id, errno);
                }
            }

            let file = bs.writer_file.as_ref().expect("writer fd");
            let map = MappedRegion::map_write(file, ofs - seg_base, size as usize)
                .unwrap_or_else(|err| panic!("mapping {}: {err}", bs.name.display()));
            let rid = pool.alloc(Region {
                bs_offset: ofs,
                len: size,
                map: Some(map),
                close_on_flush: None,
            });
            cl.region = Some(rid);

            send_ack(endpoint, peer, msg.id, seg_base, size);
        }

        self.wakeup_blocked(sidx);
    }

    // ------------------------------------------------------------------
    // INFORM
    // ------------------------------------------------------------------

    /// Writer commit notification. Fire-and-forget on the wire, so anomalies
    /// are logged and dropped rather than answered.
    fn handle_inform(&mut self, msg: &Message) {
        let cid = match self.lookup(msg.id) {
            Some(cid) => cid,
            None => return warn!("inform: unknown client id {}", msg.id),
        };
        self.touch(cid);
        let sidx;
        {
            let cl = self.clients[cid].as_ref().expect("looked up");
            if cl.mode != Mode::Writer {
                return warn!("inform: client {cid} is not a writer");
            }
            sidx = cl.stream;
            let rid = match cl.region {
                Some(rid) => rid,
                None => return warn!("inform: writer {cid} has no mapped region"),
            };
            let region = self.pool.get(rid).expect("client-owned region");
            let ofs = msg.offset as u64;
            if msg.offset < 0 || ofs < region.bs_offset || ofs > region.bs_offset + region.len {
                return warn!("inform: offset {} outside writer region", msg.offset);
            }
            debug!("in: INFORM id {cid} offset {ofs}");
            let bs = self.streams[sidx].as_mut().expect("client owns stream");
            bs.commit_to(ofs);
        }
        self.wakeup_blocked(sidx);
    }

    // ------------------------------------------------------------------
    // SEEK
    // ------------------------------------------------------------------

    fn handle_seek(&mut self, msg: &Message, peer: &Path) {
        let cid = match self.lookup(msg.id) {
            Some(cid) => cid,
            None => {
                warn!("seek: unknown client id {}", msg.id);
                return send_err(&self.endpoint, peer, msg.id, libc::EINVAL);
            }
        };
        let dir = match SeekDir::from_arg(msg.arg) {
            Some(dir) => dir,
            None => {
                warn!("seek: invalid direction {}", msg.arg);
                return send_err(&self.endpoint, peer, msg.id, libc::EINVAL);
            }
        };
        debug!("in: SEEK id {cid} {dir:?}");
        self.touch(cid);

        let Server {
            endpoint,
            streams,
            pool,
            clients,
            ..
        } = self;
        let cl = clients[cid].as_mut().expect("looked up");
        if cl.mode == Mode::Writer {
            warn!("seek: writers cannot seek (id {cid})");
            return send_err(endpoint, peer, msg.id, libc::EINVAL);
        }
        let bs = streams[cl.stream].as_mut().expect("client owns stream");

        let prev = cl.segment.and_then(|offset| bs.index_of(offset));
        detach(bs, pool, cid, cl);

        let target = match dir {
            SeekDir::Next => match prev {
                // never mapped or sought: start from the first segment
                None => (!bs.segments.is_empty()).then_some(0),
                Some(idx) => (idx + 1 < bs.segments.len()).then_some(idx + 1),
            },
            SeekDir::Prev => match prev {
                None => bs.segments.len().checked_sub(1),
                Some(idx) => idx.checked_sub(1),
            },
        };
        let idx = match target {
            Some(idx) => idx,
            None => {
                debug!("id {cid}: seek walked off {}", bs.name.display());
                return send_err(endpoint, peer, msg.id, libc::ENODATA);
            }
        };

        let name = bs.name.clone();
        let seg = &mut bs.segments[idx];
        seg.readers.push(cid);
        cl.segment = Some(seg.offset);
        if seg.reader_file.is_none() {
            let file = segment::open_reader(&name, seg.offset)
                .unwrap_or_else(|err| panic!("opening segment in {}: {err}", name.display()));
            seg.reader_file = Some(file);
        }
        send_ack(endpoint, peer, msg.id, seg.offset, msg.size as u64);
    }

    // ------------------------------------------------------------------
    // blocked-reader wake-up
    // ------------------------------------------------------------------

    /// Replay every parked request in FIFO order. Requests the writer still
    /// has not satisfied re-park themselves through the read path.
    pub(crate) fn wakeup_blocked(&mut self, sidx: usize) {
        let bs = match self.streams[sidx].as_mut() {
            Some(bs) => bs,
            None => return,
        };
        if bs.blocked.is_empty() {
            return;
        }
        debug!("waking {} blocked reader(s)", bs.blocked.len());
        let waking = std::mem::take(&mut bs.blocked);
        for entry in waking {
            let cl = match self.clients[entry.client].as_mut() {
                Some(cl) => cl,
                None => continue,
            };
            cl.blocked = false;
            cl.deadline_ns = self.clock.now() + self.cfg.client_timeout.as_nanos() as u64;
            self.region_read(&entry.msg, entry.client, &entry.reply_to);
        }
    }

    // ------------------------------------------------------------------
    // shared plumbing
    // ------------------------------------------------------------------

    fn find_stream(&self, name: &Path) -> Option<usize> {
        self.streams
            .iter()
            .position(|slot| slot.as_ref().map(|bs| bs.name == name).unwrap_or(false))
    }

    pub(crate) fn insert_stream(&mut self, bs: Bytestream) -> usize {
        match self.streams.iter().position(Option::is_none) {
            Some(idx) => {
                self.streams[idx] = Some(bs);
                idx
            }
            None => {
                self.streams.push(Some(bs));
                self.streams.len() - 1
            }
        }
    }

    /// Allocate the lowest unused client id.
    pub(crate) fn new_client(&mut self, mode: Mode, sidx: usize) -> ClientId {
        let cid = self
            .clients
            .iter()
            .position(Option::is_none)
            .expect("client cap checked by caller");
        self.clients[cid] = Some(Client {
            mode,
            stream: sidx,
            segment: None,
            region: None,
            blocked: false,
            deadline_ns: self.clock.now() + self.cfg.client_timeout.as_nanos() as u64,
        });
        self.client_count += 1;
        self.streams[sidx]
            .as_mut()
            .expect("stream exists")
            .client_count += 1;
        cid
    }

    fn lookup(&self, id: i32) -> Option<ClientId> {
        let cid = usize::try_from(id).ok()?;
        if cid >= MAX_CLIENTS || self.clients[cid].is_none() {
            return None;
        }
        Some(cid)
    }

    fn touch(&mut self, cid: ClientId) {
        let deadline = self.clock.now() + self.cfg.client_timeout.as_nanos() as u64;
        if let Some(cl) = self.clients[cid].as_mut() {
            cl.deadline_ns = deadline;
        }
    }

    /// Teardown after a protocol violation: the offending client is gone as
    /// far as the server is concerned.
    fn drop_client(&mut self, cid: ClientId) {
        if self.clients[cid].is_some() {
            self.close_client(cid, None);
        }
    }
}

/// Unlink a client from its segment, closing the shared reader fd with the
/// last reader, and release its mapped region.
pub(crate) fn detach(
    bs: &mut Bytestream,
    pool: &mut RegionPool,
    cid: ClientId,
    cl: &mut Client,
) {
    if let Some(seg_offset) = cl.segment.take() {
        if let Some(idx) = bs.index_of(seg_offset) {
            let seg = &mut bs.segments[idx];
            seg.readers.retain(|&reader| reader != cid);
            if seg.readers.is_empty() {
                seg.reader_file = None;
            }
        }
    }
    if let Some(rid) = cl.region.take() {
        pool.free(rid);
    }
}

fn send_ack(endpoint: &Endpoint, peer: &Path, id: i32, offset: u64, size: u64) {
    let msg = Message {
        id,
        arg: 0,
        offset: offset as i64,
        size: size as i64,
        name: String::new(),
    };
    debug!("out: ACK id {id} offset {offset} size {size}");
    if let Err(err) = endpoint.send_to(peer, Tag::Ack, &msg) {
        warn!("sending ack to {}: {err}", peer.display());
    }
}

fn send_err(endpoint: &Endpoint, peer: &Path, id: i32, errno: i32) {
    assert!(errno != 0, "refusing a request without giving a reason");
    let msg = Message {
        id,
        arg: errno,
        ..Default::default()
    };
    debug!("out: ERROR id {id} errno {errno}");
    if let Err(err) = endpoint.send_to(peer, Tag::Error, &msg) {
        warn!("sending error to {}: {err}", peer.display());
    }
}
