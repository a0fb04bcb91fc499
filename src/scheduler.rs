//! Background maintenance run on the event-loop tick.
//!
//! The scheduler owns every deferred operation the request handlers are not
//! allowed to perform inline: unmapping writer regions (with the close +
//! truncate of rolled-over segments), deleting old segments to keep a stream
//! under its cap, evicting streams nobody is attached to, and reclaiming
//! readers that died without a CLOSE.

use log::{debug, info, warn};

use crate::protocol::Mode;
use crate::segment;
use crate::server::{detach, Server};
use crate::stream::ClientId;

impl Server {
    pub(crate) fn tick(&mut self) {
        let now = self.clock.now();
        for sidx in 0..self.streams.len() {
            if self.streams[sidx].is_none() {
                continue;
            }
            self.flush_write_buffer(sidx);
            self.enforce_cap(sidx);
            self.maybe_evict(sidx);
        }
        self.reap_expired_clients(now);
    }

    /// Unmap every region queued by the writer. A region carrying the writer
    /// fd marks the end of a segment's life as the write target: close the
    /// fd, then truncate the file down to its committed size (the writer
    /// extends files ahead of commit to make room for the mapping).
    pub(crate) fn flush_write_buffer(&mut self, sidx: usize) {
        let Server { streams, pool, .. } = self;
        let bs = match streams[sidx].as_mut() {
            Some(bs) => bs,
            None => return,
        };
        while let Some(rid) = bs.write_buffer.pop_front() {
            let region = pool.free(rid);
            assert!(region.map.is_some(), "region in write buffer was never mapped");
            drop(region.map);
            if let Some(wfd) = region.close_on_flush {
                let size = bs
                    .index_of(wfd.seg_offset)
                    .map(|idx| bs.segments[idx].size);
                // close before truncating by path: the descriptor was opened
                // append-only
                drop(wfd.file);
                if let Some(size) = size {
                    if let Err(err) = segment::truncate_segment(&bs.name, wfd.seg_offset, size) {
                        warn!(
                            "truncating segment {:016x} of {}: {err}",
                            wfd.seg_offset,
                            bs.name.display()
                        );
                    }
                }
            }
        }
    }

    /// Keep the stream under its cap while a writer is active by deleting
    /// the oldest segment. A segment with attached readers survives until
    /// the stream overshoots the cap by 20%, at which point the readers are
    /// forcibly detached.
    fn enforce_cap(&mut self, sidx: usize) {
        let Server {
            streams,
            pool,
            clients,
            ..
        } = self;
        let bs = match streams[sidx].as_mut() {
            Some(bs) => bs,
            None => return,
        };
        if bs.writer.is_none() || bs.size <= bs.size_cap || bs.segments.len() < 2 {
            return;
        }

        let attached = bs.segments[0].readers.clone();
        if !attached.is_empty() {
            if bs.size <= bs.size_cap + bs.size_cap / 5 {
                return;
            }
            warn!(
                "stream {} exceeds its cap by more than 20%, detaching {} reader(s)",
                bs.name.display(),
                attached.len()
            );
            for cid in attached {
                if let Some(cl) = clients[cid].as_mut() {
                    detach(bs, pool, cid, cl);
                }
            }
        }
        self.delete_first_segment(sidx);
    }

    fn delete_first_segment(&mut self, sidx: usize) {
        let bs = self.streams[sidx].as_mut().expect("caller checked");
        let old_size = bs.size;
        let seg = bs.remove_first_segment();
        drop(seg.reader_file);
        if let Err(err) = segment::remove_segment(&bs.name, seg.offset) {
            warn!(
                "unlinking segment {:016x} of {}: {err}",
                seg.offset,
                bs.name.display()
            );
        }
        debug!(
            "resized stream {} from {old_size} to {}",
            bs.name.display(),
            bs.size
        );
    }

    /// Drop a stream nobody is attached to, closing its remaining segment
    /// descriptors.
    fn maybe_evict(&mut self, sidx: usize) {
        let bs = match self.streams[sidx].as_ref() {
            Some(bs) => bs,
            None => return,
        };
        if bs.client_count != 0 {
            return;
        }
        assert!(
            bs.write_buffer.is_empty(),
            "evicting stream with unflushed write buffer"
        );
        assert!(
            bs.blocked.is_empty(),
            "evicting stream with blocked readers"
        );
        info!("evicting idle stream {}", bs.name.display());
        self.streams[sidx] = None;
    }

    /// Reclaim readers whose watchdog expired: query processes that died
    /// without sending CLOSE. The writer is trusted and blocked readers are
    /// waiting on us, so both are exempt.
    fn reap_expired_clients(&mut self, now: u64) {
        for cid in 0..self.clients.len() {
            let expired = match &self.clients[cid] {
                Some(cl) => cl.mode != Mode::Writer && !cl.blocked && cl.deadline_ns < now,
                None => false,
            };
            if !expired {
                continue;
            }
            self.reap_client(cid);
        }
    }

    fn reap_client(&mut self, cid: ClientId) {
        let mut cl = self.clients[cid].take().expect("caller checked");
        self.client_count -= 1;
        let bs = self.streams[cl.stream].as_mut().expect("client owns stream");
        bs.client_count -= 1;
        detach(bs, &mut self.pool, cid, &mut cl);
        warn!(
            "client {cid} timed out on {}, {} client(s) remain there, {} total",
            bs.name.display(),
            bs.client_count,
            self.client_count
        );
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::Mode;
    use crate::segment::segment_filename;
    use crate::server::{Server, ServerConfig};
    use crate::stream::Bytestream;

    fn test_server(dir: &std::path::Path) -> Server {
        let cfg = ServerConfig::new(dir.join("broker.sock"), 4096);
        Server::new(cfg).expect("server")
    }

    #[test]
    fn idle_stream_is_evicted_on_tick() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = test_server(dir.path());
        let stream_dir = dir.path().join("flows");
        let bs = Bytestream::open(&stream_dir, Mode::Writer).expect("stream");
        server.insert_stream(bs);

        server.tick();
        assert!(server.streams.iter().all(Option::is_none));
        // the on-disk state is untouched by eviction
        assert!(stream_dir.is_dir());
    }

    #[test]
    fn cap_enforcement_deletes_the_unread_oldest_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut server = test_server(dir.path());
        let stream_dir = dir.path().join("flows");
        std::fs::create_dir_all(&stream_dir).expect("mkdir");
        for offset in [0u64, 4096, 8192] {
            std::fs::write(stream_dir.join(segment_filename(offset)), vec![0u8; 4096])
                .expect("segment");
        }

        let mut bs = Bytestream::open(&stream_dir, Mode::Reader).expect("stream");
        bs.size_cap = 8192;
        let sidx = server.insert_stream(bs);
        let writer = server.new_client(Mode::Writer, sidx);
        server.streams[sidx].as_mut().expect("stream").writer = Some(writer);

        server.tick();

        let bs = server.streams[sidx].as_ref().expect("stream kept alive");
        assert_eq!(bs.size, 8192);
        assert_eq!(bs.first_offset(), 4096);
        assert!(!stream_dir.join(segment_filename(0)).exists());
        assert!(stream_dir.join(segment_filename(4096)).exists());
    }
}

