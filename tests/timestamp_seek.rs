use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use streambroker::ipc::Endpoint;
use streambroker::protocol::{Message, Tag};
use streambroker::{Mode, RecordHeader, Server, ServerConfig, StreamHandle, RECORD_HEADER_SIZE};

fn start_broker(dir: &Path, max_segment: u64) -> (PathBuf, JoinHandle<()>) {
    let sock = dir.join("broker.sock");
    let mut cfg = ServerConfig::new(sock.clone(), max_segment);
    cfg.tick_interval = Duration::from_millis(50);
    let mut server = Server::new(cfg).expect("server");
    let handle = std::thread::spawn(move || server.run().expect("server loop"));
    (sock, handle)
}

fn stop_broker(sock: &Path, handle: JoinHandle<()>) {
    let control = Endpoint::connect(sock).expect("control endpoint");
    control.send(Tag::Exit, &Message::default()).expect("send exit");
    handle.join().expect("join server");
}

const REC_SIZE: u64 = 1016;

fn write_record(writer: &mut StreamHandle, ofs: u64, ts: u64, size: u64, fill: u8) {
    let dst = writer.map_mut(ofs, size).expect("map_mut");
    let header = RecordHeader::new(ts, size);
    dst[..RECORD_HEADER_SIZE].copy_from_slice(&header.to_bytes());
    dst[RECORD_HEADER_SIZE..].fill(fill);
    writer.commit(ofs + size).expect("commit");
}

/// Ten fixed-size records with timestamps 100, 200, ... 1000, written with a
/// 4 KiB segment cap so they span three segments (four, four and two
/// records).
fn seed_records(sock: &Path, stream: &Path) {
    let mut writer = StreamHandle::open(sock, stream, Mode::Writer, 1 << 30).expect("writer open");
    for i in 0..10u64 {
        write_record(&mut writer, i * REC_SIZE, (i + 1) * 100, REC_SIZE, i as u8);
    }
    writer.close(10 * REC_SIZE).expect("writer close");
}

#[test]
fn seek_lands_on_first_record_at_or_past_target() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, handle) = start_broker(dir.path(), 4096);
    let stream = dir.path().join("flows");
    seed_records(&sock, &stream);

    let mut reader = StreamHandle::open(&sock, &stream, Mode::Reader, 0).expect("reader open");

    // before all data: the very first record
    assert_eq!(reader.seek_to_timestamp(1).expect("seek"), Some(0));
    // exact hit
    assert_eq!(reader.seek_to_timestamp(100).expect("seek"), Some(0));
    assert_eq!(
        reader.seek_to_timestamp(500).expect("seek"),
        Some(4 * REC_SIZE)
    );
    // between records: next one wins
    assert_eq!(reader.seek_to_timestamp(150).expect("seek"), Some(REC_SIZE));
    assert_eq!(
        reader.seek_to_timestamp(501).expect("seek"),
        Some(5 * REC_SIZE)
    );
    // last record
    assert_eq!(
        reader.seek_to_timestamp(1000).expect("seek"),
        Some(9 * REC_SIZE)
    );
    // past all data
    assert_eq!(reader.seek_to_timestamp(1001).expect("seek"), None);

    reader.close(0).expect("reader close");
    stop_broker(&sock, handle);
}

#[test]
fn record_at_returns_the_whole_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, handle) = start_broker(dir.path(), 4096);
    let stream = dir.path().join("flows");
    seed_records(&sock, &stream);

    let mut reader = StreamHandle::open(&sock, &stream, Mode::Reader, 0).expect("reader open");
    let ofs = 4 * REC_SIZE;
    let record = reader
        .record_at(ofs)
        .expect("record_at")
        .expect("record present")
        .to_vec();
    assert_eq!(record.len(), REC_SIZE as usize);
    let header = RecordHeader::from_bytes(&record).expect("header");
    assert_eq!(header.timestamp, 500);
    assert_eq!(header.size, REC_SIZE);
    assert!(record[RECORD_HEADER_SIZE..].iter().all(|&b| b == 4));

    reader.close(0).expect("reader close");
    stop_broker(&sock, handle);
}

#[test]
fn zero_timestamp_skips_to_the_next_segment() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, handle) = start_broker(dir.path(), 4096);
    let stream = dir.path().join("flows");

    let mut writer =
        StreamHandle::open(&sock, &stream, Mode::Writer, 1 << 30).expect("writer open");
    // one real record, then a lost-sync filler padding out the segment
    write_record(&mut writer, 0, 100, REC_SIZE, 1);
    write_record(&mut writer, REC_SIZE, 0, 4096 - REC_SIZE, 0);
    // next record forces a rollover and starts the second segment
    write_record(&mut writer, 4096, 300, REC_SIZE, 3);
    writer.close(4096 + REC_SIZE).expect("writer close");

    let mut reader = StreamHandle::open(&sock, &stream, Mode::Reader, 0).expect("reader open");
    // target between the records: the scanner hits the filler, loses sync,
    // and resumes at the next segment
    assert_eq!(reader.seek_to_timestamp(200).expect("seek"), Some(4096));

    reader.close(0).expect("reader close");
    stop_broker(&sock, handle);
}
