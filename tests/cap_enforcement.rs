use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use streambroker::ipc::Endpoint;
use streambroker::protocol::{Message, Tag};
use streambroker::{Error, Mode, Server, ServerConfig, StreamHandle};

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

fn wait_until_gone(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while path.exists() {
        assert!(
            Instant::now() < deadline,
            "{} still exists after the scheduler deadline",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn write_three_segments(writer: &mut StreamHandle) {
    for (i, fill) in [b'a', b'b', b'c'].into_iter().enumerate() {
        let ofs = i as u64 * 4096;
        writer.map_mut(ofs, 4096).expect("map_mut").fill(fill);
        writer.commit(ofs + 4096).expect("commit");
    }
}

#[test]
fn oldest_segment_is_deleted_once_over_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, handle) = start_broker(dir.path(), 4096);
    let stream = dir.path().join("flows");

    // cap 8 KiB, then write 12 KiB: one segment over
    let mut writer = StreamHandle::open(&sock, &stream, Mode::Writer, 8192).expect("writer open");
    write_three_segments(&mut writer);

    wait_until_gone(&stream.join("0000000000000000"));
    let remaining: u64 = std::fs::read_dir(&stream)
        .expect("stream dir")
        .map(|entry| entry.expect("entry").metadata().expect("metadata").len())
        .sum();
    assert_eq!(remaining, 8192);

    // a fresh reader starts at the new first segment
    let mut reader = StreamHandle::open(&sock, &stream, Mode::Reader, 0).expect("reader open");
    assert_eq!(reader.offset(), 4096);
    assert!(matches!(reader.map(0, 10), Err(Error::NoData)));
    let bytes = reader.map(4096, 100).expect("map").expect("data");
    assert!(bytes.iter().all(|&b| b == b'b'));

    reader.close(0).expect("reader close");
    writer.close(12288).expect("writer close");
    stop_broker(&sock, handle);
}

#[test]
fn lagging_reader_is_forcibly_detached_past_hard_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (sock, handle) = start_broker(dir.path(), 4096);
    let stream = dir.path().join("flows");

    let mut writer = StreamHandle::open(&sock, &stream, Mode::Writer, 8192).expect("writer open");
    writer.map_mut(0, 4096).expect("map_mut").fill(b'a');
    writer.commit(4096).expect("commit");

    // park a reader on the oldest segment
    let mut reader = StreamHandle::open(&sock, &stream, Mode::Reader, 0).expect("reader open");
    assert!(reader.map(0, 100).expect("map").is_some());

    // 12 KiB committed is past cap * 1.2, so the reader no longer protects
    // the oldest segment
    writer.map_mut(4096, 4096).expect("map_mut").fill(b'b');
    writer.commit(8192).expect("commit");
    writer.map_mut(8192, 4096).expect("map_mut").fill(b'c');
    writer.commit(12288).expect("commit");

    wait_until_gone(&stream.join("0000000000000000"));

    // the detached reader's next request below the window fails cleanly
    assert!(matches!(reader.map(0, 5000), Err(Error::NoData)));
    // but the stream itself is still usable
    let bytes = reader.map(4096, 100).expect("map").expect("data");
    assert!(bytes.iter().all(|&b| b == b'b'));

    reader.close(0).expect("reader close");
    writer.close(12288).expect("writer close");
    stop_broker(&sock, handle);
}
