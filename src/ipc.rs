//! Unix-datagram transport between the storage daemon and its clients.
//!
//! One datagram carries exactly one encoded [`Message`]. The server binds a
//! well-known path and replies to the sender address of each request; clients
//! bind a private path next to the server socket so those replies can reach
//! them, then connect for plain send/recv.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::protocol::{Message, Tag, MSG_SIZE};
use crate::{Error, Result};

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Endpoint {
    sock: UnixDatagram,
    path: PathBuf,
}

impl Endpoint {
    /// Bind the server side at `path`, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Endpoint> {
        let _ = std::fs::remove_file(path);
        let sock = UnixDatagram::bind(path)?;
        sock.set_nonblocking(true)?;
        Ok(Endpoint {
            sock,
            path: path.to_path_buf(),
        })
    }

    /// Bind a client endpoint next to `server` and connect to it.
    pub fn connect(server: &Path) -> Result<Endpoint> {
        let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = PathBuf::from(format!(
            "{}.c{}-{}",
            server.display(),
            std::process::id(),
            seq
        ));
        let _ = std::fs::remove_file(&path);
        let sock = UnixDatagram::bind(&path)?;
        sock.connect(server)?;
        Ok(Endpoint { sock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send on a connected (client) endpoint.
    pub fn send(&self, tag: Tag, msg: &Message) -> Result<()> {
        let buf = msg.encode(tag)?;
        self.sock.send(&buf[..])?;
        Ok(())
    }

    /// Send to an explicit peer path (server replies).
    pub fn send_to(&self, peer: &Path, tag: Tag, msg: &Message) -> Result<()> {
        let buf = msg.encode(tag)?;
        self.sock.send_to(&buf[..], peer)?;
        Ok(())
    }

    /// Blocking receive on a connected (client) endpoint.
    pub fn recv(&self) -> Result<(Tag, Message)> {
        let mut buf = vec![0u8; MSG_SIZE];
        let n = self.sock.recv(&mut buf)?;
        Message::decode(&buf[..n])
    }

    /// Non-blocking receive with sender address; `None` when nothing queued.
    pub fn try_recv_from(&self) -> Result<Option<(Tag, Message, PathBuf)>> {
        let mut buf = vec![0u8; MSG_SIZE];
        match self.sock.recv_from(&mut buf) {
            Ok((n, addr)) => {
                let (tag, msg) = Message::decode(&buf[..n])?;
                let peer = addr
                    .as_pathname()
                    .map(Path::to_path_buf)
                    .unwrap_or_default();
                Ok(Some((tag, msg, peer)))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Wait until the socket is readable or `timeout` elapses.
    ///
    /// Returns false on timeout (and on EINTR, which the event loop treats
    /// as a spurious wakeup).
    pub fn wait_readable(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.sock.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = match timeout {
            Some(t) => i32::try_from(t.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        let res = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        Ok(res > 0)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::Endpoint;
    use crate::protocol::{Message, Tag};
    use std::time::Duration;

    #[test]
    fn request_reply_over_datagram_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server_path = dir.path().join("broker.sock");
        let server = Endpoint::bind(&server_path).expect("bind server");
        let client = Endpoint::connect(&server_path).expect("connect client");

        let req = Message {
            id: 3,
            offset: 512,
            ..Default::default()
        };
        client.send(Tag::Region, &req).expect("send request");

        assert!(server
            .wait_readable(Some(Duration::from_secs(1)))
            .expect("poll"));
        let (tag, msg, peer) = server
            .try_recv_from()
            .expect("recv")
            .expect("datagram queued");
        assert_eq!(tag, Tag::Region);
        assert_eq!(msg, req);
        assert_eq!(peer, client.path());

        server
            .send_to(&peer, Tag::Ack, &Message::default())
            .expect("reply");
        let (tag, _) = client.recv().expect("client recv");
        assert_eq!(tag, Tag::Ack);
    }

    #[test]
    fn try_recv_from_is_nonblocking() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = Endpoint::bind(&dir.path().join("broker.sock")).expect("bind");
        assert!(server.try_recv_from().expect("empty").is_none());
    }
}
