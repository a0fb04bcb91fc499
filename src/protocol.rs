//! Wire format of the broker IPC.
//!
//! Every datagram is one fixed-layout message: a 16-bit tag followed by
//! `{ id: i32, arg: i32, offset: i64, size: i64, name: [u8; NAME_MAX] }`,
//! all little-endian, name NUL-padded. Fields unused by a tag are zero.

use crate::{Error, Result};

/// Fixed size of the name field (one datagram carries at most one path).
pub const NAME_MAX: usize = 4096;

/// Offset of the name field inside an encoded message.
const NAME_OFFSET: usize = 26;

/// Total encoded size of a message.
pub const MSG_SIZE: usize = NAME_OFFSET + NAME_MAX;

/// Message tags. The base value is deliberately outside the small-integer
/// range so stray datagrams fail decoding instead of parsing as requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    Error = 0x7341,
    Ack,
    Open,
    Close,
    Region,
    Seek,
    Inform,
    /// Supervisor-initiated clean shutdown.
    Exit,
}

impl Tag {
    pub fn from_u16(value: u16) -> Option<Tag> {
        match value {
            v if v == Tag::Error as u16 => Some(Tag::Error),
            v if v == Tag::Ack as u16 => Some(Tag::Ack),
            v if v == Tag::Open as u16 => Some(Tag::Open),
            v if v == Tag::Close as u16 => Some(Tag::Close),
            v if v == Tag::Region as u16 => Some(Tag::Region),
            v if v == Tag::Seek as u16 => Some(Tag::Seek),
            v if v == Tag::Inform as u16 => Some(Tag::Inform),
            v if v == Tag::Exit as u16 => Some(Tag::Exit),
            _ => None,
        }
    }
}

/// Access mode requested in an OPEN message, carried in `arg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Reader,
    ReaderNoBlock,
    Writer,
}

impl Mode {
    pub fn as_arg(self) -> i32 {
        match self {
            Mode::Reader => 1,
            Mode::ReaderNoBlock => 2,
            Mode::Writer => 3,
        }
    }

    pub fn from_arg(value: i32) -> Option<Mode> {
        match value {
            1 => Some(Mode::Reader),
            2 => Some(Mode::ReaderNoBlock),
            3 => Some(Mode::Writer),
            _ => None,
        }
    }
}

/// Direction of a SEEK, carried in `arg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekDir {
    Next,
    Prev,
}

impl SeekDir {
    pub fn as_arg(self) -> i32 {
        match self {
            SeekDir::Next => 1,
            SeekDir::Prev => 2,
        }
    }

    pub fn from_arg(value: i32) -> Option<SeekDir> {
        match value {
            1 => Some(SeekDir::Next),
            2 => Some(SeekDir::Prev),
            _ => None,
        }
    }
}

/// Payload shared by every message tag.
///
/// `id` is the client id assigned at OPEN. `arg` is overloaded per tag:
/// open mode, seek direction, or errno in ERROR replies. `offset` and
/// `size` are bytestream coordinates; ACK uses them for the granted
/// segment base and region size. `name` is only set in OPEN.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: i32,
    pub arg: i32,
    pub offset: i64,
    pub size: i64,
    pub name: String,
}

impl Message {
    pub fn encode(&self, tag: Tag) -> Result<Box<[u8; MSG_SIZE]>> {
        if self.name.len() >= NAME_MAX {
            return Err(Error::Protocol("stream name too long"));
        }
        let mut buf = vec![0u8; MSG_SIZE].into_boxed_slice();
        buf[0..2].copy_from_slice(&(tag as u16).to_le_bytes());
        buf[2..6].copy_from_slice(&self.id.to_le_bytes());
        buf[6..10].copy_from_slice(&self.arg.to_le_bytes());
        buf[10..18].copy_from_slice(&self.offset.to_le_bytes());
        buf[18..26].copy_from_slice(&self.size.to_le_bytes());
        buf[NAME_OFFSET..NAME_OFFSET + self.name.len()].copy_from_slice(self.name.as_bytes());
        Ok(buf.try_into().expect("buffer sized as MSG_SIZE"))
    }

    pub fn decode(buf: &[u8]) -> Result<(Tag, Message)> {
        if buf.len() != MSG_SIZE {
            return Err(Error::Protocol("short datagram"));
        }
        let tag = u16::from_le_bytes(buf[0..2].try_into().expect("slice length"));
        let tag = Tag::from_u16(tag).ok_or(Error::Protocol("unknown message tag"))?;
        let id = i32::from_le_bytes(buf[2..6].try_into().expect("slice length"));
        let arg = i32::from_le_bytes(buf[6..10].try_into().expect("slice length"));
        let offset = i64::from_le_bytes(buf[10..18].try_into().expect("slice length"));
        let size = i64::from_le_bytes(buf[18..26].try_into().expect("slice length"));
        let name_bytes = &buf[NAME_OFFSET..];
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_MAX - 1);
        let name = std::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| Error::Protocol("stream name is not valid UTF-8"))?
            .to_string();
        Ok((
            tag,
            Message {
                id,
                arg,
                offset,
                size,
                name,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{Message, Mode, SeekDir, Tag, MSG_SIZE};

    #[test]
    fn message_round_trip() {
        let msg = Message {
            id: 17,
            arg: Mode::Writer.as_arg(),
            offset: 0x1_0000_0000,
            size: 4096,
            name: "/tmp/streams/flows".to_string(),
        };
        let buf = msg.encode(Tag::Open).expect("encode");
        assert_eq!(buf.len(), MSG_SIZE);
        let (tag, decoded) = Message::decode(&buf[..]).expect("decode");
        assert_eq!(tag, Tag::Open);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let msg = Message::default();
        let mut buf = msg.encode(Tag::Ack).expect("encode");
        buf[0] = 0;
        buf[1] = 0;
        assert!(Message::decode(&buf[..]).is_err());
    }

    #[test]
    fn short_datagram_is_rejected() {
        assert!(Message::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn mode_and_seek_args_round_trip() {
        for mode in [Mode::Reader, Mode::ReaderNoBlock, Mode::Writer] {
            assert_eq!(Mode::from_arg(mode.as_arg()), Some(mode));
        }
        for dir in [SeekDir::Next, SeekDir::Prev] {
            assert_eq!(SeekDir::from_arg(dir.as_arg()), Some(dir));
        }
        assert_eq!(Mode::from_arg(0), None);
        assert_eq!(SeekDir::from_arg(9), None);
    }
}
