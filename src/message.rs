//! # Peer Wire Messages
//!
//! After the handshake, all peer traffic is length-prefixed frames:
//!
//! ```text
//! <length: u32 big-endian><id: u8><payload>
//! ```
//!
//! A length of zero is a keep-alive and carries neither id nor payload.
//!
//! | ID | Name           | Payload                          |
//! |----|----------------|----------------------------------|
//! | 0  | choke          | empty                            |
//! | 1  | unchoke        | empty                            |
//! | 2  | interested     | empty                            |
//! | 3  | not interested | empty                            |
//! | 4  | have           | piece index (u32)                |
//! | 5  | bitfield       | packed bit array                 |
//! | 6  | request        | index, begin, length (u32 each)  |
//! | 7  | piece          | index, begin, block bytes        |
//! | 8  | cancel         | index, begin, length (u32 each)  |

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

use std::io::{Cursor, Read};

pub type MessageId = u8;

pub const MESSAGE_CHOKE: MessageId = 0;
pub const MESSAGE_UNCHOKE: MessageId = 1;
pub const MESSAGE_INTERESTED: MessageId = 2;
pub const MESSAGE_NOT_INTERESTED: MessageId = 3;
pub const MESSAGE_HAVE: MessageId = 4;
pub const MESSAGE_BITFIELD: MessageId = 5;
pub const MESSAGE_REQUEST: MessageId = 6;
pub const MESSAGE_PIECE: MessageId = 7;
pub const MESSAGE_CANCEL: MessageId = 8;

// Upper bound on an accepted frame: a block is 16 KiB, bitfields are tiny,
// so anything past this is a hostile length prefix, not a real message.
const MESSAGE_LEN_MAX: u32 = 128 * 1024;

/// One peer wire message: id plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

/// A decoded `piece` payload borrowing the block bytes.
#[derive(Debug, PartialEq, Eq)]
pub struct PieceBlock<'a> {
    pub index: u32,
    pub begin: u32,
    pub block: &'a [u8],
}

impl Message {
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    /// Build a `request` for one block.
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        Message::new_with_payload(MESSAGE_REQUEST, block_payload(index, begin, length))
    }

    /// Build a `cancel` for a previously requested block.
    #[allow(dead_code)]
    pub fn cancel(index: u32, begin: u32, length: u32) -> Message {
        Message::new_with_payload(MESSAGE_CANCEL, block_payload(index, begin, length))
    }

    /// Build a `have` announcing a verified piece.
    pub fn have(index: u32) -> Message {
        Message::new_with_payload(MESSAGE_HAVE, index.to_be_bytes().to_vec())
    }

    /// Serialize with the 4-byte big-endian length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 1 + self.payload.len());
        buf.extend_from_slice(&(1 + self.payload.len() as u32).to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Read one framed message; `Ok(None)` is a keep-alive.
    ///
    /// # Errors
    ///
    /// Fails on stream errors and on length prefixes past the frame cap.
    pub fn read<R: Read>(reader: &mut R) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        reader
            .read_exact(&mut len_buf)
            .map_err(|_| anyhow!("could not read message length from peer"))?;
        let len = u32::from_be_bytes(len_buf);

        if len == 0 {
            return Ok(None);
        }
        if len > MESSAGE_LEN_MAX {
            return Err(anyhow!("peer sent oversized message of {} bytes", len));
        }

        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .map_err(|_| anyhow!("could not read message body from peer"))?;

        Ok(Some(Message {
            id: buf[0],
            payload: buf[1..].to_vec(),
        }))
    }

    /// Decode a `have` payload into its piece index.
    pub fn parse_have(&self) -> Result<u32> {
        if self.id != MESSAGE_HAVE || self.payload.len() != 4 {
            return Err(anyhow!("received invalid have message from peer"));
        }
        let mut cursor = Cursor::new(&self.payload);
        Ok(cursor.read_u32::<BigEndian>()?)
    }

    /// Decode a `piece` payload into index, begin and the block bytes.
    pub fn parse_piece(&self) -> Result<PieceBlock<'_>> {
        if self.id != MESSAGE_PIECE || self.payload.len() < 8 {
            return Err(anyhow!("received invalid piece message from peer"));
        }
        let mut cursor = Cursor::new(&self.payload[..8]);
        let index = cursor.read_u32::<BigEndian>()?;
        let begin = cursor.read_u32::<BigEndian>()?;
        Ok(PieceBlock {
            index,
            begin,
            block: &self.payload[8..],
        })
    }
}

fn block_payload(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request() {
        let buf = Message::request(1, 16384, 16384).serialize();
        assert_eq!(buf.len(), 4 + 1 + 12);
        assert_eq!(&buf[0..4], &[0, 0, 0, 13]);
        assert_eq!(buf[4], MESSAGE_REQUEST);
        assert_eq!(&buf[5..9], &[0, 0, 0, 1]);
        assert_eq!(&buf[9..13], &[0, 0, 64, 0]);
        assert_eq!(&buf[13..17], &[0, 0, 64, 0]);
    }

    #[test]
    fn read_round_trips() {
        let message = Message::new_with_payload(MESSAGE_PIECE, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let mut stream = Cursor::new(message.serialize());
        assert_eq!(Message::read(&mut stream).unwrap(), Some(message));
    }

    #[test]
    fn read_keep_alive() {
        let mut stream = Cursor::new(vec![0, 0, 0, 0]);
        assert_eq!(Message::read(&mut stream).unwrap(), None);
    }

    #[test]
    fn read_rejects_oversized_frame() {
        let mut stream = Cursor::new(vec![0xff, 0xff, 0xff, 0xff]);
        assert!(Message::read(&mut stream).is_err());
    }

    #[test]
    fn read_rejects_truncated_body() {
        let mut stream = Cursor::new(vec![0, 0, 0, 5, 7]);
        assert!(Message::read(&mut stream).is_err());
    }

    #[test]
    fn parse_have_index() {
        assert_eq!(Message::have(42).parse_have().unwrap(), 42);
        assert!(Message::new(MESSAGE_CHOKE).parse_have().is_err());
        let ragged = Message::new_with_payload(MESSAGE_HAVE, vec![0, 0, 1]);
        assert!(ragged.parse_have().is_err());
    }

    #[test]
    fn parse_piece_block() {
        let mut payload = vec![0, 0, 0, 2, 0, 0, 64, 0];
        payload.extend_from_slice(b"data");
        let message = Message::new_with_payload(MESSAGE_PIECE, payload);
        let block = message.parse_piece().unwrap();
        assert_eq!(block.index, 2);
        assert_eq!(block.begin, 16384);
        assert_eq!(block.block, b"data");

        let short = Message::new_with_payload(MESSAGE_PIECE, vec![0; 7]);
        assert!(short.parse_piece().is_err());
    }
}
