use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use std::io::{Cursor, Error, ErrorKind, Read};

/// A peer wire message. On the wire every message is a 4-byte big-endian
/// length prefix followed by a one-byte id and the payload; a zero length
/// prefix is a keep-alive.
#[derive(Debug, PartialEq, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(u32, u32, u32),
    Piece(u32, u32, Bytes),
    Cancel(u32, u32, u32),
    Port(u16),
}

impl Message {
    /// Encodes the message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        // infallible: Vec<u8> writes cannot error
        let _ = match self {
            Message::KeepAlive => buf.write_u32::<BigEndian>(0),
            Message::Choke => Self::write_header(&mut buf, 0, 0),
            Message::Unchoke => Self::write_header(&mut buf, 1, 0),
            Message::Interested => Self::write_header(&mut buf, 2, 0),
            Message::NotInterested => Self::write_header(&mut buf, 3, 0),
            Message::Have(index) => {
                let _ = Self::write_header(&mut buf, 4, 4);
                buf.write_u32::<BigEndian>(*index)
            }
            Message::Bitfield(payload) => {
                let _ = Self::write_header(&mut buf, 5, payload.len() as u32);
                buf.extend_from_slice(payload);
                Ok(())
            }
            Message::Request(index, begin, length) => {
                let _ = Self::write_header(&mut buf, 6, 12);
                let _ = buf.write_u32::<BigEndian>(*index);
                let _ = buf.write_u32::<BigEndian>(*begin);
                buf.write_u32::<BigEndian>(*length)
            }
            Message::Piece(index, begin, data) => {
                let _ = Self::write_header(&mut buf, 7, 8 + data.len() as u32);
                let _ = buf.write_u32::<BigEndian>(*index);
                let _ = buf.write_u32::<BigEndian>(*begin);
                buf.extend_from_slice(data);
                Ok(())
            }
            Message::Cancel(index, begin, length) => {
                let _ = Self::write_header(&mut buf, 8, 12);
                let _ = buf.write_u32::<BigEndian>(*index);
                let _ = buf.write_u32::<BigEndian>(*begin);
                buf.write_u32::<BigEndian>(*length)
            }
            Message::Port(port) => {
                let _ = Self::write_header(&mut buf, 9, 2);
                buf.write_u16::<BigEndian>(*port)
            }
        };
        buf
    }

    fn write_header(buf: &mut Vec<u8>, id: u8, payload_len: u32) -> std::io::Result<()> {
        buf.write_u32::<BigEndian>(payload_len + 1)?;
        buf.push(id);
        Ok(())
    }

    /// Decodes one frame, i.e. the bytes after the length prefix. An empty
    /// frame is a keep-alive.
    pub fn deserialize(frame: &[u8]) -> Result<Message, Error> {
        if frame.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let mut cursor = Cursor::new(&frame[1..]);
        let payload_len = frame.len() - 1;
        let expect = |want: usize| -> Result<(), Error> {
            if payload_len != want {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("message {} has payload of {} bytes, want {}", frame[0], payload_len, want),
                ));
            }
            Ok(())
        };
        let msg = match frame[0] {
            0 => {
                expect(0)?;
                Message::Choke
            }
            1 => {
                expect(0)?;
                Message::Unchoke
            }
            2 => {
                expect(0)?;
                Message::Interested
            }
            3 => {
                expect(0)?;
                Message::NotInterested
            }
            4 => {
                expect(4)?;
                Message::Have(cursor.read_u32::<BigEndian>()?)
            }
            5 => Message::Bitfield(frame[1..].to_vec()),
            6 => {
                expect(12)?;
                Message::Request(
                    cursor.read_u32::<BigEndian>()?,
                    cursor.read_u32::<BigEndian>()?,
                    cursor.read_u32::<BigEndian>()?,
                )
            }
            7 => {
                if payload_len < 8 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "piece message shorter than its fixed fields",
                    ));
                }
                let index = cursor.read_u32::<BigEndian>()?;
                let begin = cursor.read_u32::<BigEndian>()?;
                let mut data = Vec::with_capacity(payload_len - 8);
                cursor.read_to_end(&mut data)?;
                Message::Piece(index, begin, Bytes::from(data))
            }
            8 => {
                expect(12)?;
                Message::Cancel(
                    cursor.read_u32::<BigEndian>()?,
                    cursor.read_u32::<BigEndian>()?,
                    cursor.read_u32::<BigEndian>()?,
                )
            }
            9 => {
                expect(2)?;
                Message::Port(cursor.read_u16::<BigEndian>()?)
            }
            id => {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    format!("unknown message id {}", id),
                ))
            }
        };
        Ok(msg)
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(..) => "request",
            Message::Piece(..) => "piece",
            Message::Cancel(..) => "cancel",
            Message::Port(_) => "port",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let bytes = msg.serialize();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(Message::deserialize(&bytes[4..]).unwrap(), msg);
    }

    #[test]
    fn test_keep_alive() {
        assert_eq!(Message::KeepAlive.serialize(), vec![0, 0, 0, 0]);
        assert_eq!(Message::deserialize(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn test_have_wire_format() {
        assert_eq!(
            Message::Have(3).serialize(),
            vec![0, 0, 0, 5, 4, 0, 0, 0, 3]
        );
    }

    #[test]
    fn test_round_trips() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0b1010_0000]));
        round_trip(Message::Request(1, 16384, 16384));
        round_trip(Message::Piece(1, 0, Bytes::from_static(b"chunk")));
        round_trip(Message::Cancel(1, 16384, 16384));
        round_trip(Message::Port(6881));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(Message::deserialize(&[4, 0, 0]).is_err()); // short have
        assert!(Message::deserialize(&[6, 0]).is_err()); // short request
        assert!(Message::deserialize(&[7, 0, 0, 0, 0]).is_err()); // short piece
        assert!(Message::deserialize(&[99]).is_err()); // unknown id
    }
}
