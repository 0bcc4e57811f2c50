use std::error;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::result::Result;

use bgp_rs::{Capabilities, Message, Reader};
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

const HEADER_LEN: usize = 19;
const MIN_MESSAGE_LEN: u16 = 19;
const MAX_MESSAGE_LEN: u16 = 4096;

/// Header-level framing violations, policed before a message is handed to
/// `bgp-rs` for body decoding. Each maps onto a specific NOTIFICATION(1,x)
/// (Message Header Error) in `Session`/`SessionManager`.
#[derive(Debug)]
pub enum FramingError {
    /// Marker octets were not all ones.
    NotSynchronized,
    /// Total length outside `[19, 4096]`.
    BadLength(u16),
    /// Type byte wasn't OPEN/UPDATE/NOTIFICATION/KEEPALIVE.
    BadType(u8),
}

impl fmt::Display for FramingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FramingError::NotSynchronized => write!(f, "Connection Not Synchronized: bad marker"),
            FramingError::BadLength(len) => write!(f, "Bad Message Length: {}", len),
            FramingError::BadType(kind) => write!(f, "Bad Message Type: {}", kind),
        }
    }
}

impl error::Error for FramingError {}

impl FramingError {
    /// Downcast a `std::io::Error` produced by this codec's `decode` back
    /// into the specific framing violation it carries, if any.
    pub fn from_io_error(err: &Error) -> Option<&FramingError> {
        err.get_ref().and_then(|e| e.downcast_ref::<FramingError>())
    }

    fn into_io_error(self) -> Error {
        Error::new(ErrorKind::InvalidData, self)
    }
}

#[derive(Debug, Default)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> Self {
        Self
    }

    fn get_reader<T>(&self, stream: T) -> Reader<T, Capabilities>
    where
        T: std::io::Read,
    {
        Reader::<T, Capabilities>::new(stream)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    // Police the 19-octet header (marker, length, type) before handing the
    // body to bgp-rs; tolerates arbitrary TCP fragmentation by returning
    // Ok(None) ("not enough data yet") until a full header/message arrives.
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        if buf.len() < 16 {
            return Ok(None);
        }
        if buf[..16] != [0xFFu8; 16][..] {
            return Err(FramingError::NotSynchronized.into_io_error());
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([buf[16], buf[17]]);
        if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&length) {
            return Err(FramingError::BadLength(length).into_io_error());
        }
        let msg_type = buf[18];
        if !(1..=4).contains(&msg_type) {
            return Err(FramingError::BadType(msg_type).into_io_error());
        }
        if buf.len() < length as usize {
            return Ok(None);
        }
        let mut reader = self.get_reader(&buf[..length as usize]);
        let (_header, message) = reader.read()?;
        buf.advance(length as usize);
        Ok(Some(message))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        message.encode(&mut buf.writer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keepalive_bytes() -> Vec<u8> {
        let mut buf = vec![0xFFu8; 16];
        buf.extend_from_slice(&19u16.to_be_bytes());
        buf.push(4); // KEEPALIVE
        buf
    }

    #[test]
    fn test_decode_needs_more_data() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&[0xFFu8; 10][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_waits_for_full_header() {
        let mut codec = MessageCodec::new();
        // 16 marker octets + 1 length octet: not enough to read length/type yet.
        let mut buf = BytesMut::from(&[0xFFu8; 17][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_bad_marker() {
        let mut codec = MessageCodec::new();
        let mut data = vec![0xFFu8; 16];
        data[15] = 0x00;
        let mut buf = BytesMut::from(&data[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            FramingError::from_io_error(&err),
            Some(FramingError::NotSynchronized)
        ));
    }

    #[test]
    fn test_decode_bad_length_too_short() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&keepalive_bytes()[..]);
        buf[16..18].copy_from_slice(&10u16.to_be_bytes());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            FramingError::from_io_error(&err),
            Some(FramingError::BadLength(10))
        ));
    }

    #[test]
    fn test_decode_bad_length_too_long() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&keepalive_bytes()[..]);
        buf[16..18].copy_from_slice(&4097u16.to_be_bytes());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            FramingError::from_io_error(&err),
            Some(FramingError::BadLength(4097))
        ));
    }

    #[test]
    fn test_decode_bad_type() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&keepalive_bytes()[..]);
        buf[18] = 9;
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            FramingError::from_io_error(&err),
            Some(FramingError::BadType(9))
        ));
    }

    #[test]
    fn test_decode_valid_keepalive() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&keepalive_bytes()[..]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(message, Message::KeepAlive));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_consumes_exactly_one_message() {
        let mut codec = MessageCodec::new();
        let mut bytes = keepalive_bytes();
        bytes.extend_from_slice(&keepalive_bytes());
        let mut buf = BytesMut::from(&bytes[..]);
        let message = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(message, Message::KeepAlive));
        assert_eq!(buf.len(), 19);
    }
}
