// Length-prefixed wire framing shared by the proxy and its test tooling.
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub mod command;
pub mod frame_io;
pub mod topic;
pub mod url;

pub use command::{Command, ErrorKind, LookupType, SchemaData, PROTOCOL_VERSION};
pub use frame_io::{read_command, read_frame, write_command, write_frame};
pub use topic::TopicName;
pub use url::BrokerUrl;

/// Upper bound on a single frame unless a caller supplies its own cap.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("command decode: {0}")]
    Decode(String),
    #[error("command encode: {0}")]
    Encode(String),
    #[error("invalid topic name: {0}")]
    InvalidTopic(String),
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded frame: the command bytes plus an optional opaque payload.
///
/// On the wire a frame is
/// `u32 total_size | u32 command_size | command | [payload]`, both integers
/// big-endian. `total_size` counts everything after itself.
///
/// ```
/// use bytes::Bytes;
/// use egret_wire::Frame;
///
/// let frame = Frame::new(Bytes::from_static(b"{}"), Bytes::from_static(b"body")).expect("frame");
/// let decoded = Frame::decode(frame.encode()).expect("decode");
/// assert_eq!(decoded.payload, Bytes::from_static(b"body"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Bytes,
    pub payload: Bytes,
}

impl Frame {
    /// Size of the two length prefixes.
    pub const PREFIX_LEN: usize = 8;

    pub fn new(command: Bytes, payload: Bytes) -> Result<Self> {
        // Both sizes ride in u32 fields; reject anything that cannot.
        let total = 4 + command.len() + payload.len();
        if command.len() > u32::MAX as usize || total > u32::MAX as usize {
            return Err(Error::FrameTooLarge(total));
        }
        Ok(Self { command, payload })
    }

    /// Bytes this frame occupies once encoded, prefixes included.
    pub fn encoded_len(&self) -> usize {
        Self::PREFIX_LEN + self.command.len() + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let total = (4 + self.command.len() + self.payload.len()) as u32;
        buf.put_u32(total);
        buf.put_u32(self.command.len() as u32);
        buf.extend_from_slice(&self.command);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode a frame from a buffer that holds exactly one encoded frame.
    pub fn decode(mut input: Bytes) -> Result<Self> {
        if input.len() < Self::PREFIX_LEN {
            return Err(Error::Incomplete);
        }
        let total = input.get_u32() as usize;
        if total < 4 || input.len() < total {
            return Err(Error::Incomplete);
        }
        let command_size = input.get_u32() as usize;
        if command_size > total - 4 {
            return Err(Error::Malformed("command size exceeds frame"));
        }
        let command = input.slice(0..command_size);
        let payload = input.slice(command_size..total - 4);
        Ok(Self { command, payload })
    }

    /// Total encoded length of the next frame in `buf`, if the length prefix
    /// has arrived. Used by streaming decoders to wait for the full frame.
    pub fn peek_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < 4 {
            return None;
        }
        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        Some(4 + total)
    }
}
