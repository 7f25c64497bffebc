//! Message framing over a byte stream
//!
//! Envelope: magic(4) | command(12, NUL padded) | length(4, LE) | checksum(4) | payload

use crate::codec::{CodecError, WireBuffer};
use crate::crypto::checksum;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, RawMessage};

/// Size of the message envelope
pub const HEADER_SIZE: usize = 24;

/// Width of the command field
pub const COMMAND_SIZE: usize = 12;

/// Largest payload accepted from a peer (32 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 32 * 1024 * 1024;

/// Framing errors; every variant ends the connection
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Magic mismatch: expected {}, found {}", hex::encode(expected), hex::encode(found))]
    MagicMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("Checksum mismatch for '{command}'")]
    ChecksumMismatch { command: String },
    #[error("Payload of '{command}' too large: {length} bytes")]
    PayloadTooLarge { command: String, length: usize },
    #[error("Malformed '{command}' payload: {source}")]
    Decode {
        command: String,
        #[source]
        source: CodecError,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    command: String,
    length: usize,
    checksum: [u8; 4],
}

/// tokio-util codec for one network's message stream
#[derive(Debug, Clone)]
pub struct MessageCodec {
    magic: [u8; 4],
}

impl MessageCodec {
    pub fn new(magic: [u8; 4]) -> Self {
        Self { magic }
    }

    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    fn parse_header(&self, src: &[u8]) -> Result<Header, FramingError> {
        let mut found = [0u8; 4];
        found.copy_from_slice(&src[..4]);
        if found != self.magic {
            return Err(FramingError::MagicMismatch {
                expected: self.magic,
                found,
            });
        }

        let mut buf = WireBuffer::wrap(&src[4..HEADER_SIZE]);
        let parse = |buf: &mut WireBuffer| -> Result<Header, CodecError> {
            let command = buf.get_string(COMMAND_SIZE)?;
            let length = buf.get_u32()? as usize;
            let mut checksum = [0u8; 4];
            checksum.copy_from_slice(&buf.get_bytes(4)?);
            Ok(Header {
                command,
                length,
                checksum,
            })
        };
        parse(&mut buf).map_err(|source| FramingError::Decode {
            command: String::new(),
            source,
        })
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Unknown commands are dropped without waiting for another read
        loop {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = self.parse_header(&src[..HEADER_SIZE])?;
            if header.length > MAX_PAYLOAD_SIZE {
                return Err(FramingError::PayloadTooLarge {
                    command: header.command,
                    length: header.length,
                });
            }

            if src.len() < HEADER_SIZE + header.length {
                src.reserve(HEADER_SIZE + header.length - src.len());
                return Ok(None);
            }

            src.advance(HEADER_SIZE);
            let payload = src.split_to(header.length);

            if checksum(&payload) != header.checksum {
                return Err(FramingError::ChecksumMismatch {
                    command: header.command,
                });
            }

            log::debug!("<- {} ({} bytes)", header.command, payload.len());
            log::trace!("<- {} payload {}", header.command, hex::encode(&payload));

            match Message::decode(&header.command, &payload) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => {
                    log::debug!("Ignoring unsupported command '{}'", header.command);
                }
                Err(source) => {
                    return Err(FramingError::Decode {
                        command: header.command,
                        source,
                    });
                }
            }
        }
    }
}

impl Encoder<RawMessage> for MessageCodec {
    type Error = FramingError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = WireBuffer::with_capacity(HEADER_SIZE);
        header.put_bytes(&self.magic);
        header.put_string(&item.command, COMMAND_SIZE);
        header.put_u32(item.payload.len() as u32);
        header.put_bytes(&checksum(&item.payload));

        log::debug!("-> {} ({} bytes)", item.command, item.payload.len());

        dst.reserve(HEADER_SIZE + item.payload.len());
        dst.put_slice(&header.into_bytes());
        dst.put_slice(&item.payload);
        Ok(())
    }
}
