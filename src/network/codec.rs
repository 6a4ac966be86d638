//! Line framing for messages
//!
//! Each record is one JSON envelope followed by `\r\n`. Partial records stay
//! buffered until their terminator arrives.

use crate::network::message::Message;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Record terminator
pub const DELIMITER: &[u8] = b"\r\n";

/// Largest accepted record, terminator excluded
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Message codec for `\r\n` delimited JSON records
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Bytes already scanned for a terminator
    scanned: usize,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item.to_bytes().map_err(|e| invalid_data(e.to_string()))?;
        if data.len() > MAX_FRAME_LEN {
            return Err(invalid_data(format!(
                "Frame too large: {} bytes (max: {})",
                data.len(),
                MAX_FRAME_LEN
            )));
        }

        dst.reserve(data.len() + DELIMITER.len());
        dst.put_slice(&data);
        dst.put_slice(DELIMITER);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // A '\r' at the end of the previous scan may pair with a new '\n'
            let start = self.scanned.saturating_sub(DELIMITER.len() - 1);
            let found = src[start..]
                .windows(DELIMITER.len())
                .position(|w| w == DELIMITER)
                .map(|pos| start + pos);

            let Some(end) = found else {
                if src.len() > MAX_FRAME_LEN {
                    return Err(invalid_data(format!(
                        "Frame exceeds {} bytes without terminator",
                        MAX_FRAME_LEN
                    )));
                }
                self.scanned = src.len();
                return Ok(None);
            };

            self.scanned = 0;
            let record = src.split_to(end);
            src.advance(DELIMITER.len());

            if record.len() > MAX_FRAME_LEN {
                return Err(invalid_data("Frame too large"));
            }
            // Blank records carry nothing
            if record.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let msg = Message::from_bytes(&record).map_err(|e| invalid_data(e.to_string()))?;
            return Ok(Some(msg));
        }
    }
}
