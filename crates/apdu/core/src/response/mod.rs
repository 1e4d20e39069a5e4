//! Response handling for wrapped native commands

pub mod status;

use bytes::Bytes;

use crate::{Error, Result};
use status::StatusWord;

/// A single response frame: payload followed by a two byte status word
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Bytes,
    status: StatusWord,
}

impl Response {
    /// Create a response from its parts
    pub const fn new(payload: Bytes, status: StatusWord) -> Self {
        Self { payload, status }
    }

    /// Parse a raw response frame
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::MalformedResponse("response shorter than status word"));
        }
        let split = data.len() - 2;
        Ok(Self {
            payload: Bytes::copy_from_slice(&data[..split]),
            status: StatusWord::new(data[split], data[split + 1]),
        })
    }

    /// Response payload without the status word
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the response and return its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Status word of this frame
    pub const fn status(&self) -> StatusWord {
        self.status
    }

    /// Whether this frame ends the exchange successfully
    pub const fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Whether the card has more frames or expects more data
    pub const fn is_additional_frame(&self) -> bool {
        self.status.is_additional_frame()
    }
}

impl TryFrom<Bytes> for Response {
    type Error = Error;

    fn try_from(value: Bytes) -> Result<Self> {
        if value.len() < 2 {
            return Err(Error::MalformedResponse("response shorter than status word"));
        }
        let split = value.len() - 2;
        let status = StatusWord::new(value[split], value[split + 1]);
        Ok(Self {
            payload: value.slice(..split),
            status,
        })
    }
}
