//! The binary framing used by the port-forward multiplexer.
//!
//! A single WebSocket carries many logical connections; each frame is
//! prefixed with an 8 byte big-endian header:
//!
//! ```text
//!  0      1      2      3      4      5      6      7      8 ...
//! +------+------+------+------+------+------+------+------+-------+
//! | type | proto|       client_id (u32)     |    port (u16)       | payload
//! +------+------+------+------+------+------+------+------+-------+
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// What a frame means.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Open a logical connection to `port`.
    Connect = 0x01,

    /// The logical connection is established.
    Connected = 0x02,

    /// Payload bytes for an open connection.
    Data = 0x03,

    /// Close a logical connection.
    Close = 0x04,

    /// The connection failed; payload carries a description.
    Error = 0x05,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(Self::Connect),
            0x02 => Ok(Self::Connected),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Close),
            0x05 => Ok(Self::Error),
            other => Err(FrameError::UnknownType(other)),
        }
    }
}

/// Transport protocol of the forwarded connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Proto {
    #[default]
    Tcp = 0x00,
    Udp = 0x01,
}

impl TryFrom<u8> for Proto {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x00 => Ok(Self::Tcp),
            0x01 => Ok(Self::Udp),
            other => Err(FrameError::UnknownProto(other)),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, need at least {HEADER_SIZE}")]
    TooShort(usize),

    #[error("unknown frame type {0:#04x}")]
    UnknownType(u8),

    #[error("unknown protocol {0:#04x}")]
    UnknownProto(u8),
}

/// A parsed tunnel frame.
#[derive(Clone, Debug, PartialEq)]
pub struct TunnelFrame {
    pub frame_type: FrameType,
    pub proto: Proto,

    /// Identifies the logical connection within the shared WebSocket.
    pub client_id: u32,

    /// Target port; only meaningful on `Connect`, zero elsewhere.
    pub port: u16,

    pub payload: Vec<u8>,
}

impl TunnelFrame {
    pub fn new(frame_type: FrameType, proto: Proto, client_id: u32, port: u16, payload: Vec<u8>) -> Self {
        Self { frame_type, proto, client_id, port, payload }
    }

    /// A payload-less frame (CONNECT, CONNECTED, CLOSE).
    pub fn control(frame_type: FrameType, proto: Proto, client_id: u32, port: u16) -> Self {
        Self::new(frame_type, proto, client_id, port, Vec::new())
    }

    pub fn data(proto: Proto, client_id: u32, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Data, proto, client_id, 0, payload)
    }

    /// Serialise to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.push(self.frame_type as u8);
        out.push(self.proto as u8);
        out.extend_from_slice(&self.client_id.to_be_bytes());
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse from the wire format.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_SIZE {
            return Err(FrameError::TooShort(data.len()));
        }
        let frame_type = FrameType::try_from(data[0])?;
        let proto = Proto::try_from(data[1])?;
        let client_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let port = u16::from_be_bytes([data[6], data[7]]);
        Ok(Self { frame_type, proto, client_id, port, payload: data[HEADER_SIZE..].to_vec() })
    }
}
