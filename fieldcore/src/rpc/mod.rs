/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Remote procedure calls carried over ePacket interfaces.
//!
//! ```text
//!   RpcClient ──RpcCmd──────────────► ServerQueues ─► RpcServer::run
//!       ▲     ──RpcData─────────────►      │               │
//!       │                                  │         CommandRunner ─► handler
//!       └──── RpcRsp / RpcDataAck ◄────────┴──────── PacketSink ◄──────┘
//! ```
//!
//! All multi-byte wire fields are little-endian and the headers are packed.

pub mod client;
pub mod command_runner;
pub mod commands;
pub mod interface;
pub mod server;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::errno;

pub use client::{RpcClient, RpcClientResponse};
pub use command_runner::{
    early_response, CommandHandler, CommandRegistry, CommandRequest, CommandRunner,
    RequestContext, RpcResponse,
};
pub use interface::{ChannelInterface, PacketSink, SendError};
pub use server::{DataChannel, RpcData, RpcServer, ServerQueues};

// ── Built-in command IDs ──────────────────────────────────────────────────────

pub const RPC_ID_ECHO: u16 = 32767;
pub const RPC_ID_DATA_RECEIVER: u16 = 32766;
pub const RPC_ID_DATA_SENDER: u16 = 32765;

// ── Device command IDs ────────────────────────────────────────────────────────

pub const RPC_ID_DATA_LOGGER_READ: u16 = 13;
pub const RPC_ID_STATES_QUERY: u16 = 20;

/// Maximum offsets carried by one `RpcDataAck`.
pub const MAX_ACK_PERIOD: usize = 8;

// ── Packet metadata ───────────────────────────────────────────────────────────

/// ePacket payload type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Tdf = 0,
    RpcCmd = 1,
    RpcData = 2,
    RpcDataAck = 3,
    RpcRsp = 4,
}

/// Authentication level a packet was received or is sent with.
///
/// Ordered so that `Device > Network > Failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Auth {
    /// Decryption failed.
    Failure = 0,
    Network = 1,
    Device = 2,
}

/// Interface specific peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Address(pub u64);

impl Address {
    /// Every peer on the interface.
    pub const ALL: Address = Address(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub packet_type: PacketType,
    pub auth: Auth,
    pub address: Address,
}

/// An outbound (or not yet attributed) packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub meta: PacketMeta,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, auth: Auth, address: Address, payload: Vec<u8>) -> Self {
        Self {
            meta: PacketMeta {
                packet_type,
                auth,
                address,
            },
            payload,
        }
    }
}

/// A received packet together with the interface it arrived on.
#[derive(Clone)]
pub struct RxPacket {
    pub meta: PacketMeta,
    pub interface: Arc<dyn PacketSink>,
    pub payload: Vec<u8>,
}

impl RxPacket {
    pub fn new(packet: Packet, interface: Arc<dyn PacketSink>) -> Self {
        Self {
            meta: packet.meta,
            interface,
            payload: packet.payload,
        }
    }
}

impl fmt::Debug for RxPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxPacket")
            .field("meta", &self.meta)
            .field("interface", &self.interface.name())
            .field("len", &self.payload.len())
            .finish()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{what} truncated: need {need} bytes, have {have}")]
pub struct WireError {
    pub what: &'static str,
    pub need: usize,
    pub have: usize,
}

impl WireError {
    pub fn errno(&self) -> i32 {
        -errno::EINVAL
    }
}

fn need(what: &'static str, buf: &[u8], len: usize) -> Result<(), WireError> {
    if buf.len() < len {
        return Err(WireError {
            what,
            need: len,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Failures surfaced by the RPC server and client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("timed out waiting for data at offset {expected:#010x}")]
    DataTimeout { expected: u32 },

    #[error("unaligned data offset {offset:#010x}")]
    UnalignedOffset { offset: u32 },

    #[error("data at offset {offset:#010x}, expected {expected:#010x}")]
    OffsetMismatch { offset: u32, expected: u32 },

    #[error("received {received} bytes with only {remaining} outstanding")]
    TooMuchData { received: usize, remaining: u32 },

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("server data queue closed")]
    Closed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("no command context available")]
    NoContext,

    #[error("no pending request {0:#010x}")]
    UnknownRequest(u32),

    #[error("command {0} already registered")]
    DuplicateCommand(u16),

    #[error("no response before timeout")]
    TimedOut,
}

impl RpcError {
    pub fn errno(&self) -> i32 {
        match self {
            RpcError::DataTimeout { .. } => -errno::EAGAIN,
            RpcError::NoContext => -errno::EAGAIN,
            RpcError::UnalignedOffset { .. }
            | RpcError::OffsetMismatch { .. }
            | RpcError::TooMuchData { .. }
            | RpcError::InvalidArgument(_)
            | RpcError::UnknownRequest(_)
            | RpcError::DuplicateCommand(_) => -errno::EINVAL,
            RpcError::Wire(e) => e.errno(),
            RpcError::Send(e) => e.errno(),
            RpcError::Closed => -errno::EBADF,
            RpcError::TimedOut => -errno::ETIMEDOUT,
        }
    }
}

// ── Wire headers ──────────────────────────────────────────────────────────────

/// Leading header of every `RpcCmd` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u32,
    pub command_id: u16,
}

impl RequestHeader {
    pub const LEN: usize = 6;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.command_id.to_le_bytes());
    }

    /// Split `buf` into the header and the command parameters.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        need("request header", buf, Self::LEN)?;
        let header = Self {
            request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            command_id: u16::from_le_bytes([buf[4], buf[5]]),
        };
        Ok((header, &buf[Self::LEN..]))
    }
}

/// Leading header of every `RpcRsp` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub request_id: u32,
    pub command_id: u16,
    pub return_code: i16,
}

impl ResponseHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.command_id.to_le_bytes());
        out.extend_from_slice(&self.return_code.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        need("response header", buf, Self::LEN)?;
        let header = Self {
            request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            command_id: u16::from_le_bytes([buf[4], buf[5]]),
            return_code: i16::from_le_bytes([buf[6], buf[7]]),
        };
        Ok((header, &buf[Self::LEN..]))
    }
}

/// Leading header of every `RpcData` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub request_id: u32,
    pub offset: u32,
}

impl DataHeader {
    pub const LEN: usize = 8;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        need("data header", buf, Self::LEN)?;
        let header = Self {
            request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offset: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        Ok((header, &buf[Self::LEN..]))
    }
}

/// `RpcDataAck` payload: the request ID followed by zero or more offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAck {
    pub request_id: u32,
    pub offsets: Vec<u32>,
}

impl DataAck {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.request_id.to_le_bytes());
        for offset in &self.offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
    }

    /// Trailing bytes that do not form a whole offset are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need("data ack", buf, 4)?;
        Ok(Self {
            request_id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offsets: buf[4..]
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        })
    }
}

/// Parameters shared by the data transfer commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransferParams {
    /// Total bytes to transfer.
    pub size: u32,
    /// Receiver ACKs every `rx_ack_period` packets, `0` for no ACKs.
    pub rx_ack_period: u8,
}

impl DataTransferParams {
    pub const LEN: usize = 5;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.size.to_le_bytes());
        out.push(self.rx_ack_period);
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need("data transfer parameters", buf, Self::LEN)?;
        Ok(Self {
            size: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            rx_ack_period: buf[4],
        })
    }
}
