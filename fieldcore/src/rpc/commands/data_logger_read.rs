use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use tracing::{debug, warn};

use crate::data_logger::BlockBackend;
use crate::errno;
use crate::rpc::server::DataChannel;
use crate::rpc::{
    need, Address, Auth, CommandHandler, CommandRequest, DataHeader, DataTransferParams, Packet,
    PacketType, RequestContext, RpcResponse, WireError,
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Logger selector for the onboard flash partition.
pub const LOGGER_FLASH_ONBOARD: u8 = 1;
/// Logger selector for removable flash (SD card).
pub const LOGGER_FLASH_REMOVABLE: u8 = 2;

/// `last_block` value selecting everything up to the newest stored block.
pub const LAST_BLOCK_NEWEST: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLoggerReadParams {
    pub transfer: DataTransferParams,
    pub logger: u8,
    pub start_block: u32,
    pub last_block: u32,
}

impl DataLoggerReadParams {
    pub const LEN: usize = DataTransferParams::LEN + 9;

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.transfer.encode(out);
        out.push(self.logger);
        out.extend_from_slice(&self.start_block.to_le_bytes());
        out.extend_from_slice(&self.last_block.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        need("data logger read parameters", buf, Self::LEN)?;
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            transfer: DataTransferParams::decode(buf)?,
            logger: buf[5],
            start_block: word(6),
            last_block: word(10),
        })
    }
}

/// Streams a range of stored logger blocks as `RpcData`.
///
/// Blocks are sent back to back, each packet filled to a multiple of four
/// bytes. The response carries `{sent_len, sent_crc}` over the block bytes.
#[derive(Default)]
pub struct DataLoggerRead {
    loggers: Vec<(u8, Arc<dyn BlockBackend>)>,
}

impl DataLoggerRead {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `backend` readable under the `logger` selector.
    pub fn with_logger(mut self, logger: u8, backend: Arc<dyn BlockBackend>) -> Self {
        self.loggers.retain(|(id, _)| *id != logger);
        self.loggers.push((logger, backend));
        self
    }

    fn backend(&self, logger: u8) -> Option<&Arc<dyn BlockBackend>> {
        self.loggers
            .iter()
            .find(|(id, _)| *id == logger)
            .map(|(_, backend)| backend)
    }
}

impl fmt::Debug for DataLoggerRead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let loggers: Vec<_> = self.loggers.iter().map(|(id, b)| (*id, b.name())).collect();
        f.debug_struct("DataLoggerRead")
            .field("loggers", &loggers)
            .finish()
    }
}

/// Outgoing `RpcData` stream with a running offset and CRC.
struct BlockStream<'a> {
    ctx: &'a RequestContext,
    sent: u32,
    digest: Digest<'static, u32>,
}

impl BlockStream<'_> {
    /// Payload bytes per packet, `0` once the interface is gone.
    fn room(&self) -> usize {
        self.ctx.interface.max_payload().saturating_sub(DataHeader::LEN) & !3
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), i32> {
        let mut payload = Vec::with_capacity(DataHeader::LEN + bytes.len());
        DataHeader {
            request_id: self.ctx.request_id,
            offset: self.sent,
        }
        .encode(&mut payload);
        payload.extend_from_slice(bytes);

        let packet = Packet::new(PacketType::RpcData, self.ctx.auth, Address::ALL, payload);
        if let Err(e) = self.ctx.interface.send(packet).await {
            warn!(offset = self.sent, error = %e, "data_logger_read");
            return Err(e.errno());
        }
        self.digest.update(bytes);
        self.sent += bytes.len() as u32;
        Ok(())
    }

    /// Send full packets from the front of `pending`, then the remainder
    /// too when `flush` is set.
    async fn drain(&mut self, pending: &mut Vec<u8>, flush: bool) -> Result<(), i32> {
        while !pending.is_empty() {
            let room = self.room();
            if room == 0 {
                warn!(offset = self.sent, "interface closed mid transfer");
                return Err(-errno::ENOTCONN);
            }
            if !flush && pending.len() < room {
                break;
            }
            let len = pending.len().min(room);
            self.send(&pending[..len]).await?;
            pending.drain(..len);
        }
        Ok(())
    }

    fn finish(self, rc: i32) -> RpcResponse {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&self.sent.to_le_bytes());
        payload.extend_from_slice(&self.digest.finalize().to_le_bytes());
        RpcResponse::simple(rc, payload)
    }
}

#[async_trait]
impl CommandHandler for DataLoggerRead {
    fn name(&self) -> &str {
        "data_logger_read"
    }

    fn required_auth(&self) -> Auth {
        Auth::Device
    }

    async fn handle(
        &self,
        request: CommandRequest,
        _data: &mut DataChannel,
    ) -> Option<RpcResponse> {
        let params = match DataLoggerReadParams::decode(request.params()) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "data_logger_read");
                return Some(RpcResponse::error(e.errno()));
            }
        };
        let Some(backend) = self.backend(params.logger) else {
            warn!(logger = params.logger, "no such logger");
            return Some(RpcResponse::error(-errno::ENODEV));
        };

        let stored = backend.stored_blocks();
        let last = match params.last_block {
            LAST_BLOCK_NEWEST => stored.end.saturating_sub(1),
            last => last,
        };
        if params.start_block < stored.start || last >= stored.end || last < params.start_block {
            warn!(
                start = params.start_block,
                last,
                earliest = stored.start,
                current = stored.end,
                "block range not stored"
            );
            return Some(RpcResponse::error(-errno::EINVAL));
        }

        let ctx = request.request_unref();
        debug!(
            logger = backend.name(),
            start = params.start_block,
            last,
            request = ctx.request_id,
            "reading blocks"
        );

        let mut stream = BlockStream {
            ctx: &ctx,
            sent: 0,
            digest: CRC32.digest(),
        };
        let mut pending = Vec::new();
        for block in params.start_block..=last {
            match backend.read_block(block).await {
                Ok(bytes) => pending.extend_from_slice(&bytes),
                Err(e) => {
                    warn!(block, error = %e, "block read failed");
                    return Some(stream.finish(e.errno()));
                }
            }
            if let Err(rc) = stream.drain(&mut pending, false).await {
                return Some(stream.finish(rc));
            }
        }
        let rc = match stream.drain(&mut pending, true).await {
            Ok(()) => 0,
            Err(rc) => rc,
        };
        Some(stream.finish(rc))
    }
}
