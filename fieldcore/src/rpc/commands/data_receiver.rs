use std::time::Duration;

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};
use tracing::{debug, warn};

use crate::rpc::server::DataChannel;
use crate::rpc::{
    Auth, CommandHandler, CommandRequest, DataTransferParams, RpcError, RpcResponse,
};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Wait allowed for each `RpcData` packet.
pub const CHUNK_TIMEOUT: Duration = Duration::from_millis(500);

/// Receives `size` bytes of `RpcData` and reports `{recv_len, recv_crc}`.
///
/// Transfers are flow controlled: a zero-offset ACK signals readiness, then
/// every `rx_ack_period` packets are acknowledged.
#[derive(Debug, Clone, Copy)]
pub struct DataReceiver {
    chunk_timeout: Duration,
}

impl DataReceiver {
    pub fn new(chunk_timeout: Duration) -> Self {
        Self { chunk_timeout }
    }
}

impl Default for DataReceiver {
    fn default() -> Self {
        Self::new(CHUNK_TIMEOUT)
    }
}

#[async_trait]
impl CommandHandler for DataReceiver {
    fn name(&self) -> &str {
        "data_receiver"
    }

    fn required_auth(&self) -> Auth {
        Auth::Device
    }

    async fn handle(

        &self,

        request: CommandRequest,

        data: &mut DataChannel,

    ) -> Option<RpcResponse> {
        let params = match DataTransferParams::decode(request.params()) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "data_receiver");
                return Some(RpcResponse::error(e.errno()));
            }
        };
        let ctx = request.request_unref();
        debug!(bytes = params.size, request = ctx.request_id, "receiving data");

        data.ack_data_ready(ctx.interface.as_ref(), ctx.request_id).await;

        let mut digest = CRC32.digest();
        let mut received: u32 = 0;
        let mut expected_offset: u32 = 0;
        let mut remaining = params.size;
        let mut rc = 0;

        while remaining > 0 {
            let chunk = match data
                .pull_data(ctx.request_id, expected_offset, self.chunk_timeout)
                .await
            {
                Ok(chunk) => chunk,
                Err(e) => {
                    rc = e.errno();
                    break;
                }
            };
            let len = chunk.payload.len();
            if len > remaining as usize {
                let e = RpcError::TooMuchData {
                    received: len,
                    remaining,
                };
                warn!(error = %e, "data_receiver");
                rc = e.errno();
                break;
            }
            digest.update(&chunk.payload);
            expected_offset = chunk.offset + len as u32;
            remaining = params.size - expected_offset;
            received += len as u32;

            if remaining > 0 {
                data.ack_data(
                    ctx.interface.as_ref(),
                    ctx.request_id,
                    chunk.offset,
                    params.rx_ack_period,
                )
                .await;
            }
        }

        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&received.to_le_bytes());
        payload.extend_from_slice(&digest.finalize().to_le_bytes());
        Some(RpcResponse::simple(rc, payload))
    }
}
