use async_trait::async_trait;
use rand::RngCore;
use tracing::{debug, warn};

use crate::errno;
use crate::rpc::server::DataChannel;
use crate::rpc::{
    Address, Auth, CommandHandler, CommandRequest, DataHeader, DataTransferParams, Packet,
    PacketType, RpcResponse,
};

/// Streams `size` random bytes back to the requester as `RpcData` packets.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSender;

#[async_trait]
impl CommandHandler for DataSender {
    fn name(&self) -> &str {
        "data_sender"
    }

    fn required_auth(&self) -> Auth {
        Auth::Device
    }

    async fn handle(

        &self,

        request: CommandRequest,

        _data: &mut DataChannel,

    ) -> Option<RpcResponse> {
        let params = match DataTransferParams::decode(request.params()) {
            Ok(params) => params,
            Err(e) => {
                warn!(error = %e, "data_sender");
                return Some(RpcResponse::error(e.errno()));
            }
        };
        let ctx = request.request_unref();
        debug!(bytes = params.size, request = ctx.request_id, "sending data");

        let mut remaining = params.size as usize;
        let mut offset: u32 = 0;
        while remaining > 0 {
            // Chunks stay word sized so every offset is aligned
            let room = ctx.interface.max_payload().saturating_sub(DataHeader::LEN) & !3;
            if room == 0 {
                warn!(offset, "interface closed mid transfer");
                return Some(RpcResponse::error(-errno::ENOTCONN));
            }
            let len = remaining.min(room);

            let mut payload = Vec::with_capacity(DataHeader::LEN + len);
            DataHeader {
                request_id: ctx.request_id,
                offset,
            }
            .encode(&mut payload);
            let start = payload.len();
            payload.resize(start + len, 0);
            rand::thread_rng().fill_bytes(&mut payload[start..]);

            let packet = Packet::new(PacketType::RpcData, ctx.auth, Address::ALL, payload);
            if let Err(e) = ctx.interface.send(packet).await {
                warn!(offset, error = %e, "data_sender");
                return Some(RpcResponse::error(e.errno()));
            }
            remaining -= len;
            offset += len as u32;
        }
        Some(RpcResponse::simple(0, Vec::new()))
    }
}
