use async_trait::async_trait;

use crate::rpc::server::DataChannel;
use crate::rpc::{CommandHandler, CommandRequest, RpcResponse};

/// Responds with the request parameters unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl CommandHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn handle(

        &self,

        request: CommandRequest,

        _data: &mut DataChannel,

    ) -> Option<RpcResponse> {
        Some(RpcResponse::simple(0, request.params().to_vec()))
    }
}
