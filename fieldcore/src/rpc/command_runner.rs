//! Command dispatch: lookup by command ID, auth check, response delivery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::server::DataChannel;
use super::{
    Address, Auth, Packet, PacketMeta, PacketSink, PacketType, RequestHeader, ResponseHeader,
    RpcError, RxPacket, SendError,
};
use crate::errno;

// ── Requests and responses ────────────────────────────────────────────────────

/// Where and how to answer a request, retained after the request is released.
#[derive(Clone)]
pub struct RequestContext {
    pub interface: Arc<dyn PacketSink>,
    pub address: Address,
    pub auth: Auth,
    pub request_id: u32,
    pub command_id: u16,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("interface", &self.interface.name())
            .field("address", &self.address)
            .field("auth", &self.auth)
            .field("request_id", &self.request_id)
            .field("command_id", &self.command_id)
            .finish()
    }
}

/// A decoded `RpcCmd` handed to a [`CommandHandler`].
#[derive(Debug)]
pub struct CommandRequest {
    context: RequestContext,
    params: Vec<u8>,
}

impl CommandRequest {
    pub fn request_id(&self) -> u32 {
        self.context.request_id
    }

    pub fn command_id(&self) -> u16 {
        self.context.command_id
    }

    pub fn auth(&self) -> Auth {
        self.context.auth
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// Command parameters following the request header.
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Release the request payload early, keeping what is needed to respond.
    ///
    /// Long running commands call this before streaming data so the packet
    /// buffer does not stay pinned for the whole transfer.
    pub fn request_unref(self) -> RequestContext {
        self.context
    }
}

/// Handler result, the header is filled in by the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcResponse {
    pub return_code: i16,
    pub payload: Vec<u8>,
}

impl RpcResponse {
    /// Response with return code `rc` (an errno value or `0`).
    pub fn simple(rc: i32, payload: Vec<u8>) -> Self {
        Self {
            return_code: rc as i16,
            payload,
        }
    }

    pub fn error(rc: i32) -> Self {
        Self::simple(rc, Vec::new())
    }
}

/// Send a response before the handler returns.
///
/// A handler that responds early must return `None`.
pub async fn early_response(ctx: &RequestContext, response: RpcResponse) -> Result<(), SendError> {
    send_response(ctx, response).await
}

async fn send_response(ctx: &RequestContext, response: RpcResponse) -> Result<(), SendError> {
    let mut payload = Vec::with_capacity(ResponseHeader::LEN + response.payload.len());
    ResponseHeader {
        request_id: ctx.request_id,
        command_id: ctx.command_id,
        return_code: response.return_code,
    }
    .encode(&mut payload);
    payload.extend_from_slice(&response.payload);

    let max = ctx.interface.max_payload();
    if max == 0 {
        return Err(SendError::Disconnected);
    }
    // Interfaces may shrink while a command runs, trim to what fits
    payload.truncate(max);

    let packet = Packet {
        meta: PacketMeta {
            packet_type: PacketType::RpcRsp,
            auth: ctx.auth,
            address: ctx.address,
        },
        payload,
    };
    ctx.interface.send(packet).await
}

// ── Handlers and registry ─────────────────────────────────────────────────────

/// Implementation of one RPC command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Lowest authentication level allowed to run the command.
    fn required_auth(&self) -> Auth {
        Auth::Network
    }

    /// Run the command.
    ///
    /// `Some` responses are sent by the runner. Streaming handlers send via
    /// [`early_response`] and return `None`.
    async fn handle(&self, request: CommandRequest, data: &mut DataChannel)
        -> Option<RpcResponse>;
}

/// Command ID → handler map.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<u16, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`; an ID can only be registered once.
    pub fn register(
        &mut self,
        command_id: u16,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), RpcError> {
        if self.handlers.contains_key(&command_id) {
            return Err(RpcError::DuplicateCommand(command_id));
        }
        debug!(command_id, name = handler.name(), "registered RPC command");
        self.handlers.insert(command_id, handler);
        Ok(())
    }

    pub fn get(&self, command_id: u16) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(&command_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.handlers.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("CommandRegistry").field("commands", &ids).finish()
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CommandRunner {
    registry: CommandRegistry,
}

impl CommandRunner {
    pub fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Execute one `RpcCmd` packet to completion.
    pub async fn execute(&self, packet: RxPacket, data: &mut DataChannel) {
        if packet.meta.auth == Auth::Failure {
            debug!(interface = packet.interface.name(), "dropping unauthenticated command");
            return;
        }
        let (header, params) = match RequestHeader::decode(&packet.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "dropping malformed command");
                return;
            }
        };
        let request = CommandRequest {
            context: RequestContext {
                interface: packet.interface.clone(),
                address: packet.meta.address,
                auth: packet.meta.auth,
                request_id: header.request_id,
                command_id: header.command_id,
            },
            params: params.to_vec(),
        };
        let ctx = request.context.clone();

        let response = match self.registry.get(header.command_id) {
            None => {
                info!(command_id = header.command_id, "unknown RPC command");
                Some(RpcResponse::error(-errno::ENOTSUP))
            }
            Some(handler) if packet.meta.auth < handler.required_auth() => {
                warn!(
                    command = handler.name(),
                    auth = ?packet.meta.auth,
                    required = ?handler.required_auth(),
                    "insufficient authentication"
                );
                Some(RpcResponse::error(-errno::EACCES))
            }
            Some(handler) => {
                debug!(
                    command = handler.name(),
                    request = header.request_id,
                    "running RPC command"
                );
                handler.handle(request, data).await
            }
        };

        if let Some(response) = response {
            if let Err(e) = send_response(&ctx, response).await {
                warn!(request = ctx.request_id, error = %e, "failed to send RPC response");
            }
        }
    }
}
