use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::rpc::server::DataChannel;
use crate::rpc::{need, CommandHandler, CommandRequest, ResponseHeader, RpcResponse};
use crate::task::AppStates;

/// Bytes per `{state u8, timeout u16}` entry.
pub const STATE_ENTRY_LEN: usize = 3;

/// Reports the application states currently set.
///
/// Response payload is `remaining u8` followed by as many entries as fit in
/// one packet, lowest state first. `offset` in the request skips that many
/// set states so a large set can be paged. `remaining` counts the states not
/// yet reported. States here never expire, so every timeout is `0`.
#[derive(Debug, Clone)]
pub struct StatesQuery {
    states: watch::Receiver<AppStates>,
}

impl StatesQuery {
    pub fn new(states: watch::Receiver<AppStates>) -> Self {
        Self { states }
    }
}

#[async_trait]
impl CommandHandler for StatesQuery {
    fn name(&self) -> &str {
        "states_query"
    }

    async fn handle(
        &self,
        request: CommandRequest,
        _data: &mut DataChannel,
    ) -> Option<RpcResponse> {
        if let Err(e) = need("states query parameters", request.params(), 1) {
            warn!(error = %e, "states_query");
            return Some(RpcResponse::error(e.errno()));
        }
        let offset = usize::from(request.params()[0]);
        let room = request
            .context()
            .interface
            .max_payload()
            .saturating_sub(ResponseHeader::LEN + 1)
            / STATE_ENTRY_LEN;

        let states = *self.states.borrow();
        let mut listed = states.iter().skip(offset);
        let mut payload = vec![0];
        for state in listed.by_ref().take(room) {
            payload.push(state);
            payload.extend_from_slice(&0u16.to_le_bytes());
        }
        payload[0] = listed.count() as u8;
        debug!(
            set = states.len(),
            reported = (payload.len() - 1) / STATE_ENTRY_LEN,
            remaining = payload[0],
            "states query"
        );
        Some(RpcResponse::simple(0, payload))
    }
}
