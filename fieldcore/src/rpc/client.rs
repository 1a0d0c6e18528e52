/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! RPC client: request correlation over a bounded pool of contexts.
//!
//! Every queued command holds one semaphore permit until its callback runs,
//! so at most `max_in_flight` commands are outstanding. The callback fires
//! exactly once, with the response or with `None` on timeout or cleanup.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{
    Address, Auth, DataAck, DataHeader, Packet, PacketSink, PacketType, RequestHeader,
    ResponseHeader, RpcError,
};

/// A response delivered to a client callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcClientResponse {
    pub header: ResponseHeader,
    pub payload: Vec<u8>,
}

impl RpcClientResponse {
    pub fn return_code(&self) -> i16 {
        self.header.return_code
    }
}

type ResponseCallback = Box<dyn FnOnce(Option<RpcClientResponse>) + Send>;

struct PendingCommand {
    command_id: u16,
    rsp_timeout: Duration,
    callback: ResponseCallback,
    timer: JoinHandle<()>,
    /// Generation of the armed timer; older timers that fire are ignored.
    timer_gen: u64,
    permit: OwnedSemaphorePermit,
}

struct ClientState {
    request_id: u32,
    timer_gen: u64,
    pending: HashMap<u32, PendingCommand>,
}

struct ClientInner {
    interface: Arc<dyn PacketSink>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    state: Mutex<ClientState>,
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Complete a pending command.
    ///
    /// `timer` is the generation of the timeout that fired, `None` for a
    /// response. A timer re-armed since it started sleeping no longer owns
    /// the command. The context is released before the callback runs so the
    /// callback may queue further commands.
    fn run_callback(
        &self,
        request_id: u32,
        command_id: u16,
        response: Option<RpcClientResponse>,
        timer: Option<u64>,
    ) {
        let pending = {
            let mut state = self.state();
            match state.pending.get(&request_id) {
                None => {
                    if timer.is_none() {
                        error!(request = request_id, command_id, "unknown RPC response");
                    }
                    return;
                }
                Some(p) if p.command_id != command_id => {
                    warn!(
                        got = command_id,
                        want = p.command_id,
                        "mismatched command ID"
                    );
                    return;
                }
                Some(p) if timer.is_some_and(|generation| generation != p.timer_gen) => {
                    debug!(request = request_id, "timeout superseded by data ACK");
                    return;
                }
                Some(_) => {}
            }
            match state.pending.remove(&request_id) {
                Some(p) => p,
                None => return,
            }
        };
        if timer.is_none() {
            pending.timer.abort();
        }
        let PendingCommand {
            callback, permit, ..
        } = pending;
        drop(permit);
        callback(response);
    }
}

fn arm_timeout(
    inner: &Arc<ClientInner>,
    request_id: u32,
    command_id: u16,
    after: Duration,
    generation: u64,
) -> JoinHandle<()> {
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        warn!(request = request_id, "RPC request timed out");
        inner.run_callback(request_id, command_id, None, Some(generation));
    })
}

/// Handle to an RPC client. Cloning shares the same context pool.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Client with a random initial request ID.
    pub fn new(interface: Arc<dyn PacketSink>, max_in_flight: usize) -> Self {
        Self::with_initial_request_id(interface, max_in_flight, rand::random())
    }

    /// The first command uses `initial.wrapping_add(1)`, skipping `0`.
    pub fn with_initial_request_id(
        interface: Arc<dyn PacketSink>,
        max_in_flight: usize,
        initial: u32,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                interface,
                permits: Arc::new(Semaphore::new(max_in_flight)),
                max_in_flight,
                state: Mutex::new(ClientState {
                    request_id: initial,
                    timer_gen: 0,
                    pending: HashMap::new(),
                }),
            }),
        }
    }

    /// Commands currently awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.inner.state().pending.len()
    }

    /// Queue a command; `callback` receives the response, or `None`.
    ///
    /// Waits up to `ctx_timeout` for a free context. `rsp_timeout` is the
    /// time allowed for the response, restarted by every `RpcDataAck`.
    /// Returns the request ID assigned to the command.
    pub async fn command_queue<F>(
        &self,
        command_id: u16,
        params: &[u8],
        callback: F,
        ctx_timeout: Duration,
        rsp_timeout: Duration,
    ) -> Result<u32, RpcError>
    where
        F: FnOnce(Option<RpcClientResponse>) + Send + 'static,
    {
        if rsp_timeout.is_zero() {
            return Err(RpcError::InvalidArgument("response timeout must be nonzero"));
        }
        let permit = match tokio::time::timeout(
            ctx_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            _ => return Err(RpcError::NoContext),
        };

        let request_id = {
            let mut state = self.inner.state();
            let mut id = state.request_id;
            loop {
                id = id.wrapping_add(1);
                if id != 0 && !state.pending.contains_key(&id) {
                    break;
                }
            }
            state.request_id = id;
            state.timer_gen = state.timer_gen.wrapping_add(1);
            let timer_gen = state.timer_gen;
            state.pending.insert(
                id,
                PendingCommand {
                    command_id,
                    rsp_timeout,
                    callback: Box::new(callback),
                    timer: arm_timeout(&self.inner, id, command_id, rsp_timeout, timer_gen),
                    timer_gen,
                    permit,
                },
            );
            id
        };
        debug!(command_id, request = request_id, "queueing RPC command");

        let mut payload = Vec::with_capacity(RequestHeader::LEN + params.len());
        RequestHeader {
            request_id,
            command_id,
        }
        .encode(&mut payload);
        payload.extend_from_slice(params);
        let packet = Packet::new(PacketType::RpcCmd, Auth::Network, Address::ALL, payload);

        if let Err(e) = self.inner.interface.send(packet).await {
            // Never sent, so the callback will not run
            if let Some(pending) = self.inner.state().pending.remove(&request_id) {
                pending.timer.abort();
            }
            return Err(e.into());
        }
        Ok(request_id)
    }

    /// Queue a command and wait for its response.
    pub async fn command_sync(
        &self,
        command_id: u16,
        params: &[u8],
        ctx_timeout: Duration,
        rsp_timeout: Duration,
    ) -> Result<RpcClientResponse, RpcError> {
        let (tx, rx) = oneshot::channel();
        self.command_queue(
            command_id,
            params,
            move |rsp| {
                let _ = tx.send(rsp);
            },
            ctx_timeout,
            rsp_timeout,
        )
        .await?;
        match rx.await {
            Ok(Some(rsp)) => Ok(rsp),
            _ => Err(RpcError::TimedOut),
        }
    }

    /// Send an `RpcData` packet for a command that is still pending.
    pub async fn data_queue(
        &self,
        request_id: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), RpcError> {
        if !self.inner.state().pending.contains_key(&request_id) {
            warn!(request = request_id, "data for unknown request");
            return Err(RpcError::UnknownRequest(request_id));
        }
        let mut payload = Vec::with_capacity(DataHeader::LEN + data.len());
        DataHeader { request_id, offset }.encode(&mut payload);
        payload.extend_from_slice(data);
        let packet = Packet::new(PacketType::RpcData, Auth::Network, Address::ALL, payload);
        self.inner.interface.send(packet).await?;
        Ok(())
    }

    /// Process a packet received on the client's interface.
    pub fn handle_packet(&self, packet: &Packet) {
        if packet.meta.auth == Auth::Failure {
            return;
        }
        match packet.meta.packet_type {
            PacketType::RpcDataAck => {
                let ack = match DataAck::decode(&packet.payload) {
                    Ok(ack) => ack,
                    Err(e) => {
                        warn!(error = %e, "malformed data ACK");
                        return;
                    }
                };
                let mut state = self.inner.state();
                state.timer_gen = state.timer_gen.wrapping_add(1);
                let timer_gen = state.timer_gen;
                let Some(pending) = state.pending.get_mut(&ack.request_id) else {
                    warn!(request = ack.request_id, "data ACK for unknown command");
                    return;
                };
                debug!(request = ack.request_id, "ACK received, extending timeout");
                pending.timer.abort();
                pending.timer_gen = timer_gen;
                pending.timer = arm_timeout(
                    &self.inner,
                    ack.request_id,
                    pending.command_id,
                    pending.rsp_timeout,
                    timer_gen,
                );
            }
            PacketType::RpcRsp => {
                let (header, rest) = match ResponseHeader::decode(&packet.payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(error = %e, "malformed RPC response");
                        return;
                    }
                };
                debug!(request = header.request_id, "finalising request");
                let response = RpcClientResponse {
                    header,
                    payload: rest.to_vec(),
                };
                self.inner
                    .run_callback(header.request_id, header.command_id, Some(response), None);
            }
            _ => {}
        }
    }

    /// Detach every pending command, running each callback with `None`.
    pub fn cleanup(&self) {
        let pending: Vec<(u32, PendingCommand)> = self.inner.state().pending.drain().collect();
        for (request_id, pending) in pending {
            debug!(request = request_id, "detaching request");
            pending.timer.abort();
            let PendingCommand {
                callback, permit, ..
            } = pending;
            drop(permit);
            callback(None);
        }
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("interface", &self.inner.interface.name())
            .field("max_in_flight", &self.inner.max_in_flight)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
