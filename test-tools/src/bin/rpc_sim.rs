/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! rpc-sim – runs the RPC server and an RPC client back to back.
//!
//! Both sides talk over in-process [`ChannelInterface`]s. Packets flowing to
//! the client are inspected on the way so the simulator can follow data
//! transfers and flow control ACKs.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use crc::{Crc, CRC_32_ISO_HDLC};
use rand::RngCore;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldcore::config::RuntimeConfig;
use fieldcore::data_logger::{BlockBackend, MemoryBackend, BLOCK_TYPE_TDF};
use fieldcore::rpc::commands::{
    register_builtins, register_device_commands, DataLoggerRead, DataLoggerReadParams,
    StatesQuery, LAST_BLOCK_NEWEST, LOGGER_FLASH_ONBOARD, STATE_ENTRY_LEN,
};
use fieldcore::rpc::interface::{bridge_to_server, ChannelInterface};
use fieldcore::rpc::{
    Auth, CommandRegistry, DataAck, DataHeader, DataTransferParams, Packet, PacketType, RpcClient,
    RpcServer, MAX_ACK_PERIOD, RPC_ID_DATA_LOGGER_READ, RPC_ID_DATA_RECEIVER, RPC_ID_DATA_SENDER,
    RPC_ID_ECHO, RPC_ID_STATES_QUERY,
};
use fieldcore::task::{AppState, AppStates};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Time allowed to obtain a client context.
const CTX_TIMEOUT: Duration = Duration::from_millis(100);

/// Block size of the simulated onboard flash.
const FLASH_BLOCK_SIZE: usize = 512;

// ── CLI argument definition ───────────────────────────────────────────────────

/// RPC server/client simulator.
///
/// Example:
///   rpc-sim --max-payload 64 receive 1000 --ack-period 4
#[derive(Debug, Parser)]
#[command(
    name = "rpc-sim",
    about = "Exercise the RPC server and client over loopback interfaces",
    long_about = None,
)]
struct Cli {
    /// Runtime configuration supplying the RPC settings.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Payload limit of both loopback interfaces (overrides the configuration).
    #[arg(short = 'm', long = "max-payload")]
    max_payload: Option<usize>,

    /// Authentication level packets reach the server with.
    #[arg(short = 'a', long = "auth", value_enum, default_value_t = LinkAuth::Device)]
    auth: LinkAuth,

    /// Response timeout in milliseconds, restarted by each data ACK.
    #[arg(short = 't', long = "timeout-ms", default_value_t = 1000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: SimCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LinkAuth {
    Failure,
    Network,
    Device,
}

impl From<LinkAuth> for Auth {
    fn from(auth: LinkAuth) -> Self {
        match auth {
            LinkAuth::Failure => Auth::Failure,
            LinkAuth::Network => Auth::Network,
            LinkAuth::Device => Auth::Device,
        }
    }
}

#[derive(Debug, Subcommand)]
enum SimCommand {
    /// Send TEXT to the echo command.
    Echo {
        #[arg(default_value = "hello fieldcore")]
        text: String,
    },
    /// Ask data_sender for SIZE random bytes.
    Send { size: u32 },
    /// Push SIZE random bytes to data_receiver and compare CRCs.
    Receive {
        size: u32,

        /// Packets between receiver ACKs, 0 disables flow control.
        #[arg(short = 'p', long = "ack-period", default_value_t = 4)]
        ack_period: u8,
    },
    /// Fill the simulated flash with BLOCKS random blocks and read them back.
    LoggerRead { blocks: u32 },
    /// Set application states STATE... and query them from OFFSET.
    States {
        states: Vec<u8>,

        #[arg(short = 'o', long = "offset", default_value_t = 0)]
        offset: u8,
    },
}

// ── Report ────────────────────────────────────────────────────────────────────

/// Summary printed as YAML once a command finishes.
#[derive(Debug, Default, Serialize)]
struct SimReport {
    command: &'static str,
    request_id: u32,
    return_code: i16,
    bytes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    acks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crc_match: Option<bool>,
    elapsed_ms: u64,
}

// ── Loopback wiring ───────────────────────────────────────────────────────────

/// Traffic seen on its way to the client.
#[derive(Debug)]
enum LinkEvent {
    Data { request_id: u32, len: usize },
    Ack(DataAck),
}

struct Sim {
    client: RpcClient,
    flash: Arc<MemoryBackend>,
    states: watch::Sender<AppStates>,
    link: mpsc::UnboundedReceiver<LinkEvent>,
    max_payload: usize,
    rsp_timeout: Duration,
    cancel: CancellationToken,
    server: JoinHandle<()>,
}

impl Sim {
    fn start(
        max_payload: usize,
        max_in_flight: usize,
        auth: Auth,
        rsp_timeout: Duration,
    ) -> Result<Self> {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry).context("Failed to register built-in commands")?;
        let flash = Arc::new(MemoryBackend::with_block_size("flash", FLASH_BLOCK_SIZE));
        let (states, states_rx) = watch::channel(AppStates::new());
        register_device_commands(
            &mut registry,
            DataLoggerRead::new().with_logger(LOGGER_FLASH_ONBOARD, flash.clone()),
            StatesQuery::new(states_rx),
        )
        .context("Failed to register device commands")?;
        debug!(?registry, "server commands");

        let (server, queues) = RpcServer::new(registry);
        let cancel = CancellationToken::new();
        let server = tokio::spawn(server.run(cancel.clone()));

        let (client_if, client_out) = ChannelInterface::new("client", max_payload);
        let (server_if, server_out) = ChannelInterface::new("server", max_payload);
        let client = RpcClient::new(client_if, max_in_flight);

        bridge_to_server(client_out, queues, server_if, auth);
        let (link_tx, link) = mpsc::unbounded_channel();
        tokio::spawn(client_link(server_out, client.clone(), link_tx));

        Ok(Self {
            client,
            flash,
            states,
            link,
            max_payload,
            rsp_timeout,
            cancel,
            server,
        })
    }

    async fn shutdown(self) {
        self.client.cleanup();
        self.cancel.cancel();
        if let Err(e) = self.server.await {
            warn!("RPC server task ended abnormally: {}", e);
        }
    }

    /// Wait for the next ACK of `request_id`, skipping other traffic.
    async fn wait_ack(&mut self, request_id: u32) -> Result<DataAck> {
        let link = &mut self.link;
        let ack = tokio::time::timeout(self.rsp_timeout, async {
            while let Some(event) = link.recv().await {
                if let LinkEvent::Ack(ack) = event {
                    if ack.request_id == request_id {
                        return Some(ack);
                    }
                }
            }
            None
        })
        .await;
        match ack {
            Ok(Some(ack)) => Ok(ack),
            _ => bail!("No data ACK for request {} within {:?}", request_id, self.rsp_timeout),
        }
    }

    async fn echo(&mut self, text: &str) -> Result<SimReport> {
        let rsp = self
            .client
            .command_sync(RPC_ID_ECHO, text.as_bytes(), CTX_TIMEOUT, self.rsp_timeout)
            .await
            .context("echo failed")?;
        info!(
            rc = rsp.return_code(),
            echoed = %String::from_utf8_lossy(&rsp.payload),
            "echo response"
        );
        Ok(SimReport {
            command: "echo",
            request_id: rsp.header.request_id,
            return_code: rsp.return_code(),
            bytes: rsp.payload.len() as u32,
            ..Default::default()
        })
    }

    async fn send(&mut self, size: u32) -> Result<SimReport> {
        let mut params = Vec::with_capacity(DataTransferParams::LEN);
        DataTransferParams {
            size,
            rx_ack_period: 0,
        }
        .encode(&mut params);

        let rsp = self
            .client
            .command_sync(RPC_ID_DATA_SENDER, &params, CTX_TIMEOUT, self.rsp_timeout)
            .await
            .context("data_sender failed")?;

        // Data packets are forwarded ahead of the response that follows them
        let (received, packets) = self.drain_data(rsp.header.request_id);
        info!(rc = rsp.return_code(), received, packets, "data_sender finished");
        Ok(SimReport {
            command: "send",
            request_id: rsp.header.request_id,
            return_code: rsp.return_code(),
            bytes: received as u32,
            ..Default::default()
        })
    }

    async fn receive(&mut self, size: u32, ack_period: u8) -> Result<SimReport> {
        let mut params = Vec::with_capacity(DataTransferParams::LEN);
        DataTransferParams {
            size,
            rx_ack_period: ack_period,
        }
        .encode(&mut params);

        let mut data = vec![0u8; size as usize];
        rand::thread_rng().fill_bytes(&mut data);
        let chunk_len = self.max_payload.saturating_sub(DataHeader::LEN) & !3;
        if chunk_len == 0 {
            bail!("Payload limit {} cannot carry data", self.max_payload);
        }

        let (tx, rx) = oneshot::channel();
        let request_id = self
            .client
            .command_queue(
                RPC_ID_DATA_RECEIVER,
                &params,
                move |rsp| {
                    let _ = tx.send(rsp);
                },
                CTX_TIMEOUT,
                self.rsp_timeout,
            )
            .await
            .context("data_receiver failed")?;

        // Receiver signals readiness before the first chunk
        self.wait_ack(request_id).await?;

        let period = usize::from(ack_period);
        let flow_control = period != 0 && period <= MAX_ACK_PERIOD;
        let mut acks = 0u32;
        for (idx, piece) in data.chunks(chunk_len).enumerate() {
            let offset = (idx * chunk_len) as u32;
            self.client
                .data_queue(request_id, offset, piece)
                .await
                .with_context(|| format!("Failed to queue data at offset {}", offset))?;

            let last = offset as usize + piece.len() == data.len();
            if flow_control && !last && (idx + 1) % period == 0 {
                let ack = self.wait_ack(request_id).await?;
                debug!(offsets = ?ack.offsets, "data ACK");
                acks += 1;
            }
        }

        let rsp = match rx.await {
            Ok(Some(rsp)) => rsp,
            _ => bail!("data_receiver response for request {} timed out", request_id),
        };
        let (recv_len, recv_crc) = transfer_result("data_receiver", &rsp.payload)?;
        let local_crc = CRC32.checksum(&data);
        info!(
            rc = rsp.return_code(),
            recv_len,
            recv_crc = format_args!("{:#010x}", recv_crc),
            local_crc = format_args!("{:#010x}", local_crc),
            "data_receiver finished"
        );
        Ok(SimReport {
            command: "receive",
            request_id,
            return_code: rsp.return_code(),
            bytes: recv_len,
            acks: Some(acks),
            crc_match: Some(recv_len == size && recv_crc == local_crc),
            ..Default::default()
        })
    }

    /// Bytes of `RpcData` already forwarded for `request_id`.
    fn drain_data(&mut self, request_id: u32) -> (usize, u32) {
        let mut received = 0usize;
        let mut packets = 0u32;
        while let Ok(event) = self.link.try_recv() {
            if let LinkEvent::Data { request_id: id, len } = event {
                if id == request_id {
                    received += len;
                    packets += 1;
                }
            }
        }
        (received, packets)
    }

    async fn logger_read(&mut self, blocks: u32) -> Result<SimReport> {
        let mut written = Vec::with_capacity(blocks as usize * FLASH_BLOCK_SIZE);
        for _ in 0..blocks {
            let mut block = vec![0u8; FLASH_BLOCK_SIZE];
            rand::thread_rng().fill_bytes(&mut block);
            self.flash
                .write_block(BLOCK_TYPE_TDF, &block)
                .await
                .context("Failed to fill the simulated flash")?;
            written.extend_from_slice(&block);
        }

        let mut params = Vec::with_capacity(DataLoggerReadParams::LEN);
        DataLoggerReadParams {
            transfer: DataTransferParams {
                size: 0,
                rx_ack_period: 0,
            },
            logger: LOGGER_FLASH_ONBOARD,
            start_block: 0,
            last_block: LAST_BLOCK_NEWEST,
        }
        .encode(&mut params);
        let rsp = self
            .client
            .command_sync(RPC_ID_DATA_LOGGER_READ, &params, CTX_TIMEOUT, self.rsp_timeout)
            .await
            .context("data_logger_read failed")?;
        let (received, packets) = self.drain_data(rsp.header.request_id);
        if rsp.return_code() != 0 {
            warn!(rc = rsp.return_code(), "data_logger_read rejected the read");
            return Ok(SimReport {
                command: "logger-read",
                request_id: rsp.header.request_id,
                return_code: rsp.return_code(),
                ..Default::default()
            });
        }

        let (sent_len, sent_crc) = transfer_result("data_logger_read", &rsp.payload)?;
        let local_crc = CRC32.checksum(&written);
        info!(
            sent_len,
            received,
            packets,
            sent_crc = format_args!("{:#010x}", sent_crc),
            local_crc = format_args!("{:#010x}", local_crc),
            "data_logger_read finished"
        );
        Ok(SimReport {
            command: "logger-read",
            request_id: rsp.header.request_id,
            return_code: rsp.return_code(),
            bytes: sent_len,
            crc_match: Some(
                sent_len as usize == written.len()
                    && received == written.len()
                    && sent_crc == local_crc,
            ),
            ..Default::default()
        })
    }

    async fn query_states(&mut self, set: &[u8], offset: u8) -> Result<SimReport> {
        self.states.send_modify(|states| {
            for &state in set {
                states.set_bit(state);
            }
            states.set(AppState::ApplicationActive);
        });
        let rsp = self
            .client
            .command_sync(RPC_ID_STATES_QUERY, &[offset], CTX_TIMEOUT, self.rsp_timeout)
            .await
            .context("states_query failed")?;
        let reported: Vec<u8> = rsp
            .payload
            .get(1..)
            .unwrap_or_default()
            .chunks(STATE_ENTRY_LEN)
            .map(|entry| entry[0])
            .collect();
        info!(
            rc = rsp.return_code(),
            remaining = rsp.payload.first().copied().unwrap_or(0),
            states = ?reported,
            "states_query response"
        );
        Ok(SimReport {
            command: "states",
            request_id: rsp.header.request_id,
            return_code: rsp.return_code(),
            bytes: rsp.payload.len() as u32,
            ..Default::default()
        })
    }
}

/// `{len: u32, crc: u32}` trailer of the transfer commands.
fn transfer_result(command: &str, payload: &[u8]) -> Result<(u32, u32)> {
    if payload.len() < 8 {
        bail!("{} response too short: {} bytes", command, payload.len());
    }
    let word = |i: usize| {
        u32::from_le_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]])
    };
    Ok((word(0), word(4)))
}

/// Forward server output to the client, reporting data and ACK traffic.
async fn client_link(
    mut rx: mpsc::UnboundedReceiver<Packet>,
    client: RpcClient,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(packet) = rx.recv().await {
        let event = match packet.meta.packet_type {
            PacketType::RpcData => DataHeader::decode(&packet.payload)
                .ok()
                .map(|(header, rest)| LinkEvent::Data {
                    request_id: header.request_id,
                    len: rest.len(),
                }),
            PacketType::RpcDataAck => DataAck::decode(&packet.payload).ok().map(LinkEvent::Ack),
            _ => None,
        };
        if let Some(event) = event {
            let _ = events.send(event);
        }
        client.handle_packet(&packet);
    }
    debug!("client link closed");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => RuntimeConfig::load_from_file(path)?,
        None => RuntimeConfig::default(),
    };
    let max_payload = cli.max_payload.unwrap_or(config.rpc.max_payload);
    info!(
        max_payload,
        max_in_flight = config.rpc.max_in_flight,
        auth = ?cli.auth,
        "rpc-sim starting"
    );

    let mut sim = Sim::start(
        max_payload,
        config.rpc.max_in_flight,
        cli.auth.into(),
        Duration::from_millis(cli.timeout_ms),
    )?;

    let started = Instant::now();
    let result = match &cli.command {
        SimCommand::Echo { text } => sim.echo(text).await,
        SimCommand::Send { size } => sim.send(*size).await,
        SimCommand::Receive { size, ack_period } => sim.receive(*size, *ack_period).await,
        SimCommand::LoggerRead { blocks } => sim.logger_read(*blocks).await,
        SimCommand::States { states, offset } => sim.query_states(states, *offset).await,
    };
    sim.shutdown().await;

    let mut report = result?;
    report.elapsed_ms = started.elapsed().as_millis() as u64;
    print!("{}", serde_yaml::to_string(&report).context("Failed to render report")?);

    if report.return_code != 0 {
        bail!("{} returned {}", report.command, report.return_code);
    }
    if report.crc_match == Some(false) {
        bail!("CRC mismatch between sent and received data");
    }
    Ok(())
}
