/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! RPC server: inbound queues, the dispatch loop and data flow control.
//!
//! Commands execute one at a time. While a command handler runs it owns the
//! [`DataChannel`], through which it pulls `RpcData` packets and sends
//! `RpcDataAck`s. Data packets that arrive while no command is executing
//! are dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::command_runner::{CommandRegistry, CommandRunner};
use super::{
    Address, Auth, DataAck, DataHeader, Packet, PacketSink, PacketType, RpcError, RxPacket,
    MAX_ACK_PERIOD,
};

// ── Queues ────────────────────────────────────────────────────────────────────

/// Producer handle feeding packets into an [`RpcServer`].
#[derive(Debug, Clone)]
pub struct ServerQueues {
    commands: mpsc::UnboundedSender<RxPacket>,
    data: mpsc::UnboundedSender<RxPacket>,
}

impl ServerQueues {
    /// Queue an `RpcCmd` packet. Returns `false` once the server has stopped.
    pub fn queue_command(&self, packet: RxPacket) -> bool {
        self.commands.send(packet).is_ok()
    }

    /// Queue an `RpcData` packet. Returns `false` once the server has stopped.
    pub fn queue_data(&self, packet: RxPacket) -> bool {
        self.data.send(packet).is_ok()
    }

    /// Route a packet to the matching queue; other packet types are ignored.
    pub fn receive(&self, packet: RxPacket) -> bool {
        match packet.meta.packet_type {
            PacketType::RpcCmd => self.queue_command(packet),
            PacketType::RpcData => self.queue_data(packet),
            other => {
                debug!(packet_type = ?other, "ignoring non-RPC packet");
                true
            }
        }
    }
}

// ── DataChannel ───────────────────────────────────────────────────────────────

/// One `RpcData` packet accepted by [`DataChannel::pull_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcData {
    pub request_id: u32,
    pub offset: u32,
    pub payload: Vec<u8>,
}

/// Data queue plus ACK bookkeeping for the command currently executing.
#[derive(Debug)]
pub struct DataChannel {
    rx: mpsc::UnboundedReceiver<RxPacket>,
    acks: [u32; MAX_ACK_PERIOD],
    ack_count: usize,
}

impl DataChannel {
    fn new(rx: mpsc::UnboundedReceiver<RxPacket>) -> Self {
        Self {
            rx,
            acks: [0; MAX_ACK_PERIOD],
            ack_count: 0,
        }
    }

    /// Forget offsets recorded for the previous command.
    pub fn reset(&mut self) {
        self.ack_count = 0;
    }

    /// Wait for the next data packet of `request_id`.
    ///
    /// `timeout` bounds the whole call: packets for other requests are
    /// discarded without extending it.
    pub async fn pull_data(
        &mut self,
        request_id: u32,
        expected_offset: u32,
        timeout: Duration,
    ) -> Result<RpcData, RpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            let packet = match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return Err(RpcError::Closed),
                Err(_) => {
                    warn!(expected = expected_offset, "timeout waiting for data");
                    return Err(RpcError::DataTimeout {
                        expected: expected_offset,
                    });
                }
            };
            let (header, payload) = match DataHeader::decode(&packet.payload) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(error = %e, "discarding malformed data packet");
                    continue;
                }
            };
            if header.request_id != request_id {
                warn!(
                    got = header.request_id,
                    want = request_id,
                    "mismatched data request ID"
                );
                continue;
            }
            if header.offset % 4 != 0 {
                warn!(offset = header.offset, "unaligned data offset");
                return Err(RpcError::UnalignedOffset {
                    offset: header.offset,
                });
            }
            if header.offset != expected_offset {
                warn!(
                    offset = header.offset,
                    expected = expected_offset,
                    "missed data"
                );
                return Err(RpcError::OffsetMismatch {
                    offset: header.offset,
                    expected: expected_offset,
                });
            }
            return Ok(RpcData {
                request_id,
                offset: header.offset,
                payload: payload.to_vec(),
            });
        }
    }

    /// Record a received offset, sending an ACK every `ack_period` offsets.
    ///
    /// `ack_period` of `0` or above [`MAX_ACK_PERIOD`] disables ACKs.
    pub async fn ack_data(
        &mut self,
        interface: &dyn PacketSink,
        request_id: u32,
        offset: u32,
        ack_period: u8,
    ) {
        let period = usize::from(ack_period);
        if period == 0 || period > MAX_ACK_PERIOD {
            return;
        }
        self.acks[self.ack_count] = offset;
        self.ack_count += 1;
        if self.ack_count >= period {
            self.send_ack(interface, request_id).await;
        }
    }

    /// Signal that the handler is ready for data.
    pub async fn ack_data_ready(&mut self, interface: &dyn PacketSink, request_id: u32) {
        self.ack_count = 0;
        self.send_ack(interface, request_id).await;
    }

    async fn send_ack(&mut self, interface: &dyn PacketSink, request_id: u32) {
        let ack = DataAck {
            request_id,
            offsets: self.acks[..self.ack_count].to_vec(),
        };
        self.ack_count = 0;

        let mut payload = Vec::with_capacity(4 + 4 * ack.offsets.len());
        ack.encode(&mut payload);
        let packet = Packet::new(PacketType::RpcDataAck, Auth::Network, Address::ALL, payload);
        if let Err(e) = interface.send(packet).await {
            warn!(interface = interface.name(), error = %e, "failed to send data ACK");
        }
    }

    /// Drop every queued data packet, returning how many were dropped.
    fn drop_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(packet) = self.rx.try_recv() {
            if let Ok((header, _)) = DataHeader::decode(&packet.payload) {
                warn!(
                    request = header.request_id,
                    offset = header.offset,
                    "dropping data without a command"
                );
            }
            dropped += 1;
        }
        dropped
    }
}

// ── RpcServer ─────────────────────────────────────────────────────────────────

pub struct RpcServer {
    commands: mpsc::UnboundedReceiver<RxPacket>,
    channel: DataChannel,
    runner: CommandRunner,
}

impl RpcServer {
    pub fn new(registry: CommandRegistry) -> (Self, ServerQueues) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let server = Self {
            commands: cmd_rx,
            channel: DataChannel::new(data_rx),
            runner: CommandRunner::new(registry),
        };
        let queues = ServerQueues {
            commands: cmd_tx,
            data: data_tx,
        };
        (server, queues)
    }

    /// Serve until cancelled or every [`ServerQueues`] handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(commands = self.runner.registry().len(), "RPC server started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    self.channel.reset();
                    self.runner.execute(command, &mut self.channel).await;
                }
                data = self.channel.rx.recv() => {
                    let Some(data) = data else { break };
                    if let Ok((header, _)) = DataHeader::decode(&data.payload) {
                        warn!(
                            request = header.request_id,
                            offset = header.offset,
                            "dropping data without a command"
                        );
                    }
                    self.channel.drop_pending();
                }
            }
        }
        info!("RPC server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_logger::{BlockBackend, MemoryBackend, BLOCK_TYPE_TDF};
    use crate::errno;
    use crate::rpc::commands::{
        register_builtins, register_device_commands, DataLoggerRead, DataLoggerReadParams,
        StatesQuery, LAST_BLOCK_NEWEST, LOGGER_FLASH_ONBOARD, LOGGER_FLASH_REMOVABLE,
    };
    use crate::rpc::interface::ChannelInterface;
    use crate::rpc::{
        DataTransferParams, RequestHeader, ResponseHeader, RPC_ID_DATA_LOGGER_READ,
        RPC_ID_DATA_RECEIVER, RPC_ID_DATA_SENDER, RPC_ID_ECHO, RPC_ID_STATES_QUERY,
    };
    use crate::task::{AppState, AppStates};
    use std::sync::Arc;
    use tokio::sync::watch;
    use tokio::time::timeout;

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        queues: ServerQueues,
        iface: Arc<ChannelInterface>,
        tx: mpsc::UnboundedReceiver<Packet>,
        cancel: CancellationToken,
    }

    impl Harness {
        fn start(max_payload: usize) -> Self {
            let mut registry = CommandRegistry::new();
            register_builtins(&mut registry).unwrap();
            Self::with_registry(registry, max_payload)
        }

        fn with_registry(registry: CommandRegistry, max_payload: usize) -> Self {
            let (server, queues) = RpcServer::new(registry);
            let (iface, tx) = ChannelInterface::new("dummy", max_payload);
            let cancel = CancellationToken::new();
            tokio::spawn(server.run(cancel.clone()));
            Self {
                queues,
                iface,
                tx,
                cancel,
            }
        }

        fn command(&self, auth: Auth, request_id: u32, command_id: u16, params: &[u8]) {
            let mut payload = Vec::new();
            RequestHeader {
                request_id,
                command_id,
            }
            .encode(&mut payload);
            payload.extend_from_slice(params);
            let packet = Packet::new(PacketType::RpcCmd, auth, Address(0x42), payload);
            assert!(self.queues.receive(RxPacket::new(packet, self.iface.clone())));
        }

        fn data(&self, request_id: u32, offset: u32, bytes: &[u8]) {
            let mut payload = Vec::new();
            DataHeader { request_id, offset }.encode(&mut payload);
            payload.extend_from_slice(bytes);
            let packet = Packet::new(PacketType::RpcData, Auth::Device, Address(0x42), payload);
            assert!(self.queues.receive(RxPacket::new(packet, self.iface.clone())));
        }

        async fn next(&mut self) -> Option<Packet> {
            timeout(Duration::from_millis(100), self.tx.recv()).await.ok().flatten()
        }

        async fn response(&mut self) -> (Packet, ResponseHeader, Vec<u8>) {
            let packet = self.next().await.expect("response");
            assert_eq!(packet.meta.packet_type, PacketType::RpcRsp);
            let (header, rest) = ResponseHeader::decode(&packet.payload).unwrap();
            let rest = rest.to_vec();
            (packet, header, rest)
        }

        async fn ack(&mut self) -> (Packet, DataAck) {
            let packet = self.next().await.expect("ack");
            assert_eq!(packet.meta.packet_type, PacketType::RpcDataAck);
            let ack = DataAck::decode(&packet.payload).unwrap();
            (packet, ack)
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn transfer(size: u32, rx_ack_period: u8) -> Vec<u8> {
        let mut out = Vec::new();
        DataTransferParams {
            size,
            rx_ack_period,
        }
        .encode(&mut out);
        out
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn data_without_command_is_dropped() {
        let mut h = Harness::start(64);
        for i in 0..8 {
            h.data(0x1234_5678 + i, 0, &[0; 8]);
        }
        assert!(h.next().await.is_none());

        // Server still serves commands afterwards
        h.command(Auth::Network, 1, RPC_ID_ECHO, b"hi");
        let (_, header, _) = h.response().await;
        assert_eq!(header.return_code, 0);
    }

    #[tokio::test]
    async fn auth_failure_gets_no_response() {
        let mut h = Harness::start(64);
        h.command(Auth::Failure, 0x1234_5678, RPC_ID_ECHO, &[0; 10]);
        assert!(h.next().await.is_none());
    }

    #[tokio::test]
    async fn unknown_command_is_not_supported() {
        let mut h = Harness::start(64);
        h.command(Auth::Network, 0x1234_5678, 1000, &[0; 10]);

        let (packet, header, rest) = h.response().await;
        assert_eq!(packet.meta.auth, Auth::Network);
        assert_eq!(packet.meta.address, Address(0x42));
        assert_eq!(header.request_id, 0x1234_5678);
        assert_eq!(header.command_id, 1000);
        assert_eq!(header.return_code, -(errno::ENOTSUP as i16));
        assert!(rest.is_empty());
        assert!(h.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_channel_sends_nothing() {
        let mut h = Harness::start(64);
        h.iface.set_connected(false);
        for i in 0..4 {
            h.command(Auth::Network, i, 1000, &[]);
        }
        assert!(h.next().await.is_none());
    }

    #[tokio::test]
    async fn auth_level_enforced() {
        let mut h = Harness::start(64);

        h.command(Auth::Device, 1, RPC_ID_ECHO, &[0; 16]);
        let (packet, header, _) = h.response().await;
        assert_eq!(packet.meta.auth, Auth::Device);
        assert_eq!(header.return_code, 0);

        h.command(Auth::Network, 2, RPC_ID_ECHO, &[0; 16]);
        let (packet, header, _) = h.response().await;
        assert_eq!(packet.meta.auth, Auth::Network);
        assert_eq!(header.return_code, 0);

        h.command(Auth::Network, 3, RPC_ID_DATA_SENDER, &transfer(100, 0));
        let (packet, header, _) = h.response().await;
        assert_eq!(packet.meta.auth, Auth::Network);
        assert_eq!(header.return_code, -(errno::EACCES as i16));
        assert!(h.next().await.is_none());
    }

    #[tokio::test]
    async fn echo_returns_payload() {
        let mut h = Harness::start(128);
        for len in [0usize, 4, 16, 32, 64] {
            let params: Vec<u8> = (0..len as u8).collect();
            h.command(Auth::Device, 99, RPC_ID_ECHO, &params);
            let (_, header, rest) = h.response().await;
            assert_eq!(header.request_id, 99);
            assert_eq!(header.command_id, RPC_ID_ECHO);
            assert_eq!(header.return_code, 0);
            assert_eq!(rest, params);
        }

        // Interface shrinks: response is truncated to fit
        h.iface.set_max_payload(24);
        h.command(Auth::Device, 100, RPC_ID_ECHO, &[7; 32]);
        let (packet, header, _) = h.response().await;
        assert_eq!(header.return_code, 0);
        assert_eq!(packet.payload.len(), 24);
    }

    // ── Data sender ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn data_sender_streams_chunks() {
        for size in [0u32, 1, 55, 56, 57, 1000] {
            let mut h = Harness::start(64);
            h.command(Auth::Device, 0xAB, RPC_ID_DATA_SENDER, &transfer(size, 0));

            let mut expected_offset = 0;
            loop {
                let packet = h.next().await.expect("packet");
                assert_eq!(packet.meta.auth, Auth::Device);
                match packet.meta.packet_type {
                    PacketType::RpcData => {
                        let (header, bytes) = DataHeader::decode(&packet.payload).unwrap();
                        assert_eq!(header.request_id, 0xAB);
                        assert_eq!(header.offset, expected_offset);
                        assert!(!bytes.is_empty() && bytes.len() <= 56);
                        expected_offset += bytes.len() as u32;
                    }
                    PacketType::RpcRsp => {
                        let (header, _) = ResponseHeader::decode(&packet.payload).unwrap();
                        assert_eq!(header.command_id, RPC_ID_DATA_SENDER);
                        assert_eq!(header.return_code, 0);
                        break;
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            assert_eq!(expected_offset, size);
        }
    }

    // ── Data receiver ─────────────────────────────────────────────────────────

    fn crc32(data: &[u8]) -> u32 {
        crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(data)
    }

    fn receiver_result(rest: &[u8]) -> (u32, u32) {
        (
            u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]),
            u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]),
        )
    }

    #[tokio::test]
    async fn data_receiver_acks_and_checksums() {
        let mut h = Harness::start(128);
        let total: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        h.command(Auth::Device, 0x55, RPC_ID_DATA_RECEIVER, &transfer(300, 2));

        let (packet, ready) = h.ack().await;
        assert_eq!(packet.meta.auth, Auth::Network);
        assert_eq!(packet.meta.address, Address::ALL);
        assert_eq!(ready.request_id, 0x55);
        assert!(ready.offsets.is_empty());

        let mut offsets = Vec::new();
        for (i, chunk) in total.chunks(64).enumerate() {
            h.data(0x55, (i * 64) as u32, chunk);
            offsets.push((i * 64) as u32);
        }

        // Five chunks: ACKs after chunks 2 and 4, the last chunk is not ACKed
        let (_, ack) = h.ack().await;
        assert_eq!(ack.offsets, vec![0, 64]);
        let (_, ack) = h.ack().await;
        assert_eq!(ack.offsets, vec![128, 192]);

        let (packet, header, rest) = h.response().await;
        assert_eq!(packet.meta.auth, Auth::Device);
        assert_eq!(header.request_id, 0x55);
        assert_eq!(header.return_code, 0);
        assert_eq!(receiver_result(&rest), (300, crc32(&total)));
    }

    #[tokio::test]
    async fn data_receiver_ignores_foreign_request_ids() {
        let mut h = Harness::start(128);
        h.command(Auth::Device, 0x77, RPC_ID_DATA_RECEIVER, &transfer(8, 0));
        h.ack().await;

        h.data(0x78, 0, &[1; 8]);
        h.data(0x77, 0, &[2; 8]);

        let (_, header, rest) = h.response().await;
        assert_eq!(header.return_code, 0);
        assert_eq!(receiver_result(&rest), (8, crc32(&[2; 8])));
    }

    #[tokio::test]
    async fn data_receiver_rejects_excess_data() {
        let mut h = Harness::start(128);
        h.command(Auth::Device, 1, RPC_ID_DATA_RECEIVER, &transfer(10, 0));
        h.ack().await;
        h.data(1, 0, &[0; 64]);

        let (_, header, rest) = h.response().await;
        assert_eq!(header.return_code, -(errno::EINVAL as i16));
        assert_eq!(receiver_result(&rest), (0, 0));
    }

    #[tokio::test]
    async fn data_receiver_rejects_unaligned_and_skipped_offsets() {
        let mut h = Harness::start(128);
        h.command(Auth::Device, 2, RPC_ID_DATA_RECEIVER, &transfer(100, 0));
        h.ack().await;
        h.data(2, 0, &[0; 10]);
        // Next expected offset is 10, which is itself unaligned
        h.data(2, 10, &[0; 10]);
        let (_, header, rest) = h.response().await;
        assert_eq!(header.return_code, -(errno::EINVAL as i16));
        assert_eq!(receiver_result(&rest).0, 10);

        h.command(Auth::Device, 3, RPC_ID_DATA_RECEIVER, &transfer(100, 0));
        h.ack().await;
        h.data(3, 0, &[0; 16]);
        h.data(3, 32, &[0; 16]);
        let (_, header, rest) = h.response().await;
        assert_eq!(header.return_code, -(errno::EINVAL as i16));
        assert_eq!(receiver_result(&rest).0, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn data_receiver_times_out() {
        let mut registry = CommandRegistry::new();
        register_builtins(&mut registry).unwrap();
        let (server, queues) = RpcServer::new(registry);
        let (iface, mut tx) = ChannelInterface::new("dummy", 64);
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        let mut payload = Vec::new();
        RequestHeader {
            request_id: 9,
            command_id: RPC_ID_DATA_RECEIVER,
        }
        .encode(&mut payload);
        payload.extend_from_slice(&transfer(64, 0));
        queues.queue_command(RxPacket::new(
            Packet::new(PacketType::RpcCmd, Auth::Device, Address::ALL, payload),
            iface.clone(),
        ));

        let ready = tx.recv().await.unwrap();
        assert_eq!(ready.meta.packet_type, PacketType::RpcDataAck);

        let begin = Instant::now();
        let rsp = tx.recv().await.unwrap();
        assert!(begin.elapsed() >= Duration::from_millis(500));
        let (header, _) = ResponseHeader::decode(&rsp.payload).unwrap();
        assert_eq!(header.return_code, -(errno::EAGAIN as i16));
        cancel.cancel();
    }

    // ── Device commands ───────────────────────────────────────────────────────

    fn device(
        max_payload: usize,
        flash: Arc<MemoryBackend>,
        states: watch::Receiver<AppStates>,
    ) -> Harness {
        let mut registry = CommandRegistry::new();
        register_device_commands(
            &mut registry,
            DataLoggerRead::new().with_logger(LOGGER_FLASH_ONBOARD, flash),
            StatesQuery::new(states),
        )
        .unwrap();
        Harness::with_registry(registry, max_payload)
    }

    /// 64 byte blocks `0..written`, keeping the newest `retention`.
    async fn flash(written: u32, retention: usize) -> Arc<MemoryBackend> {
        let backend = MemoryBackend::with_block_size("flash", 64).with_retention(retention);
        for block in 0..written {
            let bytes: Vec<u8> = (0..64).map(|i| (block * 64 + i) as u8 ^ 0x5A).collect();
            backend.write_block(BLOCK_TYPE_TDF, &bytes).await.unwrap();
        }
        Arc::new(backend)
    }

    fn read(logger: u8, start_block: u32, last_block: u32) -> Vec<u8> {
        let mut out = Vec::new();
        DataLoggerReadParams {
            transfer: DataTransferParams {
                size: 0,
                rx_ack_period: 0,
            },
            logger,
            start_block,
            last_block,
        }
        .encode(&mut out);
        out
    }

    /// Collect `RpcData` until the response; returns the bytes and chunk sizes.
    async fn read_stream(h: &mut Harness, request_id: u32) -> (Vec<u8>, Vec<usize>, Vec<u8>) {
        let mut data = Vec::new();
        let mut chunks = Vec::new();
        loop {
            let packet = h.next().await.expect("packet");
            assert_eq!(packet.meta.auth, Auth::Device);
            match packet.meta.packet_type {
                PacketType::RpcData => {
                    let (header, bytes) = DataHeader::decode(&packet.payload).unwrap();
                    assert_eq!(header.request_id, request_id);
                    assert_eq!(header.offset as usize, data.len());
                    chunks.push(bytes.len());
                    data.extend_from_slice(bytes);
                }
                PacketType::RpcRsp => {
                    let (header, rest) = ResponseHeader::decode(&packet.payload).unwrap();
                    assert_eq!(header.command_id, RPC_ID_DATA_LOGGER_READ);
                    assert_eq!(header.return_code, 0);
                    return (data, chunks, rest.to_vec());
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn data_logger_read_streams_block_range() {
        let backend = flash(4, usize::MAX).await;
        let blocks = backend.blocks();
        let (_tx, states) = watch::channel(AppStates::new());
        let mut h = device(64, backend, states);

        h.command(Auth::Device, 0x31, RPC_ID_DATA_LOGGER_READ, &read(LOGGER_FLASH_ONBOARD, 1, 2));
        let (data, chunks, rest) = read_stream(&mut h, 0x31).await;
        let expected = [blocks[1].as_slice(), blocks[2].as_slice()].concat();
        assert_eq!(data, expected);
        // 56 byte packets run across the block boundary
        assert_eq!(chunks, vec![56, 56, 16]);
        assert_eq!(receiver_result(&rest), (128, crc32(&expected)));
    }

    #[tokio::test]
    async fn data_logger_read_newest_block() {
        let backend = flash(4, usize::MAX).await;
        let blocks = backend.blocks();
        let (_tx, states) = watch::channel(AppStates::new());
        let mut h = device(128, backend, states);

        let params = read(LOGGER_FLASH_ONBOARD, 2, LAST_BLOCK_NEWEST);
        h.command(Auth::Device, 0x32, RPC_ID_DATA_LOGGER_READ, &params);
        let (data, chunks, rest) = read_stream(&mut h, 0x32).await;
        assert_eq!(data, [blocks[2].as_slice(), blocks[3].as_slice()].concat());
        assert_eq!(chunks, vec![120, 8]);
        assert_eq!(receiver_result(&rest), (128, crc32(&data)));
    }

    #[tokio::test]
    async fn data_logger_read_rejects_unstored_ranges() {
        // Blocks 0 and 1 have been overwritten
        let (_tx, states) = watch::channel(AppStates::new());
        let mut h = device(64, flash(5, 3).await, states);

        let cases = [
            (read(LOGGER_FLASH_ONBOARD, 1, 3), -errno::EINVAL),
            (read(LOGGER_FLASH_ONBOARD, 2, 5), -errno::EINVAL),
            (read(LOGGER_FLASH_ONBOARD, 4, 3), -errno::EINVAL),
            (read(LOGGER_FLASH_REMOVABLE, 2, 4), -errno::ENODEV),
            (read(LOGGER_FLASH_ONBOARD, 2, 4)[..8].to_vec(), -errno::EINVAL),
        ];
        for (id, (params, rc)) in (1u32..).zip(cases.iter()) {
            h.command(Auth::Device, id, RPC_ID_DATA_LOGGER_READ, params);
            let (_, header, _) = h.response().await;
            assert_eq!(header.request_id, id);
            assert_eq!(header.return_code, *rc as i16);
        }

        // Nothing stored at all
        let (_tx, states) = watch::channel(AppStates::new());
        let mut h = device(64, flash(0, usize::MAX).await, states);
        let params = read(LOGGER_FLASH_ONBOARD, 0, LAST_BLOCK_NEWEST);
        h.command(Auth::Device, 9, RPC_ID_DATA_LOGGER_READ, &params);
        let (_, header, _) = h.response().await;
        assert_eq!(header.return_code, -(errno::EINVAL as i16));

        // Stored data needs device authentication
        let (_tx, states) = watch::channel(AppStates::new());
        let mut h = device(64, flash(1, usize::MAX).await, states);
        h.command(Auth::Network, 10, RPC_ID_DATA_LOGGER_READ, &read(LOGGER_FLASH_ONBOARD, 0, 0));
        let (_, header, _) = h.response().await;
        assert_eq!(header.return_code, -(errno::EACCES as i16));
        assert!(h.next().await.is_none());
    }

    #[tokio::test]
    async fn states_query_pages_set_states() {
        let mut initial = AppStates::new().with(AppState::Rebooting);
        initial.set_bit(5);
        initial.set_bit(40);
        let (tx, states) = watch::channel(initial.with(AppState::ApplicationActive));
        let mut h = device(64, flash(0, usize::MAX).await, states);

        h.command(Auth::Network, 1, RPC_ID_STATES_QUERY, &[0]);
        let (_, header, rest) = h.response().await;
        assert_eq!(header.return_code, 0);
        assert_eq!(rest, vec![0, 0, 0, 0, 1, 0, 0, 5, 0, 0, 40, 0, 0]);

        h.command(Auth::Network, 2, RPC_ID_STATES_QUERY, &[2]);
        let (_, _, rest) = h.response().await;
        assert_eq!(rest, vec![0, 5, 0, 0, 40, 0, 0]);

        h.command(Auth::Network, 3, RPC_ID_STATES_QUERY, &[10]);
        let (_, _, rest) = h.response().await;
        assert_eq!(rest, vec![0]);

        // Two entries fit, the other two are left for the next page
        h.iface.set_max_payload(ResponseHeader::LEN + 1 + 2 * 3 + 2);
        h.command(Auth::Network, 4, RPC_ID_STATES_QUERY, &[0]);
        let (_, _, rest) = h.response().await;
        assert_eq!(rest, vec![2, 0, 0, 0, 1, 0, 0]);

        // Later changes are visible
        h.iface.set_max_payload(64);
        tx.send_replace(AppStates::new().with(AppState::ApplicationActive));
        h.command(Auth::Network, 5, RPC_ID_STATES_QUERY, &[0]);
        let (_, _, rest) = h.response().await;
        assert_eq!(rest, vec![0, 1, 0, 0]);

        h.command(Auth::Network, 6, RPC_ID_STATES_QUERY, &[]);
        let (_, header, _) = h.response().await;
        assert_eq!(header.return_code, -(errno::EINVAL as i16));
    }

    // ── DataChannel ───────────────────────────────────────────────────────────

    fn channel() -> (DataChannel, mpsc::UnboundedSender<RxPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DataChannel::new(rx), tx)
    }

    #[tokio::test]
    async fn ack_period_bounds() {
        let (mut ch, _tx) = channel();
        let (iface, mut out) = ChannelInterface::new("acks", 64);

        // Disabled periods never send
        for period in [0u8, 9] {
            for offset in 0..10 {
                ch.ack_data(iface.as_ref(), 1, offset * 4, period).await;
            }
        }
        assert!(out.try_recv().is_err());

        for offset in 0..8 {
            ch.ack_data(iface.as_ref(), 1, offset * 4, 8).await;
        }
        let ack = DataAck::decode(&out.try_recv().unwrap().payload).unwrap();
        assert_eq!(ack.offsets, (0..8).map(|o| o * 4).collect::<Vec<_>>());

        // Reset discards recorded offsets
        ch.ack_data(iface.as_ref(), 1, 0, 2).await;
        ch.reset();
        ch.ack_data(iface.as_ref(), 1, 4, 2).await;
        assert!(out.try_recv().is_err());
        ch.ack_data(iface.as_ref(), 1, 8, 2).await;
        let ack = DataAck::decode(&out.try_recv().unwrap().payload).unwrap();
        assert_eq!(ack.offsets, vec![4, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn pull_data_deadline_is_absolute() {
        let (mut ch, tx) = channel();
        let (iface, _out) = ChannelInterface::new("pull", 64);

        // A stream of foreign packets does not extend the timeout
        let feeder = tokio::spawn(async move {
            for _ in 0..20 {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let mut payload = Vec::new();
                DataHeader {
                    request_id: 2,
                    offset: 0,
                }
                .encode(&mut payload);
                let packet = Packet::new(PacketType::RpcData, Auth::Device, Address::ALL, payload);
                let _ = tx.send(RxPacket::new(packet, iface.clone()));
            }
        });

        let begin = Instant::now();
        let err = ch.pull_data(1, 0, Duration::from_millis(500)).await.unwrap_err();
        assert_eq!(err, RpcError::DataTimeout { expected: 0 });
        assert_eq!(err.errno(), -errno::EAGAIN);
        assert!(begin.elapsed() < Duration::from_millis(600));
        feeder.abort();
    }
}
