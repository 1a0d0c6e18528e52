//! Packet transmit interface and an in-process channel implementation.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::client::RpcClient;
use super::server::ServerQueues;
use super::{Auth, Packet, RxPacket};
use crate::errno;

/// Default payload limit of a [`ChannelInterface`].
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("interface disconnected")]
    Disconnected,

    #[error("payload of {len} bytes exceeds interface limit of {max}")]
    TooLarge { len: usize, max: usize },
}

impl SendError {
    pub fn errno(&self) -> i32 {
        match self {
            SendError::Disconnected => -errno::ENOTCONN,
            SendError::TooLarge { .. } => -errno::EINVAL,
        }
    }
}

/// Transmit side of an ePacket interface.
#[async_trait]
pub trait PacketSink: Send + Sync {
    fn name(&self) -> &str;

    /// Largest payload a single packet can carry, `0` while disconnected.
    fn max_payload(&self) -> usize;

    async fn send(&self, packet: Packet) -> Result<(), SendError>;
}

// ── ChannelInterface ──────────────────────────────────────────────────────────

/// Interface whose transmitted packets land on an mpsc receiver.
///
/// Used to wire the client and server together in-process, and by tests to
/// observe what a component sends.
#[derive(Debug)]
pub struct ChannelInterface {
    name: String,
    tx: mpsc::UnboundedSender<Packet>,
    max_payload: AtomicUsize,
    connected: AtomicBool,
}

impl ChannelInterface {
    pub fn new(
        name: impl Into<String>,
        max_payload: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let interface = Arc::new(Self {
            name: name.into(),
            tx,
            max_payload: AtomicUsize::new(max_payload),
            connected: AtomicBool::new(true),
        });
        (interface, rx)
    }

    pub fn set_max_payload(&self, max_payload: usize) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl PacketSink for ChannelInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_payload(&self) -> usize {
        if self.connected.load(Ordering::SeqCst) {
            self.max_payload.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    async fn send(&self, packet: Packet) -> Result<(), SendError> {
        let max = self.max_payload();
        if max == 0 {
            return Err(SendError::Disconnected);
        }
        if packet.payload.len() > max {
            return Err(SendError::TooLarge {
                len: packet.payload.len(),
                max,
            });
        }
        trace!(
            interface = %self.name,
            packet_type = ?packet.meta.packet_type,
            len = packet.payload.len(),
            "tx"
        );
        self.tx.send(packet).map_err(|_| SendError::Disconnected)
    }
}

// ── In-process bridges ────────────────────────────────────────────────────────

/// Deliver packets sent by a client to the server queues.
///
/// Packets are attributed to `reply_interface` and received at `link_auth`,
/// the level the simulated link decrypts at.
pub fn bridge_to_server(
    mut rx: mpsc::UnboundedReceiver<Packet>,
    queues: ServerQueues,
    reply_interface: Arc<dyn PacketSink>,
    link_auth: Auth,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(mut packet) = rx.recv().await {
            packet.meta.auth = link_auth;
            if !queues.receive(RxPacket::new(packet, reply_interface.clone())) {
                break;
            }
        }
        debug!("server bridge closed");
    })
}

/// Deliver packets sent by a server to a client.
pub fn bridge_to_client(
    mut rx: mpsc::UnboundedReceiver<Packet>,
    client: RpcClient,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            client.handle_packet(&packet);
        }
        debug!("client bridge closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Address, PacketType};

    fn packet(len: usize) -> Packet {
        Packet::new(PacketType::RpcData, Auth::Network, Address::ALL, vec![0; len])
    }

    #[tokio::test]
    async fn channel_interface_limits() {
        let (iface, mut rx) = ChannelInterface::new("chan", 16);

        iface.send(packet(16)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload.len(), 16);

        assert_eq!(
            iface.send(packet(17)).await.unwrap_err(),
            SendError::TooLarge { len: 17, max: 16 }
        );

        iface.set_connected(false);
        assert_eq!(iface.max_payload(), 0);
        let err = iface.send(packet(1)).await.unwrap_err();
        assert_eq!(err, SendError::Disconnected);
        assert_eq!(err.errno(), -errno::ENOTCONN);

        iface.set_connected(true);
        iface.set_max_payload(0);
        assert_eq!(iface.send(packet(1)).await.unwrap_err(), SendError::Disconnected);
        assert!(rx.try_recv().is_err());
    }
}
