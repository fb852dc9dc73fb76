//! UDP multicast transport: one socket per channel, a receive loop feeding the
//! dispatcher and a send loop draining the channel's outbound queue.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use dbs_core::{ChannelKind, Dispatcher};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;

/// Largest UDP payload; a PUTCHUNK with a full chunk fits.
const MAX_DATAGRAM: usize = 65_536;

pub struct ChannelSocket {
    kind: ChannelKind,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
}

impl ChannelSocket {
    /// Bind the channel's port on all interfaces and join its group.
    pub fn bind(kind: ChannelKind, cfg: ChannelConfig) -> std::io::Result<Self> {
        let socket = make_multicast_socket(cfg)?;
        info!(channel = %kind, group = %cfg.group, port = cfg.port, "joined multicast group");
        Ok(Self {
            kind,
            socket: Arc::new(socket),
            dest: cfg.addr(),
        })
    }

    /// Spawn the receive and send loops. Both run until the runtime shuts down.
    pub fn spawn(self, dispatcher: Dispatcher, outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
        tokio::spawn(recv_loop(self.kind, self.socket.clone(), dispatcher));
        tokio::spawn(send_loop(self.kind, self.socket, self.dest, outbound));
    }
}

fn make_multicast_socket(cfg: ChannelConfig) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.port))?;
    std_sock.join_multicast_v4(&cfg.group, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(kind: ChannelKind, socket: Arc<UdpSocket>, dispatcher: Dispatcher) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let routed = dispatcher.handle_datagram(&buf[..n]);
                debug!(channel = %kind, %from, len = n, ?routed, "datagram");
            }
            Err(e) => warn!(channel = %kind, error = %e, "receive failed"),
        }
    }
}

async fn send_loop(
    kind: ChannelKind,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = socket.send_to(&bytes, dest).await {
            warn!(channel = %kind, error = %e, len = bytes.len(), "send failed");
        }
    }
}
