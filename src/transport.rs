use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::config::MessagingConfig;

/// This is the abstraction for sending a datagram, introduced to decouple the messaging layer
///  from UDP sockets for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

/// The receiving half of a UDP socket, introduced to mock socket errors away in tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveSocket: Send + Sync + 'static {
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl ReceiveSocket for UdpSocket {
    async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.recv_from(buf).await
    }
}

/// Receiving side of the transport: called once per received datagram
#[async_trait]
pub trait DatagramHandler: Send + Sync + 'static {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]);
}


pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_datagram_size: usize,
    cancel_sender: broadcast::Sender<()>,
}

impl UdpTransport {
    pub async fn bind(config: &MessagingConfig) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(config.self_addr).await?;
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        let (cancel_sender, _) = broadcast::channel(1);

        Ok(UdpTransport {
            socket: Arc::new(socket),
            max_datagram_size: config.max_datagram_size,
            cancel_sender,
        })
    }

    pub fn cancel_recv_loop(&self) {
        match self.cancel_sender.send(()) {
            Ok(_) => info!("canceling receive loop"),
            Err(_) => debug!("call to cancel_recv_loop while no receive loop is running"),
        }
    }

    /// Receives datagrams and passes them to `handler` until the loop is cancelled. Socket errors
    ///  are logged and do not end the loop: ICMP errors for earlier sends to unreachable peers
    ///  surface as receive errors on some platforms.
    pub async fn recv_loop(&self, handler: Arc<dyn DatagramHandler>) {
        trace!("starting receive loop on {:?}", self.socket.local_addr());
        do_recv_loop(self.socket.as_ref(), self.max_datagram_size, self.cancel_sender.subscribe(), handler).await
    }
}

async fn do_recv_loop(socket: &dyn ReceiveSocket, max_datagram_size: usize, mut cancel_receiver: broadcast::Receiver<()>, handler: Arc<dyn DatagramHandler>) {
    // one extra byte to detect datagrams exceeding the configured maximum
    let mut buf = vec![0u8; max_datagram_size + 1];

    loop {
        tokio::select! {
            biased;
            _ = cancel_receiver.recv() => break,
            r = socket.recv_datagram(&mut buf) => {
                match r {
                    Ok((len, from)) => {
                        if len > max_datagram_size {
                            warn!("received a datagram from {:?} exceeding max datagram size of {} bytes - skipping", from, max_datagram_size);
                            continue;
                        }
                        handler.on_datagram(from, &buf[..len]).await;
                    }
                    Err(e) => {
                        error!(error = ?e, "error receiving from datagram socket");
                    }
                }
            }
        }
    }
    debug!("receive loop terminated");
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        trace!("UDP socket: sending {} bytes to {:?}", datagram.len(), to);
        self.socket.send_to(datagram, to).await?;
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    }
}
