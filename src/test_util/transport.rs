use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use crate::transport::Transport;

/// A [Transport] that does not send anything but records all datagrams
#[derive(Debug)]
pub struct TrackingTransport {
    local_addr: SocketAddr,
    sent: Mutex<Vec<(SocketAddr, Bytes)>>,
}

impl TrackingTransport {
    pub fn new(local_addr: SocketAddr) -> TrackingTransport {
        TrackingTransport {
            local_addr,
            sent: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SocketAddr, Bytes)>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// returns all datagrams sent so far, in the order they were sent
    pub fn sent(&self) -> Vec<(SocketAddr, Bytes)> {
        self.lock().clone()
    }

    /// returns sent datagrams, clearing the internal buffer
    pub fn take_sent(&self) -> Vec<(SocketAddr, Bytes)> {
        std::mem::take(&mut *self.lock())
    }
}

#[async_trait]
impl Transport for TrackingTransport {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        self.lock().push((to, Bytes::copy_from_slice(datagram)));
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
