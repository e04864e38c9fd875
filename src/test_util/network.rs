use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::transport::{DatagramHandler, Transport};

type DropFilter = Box<dyn FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send>;

/// An in-memory network connecting end points by address. Every datagram is delivered in a task
///  of its own, so delivery is asynchronous like on a real network.
///
/// A drop filter simulates packet loss: it is called with `(from, to, datagram)` for every
///  datagram, and the datagram is dropped if it returns `true`.
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<FxHashMap<SocketAddr, Arc<dyn DatagramHandler>>>,
    drop_filter: Mutex<Option<DropFilter>>,
    num_dropped: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<LocalNetwork> {
        Default::default()
    }

    /// Creates a transport sending from `addr`. The transport does not keep the network alive.
    pub fn transport(self: &Arc<Self>, addr: SocketAddr) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: Arc::downgrade(self),
            addr,
        })
    }

    pub fn register(&self, addr: SocketAddr, handler: Arc<dyn DatagramHandler>) {
        self.handlers.write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, handler);
    }

    pub fn deregister(&self, addr: SocketAddr) {
        self.handlers.write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr);
    }

    pub fn set_drop_filter(&self, filter: impl FnMut(SocketAddr, SocketAddr, &[u8]) -> bool + Send + 'static) {
        *self.drop_filter.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.drop_filter.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// The number of datagrams dropped by the filter or for lack of a receiver
    pub fn num_dropped(&self) -> u64 {
        self.num_dropped.load(Ordering::Acquire)
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, datagram: &[u8]) {
        let dropped = self.drop_filter.lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .map(|filter| filter(from, to, datagram))
            .unwrap_or(false);
        if dropped {
            trace!("dropping datagram from {:?} to {:?}", from, to);
            self.num_dropped.fetch_add(1, Ordering::AcqRel);
            return;
        }

        let handler = self.handlers.read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&to)
            .cloned();
        let Some(handler) = handler else {
            trace!("no end point at {:?} - dropping datagram", to);
            self.num_dropped.fetch_add(1, Ordering::AcqRel);
            return;
        };

        let datagram = Bytes::copy_from_slice(datagram);
        tokio::spawn(async move {
            handler.on_datagram(from, &datagram).await;
        });
    }
}

pub struct LocalTransport {
    network: Weak<LocalNetwork>,
    addr: SocketAddr,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, to: SocketAddr, datagram: &[u8]) -> anyhow::Result<()> {
        if let Some(network) = self.network.upgrade() {
            network.deliver(self.addr, to, datagram);
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}
