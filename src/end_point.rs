use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::select;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::MessagingConfig;
use crate::dedup::RecentReceipts;
use crate::frame::Frame;
use crate::handshake::Handshake;
use crate::message::{Message, MessageTypeId};
use crate::message_bus::MessageBus;
use crate::paging::{self, Page, Reassembler};
use crate::receipt::{ReceiptSignature, SignatureFactory};
use crate::repeater::MessageRepeater;
use crate::repository::{MessageRepository, TrackingEvent};
use crate::transport::{DatagramHandler, Transport};

/// An [EndPoint] is where the messaging layer's parts come together. It sends messages reliably
///  or unreliably, and it handles received datagrams: acknowledging, reassembling, de-duplicating
///  and dispatching them to the message bus.
///
/// Reliable sends are tracked in the repository until they are acknowledged or expire, and the
///  repeater re-sends them in the meantime.
pub struct EndPoint {
    config: Arc<MessagingConfig>,
    transport: Arc<dyn Transport>,
    signatures: Arc<dyn SignatureFactory>,
    repository: Arc<MessageRepository>,
    repeater: MessageRepeater,
    reassembler: Arc<Reassembler>,
    recent_receipts: Arc<RecentReceipts>,
    handshake: Handshake,
    message_bus: Arc<MessageBus>,
    num_malformed_datagrams: AtomicU64,
    housekeeping: JoinHandle<()>,
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.housekeeping.abort();
    }
}

impl EndPoint {
    pub fn new(
        config: Arc<MessagingConfig>,
        transport: Arc<dyn Transport>,
        signatures: Arc<dyn SignatureFactory>,
        message_bus: Arc<MessageBus>,
    ) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let self_addr = transport.local_addr();
        if self_addr.ip().is_unspecified() {
            warn!("end point has unspecified local address {:?} - handshakes only succeed if peers see the same address", self_addr);
        }

        let repository = Arc::new(MessageRepository::new(&config));
        let repeater = MessageRepeater::new(transport.clone(), repository.clone(), config.max_datagram_size);
        let reassembler = Arc::new(Reassembler::new(&config));
        let recent_receipts = Arc::new(RecentReceipts::new(config.dedup_window));

        let housekeeping = tokio::spawn(Self::do_housekeeping(
            (config.page_set_ttl.min(config.dedup_window) / 2).max(Duration::from_millis(1)),
            reassembler.clone(),
            recent_receipts.clone(),
        ));

        Ok(EndPoint {
            handshake: Handshake::new(self_addr, &config.shared_secret),
            config,
            transport,
            signatures,
            repository,
            repeater,
            reassembler,
            recent_receipts,
            message_bus,
            num_malformed_datagrams: AtomicU64::new(0),
            housekeeping,
        })
    }

    async fn do_housekeeping(interval: Duration, reassembler: Arc<Reassembler>, recent_receipts: Arc<RecentReceipts>) {
        let mut ticks = time::interval(interval);
        loop {
            ticks.tick().await;

            let now = Instant::now();
            let num_page_sets = reassembler.evict_expired(now);
            let num_receipts = recent_receipts.evict_expired(now);
            if num_page_sets > 0 || num_receipts > 0 {
                debug!("housekeeping: evicted {} incomplete page sets and {} remembered receipts", num_page_sets, num_receipts);
            }
        }
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn repository(&self) -> &Arc<MessageRepository> {
        &self.repository
    }

    pub fn message_bus(&self) -> &Arc<MessageBus> {
        &self.message_bus
    }

    /// Notifications of reliable messages that were acknowledged or given up
    pub fn subscribe_tracking_events(&self) -> broadcast::Receiver<TrackingEvent> {
        self.repository.subscribe()
    }

    pub fn is_connected(&self, peer: SocketAddr) -> bool {
        self.handshake.is_verified(peer)
    }

    /// The number of received datagrams that could not be decoded
    pub fn num_malformed_datagrams(&self) -> u64 {
        self.num_malformed_datagrams.load(Ordering::Acquire)
    }

    /// The number of received pages that were dropped as protocol violations
    pub fn num_dropped_pages(&self) -> u64 {
        self.reassembler.dropped_pages()
    }

    fn check_message_size(&self, payload: &Bytes) -> anyhow::Result<()> {
        if payload.len() > self.config.max_message_size {
            bail!("message of length {} exceeds the maximum message size of {}", payload.len(), self.config.max_message_size);
        }
        Ok(())
    }

    async fn send_datagrams(&self, to: SocketAddr, datagrams: &[Bytes]) -> anyhow::Result<()> {
        for datagram in datagrams {
            self.transport.send(to, datagram).await?;
        }
        Ok(())
    }

    async fn send_frame(&self, to: SocketAddr, frame: &Frame) {
        if let Err(e) = self.transport.send(to, &frame.encode()).await {
            warn!("error sending {:?} to {:?}: {}", frame.kind(), to, e);
        }
    }

    /// Sends a message once, without tracking or acknowledgement. Messages that need paging get a
    ///  signature to correlate their pages.
    pub async fn send_unreliable(&self, to: SocketAddr, type_id: MessageTypeId, payload: impl Into<Bytes>) -> anyhow::Result<()> {
        let payload = payload.into();
        self.check_message_size(&payload)?;

        let mut message = Message::unreliable(type_id, payload);
        if Frame::encoded_message_len(&message) > self.config.max_datagram_size {
            message.signature = Some(self.signatures.new_signature());
        }

        trace!("sending {:?} to {:?} unreliably", message, to);
        let datagrams = paging::split(&message, self.config.max_datagram_size)?;
        self.send_datagrams(to, &datagrams).await
    }

    /// Sends a message that is re-sent until it is acknowledged or its TTL expires. This connects
    ///  to the peer first if necessary.
    ///
    /// The returned signature identifies the message in [TrackingEvent]s.
    pub async fn send_reliable(&self, to: SocketAddr, type_id: MessageTypeId, payload: impl Into<Bytes>) -> anyhow::Result<ReceiptSignature> {
        let payload = payload.into();
        self.check_message_size(&payload)?;

        self.connect(to).await?;

        let signature = self.signatures.new_signature();
        let message = Message::with_signature(type_id, signature, payload);
        let datagrams = paging::split(&message, self.config.max_datagram_size)?;

        // tracked before sending, so an acknowledgement can never arrive for an untracked message
        self.repository.add_message_with_ttl(message.clone(), to, self.config.reliable_ttl)?;

        trace!("sending {:?} to {:?} reliably", message, to);
        if let Err(e) = self.send_datagrams(to, &datagrams).await {
            warn!("error sending {:?} to {:?} - relying on re-sends: {}", message, to, e);
        }

        if let Err(e) = self.repeater.track(&message, to, self.config.repeat_interval) {
            self.repository.remove_message(&signature);
            return Err(e);
        }
        Ok(signature)
    }

    /// Performs the handshake with a peer unless it is verified already. Challenges are re-sent
    ///  every repeat interval until the peer responds or the handshake times out.
    pub async fn connect(&self, to: SocketAddr) -> anyhow::Result<()> {
        let mut verified = self.handshake.subscribe_verified();

        let handshake = async {
            while let Some(nonce) = self.handshake.challenge(to) {
                trace!("sending handshake challenge to {:?}", to);
                self.send_frame(to, &Frame::Challenge { nonce }).await;

                select! {
                    _ = verified.changed() => {}
                    _ = time::sleep(self.config.repeat_interval) => {}
                }
            }
        };

        match time::timeout(self.config.handshake_timeout, handshake).await {
            Ok(()) => Ok(()),
            Err(_) => {
                self.handshake.abandon(to);
                Err(anyhow!("handshake with {:?} timed out after {:?}", to, self.config.handshake_timeout))
            }
        }
    }

    /// Forgets everything about a peer: tracked messages, incomplete page sets and handshake
    ///  state. Returns the number of tracked messages that were given up.
    pub fn disconnect(&self, peer: SocketAddr) -> usize {
        let num_messages = self.repository.remove_all_for(peer);
        let num_page_sets = self.reassembler.evict_endpoint(peer);
        self.handshake.forget(peer);

        debug!("disconnected {:?}: gave up {} tracked messages and {} incomplete page sets", peer, num_messages, num_page_sets);
        num_messages
    }

    async fn handle_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let frame = match Frame::try_deser(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("received a malformed datagram from {:?} - dropping: {}", from, e);
                self.num_malformed_datagrams.fetch_add(1, Ordering::AcqRel);
                return;
            }
        };
        trace!("received {:?} frame from {:?}", frame.kind(), from);

        match frame {
            Frame::Message(message) => self.on_message(from, message).await,
            Frame::Page(page) => self.on_page(from, page).await,
            Frame::Ack(signature) => self.on_ack(from, signature),
            Frame::Challenge { nonce } => {
                if let Some(response) = self.handshake.respond(from, nonce) {
                    self.send_frame(from, &response).await;
                }
            }
            Frame::ChallengeResponse { nonce, digest } => {
                self.handshake.on_response(from, nonce, &digest);
            }
        }
    }

    fn on_ack(&self, from: SocketAddr, signature: ReceiptSignature) {
        match self.repository.get(&signature) {
            Ok(tracked) if tracked.endpoint != from => {
                warn!("acknowledgement for {:?} from {:?}, but it was sent to {:?} - ignoring", signature, from, tracked.endpoint);
            }
            Ok(_) => {
                if self.repository.remove_message(&signature) {
                    debug!("{:?} acknowledged by {:?}", signature, from);
                }
            }
            Err(_) => {
                trace!("acknowledgement from {:?} for untracked {:?} - ignoring", from, signature);
            }
        }
    }

    async fn on_page(&self, from: SocketAddr, page: Page) {
        if self.recent_receipts.contains(&page.signature) {
            trace!("page for already received {:?} - acknowledging again", page.signature);
            self.send_frame(from, &Frame::Ack(page.signature)).await;
            return;
        }

        if let Some(message) = self.reassembler.on_page(from, page) {
            self.on_message(from, message).await;
        }
    }

    async fn on_message(&self, from: SocketAddr, message: Message) {
        if let Some(signature) = message.signature {
            self.send_frame(from, &Frame::Ack(signature)).await;

            if !self.recent_receipts.check_and_insert(signature) {
                debug!("{:?} from {:?} was received before - not dispatching it again", message, from);
                return;
            }
        }

        self.message_bus.dispatch(from, &message).await;
    }
}

#[async_trait]
impl DatagramHandler for EndPoint {
    async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        self.handle_datagram(from, datagram)
            .instrument(span)
            .await
    }
}
