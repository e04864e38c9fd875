use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

use crate::frame::Frame;

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// The address that the receiving UDP socket is bound to
    pub self_addr: SocketAddr,

    /// This is the payload size inside UDP datagrams that the messaging layer assumes. Messages
    ///  whose encoded form exceeds this size are split into pages.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value too big causes datagrams
    ///  to be fragmented or dropped on the way, choosing it too small wastes bandwidth.
    pub max_datagram_size: usize,

    /// Upper bound for the payload of a single message, paged or not. Page sets announcing more
    ///  pages than this allows are treated as a protocol violation.
    pub max_message_size: usize,

    /// Interval between two sweeps of the repository's TTL reaper. This bounds the latency with
    ///  which expired messages are removed.
    pub reaper_interval: Duration,

    /// Interval at which unacknowledged reliable messages are re-sent. This is also the interval
    ///  for re-sending handshake challenges.
    pub repeat_interval: Duration,

    /// Reliable messages are given up (and an `Expired` event is published) if they are not
    ///  acknowledged within this time.
    pub reliable_ttl: Duration,

    /// Incomplete page sets are evicted after this time
    pub page_set_ttl: Duration,
    /// Hard limit on the number of concurrently incomplete page sets - the oldest set is evicted
    ///  when a new one would exceed it
    pub max_pending_page_sets: usize,

    /// Signatures of received messages are remembered for this long to suppress duplicates
    ///  caused by re-sends whose acknowledgement got lost. Re-sends arrive for up to
    ///  `reliable_ttl`, so this must be at least as long.
    pub dedup_window: Duration,

    pub handshake_timeout: Duration,
    /// This is the shared secret of all peers, and it must be set to the same value everywhere
    ///  for handshakes to succeed.
    pub shared_secret: Vec<u8>,

    pub event_channel_capacity: usize,
}

impl MessagingConfig {
    pub fn new(self_addr: SocketAddr) -> MessagingConfig {
        MessagingConfig {
            self_addr,
            max_datagram_size: 1472,
            max_message_size: 256*1024,
            reaper_interval: Duration::from_millis(10),
            repeat_interval: Duration::from_millis(100),
            reliable_ttl: Duration::from_secs(5),
            page_set_ttl: Duration::from_secs(5),
            max_pending_page_sets: 1024,
            dedup_window: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            shared_secret: b"no secret".to_vec(),
            event_channel_capacity: 128,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_datagram_size <= Frame::PAGE_HEADER_LEN {
            bail!("datagram size of {} leaves no room for page payload", self.max_datagram_size);
        }
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.reaper_interval.is_zero() || self.repeat_interval.is_zero() {
            bail!("reaper and repeat intervals must be positive");
        }
        if self.reliable_ttl.is_zero() || self.page_set_ttl.is_zero() || self.dedup_window.is_zero() {
            bail!("TTLs must be positive");
        }
        if self.dedup_window < self.reliable_ttl {
            bail!("dedup window of {:?} is shorter than the reliable TTL of {:?}: re-sends would be dispatched twice", self.dedup_window, self.reliable_ttl);
        }
        if self.max_pending_page_sets == 0 {
            bail!("at least one pending page set must be allowed");
        }
        if self.event_channel_capacity == 0 {
            bail!("event channel capacity must be positive");
        }
        Ok(())
    }

    /// The number of payload bytes that fit into a single page
    pub fn page_chunk_size(&self) -> usize {
        self.max_datagram_size - Frame::PAGE_HEADER_LEN
    }

    /// The maximum number of pages a message of maximum size can be split into
    pub fn max_pages(&self) -> usize {
        self.max_message_size.div_ceil(self.page_chunk_size())
    }
}
