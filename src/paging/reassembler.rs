use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bit_set::BitSet;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::MessagingConfig;
use crate::message::{Message, MessageTypeId};
use crate::paging::Page;
use crate::receipt::ReceiptSignature;
use crate::safe_converter::SafeCast;

/// Collects pages until a message is complete. Page sets are keyed by the message signature,
///  pages may arrive in any order and duplicates are ignored.
///
/// Pages that can not belong to a well-formed message (index out of range, inconsistent total or
///  type, more pages than the maximum message size allows) are dropped and counted without
///  disturbing the page set they claim to belong to.
pub struct Reassembler {
    page_set_ttl: Duration,
    max_pending_page_sets: usize,
    max_pages: usize,
    max_message_size: usize,
    inner: Mutex<ReassemblerInner>,
}

#[derive(Default)]
struct ReassemblerInner {
    page_sets: FxHashMap<ReceiptSignature, PageSet>,
    dropped_pages: u64,
}

struct PageSet {
    sender: SocketAddr,
    type_id: MessageTypeId,
    total: u16,
    received: BitSet,
    chunks: Vec<Bytes>,
    num_bytes: usize,
    created: Instant,
}

impl PageSet {
    fn new(sender: SocketAddr, page: &Page) -> PageSet {
        PageSet {
            sender,
            type_id: page.type_id,
            total: page.total,
            received: BitSet::with_capacity(page.total.safe_cast()),
            chunks: vec![Bytes::new(); page.total.safe_cast()],
            num_bytes: 0,
            created: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received.len() == self.total.safe_cast()
    }

    fn assemble(self) -> Bytes {
        let mut payload = BytesMut::with_capacity(self.num_bytes);
        for chunk in self.chunks {
            payload.extend_from_slice(&chunk);
        }
        payload.freeze()
    }
}

impl Reassembler {
    pub fn new(config: &MessagingConfig) -> Reassembler {
        Reassembler {
            page_set_ttl: config.page_set_ttl,
            max_pending_page_sets: config.max_pending_page_sets,
            max_pages: config.max_pages(),
            max_message_size: config.max_message_size,
            inner: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReassemblerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a page, returning the complete message if this page was the last one missing
    pub fn on_page(&self, sender: SocketAddr, page: Page) -> Option<Message> {
        let mut inner = self.lock();

        if page.total == 0 || page.index >= page.total {
            warn!("page {} of {} for {:?} from {:?}: index out of range - dropping", page.index, page.total, page.signature, sender);
            inner.dropped_pages += 1;
            return None;
        }
        if page.total as usize > self.max_pages {
            warn!("page set {:?} from {:?} announces {} pages, maximum is {} - dropping", page.signature, sender, page.total, self.max_pages);
            inner.dropped_pages += 1;
            return None;
        }

        if !inner.page_sets.contains_key(&page.signature) {
            if inner.page_sets.len() >= self.max_pending_page_sets {
                Self::evict_oldest(&mut inner);
            }
            inner.page_sets.insert(page.signature, PageSet::new(sender, &page));
        }

        let inner = &mut *inner;
        let Some(page_set) = inner.page_sets.get_mut(&page.signature) else {
            return None;
        };

        if page_set.sender != sender || page_set.type_id != page.type_id || page_set.total != page.total {
            warn!("page {} for {:?} from {:?} is inconsistent with its page set - dropping", page.index, page.signature, sender);
            inner.dropped_pages += 1;
            return None;
        }

        let index: usize = page.index.safe_cast();
        if page_set.received.contains(index) {
            trace!("duplicate page {} for {:?} - ignoring", page.index, page.signature);
            return None;
        }
        if page_set.num_bytes + page.chunk.len() > self.max_message_size {
            warn!("page set {:?} from {:?} exceeds maximum message size - dropping page", page.signature, sender);
            inner.dropped_pages += 1;
            return None;
        }

        page_set.num_bytes += page.chunk.len();
        page_set.received.insert(index);
        page_set.chunks[index] = page.chunk;

        if !page_set.is_complete() {
            return None;
        }

        let page_set = inner.page_sets.remove(&page.signature)?;
        let type_id = page_set.type_id;
        trace!("page set {:?} is complete", page.signature);
        Some(Message::with_signature(type_id, page.signature, page_set.assemble()))
    }

    fn evict_oldest(inner: &mut ReassemblerInner) {
        let oldest = inner.page_sets.iter()
            .min_by_key(|(_, page_set)| page_set.created)
            .map(|(signature, _)| *signature);

        if let Some(signature) = oldest {
            debug!("too many incomplete page sets - evicting {:?}", signature);
            inner.page_sets.remove(&signature);
        }
    }

    /// Discards page sets that were created more than the page set TTL before `now`. Returns the
    ///  number of evicted page sets.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let before = inner.page_sets.len();
        inner.page_sets.retain(|signature, page_set| {
            let keep = page_set.created + self.page_set_ttl > now;
            if !keep {
                debug!("page set {:?} from {:?} is incomplete after {:?} - evicting", signature, page_set.sender, self.page_set_ttl);
            }
            keep
        });
        before - inner.page_sets.len()
    }

    /// Discards all incomplete page sets received from a given endpoint
    pub fn evict_endpoint(&self, endpoint: SocketAddr) -> usize {
        let mut inner = self.lock();
        let before = inner.page_sets.len();
        inner.page_sets.retain(|_, page_set| page_set.sender != endpoint);
        before - inner.page_sets.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().page_sets.len()
    }

    /// The number of pages dropped as protocol violations since this reassembler was created
    pub fn dropped_pages(&self) -> u64 {
        self.lock().dropped_pages
    }
}
