//! The repository tracks reliable messages that were sent but not yet acknowledged. An entry is
//!  removed when the message is acknowledged, when its TTL expires, or when the peer it was sent
//!  to is disconnected.
//!
//! There are two locks: one for the TTL set (deadline-ordered, owning the reaper handle) and one
//!  for the signature lookup. Operations that touch both always acquire the TTL lock first. Both
//!  are synchronous locks that are never held across an `.await`.
//!
//! Removals and expirations are published as [TrackingEvent]s, which is how the repeater learns
//!  that it can stop re-sending a message.

mod error;
mod reaper;

pub use error::RepositoryError;

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::MessagingConfig;
use crate::message::Message;
use crate::receipt::ReceiptSignature;
use reaper::Reaper;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrackingEvent {
    /// The message was removed explicitly, typically because it was acknowledged
    Removed { signature: ReceiptSignature, endpoint: SocketAddr },
    /// The message's TTL elapsed before it was removed
    Expired { signature: ReceiptSignature, endpoint: SocketAddr },
}

impl TrackingEvent {
    pub fn signature(&self) -> ReceiptSignature {
        match self {
            TrackingEvent::Removed { signature, .. } => *signature,
            TrackingEvent::Expired { signature, .. } => *signature,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TrackedMessage {
    pub endpoint: SocketAddr,
    pub message: Message,
}

struct TtlSet {
    deadlines: BTreeSet<(Instant, ReceiptSignature)>,
    by_signature: FxHashMap<ReceiptSignature, Instant>,
    reaper: Reaper,
}

impl TtlSet {
    fn insert(&mut self, signature: ReceiptSignature, deadline: Instant) {
        if let Some(previous) = self.by_signature.insert(signature, deadline) {
            self.deadlines.remove(&(previous, signature));
        }
        self.deadlines.insert((deadline, signature));
    }

    fn remove(&mut self, signature: &ReceiptSignature) -> bool {
        match self.by_signature.remove(signature) {
            Some(deadline) => self.deadlines.remove(&(deadline, *signature)),
            None => false,
        }
    }

    /// Removes and returns all signatures whose deadline is at or before `now`
    fn pop_expired(&mut self, now: Instant) -> Vec<ReceiptSignature> {
        let mut result = Vec::new();
        while let Some(&(deadline, signature)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            self.by_signature.remove(&signature);
            result.push(signature);
        }
        result
    }

    fn clear(&mut self) {
        self.deadlines.clear();
        self.by_signature.clear();
    }

    fn len(&self) -> usize {
        self.by_signature.len()
    }

    fn is_empty(&self) -> bool {
        self.by_signature.is_empty()
    }
}

pub(crate) struct RepositoryState {
    ttl: Mutex<TtlSet>,
    lookup: Mutex<FxHashMap<ReceiptSignature, TrackedMessage>>,
    events: broadcast::Sender<TrackingEvent>,
    reaper_interval: Duration,
}

/// Recovers the data from a poisoned lock: every critical section leaves the maps consistent
///  after each individual insert or remove
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RepositoryState {
    /// Removes everything that expired at `now` and publishes the expirations. Returns `true`
    ///  if the TTL set is empty afterwards, which terminates the calling reaper task.
    fn sweep(&self, now: Instant, generation: u64) -> bool {
        let (expired, drained) = {
            let mut ttl = lock(&self.ttl);
            let expired_signatures = ttl.pop_expired(now);

            let expired = {
                let mut lookup = lock(&self.lookup);
                expired_signatures.into_iter()
                    .filter_map(|signature| lookup.remove(&signature)
                        .map(|tracked| (signature, tracked.endpoint)))
                    .collect::<Vec<_>>()
            };

            let drained = ttl.is_empty();
            if drained {
                ttl.reaper.on_drained(generation);
            }
            (expired, drained)
        };

        for (signature, endpoint) in expired {
            debug!("{:?} to {:?} expired without acknowledgement", signature, endpoint);
            let _ = self.events.send(TrackingEvent::Expired { signature, endpoint });
        }
        drained
    }

    fn publish_removed(&self, removed: Vec<(ReceiptSignature, SocketAddr)>) {
        for (signature, endpoint) in removed {
            trace!("{:?} to {:?} removed", signature, endpoint);
            let _ = self.events.send(TrackingEvent::Removed { signature, endpoint });
        }
    }
}

pub struct MessageRepository {
    state: Arc<RepositoryState>,
}

impl Drop for MessageRepository {
    fn drop(&mut self) {
        lock(&self.state.ttl).reaper.stop();
    }
}

impl MessageRepository {
    pub fn new(config: &MessagingConfig) -> MessageRepository {
        let (events, _) = broadcast::channel(config.event_channel_capacity);

        MessageRepository {
            state: Arc::new(RepositoryState {
                ttl: Mutex::new(TtlSet {
                    deadlines: Default::default(),
                    by_signature: Default::default(),
                    reaper: Reaper::new(),
                }),
                lookup: Default::default(),
                events,
                reaper_interval: config.reaper_interval,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.state.events.subscribe()
    }

    fn insert_into_lookup(lookup: &mut FxHashMap<ReceiptSignature, TrackedMessage>, message: Message, endpoint: SocketAddr) -> Result<ReceiptSignature, RepositoryError> {
        let signature = message.signature
            .ok_or(RepositoryError::MissingReceipt)?;

        if lookup.contains_key(&signature) {
            return Err(RepositoryError::DuplicateSignature(signature));
        }
        lookup.insert(signature, TrackedMessage { endpoint, message });
        Ok(signature)
    }

    /// Tracks a message until it is removed explicitly
    pub fn add_message(&self, message: Message, endpoint: SocketAddr) -> Result<(), RepositoryError> {
        let mut lookup = lock(&self.state.lookup);
        let signature = Self::insert_into_lookup(&mut lookup, message, endpoint)?;
        trace!("tracking {:?} to {:?} without TTL", signature, endpoint);
        Ok(())
    }

    /// Tracks a message until it is removed explicitly or until `ttl` has elapsed, whichever
    ///  happens first. Expiry is detected by the reaper task, so it happens up to one reaper
    ///  interval late.
    pub fn add_message_with_ttl(&self, message: Message, endpoint: SocketAddr, ttl: Duration) -> Result<(), RepositoryError> {
        if ttl.is_zero() {
            return Err(RepositoryError::InvalidTtl);
        }
        let deadline = Instant::now() + ttl;

        let mut ttl_set = lock(&self.state.ttl);
        let signature = {
            let mut lookup = lock(&self.state.lookup);
            Self::insert_into_lookup(&mut lookup, message, endpoint)?
        };
        ttl_set.insert(signature, deadline);
        ttl_set.reaper.ensure_running(&self.state);

        trace!("tracking {:?} to {:?} with TTL {:?}", signature, endpoint, ttl);
        Ok(())
    }

    /// Returns `true` if the signature was tracked. Removing an untracked signature is a no-op,
    ///  which is what happens for late or duplicate acknowledgements.
    pub fn remove_message(&self, signature: &ReceiptSignature) -> bool {
        let removed = {
            let mut ttl = lock(&self.state.ttl);
            ttl.remove(signature);
            if !ttl.is_empty() {
                ttl.reaper.ensure_running(&self.state);
            }
            lock(&self.state.lookup).remove(signature)
        };

        match removed {
            Some(tracked) => {
                self.state.publish_removed(vec![(*signature, tracked.endpoint)]);
                true
            }
            None => false,
        }
    }

    /// Removes the message by its signature - a message without signature was never tracked
    pub fn remove_message_for(&self, message: &Message) -> Result<bool, RepositoryError> {
        let signature = message.signature
            .ok_or(RepositoryError::MissingReceipt)?;
        Ok(self.remove_message(&signature))
    }

    /// Removes all messages sent to a given endpoint, with or without TTL. Returns the number of
    ///  removed messages.
    pub fn remove_all_for(&self, endpoint: SocketAddr) -> usize {
        let removed = {
            let mut ttl = lock(&self.state.ttl);
            let mut lookup = lock(&self.state.lookup);

            let signatures = lookup.iter()
                .filter(|(_, tracked)| tracked.endpoint == endpoint)
                .map(|(signature, _)| *signature)
                .collect::<Vec<_>>();

            for signature in &signatures {
                lookup.remove(signature);
                ttl.remove(signature);
            }
            if !ttl.is_empty() {
                ttl.reaper.ensure_running(&self.state);
            }
            signatures
        };

        debug!("removed {} tracked messages for {:?}", removed.len(), endpoint);
        let num_removed = removed.len();
        self.state.publish_removed(removed.into_iter()
            .map(|signature| (signature, endpoint))
            .collect());
        num_removed
    }

    pub fn exists(&self, signature: &ReceiptSignature) -> bool {
        lock(&self.state.lookup).contains_key(signature)
    }

    pub fn get(&self, signature: &ReceiptSignature) -> Result<TrackedMessage, RepositoryError> {
        lock(&self.state.lookup)
            .get(signature)
            .cloned()
            .ok_or(RepositoryError::NotFound(*signature))
    }

    /// Calls `visitor` for every tracked message. The visitor sees a snapshot taken when the
    ///  iteration starts, and it is called without any lock held, so it may call back into the
    ///  repository.
    pub fn iterate(&self, mut visitor: impl FnMut(ReceiptSignature, &TrackedMessage)) {
        let snapshot = lock(&self.state.lookup)
            .iter()
            .map(|(signature, tracked)| (*signature, tracked.clone()))
            .collect::<Vec<_>>();

        for (signature, tracked) in &snapshot {
            visitor(*signature, tracked);
        }
    }

    /// Removes all entries and stops the reaper. Each entry is published as removed.
    pub fn clear(&self) {
        let removed = {
            let mut ttl = lock(&self.state.ttl);
            ttl.reaper.stop();
            ttl.clear();

            lock(&self.state.lookup)
                .drain()
                .map(|(signature, tracked)| (signature, tracked.endpoint))
                .collect::<Vec<_>>()
        };

        debug!("cleared {} tracked messages", removed.len());
        self.state.publish_removed(removed);
    }

    pub fn len(&self) -> usize {
        lock(&self.state.lookup).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state.lookup).is_empty()
    }

    /// The number of tracked messages with a TTL
    pub fn ttl_len(&self) -> usize {
        lock(&self.state.ttl).len()
    }

    pub fn is_reaper_running(&self) -> bool {
        lock(&self.state.ttl).reaper.is_running()
    }

    #[cfg(test)]
    fn abort_reaper(&self) {
        lock(&self.state.ttl).reaper.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageTypeId;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    const TEST_TYPE: MessageTypeId = MessageTypeId::new(b"repo\0\0\0\0");

    fn config() -> MessagingConfig {
        MessagingConfig::new(SocketAddr::from(([127, 0, 0, 1], 9810)))
    }

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 9810))
    }

    fn msg(signature: u128) -> Message {
        Message::with_signature(TEST_TYPE, ReceiptSignature::from_u128(signature), vec![signature as u8])
    }

    fn sig(signature: u128) -> ReceiptSignature {
        ReceiptSignature::from_u128(signature)
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let repo = MessageRepository::new(&config());

        repo.add_message(msg(1), peer(1)).unwrap();
        assert!(repo.exists(&sig(1)));
        assert_eq!(repo.get(&sig(1)).unwrap(), TrackedMessage { endpoint: peer(1), message: msg(1) });
        assert_eq!(repo.len(), 1);
        assert_eq!(repo.ttl_len(), 0);
        assert!(!repo.is_reaper_running());

        assert!(repo.remove_message(&sig(1)));
        assert!(!repo.exists(&sig(1)));
        assert_eq!(repo.get(&sig(1)), Err(RepositoryError::NotFound(sig(1))));
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_add_duplicate_signature() {
        let repo = MessageRepository::new(&config());
        repo.add_message(msg(1), peer(1)).unwrap();

        assert_eq!(repo.add_message(msg(1), peer(2)), Err(RepositoryError::DuplicateSignature(sig(1))));
        assert_eq!(repo.add_message_with_ttl(msg(1), peer(2), Duration::from_secs(1)), Err(RepositoryError::DuplicateSignature(sig(1))));

        assert_eq!(repo.get(&sig(1)).unwrap().endpoint, peer(1));
        assert_eq!(repo.ttl_len(), 0);
    }

    #[tokio::test]
    async fn test_add_without_signature() {
        let repo = MessageRepository::new(&config());
        let unreliable = Message::unreliable(TEST_TYPE, vec![1]);

        assert_eq!(repo.add_message(unreliable.clone(), peer(1)), Err(RepositoryError::MissingReceipt));
        assert_eq!(repo.add_message_with_ttl(unreliable.clone(), peer(1), Duration::from_secs(1)), Err(RepositoryError::MissingReceipt));
        assert_eq!(repo.remove_message_for(&unreliable), Err(RepositoryError::MissingReceipt));
        assert!(repo.is_empty());
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test]
    async fn test_add_with_zero_ttl() {
        let repo = MessageRepository::new(&config());
        assert_eq!(repo.add_message_with_ttl(msg(1), peer(1), Duration::ZERO), Err(RepositoryError::InvalidTtl));
        assert!(!repo.exists(&sig(1)));
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() {
        let repo = MessageRepository::new(&config());
        let mut events = repo.subscribe();

        assert!(!repo.remove_message(&sig(99)));
        assert_eq!(repo.remove_message_for(&msg(99)), Ok(false));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_remove_publishes_event() {
        let repo = MessageRepository::new(&config());
        let mut events = repo.subscribe();

        repo.add_message(msg(1), peer(1)).unwrap();
        assert_eq!(repo.remove_message_for(&msg(1)), Ok(true));
        assert_eq!(events.try_recv(), Ok(TrackingEvent::Removed { signature: sig(1), endpoint: peer(1) }));
        assert!(!repo.remove_message(&sig(1)));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let config = config();
        let repo = MessageRepository::new(&config);
        let mut events = repo.subscribe();

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(50)).unwrap();
        repo.add_message(msg(2), peer(1)).unwrap();
        assert!(repo.is_reaper_running());
        assert_eq!(repo.ttl_len(), 1);

        sleep(Duration::from_millis(45)).await;
        assert!(repo.exists(&sig(1)));

        sleep(Duration::from_millis(5) + 2 * config.reaper_interval).await;
        assert!(!repo.exists(&sig(1)));
        assert!(repo.exists(&sig(2)));
        assert_eq!(repo.ttl_len(), 0);
        assert_eq!(events.try_recv(), Ok(TrackingEvent::Expired { signature: sig(1), endpoint: peer(1) }));

        // the reaper terminates once the TTL set is drained
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_ordering() {
        let config = config();
        let repo = MessageRepository::new(&config);

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(300)).unwrap();
        repo.add_message_with_ttl(msg(2), peer(1), Duration::from_millis(100)).unwrap();
        repo.add_message_with_ttl(msg(3), peer(1), Duration::from_millis(200)).unwrap();

        sleep(Duration::from_millis(100) + 2 * config.reaper_interval).await;
        assert!(repo.exists(&sig(1)));
        assert!(!repo.exists(&sig(2)));
        assert!(repo.exists(&sig(3)));

        sleep(Duration::from_millis(100)).await;
        assert!(repo.exists(&sig(1)));
        assert!(!repo.exists(&sig(3)));

        sleep(Duration::from_millis(100)).await;
        assert!(repo.is_empty());
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_before_expiry() {
        let config = config();
        let repo = MessageRepository::new(&config);
        let mut events = repo.subscribe();

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(50)).unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(repo.remove_message(&sig(1)));
        assert_eq!(repo.ttl_len(), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(events.try_recv(), Ok(TrackingEvent::Removed { signature: sig(1), endpoint: peer(1) }));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_restarts_after_drain() {
        let config = config();
        let repo = MessageRepository::new(&config);

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(10)).unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!repo.is_reaper_running());

        repo.add_message_with_ttl(msg(2), peer(1), Duration::from_millis(10)).unwrap();
        assert!(repo.is_reaper_running());
        sleep(Duration::from_millis(50)).await;
        assert!(repo.is_empty());
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_reaper_restarted_by_add() {
        let config = config();
        let repo = MessageRepository::new(&config);
        let mut events = repo.subscribe();

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(20)).unwrap();
        repo.abort_reaper();
        sleep(Duration::from_millis(1)).await;
        assert!(!repo.is_reaper_running());
        assert_eq!(repo.ttl_len(), 1);

        repo.add_message_with_ttl(msg(2), peer(1), Duration::from_millis(20)).unwrap();
        assert!(repo.is_reaper_running());

        sleep(Duration::from_millis(20) + 2 * config.reaper_interval).await;
        assert!(repo.is_empty());
        assert_eq!(repo.ttl_len(), 0);
        assert_eq!(events.try_recv(), Ok(TrackingEvent::Expired { signature: sig(1), endpoint: peer(1) }));
        assert_eq!(events.try_recv(), Ok(TrackingEvent::Expired { signature: sig(2), endpoint: peer(1) }));
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_reaper_restarted_by_removal() {
        let config = config();
        let repo = MessageRepository::new(&config);

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(20)).unwrap();
        repo.add_message_with_ttl(msg(2), peer(2), Duration::from_secs(10)).unwrap();
        repo.abort_reaper();
        sleep(Duration::from_millis(1)).await;
        assert!(!repo.is_reaper_running());

        assert!(repo.remove_message(&sig(2)));
        assert!(repo.is_reaper_running());

        sleep(Duration::from_millis(20) + 2 * config.reaper_interval).await;
        assert!(!repo.exists(&sig(1)));
        assert!(!repo.is_reaper_running());
    }

    #[rstest]
    #[case::untimed_only(vec![(1, 1, false), (2, 1, false), (3, 2, false)], 1, 2)]
    #[case::timed_only(vec![(1, 1, true), (2, 2, true), (3, 1, true)], 1, 2)]
    #[case::mixed(vec![(1, 1, true), (2, 1, false), (3, 2, true), (4, 2, false)], 1, 2)]
    #[case::no_match(vec![(1, 2, true), (2, 2, false)], 1, 0)]
    #[tokio::test(start_paused = true)]
    async fn test_remove_all_for(#[case] entries: Vec<(u128, u8, bool)>, #[case] endpoint: u8, #[case] expected_removed: usize) {
        let config = config();
        let repo = MessageRepository::new(&config);

        for (signature, target, with_ttl) in &entries {
            if *with_ttl {
                repo.add_message_with_ttl(msg(*signature), peer(*target), Duration::from_secs(10)).unwrap();
            }
            else {
                repo.add_message(msg(*signature), peer(*target)).unwrap();
            }
        }

        assert_eq!(repo.remove_all_for(peer(endpoint)), expected_removed);

        for (signature, target, _) in &entries {
            assert_eq!(repo.exists(&sig(*signature)), *target != endpoint);
        }
        let remaining_timed = entries.iter()
            .filter(|(_, target, with_ttl)| *with_ttl && *target != endpoint)
            .count();
        assert_eq!(repo.ttl_len(), remaining_timed);

        sleep(2 * config.reaper_interval).await;
        assert_eq!(repo.is_reaper_running(), remaining_timed > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_all_for_timed_and_untimed_from_same_peer() {
        let config = config();
        let repo = MessageRepository::new(&config);

        repo.add_message_with_ttl(msg(1), peer(1), Duration::from_millis(30)).unwrap();
        sleep(Duration::from_millis(5)).await;
        repo.add_message(msg(2), peer(1)).unwrap();
        assert!(repo.is_reaper_running());

        assert_eq!(repo.remove_all_for(peer(1)), 2);
        assert!(!repo.exists(&sig(1)));
        assert!(!repo.exists(&sig(2)));
        assert_eq!(repo.ttl_len(), 0);

        sleep(config.reaper_interval + Duration::from_millis(1)).await;
        assert!(!repo.is_reaper_running());
    }

    #[tokio::test]
    async fn test_remove_all_for_publishes_events() {
        let repo = MessageRepository::new(&config());
        let mut events = repo.subscribe();

        repo.add_message(msg(1), peer(1)).unwrap();
        repo.add_message(msg(2), peer(2)).unwrap();
        assert_eq!(repo.remove_all_for(peer(1)), 1);

        assert_eq!(events.try_recv(), Ok(TrackingEvent::Removed { signature: sig(1), endpoint: peer(1) }));
        assert_eq!(events.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear() {
        let repo = MessageRepository::new(&config());
        repo.add_message(msg(1), peer(1)).unwrap();
        repo.add_message_with_ttl(msg(2), peer(2), Duration::from_secs(1)).unwrap();
        assert!(repo.is_reaper_running());

        repo.clear();
        assert!(repo.is_empty());
        assert_eq!(repo.ttl_len(), 0);
        assert!(!repo.is_reaper_running());

        repo.add_message_with_ttl(msg(3), peer(1), Duration::from_millis(10)).unwrap();
        assert!(repo.is_reaper_running());
        sleep(Duration::from_millis(50)).await;
        assert!(!repo.exists(&sig(3)));
    }

    #[tokio::test]
    async fn test_iterate_snapshot() {
        let repo = MessageRepository::new(&config());
        for i in 1..=5 {
            repo.add_message(msg(i), peer(i as u8)).unwrap();
        }

        let mut visited = Vec::new();
        repo.iterate(|signature, tracked| {
            // re-entrant calls must not deadlock, and must not affect the snapshot
            repo.remove_message(&signature);
            repo.add_message(msg(signature.to_u128() + 100), tracked.endpoint).unwrap();
            visited.push(signature.to_u128());
        });
        visited.sort();

        assert_eq!(visited, vec![1, 2, 3, 4, 5]);
        assert_eq!(repo.len(), 5);
        assert!(!repo.exists(&sig(1)));
        assert!(repo.exists(&sig(101)));
    }

    #[test]
    fn test_concurrent_access() {
        let rt = Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        rt.block_on(async {
            let repo = Arc::new(MessageRepository::new(&config()));

            let writers = (0..4u128)
                .map(|worker| {
                    let repo = repo.clone();
                    tokio::spawn(async move {
                        for i in 0..500u128 {
                            let signature = worker * 1_000_000 + i;
                            repo.add_message_with_ttl(msg(signature), peer(worker as u8), Duration::from_secs(60)).unwrap();
                            if i % 2 == 0 {
                                assert!(repo.remove_message(&sig(signature)));
                            }
                            if i % 100 == 0 {
                                tokio::task::yield_now().await;
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            let reader = {
                let repo = repo.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        repo.iterate(|signature, tracked| {
                            assert_eq!(tracked.message.signature, Some(signature));
                        });
                        tokio::task::yield_now().await;
                    }
                })
            };

            for writer in writers {
                writer.await.unwrap();
            }
            reader.await.unwrap();

            assert_eq!(repo.len(), 4 * 250);
            assert_eq!(repo.ttl_len(), 4 * 250);
            assert_eq!(repo.remove_all_for(peer(2)), 250);
        });
    }
}
