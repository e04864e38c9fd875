use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

use crate::receipt::ReceiptSignature;

/// Signatures of recently received reliable messages. A re-sent message whose acknowledgement
///  got lost arrives a second time, and it is acknowledged again but not dispatched again.
pub struct RecentReceipts {
    window: Duration,
    seen: Mutex<FxHashMap<ReceiptSignature, Instant>>,
}

impl RecentReceipts {
    pub fn new(window: Duration) -> RecentReceipts {
        RecentReceipts {
            window,
            seen: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<ReceiptSignature, Instant>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if the signature was not seen within the window, and remembers it
    pub fn check_and_insert(&self, signature: ReceiptSignature) -> bool {
        let now = Instant::now();
        let mut seen = self.lock();
        match seen.get(&signature) {
            Some(&expiry) if expiry > now => false,
            _ => {
                seen.insert(signature, now + self.window);
                true
            }
        }
    }

    pub fn contains(&self, signature: &ReceiptSignature) -> bool {
        let now = Instant::now();
        self.lock().get(signature)
            .map(|&expiry| expiry > now)
            .unwrap_or(false)
    }

    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut seen = self.lock();
        let before = seen.len();
        seen.retain(|_, expiry| *expiry > now);
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_within_window() {
        let receipts = RecentReceipts::new(Duration::from_secs(1));
        let signature = ReceiptSignature::from_u128(1);

        assert!(receipts.check_and_insert(signature));
        assert!(!receipts.check_and_insert(signature));
        assert!(receipts.contains(&signature));
        assert!(receipts.check_and_insert(ReceiptSignature::from_u128(2)));

        sleep(Duration::from_millis(1001)).await;
        assert!(!receipts.contains(&signature));
        assert!(receipts.check_and_insert(signature));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_expired() {
        let receipts = RecentReceipts::new(Duration::from_secs(1));
        assert!(receipts.check_and_insert(ReceiptSignature::from_u128(1)));
        sleep(Duration::from_millis(600)).await;
        assert!(receipts.check_and_insert(ReceiptSignature::from_u128(2)));
        sleep(Duration::from_millis(600)).await;

        assert_eq!(receipts.evict_expired(Instant::now()), 1);
        assert_eq!(receipts.len(), 1);
        assert!(receipts.contains(&ReceiptSignature::from_u128(2)));
    }
}
