use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::message::Message;
use crate::paging;
use crate::receipt::ReceiptSignature;
use crate::repository::{MessageRepository, RepositoryError, TrackingEvent};
use crate::transport::Transport;

type ResendTasks = Arc<Mutex<FxHashMap<ReceiptSignature, JoinHandle<()>>>>;

fn lock_tasks(tasks: &ResendTasks) -> MutexGuard<'_, FxHashMap<ReceiptSignature, JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Re-sends tracked messages at a fixed interval until they leave the repository.
///
/// Every tracked message has its own task. A task stops when the repository publishes the
///  message's removal or expiry, and it checks the repository before each re-send so that a
///  missed event delays termination by at most one interval.
pub struct MessageRepeater {
    transport: Arc<dyn Transport>,
    repository: Arc<MessageRepository>,
    max_datagram_size: usize,
    tasks: ResendTasks,
    event_watcher: JoinHandle<()>,
}

impl Drop for MessageRepeater {
    fn drop(&mut self) {
        self.event_watcher.abort();
        for (_, task) in lock_tasks(&self.tasks).drain() {
            task.abort();
        }
    }
}

impl MessageRepeater {
    pub fn new(transport: Arc<dyn Transport>, repository: Arc<MessageRepository>, max_datagram_size: usize) -> MessageRepeater {
        let tasks = ResendTasks::default();
        let event_watcher = tokio::spawn(Self::watch_tracking_events(repository.subscribe(), tasks.clone()));

        MessageRepeater {
            transport,
            repository,
            max_datagram_size,
            tasks,
            event_watcher,
        }
    }

    /// Starts re-sending a message to `endpoint` every `interval`, starting one interval from
    ///  now. The message must already be tracked in the repository.
    pub fn track(&self, message: &Message, endpoint: SocketAddr, interval: Duration) -> anyhow::Result<()> {
        let signature = message.signature
            .ok_or(RepositoryError::MissingReceipt)?;
        if interval.is_zero() {
            bail!("re-send interval must be positive");
        }

        let datagrams = paging::split(message, self.max_datagram_size)?;
        let task = tokio::spawn(Self::resend_loop(
            signature,
            endpoint,
            datagrams,
            interval,
            self.transport.clone(),
            self.repository.clone(),
        ));

        let mut tasks = lock_tasks(&self.tasks);
        tasks.retain(|_, task| !task.is_finished());
        if let Some(previous) = tasks.insert(signature, task) {
            debug!("{:?} was tracked already - replacing its re-send task", signature);
            previous.abort();
        }
        Ok(())
    }

    pub fn untrack(&self, signature: &ReceiptSignature) -> bool {
        match lock_tasks(&self.tasks).remove(signature) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// The number of messages that are currently being re-sent
    pub fn tracked_count(&self) -> usize {
        lock_tasks(&self.tasks).values()
            .filter(|task| !task.is_finished())
            .count()
    }

    async fn resend_loop(
        signature: ReceiptSignature,
        endpoint: SocketAddr,
        datagrams: Vec<Bytes>,
        interval: Duration,
        transport: Arc<dyn Transport>,
        repository: Arc<MessageRepository>,
    ) {
        let mut ticks = time::interval_at(Instant::now() + interval, interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticks.tick().await;

            if !repository.exists(&signature) {
                trace!("{:?} is no longer tracked - stopping re-sends", signature);
                return;
            }

            trace!("re-sending {:?} to {:?} ({} datagram(s))", signature, endpoint, datagrams.len());
            for datagram in &datagrams {
                if let Err(e) = transport.send(endpoint, datagram).await {
                    warn!("error re-sending {:?} to {:?}: {}", signature, endpoint, e);
                }
            }
        }
    }

    async fn watch_tracking_events(mut events: broadcast::Receiver<TrackingEvent>, tasks: ResendTasks) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(task) = lock_tasks(&tasks).remove(&event.signature()) {
                        trace!("{:?} - stopping re-sends", event);
                        task.abort();
                    }
                }
                Err(RecvError::Lagged(num_skipped)) => {
                    debug!("missed {} tracking events - re-send tasks detect removal on their next tick", num_skipped);
                }
                Err(RecvError::Closed) => return,
            }
        }
    }
}
