use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::message::Message;
use crate::message_bus::MessageHandler;

/// A [MessageHandler] that records every message it receives
#[derive(Default)]
pub struct RecordingHandler {
    received: Mutex<Vec<(SocketAddr, Message)>>,
}

impl RecordingHandler {
    pub fn new() -> RecordingHandler {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(SocketAddr, Message)>> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn received(&self) -> Vec<(SocketAddr, Message)> {
        self.lock().clone()
    }

    pub fn num_received(&self) -> usize {
        self.lock().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn on_message(&self, sender: SocketAddr, message: &Message) {
        self.lock().push((sender, message.clone()));
    }
}
