use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::message::{Message, MessageTypeId};

/// Application code receives messages by registering a [MessageHandler] for a message type
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn on_message(&self, sender: SocketAddr, message: &Message);
}

/// Dispatches received messages to the handlers registered for their type. There can be several
///  handlers for a type, and they are called in registration order.
#[derive(Default)]
pub struct MessageBus {
    handlers: RwLock<FxHashMap<MessageTypeId, Vec<Arc<dyn MessageHandler>>>>,
}

impl MessageBus {
    pub fn new() -> MessageBus {
        Default::default()
    }

    pub async fn subscribe(&self, type_id: MessageTypeId, handler: Arc<dyn MessageHandler>) {
        debug!("subscribing handler for message type {:?}", type_id);
        self.handlers.write().await
            .entry(type_id)
            .or_default()
            .push(handler);
    }

    /// Removes all handlers for a message type
    pub async fn unsubscribe(&self, type_id: MessageTypeId) -> anyhow::Result<()> {
        match self.handlers.write().await.remove(&type_id) {
            Some(_) => {
                debug!("unsubscribed handlers for message type {:?}", type_id);
                Ok(())
            }
            None => Err(anyhow!("no handler is subscribed for message type {:?}", type_id)),
        }
    }

    pub async fn has_subscribers(&self, type_id: MessageTypeId) -> bool {
        self.handlers.read().await.contains_key(&type_id)
    }

    /// Calls the handlers for the message's type and returns how many there were. Handlers are
    ///  called without the bus lock held, so they can (un)subscribe.
    pub async fn dispatch(&self, sender: SocketAddr, message: &Message) -> usize {
        let handlers = match self.handlers.read().await.get(&message.type_id) {
            Some(handlers) => handlers.clone(),
            None => {
                debug!("received {:?} from {:?} for which there is no handler - ignoring. Different nodes may be running different software versions", message, sender);
                return 0;
            }
        };

        trace!("dispatching {:?} from {:?} to {} handler(s)", message, sender, handlers.len());
        for handler in &handlers {
            handler.on_message(sender, message).await;
        }
        handlers.len()
    }
}
