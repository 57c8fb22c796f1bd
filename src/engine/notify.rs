//! Outbound notification routing
//!
//! Every account gets its own bounded queue, so a slow consumer can only
//! lose its own messages and never stalls a trading loop. Error messages
//! are also copied to the operator queue when one is subscribed.

use std::collections::HashMap;

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;

use super::types::{AccountId, Message};

/// What happened to a delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Nobody subscribed for this account
    NoRoute,
    /// Queue full; the message was dropped
    Dropped,
    /// Receiver gone; the route was removed
    Closed,
}

pub struct Notifier {
    capacity: usize,
    routes: Mutex<HashMap<AccountId, mpsc::Sender<Message>>>,
    operator: Mutex<Option<mpsc::Sender<Message>>>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            routes: Mutex::new(HashMap::new()),
            operator: Mutex::new(None),
        }
    }

    /// Open the message stream for an account, replacing any previous one
    pub async fn subscribe(&self, account_id: AccountId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.routes.lock().await.insert(account_id, tx);
        rx
    }

    /// Open the operator stream that receives a copy of every Error message
    pub async fn subscribe_operator(&self) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.operator.lock().await = Some(tx);
        rx
    }

    /// Hand a message to its account queue without waiting
    pub async fn deliver(&self, message: Message) -> Delivery {
        if message.is_error() {
            self.copy_to_operator(&message).await;
        }

        let account_id = message.account_id;
        let mut routes = self.routes.lock().await;
        let Some(tx) = routes.get(&account_id) else {
            debug!("[user={}] no subscriber, message not routed", account_id);
            return Delivery::NoRoute;
        };

        match tx.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    "[user={}] notification queue full, dropping: {}",
                    account_id,
                    dropped.render()
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                debug!("[user={}] notification receiver closed, removing route", account_id);
                routes.remove(&account_id);
                Delivery::Closed
            }
        }
    }

    async fn copy_to_operator(&self, message: &Message) {
        let mut operator = self.operator.lock().await;
        let Some(tx) = operator.as_ref() else {
            return;
        };
        match tx.try_send(message.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Operator queue full, dropping error report"),
            Err(TrySendError::Closed(_)) => *operator = None,
        }
    }
}
