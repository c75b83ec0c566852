//! Notification handling
//! One background task per subscribed characteristic forwards every value
//! the peripheral pushes as [`AdapterEvent::ValueUpdated`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bluest::{Characteristic, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::adapter::{AdapterEvent, AdapterEventSender};

#[derive(Clone)]
pub struct NotificationHandler {
    events: AdapterEventSender,
    subscriptions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl NotificationHandler {
    pub fn new(events: AdapterEventSender) -> Self {
        Self {
            events,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts forwarding notifications from `characteristic`, replacing any
    /// previous subscription to the same UUID.
    pub fn subscribe(&self, characteristic: Characteristic) {
        let uuid = characteristic.uuid();
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self.subscriptions().insert(uuid, cancel_token.clone()) {
            previous.cancel();
        }

        info!("Subscribing to notifications on {}", uuid);
        let events = self.events.clone();
        tokio::spawn(async move {
            Self::process_notifications(characteristic, events, cancel_token).await;
        });
    }

    pub fn unsubscribe(&self, uuid: Uuid) {
        if let Some(token) = self.subscriptions().remove(&uuid) {
            info!("Unsubscribing from notifications on {}", uuid);
            token.cancel();
        }
    }

    pub fn stop_all(&self) {
        for (_, token) in self.subscriptions().drain() {
            token.cancel();
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn process_notifications(
        characteristic: Characteristic,
        events: AdapterEventSender,
        cancel_token: CancellationToken,
    ) {
        let uuid = characteristic.uuid();

        match characteristic.notify().await {
            Ok(mut notification_stream) => loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    result = notification_stream.next() => match result {
                        Some(Ok(value)) => {
                            debug!("Received notification from {}: {:?}", uuid, value);
                            let event = AdapterEvent::ValueUpdated { characteristic: uuid, value };
                            if events.send(event).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
            },
            Err(e) => {
                error!("Failed to subscribe to notifications: {}", e);
            }
        }

        info!("Notification stream for {} ended", uuid);
    }
}
