// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Attachment Event Bus
//
// Fan-out of resolved attachments over a tokio broadcast channel. The
// reconciler is the only publisher; task engines subscribe to learn when the
// attachments they declared are confirmed or have failed.
//
// Publishing never waits on receivers. A receiver that falls behind by more
// than the channel capacity loses the oldest events and sees `Lagged`.

use crate::domain::events::AttachmentEvent;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// Envelope carried on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Attachment(AttachmentEvent),
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// `capacity` is how many events a slow receiver may fall behind before it lags
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish_attachment_event(&self, event: AttachmentEvent) {
        debug!(
            resource_key = %event.resource_key(),
            outcome = event.outcome(),
            "Publishing attachment event"
        );

        // Err only means nobody is listening right now
        if self.sender.send(DomainEvent::Attachment(event)).is_err() {
            debug!("Attachment event dropped, no subscribers");
        }
    }

    /// Every event published from now on
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Only attachment events whose task reference equals `task_ref`
    pub fn subscribe_task(&self, task_ref: impl Into<String>) -> TaskAttachmentEventReceiver {
        TaskAttachmentEventReceiver {
            receiver: self.sender.subscribe(),
            task_ref: task_ref.into(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    /// Wait for the next event
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        Ok(self.receiver.recv().await?)
    }

    /// Next buffered event, or `EventBusError::Empty`
    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        Ok(self.receiver.try_recv()?)
    }
}

pub struct TaskAttachmentEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    task_ref: String,
}

impl TaskAttachmentEventReceiver {
    /// Wait for the next event belonging to this receiver's task
    pub async fn recv(&mut self) -> Result<AttachmentEvent, EventBusError> {
        loop {
            let DomainEvent::Attachment(event) = self.receiver.recv().await?;
            if event.task_ref() == Some(self.task_ref.as_str()) {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus closed: no publisher remains")]
    Closed,

    #[error("No buffered events")]
    Empty,

    #[error("Receiver fell behind and missed {0} events")]
    Lagged(u64),
}

impl From<RecvError> for EventBusError {
    fn from(e: RecvError) -> Self {
        match e {
            RecvError::Closed => Self::Closed,
            RecvError::Lagged(missed) => lagged(missed),
        }
    }
}

impl From<TryRecvError> for EventBusError {
    fn from(e: TryRecvError) -> Self {
        match e {
            TryRecvError::Empty => Self::Empty,
            TryRecvError::Closed => Self::Closed,
            TryRecvError::Lagged(missed) => lagged(missed),
        }
    }
}

fn lagged(missed: u64) -> EventBusError {
    warn!(missed, "Attachment event receiver lagged");
    EventBusError::Lagged(missed)
}
