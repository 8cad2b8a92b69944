//! Sending to queues and topics.

use crate::auth::AccessRight;
use crate::client::{ensure_open, ClientContext};
use crate::error::BusError;
use crate::message::{EntityName, Message, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Sends messages to one queue or topic
#[derive(Debug)]
pub struct Sender {
    context: ClientContext,
    entity: EntityName,
    closed: AtomicBool,
}

impl Sender {
    pub(crate) fn new(context: ClientContext, entity: EntityName) -> Self {
        Self {
            context,
            entity,
            closed: AtomicBool::new(false),
        }
    }

    pub fn entity_path(&self) -> &EntityName {
        &self.entity
    }

    fn check(&self) -> Result<(), BusError> {
        ensure_open(&self.context, &self.closed, &self.entity)?;
        self.context.authorize(AccessRight::Send, &self.entity)
    }

    pub async fn send_message(&self, message: Message) -> Result<(), BusError> {
        self.send_messages(vec![message]).await
    }

    /// Send several messages as one unit: all are accepted or none
    pub async fn send_messages(&self, messages: Vec<Message>) -> Result<(), BusError> {
        self.check()?;
        let count = messages.len();
        let accepted = self.context.namespace.send(&self.entity, messages)?;
        debug!(entity = %self.entity, sent = count, accepted = accepted.len(), "Messages sent");
        Ok(())
    }

    /// Empty batch bounded by the namespace's maximum message size, or by
    /// `max_size_in_bytes` when that is smaller
    pub fn create_message_batch(&self, max_size_in_bytes: Option<usize>) -> Result<MessageBatch, BusError> {
        ensure_open(&self.context, &self.closed, &self.entity)?;
        let limit = self.context.namespace.config().max_message_size;
        Ok(MessageBatch::new(max_size_in_bytes.map_or(limit, |m| m.min(limit))))
    }

    pub async fn send_message_batch(&self, batch: MessageBatch) -> Result<(), BusError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.send_messages(batch.messages).await
    }

    /// Enqueue messages that become visible at `enqueue_at`. Returns their
    /// sequence numbers for use with [`Sender::cancel_scheduled_messages`].
    pub async fn schedule_messages(
        &self,
        messages: Vec<Message>,
        enqueue_at: Timestamp,
    ) -> Result<Vec<i64>, BusError> {
        self.check()?;
        let sequence_numbers = self
            .context
            .namespace
            .schedule(&self.entity, messages, enqueue_at)?;
        debug!(
            entity = %self.entity,
            count = sequence_numbers.len(),
            enqueue_at = %enqueue_at,
            "Messages scheduled"
        );
        Ok(sequence_numbers)
    }

    pub async fn cancel_scheduled_messages(&self, sequence_numbers: &[i64]) -> Result<(), BusError> {
        self.check()?;
        self.context
            .namespace
            .cancel_scheduled(&self.entity, sequence_numbers)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.context.is_closed()
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(entity = %self.entity, "Sender closed");
        }
    }
}

/// Messages collected for one send, bounded in total size
#[derive(Debug, Clone)]
pub struct MessageBatch {
    max_size_in_bytes: usize,
    size_in_bytes: usize,
    messages: Vec<Message>,
}

impl MessageBatch {
    fn new(max_size_in_bytes: usize) -> Self {
        Self {
            max_size_in_bytes,
            size_in_bytes: 0,
            messages: Vec::new(),
        }
    }

    /// Add a message if it fits. Returns `false`, leaving the batch
    /// unchanged, when it would exceed the size limit.
    pub fn try_add_message(&mut self, message: Message) -> bool {
        let size = message.size();
        if self.size_in_bytes + size > self.max_size_in_bytes {
            return false;
        }
        self.size_in_bytes += size;
        self.messages.push(message);
        true
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes
    }

    pub fn max_size_in_bytes(&self) -> usize {
        self.max_size_in_bytes
    }
}
