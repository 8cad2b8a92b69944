//! Receiving from queues and subscriptions, and settling what was received.

use crate::auth::AccessRight;
use crate::client::{ensure_open, ClientContext};
use crate::error::BusError;
use crate::message::{
    LockToken, PropertyValue, ReceiveMode, ReceivedMessage, ReceiverOptions, SessionId, SubQueue,
    Timestamp,
};
use crate::namespace::{EntityPath, Settlement};
use chrono::Duration;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// How long `receive_messages` waits when no wait time is given
pub const DEFAULT_MAX_WAIT_SECS: i64 = 60;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Receives from one queue, subscription or dead-letter sub-queue
#[derive(Debug)]
pub struct Receiver {
    context: ClientContext,
    path: EntityPath,
    options: ReceiverOptions,
    session: Option<(SessionId, LockToken)>,
    closed: AtomicBool,
    peek_cursor: Mutex<i64>,
    prefetched: Mutex<VecDeque<ReceivedMessage>>,
}

impl Receiver {
    pub(crate) fn new(
        context: ClientContext,
        path: EntityPath,
        options: ReceiverOptions,
        session: Option<(SessionId, LockToken)>,
    ) -> Self {
        Self {
            context,
            path,
            options,
            session,
            closed: AtomicBool::new(false),
            peek_cursor: Mutex::new(1),
            prefetched: Mutex::new(VecDeque::new()),
        }
    }

    pub fn entity_path(&self) -> &EntityPath {
        &self.path
    }

    pub fn receive_mode(&self) -> ReceiveMode {
        self.options.receive_mode
    }

    pub fn sub_queue(&self) -> SubQueue {
        self.options.sub_queue
    }

    pub(crate) fn context(&self) -> &ClientContext {
        &self.context
    }

    fn session_binding(&self) -> Option<(&SessionId, LockToken)> {
        self.session.as_ref().map(|(id, token)| (id, *token))
    }

    fn check(&self) -> Result<(), BusError> {
        ensure_open(&self.context, &self.closed, &self.path)?;
        self.context
            .authorize(AccessRight::Listen, self.path.authorization_entity())
    }

    /// Receive up to `max_messages`, waiting up to `max_wait` (default one
    /// minute) for at least one. Returns an empty list when nothing arrived.
    pub async fn receive_messages(
        &self,
        max_messages: usize,
        max_wait: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.check()?;
        if max_messages == 0 {
            return Err(BusError::InvalidOperation {
                message: "max_messages must be at least 1".to_string(),
            });
        }

        {
            let mut prefetched = lock(&self.prefetched);
            if !prefetched.is_empty() {
                let count = max_messages.min(prefetched.len());
                return Ok(prefetched.drain(..count).collect());
            }
        }

        let max_wait = max_wait.unwrap_or_else(|| Duration::seconds(DEFAULT_MAX_WAIT_SECS));
        let fetch = max_messages + self.options.prefetch_count;
        let namespace = &self.context.namespace;
        let mut received = namespace
            .wait_for(max_wait, || {
                ensure_open(&self.context, &self.closed, &self.path)?;
                let batch = namespace.receive(
                    &self.path,
                    self.options.sub_queue,
                    fetch,
                    self.options.receive_mode,
                    self.session_binding(),
                )?;
                Ok((!batch.is_empty()).then_some(batch))
            })
            .await?
            .unwrap_or_default();

        if received.len() > max_messages {
            let rest = received.split_off(max_messages);
            lock(&self.prefetched).extend(rest);
        }
        debug!(entity = %self.path, count = received.len(), "Messages received");
        Ok(received)
    }

    /// Browse messages without locking them. Continues after the last peeked
    /// message unless `from_sequence_number` is given.
    pub async fn peek_messages(
        &self,
        max_messages: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.check()?;
        let mut cursor = lock(&self.peek_cursor);
        let from = from_sequence_number.unwrap_or(*cursor);
        let peeked = self.context.namespace.peek(
            &self.path,
            self.options.sub_queue,
            from,
            max_messages,
            self.session.as_ref().map(|(id, _)| id),
        )?;
        if let Some(last) = peeked.last() {
            *cursor = last.sequence_number + 1;
        }
        Ok(peeked)
    }

    /// Lock deferred messages by sequence number
    pub async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.check()?;
        self.context.namespace.receive_deferred(
            &self.path,
            self.options.sub_queue,
            sequence_numbers,
            self.options.receive_mode,
            self.session_binding(),
        )
    }

    fn settle(&self, message: &ReceivedMessage, settlement: Settlement) -> Result<Option<Timestamp>, BusError> {
        self.check()?;
        if self.options.receive_mode == ReceiveMode::ReceiveAndDelete {
            return Err(BusError::InvalidOperation {
                message: "messages received in ReceiveAndDelete mode cannot be settled".to_string(),
            });
        }
        let token = message.require_lock_token()?;
        self.context.namespace.settle(
            &self.path,
            self.options.sub_queue,
            token,
            self.session_binding(),
            settlement,
        )
    }

    /// Remove the message from the entity
    pub async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.settle(message, Settlement::Complete)?;
        Ok(())
    }

    /// Release the lock so the message can be delivered again, optionally
    /// updating application properties
    pub async fn abandon_message(
        &self,
        message: &ReceivedMessage,
        properties_to_modify: Option<HashMap<String, PropertyValue>>,
    ) -> Result<(), BusError> {
        self.settle(message, Settlement::Abandon(properties_to_modify.unwrap_or_default()))?;
        Ok(())
    }

    /// Set the message aside; it can only be received again by sequence number
    pub async fn defer_message(
        &self,
        message: &ReceivedMessage,
        properties_to_modify: Option<HashMap<String, PropertyValue>>,
    ) -> Result<(), BusError> {
        self.settle(message, Settlement::Defer(properties_to_modify.unwrap_or_default()))?;
        Ok(())
    }

    /// Move the message to the dead-letter sub-queue
    pub async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), BusError> {
        self.settle(
            message,
            Settlement::DeadLetter {
                reason: reason.into(),
                description,
                properties: HashMap::new(),
            },
        )?;
        Ok(())
    }

    /// Extend the message lock by the entity's lock duration. Updates
    /// `message.locked_until` and returns the new expiry.
    pub async fn renew_message_lock(&self, message: &mut ReceivedMessage) -> Result<Timestamp, BusError> {
        let locked_until = self
            .settle(message, Settlement::RenewLock)?
            .ok_or_else(|| BusError::InvalidOperation {
                message: "lock renewal returned no expiry".to_string(),
            })?;
        message.locked_until = Some(locked_until);
        Ok(locked_until)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.context.is_closed()
    }

    /// Mark closed and hand back prefetched locks. Returns `false` when
    /// already closed.
    pub(crate) fn close_link(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let prefetched: Vec<ReceivedMessage> = lock(&self.prefetched).drain(..).collect();
        for message in prefetched {
            let Some(token) = message.lock_token else {
                continue;
            };
            if let Err(e) = self.context.namespace.settle(
                &self.path,
                self.options.sub_queue,
                token,
                self.session_binding(),
                Settlement::Abandon(HashMap::new()),
            ) {
                debug!(
                    entity = %self.path,
                    sequence_number = message.sequence_number,
                    error = %e,
                    "Prefetched message not abandoned"
                );
            }
        }
        info!(entity = %self.path, "Receiver closed");
        true
    }

    pub async fn close(&self) {
        self.close_link();
    }
}
