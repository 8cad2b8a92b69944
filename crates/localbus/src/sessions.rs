//! Session receivers: exclusive, ordered access to one session.
//!
//! Accepting a session locks it for the receiver until the receiver is closed
//! or the session lock expires. Only the lock holder can receive or settle the
//! session's messages, and messages are delivered in sequence order. Message
//! locks of a session are tied to the session lock, so they are renewed by
//! renewing the session.

use crate::auth::AccessRight;
use crate::client::ClientContext;
use crate::error::BusError;
use crate::message::{
    LockToken, PropertyValue, ReceivedMessage, ReceiverOptions, SessionId, Timestamp,
};
use crate::namespace::EntityPath;
use crate::receiver::Receiver;
use crate::store::SessionLease;
use bytes::Bytes;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;

/// Receiver holding the lock on one session
///
/// # Examples
///
/// ```rust
/// use localbus::{
///     AdministrationClient, Message, Namespace, QueueProperties, ReceiverOptions,
///     ServiceBusClient, SessionId,
/// };
///
/// # tokio_test::block_on(async {
/// let namespace = Namespace::for_testing("contoso").unwrap();
/// let admin = AdministrationClient::new(&namespace, &namespace.connection_string()).unwrap();
/// admin
///     .create_queue("orders", QueueProperties::new().with_sessions())
///     .await
///     .unwrap();
///
/// let client = ServiceBusClient::new(&namespace, &namespace.connection_string()).unwrap();
/// let order = Message::new("step 1").with_session_id(SessionId::new("order-7").unwrap());
/// client.create_sender("orders").unwrap().send_message(order).await.unwrap();
///
/// let session = client
///     .accept_session("orders", "order-7", ReceiverOptions::default())
///     .await
///     .unwrap();
/// assert_eq!(session.session_id().as_str(), "order-7");
/// session.close().await;
/// # });
/// ```
#[derive(Debug)]
pub struct SessionReceiver {
    receiver: Receiver,
    session_id: SessionId,
    lock_token: LockToken,
    locked_until: Mutex<Timestamp>,
}

impl SessionReceiver {
    pub(crate) fn new(
        context: ClientContext,
        path: EntityPath,
        options: ReceiverOptions,
        lease: SessionLease,
    ) -> Self {
        let session = Some((lease.session_id.clone(), lease.token));
        Self {
            receiver: Receiver::new(context, path, options, session),
            session_id: lease.session_id,
            lock_token: lease.token,
            locked_until: Mutex::new(lease.locked_until),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Expiry of the session lock as of the last accept or renewal
    pub fn locked_until(&self) -> Timestamp {
        *self
            .locked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn entity_path(&self) -> &EntityPath {
        self.receiver.entity_path()
    }

    pub(crate) fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    fn context(&self) -> &ClientContext {
        self.receiver.context()
    }

    fn check(&self) -> Result<(), BusError> {
        if self.receiver.is_closed() {
            return Err(BusError::ClientClosed {
                entity: format!("{} (session {})", self.entity_path(), self.session_id),
            });
        }
        self.context()
            .authorize(AccessRight::Listen, self.entity_path().authorization_entity())
    }

    pub async fn receive_messages(
        &self,
        max_messages: usize,
        max_wait: Option<Duration>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.receiver.receive_messages(max_messages, max_wait).await
    }

    pub async fn peek_messages(
        &self,
        max_messages: usize,
        from_sequence_number: Option<i64>,
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.receiver
            .peek_messages(max_messages, from_sequence_number)
            .await
    }

    pub async fn receive_deferred_messages(
        &self,
        sequence_numbers: &[i64],
    ) -> Result<Vec<ReceivedMessage>, BusError> {
        self.receiver
            .receive_deferred_messages(sequence_numbers)
            .await
    }

    pub async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.receiver.complete_message(message).await
    }

    pub async fn abandon_message(
        &self,
        message: &ReceivedMessage,
        properties_to_modify: Option<HashMap<String, PropertyValue>>,
    ) -> Result<(), BusError> {
        self.receiver
            .abandon_message(message, properties_to_modify)
            .await
    }

    pub async fn defer_message(
        &self,
        message: &ReceivedMessage,
        properties_to_modify: Option<HashMap<String, PropertyValue>>,
    ) -> Result<(), BusError> {
        self.receiver
            .defer_message(message, properties_to_modify)
            .await
    }

    pub async fn dead_letter_message(
        &self,
        message: &ReceivedMessage,
        reason: impl Into<String>,
        description: Option<String>,
    ) -> Result<(), BusError> {
        self.receiver
            .dead_letter_message(message, reason, description)
            .await
    }

    /// Opaque state stored with the session
    pub async fn get_session_state(&self) -> Result<Option<Bytes>, BusError> {
        self.check()?;
        self.context()
            .namespace
            .session_state(self.entity_path(), &self.session_id, self.lock_token)
    }

    /// Replace the session state; `None` clears it
    pub async fn set_session_state(&self, state: Option<Bytes>) -> Result<(), BusError> {
        self.check()?;
        self.context().namespace.set_session_state(
            self.entity_path(),
            &self.session_id,
            self.lock_token,
            state,
        )
    }

    /// Extend the session lock (and the locks of its delivered messages)
    pub async fn renew_session_lock(&self) -> Result<Timestamp, BusError> {
        self.check()?;
        let locked_until = self.context().namespace.renew_session(
            self.entity_path(),
            &self.session_id,
            self.lock_token,
        )?;
        *self
            .locked_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = locked_until;
        Ok(locked_until)
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_closed()
    }

    fn release(&self) {
        if self.receiver.close_link() {
            self.context().namespace.release_session(
                self.entity_path(),
                &self.session_id,
                self.lock_token,
            );
            info!(entity = %self.entity_path(), session_id = %self.session_id, "Session released");
        }
    }

    /// Close the receiver and release the session lock
    pub async fn close(&self) {
        self.release();
    }
}

impl Drop for SessionReceiver {
    fn drop(&mut self) {
        self.release();
    }
}
