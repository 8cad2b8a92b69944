//! Client entry point shaped like the Service Bus SDK.
//!
//! A [`ServiceBusClient`] is built from a [`Namespace`] and a connection
//! string. It hands out senders, receivers, session receivers and processors
//! for named entities. Every operation re-checks the rights of the key the
//! client was built with, so deleting an authorization rule takes effect
//! immediately.

use crate::auth::{AccessRight, ConnectionProperties};
use crate::error::BusError;
use crate::message::{EntityName, ReceiverOptions, SessionId};
use crate::namespace::{EntityPath, Namespace};
use crate::processor::{
    MessageHandler, Processor, ProcessorOptions, SessionProcessor, SessionProcessorOptions,
};
use crate::receiver::Receiver;
use crate::sender::Sender;
use crate::sessions::SessionReceiver;
use chrono::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// How long `accept_next_session` waits when no wait time is given
pub const DEFAULT_ACCEPT_SESSION_WAIT_SECS: i64 = 60;

/// State shared by a client and everything it created
#[derive(Debug, Clone)]
pub(crate) struct ClientContext {
    pub(crate) namespace: Namespace,
    credentials: Arc<ConnectionProperties>,
    closed: Arc<AtomicBool>,
}

impl ClientContext {
    pub(crate) fn authorize(&self, right: AccessRight, entity: &EntityName) -> Result<(), BusError> {
        self.namespace
            .authorize(&self.credentials, right, Some(entity))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Fail with `ClientClosed` when either the link or its client was closed
pub(crate) fn ensure_open(
    context: &ClientContext,
    closed: &AtomicBool,
    entity: &impl std::fmt::Display,
) -> Result<(), BusError> {
    if context.is_closed() || closed.load(Ordering::Acquire) {
        return Err(BusError::ClientClosed {
            entity: entity.to_string(),
        });
    }
    Ok(())
}

/// Connection to a namespace
#[derive(Debug, Clone)]
pub struct ServiceBusClient {
    context: ClientContext,
}

impl ServiceBusClient {
    /// Connect to `namespace` with a connection string. The key must match
    /// some authorization rule of the namespace or of the string's entity.
    pub fn new(namespace: &Namespace, connection_string: &str) -> Result<Self, BusError> {
        let credentials: ConnectionProperties = connection_string.parse()?;
        if !namespace.authenticate(&credentials) {
            return Err(BusError::Unauthorized {
                key_name: credentials.shared_access_key_name.clone(),
                right: "Send, Listen or Manage".to_string(),
                entity: credentials.namespace.clone(),
            });
        }

        info!(
            namespace = %namespace.name(),
            key_name = %credentials.shared_access_key_name,
            "Client connected"
        );
        Ok(Self {
            context: ClientContext {
                namespace: namespace.clone(),
                credentials: Arc::new(credentials),
                closed: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// `<namespace>.servicebus.windows.net`
    pub fn fully_qualified_namespace(&self) -> String {
        format!("{}.servicebus.windows.net", self.context.namespace.name())
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::ClientClosed {
                entity: self.context.namespace.name().to_string(),
            });
        }
        Ok(())
    }

    /// Sender for a queue or topic
    pub fn create_sender(&self, entity: &str) -> Result<Sender, BusError> {
        self.ensure_open()?;
        Ok(Sender::new(self.context.clone(), EntityName::new(entity)?))
    }

    /// Receiver for a queue (or its dead-letter sub-queue)
    pub fn create_receiver(&self, queue: &str, options: ReceiverOptions) -> Result<Receiver, BusError> {
        self.ensure_open()?;
        let path = EntityPath::queue(EntityName::new(queue)?);
        Ok(Receiver::new(self.context.clone(), path, options, None))
    }

    /// Receiver for a topic subscription (or its dead-letter sub-queue)
    pub fn create_receiver_for_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: ReceiverOptions,
    ) -> Result<Receiver, BusError> {
        self.ensure_open()?;
        let path = EntityPath::subscription(EntityName::new(topic)?, EntityName::new(subscription)?);
        Ok(Receiver::new(self.context.clone(), path, options, None))
    }

    /// Lock a specific session of a queue
    pub async fn accept_session(
        &self,
        queue: &str,
        session_id: &str,
        options: ReceiverOptions,
    ) -> Result<SessionReceiver, BusError> {
        let path = EntityPath::queue(EntityName::new(queue)?);
        self.accept_session_at(path, SessionId::new(session_id)?, options)
    }

    /// Lock a specific session of a subscription
    pub async fn accept_session_for_subscription(
        &self,
        topic: &str,
        subscription: &str,
        session_id: &str,
        options: ReceiverOptions,
    ) -> Result<SessionReceiver, BusError> {
        let path = EntityPath::subscription(EntityName::new(topic)?, EntityName::new(subscription)?);
        self.accept_session_at(path, SessionId::new(session_id)?, options)
    }

    /// Lock the next session of a queue that has messages and no owner.
    /// Waits up to `max_wait` (default one minute) and fails with `Timeout`.
    pub async fn accept_next_session(
        &self,
        queue: &str,
        options: ReceiverOptions,
        max_wait: Option<Duration>,
    ) -> Result<SessionReceiver, BusError> {
        let path = EntityPath::queue(EntityName::new(queue)?);
        self.accept_next_session_at(path, options, max_wait).await
    }

    /// Lock the next available session of a subscription
    pub async fn accept_next_session_for_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: ReceiverOptions,
        max_wait: Option<Duration>,
    ) -> Result<SessionReceiver, BusError> {
        let path = EntityPath::subscription(EntityName::new(topic)?, EntityName::new(subscription)?);
        self.accept_next_session_at(path, options, max_wait).await
    }

    fn accept_session_at(
        &self,
        path: EntityPath,
        session_id: SessionId,
        options: ReceiverOptions,
    ) -> Result<SessionReceiver, BusError> {
        self.ensure_open()?;
        self.context
            .authorize(AccessRight::Listen, path.authorization_entity())?;
        let lease = self.context.namespace.accept_session(&path, &session_id)?;
        debug!(entity = %path, session_id = %lease.session_id, "Session accepted");
        Ok(SessionReceiver::new(self.context.clone(), path, options, lease))
    }

    pub(crate) async fn accept_next_session_at(
        &self,
        path: EntityPath,
        options: ReceiverOptions,
        max_wait: Option<Duration>,
    ) -> Result<SessionReceiver, BusError> {
        self.ensure_open()?;
        self.context
            .authorize(AccessRight::Listen, path.authorization_entity())?;

        let max_wait = max_wait.unwrap_or_else(|| Duration::seconds(DEFAULT_ACCEPT_SESSION_WAIT_SECS));
        let namespace = self.context.namespace.clone();
        let lease = namespace
            .wait_for(max_wait, || namespace.accept_next_session(&path))
            .await?
            .ok_or(BusError::Timeout { duration: max_wait })?;

        debug!(entity = %path, session_id = %lease.session_id, "Next session accepted");
        Ok(SessionReceiver::new(self.context.clone(), path, options, lease))
    }

    /// Message pump over a queue
    pub fn create_processor(
        &self,
        queue: &str,
        options: ProcessorOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Processor, BusError> {
        let receiver = self.create_receiver(queue, options.receiver_options())?;
        Ok(Processor::new(receiver, options, handler))
    }

    /// Message pump over a topic subscription
    pub fn create_processor_for_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: ProcessorOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Processor, BusError> {
        let receiver =
            self.create_receiver_for_subscription(topic, subscription, options.receiver_options())?;
        Ok(Processor::new(receiver, options, handler))
    }

    /// Message pump over the sessions of a queue
    pub fn create_session_processor(
        &self,
        queue: &str,
        options: SessionProcessorOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SessionProcessor, BusError> {
        self.ensure_open()?;
        let path = EntityPath::queue(EntityName::new(queue)?);
        Ok(SessionProcessor::new(self.clone(), path, options, handler))
    }

    /// Message pump over the sessions of a subscription
    pub fn create_session_processor_for_subscription(
        &self,
        topic: &str,
        subscription: &str,
        options: SessionProcessorOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SessionProcessor, BusError> {
        self.ensure_open()?;
        let path = EntityPath::subscription(EntityName::new(topic)?, EntityName::new(subscription)?);
        Ok(SessionProcessor::new(self.clone(), path, options, handler))
    }

    /// Close the client; every sender and receiver it created stops working
    pub fn close(&self) {
        if !self.context.closed.swap(true, Ordering::AcqRel) {
            info!(namespace = %self.context.namespace.name(), "Client closed");
        }
    }
}
