//! Common test utilities for localbus integration tests
//!
//! This module provides:
//! - A namespace fixture with root administration and client handles
//! - Helpers for sending and draining entities
//! - A handler that records processed messages

use async_trait::async_trait;
use chrono::Duration;
use localbus::{
    AdministrationClient, HandlerError, Message, MessageHandler, Namespace, ProcessErrorContext,
    ProcessMessageContext, ReceivedMessage, Receiver, ServiceBusClient,
};
use std::sync::{Arc, Mutex};

// ============================================================================
// Namespace fixture
// ============================================================================

/// A fresh namespace with clients holding the root key
#[allow(dead_code)]
pub struct TestBus {
    pub namespace: Namespace,
    pub admin: AdministrationClient,
    pub client: ServiceBusClient,
}

impl TestBus {
    #[allow(dead_code)]
    pub fn new() -> Self {
        let namespace = Namespace::for_testing("integration").expect("namespace");
        let admin = AdministrationClient::new(&namespace, &namespace.connection_string())
            .expect("admin client");
        let client =
            ServiceBusClient::new(&namespace, &namespace.connection_string()).expect("client");
        Self {
            namespace,
            admin,
            client,
        }
    }

    /// Client connected with another connection string
    #[allow(dead_code)]
    pub fn connect(&self, connection_string: &str) -> ServiceBusClient {
        ServiceBusClient::new(&self.namespace, connection_string).expect("client")
    }

    #[allow(dead_code)]
    pub async fn send(&self, entity: &str, messages: Vec<Message>) {
        self.client
            .create_sender(entity)
            .expect("sender")
            .send_messages(messages)
            .await
            .expect("send");
    }
}

// ============================================================================
// Receive helpers
// ============================================================================

/// Wait used when a receive is expected to come back empty
#[allow(dead_code)]
pub fn short_wait() -> Option<Duration> {
    Some(Duration::milliseconds(50))
}

/// Wait used when messages are expected
#[allow(dead_code)]
pub fn long_wait() -> Option<Duration> {
    Some(Duration::seconds(5))
}

/// Receive and complete everything currently available
#[allow(dead_code)]
pub async fn drain(receiver: &Receiver) -> Vec<ReceivedMessage> {
    let messages = receiver
        .receive_messages(100, short_wait())
        .await
        .expect("receive");
    for message in &messages {
        if message.lock_token.is_some() {
            receiver.complete_message(message).await.expect("complete");
        }
    }
    messages
}

#[allow(dead_code)]
pub fn bodies(messages: &[ReceivedMessage]) -> Vec<String> {
    messages
        .iter()
        .map(|m| String::from_utf8_lossy(m.body()).into_owned())
        .collect()
}

// ============================================================================
// Recording handler
// ============================================================================

/// Handler that records bodies in processing order and optionally fails
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    processed: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<String>>>,
    fail_bodies: Arc<Mutex<Vec<String>>>,
}

impl RecordingHandler {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail whenever a message with this body is processed
    #[allow(dead_code)]
    pub fn fail_on(&self, body: &str) {
        self.fail_bodies.lock().unwrap().push(body.to_string());
    }

    #[allow(dead_code)]
    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Poll until `count` messages were processed or five seconds pass
    #[allow(dead_code)]
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let processed = self.processed();
            if processed.len() >= count || tokio::time::Instant::now() >= deadline {
                return processed;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn process_message(&self, context: &ProcessMessageContext) -> Result<(), HandlerError> {
        let body = String::from_utf8_lossy(context.message().body()).into_owned();
        self.processed.lock().unwrap().push(body.clone());
        if self.fail_bodies.lock().unwrap().contains(&body) {
            return Err(format!("refusing {}", body).into());
        }
        Ok(())
    }

    async fn process_error(&self, context: ProcessErrorContext) {
        self.errors.lock().unwrap().push(context.source.to_string());
    }
}
