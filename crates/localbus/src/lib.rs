//! # localbus
//!
//! In-process test double for Azure Service Bus. A [`Namespace`] holds queues,
//! topics, subscriptions and authorization rules in memory and reproduces the
//! broker's delivery semantics so messaging code can be exercised offline.
//!
//! This library provides:
//! - Queues and topics with filtered subscriptions and rule actions
//! - Peek-lock and receive-and-delete delivery with lock renewal
//! - Sessions with exclusive locks and session state
//! - Dead-letter sub-queues, deferral, scheduling and duplicate detection
//! - Auto-forwarding between entities
//! - Shared access key authorization per namespace and entity
//! - Message pumps with bounded concurrency
//!
//! ## Module Organization
//!
//! - [`message`] - Identifiers, messages and receive options
//! - [`entity`] - Queue, topic, subscription and rule properties
//! - [`filter`] - SQL and correlation filters, rule actions
//! - [`namespace`] - The in-memory broker
//! - [`auth`] - Connection strings and authorization rules
//! - [`client`], [`sender`], [`receiver`], [`sessions`], [`processor`] - SDK-shaped clients
//! - [`admin`] - Entity management
//! - [`topology`] - Declarative namespace descriptions
//!
//! ## Example
//!
//! ```no_run
//! # async fn example() -> Result<(), localbus::BusError> {
//! use localbus::{AdministrationClient, Message, Namespace, QueueProperties, ReceiverOptions, ServiceBusClient};
//!
//! let namespace = Namespace::for_testing("contoso")?;
//! let admin = AdministrationClient::new(&namespace, &namespace.connection_string())?;
//! admin.create_queue("orders", QueueProperties::default()).await?;
//!
//! let client = ServiceBusClient::new(&namespace, &namespace.connection_string())?;
//! client.create_sender("orders")?.send_message(Message::new("hello")).await?;
//!
//! let receiver = client.create_receiver("orders", ReceiverOptions::default())?;
//! for message in receiver.receive_messages(1, None).await? {
//!     receiver.complete_message(&message).await?;
//! }
//! # Ok(())
//! # }
//! ```

// Module declarations
pub mod admin;
pub mod auth;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod filter;
pub mod message;
pub mod namespace;
pub mod processor;
pub mod receiver;
pub mod sender;
pub mod sessions;
pub mod topology;

mod store;

// Re-export commonly used types at crate root for convenience
pub use admin::AdministrationClient;
pub use auth::{AccessRight, AuthorizationRule, ConnectionProperties, ROOT_KEY_NAME};
pub use client::ServiceBusClient;
pub use config::NamespaceConfig;
pub use entity::{
    EntityRuntimeInfo, QueueProperties, RuleProperties, SubscriptionProperties, TopicProperties,
    TopicRuntimeInfo, DEFAULT_RULE_NAME,
};
pub use error::{BusError, ConfigurationError, FilterError, SerializationError, ValidationError};
pub use filter::{CorrelationFilter, Filter, RuleAction, SqlFilter};
pub use message::{
    EntityName, LockToken, Message, MessageId, MessageState, PropertyValue, ReceiveMode,
    ReceivedMessage, ReceiverOptions, SessionId, SubQueue, Timestamp,
    DEAD_LETTER_FILTER_EVALUATION, DEAD_LETTER_MAX_DELIVERY_COUNT, DEAD_LETTER_MAX_TRANSFER_HOPS,
    DEAD_LETTER_SESSION_ID_MISSING, DEAD_LETTER_TTL_EXPIRED,
};
pub use namespace::{EntityPath, Namespace};
pub use processor::{
    ErrorSource, HandlerError, MessageHandler, ProcessErrorContext, ProcessMessageContext,
    Processor, ProcessorOptions, SessionProcessor, SessionProcessorOptions,
};
pub use receiver::Receiver;
pub use sender::{MessageBatch, Sender};
pub use sessions::SessionReceiver;
pub use store::{DEAD_LETTER_DESCRIPTION_PROPERTY, DEAD_LETTER_REASON_PROPERTY};
pub use topology::{QueueDefinition, SubscriptionDefinition, TopicDefinition, Topology, TopologyFormat};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
